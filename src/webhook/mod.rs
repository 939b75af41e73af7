pub mod events;
pub mod reconciler;
pub mod signature;

pub use events::{EventKind, ProviderEvent};
pub use reconciler::{ReconcileOutcome, WebhookReconciler};
pub use signature::{SignatureVerifier, SIGNATURE_HEADER};
