pub mod lanes;
pub mod orchestrator;
pub mod retry;

pub use lanes::PayeeLanes;
pub use orchestrator::{batch_key_for, ABANDONED_REASON, PayoutOrchestrator, SettlementOutcome};
pub use retry::RetryPolicy;
