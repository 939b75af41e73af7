pub mod memory;
pub mod models;
pub mod repository;
pub mod service;
pub mod store;

pub use memory::InMemoryLedgerStore;
pub use repository::LedgerRepository;
pub use service::{SettlementLedger, Transition, SYSTEM_ACTOR};
pub use store::LedgerStore;
