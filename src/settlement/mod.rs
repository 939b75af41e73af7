pub mod scheduler;

pub use scheduler::{CycleReport, SettlementFrequency, SettlementScheduler};
