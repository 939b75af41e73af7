pub mod service;

pub use service::{FinalizedRecord, NewWorkRecord, WorkRecordService, WorkRecordView};
