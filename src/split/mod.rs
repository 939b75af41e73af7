pub mod calculator;

pub use calculator::{calculate_split, SplitBreakdown, SplitInput};
