pub mod item;
pub mod run;
pub mod usage;

pub use item::ItemResult;
pub use run::{RunItemError, RunSnapshot, RunState, RunStatus};
pub use usage::{StageUsage, UsageTotals};
