pub mod essay_flow;
pub mod essay_task;
pub mod retry;

pub use essay_flow::{EssayFlow, ItemProcessor};
pub use essay_task::{RunCtx, TaskItem};
pub use retry::{retry_with_backoff, RetryPolicy};
