//! 基础设施层（Infrastructure Layer）
//!
//! 与业务无关的底层能力：配置加解密、配置存储、进度事件通道。
//! 本层不依赖 services / workflow / orchestrator 中的任何类型。

pub mod config_store;
pub mod crypto;
pub mod progress;

pub use config_store::{ConfigStore, SENSITIVE_KEYS};
pub use crypto::ConfigCipher;
pub use progress::{progress_channel, ProgressEvent, ProgressReceiver, ProgressSender};
