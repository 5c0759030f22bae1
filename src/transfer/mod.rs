// 传输模块入口
pub mod download;
pub mod engine;
pub mod progress;
pub mod task;
pub mod upload;

pub use engine::{Endpoints, TransferEngine, TransferHandle, TransferLink};
pub use progress::ProgressTracker;
pub use task::{TaskId, TransferDirection, TransferEvent, TransferStatus, TransferTask};
