// 客户端上传引擎模块
//
// 组成：
// - 上传队列（状态机与进度）
// - 背包式批次选择（填满并发流预算）
// - TUS 会话客户端（创建、分块 PATCH、断点对齐）
// - 流调度器（批次屏障驱动循环、分片并行、取消）
// - 进度事件节流

pub mod queue;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod throttle;

pub use queue::{QueuedFile, QueuedFileStatus, UploadQueue};
pub use scheduler::{ProgressEvent, StreamScheduler};
pub use selection::select_batch;
pub use session::TusClient;
pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
