//! 核心层：任务、计时、调度器、错误类型与优雅关闭

pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod task;
pub mod timings;

pub use error::{HiveError, TaskError};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use shutdown::{SchedulerCleanup, ShutdownCoordinator, ShutdownManager};
pub use task::{Task, TaskCallback, TaskId, TaskOptions, TaskReport, TaskStatus};
pub use timings::Timings;
