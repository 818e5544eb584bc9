pub mod config;
pub mod conflict;
pub mod error;
pub mod item;
pub mod naming;
pub mod orchestrator;
pub mod paths;
pub mod pool;
pub mod registry;
pub mod transfer;

pub use config::TransferConfig;
pub use error::TransferError;
pub use orchestrator::{ArchiveReport, BatchReport, TaskOutcome, TransferOrchestrator, UploadPlan};
pub use registry::{ProgressEvent, RegistryEvent, Task, TaskId, TaskKind, TaskRegistry, TaskStatus};
