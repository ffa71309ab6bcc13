pub mod app;

pub use app::config::EngineConfig;
pub use app::coordinator::ExecutionCoordinator;
pub use app::error::AppError;
pub use app::models::{ExecutionEvent, ExecutionStatus, Script, ScriptExecution, ScriptKind};
