pub mod config;
pub mod error;
pub mod http;
pub mod launcher;
pub mod port_alloc;
pub mod process_table;
pub mod prober;
pub mod runtime;
pub mod supervisor;
pub mod workspace;

pub use config::SupervisorConfig;
pub use error::{ErrorPayload, LaunchError, SupervisorError};
pub use snakepit_worker::{AgentId, RuntimeKind, WorkerInfo, WorkerStatus};
pub use supervisor::Supervisor;
