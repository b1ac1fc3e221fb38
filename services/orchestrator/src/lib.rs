//! Task orchestration: request-side resource service, job queue, executor
//! and worker loop.

pub mod config;
pub mod error;
pub mod executor;
pub mod pg;
pub mod queue;
pub mod service;
pub mod worker_loop;

pub use config::AppConfig;
pub use error::{ExecutionError, ServiceError};
pub use executor::JobExecutor;
pub use pg::{PgQueue, PgStore};
pub use queue::{Delivery, InMemoryQueue, JobQueue, QueueError};
pub use service::ResourceService;
pub use worker_loop::{run_worker_loop, WorkerOptions};
