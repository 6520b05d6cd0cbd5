pub mod adapter;
pub mod audit;
pub mod config;
pub mod config_validator;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod job;
pub mod key_generator;
pub mod middleware;
pub mod quota_config;
pub mod rate_limiter;
pub mod retry;
pub mod router;
pub mod server;
pub mod store;
pub mod token_bucket;
pub mod tool;
pub mod validation;
pub mod worker;

pub use config::{Config, DispatchConfig};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use router::{CallStatus, CommandRouter, JobHandle};
pub use server::create_app;
pub use tool::{ToolCall, ToolRequest};
