//! Warden Core - Sandboxed remote execution over a pipe.
//!
//! A host drives a long-lived worker process through a narrow request/response
//! protocol on the worker's stdin/stdout, so functions can run in a chosen
//! environment without destabilizing the host. The same call surface can also
//! run functions directly in the host process.
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_core::{ContextAccess, Environment, SubprocessConfig, Value};
//!
//! #[tokio::main]
//! async fn main() -> warden_core::Result<()> {
//!     let env = Environment::subprocess(SubprocessConfig::from_env()?);
//!     let context = env.new_context();
//!
//!     let reply = context.echo(Value::Str("hello".into())).await?;
//!     println!("worker said {:?}", reply);
//!
//!     let module = context.load_module("/srv/modules/helpers.py".as_ref()).await?;
//!     let lines = module.call_method("line_count", vec![]).await?;
//!     println!("module has {:?} lines", lines);
//!
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod functions;
pub mod ipc;
pub mod registry;
pub mod value;

// Re-export commonly used types
pub use access::{AccessHandle, ContextAccess, ContextProxy, HostValue, InProcessContext};
pub use config::{SubprocessConfig, WorkerConfig};
pub use context::WorkerInfo;
pub use environment::Environment;
pub use error::{Result, WardenError};
pub use functions::Function;
pub use ipc::{Listener, SubprocessManager};
pub use registry::{HandleRegistry, NotFound};
pub use value::{ContextId, ErrorKind, HandleId, Kwargs, RemoteError, Value, WireValue};
