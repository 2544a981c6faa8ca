//! Pipe IPC between a host and its worker process.
//!
//! The worker's stdin and stdout carry length-prefixed MessagePack frames;
//! its stderr is a free-form diagnostic stream.
//!
//! # Architecture
//!
//! - **Listener**: Runs in the worker, owns execution contexts, dispatches requests
//! - **Subprocess**: Runs in the host, owns the worker process and the request cycle
//! - **Protocol**: Shared framing and request/response types used by both

pub mod listener;
pub mod protocol;
pub mod subprocess;

pub use listener::Listener;
pub use protocol::{Request, RequestKind, Response};
pub use subprocess::SubprocessManager;
