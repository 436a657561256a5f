//! `Fleet` Core Library
//!
//! Shared functionality for `Fleet` components:
//! - Configuration resolution and hierarchy
//! - Advisory file locks with stale-lock override
//! - Atomic JSON state files
//! - Line-delimited JSON-RPC messages for tool servers
//! - Tolerant parsing of executor output
//! - Declarative process launch templates

pub mod config;
pub mod error;
pub mod lock;
pub mod parse;
pub mod persist;
pub mod rpc;
pub mod template;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use lock::{FileLock, LockError, LockOptions};
pub use parse::{ParseError, parse_structured};
pub use template::LaunchTemplate;
