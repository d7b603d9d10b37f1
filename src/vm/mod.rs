pub mod builtins;
pub mod events;
mod frame;
pub mod ops;
pub mod traits;
pub mod value;
#[allow(clippy::module_inception)]
mod vm;

use std::io;

use thiserror::Error;

use crate::abc::ParseError;
use crate::config::ConfigError;

pub use events::{Event, EventQueue, Host, NullHost, Placement, VmHandle};
pub use frame::Frame;
pub use value::{ObjRef, Object, Value};
pub use vm::{BUILTIN_CLASS, Vm};

/// Errors surfaced to the embedder. Faults inside running bytecode are
/// logged and degraded instead.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("program has no scripts")]
    NoScripts,
    #[error("VM worker is gone")]
    WorkerGone,
    #[error("VM worker panicked")]
    WorkerPanicked,
    #[error("failed to spawn VM worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}
