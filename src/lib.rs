//! abcvm - a virtual machine for ABC (ActionScript Byte Code) programs.
//!
//! [`abc`] parses the container format, [`jit`] compiles method bodies and
//! [`vm`] runs them on a dedicated worker thread behind [`vm::VmHandle`].

pub mod abc;
pub mod config;
pub mod jit;
pub mod vm;

pub use config::{JitMode, RuntimeConfig};
pub use vm::{Vm, VmError, VmHandle};
