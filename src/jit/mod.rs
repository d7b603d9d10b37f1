//! Method compilation.
//!
//! A method body is translated once into a graph of helper calls
//! ([`translate`]) and then lowered by one of two backends:
//! - the closure-threaded backend, available everywhere
//! - the native x86-64 backend, behind the `jit` feature on unix
//!
//! [`JitMode`] picks between them.

pub mod helpers;
pub mod threaded;
pub mod translate;

#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
pub mod codebuf;
#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
pub mod memory;
#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
pub mod native;
#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
pub mod x86_64;

use thiserror::Error;
use tracing::warn;

use crate::abc::MethodBody;
use crate::config::JitMode;
use crate::vm::Frame;
use threaded::ThreadedCode;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("block at offset {0} has no terminator")]
    MissingTerminator(usize),
    #[error("block at offset {from} exits to unknown block {to}")]
    UnknownBlock { from: usize, to: usize },
    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    #[error(transparent)]
    Memory(#[from] memory::MemoryError),
    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    #[error(transparent)]
    Label(#[from] codebuf::UnboundLabel),
}

pub type Result<T> = std::result::Result<T, JitError>;

/// Whether this build can emit native code.
pub const NATIVE_AVAILABLE: bool = cfg!(all(feature = "jit", target_arch = "x86_64", unix));

enum Backend {
    Threaded(ThreadedCode),
    #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
    Native(native::NativeCode),
}

/// A compiled method, ready to run against a frame.
pub struct CompiledMethod {
    backend: Backend,
    blocks: usize,
    steps: usize,
}

impl CompiledMethod {
    pub fn run(&self, frame: &mut Frame<'_>) {
        match &self.backend {
            Backend::Threaded(code) => code.run(frame),
            #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
            Backend::Native(code) => code.run(frame),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Threaded(_) => "threaded",
            #[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
            Backend::Native(_) => "native",
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks
    }

    pub fn step_count(&self) -> usize {
        self.steps
    }
}

/// Translates and lowers one method body.
pub fn compile(body: &MethodBody, method: u32, mode: JitMode) -> Result<CompiledMethod> {
    let cfg = translate::translate(&body.code);
    cfg.check()?;
    let native = match mode {
        JitMode::Off => false,
        JitMode::Auto => NATIVE_AVAILABLE,
        JitMode::On => {
            if !NATIVE_AVAILABLE {
                warn!(method, "native code unavailable in this build, using threaded code");
            }
            NATIVE_AVAILABLE
        }
    };
    let backend = if native { build_native(&cfg)? } else { Backend::Threaded(ThreadedCode::build(&cfg)?) };
    Ok(CompiledMethod {
        backend,
        blocks: cfg.blocks.len(),
        steps: cfg.step_count(),
    })
}

#[cfg(all(feature = "jit", target_arch = "x86_64", unix))]
fn build_native(cfg: &translate::Cfg) -> Result<Backend> {
    Ok(Backend::Native(native::NativeCode::build(cfg)?))
}

#[cfg(not(all(feature = "jit", target_arch = "x86_64", unix)))]
fn build_native(cfg: &translate::Cfg) -> Result<Backend> {
    Ok(Backend::Threaded(ThreadedCode::build(cfg)?))
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::abc::Opcode;
    use crate::abc::writer::{CodeBuilder, ProgramBuilder};
    use crate::config::RuntimeConfig;
    use crate::vm::{Object, Vm};

    const MODES: [JitMode; 2] = [JitMode::Off, JitMode::Auto];

    fn body(code: Vec<u8>, local_count: u32) -> MethodBody {
        MethodBody {
            max_stack: 4,
            local_count,
            code,
            ..Default::default()
        }
    }

    fn run(code: &CompiledMethod, vm: &Vm, args: &[crate::vm::ObjRef]) -> Option<crate::vm::ObjRef> {
        let mut frame = Frame::new(vm, 0, 4, 4, Object::undefined(), args);
        code.run(&mut frame);
        frame.result.take()
    }

    fn vm() -> Vm {
        Vm::with_output(ProgramBuilder::new().finish(), RuntimeConfig::default(), Box::new(io::sink()))
    }

    #[test]
    fn test_backend_selection() {
        let mut c = CodeBuilder::new();
        c.op(Opcode::ReturnVoid);
        let b = body(c.finish(), 1);
        let off = compile(&b, 0, JitMode::Off).unwrap();
        assert_eq!(off.backend_name(), "threaded");
        let auto = compile(&b, 0, JitMode::Auto).unwrap();
        let expected = if NATIVE_AVAILABLE { "native" } else { "threaded" };
        assert_eq!(auto.backend_name(), expected);
        assert_eq!(auto.block_count(), 1);
        assert_eq!(auto.step_count(), 0);
    }

    #[test]
    fn test_returns_argument() {
        let mut c = CodeBuilder::new();
        c.get_local(1).op(Opcode::ReturnValue);
        let b = body(c.finish(), 2);
        let vm = vm();
        for mode in MODES {
            let code = compile(&b, 0, mode).unwrap();
            let r = run(&code, &vm, &[Object::integer(9)]).unwrap();
            assert_eq!(r.as_integer(), Some(9), "{:?}", mode);
        }
    }

    #[test]
    fn test_counting_loop() {
        // local1 = 0; while (local1 < 5) local1++; return local1
        let mut c = CodeBuilder::new();
        let top = c.new_label();
        let done = c.new_label();
        c.push_byte(0).set_local(1);
        c.bind(top).get_local(1).push_byte(5).branch(Opcode::IfNlt, done);
        c.op_u30(Opcode::IncLocalI, 1).branch(Opcode::Jump, top);
        c.bind(done).get_local(1).op(Opcode::ReturnValue);
        let b = body(c.finish(), 2);
        let vm = vm();
        for mode in MODES {
            let code = compile(&b, 0, mode).unwrap();
            let r = run(&code, &vm, &[]).unwrap();
            assert_eq!(r.as_integer(), Some(5), "{:?}", mode);
        }
    }

    #[test]
    fn test_lookup_switch_dispatch() {
        // return [10, 20][arg] or 99 for anything else
        let mut c = CodeBuilder::new();
        let a = c.new_label();
        let b = c.new_label();
        let d = c.new_label();
        c.get_local(1).lookup_switch(d, &[a, b]);
        c.bind(a).push_byte(10).op(Opcode::ReturnValue);
        c.bind(b).push_byte(20).op(Opcode::ReturnValue);
        c.bind(d).push_byte(99).op(Opcode::ReturnValue);
        let body = body(c.finish(), 2);
        let vm = vm();
        for mode in MODES {
            let code = compile(&body, 0, mode).unwrap();
            for (arg, expected) in [(0, 10), (1, 20), (2, 99), (-1, 99)] {
                let r = run(&code, &vm, &[Object::integer(arg)]).unwrap();
                assert_eq!(r.as_integer(), Some(expected), "{:?} {}", mode, arg);
            }
        }
    }

    #[test]
    #[should_panic(expected = "not implemented opcode")]
    fn test_trap_panics_in_threaded_code() {
        let mut c = CodeBuilder::new();
        c.op(Opcode::TypeOf).op(Opcode::ReturnValue);
        let code = compile(&body(c.finish(), 1), 0, JitMode::Off).unwrap();
        run(&code, &vm(), &[]);
    }
}
