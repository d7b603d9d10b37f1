//! Native x86-64 backend.
//!
//! Generated code keeps the frame pointer in `rbx` and calls one helper
//! trampoline per step:
//!
//! ```text
//! entry:  push rbx              ; also realigns rsp to 16
//!         mov  rbx, rdi
//! step:   mov  rdi, rbx
//!         mov  esi, a
//!         mov  edx, b
//!         mov  rax, helper
//!         call rax
//! branch: mov  rdi, rbx / mov rax, cond / call rax
//!         test al, al
//!         jne  taken
//!         jmp  fallthrough
//! return: pop  rbx
//!         ret
//! ```

use std::collections::HashMap;
use std::ffi::c_void;

use super::JitError;
use super::codebuf::{CodeBuffer, Label};
use super::helpers::lookup_switch_address;
use super::memory::ExecutableMemory;
use super::translate::{Cfg, Step, Terminator};
use super::x86_64::{Assembler, Cond, Reg};
use crate::vm::Frame;

type Entry = unsafe extern "C" fn(*mut c_void);

/// Register holding the frame pointer across helper calls.
const FRAME: Reg = Reg::Rbx;

pub struct NativeCode {
    memory: ExecutableMemory,
    code_len: usize,
}

impl NativeCode {
    pub fn build(cfg: &Cfg) -> Result<Self, JitError> {
        let code = emit(cfg)?;
        let memory = ExecutableMemory::from_code(&code)?;
        Ok(Self {
            memory,
            code_len: code.len(),
        })
    }

    pub fn run(&self, frame: &mut Frame<'_>) {
        // SAFETY: the region holds code emitted by `emit` for this ABI and
        // stays mapped for the lifetime of self.
        let entry: Entry = unsafe { std::mem::transmute::<*const u8, Entry>(self.memory.as_ptr()) };
        let frame: *mut Frame<'_> = frame;
        // SAFETY: the frame outlives the call and is only reached through
        // the trampolines while native code runs.
        unsafe { entry(frame.cast::<c_void>()) }
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

/// Emits machine code for `cfg`, entry block first.
pub fn emit(cfg: &Cfg) -> Result<Vec<u8>, JitError> {
    let mut buf = CodeBuffer::new();
    let labels: HashMap<usize, Label> = cfg.blocks.keys().map(|&o| (o, buf.new_label())).collect();
    let label = |from: usize, to: usize| labels.get(&to).copied().ok_or(JitError::UnknownBlock { from, to });

    {
        let mut asm = Assembler::new(&mut buf);
        asm.push(FRAME);
        asm.mov_rr(FRAME, Reg::Rdi);
    }

    for block in cfg.blocks.values() {
        buf.bind(label(block.offset, block.offset)?);
        let mut asm = Assembler::new(&mut buf);
        for step in &block.steps {
            call_step(&mut asm, step);
        }
        match &block.terminator {
            None => return Err(JitError::MissingTerminator(block.offset)),
            Some(Terminator::Return) => {
                asm.pop(FRAME);
                asm.ret();
            }
            Some(Terminator::Jump(t)) => asm.jmp(label(block.offset, *t)?),
            Some(Terminator::Branch { cond, taken, fallthrough }) => {
                asm.mov_rr(Reg::Rdi, FRAME);
                asm.mov_ri64(Reg::Rax, cond.address());
                asm.call_r(Reg::Rax);
                asm.test_r8(Reg::Rax, Reg::Rax);
                asm.jcc(Cond::Ne, label(block.offset, *taken)?);
                asm.jmp(label(block.offset, *fallthrough)?);
            }
            Some(Terminator::Switch { cases, default }) => {
                asm.mov_rr(Reg::Rdi, FRAME);
                asm.mov_ri32(Reg::Rsi, cases.len().saturating_sub(1) as u32);
                asm.mov_ri64(Reg::Rax, lookup_switch_address());
                asm.call_r(Reg::Rax);
                for (i, t) in cases.iter().enumerate() {
                    asm.cmp_ri32(Reg::Rax, i as u32);
                    asm.jcc(Cond::E, label(block.offset, *t)?);
                }
                asm.jmp(label(block.offset, *default)?);
            }
        }
    }
    Ok(buf.finish()?)
}

fn call_step(asm: &mut Assembler<'_>, step: &Step) {
    asm.mov_rr(Reg::Rdi, FRAME);
    asm.mov_ri32(Reg::Rsi, step.a);
    asm.mov_ri32(Reg::Rdx, step.b);
    asm.mov_ri64(Reg::Rax, step.helper.address());
    asm.call_r(Reg::Rax);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::Opcode;
    use crate::abc::writer::CodeBuilder;
    use crate::jit::helpers::Helper;
    use crate::jit::translate::translate;

    #[test]
    fn test_return_void_is_prologue_and_epilogue() {
        let mut c = CodeBuilder::new();
        c.op(Opcode::ReturnVoid);
        let code = emit(&translate(&c.finish())).unwrap();
        // push rbx; mov rbx, rdi; pop rbx; ret
        assert_eq!(code, [0x53, 0x48, 0x89, 0xfb, 0x5b, 0xc3]);
    }

    #[test]
    fn test_step_call_sequence() {
        let mut c = CodeBuilder::new();
        c.push_byte(7).op(Opcode::ReturnVoid);
        let code = emit(&translate(&c.finish())).unwrap();
        let mut expected = vec![0x53, 0x48, 0x89, 0xfb];
        expected.extend([0x48, 0x89, 0xdf]);
        expected.extend([0xbe, 7, 0, 0, 0]);
        expected.extend([0xba, 0, 0, 0, 0]);
        expected.extend([0x48, 0xb8]);
        expected.extend(Helper::PushByte.address().to_le_bytes());
        expected.extend([0xff, 0xd0]);
        expected.extend([0x5b, 0xc3]);
        assert_eq!(code, expected);
    }

    #[test]
    fn test_branch_sequence_ends_in_jumps() {
        let mut c = CodeBuilder::new();
        let other = c.new_label();
        c.op(Opcode::PushTrue).branch(Opcode::IfTrue, other).op(Opcode::ReturnVoid);
        c.bind(other).op(Opcode::ReturnVoid);
        let cfg = translate(&c.finish());
        let code = emit(&cfg).unwrap();
        // Entry block: prologue, pushtrue call (25 bytes), cond call
        // (15 bytes), test, jne, jmp.
        let tail = &code[4 + 25 + 15..4 + 25 + 15 + 2 + 6 + 5];
        assert_eq!(&tail[..2], &[0x84, 0xc0]);
        assert_eq!(&tail[2..4], &[0x0f, 0x85]);
        assert_eq!(tail[8], 0xe9);
        // Two return blocks follow.
        assert_eq!(&code[code.len() - 4..], &[0x5b, 0xc3, 0x5b, 0xc3]);
    }
}
