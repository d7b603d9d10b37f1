//! x86-64 instruction encoding for the native backend.
//!
//! Only the forms the helper-call code generator needs. System V AMD64
//! calling convention.

use super::codebuf::{CodeBuffer, Label};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Condition codes for Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,
    Ne = 0x5,
}

pub struct Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// REX for a single register in the opcode or r/m field.
    fn rex_b(&mut self, w: bool, rm: Reg) {
        let rex = 0x40 | if w { 0x08 } else { 0 } | if rm.is_extended() { 0x01 } else { 0 };
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        let rex = 0x48 | if src.is_extended() { 0x04 } else { 0 } | if dst.is_extended() { 0x01 } else { 0 };
        self.buf.emit_u8(rex);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.rex_b(true, dst);
        self.buf.emit_u8(0xb8 + dst.code());
        self.buf.emit_u64(imm);
    }

    /// MOV r32, imm32 (zero-extends into the full register)
    pub fn mov_ri32(&mut self, dst: Reg, imm: u32) {
        self.rex_b(false, dst);
        self.buf.emit_u8(0xb8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// CMP r32, imm32
    pub fn cmp_ri32(&mut self, dst: Reg, imm: u32) {
        if dst == Reg::Rax {
            self.buf.emit_u8(0x3d);
        } else {
            self.rex_b(false, dst);
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        }
        self.buf.emit_u32(imm);
    }

    /// TEST r8, r8 on the low byte registers al..bl.
    pub fn test_r8(&mut self, a: Reg, b: Reg) {
        debug_assert!((a as u8) < 4 && (b as u8) < 4);
        self.buf.emit_u8(0x84);
        self.buf.emit_u8(Self::modrm(0b11, b.code(), a.code()));
    }

    pub fn push(&mut self, reg: Reg) {
        self.rex_b(false, reg);
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex_b(false, reg);
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.rex_b(false, reg);
        self.buf.emit_u8(0xff);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// JMP rel32 to `label`
    pub fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xe9);
        self.buf.emit_rel32(label);
    }

    /// Jcc rel32 to `label`
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_rel32(label);
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xc3);
    }
}
