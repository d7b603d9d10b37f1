//! Method translator: bytecode to a control-flow graph of helper calls.
//!
//! Blocks start at offset 0, at every branch and switch target, after every
//! conditional or unconditional branch and after `label`. Within a block,
//! local loads, `dup` and `pop` are tracked on a symbolic stack and only
//! materialized when an opcode needs the operand stack in memory.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{trace, warn};

use super::JitError;
use super::helpers::{Cond, Helper};
use crate::abc::{Args, Instruction, Opcode, instructions};

/// One helper call with its immediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub helper: Helper,
    pub a: u32,
    pub b: u32,
}

impl Step {
    fn new(helper: Helper, a: u32, b: u32) -> Self {
        Self { helper, a, b }
    }
}

/// Block exits. Targets are block start offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Jump(usize),
    Branch {
        cond: Cond,
        taken: usize,
        fallthrough: usize,
    },
    /// `cases[i]` for a selector `i` in range, else `default`.
    Switch { cases: Vec<usize>, default: usize },
    Return,
}

impl Terminator {
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Terminator::Jump(t) => vec![*t],
            Terminator::Branch { taken, fallthrough, .. } => vec![*taken, *fallthrough],
            Terminator::Switch { cases, default } => {
                let mut t = cases.clone();
                t.push(*default);
                t
            }
            Terminator::Return => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub offset: usize,
    pub steps: Vec<Step>,
    pub terminator: Option<Terminator>,
}

/// Translated method. The entry block is at offset 0.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    pub blocks: BTreeMap<usize, Block>,
}

impl Cfg {
    pub fn step_count(&self) -> usize {
        self.blocks.values().map(|b| b.steps.len()).sum()
    }

    /// Every block ends in a terminator whose targets are blocks.
    pub fn check(&self) -> Result<(), JitError> {
        for block in self.blocks.values() {
            let Some(term) = &block.terminator else {
                return Err(JitError::MissingTerminator(block.offset));
            };
            if let Some(to) = term.targets().into_iter().find(|t| !self.blocks.contains_key(t)) {
                return Err(JitError::UnknownBlock { from: block.offset, to });
            }
        }
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Translator {
    blocks: BTreeMap<usize, Block>,
    /// Block receiving steps; `None` after a terminator.
    cur: Option<usize>,
    /// Locals whose values sit, not yet loaded, above the operand stack.
    sym: Vec<u32>,
}

/// Block start offsets.
fn block_starts(insns: &[Instruction]) -> BTreeSet<usize> {
    let mut starts = BTreeSet::from([0]);
    for insn in insns {
        match insn.opcode {
            Some(Opcode::LookupSwitch) => starts.extend(insn.switch_targets()),
            Some(Opcode::Label) => {
                starts.insert(insn.next);
            }
            _ => {
                if let Some(target) = insn.branch_target() {
                    starts.insert(target);
                    starts.insert(insn.next);
                }
            }
        }
    }
    starts
}

pub fn translate(code: &[u8]) -> Cfg {
    let insns: Vec<Instruction> = instructions(code).collect();
    let starts = block_starts(&insns);
    let mut t = Translator {
        blocks: starts
            .iter()
            .map(|&offset| {
                (
                    offset,
                    Block {
                        offset,
                        steps: Vec::new(),
                        terminator: None,
                    },
                )
            })
            .collect(),
        cur: Some(0),
        sym: Vec::new(),
    };

    for insn in &insns {
        if insn.offset != 0 && starts.contains(&insn.offset) {
            if let Some(prev) = t.cur {
                t.flush();
                t.terminate(prev, Terminator::Jump(insn.offset));
            }
            t.cur = Some(insn.offset);
        }
        if t.cur.is_none() {
            trace!(offset = insn.offset, "skipping unreachable code");
            continue;
        }
        if let Flow::Stop = t.lower(insn) {
            break;
        }
    }
    if t.cur.is_some() {
        t.flush();
    }

    // Blocks never reached by the walk: code past an abandoned translation,
    // targets inside an instruction or outside the code, or a code stream
    // that runs off its end.
    for block in t.blocks.values_mut().filter(|b| b.terminator.is_none()) {
        let byte = code.get(block.offset).copied().unwrap_or(0);
        warn!(offset = block.offset, "block without terminator, inserting trap");
        block.steps.push(Step::new(Helper::Trap, byte as u32, 0));
        block.terminator = Some(Terminator::Return);
    }
    Cfg { blocks: t.blocks }
}

impl Translator {
    fn block(&mut self) -> &mut Block {
        let cur = self.cur.unwrap_or_default();
        self.blocks.entry(cur).or_insert_with(|| Block {
            offset: cur,
            steps: Vec::new(),
            terminator: None,
        })
    }

    fn emit(&mut self, helper: Helper, a: u32, b: u32) {
        self.block().steps.push(Step::new(helper, a, b));
    }

    /// Loads every symbolic entry onto the operand stack, bottom first.
    fn flush(&mut self) {
        for local in std::mem::take(&mut self.sym) {
            self.emit(Helper::GetLocal, local, 0);
        }
    }

    fn terminate(&mut self, offset: usize, term: Terminator) {
        if let Some(block) = self.blocks.get_mut(&offset) {
            block.terminator = Some(term);
        }
        self.cur = None;
        self.sym.clear();
    }

    fn end_block(&mut self, term: Terminator) {
        if let Some(cur) = self.cur {
            self.terminate(cur, term);
        }
    }

    fn get_local(&mut self, local: u32) {
        self.sym.push(local);
    }

    fn set_local(&mut self, local: u32) {
        match self.sym.pop() {
            Some(src) if src == local => {}
            Some(src) => {
                // Pending reads of the old value must happen first.
                if self.sym.contains(&local) {
                    self.flush();
                }
                self.emit(Helper::CopyLocal, src, local);
            }
            None => self.emit(Helper::SetLocal, local, 0),
        }
    }

    fn lower(&mut self, insn: &Instruction) -> Flow {
        let Some(op) = insn.opcode else {
            return self.unsupported(insn);
        };
        let (a, b) = match insn.args {
            Args::One(a) => (a, 0),
            Args::Two(a, b) => (a, b),
            _ => (0, 0),
        };

        // Symbolic data movement.
        match op {
            Opcode::GetLocal => return self.symbolic(|t| t.get_local(a)),
            Opcode::GetLocal0 => return self.symbolic(|t| t.get_local(0)),
            Opcode::GetLocal1 => return self.symbolic(|t| t.get_local(1)),
            Opcode::GetLocal2 => return self.symbolic(|t| t.get_local(2)),
            Opcode::GetLocal3 => return self.symbolic(|t| t.get_local(3)),
            Opcode::SetLocal => return self.symbolic(|t| t.set_local(a)),
            Opcode::SetLocal0 => return self.symbolic(|t| t.set_local(0)),
            Opcode::SetLocal1 => return self.symbolic(|t| t.set_local(1)),
            Opcode::SetLocal2 => return self.symbolic(|t| t.set_local(2)),
            Opcode::SetLocal3 => return self.symbolic(|t| t.set_local(3)),
            Opcode::Dup => {
                return self.symbolic(|t| match t.sym.last().copied() {
                    Some(top) => t.sym.push(top),
                    None => t.emit(Helper::Dup, 0, 0),
                });
            }
            Opcode::Pop => {
                return self.symbolic(|t| {
                    if t.sym.pop().is_none() {
                        t.emit(Helper::Pop, 0, 0);
                    }
                });
            }
            Opcode::ReturnValue => {
                match self.sym.pop() {
                    Some(local) => self.emit(Helper::ReturnLocal, local, 0),
                    None => self.emit(Helper::ReturnValue, 0, 0),
                }
                self.end_block(Terminator::Return);
                return Flow::Continue;
            }
            Opcode::ReturnVoid => {
                self.end_block(Terminator::Return);
                return Flow::Continue;
            }
            Opcode::Nop | Opcode::Label | Opcode::Debug | Opcode::DebugLine | Opcode::DebugFile => {
                return Flow::Continue;
            }
            _ => {}
        }

        self.flush();

        if let Some(term) = branch(op, insn) {
            self.end_block(term);
            return Flow::Continue;
        }

        let byte = insn.byte as u32;
        let (helper, a, b) = match op {
            Opcode::Kill => (Helper::Kill, a, 0),
            Opcode::Swap => (Helper::Swap, 0, 0),
            Opcode::PushNull => (Helper::PushNull, 0, 0),
            Opcode::PushUndefined => (Helper::PushUndefined, 0, 0),
            Opcode::PushTrue => (Helper::PushTrue, 0, 0),
            Opcode::PushFalse => (Helper::PushFalse, 0, 0),
            Opcode::PushNaN => (Helper::PushNaN, 0, 0),
            Opcode::PushByte => (Helper::PushByte, a, 0),
            Opcode::PushShort => (Helper::PushShort, a, 0),
            Opcode::PushString => (Helper::PushString, a, 0),
            Opcode::PushInt => (Helper::PushInt, a, 0),
            Opcode::PushUint => (Helper::PushUint, a, 0),
            Opcode::PushDouble => (Helper::PushDouble, a, 0),
            Opcode::PushScope => (Helper::PushScope, 0, 0),
            Opcode::PopScope => (Helper::PopScope, 0, 0),
            Opcode::GetGlobalScope => (Helper::GetGlobalScope, 0, 0),
            Opcode::GetScopeObject => (Helper::GetScopeObject, a, 0),
            Opcode::Add => (Helper::Add, 0, 0),
            Opcode::Subtract => (Helper::Subtract, 0, 0),
            Opcode::Multiply => (Helper::Multiply, 0, 0),
            Opcode::Divide => (Helper::Divide, 0, 0),
            Opcode::IncLocalI => (Helper::IncLocalI, a, 0),
            Opcode::LessThan => (Helper::LessThan, 0, 0),
            Opcode::GreaterThan => (Helper::GreaterThan, 0, 0),
            Opcode::Increment
            | Opcode::Decrement
            | Opcode::IncrementI
            | Opcode::DecrementI
            | Opcode::Not
            | Opcode::ConvertS
            | Opcode::ConvertI
            | Opcode::ConvertU
            | Opcode::ConvertD
            | Opcode::ConvertB
            | Opcode::ConvertO
            | Opcode::Coerce
            | Opcode::CoerceA
            | Opcode::CoerceS => (Helper::UnaryStub, byte, 0),
            Opcode::Equals | Opcode::StrictEquals | Opcode::IsTypeLate | Opcode::AsTypeLate => {
                (Helper::BinaryStub, byte, 0)
            }
            Opcode::Throw => (Helper::Throw, 0, 0),
            Opcode::NewCatch => (Helper::NewCatch, a, 0),
            Opcode::NextValue => (Helper::NextValue, 0, 0),
            Opcode::ConstructSuper => (Helper::ConstructSuper, a, 0),
            Opcode::SetSuper => (Helper::SetSuper, a, 0),
            Opcode::GetProperty => (Helper::GetProperty, a, 0),
            Opcode::SetProperty => (Helper::SetProperty, a, 0),
            Opcode::InitProperty => (Helper::InitProperty, a, 0),
            Opcode::DeleteProperty => (Helper::DeleteProperty, a, 0),
            Opcode::GetSlot => (Helper::GetSlot, a, 0),
            Opcode::SetSlot => (Helper::SetSlot, a, 0),
            Opcode::FindProperty => (Helper::FindProperty, a, 0),
            Opcode::FindPropStrict => (Helper::FindPropStrict, a, 0),
            Opcode::GetLex => (Helper::GetLex, a, 0),
            Opcode::CallProperty | Opcode::CallPropLex => (Helper::CallProperty, a, b),
            Opcode::CallPropVoid => (Helper::CallPropVoid, a, b),
            Opcode::CallSuper => (Helper::CallSuper, a, b),
            Opcode::CallSuperVoid => (Helper::CallSuperVoid, a, b),
            Opcode::Call => (Helper::Call, a, 0),
            Opcode::Construct => (Helper::Construct, a, 0),
            Opcode::ConstructProp => (Helper::ConstructProp, a, b),
            Opcode::NewFunction => (Helper::NewFunction, a, 0),
            Opcode::NewObject => (Helper::NewObject, a, 0),
            Opcode::NewArray => (Helper::NewArray, a, 0),
            Opcode::NewActivation => (Helper::NewActivation, 0, 0),
            Opcode::NewClass => (Helper::NewClass, a, 0),
            Opcode::HasNext2 => (Helper::HasNext2, a, b),
            Opcode::NextName => (Helper::NextName, 0, 0),
            _ => return self.unsupported(insn),
        };
        self.emit(helper, a, b);
        Flow::Continue
    }

    fn symbolic(&mut self, f: impl FnOnce(&mut Self)) -> Flow {
        f(self);
        Flow::Continue
    }

    /// Traps at run time and abandons the rest of the method.
    fn unsupported(&mut self, insn: &Instruction) -> Flow {
        let name = insn.opcode.map_or("unknown", Opcode::name);
        warn!(offset = insn.offset, opcode = name, byte = insn.byte, "unsupported opcode, stopping translation");
        self.emit(Helper::Trap, insn.byte as u32, 0);
        self.end_block(Terminator::Return);
        Flow::Stop
    }
}

fn branch(op: Opcode, insn: &Instruction) -> Option<Terminator> {
    if op == Opcode::LookupSwitch {
        let mut targets = insn.switch_targets();
        let default = targets.remove(0);
        return Some(Terminator::Switch { cases: targets, default });
    }
    let taken = insn.branch_target()?;
    let cond = match op {
        Opcode::Jump => return Some(Terminator::Jump(taken)),
        Opcode::IfTrue => Cond::True,
        Opcode::IfFalse => Cond::False,
        Opcode::IfEq => Cond::Eq,
        Opcode::IfNe => Cond::Ne,
        Opcode::IfStrictEq => Cond::StrictEq,
        Opcode::IfStrictNe => Cond::StrictNe,
        Opcode::IfLt => Cond::Lt,
        Opcode::IfLe => Cond::Le,
        Opcode::IfGt => Cond::Gt,
        Opcode::IfGe => Cond::Ge,
        Opcode::IfNlt => Cond::Nlt,
        Opcode::IfNle => Cond::Nle,
        Opcode::IfNgt => Cond::Ngt,
        Opcode::IfNge => Cond::Nge,
        _ => return None,
    };
    Some(Terminator::Branch {
        cond,
        taken,
        fallthrough: insn.next,
    })
}
