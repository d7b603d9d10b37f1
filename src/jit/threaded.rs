//! Portable backend: each block becomes a list of boxed closures over the
//! helper table, dispatched in a loop.

use std::collections::HashMap;

use super::JitError;
use super::helpers::{CondFn, LOOKUP_SWITCH};
use super::translate::{Cfg, Terminator};
use crate::vm::Frame;

type Op = Box<dyn Fn(&mut Frame<'_>)>;

enum Exit {
    Jump(usize),
    Branch {
        cond: CondFn,
        taken: usize,
        fallthrough: usize,
    },
    Switch {
        cases: Vec<usize>,
        default: usize,
    },
    Return,
}

struct ThreadedBlock {
    ops: Vec<Op>,
    exit: Exit,
}

pub struct ThreadedCode {
    /// Entry block first.
    blocks: Vec<ThreadedBlock>,
}

impl ThreadedCode {
    pub fn build(cfg: &Cfg) -> Result<Self, JitError> {
        let index: HashMap<usize, usize> = cfg.blocks.keys().enumerate().map(|(i, &o)| (o, i)).collect();
        let resolve = |from: usize, to: usize| index.get(&to).copied().ok_or(JitError::UnknownBlock { from, to });

        let mut blocks = Vec::with_capacity(cfg.blocks.len());
        for block in cfg.blocks.values() {
            let ops = block
                .steps
                .iter()
                .map(|step| {
                    let f = step.helper.action();
                    let (a, b) = (step.a, step.b);
                    Box::new(move |frame: &mut Frame<'_>| f(frame, a, b)) as Op
                })
                .collect();
            let exit = match &block.terminator {
                None => return Err(JitError::MissingTerminator(block.offset)),
                Some(Terminator::Return) => Exit::Return,
                Some(Terminator::Jump(t)) => Exit::Jump(resolve(block.offset, *t)?),
                Some(Terminator::Branch { cond, taken, fallthrough }) => Exit::Branch {
                    cond: cond.test(),
                    taken: resolve(block.offset, *taken)?,
                    fallthrough: resolve(block.offset, *fallthrough)?,
                },
                Some(Terminator::Switch { cases, default }) => Exit::Switch {
                    cases: cases
                        .iter()
                        .map(|&t| resolve(block.offset, t))
                        .collect::<Result<_, _>>()?,
                    default: resolve(block.offset, *default)?,
                },
            };
            blocks.push(ThreadedBlock { ops, exit });
        }
        Ok(Self { blocks })
    }

    pub fn run(&self, frame: &mut Frame<'_>) {
        let mut pc = 0;
        while let Some(block) = self.blocks.get(pc) {
            for op in &block.ops {
                op(frame);
            }
            pc = match &block.exit {
                Exit::Return => return,
                Exit::Jump(t) => *t,
                Exit::Branch { cond, taken, fallthrough } => {
                    if cond(frame) {
                        *taken
                    } else {
                        *fallthrough
                    }
                }
                Exit::Switch { cases, default } => {
                    let case_count = cases.len().saturating_sub(1) as u32;
                    let i = LOOKUP_SWITCH(frame, case_count) as usize;
                    cases.get(i).copied().unwrap_or(*default)
                }
            };
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
