//! Per-invocation state of a compiled method.

use tracing::warn;

use super::value::{ObjRef, Object};
use super::vm::Vm;

/// Upper bound on the locals of one frame, whatever the body declares.
pub const MAX_LOCALS: usize = 1 << 16;

/// Operand stack, locals and scope stack of one method call. Owned by the
/// executing call and never shared.
pub struct Frame<'vm> {
    pub vm: &'vm Vm,
    pub method: u32,
    stack: Vec<ObjRef>,
    stack_limit: usize,
    /// Grows on first write, up to `local_limit`.
    locals: Vec<ObjRef>,
    local_limit: usize,
    pub scope_stack: Vec<ObjRef>,
    /// Set by `returnvalue`.
    pub result: Option<ObjRef>,
}

impl<'vm> Frame<'vm> {
    /// `locals[0]` is the receiver, followed by the arguments. Locals past
    /// the arguments read as undefined until written.
    pub fn new(
        vm: &'vm Vm,
        method: u32,
        max_stack: u32,
        local_count: u32,
        this: ObjRef,
        args: &[ObjRef],
    ) -> Self {
        let slack = vm.config().stack_slack.max(1);
        let stack_limit = (max_stack as usize).max(1) * slack;
        let local_limit = (local_count as usize).min(MAX_LOCALS).max(args.len() + 1);
        let mut locals = Vec::with_capacity(args.len() + 1);
        locals.push(this);
        locals.extend(args.iter().cloned());
        Self {
            vm,
            method,
            stack: Vec::with_capacity(stack_limit.min(1024)),
            stack_limit,
            locals,
            local_limit,
            scope_stack: Vec::new(),
            result: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Donates a reference to the stack.
    pub fn push(&mut self, value: ObjRef) {
        if self.stack.len() >= self.stack_limit {
            panic!(
                "operand stack overflow in method {} (limit {})",
                self.method, self.stack_limit
            );
        }
        self.stack.push(value);
    }

    /// Transfers the top reference to the caller.
    pub fn pop(&mut self) -> ObjRef {
        match self.stack.pop() {
            Some(v) => v,
            None => panic!("pop from empty operand stack in method {}", self.method),
        }
    }

    /// Borrows the top of stack.
    pub fn peek(&self) -> &ObjRef {
        match self.stack.last() {
            Some(v) => v,
            None => panic!("peek at empty operand stack in method {}", self.method),
        }
    }

    /// Pops `n` values and returns them in push order.
    pub fn pop_n(&mut self, n: usize) -> Vec<ObjRef> {
        let mut values: Vec<ObjRef> = (0..n).map(|_| self.pop()).collect();
        values.reverse();
        values
    }

    pub fn this(&self) -> ObjRef {
        self.locals[0].clone()
    }

    pub fn local(&self, index: u32) -> ObjRef {
        match self.locals.get(index as usize) {
            Some(v) => v.clone(),
            None => Object::undefined(),
        }
    }

    /// Stores an owned reference, releasing the previous occupant. A write
    /// past the declared local count is dropped.
    pub fn set_local(&mut self, index: u32, value: ObjRef) {
        let index = index as usize;
        if index >= self.local_limit {
            warn!(method = self.method, index, limit = self.local_limit, "not implemented: local index out of range");
            return;
        }
        if index >= self.locals.len() {
            self.locals.resize_with(index + 1, Object::undefined);
        }
        self.locals[index] = value;
    }

    /// Declared local count, bounded by [`MAX_LOCALS`].
    pub fn local_count(&self) -> usize {
        self.local_limit
    }

    /// Snapshot of the operand stack, bottom first.
    pub fn stack(&self) -> &[ObjRef] {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::abc::writer::ProgramBuilder;
    use crate::config::RuntimeConfig;

    fn vm() -> Vm {
        Vm::with_output(ProgramBuilder::new().finish(), RuntimeConfig::default(), Box::new(io::sink()))
    }

    #[test]
    fn test_locals_grow_on_write() {
        let vm = vm();
        let mut frame = Frame::new(&vm, 0, 2, 4, Object::null(), &[Object::integer(1)]);
        assert_eq!(frame.local_count(), 4);
        assert!(frame.local(3).is_undefined());
        frame.set_local(3, Object::integer(5));
        assert_eq!(frame.local(3).as_integer(), Some(5));
        assert_eq!(frame.local(1).as_integer(), Some(1));
    }

    #[test]
    fn test_out_of_range_local_is_ignored() {
        let vm = vm();
        let mut frame = Frame::new(&vm, 0, 2, 2, Object::null(), &[]);
        frame.set_local(0x3fff_ffff, Object::integer(1));
        frame.set_local(2, Object::integer(1));
        assert!(frame.local(0x3fff_ffff).is_undefined());
        assert!(frame.local(2).is_undefined());
        assert_eq!(frame.local_count(), 2);
    }

    #[test]
    fn test_declared_local_count_is_capped() {
        let vm = vm();
        let frame = Frame::new(&vm, 0, 2, u32::MAX, Object::null(), &[]);
        assert_eq!(frame.local_count(), MAX_LOCALS);
    }
}
