//! Opcode runtime library.
//!
//! Every compiled step calls one of these with the active frame and up to
//! two immediates. Actions share the [`ActionFn`] shape; conditional
//! branches evaluate through a [`CondFn`] and `lookupswitch` through a
//! [`SwitchFn`]. Operations the VM only partially supports log a
//! "not implemented" warning and substitute a placeholder so execution can
//! continue.

use tracing::{error, trace, warn};

use crate::abc::Opcode;
use crate::vm::frame::Frame;
use crate::vm::traits;
use crate::vm::value::{self, Callable, ObjRef, Object, Value};

pub type ActionFn = fn(&mut Frame<'_>, u32, u32);
pub type CondFn = fn(&mut Frame<'_>) -> bool;
/// Returns the taken case index, or any value past the last case for the
/// default target.
pub type SwitchFn = fn(&mut Frame<'_>, u32) -> u32;

/// Property consulted when calling a value that is not itself a function.
pub const CALL_PROPERTY: &str = "call";

fn name_of(frame: &mut Frame<'_>, index: u32) -> String {
    let vm = frame.vm;
    vm.multiname_string(index, Some(frame))
}

/// Own property or accessor named `name`.
fn owns(obj: &Object, name: &str) -> bool {
    obj.has_property(name) || obj.getter(name).is_some()
}

// ==================== Stack and locals ====================

pub fn get_local(frame: &mut Frame<'_>, index: u32, _: u32) {
    trace!(opcode = "getlocal", index);
    let v = frame.local(index);
    frame.push(v);
}

pub fn set_local(frame: &mut Frame<'_>, index: u32, _: u32) {
    trace!(opcode = "setlocal", index);
    let v = frame.pop();
    frame.set_local(index, v);
}

/// `getlocal src; setlocal dst` with the value never reaching the stack.
pub fn copy_local(frame: &mut Frame<'_>, src: u32, dst: u32) {
    trace!(opcode = "setlocal", src, dst);
    let v = frame.local(src);
    frame.set_local(dst, v);
}

pub fn kill(frame: &mut Frame<'_>, index: u32, _: u32) {
    trace!(opcode = "kill", index);
    frame.set_local(index, Object::undefined());
}

pub fn pop(frame: &mut Frame<'_>, _: u32, _: u32) {
    trace!(opcode = "pop");
    frame.pop();
}

pub fn dup(frame: &mut Frame<'_>, _: u32, _: u32) {
    trace!(opcode = "dup");
    let v = frame.peek().clone();
    frame.push(v);
}

pub fn swap(frame: &mut Frame<'_>, _: u32, _: u32) {
    trace!(opcode = "swap");
    let top = frame.pop();
    let below = frame.pop();
    frame.push(top);
    frame.push(below);
}

pub fn push_null(frame: &mut Frame<'_>, _: u32, _: u32) {
    frame.push(Object::null());
}

pub fn push_undefined(frame: &mut Frame<'_>, _: u32, _: u32) {
    frame.push(Object::undefined());
}

pub fn push_true(frame: &mut Frame<'_>, _: u32, _: u32) {
    frame.push(Object::boolean(true));
}

pub fn push_false(frame: &mut Frame<'_>, _: u32, _: u32) {
    frame.push(Object::boolean(false));
}

pub fn push_nan(frame: &mut Frame<'_>, _: u32, _: u32) {
    frame.push(Object::number(f64::NAN));
}

/// The immediate byte is sign-extended.
pub fn push_byte(frame: &mut Frame<'_>, byte: u32, _: u32) {
    trace!(opcode = "pushbyte", byte);
    frame.push(Object::integer(byte as u8 as i8 as i32));
}

pub fn push_short(frame: &mut Frame<'_>, value: u32, _: u32) {
    trace!(opcode = "pushshort", value);
    frame.push(Object::integer(value as u16 as i16 as i32));
}

pub fn push_string(frame: &mut Frame<'_>, index: u32, _: u32) {
    let s = frame.vm.abc().string(index);
    trace!(opcode = "pushstring", s);
    frame.push(Object::string(s));
}

pub fn push_int(frame: &mut Frame<'_>, index: u32, _: u32) {
    let value = frame.vm.abc().constant_pool.integer(index).unwrap_or_else(|| {
        warn!(index, "integer pool index out of range");
        0
    });
    trace!(opcode = "pushint", index, value);
    frame.push(Object::integer(value));
}

pub fn push_uint(frame: &mut Frame<'_>, index: u32, _: u32) {
    let value = frame.vm.abc().constant_pool.uinteger(index).unwrap_or_else(|| {
        warn!(index, "uint pool index out of range");
        0
    });
    trace!(opcode = "pushuint", index, value);
    frame.push(match i32::try_from(value) {
        Ok(i) => Object::integer(i),
        Err(_) => Object::number(value as f64),
    });
}

pub fn push_double(frame: &mut Frame<'_>, index: u32, _: u32) {
    let value = frame.vm.abc().constant_pool.double(index).unwrap_or_else(|| {
        warn!(index, "double pool index out of range");
        f64::NAN
    });
    trace!(opcode = "pushdouble", index, value);
    frame.push(Object::number(value));
}

// ==================== Scope stack ====================

pub fn push_scope(frame: &mut Frame<'_>, _: u32, _: u32) {
    let scope = frame.pop();
    trace!(opcode = "pushscope", scope = ?scope);
    frame.scope_stack.push(scope);
}

pub fn pop_scope(frame: &mut Frame<'_>, _: u32, _: u32) {
    trace!(opcode = "popscope");
    if frame.scope_stack.pop().is_none() {
        warn!("popscope on an empty scope stack");
    }
}

pub fn get_global_scope(frame: &mut Frame<'_>, _: u32, _: u32) {
    trace!(opcode = "getglobalscope");
    let scope = match frame.scope_stack.first() {
        Some(s) => s.clone(),
        None => frame.vm.global().clone(),
    };
    frame.push(scope);
}

pub fn get_scope_object(frame: &mut Frame<'_>, index: u32, _: u32) {
    trace!(opcode = "getscopeobject", index);
    let scope = match frame.scope_stack.get(index as usize) {
        Some(s) => s.clone(),
        None => {
            warn!(index, depth = frame.scope_stack.len(), "scope index out of range");
            Object::undefined()
        }
    };
    frame.push(scope);
}

// ==================== Arithmetic ====================

pub fn add(frame: &mut Frame<'_>, _: u32, _: u32) {
    let right = frame.pop();
    let left = frame.pop();
    trace!(opcode = "add", ?left, ?right);
    let result = match value::add(&left, &right) {
        Ok(v) => v,
        Err(e) => {
            warn!("not implemented: {}", e);
            Object::undefined()
        }
    };
    frame.push(result);
}

pub fn subtract(frame: &mut Frame<'_>, _: u32, _: u32) {
    let right = frame.pop();
    let left = frame.pop();
    trace!(opcode = "subtract", ?left, ?right);
    frame.push(value::subtract(&left, &right));
}

pub fn multiply(frame: &mut Frame<'_>, _: u32, _: u32) {
    let right = frame.pop();
    let left = frame.pop();
    trace!(opcode = "multiply", ?left, ?right);
    frame.push(value::multiply(&left, &right));
}

pub fn divide(frame: &mut Frame<'_>, _: u32, _: u32) {
    let right = frame.pop();
    let left = frame.pop();
    trace!(opcode = "divide", ?left, ?right);
    frame.push(value::divide(&left, &right));
}

pub fn inc_local_i(frame: &mut Frame<'_>, index: u32, _: u32) {
    trace!(opcode = "inclocal_i", index);
    let local = frame.local(index);
    match local.as_integer() {
        Some(i) => frame.set_local(index, Object::integer(i.wrapping_add(1))),
        None => warn!(type_name = local.type_name(), "not implemented: cannot increment type"),
    }
}

// ==================== Comparison ====================

/// `left < right`, or `None` when undefined (a NaN operand, or types
/// that do not compare).
fn less(left: &Object, right: &Object) -> Option<bool> {
    let r = left.is_less(right);
    let comparable = |o: &Object| !matches!(o.value(), Value::Function(_) | Value::Definable(_));
    if r.is_none() && !(comparable(left) && comparable(right)) {
        warn!(
            left = left.type_name(),
            right = right.type_name(),
            "not implemented: comparison between types"
        );
    }
    r
}

fn pop_pair(frame: &mut Frame<'_>) -> (ObjRef, ObjRef) {
    let right = frame.pop();
    let left = frame.pop();
    (left, right)
}

pub fn less_than(frame: &mut Frame<'_>, _: u32, _: u32) {
    let (left, right) = pop_pair(frame);
    trace!(opcode = "lessthan", ?left, ?right);
    frame.push(Object::boolean(less(&left, &right) == Some(true)));
}

pub fn greater_than(frame: &mut Frame<'_>, _: u32, _: u32) {
    let (left, right) = pop_pair(frame);
    trace!(opcode = "greaterthan", ?left, ?right);
    frame.push(Object::boolean(less(&right, &left) == Some(true)));
}

pub fn if_true(frame: &mut Frame<'_>) -> bool {
    frame.pop().to_boolean()
}

pub fn if_false(frame: &mut Frame<'_>) -> bool {
    !frame.pop().to_boolean()
}

pub fn if_eq(frame: &mut Frame<'_>) -> bool {
    let (left, right) = pop_pair(frame);
    left.is_equal(&right)
}

pub fn if_ne(frame: &mut Frame<'_>) -> bool {
    !if_eq(frame)
}

pub fn if_strict_eq(frame: &mut Frame<'_>) -> bool {
    let (left, right) = pop_pair(frame);
    left.is_strict_equal(&right)
}

pub fn if_strict_ne(frame: &mut Frame<'_>) -> bool {
    !if_strict_eq(frame)
}

pub fn if_lt(frame: &mut Frame<'_>) -> bool {
    let (left, right) = pop_pair(frame);
    less(&left, &right) == Some(true)
}

pub fn if_le(frame: &mut Frame<'_>) -> bool {
    let (left, right) = pop_pair(frame);
    less(&right, &left) == Some(false)
}

pub fn if_gt(frame: &mut Frame<'_>) -> bool {
    let (left, right) = pop_pair(frame);
    less(&right, &left) == Some(true)
}

pub fn if_ge(frame: &mut Frame<'_>) -> bool {
    let (left, right) = pop_pair(frame);
    less(&left, &right) == Some(false)
}

pub fn if_nlt(frame: &mut Frame<'_>) -> bool {
    !if_lt(frame)
}

pub fn if_nle(frame: &mut Frame<'_>) -> bool {
    !if_le(frame)
}

pub fn if_ngt(frame: &mut Frame<'_>) -> bool {
    !if_gt(frame)
}

pub fn if_nge(frame: &mut Frame<'_>) -> bool {
    !if_ge(frame)
}

pub fn lookup_switch(frame: &mut Frame<'_>, case_count: u32) -> u32 {
    let index = frame.pop().to_int();
    trace!(opcode = "lookupswitch", index, case_count);
    match u32::try_from(index) {
        Ok(i) if i <= case_count => i,
        _ => case_count + 1,
    }
}

// ==================== Partially implemented ====================

/// Unary opcodes that leave the operand in place.
pub fn unary_stub(_: &mut Frame<'_>, byte: u32, _: u32) {
    let name = Opcode::from_byte(byte as u8).map_or("?", Opcode::name);
    warn!(opcode = name, "not implemented");
}

/// Binary opcodes that consume both operands and yield undefined.
pub fn binary_stub(frame: &mut Frame<'_>, byte: u32, _: u32) {
    let name = Opcode::from_byte(byte as u8).map_or("?", Opcode::name);
    warn!(opcode = name, "not implemented");
    frame.pop();
    frame.pop();
    frame.push(Object::undefined());
}

pub fn throw(frame: &mut Frame<'_>, _: u32, _: u32) {
    let value = frame.pop();
    warn!(value = %value, "not implemented: throw");
}

pub fn new_catch(frame: &mut Frame<'_>, index: u32, _: u32) {
    warn!(index, "not implemented: newcatch");
    frame.push(Object::object());
}

pub fn next_value(frame: &mut Frame<'_>, _: u32, _: u32) {
    warn!("not implemented: nextvalue");
    frame.pop();
    frame.pop();
    frame.push(Object::undefined());
}

pub fn construct_super(frame: &mut Frame<'_>, argc: u32, _: u32) {
    warn!(argc, "not implemented: constructsuper");
    frame.pop_n(argc as usize);
    frame.pop();
}

pub fn set_super(frame: &mut Frame<'_>, index: u32, _: u32) {
    let value = frame.pop();
    let name = name_of(frame, index);
    warn!(%name, "not implemented: setsuper, assigning on the receiver");
    let obj = frame.pop();
    obj.set_property(&name, value);
}

/// Executing an opcode the translator could not encode.
pub fn trap(frame: &mut Frame<'_>, byte: u32, _: u32) {
    error!(method = frame.method, "not implemented opcode 0x{:02x}", byte);
    panic!("not implemented opcode 0x{:02x} in method {}", byte, frame.method);
}

// ==================== Properties ====================

pub fn get_property(frame: &mut Frame<'_>, index: u32, _: u32) {
    let name = name_of(frame, index);
    trace!(opcode = "getproperty", %name);
    let obj = frame.pop();
    let vm = frame.vm;

    if let Some(getter) = obj.getter(&name) {
        trace!(%name, "calling the getter");
        let v = vm.call_function(&getter, &obj, &[]);
        frame.push(v);
        return;
    }

    let v = match obj.get_property(&name) {
        Some(v) => vm.resolve_deferred(&obj, &name, v),
        None => {
            warn!(%name, "not implemented: property not found");
            Object::undefined()
        }
    };
    frame.push(v);
}

pub fn set_property(frame: &mut Frame<'_>, index: u32, _: u32) {
    let value = frame.pop();
    let name = name_of(frame, index);
    trace!(opcode = "setproperty", %name);
    let obj = frame.pop();

    match obj.setter(&name) {
        Some(setter) => {
            trace!(%name, "calling the setter");
            frame.vm.call_function(&setter, &obj, &[value]);
        }
        None => obj.set_property(&name, value),
    }
}

pub fn init_property(frame: &mut Frame<'_>, index: u32, _: u32) {
    let value = frame.pop();
    let name = name_of(frame, index);
    trace!(opcode = "initproperty", %name);
    let obj = frame.pop();
    obj.set_property(&name, value);
}

pub fn delete_property(frame: &mut Frame<'_>, index: u32, _: u32) {
    let name = name_of(frame, index);
    trace!(opcode = "deleteproperty", %name);
    let obj = frame.pop();
    frame.push(Object::boolean(obj.remove_property(&name)));
}

pub fn get_slot(frame: &mut Frame<'_>, slot: u32, _: u32) {
    trace!(opcode = "getslot", slot);
    let obj = frame.pop();
    let v = obj.get_slot(slot).unwrap_or_else(|| {
        warn!(slot, "slot not set");
        Object::undefined()
    });
    frame.push(v);
}

pub fn set_slot(frame: &mut Frame<'_>, slot: u32, _: u32) {
    trace!(opcode = "setslot", slot);
    let value = frame.pop();
    let obj = frame.pop();
    obj.set_slot(slot, value);
}

// ==================== Scope resolution ====================

/// Innermost scope owning `name`.
fn find_scope(frame: &Frame<'_>, name: &str) -> Option<ObjRef> {
    frame.scope_stack.iter().rev().find(|s| owns(s, name)).cloned()
}

pub fn find_property(frame: &mut Frame<'_>, index: u32, _: u32) {
    let name = name_of(frame, index);
    trace!(opcode = "findproperty", %name);
    let scope = find_scope(frame, &name).unwrap_or_else(|| {
        trace!(%name, "not found, pushing global");
        frame.vm.global().clone()
    });
    frame.push(scope);
}

pub fn find_prop_strict(frame: &mut Frame<'_>, index: u32, _: u32) {
    let name = name_of(frame, index);
    trace!(opcode = "findpropstrict", %name);
    let scope = match find_scope(frame, &name) {
        Some(s) => s,
        None => {
            let global = frame.vm.global();
            if owns(global, &name) {
                global.clone()
            } else {
                trace!(%name, "not found, pushing undefined");
                Object::undefined()
            }
        }
    };
    frame.push(scope);
}

/// Finds and reads `name`. Functions found on the scope stack capture the
/// current receiver; placeholders are defined before being pushed.
pub fn get_lex(frame: &mut Frame<'_>, index: u32, _: u32) {
    let name = name_of(frame, index);
    trace!(opcode = "getlex", %name);
    let vm = frame.vm;

    if let Some(scope) = find_scope(frame, &name) {
        let v = scope.get_property(&name).unwrap_or_else(Object::undefined);
        if let Some(f) = v.as_function() {
            trace!(%name, "attaching this to function");
            *f.closure_this.borrow_mut() = Some(frame.this());
        }
        let v = vm.resolve_deferred(&scope, &name, v);
        frame.push(v);
        return;
    }

    let global = vm.global();
    let v = match global.get_property(&name) {
        Some(v) => vm.resolve_deferred(global, &name, v),
        None => {
            trace!(%name, "not found, pushing undefined");
            Object::undefined()
        }
    };
    frame.push(v);
}

// ==================== Invocation ====================

/// Pops `argc` arguments, the (possibly runtime) name and the receiver,
/// then calls the named property.
fn call_named(frame: &mut Frame<'_>, index: u32, argc: u32, opcode: &str) -> ObjRef {
    let args = frame.pop_n(argc as usize);
    let name = name_of(frame, index);
    trace!(opcode, %name, argc);
    let obj = frame.pop();
    let vm = frame.vm;

    let Some(callee) = obj.get_property(&name) else {
        warn!(%name, "not implemented: calling an undefined function");
        return Object::undefined();
    };
    if callee.as_function().is_some() {
        return vm.call_function(&callee, &obj, &args);
    }
    if callee.is_undefined() {
        warn!(%name, "not implemented: got an undefined function");
        return Object::undefined();
    }
    if callee.as_definable().is_some() {
        warn!(%name, "not implemented: got a function not yet valid");
        return Object::undefined();
    }
    match callee.get_property(CALL_PROPERTY) {
        Some(call) => vm.call_function(&call, &callee, &args),
        None => {
            warn!(%name, type_name = callee.type_name(), "not implemented: value is not callable");
            Object::undefined()
        }
    }
}

pub fn call_property(frame: &mut Frame<'_>, index: u32, argc: u32) {
    let result = call_named(frame, index, argc, "callproperty");
    frame.push(result);
}

pub fn call_prop_void(frame: &mut Frame<'_>, index: u32, argc: u32) {
    call_named(frame, index, argc, "callpropvoid");
}

/// Calls `name` as found on the receiver's prototype.
fn call_super_named(frame: &mut Frame<'_>, index: u32, argc: u32) -> ObjRef {
    let args = frame.pop_n(argc as usize);
    let name = name_of(frame, index);
    trace!(opcode = "callsuper", %name, argc);
    let receiver = frame.pop();
    let method = receiver
        .prototype()
        .and_then(|p| p.get_property(&name))
        .filter(|m| m.as_function().is_some());
    match method {
        Some(m) => frame.vm.call_function(&m, &receiver, &args),
        None => {
            warn!(%name, "not implemented: callsuper target not found");
            Object::undefined()
        }
    }
}

pub fn call_super(frame: &mut Frame<'_>, index: u32, argc: u32) {
    let result = call_super_named(frame, index, argc);
    frame.push(result);
}

pub fn call_super_void(frame: &mut Frame<'_>, index: u32, argc: u32) {
    call_super_named(frame, index, argc);
}

pub fn call(frame: &mut Frame<'_>, argc: u32, _: u32) {
    let args = frame.pop_n(argc as usize);
    let receiver = frame.pop();
    let func = frame.pop();
    trace!(opcode = "call", argc);
    let result = frame.vm.call_function(&func, &receiver, &args);
    frame.push(result);
}

pub fn construct(frame: &mut Frame<'_>, argc: u32, _: u32) {
    let args = frame.pop_n(argc as usize);
    let ctor = frame.pop();
    trace!(opcode = "construct", argc);
    let instance = if ctor.as_function().is_some() {
        let instance = Object::object();
        frame.vm.call_function(&ctor, &instance, &args);
        instance
    } else {
        warn!(type_name = ctor.type_name(), "not implemented: construct on a non-function");
        ctor.clone_object()
    };
    frame.push(instance);
}

pub fn construct_prop(frame: &mut Frame<'_>, index: u32, argc: u32) {
    let args = frame.pop_n(argc as usize);
    let name = name_of(frame, index);
    trace!(opcode = "constructprop", %name, argc);
    let obj = frame.pop();
    let vm = frame.vm;

    let Some(class) = obj.get_property(&name) else {
        warn!(%name, "could not resolve property");
        frame.push(Object::undefined());
        return;
    };
    vm.resolve_deferred(&obj, &name, class);
    let instance = traits::build_named_class(vm, &name, Object::object(), &args);
    frame.push(instance);
}

pub fn new_function(frame: &mut Frame<'_>, method: u32, _: u32) {
    trace!(opcode = "newfunction", method);
    frame.push(Object::function(Callable::Method(method)));
}

// ==================== Construction ====================

pub fn new_object(frame: &mut Frame<'_>, count: u32, _: u32) {
    trace!(opcode = "newobject", count);
    let obj = Object::object();
    for _ in 0..count {
        let value = frame.pop();
        let name = frame.pop();
        obj.set_property(&name.to_string(), value);
    }
    frame.push(obj);
}

pub fn new_array(frame: &mut Frame<'_>, count: u32, _: u32) {
    trace!(opcode = "newarray", count);
    let items = frame.pop_n(count as usize);
    frame.push(Object::array(items));
}

pub fn new_activation(frame: &mut Frame<'_>, _: u32, _: u32) {
    trace!(opcode = "newactivation");
    let vm = frame.vm;
    let activation = Object::object();
    if let Some(body) = vm.abc().body(frame.method) {
        traits::build_traits(vm, &activation, &body.traits, None);
    }
    frame.push(activation);
}

pub fn new_class(frame: &mut Frame<'_>, class: u32, _: u32) {
    trace!(opcode = "newclass", class);
    let base = frame.pop();
    let built = traits::new_class(frame.vm, &base, class);
    frame.push(built);
}

// ==================== Iteration ====================

pub fn has_next2(frame: &mut Frame<'_>, obj_reg: u32, index_reg: u32) {
    trace!(opcode = "hasnext2", obj_reg, index_reg);
    let obj = frame.local(obj_reg);
    let current = frame.local(index_reg).to_int();
    if current >= 0 && (current as usize) < obj.property_count() {
        frame.set_local(index_reg, Object::integer(current + 1));
        frame.push(Object::boolean(true));
    } else {
        frame.set_local(obj_reg, Object::null());
        frame.set_local(index_reg, Object::integer(0));
        frame.push(Object::boolean(false));
    }
}

pub fn next_name(frame: &mut Frame<'_>, _: u32, _: u32) {
    let index = frame.pop();
    let obj = frame.pop();
    trace!(opcode = "nextname", ?index);
    let position = index.to_int() as usize;
    let name = match position.checked_sub(1).and_then(|i| obj.property_names().into_iter().nth(i)) {
        Some(n) => Object::string(n),
        None => {
            warn!(position, "nextname index out of range");
            Object::undefined()
        }
    };
    frame.push(name);
}

// ==================== Returns ====================

pub fn return_value(frame: &mut Frame<'_>, _: u32, _: u32) {
    let v = frame.pop();
    trace!(opcode = "returnvalue", ?v);
    frame.result = Some(v);
}

pub fn return_local(frame: &mut Frame<'_>, index: u32, _: u32) {
    let v = frame.local(index);
    trace!(opcode = "returnvalue", index, ?v);
    frame.result = Some(v);
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::rc::Rc;

    use super::*;
    use crate::abc::writer::ProgramBuilder;
    use crate::config::RuntimeConfig;
    use crate::vm::Vm;

    fn with_frame(b: ProgramBuilder, f: impl FnOnce(&mut Frame<'_>)) {
        let vm = Vm::with_output(b.finish(), RuntimeConfig::default(), Box::new(io::sink()));
        let this = vm.global().clone();
        let mut frame = Frame::new(&vm, 0, 8, 4, this, &[]);
        f(&mut frame);
    }

    #[test]
    fn test_nan_comparisons_are_undefined() {
        type Branch = fn(&mut Frame<'_>) -> bool;
        let cases: [(Branch, bool); 8] = [
            (if_lt, false),
            (if_le, false),
            (if_gt, false),
            (if_ge, false),
            (if_nlt, true),
            (if_nle, true),
            (if_ngt, true),
            (if_nge, true),
        ];
        with_frame(ProgramBuilder::new(), |f| {
            for (i, (branch, expected)) in cases.iter().enumerate() {
                push_nan(f, 0, 0);
                push_byte(f, 1, 0);
                assert_eq!(branch(f), *expected, "case {}", i);
                push_byte(f, 1, 0);
                push_nan(f, 0, 0);
                assert_eq!(branch(f), *expected, "swapped case {}", i);
            }
            push_nan(f, 0, 0);
            push_byte(f, 1, 0);
            less_than(f, 0, 0);
            assert!(!f.pop().to_boolean());
            assert_eq!(f.depth(), 0);
        });
    }

    #[test]
    fn test_huge_local_index_degrades() {
        with_frame(ProgramBuilder::new(), |f| {
            push_byte(f, 1, 0);
            set_local(f, 0x3fff_ffff, 0);
            kill(f, 0x3fff_ffff, 0);
            inc_local_i(f, 0x3fff_ffff, 0);
            copy_local(f, 0, 0x3fff_ffff);
            assert_eq!(f.depth(), 0);
            assert!(f.local(0x3fff_ffff).is_undefined());
        });
    }

    #[test]
    fn test_add_scenarios() {
        with_frame(ProgramBuilder::new(), |f| {
            push_byte(f, 3, 0);
            push_byte(f, 4, 0);
            add(f, 0, 0);
            assert_eq!(f.pop().to_number(), 7.0);
        });
        let mut b = ProgramBuilder::new();
        let ab = b.string("ab");
        let cd = b.string("cd");
        with_frame(b, |f| {
            push_string(f, ab, 0);
            push_string(f, cd, 0);
            add(f, 0, 0);
            assert_eq!(f.pop().as_str(), Some("abcd"));
            assert_eq!(f.depth(), 0);
        });
    }

    #[test]
    fn test_unsupported_add_pushes_undefined() {
        let mut b = ProgramBuilder::new();
        let s = b.string("x");
        with_frame(b, |f| {
            push_string(f, s, 0);
            push_byte(f, 1, 0);
            add(f, 0, 0);
            assert!(f.pop().is_undefined());
        });
    }

    #[test]
    fn test_push_byte_sign_extends() {
        with_frame(ProgramBuilder::new(), |f| {
            push_byte(f, 0xff, 0);
            push_short(f, 0xfffe, 0);
            assert_eq!(f.pop().as_integer(), Some(-2));
            assert_eq!(f.pop().as_integer(), Some(-1));
        });
    }

    #[test]
    fn test_find_prop_strict_fallbacks() {
        let mut b = ProgramBuilder::new();
        let math = b.qname("", "Math");
        let missing = b.qname("", "nowhere");
        with_frame(b, |f| {
            f.scope_stack.push(Object::object());
            find_prop_strict(f, math, 0);
            assert!(Rc::ptr_eq(&f.pop(), f.vm.global()));
            find_prop_strict(f, missing, 0);
            assert!(f.pop().is_undefined());
            find_property(f, missing, 0);
            assert!(Rc::ptr_eq(&f.pop(), f.vm.global()));
        });
    }

    #[test]
    fn test_find_property_prefers_innermost_scope() {
        let mut b = ProgramBuilder::new();
        let x = b.qname("", "x");
        with_frame(b, |f| {
            let outer = Object::object();
            outer.set_property("x", Object::integer(1));
            let inner = Object::object();
            inner.set_property("x", Object::integer(2));
            f.scope_stack.push(outer);
            f.scope_stack.push(inner.clone());
            find_property(f, x, 0);
            assert!(Rc::ptr_eq(&f.pop(), &inner));
            get_lex(f, x, 0);
            assert_eq!(f.pop().as_integer(), Some(2));
        });
    }

    #[test]
    fn test_getter_and_setter_are_preferred() {
        fn getter(_: &Vm, _: &ObjRef, _: &[ObjRef]) -> ObjRef {
            Object::integer(42)
        }
        fn setter(_: &Vm, this: &ObjRef, args: &[ObjRef]) -> ObjRef {
            this.set_property("shadow", args[0].clone());
            Object::undefined()
        }
        let mut b = ProgramBuilder::new();
        let value = b.qname("", "value");
        with_frame(b, |f| {
            let obj = Object::object();
            obj.set_getter("value", Object::native(getter));
            obj.set_setter("value", Object::native(setter));

            f.push(obj.clone());
            get_property(f, value, 0);
            assert_eq!(f.pop().as_integer(), Some(42));

            f.push(obj.clone());
            push_byte(f, 7, 0);
            set_property(f, value, 0);
            assert_eq!(obj.get_property("shadow").unwrap().as_integer(), Some(7));
            assert!(!obj.has_property("value"));
        });
    }

    #[test]
    fn test_call_property_orders_arguments() {
        fn second(_: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
            args[1].clone()
        }
        let mut b = ProgramBuilder::new();
        let pick = b.qname("", "pick");
        let missing = b.qname("", "missing");
        with_frame(b, |f| {
            let obj = Object::object();
            obj.set_property("pick", Object::native(second));
            f.push(obj.clone());
            push_byte(f, 1, 0);
            push_byte(f, 2, 0);
            call_property(f, pick, 2);
            assert_eq!(f.pop().as_integer(), Some(2));

            f.push(obj);
            call_prop_void(f, missing, 0);
            assert_eq!(f.depth(), 0);
        });
    }

    #[test]
    fn test_new_array_and_object() {
        let mut b = ProgramBuilder::new();
        let key = b.string("k");
        with_frame(b, |f| {
            push_byte(f, 1, 0);
            push_byte(f, 2, 0);
            new_array(f, 2, 0);
            assert_eq!(f.pop().to_string(), "1,2");

            push_string(f, key, 0);
            push_byte(f, 9, 0);
            new_object(f, 1, 0);
            assert_eq!(f.pop().get_property("k").unwrap().as_integer(), Some(9));
        });
    }

    #[test]
    fn test_conditions() {
        with_frame(ProgramBuilder::new(), |f| {
            push_byte(f, 1, 0);
            push_byte(f, 2, 0);
            assert!(if_lt(f));
            push_byte(f, 2, 0);
            push_byte(f, 2, 0);
            assert!(if_le(f));
            push_byte(f, 2, 0);
            push_byte(f, 2, 0);
            assert!(!if_gt(f));
            push_byte(f, 3, 0);
            push_byte(f, 2, 0);
            assert!(if_nlt(f));
            push_true(f, 0, 0);
            assert!(if_true(f));
            push_undefined(f, 0, 0);
            assert!(if_false(f));
            push_null(f, 0, 0);
            push_undefined(f, 0, 0);
            assert!(if_eq(f));
            push_null(f, 0, 0);
            push_undefined(f, 0, 0);
            assert!(if_strict_ne(f));
            assert_eq!(f.depth(), 0);
        });
    }

    #[test]
    fn test_lookup_switch_selects_default() {
        with_frame(ProgramBuilder::new(), |f| {
            push_byte(f, 1, 0);
            assert_eq!(lookup_switch(f, 2), 1);
            push_byte(f, 5, 0);
            assert_eq!(lookup_switch(f, 2), 3);
            push_byte(f, 0xff, 0);
            assert_eq!(lookup_switch(f, 2), 3);
        });
    }

    #[test]
    fn test_stub_policy_balances_stack() {
        with_frame(ProgramBuilder::new(), |f| {
            push_byte(f, 1, 0);
            unary_stub(f, Opcode::Increment as u32, 0);
            assert_eq!(f.depth(), 1);
            push_byte(f, 1, 0);
            binary_stub(f, Opcode::Equals as u32, 0);
            assert_eq!(f.depth(), 1);
            assert!(f.pop().is_undefined());
        });
    }

    #[test]
    fn test_locals_and_iteration() {
        with_frame(ProgramBuilder::new(), |f| {
            let obj = Object::object();
            obj.set_property("a", Object::integer(1));
            obj.set_property("b", Object::integer(2));
            f.set_local(1, obj.clone());
            f.set_local(2, Object::integer(0));

            has_next2(f, 1, 2);
            assert!(f.pop().to_boolean());
            f.push(obj.clone());
            f.push(f.local(2));
            next_name(f, 0, 0);
            assert_eq!(f.pop().as_str(), Some("a"));

            has_next2(f, 1, 2);
            assert!(f.pop().to_boolean());
            has_next2(f, 1, 2);
            assert!(!f.pop().to_boolean());
            assert_eq!(f.local(2).as_integer(), Some(0));

            copy_local(f, 0, 3);
            assert!(Rc::ptr_eq(&f.local(3), f.vm.global()));
            inc_local_i(f, 2, 0);
            assert_eq!(f.local(2).as_integer(), Some(1));
            kill(f, 2, 0);
            assert!(f.local(2).is_undefined());
        });
    }

    #[test]
    #[should_panic(expected = "pop from empty operand stack")]
    fn test_empty_pop_is_fatal() {
        with_frame(ProgramBuilder::new(), |f| pop(f, 0, 0));
    }
}
