//! Runtime object model.
//!
//! Every runtime value is a reference-counted [`Object`]: a closed
//! [`Value`] variant plus dynamic named properties, indexed slots,
//! getter/setter overrides, a class-name tag and a non-owning prototype
//! link. Property lookup here never walks the prototype; callers that
//! want inheritance follow [`Object::prototype`] themselves.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;

use super::vm::Vm;

/// Shared handle to a heap object. Cloning the handle is the reference
/// increment; dropping it is the decrement.
pub type ObjRef = Rc<Object>;

/// Built-in function: `(vm, this, args) -> result`.
pub type NativeFn = fn(&Vm, &ObjRef, &[ObjRef]) -> ObjRef;

#[derive(Clone, Copy)]
pub enum Callable {
    /// Method index into the program's method table.
    Method(u32),
    Native(NativeFn),
}

pub struct Function {
    pub callable: Callable,
    /// Receiver captured by `getlex`; overrides the call-site receiver.
    pub closure_this: RefCell<Option<ObjRef>>,
}

impl Function {
    pub fn new(callable: Callable) -> Self {
        Self {
            callable,
            closure_this: RefCell::new(None),
        }
    }
}

/// Placeholder for a hoisted declaration whose defining script has not
/// run yet. Resolving it runs the script initializer `init` against the
/// global object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Definable {
    pub init: u32,
}

pub enum Value {
    Undefined,
    Null,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    String(String),
    Array(RefCell<Vec<ObjRef>>),
    Object,
    Function(Function),
    Definable(Definable),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "int",
            Value::Number(_) => "Number",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Object => "Object",
            Value::Function(_) => "Function",
            Value::Definable(_) => "Definable",
        }
    }

    fn duplicate(&self) -> Value {
        match self {
            Value::Undefined => Value::Undefined,
            Value::Null => Value::Null,
            Value::Boolean(b) => Value::Boolean(*b),
            Value::Integer(i) => Value::Integer(*i),
            Value::Number(n) => Value::Number(*n),
            Value::String(s) => Value::String(s.clone()),
            Value::Array(items) => Value::Array(RefCell::new(items.borrow().clone())),
            Value::Object => Value::Object,
            Value::Function(f) => Value::Function(Function {
                callable: f.callable,
                closure_this: RefCell::new(f.closure_this.borrow().clone()),
            }),
            Value::Definable(d) => Value::Definable(*d),
        }
    }
}

#[derive(Clone)]
enum Slot {
    /// Mirrors the named property.
    Named(String),
    Value(ObjRef),
}

pub struct Object {
    value: Value,
    properties: RefCell<HashMap<String, ObjRef>>,
    slots: RefCell<Vec<Option<Slot>>>,
    getters: RefCell<HashMap<String, ObjRef>>,
    setters: RefCell<HashMap<String, ObjRef>>,
    prototype: RefCell<Weak<Object>>,
    class_name: RefCell<String>,
}

impl Object {
    pub fn new(value: Value) -> ObjRef {
        Rc::new(Object {
            value,
            properties: RefCell::new(HashMap::new()),
            slots: RefCell::new(Vec::new()),
            getters: RefCell::new(HashMap::new()),
            setters: RefCell::new(HashMap::new()),
            prototype: RefCell::new(Weak::new()),
            class_name: RefCell::new(String::new()),
        })
    }

    pub fn undefined() -> ObjRef {
        Self::new(Value::Undefined)
    }

    pub fn null() -> ObjRef {
        Self::new(Value::Null)
    }

    pub fn boolean(b: bool) -> ObjRef {
        Self::new(Value::Boolean(b))
    }

    pub fn integer(i: i32) -> ObjRef {
        Self::new(Value::Integer(i))
    }

    pub fn number(n: f64) -> ObjRef {
        Self::new(Value::Number(n))
    }

    pub fn string(s: impl Into<String>) -> ObjRef {
        Self::new(Value::String(s.into()))
    }

    pub fn array(items: Vec<ObjRef>) -> ObjRef {
        Self::new(Value::Array(RefCell::new(items)))
    }

    pub fn object() -> ObjRef {
        Self::new(Value::Object)
    }

    pub fn function(callable: Callable) -> ObjRef {
        Self::new(Value::Function(Function::new(callable)))
    }

    pub fn native(f: NativeFn) -> ObjRef {
        Self::function(Callable::Native(f))
    }

    pub fn definable(init: u32) -> ObjRef {
        Self::new(Value::Definable(Definable { init }))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.value, Value::Undefined)
    }

    pub fn as_function(&self) -> Option<&Function> {
        match &self.value {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_definable(&self) -> Option<Definable> {
        match self.value {
            Value::Definable(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i32> {
        match self.value {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn class_name(&self) -> String {
        self.class_name.borrow().clone()
    }

    pub fn set_class_name(&self, name: &str) {
        *self.class_name.borrow_mut() = name.to_string();
    }

    pub fn prototype(&self) -> Option<ObjRef> {
        self.prototype.borrow().upgrade()
    }

    pub fn set_prototype(&self, proto: &ObjRef) {
        *self.prototype.borrow_mut() = Rc::downgrade(proto);
    }

    // ==================== Properties ====================

    /// Own stored property. `None` means "not found".
    pub fn get_property(&self, name: &str) -> Option<ObjRef> {
        if let Some(v) = self.properties.borrow().get(name) {
            return Some(v.clone());
        }
        self.intrinsic_property(name)
    }

    /// `length` and numeric indices of arrays, `length` of strings.
    fn intrinsic_property(&self, name: &str) -> Option<ObjRef> {
        match &self.value {
            Value::Array(items) => {
                let items = items.borrow();
                if name == "length" {
                    return Some(Object::integer(items.len() as i32));
                }
                name.parse::<usize>().ok().and_then(|i| items.get(i).cloned())
            }
            Value::String(s) if name == "length" => Some(Object::integer(s.chars().count() as i32)),
            _ => None,
        }
    }

    pub fn set_property(&self, name: &str, value: ObjRef) {
        if let Value::Array(items) = &self.value {
            if let Ok(i) = name.parse::<usize>() {
                let mut items = items.borrow_mut();
                if i >= items.len() {
                    items.resize_with(i + 1, Object::undefined);
                }
                items[i] = value;
                return;
            }
        }
        self.properties.borrow_mut().insert(name.to_string(), value);
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.borrow().contains_key(name) || self.intrinsic_property(name).is_some()
    }

    pub fn remove_property(&self, name: &str) -> bool {
        self.properties.borrow_mut().remove(name).is_some()
    }

    /// Own property names in a stable (sorted) order.
    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.properties.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn property_count(&self) -> usize {
        self.properties.borrow().len()
    }

    // ==================== Slots ====================

    /// Slot ids are 1-based; id 0 means "no slot".
    pub fn get_slot(&self, id: u32) -> Option<ObjRef> {
        let slot = self.slots.borrow().get(id.checked_sub(1)? as usize).cloned().flatten()?;
        match slot {
            Slot::Named(name) => self.get_property(&name),
            Slot::Value(v) => Some(v),
        }
    }

    pub fn set_slot(&self, id: u32, value: ObjRef) {
        let Some(index) = id.checked_sub(1) else { return };
        let named = match self.slots.borrow().get(index as usize) {
            Some(Some(Slot::Named(name))) => Some(name.clone()),
            _ => None,
        };
        match named {
            Some(name) => self.set_property(&name, value),
            None => self.put_slot(index as usize, Slot::Value(value)),
        }
    }

    /// Makes slot `id` an alias of the named property.
    pub fn bind_slot(&self, id: u32, name: &str) {
        if let Some(index) = id.checked_sub(1) {
            self.put_slot(index as usize, Slot::Named(name.to_string()));
        }
    }

    fn put_slot(&self, index: usize, slot: Slot) {
        let mut slots = self.slots.borrow_mut();
        if index >= slots.len() {
            slots.resize(index + 1, None);
        }
        slots[index] = Some(slot);
    }

    // ==================== Getters / setters ====================

    pub fn getter(&self, name: &str) -> Option<ObjRef> {
        self.getters.borrow().get(name).cloned()
    }

    pub fn setter(&self, name: &str) -> Option<ObjRef> {
        self.setters.borrow().get(name).cloned()
    }

    pub fn set_getter(&self, name: &str, f: ObjRef) {
        self.getters.borrow_mut().insert(name.to_string(), f);
    }

    pub fn set_setter(&self, name: &str, f: ObjRef) {
        self.setters.borrow_mut().insert(name.to_string(), f);
    }

    /// New object of the same variant with copies of the own properties,
    /// slots, accessors, class name and prototype link.
    pub fn clone_object(&self) -> ObjRef {
        Rc::new(Object {
            value: self.value.duplicate(),
            properties: RefCell::new(self.properties.borrow().clone()),
            slots: RefCell::new(self.slots.borrow().clone()),
            getters: RefCell::new(self.getters.borrow().clone()),
            setters: RefCell::new(self.setters.borrow().clone()),
            prototype: RefCell::new(self.prototype.borrow().clone()),
            class_name: RefCell::new(self.class_name.borrow().clone()),
        })
    }

    // ==================== Coercions ====================

    pub fn to_boolean(&self) -> bool {
        match &self.value {
            Value::String(s) => !s.is_empty(),
            Value::Boolean(b) => *b,
            Value::Object => true,
            Value::Undefined => false,
            _ => false,
        }
    }

    pub fn to_number(&self) -> f64 {
        match &self.value {
            Value::Integer(i) => *i as f64,
            Value::Number(n) => *n,
            Value::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Null => 0.0,
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() { 0.0 } else { s.parse().unwrap_or(f64::NAN) }
            }
            _ => f64::NAN,
        }
    }

    /// ToInt32: truncation modulo 2^32, NaN and infinities map to 0.
    pub fn to_int(&self) -> i32 {
        if let Value::Integer(i) = self.value {
            return i;
        }
        let n = self.to_number();
        if !n.is_finite() {
            return 0;
        }
        (n.trunc() as i64 as u64 & 0xffff_ffff) as u32 as i32
    }

    // ==================== Comparison ====================

    /// `None` when the variants have no ordering capability.
    pub fn is_less(&self, other: &Object) -> Option<bool> {
        match (&self.value, &other.value) {
            (Value::String(a), Value::String(b)) => Some(a < b),
            (Value::Function(_) | Value::Definable(_), _)
            | (_, Value::Function(_) | Value::Definable(_)) => None,
            (Value::Integer(a), Value::Integer(b)) => Some(a < b),
            _ => {
                let (a, b) = (self.to_number(), other.to_number());
                // NaN on either side leaves the comparison undefined.
                a.partial_cmp(&b).map(|o| o.is_lt())
            }
        }
    }

    pub fn is_equal(&self, other: &Object) -> bool {
        use Value::*;
        match (&self.value, &other.value) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (String(a), String(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(_) | Number(_) | Boolean(_) | String(_), Integer(_) | Number(_) | Boolean(_) | String(_)) => {
                self.to_number() == other.to_number()
            }
            _ => std::ptr::eq(self, other),
        }
    }

    pub fn is_strict_equal(&self, other: &Object) -> bool {
        use Value::*;
        match (&self.value, &other.value) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Integer(_) | Number(_), Integer(_) | Number(_)) => self.to_number() == other.to_number(),
            (String(a), String(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            _ => std::ptr::eq(self, other),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) if n.is_nan() => write!(f, "NaN"),
            Value::Number(n) if n.is_infinite() => {
                write!(f, "{}", if *n > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                let items = items.borrow();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Value::Object => {
                let class = self.class_name.borrow();
                if class.is_empty() {
                    write!(f, "[object Object]")
                } else {
                    write!(f, "[object {}]", class)
                }
            }
            Value::Function(_) => write!(f, "function Function() {{}}"),
            Value::Definable(_) => write!(f, "[deferred]"),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Object | Value::Function(_) | Value::Array(_) | Value::Definable(_) => {
                write!(f, "{}<{}>", self.type_name(), self.class_name.borrow())
            }
            _ => write!(f, "{}({})", self.type_name(), self),
        }
    }
}

// ==================== Arithmetic ====================

/// Operand combination with no defined result.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported operands for {op}: {left} and {right}")]
pub struct Unsupported {
    pub op: &'static str,
    pub left: &'static str,
    pub right: &'static str,
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Integer(_) | Value::Number(_))
}

/// String concatenation is checked first; numeric operands add; any
/// other mix is [`Unsupported`].
pub fn add(left: &Object, right: &Object) -> Result<ObjRef, Unsupported> {
    match (&left.value, &right.value) {
        (Value::String(a), Value::String(b)) => Ok(Object::string(format!("{}{}", a, b))),
        (Value::Integer(a), Value::Integer(b)) => Ok(match a.checked_add(*b) {
            Some(sum) => Object::integer(sum),
            None => Object::number(*a as f64 + *b as f64),
        }),
        (l, r) if is_numeric(l) && is_numeric(r) => {
            Ok(Object::number(left.to_number() + right.to_number()))
        }
        _ => Err(Unsupported {
            op: "add",
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}

pub fn subtract(left: &Object, right: &Object) -> ObjRef {
    match (&left.value, &right.value) {
        (Value::Integer(a), Value::Integer(b)) => match a.checked_sub(*b) {
            Some(v) => Object::integer(v),
            None => Object::number(*a as f64 - *b as f64),
        },
        _ => Object::number(left.to_number() - right.to_number()),
    }
}

pub fn multiply(left: &Object, right: &Object) -> ObjRef {
    match (&left.value, &right.value) {
        (Value::Integer(a), Value::Integer(b)) => match a.checked_mul(*b) {
            Some(v) => Object::integer(v),
            None => Object::number(*a as f64 * *b as f64),
        },
        _ => Object::number(left.to_number() * right.to_number()),
    }
}

pub fn divide(left: &Object, right: &Object) -> ObjRef {
    Object::number(left.to_number() / right.to_number())
}
