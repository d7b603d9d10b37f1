//! ABC (ActionScript Byte Code) container format.
//!
//! Binary layout, in document order:
//! - Version: minor u16, major u16 (little-endian)
//! - Constant pool: ints, uints, doubles, strings, namespaces, namespace
//!   sets, multinames. Every table is 1-based; index 0 means "any/absent".
//! - Method table, metadata table
//! - Class count, then `instances[count]` and `classes[count]`
//! - Script table, method-body table
//!
//! Parsing is best-effort: recoverable oddities are recorded as
//! [`Anomaly`] values on the resulting [`AbcFile`] instead of failing.

pub mod dump;
pub mod opcode;
mod parse;
mod reader;
pub mod writer;

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

pub use opcode::{Args, Instruction, Opcode, Operands, decode, instructions};
pub use parse::parse;
pub use reader::Reader;

/// Unresumable deserialization failure.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected end of input at offset {offset} (wanted {wanted} bytes)")]
    UnexpectedEof { offset: usize, wanted: usize },

    #[error("unknown multiname kind 0x{kind:02x} at pool index {index}")]
    UnknownMultinameKind { index: usize, kind: u8 },

    #[error("unknown trait kind {kind} at offset {offset}")]
    UnknownTraitKind { offset: usize, kind: u8 },
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Recoverable oddity met while parsing. Logged and kept on the [`AbcFile`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Anomaly {
    #[error("u30 at offset {offset} exceeds 30 bits (0x{value:08x})")]
    U30Overflow { offset: usize, value: u32 },

    #[error("u32 at offset {offset} has bits set above bit 31")]
    U32HighBits { offset: usize },

    #[error("multibyte string at offset {offset} not handled")]
    MultibyteString { offset: usize },

    #[error("unexpected namespace kind 0x{kind:02x} at pool index {index}")]
    UnknownNamespaceKind { index: usize, kind: u8 },

    #[error("namespace set {index} is empty")]
    EmptyNamespaceSet { index: usize },

    #[error("unexpected constant kind 0x{kind:02x}")]
    UnknownConstantKind { kind: u8 },

    #[error("method body {body} refers to missing method {method}")]
    BodyMethodOutOfRange { body: usize, method: u32 },

    #[error("duplicate body assignment for method {method}")]
    DuplicateBody { method: u32 },
}

/// Namespace kinds.
pub mod ns_kind {
    pub const PRIVATE: u8 = 0x05;
    pub const NAMESPACE: u8 = 0x08;
    pub const PACKAGE: u8 = 0x16;
    pub const PACKAGE_INTERNAL: u8 = 0x17;
    pub const PROTECTED: u8 = 0x18;
    pub const EXPLICIT: u8 = 0x19;
    pub const STATIC_PROTECTED: u8 = 0x1a;

    pub fn is_known(kind: u8) -> bool {
        matches!(
            kind,
            PRIVATE | NAMESPACE | PACKAGE | PACKAGE_INTERNAL | PROTECTED | EXPLICIT | STATIC_PROTECTED
        )
    }
}

/// Multiname kinds.
pub mod mn_kind {
    pub const QNAME: u8 = 0x07;
    pub const QNAME_A: u8 = 0x0d;
    pub const RTQNAME: u8 = 0x0f;
    pub const RTQNAME_A: u8 = 0x10;
    pub const RTQNAME_L: u8 = 0x11;
    pub const RTQNAME_LA: u8 = 0x12;
    pub const MULTINAME: u8 = 0x09;
    pub const MULTINAME_A: u8 = 0x0e;
    pub const MULTINAME_L: u8 = 0x1b;
    pub const MULTINAME_LA: u8 = 0x1c;
}

/// Constant value kinds used by slot initializers and optional parameters.
pub mod const_kind {
    pub const UNDEFINED: u8 = 0x00;
    pub const UTF8: u8 = 0x01;
    pub const INT: u8 = 0x03;
    pub const UINT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x06;
    pub const FALSE: u8 = 0x0a;
    pub const TRUE: u8 = 0x0b;
    pub const NULL: u8 = 0x0c;

    pub fn is_known(kind: u8) -> bool {
        matches!(kind, UNDEFINED | UTF8 | INT | UINT | DOUBLE | FALSE | TRUE | NULL)
            || super::ns_kind::is_known(kind)
    }
}

/// Method flags.
pub mod method_flags {
    pub const NEED_ARGUMENTS: u8 = 0x01;
    pub const NEED_ACTIVATION: u8 = 0x02;
    pub const NEED_REST: u8 = 0x04;
    pub const HAS_OPTIONAL: u8 = 0x08;
    pub const SET_DXNS: u8 = 0x40;
    pub const HAS_PARAM_NAMES: u8 = 0x80;
}

/// Instance flags.
pub mod instance_flags {
    pub const SEALED: u8 = 0x01;
    pub const FINAL: u8 = 0x02;
    pub const INTERFACE: u8 = 0x04;
    pub const PROTECTED_NS: u8 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub kind: u8,
    pub name: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NsSet {
    pub namespaces: Vec<u32>,
}

/// A possibly namespace-qualified name. The `attribute` flag marks the
/// `...A` variants, which resolve the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Multiname {
    /// Pool index 0.
    Any,
    QName { ns: u32, name: u32, attribute: bool },
    RtqName { name: u32, attribute: bool },
    RtqNameL { attribute: bool },
    Multiname { name: u32, ns_set: u32, attribute: bool },
    MultinameL { ns_set: u32, attribute: bool },
}

impl Multiname {
    pub fn kind_byte(&self) -> u8 {
        use mn_kind::*;
        match *self {
            Multiname::Any => 0,
            Multiname::QName { attribute, .. } => if attribute { QNAME_A } else { QNAME },
            Multiname::RtqName { attribute, .. } => if attribute { RTQNAME_A } else { RTQNAME },
            Multiname::RtqNameL { attribute } => if attribute { RTQNAME_LA } else { RTQNAME_L },
            Multiname::Multiname { attribute, .. } => if attribute { MULTINAME_A } else { MULTINAME },
            Multiname::MultinameL { attribute, .. } => if attribute { MULTINAME_LA } else { MULTINAME_L },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConstantPool {
    pub integers: Vec<i32>,
    pub uintegers: Vec<u32>,
    pub doubles: Vec<f64>,
    pub strings: Vec<String>,
    pub namespaces: Vec<Namespace>,
    pub ns_sets: Vec<NsSet>,
    pub multinames: Vec<Multiname>,
}

impl Default for ConstantPool {
    /// A pool holding only the index-0 placeholders.
    fn default() -> Self {
        Self {
            integers: vec![0],
            uintegers: vec![0],
            doubles: vec![f64::NAN],
            strings: vec![String::new()],
            namespaces: vec![Namespace { kind: 0, name: 0 }],
            ns_sets: vec![NsSet::default()],
            multinames: vec![Multiname::Any],
        }
    }
}

impl ConstantPool {
    /// String at `index`; index 0 and out-of-range indices read as "".
    pub fn string(&self, index: u32) -> &str {
        self.strings.get(index as usize).map(String::as_str).unwrap_or("")
    }

    pub fn integer(&self, index: u32) -> Option<i32> {
        self.integers.get(index as usize).copied()
    }

    pub fn uinteger(&self, index: u32) -> Option<u32> {
        self.uintegers.get(index as usize).copied()
    }

    pub fn double(&self, index: u32) -> Option<f64> {
        self.doubles.get(index as usize).copied()
    }

    pub fn multiname(&self, index: u32) -> Option<&Multiname> {
        self.multinames.get(index as usize)
    }

    /// `"<ns>.<name>"`, or the bare name when the namespace name is empty.
    pub fn qualify(&self, ns: u32, name: u32) -> String {
        let ns_name = self
            .namespaces
            .get(ns as usize)
            .map(|n| self.string(n.name))
            .unwrap_or("");
        let name = self.string(name);
        if ns_name.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", ns_name, name)
        }
    }

    /// Resolves names that need no runtime component. `None` for the
    /// runtime-qualified kinds and for namespace sets that do not hold
    /// exactly one namespace.
    pub fn static_name(&self, index: u32) -> Option<String> {
        match *self.multiname(index)? {
            Multiname::Any => Some(String::new()),
            Multiname::QName { ns, name, .. } => Some(self.qualify(ns, name)),
            Multiname::Multiname { name, ns_set, .. } => {
                let set = self.ns_sets.get(ns_set as usize)?;
                match set.namespaces.as_slice() {
                    [ns] => Some(self.qualify(*ns, name)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OptionDetail {
    pub value: u32,
    pub kind: u8,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodInfo {
    pub param_types: Vec<u32>,
    pub return_type: u32,
    pub name: u32,
    pub flags: u8,
    pub options: Vec<OptionDetail>,
    pub param_names: Vec<u32>,
    pub body: Option<MethodBody>,
}

impl MethodInfo {
    pub fn param_count(&self) -> usize {
        self.param_types.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub from: u32,
    pub to: u32,
    pub target: u32,
    pub exc_type: u32,
    pub var_name: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodBody {
    pub max_stack: u32,
    pub local_count: u32,
    pub init_scope_depth: u32,
    pub max_scope_depth: u32,
    pub code: Vec<u8>,
    pub exceptions: Vec<ExceptionInfo>,
    pub traits: Vec<Trait>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metadata {
    pub name: u32,
    pub items: Vec<(u32, u32)>,
}

/// Slot and const traits. `vkind` is only meaningful when `vindex != 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotTrait {
    pub slot_id: u32,
    pub type_name: u32,
    pub vindex: u32,
    pub vkind: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MethodTrait {
    pub disp_id: u32,
    pub method: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraitKind {
    Slot(SlotTrait),
    Method(MethodTrait),
    Getter(MethodTrait),
    Setter(MethodTrait),
    Class { slot_id: u32, class: u32 },
    Function { slot_id: u32, function: u32 },
    Const(SlotTrait),
}

impl TraitKind {
    pub const SLOT: u8 = 0;
    pub const METHOD: u8 = 1;
    pub const GETTER: u8 = 2;
    pub const SETTER: u8 = 3;
    pub const CLASS: u8 = 4;
    pub const FUNCTION: u8 = 5;
    pub const CONST: u8 = 6;

    pub fn tag(&self) -> u8 {
        match self {
            TraitKind::Slot(_) => Self::SLOT,
            TraitKind::Method(_) => Self::METHOD,
            TraitKind::Getter(_) => Self::GETTER,
            TraitKind::Setter(_) => Self::SETTER,
            TraitKind::Class { .. } => Self::CLASS,
            TraitKind::Function { .. } => Self::FUNCTION,
            TraitKind::Const(_) => Self::CONST,
        }
    }
}

/// Trait attribute bits (upper nibble of the kind byte).
pub mod trait_attr {
    pub const FINAL: u8 = 0x1;
    pub const OVERRIDE: u8 = 0x2;
    pub const METADATA: u8 = 0x4;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trait {
    pub name: u32,
    pub kind: TraitKind,
    pub attributes: u8,
    pub metadata: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceInfo {
    pub name: u32,
    pub super_name: u32,
    pub flags: u8,
    pub protected_ns: Option<u32>,
    pub interfaces: Vec<u32>,
    pub init: u32,
    pub traits: Vec<Trait>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassInfo {
    pub init: u32,
    pub traits: Vec<Trait>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptInfo {
    pub init: u32,
    pub traits: Vec<Trait>,
}

/// A parsed program.
#[derive(Debug, Clone, Serialize)]
pub struct AbcFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub methods: Vec<MethodInfo>,
    pub metadata: Vec<Metadata>,
    pub instances: Vec<InstanceInfo>,
    pub classes: Vec<ClassInfo>,
    pub scripts: Vec<ScriptInfo>,
    /// Qualified class name to index into `instances`/`classes`.
    pub class_index: HashMap<String, usize>,
    pub anomalies: Vec<Anomaly>,
}

impl Default for AbcFile {
    fn default() -> Self {
        Self {
            minor_version: 16,
            major_version: 46,
            constant_pool: ConstantPool::default(),
            methods: Vec::new(),
            metadata: Vec::new(),
            instances: Vec::new(),
            classes: Vec::new(),
            scripts: Vec::new(),
            class_index: HashMap::new(),
            anomalies: Vec::new(),
        }
    }
}

impl AbcFile {
    pub fn string(&self, index: u32) -> &str {
        self.constant_pool.string(index)
    }

    pub fn method(&self, index: u32) -> Option<&MethodInfo> {
        self.methods.get(index as usize)
    }

    pub fn body(&self, method: u32) -> Option<&MethodBody> {
        self.method(method)?.body.as_ref()
    }

    pub fn class_by_name(&self, name: &str) -> Option<usize> {
        self.class_index.get(name).copied()
    }

    /// Rebuilds the qualified-name map from the instance table.
    pub fn index_classes(&mut self) {
        self.class_index.clear();
        for (i, inst) in self.instances.iter().enumerate() {
            let name = self
                .constant_pool
                .static_name(inst.name)
                .unwrap_or_else(|| self.string(inst.name).to_string());
            self.class_index.insert(name, i);
        }
    }
}
