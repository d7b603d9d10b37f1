//! Encoding side of the ABC container.
//!
//! [`Writer`] is the inverse of [`Reader`](super::Reader), [`encode`]
//! serializes a whole [`AbcFile`], and [`ProgramBuilder`] /
//! [`CodeBuilder`] assemble small programs by hand (tests and tooling).

use std::collections::HashMap;

use super::opcode::Opcode;
use super::{
    AbcFile, ClassInfo, ConstantPool, InstanceInfo, MethodBody, MethodInfo, MethodTrait,
    Multiname, Namespace, NsSet, ScriptInfo, SlotTrait, Trait, TraitKind, method_flags, ns_kind,
    trait_attr,
};

#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_d64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Low 24 bits of `value`, little-endian.
    pub fn write_s24(&mut self, value: i32) {
        let raw = value as u32;
        self.buf.extend_from_slice(&[raw as u8, (raw >> 8) as u8, (raw >> 16) as u8]);
    }

    pub fn write_u32(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_u30(&mut self, value: u32) {
        self.write_u32(value);
    }

    pub fn write_s32(&mut self, mut value: i32) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u30(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

/// Count prefix of a 1-based pool table holding `len` entries including
/// the index-0 placeholder.
fn pool_count(len: usize) -> u32 {
    if len <= 1 { 0 } else { len as u32 }
}

fn write_pool(w: &mut Writer, pool: &ConstantPool) {
    w.write_u30(pool_count(pool.integers.len()));
    for &v in pool.integers.iter().skip(1) {
        w.write_s32(v);
    }
    w.write_u30(pool_count(pool.uintegers.len()));
    for &v in pool.uintegers.iter().skip(1) {
        w.write_u32(v);
    }
    w.write_u30(pool_count(pool.doubles.len()));
    for &v in pool.doubles.iter().skip(1) {
        w.write_d64(v);
    }
    w.write_u30(pool_count(pool.strings.len()));
    for s in pool.strings.iter().skip(1) {
        w.write_string(s);
    }
    w.write_u30(pool_count(pool.namespaces.len()));
    for ns in pool.namespaces.iter().skip(1) {
        w.write_u8(ns.kind);
        w.write_u30(ns.name);
    }
    w.write_u30(pool_count(pool.ns_sets.len()));
    for set in pool.ns_sets.iter().skip(1) {
        w.write_u30(set.namespaces.len() as u32);
        for &ns in &set.namespaces {
            w.write_u30(ns);
        }
    }
    w.write_u30(pool_count(pool.multinames.len()));
    for mn in pool.multinames.iter().skip(1) {
        w.write_u8(mn.kind_byte());
        match *mn {
            Multiname::Any | Multiname::RtqNameL { .. } => {}
            Multiname::QName { ns, name, .. } => {
                w.write_u30(ns);
                w.write_u30(name);
            }
            Multiname::RtqName { name, .. } => w.write_u30(name),
            Multiname::Multiname { name, ns_set, .. } => {
                w.write_u30(name);
                w.write_u30(ns_set);
            }
            Multiname::MultinameL { ns_set, .. } => w.write_u30(ns_set),
        }
    }
}

fn write_traits(w: &mut Writer, traits: &[Trait]) {
    w.write_u30(traits.len() as u32);
    for t in traits {
        w.write_u30(t.name);
        let mut attributes = t.attributes;
        if !t.metadata.is_empty() {
            attributes |= trait_attr::METADATA;
        }
        w.write_u8(t.kind.tag() | (attributes << 4));
        match t.kind {
            TraitKind::Slot(s) | TraitKind::Const(s) => {
                w.write_u30(s.slot_id);
                w.write_u30(s.type_name);
                w.write_u30(s.vindex);
                if s.vindex != 0 {
                    w.write_u8(s.vkind);
                }
            }
            TraitKind::Class { slot_id, class } => {
                w.write_u30(slot_id);
                w.write_u30(class);
            }
            TraitKind::Function { slot_id, function } => {
                w.write_u30(slot_id);
                w.write_u30(function);
            }
            TraitKind::Method(m) | TraitKind::Getter(m) | TraitKind::Setter(m) => {
                w.write_u30(m.disp_id);
                w.write_u30(m.method);
            }
        }
        if attributes & trait_attr::METADATA != 0 {
            w.write_u30(t.metadata.len() as u32);
            for &m in &t.metadata {
                w.write_u30(m);
            }
        }
    }
}

fn write_method(w: &mut Writer, m: &MethodInfo) {
    w.write_u30(m.param_types.len() as u32);
    w.write_u30(m.return_type);
    for &t in &m.param_types {
        w.write_u30(t);
    }
    w.write_u30(m.name);
    let mut flags = m.flags;
    if !m.options.is_empty() {
        flags |= method_flags::HAS_OPTIONAL;
    }
    if !m.param_names.is_empty() {
        flags |= method_flags::HAS_PARAM_NAMES;
    }
    w.write_u8(flags);
    if flags & method_flags::HAS_OPTIONAL != 0 {
        w.write_u30(m.options.len() as u32);
        for o in &m.options {
            w.write_u30(o.value);
            w.write_u8(o.kind);
        }
    }
    if flags & method_flags::HAS_PARAM_NAMES != 0 {
        for i in 0..m.param_types.len() {
            w.write_u30(m.param_names.get(i).copied().unwrap_or(0));
        }
    }
}

fn write_body(w: &mut Writer, method: u32, body: &MethodBody) {
    w.write_u30(method);
    w.write_u30(body.max_stack);
    w.write_u30(body.local_count);
    w.write_u30(body.init_scope_depth);
    w.write_u30(body.max_scope_depth);
    w.write_u30(body.code.len() as u32);
    w.write_bytes(&body.code);
    w.write_u30(body.exceptions.len() as u32);
    for e in &body.exceptions {
        w.write_u30(e.from);
        w.write_u30(e.to);
        w.write_u30(e.target);
        w.write_u30(e.exc_type);
        w.write_u30(e.var_name);
    }
    write_traits(w, &body.traits);
}

/// Serializes `file` in document order.
pub fn encode(file: &AbcFile) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u16(file.minor_version);
    w.write_u16(file.major_version);
    write_pool(&mut w, &file.constant_pool);

    w.write_u30(file.methods.len() as u32);
    for m in &file.methods {
        write_method(&mut w, m);
    }

    w.write_u30(file.metadata.len() as u32);
    for md in &file.metadata {
        w.write_u30(md.name);
        w.write_u30(md.items.len() as u32);
        for &(key, value) in &md.items {
            w.write_u30(key);
            w.write_u30(value);
        }
    }

    w.write_u30(file.instances.len() as u32);
    for inst in &file.instances {
        w.write_u30(inst.name);
        w.write_u30(inst.super_name);
        w.write_u8(inst.flags);
        if let Some(ns) = inst.protected_ns {
            w.write_u30(ns);
        }
        w.write_u30(inst.interfaces.len() as u32);
        for &i in &inst.interfaces {
            w.write_u30(i);
        }
        w.write_u30(inst.init);
        write_traits(&mut w, &inst.traits);
    }
    for class in &file.classes {
        w.write_u30(class.init);
        write_traits(&mut w, &class.traits);
    }

    w.write_u30(file.scripts.len() as u32);
    for script in &file.scripts {
        w.write_u30(script.init);
        write_traits(&mut w, &script.traits);
    }

    let bodies: Vec<_> = file
        .methods
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.body.as_ref().map(|b| (i as u32, b)))
        .collect();
    w.write_u30(bodies.len() as u32);
    for (i, body) in bodies {
        write_body(&mut w, i, body);
    }

    w.into_bytes()
}

/// Assembles the byte stream of one method body. Branch targets are
/// labels resolved by [`CodeBuilder::finish`].
#[derive(Default)]
pub struct CodeBuilder {
    w: Writer,
    labels: Vec<Option<usize>>,
    /// (patch offset, base offset for the displacement, label)
    fixups: Vec<(usize, usize, usize)>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.w.len()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.w.write_u8(op as u8);
        self
    }

    pub fn op_u30(&mut self, op: Opcode, a: u32) -> &mut Self {
        self.w.write_u8(op as u8);
        self.w.write_u30(a);
        self
    }

    pub fn op_u30_u30(&mut self, op: Opcode, a: u32, b: u32) -> &mut Self {
        self.w.write_u8(op as u8);
        self.w.write_u30(a);
        self.w.write_u30(b);
        self
    }

    pub fn push_byte(&mut self, value: u8) -> &mut Self {
        self.w.write_u8(Opcode::PushByte as u8);
        self.w.write_u8(value);
        self
    }

    pub fn get_local(&mut self, index: u32) -> &mut Self {
        match index {
            0..=3 => self.op(Opcode::from_byte(Opcode::GetLocal0 as u8 + index as u8).unwrap_or(Opcode::GetLocal0)),
            _ => self.op_u30(Opcode::GetLocal, index),
        }
    }

    pub fn set_local(&mut self, index: u32) -> &mut Self {
        match index {
            0..=3 => self.op(Opcode::from_byte(Opcode::SetLocal0 as u8 + index as u8).unwrap_or(Opcode::SetLocal0)),
            _ => self.op_u30(Opcode::SetLocal, index),
        }
    }

    pub fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    pub fn bind(&mut self, label: usize) -> &mut Self {
        self.labels[label] = Some(self.w.len());
        self
    }

    /// Emits a branch opcode with an s24 displacement to `label`.
    pub fn branch(&mut self, op: Opcode, label: usize) -> &mut Self {
        self.w.write_u8(op as u8);
        let at = self.w.len();
        self.w.write_s24(0);
        self.fixups.push((at, at + 3, label));
        self
    }

    /// Emits `lookupswitch`. Displacements are relative to the opcode.
    pub fn lookup_switch(&mut self, default: usize, cases: &[usize]) -> &mut Self {
        let base = self.w.len();
        self.w.write_u8(Opcode::LookupSwitch as u8);
        let at = self.w.len();
        self.w.write_s24(0);
        self.fixups.push((at, base, default));
        self.w.write_u30(cases.len().saturating_sub(1) as u32);
        for &case in cases {
            let at = self.w.len();
            self.w.write_s24(0);
            self.fixups.push((at, base, case));
        }
        self
    }

    /// Patches displacements. Unbound labels resolve to the end of code.
    pub fn finish(self) -> Vec<u8> {
        let mut code = self.w.into_bytes();
        let end = code.len();
        for (at, base, label) in self.fixups {
            let target = self.labels[label].unwrap_or(end);
            let disp = (target as i64 - base as i64) as i32 as u32;
            code[at] = disp as u8;
            code[at + 1] = (disp >> 8) as u8;
            code[at + 2] = (disp >> 16) as u8;
        }
        code
    }
}

/// Interns constants and accumulates tables for a hand-built program.
pub struct ProgramBuilder {
    file: AbcFile,
    strings: HashMap<String, u32>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            file: AbcFile::default(),
            strings: HashMap::new(),
        }
    }

    pub fn string(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&i) = self.strings.get(s) {
            return i;
        }
        let pool = &mut self.file.constant_pool;
        pool.strings.push(s.to_string());
        let i = (pool.strings.len() - 1) as u32;
        self.strings.insert(s.to_string(), i);
        i
    }

    pub fn int(&mut self, value: i32) -> u32 {
        let pool = &mut self.file.constant_pool;
        pool.integers.push(value);
        (pool.integers.len() - 1) as u32
    }

    pub fn uint(&mut self, value: u32) -> u32 {
        let pool = &mut self.file.constant_pool;
        pool.uintegers.push(value);
        (pool.uintegers.len() - 1) as u32
    }

    pub fn double(&mut self, value: f64) -> u32 {
        let pool = &mut self.file.constant_pool;
        pool.doubles.push(value);
        (pool.doubles.len() - 1) as u32
    }

    pub fn namespace(&mut self, kind: u8, name: &str) -> u32 {
        let name = self.string(name);
        let pool = &mut self.file.constant_pool;
        pool.namespaces.push(Namespace { kind, name });
        (pool.namespaces.len() - 1) as u32
    }

    pub fn ns_set(&mut self, namespaces: Vec<u32>) -> u32 {
        let pool = &mut self.file.constant_pool;
        pool.ns_sets.push(NsSet { namespaces });
        (pool.ns_sets.len() - 1) as u32
    }

    pub fn multiname(&mut self, mn: Multiname) -> u32 {
        let pool = &mut self.file.constant_pool;
        pool.multinames.push(mn);
        (pool.multinames.len() - 1) as u32
    }

    /// QName in the package namespace `package` ("" for the public one).
    pub fn qname(&mut self, package: &str, name: &str) -> u32 {
        let ns = self.namespace(ns_kind::PACKAGE, package);
        let name = self.string(name);
        self.multiname(Multiname::QName { ns, name, attribute: false })
    }

    /// Adds a method with a body and returns its index.
    pub fn method(&mut self, param_count: usize, max_stack: u32, local_count: u32, code: Vec<u8>) -> u32 {
        self.method_with_traits(param_count, max_stack, local_count, code, Vec::new())
    }

    pub fn method_with_traits(
        &mut self,
        param_count: usize,
        max_stack: u32,
        local_count: u32,
        code: Vec<u8>,
        traits: Vec<Trait>,
    ) -> u32 {
        self.file.methods.push(MethodInfo {
            param_types: vec![0; param_count],
            body: Some(MethodBody {
                max_stack,
                local_count: local_count.max(param_count as u32 + 1),
                init_scope_depth: 0,
                max_scope_depth: 4,
                code,
                exceptions: Vec::new(),
                traits,
            }),
            ..MethodInfo::default()
        });
        (self.file.methods.len() - 1) as u32
    }

    /// Adds a class named by multiname `name`, returning its class index.
    pub fn class(
        &mut self,
        name: u32,
        super_name: u32,
        iinit: u32,
        instance_traits: Vec<Trait>,
        cinit: u32,
        class_traits: Vec<Trait>,
    ) -> u32 {
        self.file.instances.push(InstanceInfo {
            name,
            super_name,
            flags: 0,
            protected_ns: None,
            interfaces: Vec::new(),
            init: iinit,
            traits: instance_traits,
        });
        self.file.classes.push(ClassInfo { init: cinit, traits: class_traits });
        (self.file.classes.len() - 1) as u32
    }

    pub fn script(&mut self, init: u32, traits: Vec<Trait>) -> u32 {
        self.file.scripts.push(ScriptInfo { init, traits });
        (self.file.scripts.len() - 1) as u32
    }

    pub fn finish(mut self) -> AbcFile {
        self.file.index_classes();
        self.file
    }
}

/// Trait constructors for hand-built programs.
pub mod traits {
    use super::*;

    fn plain(name: u32, kind: TraitKind) -> Trait {
        Trait { name, kind, attributes: 0, metadata: Vec::new() }
    }

    pub fn slot(name: u32, slot_id: u32) -> Trait {
        plain(name, TraitKind::Slot(SlotTrait { slot_id, type_name: 0, vindex: 0, vkind: 0 }))
    }

    pub fn slot_with_value(name: u32, slot_id: u32, vindex: u32, vkind: u8) -> Trait {
        plain(name, TraitKind::Slot(SlotTrait { slot_id, type_name: 0, vindex, vkind }))
    }

    pub fn constant(name: u32, slot_id: u32) -> Trait {
        plain(name, TraitKind::Const(SlotTrait { slot_id, type_name: 0, vindex: 0, vkind: 0 }))
    }

    pub fn method(name: u32, method: u32) -> Trait {
        plain(name, TraitKind::Method(MethodTrait { disp_id: 0, method }))
    }

    pub fn getter(name: u32, method: u32) -> Trait {
        plain(name, TraitKind::Getter(MethodTrait { disp_id: 0, method }))
    }

    pub fn setter(name: u32, method: u32) -> Trait {
        plain(name, TraitKind::Setter(MethodTrait { disp_id: 0, method }))
    }

    pub fn class(name: u32, slot_id: u32, class: u32) -> Trait {
        plain(name, TraitKind::Class { slot_id, class })
    }
}
