//! Class and trait builder.

use tracing::{debug, error, trace, warn};

use crate::abc::{SlotTrait, Trait, TraitKind, const_kind};
use crate::vm::Vm;
use crate::vm::value::{Callable, Definable, ObjRef, Object};
use crate::vm::vm::BUILTIN_CLASS;

/// Installs the traits in order. See [`build_trait`].
pub fn build_traits(vm: &Vm, obj: &ObjRef, traits: &[Trait], deferred: Option<Definable>) {
    for t in traits {
        build_trait(vm, obj, t, deferred);
    }
}

/// Resolves one declared trait into a property (plus slot alias, getter or
/// setter) on `obj`. `deferred` names the script initializer that defines
/// hoisted declarations; without it such declarations read as undefined
/// until their defining code runs.
pub fn build_trait(vm: &Vm, obj: &ObjRef, t: &Trait, deferred: Option<Definable>) {
    let name = vm.multiname_string(t.name, None);
    match t.kind {
        TraitKind::Class { slot_id, .. } => {
            obj.set_property(&name, placeholder(deferred));
            bind_slot(obj, slot_id, &name);
        }
        TraitKind::Method(m) => {
            trace!(%name, method = m.method, "method trait");
            obj.set_property(&name, method_value(vm, m.method));
        }
        TraitKind::Getter(m) => {
            trace!(%name, method = m.method, "getter trait");
            obj.set_getter(&name, method_value(vm, m.method));
        }
        TraitKind::Setter(m) => {
            trace!(%name, method = m.method, "setter trait");
            obj.set_setter(&name, method_value(vm, m.method));
        }
        TraitKind::Function { slot_id, function } => {
            obj.set_property(&name, method_value(vm, function));
            bind_slot(obj, slot_id, &name);
        }
        TraitKind::Const(s) if s.vindex == 0 => {
            obj.set_property(&name, placeholder(deferred));
            bind_slot(obj, s.slot_id, &name);
        }
        TraitKind::Const(s) => build_slot(vm, obj, &name, &s, deferred),
        TraitKind::Slot(s) => build_slot(vm, obj, &name, &s, deferred),
    }
}

fn placeholder(deferred: Option<Definable>) -> ObjRef {
    match deferred {
        Some(d) => Object::definable(d.init),
        None => Object::undefined(),
    }
}

fn bind_slot(obj: &ObjRef, slot_id: u32, name: &str) {
    if slot_id != 0 {
        obj.bind_slot(slot_id, name);
    }
}

/// Compiles the method (once) and wraps it as a function value.
fn method_value(vm: &Vm, method: u32) -> ObjRef {
    vm.compile(method);
    Object::function(Callable::Method(method))
}

fn build_slot(vm: &Vm, obj: &ObjRef, name: &str, s: &SlotTrait, deferred: Option<Definable>) {
    if s.vindex == 0 {
        if obj.has_property(name) {
            // First definition wins on a re-declared slot.
            debug!(name, "not resetting variable");
        } else {
            obj.set_property(name, placeholder(deferred));
        }
        bind_slot(obj, s.slot_id, name);
        return;
    }

    let pool = &vm.abc().constant_pool;
    let value = match s.vkind {
        const_kind::UTF8 => Object::string(pool.string(s.vindex)),
        const_kind::INT => Object::integer(pool.integer(s.vindex).unwrap_or(0)),
        const_kind::UINT => {
            let u = pool.uinteger(s.vindex).unwrap_or(0);
            match i32::try_from(u) {
                Ok(i) => Object::integer(i),
                Err(_) => Object::number(u as f64),
            }
        }
        const_kind::DOUBLE => Object::number(pool.double(s.vindex).unwrap_or(f64::NAN)),
        const_kind::FALSE => Object::boolean(false),
        const_kind::TRUE => Object::boolean(true),
        const_kind::NULL => Object::null(),
        const_kind::UNDEFINED => Object::undefined(),
        kind => {
            error!(name, kind, "slot kind not supported");
            obj.set_property(name, Object::undefined());
            return;
        }
    };
    obj.set_property(name, value);
    bind_slot(obj, s.slot_id, name);
}

/// Constructs an instance of the class registered under `name`, using
/// `base` as the instance object.
///
/// Builtin classes yield a copy of their global binding. Bytecode classes
/// get their class name and prototype link, their instance traits, and a
/// run of the instance initializer with `args`. A class whose global
/// binding is still a placeholder is defined first, which is what lets a
/// class be constructed before the script declaring it has run.
pub fn build_named_class(vm: &Vm, name: &str, base: ObjRef, args: &[ObjRef]) -> ObjRef {
    let Some(index) = vm.class_index(name) else {
        error!(name, "class not found");
        return Object::object();
    };
    let global = vm.global();

    if index == BUILTIN_CLASS {
        return match global.get_property(name) {
            Some(r) => {
                if r.as_definable().is_some() {
                    warn!(name, "class is not yet valid");
                }
                r.clone_object()
            }
            None => {
                error!(name, "class not found in global");
                Object::object()
            }
        };
    }

    debug!(name, "setting class name");
    base.set_class_name(name);
    let Some(class) = global.get_property(name) else {
        error!(name, "class not found in global");
        return base;
    };
    let class = vm.resolve_deferred(global, name, class);
    base.set_prototype(&class);

    let Some(instance) = vm.abc().instances.get(index as usize) else {
        error!(name, index, "class index out of range");
        return base;
    };
    vm.compile(instance.init);
    debug!(name, "building instance traits");
    build_traits(vm, &base, &instance.traits, None);
    debug!(name, "calling instance init");
    vm.call_method(instance.init, base.clone(), args);
    base
}

/// `newclass`: copies `base`, applies the class traits and runs the class
/// initializer on the copy.
pub fn new_class(vm: &Vm, base: &ObjRef, class: u32) -> ObjRef {
    let built = base.clone_object();
    let abc = vm.abc();
    let Some(info) = abc.classes.get(class as usize) else {
        warn!(class, "class index out of range");
        return built;
    };
    if let Some(instance) = abc.instances.get(class as usize) {
        built.set_class_name(&vm.multiname_string(instance.name, None));
    }
    vm.compile(info.init);
    debug!(class, "building class traits");
    build_traits(vm, &built, &info.traits, None);
    debug!(class, "calling class init");
    vm.call_method(info.init, built.clone(), &[]);
    built
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::abc::Opcode;
    use crate::abc::writer::{CodeBuilder, ProgramBuilder, traits};
    use crate::config::RuntimeConfig;

    fn vm_for(b: ProgramBuilder) -> Vm {
        Vm::with_output(b.finish(), RuntimeConfig::default(), Box::new(io::sink()))
    }

    fn return_void() -> Vec<u8> {
        let mut c = CodeBuilder::new();
        c.op(Opcode::ReturnVoid);
        c.finish()
    }

    #[test]
    fn test_slot_initial_values() {
        let mut b = ProgramBuilder::new();
        let greeting = b.string("hello");
        let s = b.qname("", "s");
        let f = b.qname("", "f");
        let n = b.qname("", "n");
        let d = b.qname("", "d");
        let three = b.int(3);
        let slot_traits = vec![
            traits::slot_with_value(s, 1, greeting, const_kind::UTF8),
            traits::slot_with_value(f, 2, 1, const_kind::FALSE),
            traits::slot_with_value(n, 0, 1, const_kind::NULL),
            traits::slot_with_value(d, 0, three, const_kind::INT),
        ];
        let vm = vm_for(b);
        let obj = Object::object();
        build_traits(&vm, &obj, &slot_traits, None);
        assert_eq!(obj.get_property("s").unwrap().as_str(), Some("hello"));
        assert_eq!(obj.get_slot(1).unwrap().as_str(), Some("hello"));
        assert!(!obj.get_slot(2).unwrap().to_boolean());
        assert_eq!(obj.get_property("n").unwrap().type_name(), "null");
        assert_eq!(obj.get_property("d").unwrap().as_integer(), Some(3));
    }

    #[test]
    fn test_first_definition_wins() {
        let mut b = ProgramBuilder::new();
        let x = b.qname("", "x");
        let t = traits::slot(x, 1);
        let vm = vm_for(b);
        let obj = Object::object();
        build_trait(&vm, &obj, &t, None);
        assert!(obj.get_property("x").unwrap().is_undefined());
        // A later deferred pass does not replace the existing value.
        build_trait(&vm, &obj, &t, Some(Definable { init: 0 }));
        assert!(obj.get_property("x").unwrap().as_definable().is_none());
        obj.set_slot(1, Object::integer(5));
        assert_eq!(obj.get_property("x").unwrap().as_integer(), Some(5));
    }

    #[test]
    fn test_class_trait_placeholder() {
        let mut b = ProgramBuilder::new();
        let name = b.qname("", "A");
        let t = traits::class(name, 0, 0);
        let vm = vm_for(b);
        let obj = Object::object();
        build_trait(&vm, &obj, &t, None);
        assert!(obj.get_property("A").unwrap().is_undefined());
        build_trait(&vm, &obj, &t, Some(Definable { init: 4 }));
        assert_eq!(obj.get_property("A").unwrap().as_definable(), Some(Definable { init: 4 }));
    }

    #[test]
    fn test_method_traits_compile_once() {
        let mut b = ProgramBuilder::new();
        let m = b.method(0, 1, 1, return_void());
        let run = b.qname("", "run");
        let get = b.qname("", "size");
        let method_traits = vec![traits::method(run, m), traits::getter(get, m), traits::setter(get, m)];
        let vm = vm_for(b);
        let obj = Object::object();
        build_traits(&vm, &obj, &method_traits, None);
        assert!(obj.get_property("run").unwrap().as_function().is_some());
        assert!(obj.getter("size").is_some());
        assert!(obj.setter("size").is_some());
        assert!(vm.is_compiled(m));
        assert_eq!(vm.compile_count(), 1);
    }

    #[test]
    fn test_unknown_class_yields_plain_object() {
        let vm = vm_for(ProgramBuilder::new());
        let o = build_named_class(&vm, "NoSuchClass", Object::object(), &[]);
        assert_eq!(o.type_name(), "Object");
        assert_eq!(o.class_name(), "");
    }

    #[test]
    fn test_builtin_class_is_copied() {
        let vm = vm_for(ProgramBuilder::new());
        let a = build_named_class(&vm, "Array", Object::object(), &[]);
        assert_eq!(a.type_name(), "Array");
        assert!(!std::rc::Rc::ptr_eq(&a, &vm.global().get_property("Array").unwrap()));
    }
}
