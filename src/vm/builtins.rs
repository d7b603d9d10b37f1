//! Built-in class registry.
//!
//! Name to prototype-object bindings installed into the global object
//! before any script runs. Host-specific classes are plain objects here;
//! a host plugs in richer bindings with [`Vm::register_class`].

use crate::vm::Vm;
use crate::vm::ops::CALL_PROPERTY;
use crate::vm::value::{ObjRef, Object};

/// Display, event and text classes owned by the host.
pub const HOST_CLASSES: &[&str] = &[
    "flash.display.MovieClip",
    "flash.display.DisplayObject",
    "flash.display.DisplayObjectContainer",
    "flash.display.InteractiveObject",
    "flash.display.SimpleButton",
    "flash.display.Sprite",
    "flash.text.TextField",
    "flash.text.TextFormat",
    "flash.text.TextFieldType",
    "flash.xml.XMLDocument",
    "flash.utils.Timer",
    "flash.utils.Dictionary",
    "flash.utils.Proxy",
    "flash.geom.Rectangle",
    "flash.events.EventDispatcher",
    "flash.events.Event",
    "flash.events.MouseEvent",
    "flash.events.ProgressEvent",
    "flash.net.LocalConnection",
];

pub fn register(vm: &Vm) {
    vm.register_class("Object", Object::object());
    vm.register_class("int", conversion(to_int));
    vm.register_class("Boolean", conversion(to_boolean));
    vm.register_class("Number", conversion(to_number));
    let string = Object::string("");
    string.set_property(CALL_PROPERTY, Object::native(to_string));
    vm.register_class("String", string);
    vm.register_class("Array", Object::array(Vec::new()));
    vm.register_class("undefined", Object::undefined());

    if vm.config().host_classes {
        for name in HOST_CLASSES {
            let class = Object::object();
            class.set_class_name(name);
            vm.register_class(name, class);
        }
    }

    let global = vm.global();
    global.set_property("Math", math());
    global.set_property("trace", Object::native(trace));
    global.set_property("parseInt", Object::native(parse_int));
}

/// Class object whose call converts its first argument.
fn conversion(f: fn(&Vm, &ObjRef, &[ObjRef]) -> ObjRef) -> ObjRef {
    let class = Object::object();
    class.set_property(CALL_PROPERTY, Object::native(f));
    class
}

fn first(args: &[ObjRef]) -> ObjRef {
    args.first().cloned().unwrap_or_else(Object::undefined)
}

fn to_int(_: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
    Object::integer(first(args).to_int())
}

fn to_boolean(_: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
    Object::boolean(first(args).to_boolean())
}

fn to_number(_: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
    Object::number(first(args).to_number())
}

fn to_string(_: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
    Object::string(first(args).to_string())
}

fn math() -> ObjRef {
    let math = Object::object();
    math.set_class_name("Math");
    math.set_property("PI", Object::number(std::f64::consts::PI));
    math.set_property("sqrt", Object::native(|_, _, args| Object::number(first(args).to_number().sqrt())));
    math.set_property(
        "atan2",
        Object::native(|_, _, args| {
            let y = first(args).to_number();
            let x = args.get(1).map_or(f64::NAN, |v| v.to_number());
            Object::number(y.atan2(x))
        }),
    );
    math.set_property("floor", Object::native(|_, _, args| Object::number(first(args).to_number().floor())));
    math
}

/// Writes the arguments, space separated, to the VM output.
fn trace(vm: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
    let text = args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ");
    vm.write_output(&text);
    Object::undefined()
}

fn parse_int(_: &Vm, _: &ObjRef, args: &[ObjRef]) -> ObjRef {
    let text = first(args).to_string();
    let radix = args.get(1).map(|r| r.to_int()).filter(|&r| r != 0);
    match parse_integer(&text, radix) {
        Some(v) => match i32::try_from(v) {
            Ok(i) => Object::integer(i),
            Err(_) => Object::number(v as f64),
        },
        None => Object::number(f64::NAN),
    }
}

/// Leading-integer parse: optional sign, optional `0x` prefix when the radix
/// is 16 or unspecified, then as many digits as the radix allows.
fn parse_integer(text: &str, radix: Option<i32>) -> Option<i64> {
    let s = text.trim_start();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"));
    let (radix, digits) = match (radix, hex) {
        (None | Some(16), Some(rest)) => (16, rest),
        (None, None) => (10, s),
        (Some(r), _) if (2..=36).contains(&r) => (r as u32, s),
        _ => return None,
    };

    let mut value: i64 = 0;
    let mut any = false;
    for c in digits.chars() {
        let Some(d) = c.to_digit(radix) else { break };
        value = value.saturating_mul(radix as i64).saturating_add(d as i64);
        any = true;
    }
    any.then_some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42", None), Some(42));
        assert_eq!(parse_integer("  -17px", None), Some(-17));
        assert_eq!(parse_integer("0x1F", None), Some(31));
        assert_eq!(parse_integer("ff", Some(16)), Some(255));
        assert_eq!(parse_integer("101", Some(2)), Some(5));
        assert_eq!(parse_integer("abc", None), None);
        assert_eq!(parse_integer("12", Some(1)), None);
    }
}
