//! Human-readable listing of a parsed program.

use std::fmt::Write;

use super::opcode::{Args, instructions};
use super::{AbcFile, Multiname, Trait, TraitKind};

/// Display form of a multiname, including the runtime-qualified kinds.
pub fn multiname(file: &AbcFile, index: u32) -> String {
    let pool = &file.constant_pool;
    if let Some(name) = pool.static_name(index) {
        return if name.is_empty() { "*".to_string() } else { name };
    }
    match pool.multiname(index) {
        Some(Multiname::RtqName { name, .. }) => format!("<rt>::{}", pool.string(*name)),
        Some(Multiname::RtqNameL { .. }) => "<rt>::<rt>".to_string(),
        Some(Multiname::Multiname { name, ns_set, .. }) => {
            let set = pool
                .ns_sets
                .get(*ns_set as usize)
                .map(|s| {
                    s.namespaces
                        .iter()
                        .map(|&ns| {
                            let n = pool.namespaces.get(ns as usize).map(|n| n.name).unwrap_or(0);
                            pool.string(n).to_string()
                        })
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            format!("[{}]::{}", set, pool.string(*name))
        }
        Some(Multiname::MultinameL { .. }) => "[..]::<rt>".to_string(),
        _ => format!("<invalid multiname {}>", index),
    }
}

fn write_trait(out: &mut String, file: &AbcFile, t: &Trait, indent: &str) {
    let name = multiname(file, t.name);
    let _ = match t.kind {
        TraitKind::Slot(s) | TraitKind::Const(s) => {
            let keyword = if matches!(t.kind, TraitKind::Const(_)) { "const" } else { "var" };
            writeln!(
                out,
                "{indent}{keyword} {name}: {} (slot {}, value {}/0x{:02x})",
                multiname(file, s.type_name),
                s.slot_id,
                s.vindex,
                s.vkind
            )
        }
        TraitKind::Method(m) => writeln!(out, "{indent}method {name} -> #{}", m.method),
        TraitKind::Getter(m) => writeln!(out, "{indent}get {name} -> #{}", m.method),
        TraitKind::Setter(m) => writeln!(out, "{indent}set {name} -> #{}", m.method),
        TraitKind::Class { slot_id, class } => {
            writeln!(out, "{indent}class {name} -> class {class} (slot {slot_id})")
        }
        TraitKind::Function { slot_id, function } => {
            writeln!(out, "{indent}function {name} -> #{function} (slot {slot_id})")
        }
    };
}

/// Disassembles one code stream.
pub fn disassemble(file: &AbcFile, code: &[u8]) -> String {
    let mut out = String::new();
    for insn in instructions(code) {
        let name = insn.opcode.map(|op| op.name()).unwrap_or("<unknown>");
        let _ = write!(out, "  {:5}: {}", insn.offset, name);
        let _ = match &insn.args {
            Args::None => Ok(()),
            Args::Branch(_) => write!(out, " -> {}", insn.branch_target().unwrap_or(0)),
            Args::Switch { .. } => write!(out, " {:?}", insn.switch_targets()),
            Args::One(a) => match insn.opcode.map(|op| op.name()) {
                Some(
                    "getproperty" | "setproperty" | "initproperty" | "getlex" | "findpropstrict"
                    | "findproperty" | "deleteproperty" | "coerce" | "astype" | "istype"
                    | "getsuper" | "setsuper",
                ) => write!(out, " {}", multiname(file, *a)),
                Some("pushstring" | "debugfile") => write!(out, " {:?}", file.string(*a)),
                _ => write!(out, " {}", a),
            },
            Args::Two(a, b) => match insn.opcode.map(|op| op.name()) {
                Some("hasnext2" | "debug") => write!(out, " {} {}", a, b),
                _ => write!(out, " {} ({} args)", multiname(file, *a), b),
            },
        };
        out.push('\n');
    }
    out
}

/// Renders classes, scripts and method bodies.
pub fn dump(file: &AbcFile) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "abc {}.{}: {} methods, {} classes, {} scripts",
        file.major_version,
        file.minor_version,
        file.methods.len(),
        file.instances.len(),
        file.scripts.len()
    );
    for anomaly in &file.anomalies {
        let _ = writeln!(out, "anomaly: {}", anomaly);
    }

    for (i, (inst, class)) in file.instances.iter().zip(&file.classes).enumerate() {
        let _ = writeln!(
            out,
            "\nclass {} {} extends {} (iinit #{}, cinit #{})",
            i,
            multiname(file, inst.name),
            multiname(file, inst.super_name),
            inst.init,
            class.init
        );
        for t in &inst.traits {
            write_trait(&mut out, file, t, "  ");
        }
        for t in &class.traits {
            write_trait(&mut out, file, t, "  static ");
        }
    }

    for (i, script) in file.scripts.iter().enumerate() {
        let _ = writeln!(out, "\nscript {} (init #{})", i, script.init);
        for t in &script.traits {
            write_trait(&mut out, file, t, "  ");
        }
    }

    for (i, method) in file.methods.iter().enumerate() {
        let Some(body) = &method.body else { continue };
        let _ = writeln!(
            out,
            "\nmethod #{} {:?} ({} params, max_stack {}, locals {})",
            i,
            file.string(method.name),
            method.param_count(),
            body.max_stack,
            body.local_count
        );
        out.push_str(&disassemble(file, &body.code));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::Opcode;
    use crate::abc::writer::{CodeBuilder, ProgramBuilder};

    #[test]
    fn test_dump_lists_methods() {
        let mut b = ProgramBuilder::new();
        let trace = b.qname("", "trace");
        let hello = b.string("hello");
        let mut c = CodeBuilder::new();
        c.op_u30(Opcode::FindPropStrict, trace)
            .op_u30(Opcode::PushString, hello)
            .op_u30_u30(Opcode::CallPropVoid, trace, 1)
            .op(Opcode::ReturnVoid);
        let init = b.method(0, 2, 1, c.finish());
        b.script(init, Vec::new());
        let file = b.finish();

        let text = dump(&file);
        assert!(text.contains("script 0 (init #0)"));
        assert!(text.contains("findpropstrict trace"));
        assert!(text.contains("pushstring \"hello\""));
        assert!(text.contains("callpropvoid trace (1 args)"));
        assert!(text.contains("returnvoid"));
    }
}
