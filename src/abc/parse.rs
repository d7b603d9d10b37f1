//! Document grammar for the ABC container.

use tracing::debug;

use super::reader::Reader;
use super::{
    AbcFile, Anomaly, ClassInfo, ConstantPool, ExceptionInfo, InstanceInfo, Metadata,
    MethodBody, MethodInfo, MethodTrait, Multiname, Namespace, NsSet, OptionDetail, ParseError,
    Result, ScriptInfo, SlotTrait, Trait, TraitKind, const_kind, instance_flags, method_flags,
    mn_kind, ns_kind, trait_attr,
};

/// Parses a complete ABC document.
pub fn parse(data: &[u8]) -> Result<AbcFile> {
    let mut r = Reader::new(data);
    let minor_version = r.read_u16()?;
    let major_version = r.read_u16()?;
    debug!(major_version, minor_version, "parsing abc");

    let constant_pool = read_constant_pool(&mut r)?;

    let method_count = r.read_u30()?;
    let mut methods = Vec::with_capacity(r.capacity_for(method_count as usize));
    for _ in 0..method_count {
        methods.push(read_method(&mut r)?);
    }

    let metadata_count = r.read_u30()?;
    let mut metadata = Vec::with_capacity(r.capacity_for(metadata_count as usize));
    for _ in 0..metadata_count {
        let name = r.read_u30()?;
        let item_count = r.read_u30()?;
        let mut items = Vec::with_capacity(r.capacity_for(item_count as usize));
        for _ in 0..item_count {
            let key = r.read_u30()?;
            items.push((key, r.read_u30()?));
        }
        metadata.push(Metadata { name, items });
    }

    let class_count = r.read_u30()?;
    let mut instances = Vec::with_capacity(r.capacity_for(class_count as usize));
    for _ in 0..class_count {
        instances.push(read_instance(&mut r)?);
    }
    let mut classes = Vec::with_capacity(r.capacity_for(class_count as usize));
    for _ in 0..class_count {
        let init = r.read_u30()?;
        classes.push(ClassInfo { init, traits: read_traits(&mut r)? });
    }

    let script_count = r.read_u30()?;
    let mut scripts = Vec::with_capacity(r.capacity_for(script_count as usize));
    for _ in 0..script_count {
        let init = r.read_u30()?;
        scripts.push(ScriptInfo { init, traits: read_traits(&mut r)? });
    }

    let body_count = r.read_u30()?;
    for index in 0..body_count as usize {
        let (method, body) = read_body(&mut r)?;
        match methods.get_mut(method as usize) {
            None => r.note(Anomaly::BodyMethodOutOfRange { body: index, method }),
            Some(info) if info.body.is_some() => r.note(Anomaly::DuplicateBody { method }),
            Some(info) => info.body = Some(body),
        }
    }

    let mut file = AbcFile {
        minor_version,
        major_version,
        constant_pool,
        methods,
        metadata,
        instances,
        classes,
        scripts,
        class_index: Default::default(),
        anomalies: r.take_anomalies(),
    };
    file.index_classes();
    Ok(file)
}

/// Reads a 1-based table: a count, then `count - 1` entries.
fn read_table<T>(
    r: &mut Reader<'_>,
    placeholder: T,
    mut read: impl FnMut(&mut Reader<'_>, usize) -> Result<T>,
) -> Result<Vec<T>> {
    let count = r.read_u30()? as usize;
    let mut table = Vec::with_capacity(r.capacity_for(count).max(1));
    table.push(placeholder);
    for index in 1..count {
        table.push(read(r, index)?);
    }
    Ok(table)
}

fn read_constant_pool(r: &mut Reader<'_>) -> Result<ConstantPool> {
    let integers = read_table(r, 0, |r, _| r.read_s32())?;
    let uintegers = read_table(r, 0, |r, _| r.read_u32())?;
    let doubles = read_table(r, f64::NAN, |r, _| r.read_d64())?;
    let strings = read_table(r, String::new(), |r, _| r.read_string())?;
    let namespaces = read_table(r, Namespace { kind: 0, name: 0 }, |r, index| {
        let kind = r.read_u8()?;
        if !ns_kind::is_known(kind) {
            r.note(Anomaly::UnknownNamespaceKind { index, kind });
        }
        Ok(Namespace { kind, name: r.read_u30()? })
    })?;
    let ns_sets = read_table(r, NsSet::default(), |r, index| {
        let count = r.read_u30()?;
        if count == 0 {
            r.note(Anomaly::EmptyNamespaceSet { index });
        }
        let mut namespaces = Vec::with_capacity(r.capacity_for(count as usize));
        for _ in 0..count {
            namespaces.push(r.read_u30()?);
        }
        Ok(NsSet { namespaces })
    })?;
    let multinames = read_table(r, Multiname::Any, read_multiname)?;

    Ok(ConstantPool {
        integers,
        uintegers,
        doubles,
        strings,
        namespaces,
        ns_sets,
        multinames,
    })
}

fn read_multiname(r: &mut Reader<'_>, index: usize) -> Result<Multiname> {
    use mn_kind::*;
    let kind = r.read_u8()?;
    let mn = match kind {
        QNAME | QNAME_A => {
            let ns = r.read_u30()?;
            let name = r.read_u30()?;
            Multiname::QName { ns, name, attribute: kind == QNAME_A }
        }
        RTQNAME | RTQNAME_A => Multiname::RtqName {
            name: r.read_u30()?,
            attribute: kind == RTQNAME_A,
        },
        RTQNAME_L | RTQNAME_LA => Multiname::RtqNameL { attribute: kind == RTQNAME_LA },
        MULTINAME | MULTINAME_A => {
            let name = r.read_u30()?;
            let ns_set = r.read_u30()?;
            Multiname::Multiname { name, ns_set, attribute: kind == MULTINAME_A }
        }
        MULTINAME_L | MULTINAME_LA => Multiname::MultinameL {
            ns_set: r.read_u30()?,
            attribute: kind == MULTINAME_LA,
        },
        _ => return Err(ParseError::UnknownMultinameKind { index, kind }),
    };
    Ok(mn)
}

fn read_method(r: &mut Reader<'_>) -> Result<MethodInfo> {
    let param_count = r.read_u30()?;
    let return_type = r.read_u30()?;
    let mut param_types = Vec::with_capacity(r.capacity_for(param_count as usize));
    for _ in 0..param_count {
        param_types.push(r.read_u30()?);
    }
    let name = r.read_u30()?;
    let flags = r.read_u8()?;

    let mut options = Vec::new();
    if flags & method_flags::HAS_OPTIONAL != 0 {
        let option_count = r.read_u30()?;
        for _ in 0..option_count {
            let value = r.read_u30()?;
            let kind = r.read_u8()?;
            if !const_kind::is_known(kind) {
                r.note(Anomaly::UnknownConstantKind { kind });
            }
            options.push(OptionDetail { value, kind });
        }
    }

    let mut param_names = Vec::new();
    if flags & method_flags::HAS_PARAM_NAMES != 0 {
        for _ in 0..param_count {
            param_names.push(r.read_u30()?);
        }
    }

    Ok(MethodInfo {
        param_types,
        return_type,
        name,
        flags,
        options,
        param_names,
        body: None,
    })
}

fn read_instance(r: &mut Reader<'_>) -> Result<InstanceInfo> {
    let name = r.read_u30()?;
    let super_name = r.read_u30()?;
    let flags = r.read_u8()?;
    let protected_ns = if flags & instance_flags::PROTECTED_NS != 0 {
        Some(r.read_u30()?)
    } else {
        None
    };
    let interface_count = r.read_u30()?;
    let mut interfaces = Vec::with_capacity(r.capacity_for(interface_count as usize));
    for _ in 0..interface_count {
        interfaces.push(r.read_u30()?);
    }
    let init = r.read_u30()?;
    Ok(InstanceInfo {
        name,
        super_name,
        flags,
        protected_ns,
        interfaces,
        init,
        traits: read_traits(r)?,
    })
}

fn read_slot(r: &mut Reader<'_>) -> Result<SlotTrait> {
    let slot_id = r.read_u30()?;
    let type_name = r.read_u30()?;
    let vindex = r.read_u30()?;
    let vkind = if vindex != 0 { r.read_u8()? } else { 0 };
    Ok(SlotTrait { slot_id, type_name, vindex, vkind })
}

fn read_method_trait(r: &mut Reader<'_>) -> Result<MethodTrait> {
    let disp_id = r.read_u30()?;
    Ok(MethodTrait { disp_id, method: r.read_u30()? })
}

fn read_traits(r: &mut Reader<'_>) -> Result<Vec<Trait>> {
    let count = r.read_u30()?;
    let mut traits = Vec::with_capacity(r.capacity_for(count as usize));
    for _ in 0..count {
        let name = r.read_u30()?;
        let offset = r.position();
        let kind_byte = r.read_u8()?;
        let attributes = kind_byte >> 4;
        let kind = match kind_byte & 0x0f {
            TraitKind::SLOT => TraitKind::Slot(read_slot(r)?),
            TraitKind::CONST => TraitKind::Const(read_slot(r)?),
            TraitKind::METHOD => TraitKind::Method(read_method_trait(r)?),
            TraitKind::GETTER => TraitKind::Getter(read_method_trait(r)?),
            TraitKind::SETTER => TraitKind::Setter(read_method_trait(r)?),
            TraitKind::CLASS => {
                let slot_id = r.read_u30()?;
                TraitKind::Class { slot_id, class: r.read_u30()? }
            }
            TraitKind::FUNCTION => {
                let slot_id = r.read_u30()?;
                TraitKind::Function { slot_id, function: r.read_u30()? }
            }
            kind => return Err(ParseError::UnknownTraitKind { offset, kind }),
        };
        let mut metadata = Vec::new();
        if attributes & trait_attr::METADATA != 0 {
            let metadata_count = r.read_u30()?;
            for _ in 0..metadata_count {
                metadata.push(r.read_u30()?);
            }
        }
        traits.push(Trait { name, kind, attributes, metadata });
    }
    Ok(traits)
}

fn read_body(r: &mut Reader<'_>) -> Result<(u32, MethodBody)> {
    let method = r.read_u30()?;
    let max_stack = r.read_u30()?;
    let local_count = r.read_u30()?;
    let init_scope_depth = r.read_u30()?;
    let max_scope_depth = r.read_u30()?;
    let code_length = r.read_u30()? as usize;
    let code = r.read_bytes(code_length)?.to_vec();
    let exception_count = r.read_u30()?;
    let mut exceptions = Vec::with_capacity(r.capacity_for(exception_count as usize));
    for _ in 0..exception_count {
        exceptions.push(ExceptionInfo {
            from: r.read_u30()?,
            to: r.read_u30()?,
            target: r.read_u30()?,
            exc_type: r.read_u30()?,
            var_name: r.read_u30()?,
        });
    }
    let traits = read_traits(r)?;
    Ok((
        method,
        MethodBody {
            max_stack,
            local_count,
            init_scope_depth,
            max_scope_depth,
            code,
            exceptions,
            traits,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::opcode::Opcode;
    use crate::abc::writer::{self, CodeBuilder, ProgramBuilder, Writer};

    fn sample() -> AbcFile {
        let mut b = ProgramBuilder::new();
        let name = b.qname("pkg", "Widget");
        let object = b.qname("", "Object");
        let size = b.qname("", "size");
        b.int(-42);
        b.uint(7);
        b.double(2.5);
        let mut c = CodeBuilder::new();
        c.op(Opcode::ReturnVoid);
        let init = b.method(0, 1, 1, c.finish());
        let cinit = b.method(0, 1, 1, vec![Opcode::ReturnVoid as u8]);
        let class = b.class(
            name,
            object,
            init,
            vec![writer::traits::slot(size, 1)],
            cinit,
            Vec::new(),
        );
        let sinit = b.method(0, 2, 1, vec![Opcode::ReturnVoid as u8]);
        b.script(sinit, vec![writer::traits::class(name, 1, class)]);
        b.finish()
    }

    #[test]
    fn test_parse_encoded_program() {
        let original = sample();
        let bytes = writer::encode(&original);
        let file = parse(&bytes).unwrap();

        assert!(file.anomalies.is_empty(), "{:?}", file.anomalies);
        assert_eq!(file.major_version, 46);
        assert_eq!(file.constant_pool.integers, vec![0, -42]);
        assert_eq!(file.constant_pool.uintegers, vec![0, 7]);
        assert_eq!(file.constant_pool.doubles[1], 2.5);
        assert_eq!(file.constant_pool.strings, original.constant_pool.strings);
        assert_eq!(file.constant_pool.multinames, original.constant_pool.multinames);
        assert_eq!(file.methods.len(), 3);
        assert!(file.methods.iter().all(|m| m.body.is_some()));
        assert_eq!(file.instances[0].traits, original.instances[0].traits);
        assert_eq!(file.scripts[0].traits, original.scripts[0].traits);
        assert_eq!(file.class_by_name("pkg.Widget"), Some(0));
    }

    #[test]
    fn test_param_names_and_options() {
        let mut b = ProgramBuilder::new();
        let x = b.string("x");
        let mut file = b.finish();
        file.methods.push(MethodInfo {
            param_types: vec![0, 0],
            options: vec![OptionDetail { value: 0, kind: const_kind::NULL }],
            param_names: vec![x, x],
            ..MethodInfo::default()
        });
        let parsed = parse(&writer::encode(&file)).unwrap();
        let m = &parsed.methods[0];
        assert_eq!(m.param_names, vec![x, x]);
        assert_eq!(m.options, vec![OptionDetail { value: 0, kind: const_kind::NULL }]);
        assert!(parsed.anomalies.is_empty());
    }

    #[test]
    fn test_duplicate_body_is_anomaly() {
        let file = sample();
        let mut bytes = writer::encode(&file);
        // Append a second body for method 0 and bump the body count by
        // re-encoding the tail by hand.
        let mut tail = Writer::new();
        tail.write_u30(0);
        for field in [9u32, 1, 0, 1] {
            tail.write_u30(field);
        }
        tail.write_u30(1);
        tail.write_u8(Opcode::ReturnVoid as u8);
        tail.write_u30(0);
        tail.write_u30(0);

        // The body count (3) is a single byte; locate it by re-encoding
        // everything before the bodies.
        let mut no_bodies = file.clone();
        for m in &mut no_bodies.methods {
            m.body = None;
        }
        let prefix = writer::encode(&no_bodies);
        let count_at = prefix.len() - 1;
        assert_eq!(bytes[count_at], 3);
        bytes[count_at] = 4;
        bytes.extend_from_slice(&tail.into_bytes());

        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.anomalies, vec![Anomaly::DuplicateBody { method: 0 }]);
        assert_eq!(parsed.methods[0].body.as_ref().unwrap().max_stack, 1);
    }

    #[test]
    fn test_unknown_multiname_kind_is_fatal() {
        let mut w = Writer::new();
        w.write_u16(16);
        w.write_u16(46);
        for _ in 0..6 {
            w.write_u30(0);
        }
        w.write_u30(2);
        w.write_u8(0x42);
        assert_eq!(
            parse(&w.into_bytes()).unwrap_err(),
            ParseError::UnknownMultinameKind { index: 1, kind: 0x42 }
        );
    }

    #[test]
    fn test_namespace_anomalies() {
        let mut w = Writer::new();
        w.write_u16(16);
        w.write_u16(46);
        for _ in 0..4 {
            w.write_u30(0);
        }
        w.write_u30(2);
        w.write_u8(0x33);
        w.write_u30(0);
        w.write_u30(2);
        w.write_u30(0);
        w.write_u30(0);
        for _ in 0..5 {
            w.write_u30(0);
        }
        let file = parse(&w.into_bytes()).unwrap();
        assert_eq!(
            file.anomalies,
            vec![
                Anomaly::UnknownNamespaceKind { index: 1, kind: 0x33 },
                Anomaly::EmptyNamespaceSet { index: 1 },
            ]
        );
    }

    #[test]
    fn test_truncated_document() {
        let bytes = writer::encode(&sample());
        let err = parse(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_huge_count_is_eof_not_allocation() {
        // Empty constant pool, then a method count of 2^32 - 1.
        let bytes = [0x10, 0, 0x2e, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0x0f];
        let err = parse(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_huge_table_count_is_eof() {
        // Integer table claiming a billion entries.
        let bytes = [0x10, 0, 0x2e, 0, 0xff, 0xff, 0xff, 0xff, 0x03, 0x01];
        assert!(matches!(parse(&bytes), Err(ParseError::UnexpectedEof { .. })));
    }
}
