//! Event loop ordering and host interaction.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use abcvm::abc::writer::{CodeBuilder, ProgramBuilder, traits};
use abcvm::abc::{AbcFile, Opcode};
use abcvm::config::RuntimeConfig;
use abcvm::vm::{Host, ObjRef, Object, Placement, VmHandle};

#[derive(Clone, Default)]
struct Output(Arc<Mutex<Vec<u8>>>);

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Output {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Records placements as `name:class:from_host`. Placing `hold` blocks
/// until the gate opens.
#[derive(Clone, Default)]
struct RecordingHost {
    log: Arc<Mutex<Vec<String>>>,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl RecordingHost {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn open_gate(&self) {
        let (open, cv) = &*self.gate;
        *open.lock().unwrap() = true;
        cv.notify_all();
    }
}

impl Host for RecordingHost {
    fn dictionary_lookup(&mut self, tag: u32) -> Option<ObjRef> {
        (tag == 7).then(|| {
            let base = Object::object();
            base.set_property("fromHost", Object::boolean(true));
            base
        })
    }

    fn placed(&mut self, _placed_by: u32, name: &str, instance: &ObjRef) {
        if name == "hold" {
            let (open, cv) = &*self.gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
        }
        self.log.lock().unwrap().push(format!(
            "{}:{}:{}",
            name,
            instance.class_name(),
            instance.has_property("fromHost")
        ));
    }
}

fn placement(name: &str) -> Option<Placement> {
    Some(Placement {
        parent: None,
        name: name.to_string(),
        placed_by: 1,
    })
}

/// Script 0 declares class `Ball` whose constructor sets `kind`; the entry
/// script installs `button` with a `click` handler tracing the event type.
fn program() -> AbcFile {
    let mut b = ProgramBuilder::new();
    let trace = b.qname("", "trace");
    let object = b.qname("", "Object");
    let ball = b.qname("", "Ball");
    let kind = b.qname("", "kind");
    let type_name = b.qname("", "type");
    let button = b.qname("", "button");
    let click = b.string("click");
    let round = b.string("round");

    let mut c = CodeBuilder::new();
    c.get_local(0)
        .op_u30(Opcode::PushString, round)
        .op_u30(Opcode::SetProperty, kind)
        .op(Opcode::ReturnVoid);
    let iinit = b.method(0, 2, 1, c.finish());
    let mut c = CodeBuilder::new();
    c.op(Opcode::ReturnVoid);
    let cinit = b.method(0, 1, 1, c.finish());
    let class = b.class(ball, object, iinit, Vec::new(), cinit, Vec::new());

    let mut c = CodeBuilder::new();
    c.get_local(0)
        .op(Opcode::PushScope)
        .op_u30(Opcode::GetScopeObject, 0)
        .op_u30(Opcode::GetLex, object)
        .op_u30(Opcode::NewClass, class)
        .op_u30(Opcode::InitProperty, ball)
        .op(Opcode::ReturnVoid);
    let declaring = b.method(0, 2, 1, c.finish());
    b.script(declaring, vec![traits::class(ball, 0, class)]);

    let mut c = CodeBuilder::new();
    c.op_u30(Opcode::FindPropStrict, trace)
        .get_local(1)
        .op_u30(Opcode::GetProperty, type_name)
        .op_u30_u30(Opcode::CallPropVoid, trace, 1)
        .op(Opcode::ReturnVoid);
    let handler = b.method(1, 3, 2, c.finish());

    let mut c = CodeBuilder::new();
    c.get_local(0)
        .op(Opcode::PushScope)
        .op_u30(Opcode::GetScopeObject, 0)
        .op_u30(Opcode::PushString, click)
        .op_u30(Opcode::NewFunction, handler)
        .op_u30(Opcode::NewObject, 1)
        .op_u30(Opcode::InitProperty, button)
        .op(Opcode::ReturnVoid);
    let entry = b.method(0, 4, 1, c.finish());
    b.script(entry, Vec::new());
    b.finish()
}

fn spawn(host: &RecordingHost, out: &Output) -> VmHandle {
    VmHandle::spawn(
        program(),
        RuntimeConfig::default(),
        Box::new(out.clone()),
        Box::new(host.clone()),
    )
    .unwrap()
}

#[test]
fn test_sync_orders_bindings() {
    let host = RecordingHost::default();
    let out = Output::default();
    let handle = spawn(&host, &out);

    handle.bind_class("Object", None, placement("first")).unwrap();
    handle.sync().unwrap();
    handle.bind_class("Object", None, placement("hold")).unwrap();
    // The first binding is complete; the second cannot have been applied.
    assert_eq!(host.log(), ["first::false"]);

    host.open_gate();
    handle.sync().unwrap();
    assert_eq!(host.log(), ["first::false", "hold::false"]);
    handle.shutdown().unwrap();
}

#[test]
fn test_bind_bytecode_class_on_host_object() {
    let host = RecordingHost::default();
    let out = Output::default();
    let handle = spawn(&host, &out);

    // Ball's declaring script has not run yet; binding defines it.
    handle.bind_class("Ball", Some(7), placement("ball")).unwrap();
    handle.bind_class("Ball", None, placement("plain")).unwrap();
    handle.sync().unwrap();
    assert_eq!(host.log(), ["ball:Ball:true", "plain:Ball:false"]);
    handle.shutdown().unwrap();
}

#[test]
fn test_unknown_class_binds_plain_object() {
    let host = RecordingHost::default();
    let out = Output::default();
    let handle = spawn(&host, &out);
    handle.bind_class("NoSuchClass", None, placement("ghost")).unwrap();
    handle.sync().unwrap();
    assert_eq!(host.log(), ["ghost::false"]);
    handle.shutdown().unwrap();
}

#[test]
fn test_dispatch_calls_handler() {
    let host = RecordingHost::default();
    let out = Output::default();
    let handle = spawn(&host, &out);

    handle.dispatch("button", "click").unwrap();
    // No handler: ignored.
    handle.dispatch("button", "rollOver").unwrap();
    // No target: ignored.
    handle.dispatch("missing", "click").unwrap();
    handle.sync().unwrap();
    assert_eq!(out.text(), "click\n");
    handle.shutdown().unwrap();
}

#[test]
fn test_drop_stops_worker() {
    let host = RecordingHost::default();
    let out = Output::default();
    let handle = spawn(&host, &out);
    handle.sync().unwrap();
    drop(handle);
}
