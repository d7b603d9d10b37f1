use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::rc::Rc;

use tracing::{debug, error, info, trace, warn};

use crate::abc::{AbcFile, MethodBody, Multiname};
use crate::config::RuntimeConfig;
use crate::jit::{self, CompiledMethod};
use crate::vm::builtins;
use crate::vm::frame::Frame;
use crate::vm::value::{Callable, Definable, ObjRef, Object};

/// Class registry entry for classes with no bytecode definition.
pub const BUILTIN_CLASS: i32 = -1;

/// The VM context. Owns the program, the global object and every compiled
/// method. Lives on the worker thread and is threaded through all helpers
/// via [`Frame::vm`].
pub struct Vm {
    abc: AbcFile,
    config: RuntimeConfig,
    global: ObjRef,
    /// Qualified class name to index into the class tables, or
    /// [`BUILTIN_CLASS`].
    valid_classes: RefCell<HashMap<String, i32>>,
    /// Compile-once cache keyed by method index. `None` marks a method
    /// whose compilation failed.
    compiled: RefCell<HashMap<u32, Option<Rc<CompiledMethod>>>>,
    compile_count: Cell<usize>,
    /// Script initializers that have started running.
    scripts_run: RefCell<HashSet<u32>>,
    output: RefCell<Box<dyn Write>>,
}

impl Vm {
    pub fn new(abc: AbcFile, config: RuntimeConfig) -> Self {
        Self::with_output(abc, config, Box::new(io::stdout()))
    }

    /// Create a VM whose `trace` output goes to `output`.
    pub fn with_output(abc: AbcFile, config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        let global = Object::object();
        global.set_class_name("Global");
        let valid_classes = abc
            .class_index
            .iter()
            .map(|(name, &index)| (name.clone(), index as i32))
            .collect();
        let vm = Self {
            abc,
            config,
            global,
            valid_classes: RefCell::new(valid_classes),
            compiled: RefCell::new(HashMap::new()),
            compile_count: Cell::new(0),
            scripts_run: RefCell::new(HashSet::new()),
            output: RefCell::new(output),
        };
        builtins::register(&vm);
        vm
    }

    pub fn abc(&self) -> &AbcFile {
        &self.abc
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn global(&self) -> &ObjRef {
        &self.global
    }

    /// Installs a builtin class binding into the global object.
    pub fn register_class(&self, name: &str, value: ObjRef) {
        self.global.set_property(name, value);
        self.valid_classes
            .borrow_mut()
            .insert(name.to_string(), BUILTIN_CLASS);
    }

    pub fn class_index(&self, name: &str) -> Option<i32> {
        self.valid_classes.borrow().get(name).copied()
    }

    pub fn write_output(&self, text: &str) {
        let mut out = self.output.borrow_mut();
        if let Err(e) = writeln!(out, "{}", text).and_then(|_| out.flush()) {
            warn!(error = %e, "failed to write output");
        }
    }

    /// Number of methods compiled so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count.get()
    }

    pub fn is_compiled(&self, method: u32) -> bool {
        matches!(self.compiled.borrow().get(&method), Some(Some(_)))
    }

    // ==================== Names ====================

    /// Resolves a multiname to a qualified-name string. Runtime-qualified
    /// kinds take their name (and namespace) components from the operand
    /// stack of `frame`.
    pub fn multiname_string(&self, index: u32, frame: Option<&mut Frame<'_>>) -> String {
        let pool = &self.abc.constant_pool;
        match pool.multiname(index) {
            Some(Multiname::Any) => String::new(),
            Some(&Multiname::QName { ns, name, .. }) => pool.qualify(ns, name),
            Some(&Multiname::Multiname { name, ns_set, .. }) => match pool.static_name(index) {
                Some(qualified) => qualified,
                None => {
                    let count = pool.ns_sets.get(ns_set as usize).map_or(0, |s| s.namespaces.len());
                    warn!(index, count, "multiname on namespace set not supported, using bare name");
                    pool.string(name).to_string()
                }
            },
            Some(&Multiname::RtqName { name, .. }) => {
                if let Some(frame) = frame {
                    frame.pop();
                }
                pool.string(name).to_string()
            }
            Some(Multiname::RtqNameL { .. }) => match frame {
                Some(frame) => {
                    let name = frame.pop().to_string();
                    frame.pop();
                    name
                }
                None => "<Invalid>".to_string(),
            },
            Some(Multiname::MultinameL { .. }) => match frame {
                Some(frame) => {
                    let name = frame.pop().to_string();
                    trace!(%name, "runtime name on namespace set, assuming public namespace");
                    name
                }
                None => "<Invalid>".to_string(),
            },
            None => {
                warn!(index, "multiname to string not implemented for this index");
                String::new()
            }
        }
    }

    // ==================== Compilation ====================

    /// Compiles `method` on first need. `None` for methods without a body
    /// and for methods whose compilation failed.
    pub fn compile(&self, method: u32) -> Option<Rc<CompiledMethod>> {
        self.compile_with(method, |body| jit::compile(body, method, self.config.jit_mode))
    }

    fn compile_with(
        &self,
        method: u32,
        compile: impl FnOnce(&MethodBody) -> jit::Result<CompiledMethod>,
    ) -> Option<Rc<CompiledMethod>> {
        if let Some(cached) = self.compiled.borrow().get(&method) {
            return cached.clone();
        }
        let Some(body) = self.abc.body(method) else {
            let name = self.abc.method(method).map(|m| self.abc.string(m.name)).unwrap_or("");
            debug!(method, name, "method should be intrinsic");
            return None;
        };
        match compile(body) {
            Ok(code) => {
                if self.config.trace_jit {
                    info!(
                        method,
                        backend = code.backend_name(),
                        blocks = code.block_count(),
                        steps = code.step_count(),
                        "compiled method"
                    );
                } else {
                    debug!(method, backend = code.backend_name(), "compiled method");
                }
                let code = Rc::new(code);
                self.compiled.borrow_mut().insert(method, Some(code.clone()));
                self.compile_count.set(self.compile_count.get() + 1);
                Some(code)
            }
            Err(e) => {
                error!(method, error = %e, "failed to compile method");
                self.compiled.borrow_mut().insert(method, None);
                None
            }
        }
    }

    // ==================== Invocation ====================

    /// Runs `method` with `this` in local 0 and `args` in the following
    /// locals.
    pub fn call_method(&self, method: u32, this: ObjRef, args: &[ObjRef]) -> ObjRef {
        let Some(code) = self.compile(method) else {
            return Object::undefined();
        };
        let Some(body) = self.abc.body(method) else {
            return Object::undefined();
        };
        let mut frame = Frame::new(self, method, body.max_stack, body.local_count, this, args);
        code.run(&mut frame);
        frame.result.take().unwrap_or_else(Object::undefined)
    }

    /// Invokes a function value. A captured closure receiver replaces
    /// `this`.
    pub fn call_function(&self, f: &ObjRef, this: &ObjRef, args: &[ObjRef]) -> ObjRef {
        let Some(func) = f.as_function() else {
            warn!(type_name = f.type_name(), "not implemented: calling a non-function");
            return Object::undefined();
        };
        let receiver = func.closure_this.borrow().clone().unwrap_or_else(|| this.clone());
        match func.callable {
            Callable::Method(m) => self.call_method(m, receiver, args),
            Callable::Native(native) => native(self, &receiver, args),
        }
    }

    // ==================== Deferred definitions ====================

    /// Runs the script initializer behind a placeholder against the global
    /// object. Each script initializer runs at most once.
    pub fn define(&self, definable: Definable) {
        if !self.mark_script_run(definable.init) {
            debug!(init = definable.init, "deferred initializer already ran");
            return;
        }
        debug!(init = definable.init, "running deferred initializer");
        self.call_method(definable.init, self.global.clone(), &[]);
        debug!(init = definable.init, "end of deferred initialization");
    }

    /// Records that a script initializer is about to run. `false` if it
    /// already has.
    pub fn mark_script_run(&self, init: u32) -> bool {
        self.scripts_run.borrow_mut().insert(init)
    }

    /// If `value` (read from `holder.name`) is a placeholder, runs its
    /// initializer and re-reads the property.
    pub fn resolve_deferred(&self, holder: &ObjRef, name: &str, value: ObjRef) -> ObjRef {
        let Some(definable) = value.as_definable() else {
            return value;
        };
        debug!(name, "deferred definition of property");
        self.define(definable);
        match holder.get_property(name) {
            Some(v) if v.as_definable().is_none() => v,
            _ => {
                warn!(name, "deferred property still not defined");
                Object::undefined()
            }
        }
    }
}
