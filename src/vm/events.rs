//! Event loop and script driver.
//!
//! One worker thread owns the [`Vm`] and every heap object. Other threads
//! talk to it only by posting [`Event`]s through a [`VmHandle`]; events
//! carry names and tags, never object references.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use crate::abc::AbcFile;
use crate::config::RuntimeConfig;
use crate::vm::traits::{build_named_class, build_traits};
use crate::vm::value::{Definable, ObjRef, Object};
use crate::vm::{Vm, VmError};

/// Where a bound class instance is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Global property holding the parent object; `None` for the global
    /// object itself.
    pub parent: Option<String>,
    /// Property name the instance is installed under.
    pub name: String,
    /// Host identifier of the placing object, echoed to [`Host::placed`].
    pub placed_by: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindClass {
    pub class_name: String,
    /// Dictionary tag of the host object used as the instance base.
    pub tag: Option<u32>,
    pub placement: Option<Placement>,
}

#[derive(Debug)]
pub enum Event {
    BindClass(BindClass),
    /// Calls the function stored under `event_type` on the global property
    /// `target`.
    Dispatch { target: String, event_type: String },
    /// Acknowledged once every earlier event has been handled.
    Sync(mpsc::SyncSender<()>),
    Shutdown,
}

/// Display-side collaborator. Called on the worker thread, synchronously,
/// from the bind-class handler; it must not call back into the VM.
pub trait Host: Send {
    /// Placeable object for a dictionary tag.
    fn dictionary_lookup(&mut self, tag: u32) -> Option<ObjRef>;

    /// A constructed instance was installed under `name`.
    fn placed(&mut self, placed_by: u32, name: &str, instance: &ObjRef);
}

/// Host with an empty dictionary that ignores placements.
pub struct NullHost;

impl Host for NullHost {
    fn dictionary_lookup(&mut self, _tag: u32) -> Option<ObjRef> {
        None
    }

    fn placed(&mut self, _placed_by: u32, _name: &str, _instance: &ObjRef) {}
}

/// FIFO event queue: many producers, one consumer.
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    /// Signalled once per posted event
    not_empty: Condvar,
    closed: AtomicBool,
    posted: AtomicUsize,
}

impl EventQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            closed: AtomicBool::new(false),
            posted: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an event. Returns it back if the queue is closed.
    pub fn post(&self, event: Event) -> Result<(), Event> {
        let mut queue = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(event);
        }
        queue.push_back(event);
        drop(queue);
        self.posted.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Next event, blocking while the queue is empty. `None` once the queue
    /// is closed and drained.
    pub fn recv(&self) -> Option<Event> {
        let mut queue = self.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            queue = self.not_empty.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.lock().pop_front()
    }

    /// Rejects further posts; queued events can still be received.
    pub fn close(&self) {
        // Under the lock: a post either lands before the close or fails.
        let _queue = self.lock();
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events accepted so far.
    pub fn posted(&self) -> usize {
        self.posted.load(Ordering::Relaxed)
    }
}

/// Runs every script but the last as deferred declarations, then the last
/// one as the entry point.
pub fn run_scripts(vm: &Vm) -> Result<(), VmError> {
    let Some((entry, rest)) = vm.abc().scripts.split_last() else {
        return Err(VmError::NoScripts);
    };
    let global = vm.global();

    for (i, script) in rest.iter().enumerate() {
        debug!(script = i, traits = script.traits.len(), "building script traits");
        build_traits(vm, global, &script.traits, None);
        vm.compile(script.init);
        // Hoisted declarations now resolve by running this initializer.
        build_traits(vm, global, &script.traits, Some(Definable { init: script.init }));
    }

    debug!(traits = entry.traits.len(), "building entry script traits");
    build_traits(vm, global, &entry.traits, None);
    vm.compile(entry.init);
    build_traits(vm, global, &entry.traits, None);
    vm.mark_script_run(entry.init);
    info!(init = entry.init, "running entry point");
    vm.call_method(entry.init, global.clone(), &[]);
    debug!("end of entry point");
    Ok(())
}

/// Handles one event. Returns `false` when the loop should stop.
pub fn handle_event(vm: &Vm, host: &mut dyn Host, event: Event) -> bool {
    match event {
        Event::BindClass(bind) => bind_class(vm, host, bind),
        Event::Dispatch { target, event_type } => dispatch(vm, &target, &event_type),
        Event::Sync(ack) => {
            trace!("sync");
            // The waiter may have gone away; nothing to do then.
            let _ = ack.send(());
        }
        Event::Shutdown => {
            debug!("shutdown requested");
            return false;
        }
    }
    true
}

fn bind_class(vm: &Vm, host: &mut dyn Host, bind: BindClass) {
    debug!(class = %bind.class_name, "bind class");
    let base = match bind.tag {
        Some(tag) => host.dictionary_lookup(tag).unwrap_or_else(|| {
            warn!(tag, "dictionary tag not found, using a plain object");
            Object::object()
        }),
        None => Object::object(),
    };
    let instance = build_named_class(vm, &bind.class_name, base, &[Object::null()]);

    let Some(placement) = bind.placement else { return };
    let parent = match &placement.parent {
        None => vm.global().clone(),
        Some(name) => match vm.global().get_property(name) {
            Some(p) => p,
            None => {
                error!(parent = %name, "placement parent not found");
                return;
            }
        },
    };
    parent.set_property(&placement.name, instance.clone());
    host.placed(placement.placed_by, &placement.name, &instance);
}

fn dispatch(vm: &Vm, target: &str, event_type: &str) {
    let Some(obj) = vm.global().get_property(target) else {
        warn!(target, event_type, "event target not found");
        return;
    };
    let Some(handler) = obj.get_property(event_type).filter(|h| h.as_function().is_some()) else {
        debug!(target, event_type, "no handler for event");
        return;
    };
    let event = Object::object();
    event.set_class_name("flash.events.Event");
    event.set_property("type", Object::string(event_type));
    vm.call_function(&handler, &obj, &[event]);
}

/// Runs the scripts, then drains `queue` until shutdown.
pub fn run(vm: &Vm, queue: &EventQueue, host: &mut dyn Host) {
    if let Err(e) = run_scripts(vm) {
        error!(error = %e, "failed to run scripts");
    }
    while let Some(event) = queue.recv() {
        if !handle_event(vm, host, event) {
            break;
        }
    }
}

/// Closes the queue when the worker exits, dropping pending events so that
/// sync waiters wake up.
struct CloseOnExit(Arc<EventQueue>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
        while self.0.try_recv().is_some() {}
    }
}

/// Owner of the VM worker thread.
pub struct VmHandle {
    queue: Arc<EventQueue>,
    worker: Option<JoinHandle<()>>,
}

impl VmHandle {
    /// Starts the worker: the VM is created on it, runs the scripts and
    /// then serves events.
    pub fn spawn(
        abc: AbcFile,
        config: RuntimeConfig,
        output: Box<dyn Write + Send>,
        mut host: Box<dyn Host>,
    ) -> Result<Self, VmError> {
        if abc.scripts.is_empty() {
            return Err(VmError::NoScripts);
        }
        let queue = EventQueue::new();
        let worker_queue = queue.clone();
        let worker = thread::Builder::new()
            .name("abcvm".to_string())
            .spawn(move || {
                let _close = CloseOnExit(worker_queue.clone());
                let vm = Vm::with_output(abc, config, output);
                run(&vm, &worker_queue, host.as_mut());
            })
            .map_err(VmError::Spawn)?;
        Ok(Self {
            queue,
            worker: Some(worker),
        })
    }

    pub fn post(&self, event: Event) -> Result<(), VmError> {
        self.queue.post(event).map_err(|_| VmError::WorkerGone)
    }

    pub fn bind_class(
        &self,
        class_name: &str,
        tag: Option<u32>,
        placement: Option<Placement>,
    ) -> Result<(), VmError> {
        self.post(Event::BindClass(BindClass {
            class_name: class_name.to_string(),
            tag,
            placement,
        }))
    }

    pub fn dispatch(&self, target: &str, event_type: &str) -> Result<(), VmError> {
        self.post(Event::Dispatch {
            target: target.to_string(),
            event_type: event_type.to_string(),
        })
    }

    /// Blocks until the worker has handled every event posted before this
    /// call.
    pub fn sync(&self) -> Result<(), VmError> {
        let (ack, done) = mpsc::sync_channel(1);
        self.post(Event::Sync(ack))?;
        done.recv().map_err(|_| VmError::WorkerGone)
    }

    /// Posts shutdown and joins the worker.
    pub fn shutdown(mut self) -> Result<(), VmError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), VmError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // A closed queue means the worker already finished.
        let _ = self.queue.post(Event::Shutdown);
        worker.join().map_err(|_| VmError::WorkerPanicked)
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "VM worker did not stop cleanly");
        }
    }
}
