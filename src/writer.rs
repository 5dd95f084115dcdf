use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::encode::SerializeFn;
use crate::persist::{self, Persister, PersisterHandle};
use crate::queue::{self, Cmd};
use crate::value::Value;
use crate::Error;

/// Host factory for an opaque per-thread identifier.
pub type ThreadIdFn = Box<dyn Fn() -> Value + Send>;

/// Gate checked before the writer starts recording; dropped after the first
/// true result.
pub type EnableFn = Box<dyn Fn() -> bool + Send>;

pub struct WriterOptions {
    pub thread_id: Option<ThreadIdFn>,
    pub verbose: bool,
    pub enable_when: Option<EnableFn>,
    pub preamble: Option<Value>,
    pub magic_markers: bool,
    pub queue_capacity: usize,
    pub backpressure_timeout: Option<Duration>,
}

impl Default for WriterOptions {
    fn default() -> WriterOptions {
        WriterOptions {
            thread_id: None,
            verbose: false,
            enable_when: None,
            preamble: None,
            magic_markers: false,
            queue_capacity: 65536,
            backpressure_timeout: None,
        }
    }
}

// Live writers, notified when a bound host value is reclaimed. One lock
// guards registration and notification.
static REGISTRY: Mutex<Vec<Weak<WriterInner>>> = Mutex::new(Vec::new());

/// Notify every live writer that a bound host value has been reclaimed.
/// Writers holding a binding for it enqueue a `BINDING_DELETE` record.
/// Hosts call this from the value's drop path.
pub fn object_freed(value: &Value) {
    let id = match value.identity() {
        Some(id) => id,
        None => return,
    };
    let mut registry = REGISTRY.lock().unwrap();
    registry.retain(|weak| weak.strong_count() > 0);
    for weak in registry.iter() {
        if let Some(inner) = weak.upgrade() {
            inner.notify_freed(id, value);
        }
    }
}

struct State {
    persister: Option<PersisterHandle>,
    next_handle: u32,
    threads: HashMap<ThreadId, u32>,
    last_thread: Option<ThreadId>,
    thread_id: Option<ThreadIdFn>,
    enable_when: Option<EnableFn>,
    backpressure_timeout: Option<Duration>,
    /// Identities bound through this writer; mirrors the drain-side binding
    /// table so `ext_bind` preconditions fail on the calling thread.
    bound: HashSet<usize>,
}

pub(crate) struct WriterInner {
    state: Mutex<State>,
    verbose: bool,
    messages_written: AtomicU64,
    dropped: AtomicU64,
    bytes_written: Arc<AtomicU64>,
}

impl WriterInner {
    /// False while the writer is disabled (no persister) or gated.
    fn enabled(&self, state: &mut State) -> bool {
        if state.persister.is_none() {
            return false;
        }
        if let Some(gate) = &state.enable_when {
            if !gate() {
                return false;
            }
            state.enable_when = None;
        }
        true
    }

    fn push(&self, state: &State, entry: u64) {
        if let Some(persister) = &state.persister {
            if !persister.producer.push(entry, None) {
                queue::reclaim(entry);
            }
        } else {
            queue::reclaim(entry);
        }
    }

    fn push_value(&self, state: &State, value: Value) {
        self.push(state, queue::obj_entry(Arc::new(value)));
    }

    /// One top-level message: the value followed by a boundary. A full queue
    /// blocks, unless a backpressure timeout is set, in which case expiry
    /// counts the message into the drop counter instead.
    fn push_root(&self, state: &State, value: &Value) {
        self.flush_dropped(state);

        if self.verbose {
            debug!("ObjectWriter[{}] -- {:?}", self.messages_written.load(Ordering::Relaxed), value);
        }

        let persister = match &state.persister {
            Some(persister) => persister,
            None => return,
        };
        let entry = queue::obj_entry(Arc::new(value.clone()));
        if !persister.producer.push(entry, state.backpressure_timeout) {
            queue::reclaim(entry);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        self.push(state, queue::cmd_entry(Cmd::MessageBoundary, 0));
    }

    /// Emit `DROPPED(n)` ahead of the next message once enqueueing works
    /// again.
    fn flush_dropped(&self, state: &State) {
        let count = self.dropped.swap(0, Ordering::Relaxed);
        if count == 0 {
            return;
        }
        let persister = match &state.persister {
            Some(persister) => persister,
            None => return,
        };
        let clamped = count.min(u32::MAX as u64) as u32;
        let entry = queue::cmd_entry(Cmd::Dropped, clamped);
        if !persister.producer.push(entry, state.backpressure_timeout) {
            self.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Allocate a handle slot for `value` without constructing a token.
    fn raw_handle(&self, state: &mut State, value: &Value) -> u32 {
        if self.verbose {
            debug!(
                "ObjectWriter[{}] -- NEW_HANDLE({:?})",
                self.messages_written.load(Ordering::Relaxed),
                value
            );
        }
        self.push(state, queue::cmd_entry(Cmd::NewHandle, 0));
        self.push_value(state, value.clone());
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        let index = state.next_handle;
        state.next_handle += 1;
        index
    }

    /// Emit `THREAD_SWITCH` when the calling thread changed since the last
    /// write, allocating a handle for the new thread's id on first sight.
    fn check_thread(&self, state: &mut State) {
        if state.thread_id.is_none() {
            return;
        }
        let current = thread::current().id();
        if state.last_thread == Some(current) {
            return;
        }
        state.last_thread = Some(current);

        let index = match state.threads.get(&current).copied() {
            Some(index) => index,
            None => {
                let id_value = (state.thread_id.as_ref().unwrap())();
                let index = self.raw_handle(state, &id_value);
                state.threads.insert(current, index);
                index
            }
        };

        if self.verbose {
            debug!(
                "ObjectWriter[{}] -- THREAD_SWITCH({})",
                self.messages_written.load(Ordering::Relaxed),
                index
            );
        }
        self.push(state, queue::cmd_entry(Cmd::ThreadSwitch, 0));
        self.push_value(state, Value::HandleRef(index));
        self.messages_written.fetch_add(1, Ordering::Relaxed);
    }

    fn write_delete(&self, state: &mut State, index: u32) {
        if state.persister.is_none() {
            return;
        }
        let delta = state.next_handle - index;
        debug_assert!(delta > 0);
        if self.verbose {
            debug!(
                "ObjectWriter[{}] -- DELETE({})",
                self.messages_written.load(Ordering::Relaxed),
                index
            );
        }
        self.push(state, queue::cmd_entry(Cmd::HandleDelete, delta - 1));
        self.messages_written.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_freed(&self, id: usize, value: &Value) {
        let mut state = self.state.lock().unwrap();
        if !state.bound.remove(&id) {
            return;
        }
        if state.persister.is_none() {
            return;
        }
        self.push(&state, queue::cmd_entry(Cmd::BindingDelete, 0));
        self.push_value(&state, value.clone());
    }
}

/// Record-side entry point. One thread at a time may write; the producer
/// state sits behind a mutex and the persister's drain thread is the sole
/// queue consumer.
pub struct Writer {
    inner: Arc<WriterInner>,
}

impl Writer {
    /// A writer without a persister is a no-op: every operation succeeds and
    /// nothing reaches any sink, though handle ids still allocate.
    pub fn new(
        persister: Option<Persister>,
        serialize: SerializeFn,
        options: WriterOptions,
    ) -> Result<Writer, Error> {
        let handle = match persister {
            Some(persister) => Some(persist::setup(
                persister,
                serialize,
                options.magic_markers,
                options.verbose,
                options.queue_capacity,
            )?),
            None => None,
        };
        let bytes_written = handle
            .as_ref()
            .map(|handle| handle.bytes_written.clone())
            .unwrap_or_default();

        let inner = Arc::new(WriterInner {
            state: Mutex::new(State {
                persister: handle,
                next_handle: 0,
                threads: HashMap::new(),
                last_thread: None,
                thread_id: options.thread_id,
                enable_when: options.enable_when,
                backpressure_timeout: options.backpressure_timeout,
                bound: HashSet::new(),
            }),
            verbose: options.verbose,
            messages_written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            bytes_written,
        });
        REGISTRY.lock().unwrap().push(Arc::downgrade(&inner));

        if let Some(preamble) = &options.preamble {
            let state = inner.state.lock().unwrap();
            if state.persister.is_some() {
                inner.push_root(&state, preamble);
                inner.push(&state, queue::cmd_entry(Cmd::Flush, 0));
            }
        }

        Ok(Writer { inner })
    }

    /// Record each value as one top-level message.
    pub fn write(&self, values: &[Value]) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled(&mut state) {
            return Ok(());
        }
        self.inner.check_thread(&mut state);
        for value in values {
            self.inner.push_root(&state, value);
        }
        Ok(())
    }

    /// Give `value` a stable identity on the wire. The returned token emits
    /// `HANDLE_REF` records when called and `HANDLE_DELETE` when dropped.
    pub fn handle(&self, value: &Value) -> StreamHandle {
        let mut state = self.inner.state.lock().unwrap();
        let index = if self.inner.enabled(&mut state) {
            self.inner.raw_handle(&mut state, value)
        } else {
            let index = state.next_handle;
            state.next_handle += 1;
            index
        };
        StreamHandle {
            inner: self.inner.clone(),
            index,
            value: value.clone(),
        }
    }

    /// Register `value` as the next binding; the reader supplies the
    /// corresponding value out of band through its own `bind`.
    pub fn bind(&self, value: &Value) -> Result<(), Error> {
        let id = value.identity().ok_or_else(|| {
            Error::BindError(format!("{} values carry no identity", value.type_name()))
        })?;
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled(&mut state) {
            return Ok(());
        }
        if !state.bound.insert(id) {
            return Err(Error::BindError(format!(
                "<{} object at {:#x}> already bound",
                value.type_name(),
                id
            )));
        }
        self.inner.check_thread(&mut state);
        if self.inner.verbose {
            debug!("ObjectWriter -- BIND({})", value.type_name());
        }
        self.inner.push(&state, queue::cmd_entry(Cmd::Bind, 0));
        self.inner.push_value(&state, value.clone());
        self.inner.messages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Self-describing binding: requires the value's type to be bound
    /// already, and records the type so the reader can reconstruct the value
    /// with the type's zero-argument constructor.
    pub fn ext_bind(&self, value: &Value) -> Result<(), Error> {
        let opaque = match value {
            Value::Opaque(opaque) => opaque.clone(),
            _ => {
                return Err(Error::BindError(format!(
                    "ext_bind requires a host object, not {}",
                    value.type_name()
                )))
            }
        };
        let typ = Value::Type(opaque.kind().clone());
        let typ_id = typ.identity().unwrap();
        let id = value.identity().unwrap();

        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled(&mut state) {
            return Ok(());
        }
        if state.bound.contains(&id) {
            return Err(Error::BindError(format!(
                "<{} object at {:#x}> already bound",
                opaque.kind().name(),
                id
            )));
        }
        if !state.bound.contains(&typ_id) {
            return Err(Error::BindError(format!(
                "to externally bind a {0} object, type {0} must be bound first",
                opaque.kind().name()
            )));
        }
        state.bound.insert(id);
        self.inner.check_thread(&mut state);
        if self.inner.verbose {
            debug!("ObjectWriter -- EXT_BIND({})", opaque.kind().name());
        }
        self.inner.push(&state, queue::cmd_entry(Cmd::ExtBind, 0));
        self.inner.push_value(&state, value.clone());
        self.inner.push_value(&state, typ);
        self.inner.messages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Transport an incremental stack-trace change: drop `to_drop` frames,
    /// then push the given `(filename, line)` frames.
    pub fn write_stack(&self, to_drop: u64, frames: &[(Arc<str>, u16)]) -> Result<(), Error> {
        if to_drop > u32::MAX as u64 {
            return Err(Error::Overflow(format!("stack drop count {}", to_drop)));
        }
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled(&mut state) {
            return Ok(());
        }
        self.inner.check_thread(&mut state);
        let frames_value = Value::List(
            frames
                .iter()
                .map(|(filename, line)| {
                    Value::Tuple(vec![Value::Str(filename.clone()), Value::Int(*line as i64)])
                })
                .collect(),
        );
        self.inner.push(&state, queue::cmd_entry(Cmd::Stack, to_drop as u32));
        self.inner.push_value(&state, frames_value);
        self.inner.messages_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the persister to seal and submit the current buffer slot.
    pub fn flush(&self) {
        let state = self.inner.state.lock().unwrap();
        if state.persister.is_some() {
            self.inner.push(&state, queue::cmd_entry(Cmd::Flush, 0));
        }
    }

    /// Payload bytes the persister has written to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn messages_written(&self) -> u64 {
        self.inner.messages_written.load(Ordering::Relaxed)
    }

    /// Messages discarded under backpressure and not yet reported on the
    /// wire.
    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn backpressure_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().unwrap().backpressure_timeout
    }

    /// None blocks a full queue forever; a duration drops messages once it
    /// elapses.
    pub fn set_backpressure_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().unwrap().backpressure_timeout = timeout;
    }
}

/// A host-visible token tying a recorded value to its handle id.
pub struct StreamHandle {
    inner: Arc<WriterInner>,
    index: u32,
    value: Value,
}

impl StreamHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The wire reference for embedding this handle inside other values.
    pub fn as_value(&self) -> Value {
        Value::HandleRef(self.index)
    }

    /// Record a `HANDLE_REF` message for this handle followed by each
    /// argument as its own message.
    pub fn call(&self, args: &[Value]) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        if !self.inner.enabled(&mut state) {
            return Ok(());
        }
        self.inner.check_thread(&mut state);
        self.inner.flush_dropped(&state);
        if self.inner.verbose {
            debug!("ObjectWriter -- HANDLE_REF({})", self.index);
        }
        self.inner.push(&state, queue::cmd_entry(Cmd::HandleRef, self.index));
        self.inner.messages_written.fetch_add(1, Ordering::Relaxed);
        self.inner.push(&state, queue::cmd_entry(Cmd::MessageBoundary, 0));
        for arg in args {
            self.inner.push_root(&state, arg);
        }
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.write_delete(&mut state, self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_serializer() -> SerializeFn {
        Box::new(|value| Err(Error::BindError(format!("no serializer for {:?}", value))))
    }

    #[test]
    fn disabled_writer_still_allocates_handle_ids() {
        let writer = Writer::new(None, no_serializer(), WriterOptions::default()).unwrap();
        writer.write(&[Value::Int(1)]).unwrap();
        let a = writer.handle(&Value::str("a"));
        let b = writer.handle(&Value::str("b"));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        a.call(&[Value::Int(2)]).unwrap();
        assert_eq!(writer.messages_written(), 0);
        assert_eq!(writer.bytes_written(), 0);
    }

    #[test]
    fn bind_requires_identity() {
        let writer = Writer::new(None, no_serializer(), WriterOptions::default()).unwrap();
        assert!(matches!(
            writer.bind(&Value::Int(3)),
            Err(Error::BindError(_))
        ));
        assert!(matches!(
            writer.ext_bind(&Value::str("x")),
            Err(Error::BindError(_))
        ));
    }

    #[test]
    fn handle_tokens_outlive_the_writer_binding() {
        let writer = Writer::new(None, no_serializer(), WriterOptions::default()).unwrap();
        let handle = writer.handle(&Value::str("kept"));
        drop(writer);
        assert_eq!(handle.value(), &Value::str("kept"));
        assert_eq!(handle.as_value(), Value::HandleRef(0));
    }
}
