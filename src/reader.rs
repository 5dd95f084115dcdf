use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::FrameReader;
use crate::value::Value;
use crate::wire::*;
use crate::Error;

/// Rebuilds a value from a `PICKLED` blob.
pub type DeserializeFn = Box<dyn Fn(&[u8]) -> Result<Value, Error> + Send>;
/// Builds the host's stack-delta value from `(drop, [(filename, line)])`.
pub type StackDeltaFn = Box<dyn Fn(u64, Vec<(Value, u16)>) -> Value + Send>;
/// Wraps the decoded thread identity into the host's switch marker.
pub type ThreadSwitchFn = Box<dyn Fn(Value) -> Value + Send>;
/// Wraps a `DROPPED` count; without one the reader skips the record.
pub type DroppedFn = Box<dyn Fn(Value) -> Value + Send>;

pub struct ReaderCallbacks {
    pub deserialize: DeserializeFn,
    /// The sentinel `next()` returns when the stream asks for a bind.
    pub bind_singleton: Value,
    pub make_stack_delta: StackDeltaFn,
    pub make_thread_switch: ThreadSwitchFn,
    pub make_dropped: Option<DroppedFn>,
}

/// Replay-side entry point: decodes the framed stream back into values,
/// maintaining the handle, binding, interned-string and filename tables.
/// Driven by a single decoder thread.
pub struct Reader {
    stream: FrameReader,
    callbacks: ReaderCallbacks,
    handles: Vec<Option<Value>>,
    bindings: BTreeMap<u32, Value>,
    binding_counter: u32,
    interned: Vec<Arc<str>>,
    filenames: Vec<Value>,
    pending_bind: bool,
    poisoned: bool,
    messages_read: u64,
    magic_markers: bool,
    verbose: bool,
}

impl Reader {
    pub fn open<P: AsRef<Path>>(
        path: P,
        callbacks: ReaderCallbacks,
        read_timeout: Duration,
        verbose: bool,
    ) -> Result<Reader, Error> {
        let file = File::open(path.as_ref())?;
        Ok(Reader {
            stream: FrameReader::new(file, read_timeout),
            callbacks,
            handles: Vec::new(),
            bindings: BTreeMap::new(),
            binding_counter: 0,
            interned: Vec::new(),
            filenames: Vec::new(),
            pending_bind: false,
            poisoned: false,
            messages_read: 0,
            magic_markers: false,
            verbose,
        })
    }

    /// Expect (and verify) a sync marker after every top-level value. Must
    /// match the writer's configuration.
    pub fn set_magic_markers(&mut self, on: bool) {
        self.magic_markers = on;
    }

    pub fn bytes_read(&self) -> u64 {
        self.stream.bytes_read()
    }

    pub fn messages_read(&self) -> u64 {
        self.messages_read
    }

    pub fn pending_bind(&self) -> bool {
        self.pending_bind
    }

    pub fn active_pid(&self) -> u32 {
        self.stream.active_pid()
    }

    /// The value stored at a handle slot, if the slot exists and has not
    /// been deleted.
    pub fn handle_value(&self, index: usize) -> Option<&Value> {
        self.handles.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn binding_value(&self, index: u32) -> Option<&Value> {
        self.bindings.get(&index)
    }

    /// Switch the PID filter, draining frames buffered for `pid` first.
    pub fn set_active_pid(&mut self, pid: u32) {
        self.stream.set_active_pid(pid);
    }

    pub fn close(&mut self) {
        self.stream.close();
    }

    fn decode_err(&self, control: u8, reason: String) -> Error {
        Error::DecodeError {
            offset: self.stream.bytes_read(),
            message: self.messages_read,
            control,
            reason,
        }
    }

    fn protocol_err(&self, control: u8, reason: String) -> Error {
        Error::ProtocolError {
            offset: self.stream.bytes_read(),
            message: self.messages_read,
            control,
            reason,
        }
    }

    fn read_control(&mut self) -> Result<Control, Error> {
        Ok(Control(self.stream.read_u8()?))
    }

    fn read_unsigned_number(&mut self, control: Control) -> Result<u64, Error> {
        match control.high() {
            ONE_BYTE_SIZE => Ok(self.stream.read_u8()? as u64),
            TWO_BYTE_SIZE => Ok(self.stream.read_u16()? as u64),
            FOUR_BYTE_SIZE => Ok(self.stream.read_u32()? as u64),
            EIGHT_BYTE_SIZE => self.stream.read_u64(),
            inline => Ok(inline as u64),
        }
    }

    fn read_expected_int(&mut self) -> Result<u64, Error> {
        let byte = self.stream.read_u8()?;
        if byte == EXPECTED_INT_ESCAPE {
            self.stream.read_u64()
        } else {
            Ok(byte as u64)
        }
    }

    fn read_buffer(&mut self, size: u64) -> Result<Vec<u8>, Error> {
        let size = usize::try_from(size)
            .map_err(|_| Error::Overflow(format!("payload of {} bytes", size)))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::Resource(size))?;
        buf.resize(size, 0);
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_str(&mut self, size: u64) -> Result<Value, Error> {
        let buf = self.read_buffer(size)?;
        let s: Arc<str> = Arc::from(String::from_utf8(buf)?);
        // Every decoded STR occupies the next table index, mirroring the
        // writer's per-emission counter.
        self.interned.push(s.clone());
        Ok(Value::Str(s))
    }

    fn read_items(&mut self, size: u64) -> Result<Vec<Value>, Error> {
        let size = usize::try_from(size)
            .map_err(|_| Error::Overflow(format!("container of {} items", size)))?;
        let mut items = Vec::with_capacity(size.min(1024));
        for _ in 0..size {
            items.push(self.read_value_any()?);
        }
        Ok(items)
    }

    fn read_sized(&mut self, control: Control) -> Result<Value, Error> {
        // The low nibble covers the full 0..15 range, so it always names a
        // sized type; FIXED_SIZE is dispatched before we get here.
        let typ = control.sized_type().unwrap();
        let size = self.read_unsigned_number(control)?;

        if self.verbose {
            trace!("{:?}({}) ", typ, size);
        }

        match typ {
            SizedType::Uint => {
                let value = i64::try_from(size)
                    .map_err(|_| Error::Overflow(format!("UINT {} exceeds i64", size)))?;
                Ok(Value::Int(value))
            }
            SizedType::Handle => {
                let index = size as usize;
                match self.handles.get(index) {
                    Some(Some(value)) => Ok(value.clone()),
                    Some(None) => {
                        Err(self.protocol_err(control.0, format!("handle {} was deleted", index)))
                    }
                    None => Err(self.protocol_err(control.0, format!("no handle {}", index))),
                }
            }
            SizedType::Binding => match self.bindings.get(&(size as u32)) {
                Some(value) => Ok(value.clone()),
                None => Err(self.protocol_err(control.0, format!("no binding {}", size))),
            },
            SizedType::Bytes => Ok(Value::Bytes(self.read_buffer(size)?)),
            SizedType::Str => self.read_str(size),
            SizedType::StrRef => match self.interned.get(size as usize) {
                Some(s) => Ok(Value::Str(s.clone())),
                None => Err(self.protocol_err(
                    control.0,
                    format!("string reference {} precedes its definition", size),
                )),
            },
            SizedType::List => Ok(Value::List(self.read_items(size)?)),
            SizedType::Tuple => Ok(Value::Tuple(self.read_items(size)?)),
            SizedType::Set => Ok(Value::Set(self.read_items(size)?)),
            SizedType::FrozenSet => Ok(Value::FrozenSet(self.read_items(size)?)),
            SizedType::Dict => {
                let size = usize::try_from(size)
                    .map_err(|_| Error::Overflow(format!("dict of {} entries", size)))?;
                let mut pairs = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    let key = self.read_value_any()?;
                    let value = self.read_value_any()?;
                    pairs.push((key, value));
                }
                Ok(Value::Dict(pairs))
            }
            SizedType::Pickled => {
                let bytes = self.read_buffer(size)?;
                (self.callbacks.deserialize)(&bytes)
            }
            SizedType::BigInt => Ok(Value::BigInt(self.read_buffer(size)?)),
            SizedType::Delete | SizedType::BindingDelete => Err(self.decode_err(
                control.0,
                format!("{:?} is not valid inside a value", typ),
            )),
            SizedType::FixedSize => unreachable!("dispatched before read_sized"),
        }
    }

    fn read_fixed(&mut self, control: Control) -> Result<Value, Error> {
        let typ = match control.fixed_type() {
            Some(typ) => typ,
            None => {
                return Err(
                    self.decode_err(control.0, format!("unknown fixed-size type {}", control.high()))
                )
            }
        };

        if self.verbose {
            trace!("{:?} ", typ);
        }

        match typ {
            FixedType::None => Ok(Value::None),
            FixedType::True => Ok(Value::Bool(true)),
            FixedType::False => Ok(Value::Bool(false)),
            FixedType::Neg1 => Ok(Value::Int(-1)),
            FixedType::Float => Ok(Value::Float(self.stream.read_f64()?)),
            FixedType::Int64 => Ok(Value::Int(self.stream.read_i64()?)),
            FixedType::NewHandle
            | FixedType::Ref
            | FixedType::ThreadSwitch
            | FixedType::Bind
            | FixedType::ExtBind
            | FixedType::Stack
            | FixedType::AddFilename
            | FixedType::Dropped => Err(self.decode_err(
                control.0,
                format!("{:?} is not valid inside a value", typ),
            )),
        }
    }

    fn read_value_any(&mut self) -> Result<Value, Error> {
        let control = self.read_control()?;
        self.read_value(control)
    }

    fn read_value(&mut self, control: Control) -> Result<Value, Error> {
        if control.is_fixed() {
            self.read_fixed(control)
        } else {
            self.read_sized(control)
        }
    }

    fn read_ext_bind(&mut self, control: Control) -> Result<(), Error> {
        let target = self.read_value_any()?;
        let typ = match target {
            Value::Type(typ) => typ,
            other => {
                return Err(self.protocol_err(
                    control.0,
                    format!("EXT_BIND target is a {}, not a type", other.type_name()),
                ))
            }
        };
        let instance = typ.construct();
        self.bindings.insert(self.binding_counter, instance);
        self.binding_counter += 1;
        Ok(())
    }

    fn check_magic(&mut self) -> Result<(), Error> {
        let marker = self.stream.read_u64()?;
        if marker != MAGIC_MARKER {
            return Err(self.decode_err(
                0,
                format!("expected magic marker, found {:#018x}", marker),
            ));
        }
        Ok(())
    }

    /// Pull controls until one produces a caller-visible value, applying the
    /// side-effect records (handles, filenames, deletes, ext binds) along
    /// the way.
    fn consume(&mut self) -> Result<Control, Error> {
        loop {
            let control = self.read_control()?;

            if control == Control::fixed(FixedType::NewHandle) {
                if self.verbose {
                    trace!("ObjectStream[{}] - consumed NEW_HANDLE", self.messages_read);
                }
                let value = self.read_value_any()?;
                self.handles.push(Some(value));
                self.messages_read += 1;
            } else if control == Control::fixed(FixedType::AddFilename) {
                if self.verbose {
                    trace!("ObjectStream[{}] - consumed ADD_FILENAME", self.messages_read);
                }
                let value = self.read_value_any()?;
                self.filenames.push(value);
                self.messages_read += 1;
            } else if control == Control::fixed(FixedType::ExtBind) {
                if self.verbose {
                    trace!("ObjectStream[{}] - consumed EXT_BIND", self.messages_read);
                }
                self.read_ext_bind(control)?;
                self.messages_read += 1;
            } else if control.sized_type() == Some(SizedType::Delete) {
                let size = self.read_unsigned_number(control)?;
                let from_end = size as usize;
                if from_end >= self.handles.len() {
                    return Err(self.protocol_err(
                        control.0,
                        format!(
                            "delete of {} from the end overruns {} handles",
                            from_end,
                            self.handles.len()
                        ),
                    ));
                }
                let index = self.handles.len() - 1 - from_end;
                if self.verbose {
                    trace!("ObjectStream[{}] - consumed DELETE({})", self.messages_read, index);
                }
                if self.handles[index].take().is_none() {
                    return Err(self
                        .protocol_err(control.0, format!("handle {} already deleted", index)));
                }
                self.messages_read += 1;
            } else if control.sized_type() == Some(SizedType::BindingDelete) {
                let size = self.read_unsigned_number(control)?;
                if self.verbose {
                    trace!(
                        "ObjectStream[{}] - consumed BINDING_DELETE({})",
                        self.messages_read,
                        size
                    );
                }
                if self.bindings.remove(&(size as u32)).is_none() {
                    return Err(self.protocol_err(control.0, format!("no binding {}", size)));
                }
                self.messages_read += 1;
            } else {
                return Ok(control);
            }
        }
    }

    fn read_stack_delta(&mut self, control: Control) -> Result<Value, Error> {
        let to_drop = self.read_expected_int()?;
        let count = self.read_expected_int()?;
        let mut frames = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let index = self.stream.read_u16()?;
            let filename = match self.filenames.get(index as usize) {
                Some(filename) => filename.clone(),
                None => {
                    return Err(
                        self.protocol_err(control.0, format!("no filename {}", index))
                    )
                }
            };
            let line = self.stream.read_u16()?;
            frames.push((filename, line));
        }
        Ok((self.callbacks.make_stack_delta)(to_drop, frames))
    }

    fn next_inner(&mut self) -> Result<Value, Error> {
        let control = self.consume()?;

        if control == Control::fixed(FixedType::Stack) {
            let delta = self.read_stack_delta(control)?;
            self.messages_read += 1;
            return Ok(delta);
        }
        if control == Control::fixed(FixedType::ThreadSwitch) {
            let thread = self.read_value_any()?;
            if self.verbose {
                trace!(
                    "ObjectStream[{}] - consumed THREAD_SWITCH({:?})",
                    self.messages_read,
                    thread
                );
            }
            self.messages_read += 1;
            return Ok((self.callbacks.make_thread_switch)(thread));
        }
        if control == Control::fixed(FixedType::Dropped) {
            let count = self.read_value_any()?;
            if self.verbose {
                trace!(
                    "ObjectStream[{}] - consumed DROPPED({:?})",
                    self.messages_read,
                    count
                );
            }
            self.messages_read += 1;
            if let Some(make_dropped) = &self.callbacks.make_dropped {
                return Ok(make_dropped(count));
            }
            return self.next_inner();
        }
        if control == Control::fixed(FixedType::Bind) {
            if self.verbose {
                trace!("ObjectStream[{}] - read BIND", self.messages_read);
            }
            self.pending_bind = true;
            self.messages_read += 1;
            return Ok(self.callbacks.bind_singleton.clone());
        }

        let value = self.read_value(control)?;
        if self.magic_markers {
            self.check_magic()?;
        }
        if self.verbose {
            trace!("ObjectStream[{}] - read {:?}", self.messages_read, value);
        }
        self.messages_read += 1;
        Ok(value)
    }

    /// Decode exactly one caller-visible value. Decode, protocol and
    /// overflow failures are terminal: the reader refuses to continue.
    pub fn next(&mut self) -> Result<Value, Error> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        if self.pending_bind {
            return Err(Error::PendingBind);
        }
        match self.next_inner() {
            Ok(value) => Ok(value),
            Err(err) => {
                if matches!(
                    err,
                    Error::DecodeError { .. }
                        | Error::ProtocolError { .. }
                        | Error::Overflow(_)
                        | Error::Utf8Error(_)
                ) {
                    self.poisoned = true;
                }
                Err(err)
            }
        }
    }

    /// Supply the value for a pending `BIND` record.
    pub fn bind(&mut self, value: Value) -> Result<(), Error> {
        if !self.pending_bind {
            return Err(Error::NoPendingBind);
        }
        self.bindings.insert(self.binding_counter, value);
        self.binding_counter += 1;
        self.pending_bind = false;
        Ok(())
    }
}
