use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::value::Value;
use crate::wire::*;
use crate::Error;

/// Host fallback for values the codec cannot represent natively.
pub type SerializeFn = Box<dyn Fn(&Value) -> Result<Vec<u8>, Error> + Send>;

/// Encodes values into the tagged wire format. Owns the record-side tables
/// (bindings, interned strings, filenames) so indices are assigned in exact
/// wire order; it therefore lives with the persister's drain thread.
pub(crate) struct Encoder {
    serializer: SerializeFn,
    bindings: HashMap<usize, (u32, Value)>,
    binding_counter: u32,
    // Interned-string index. Dedup is by pointer identity; the kept Arc
    // stops a freed allocation from aliasing a later one.
    interned: HashMap<usize, (u32, Arc<str>)>,
    interned_counter: u32,
    filenames: HashMap<usize, (u16, Arc<str>)>,
    filename_counter: u16,
    verbose: bool,
}

impl Encoder {
    pub fn new(serializer: SerializeFn, verbose: bool) -> Encoder {
        Encoder {
            serializer,
            bindings: HashMap::new(),
            binding_counter: 0,
            interned: HashMap::new(),
            interned_counter: 0,
            filenames: HashMap::new(),
            filename_counter: 0,
            verbose,
        }
    }

    pub fn write_fixed<W: Write>(&self, w: &mut W, typ: FixedType) -> Result<(), Error> {
        if self.verbose {
            trace!("{:?} ", typ);
        }
        w.write_u8(Control::fixed(typ).0)?;
        Ok(())
    }

    /// Write a sized control, inline when the size fits a nibble.
    pub fn write_size<W: Write>(&self, w: &mut W, typ: SizedType, size: u64) -> Result<(), Error> {
        if self.verbose {
            trace!("{:?}({}) ", typ, size);
        }
        if size <= MAX_INLINE_SIZE {
            w.write_u8(Control::sized(typ, size as u8).0)?;
        } else if size <= u8::MAX as u64 {
            w.write_u8(Control::sized(typ, ONE_BYTE_SIZE).0)?;
            w.write_u8(size as u8)?;
        } else if size <= u16::MAX as u64 {
            w.write_u8(Control::sized(typ, TWO_BYTE_SIZE).0)?;
            w.write_u16::<LittleEndian>(size as u16)?;
        } else if size <= u32::MAX as u64 {
            w.write_u8(Control::sized(typ, FOUR_BYTE_SIZE).0)?;
            w.write_u32::<LittleEndian>(size as u32)?;
        } else {
            w.write_u8(Control::sized(typ, EIGHT_BYTE_SIZE).0)?;
            w.write_u64::<LittleEndian>(size)?;
        }
        Ok(())
    }

    /// Non-negative integers ride the UINT size encoding; -1 has its own
    /// control; everything else negative is a raw INT64.
    pub fn write_sized_int<W: Write>(&self, w: &mut W, value: i64) -> Result<(), Error> {
        if value >= 0 {
            self.write_size(w, SizedType::Uint, value as u64)
        } else if value == -1 {
            self.write_fixed(w, FixedType::Neg1)
        } else {
            self.write_fixed(w, FixedType::Int64)?;
            w.write_i64::<LittleEndian>(value)?;
            Ok(())
        }
    }

    /// Compact count: one byte, escaping to a trailing u64 at 255.
    pub fn write_expected<W: Write>(&self, w: &mut W, value: u64) -> Result<(), Error> {
        if value < EXPECTED_INT_ESCAPE as u64 {
            w.write_u8(value as u8)?;
        } else {
            w.write_u8(EXPECTED_INT_ESCAPE)?;
            w.write_u64::<LittleEndian>(value)?;
        }
        Ok(())
    }

    pub fn write_magic<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_u64::<LittleEndian>(MAGIC_MARKER)?;
        Ok(())
    }

    fn write_str<W: Write>(&mut self, w: &mut W, s: &Arc<str>) -> Result<(), Error> {
        let id = Arc::as_ptr(s) as *const u8 as usize;
        if let Some((index, _)) = self.interned.get(&id) {
            return self.write_size(w, SizedType::StrRef, *index as u64);
        }
        self.interned.insert(id, (self.interned_counter, s.clone()));
        self.write_size(w, SizedType::Str, s.len() as u64)?;
        w.write_all(s.as_bytes())?;
        // The index counter advances on every STR emission, not only on
        // dedup hits, so the reader's table stays in lockstep.
        self.interned_counter += 1;
        Ok(())
    }

    fn write_items<W: Write>(
        &mut self,
        w: &mut W,
        typ: SizedType,
        items: &[Value],
    ) -> Result<(), Error> {
        self.write_size(w, typ, items.len() as u64)?;
        for item in items {
            self.write_value(w, item)?;
        }
        Ok(())
    }

    fn write_serialized<W: Write>(&mut self, w: &mut W, value: &Value) -> Result<(), Error> {
        let bytes = (self.serializer)(value)?;
        self.write_size(w, SizedType::Pickled, bytes.len() as u64)?;
        w.write_all(&bytes)?;
        Ok(())
    }

    fn binding_index(&self, value: &Value) -> Option<u32> {
        let id = value.identity()?;
        self.bindings.get(&id).map(|(index, _)| *index)
    }

    pub fn write_value<W: Write>(&mut self, w: &mut W, value: &Value) -> Result<(), Error> {
        match value {
            Value::None => self.write_fixed(w, FixedType::None),
            Value::Bool(true) => self.write_fixed(w, FixedType::True),
            Value::Bool(false) => self.write_fixed(w, FixedType::False),
            Value::Int(i) => self.write_sized_int(w, *i),
            Value::BigInt(bytes) => {
                self.write_size(w, SizedType::BigInt, bytes.len() as u64)?;
                w.write_all(bytes)?;
                Ok(())
            }
            Value::Float(f) => {
                self.write_fixed(w, FixedType::Float)?;
                w.write_u64::<LittleEndian>(f.to_bits())?;
                Ok(())
            }
            Value::Bytes(bytes) => {
                self.write_size(w, SizedType::Bytes, bytes.len() as u64)?;
                w.write_all(bytes)?;
                Ok(())
            }
            Value::Str(s) => self.write_str(w, s),
            Value::List(items) => self.write_items(w, SizedType::List, items),
            Value::Tuple(items) => self.write_items(w, SizedType::Tuple, items),
            Value::Set(items) => self.write_items(w, SizedType::Set, items),
            Value::FrozenSet(items) => self.write_items(w, SizedType::FrozenSet, items),
            Value::Dict(pairs) => {
                self.write_size(w, SizedType::Dict, pairs.len() as u64)?;
                for (key, val) in pairs {
                    self.write_value(w, key)?;
                    self.write_value(w, val)?;
                }
                Ok(())
            }
            Value::Pickled(bytes) => {
                self.write_size(w, SizedType::Pickled, bytes.len() as u64)?;
                w.write_all(bytes)?;
                Ok(())
            }
            Value::HandleRef(index) => self.write_size(w, SizedType::Handle, *index as u64),
            Value::BindingRef(index) => self.write_size(w, SizedType::Binding, *index as u64),
            Value::Type(_) | Value::Opaque(_) => match self.binding_index(value) {
                Some(index) => self.write_size(w, SizedType::Binding, index as u64),
                None => self.write_serialized(w, value),
            },
        }
    }

    pub fn write_new_handle<W: Write>(&mut self, w: &mut W, value: &Value) -> Result<(), Error> {
        self.write_fixed(w, FixedType::NewHandle)?;
        self.write_value(w, value)
    }

    pub fn write_handle_ref<W: Write>(&self, w: &mut W, index: u32) -> Result<(), Error> {
        self.write_size(w, SizedType::Handle, index as u64)
    }

    pub fn write_handle_delete<W: Write>(&self, w: &mut W, delta: u32) -> Result<(), Error> {
        self.write_size(w, SizedType::Delete, delta as u64)
    }

    pub fn write_thread_switch<W: Write>(&mut self, w: &mut W, value: &Value) -> Result<(), Error> {
        self.write_fixed(w, FixedType::ThreadSwitch)?;
        self.write_value(w, value)
    }

    pub fn write_dropped<W: Write>(&self, w: &mut W, count: u32) -> Result<(), Error> {
        self.write_fixed(w, FixedType::Dropped)?;
        self.write_sized_int(w, count as i64)
    }

    /// Register a binding supplied to the reader out of band.
    pub fn bind<W: Write>(&mut self, w: &mut W, value: &Value) -> Result<(), Error> {
        let id = value
            .identity()
            .ok_or_else(|| Error::BindError(format!("{} values carry no identity", value.type_name())))?;
        if self.bindings.contains_key(&id) {
            return Err(Error::BindError(format!(
                "<{} object at {:#x}> already bound",
                value.type_name(),
                id
            )));
        }
        self.bindings.insert(id, (self.binding_counter, value.clone()));
        self.binding_counter += 1;
        self.write_fixed(w, FixedType::Bind)
    }

    /// Register a self-describing binding: the wire carries the (already
    /// bound) type whose constructor rebuilds the value on replay.
    pub fn ext_bind<W: Write>(
        &mut self,
        w: &mut W,
        value: &Value,
        typ: &Value,
    ) -> Result<(), Error> {
        let typ_index = self
            .binding_index(typ)
            .ok_or_else(|| Error::BindError(format!("type {:?} must be bound first", typ)))?;
        let id = value
            .identity()
            .ok_or_else(|| Error::BindError(format!("{} values carry no identity", value.type_name())))?;
        self.bindings.insert(id, (self.binding_counter, value.clone()));
        self.binding_counter += 1;
        self.write_fixed(w, FixedType::ExtBind)?;
        self.write_size(w, SizedType::Binding, typ_index as u64)
    }

    /// A bound host value was reclaimed; drop its slot on both sides.
    pub fn object_freed<W: Write>(&mut self, w: &mut W, value: &Value) -> Result<bool, Error> {
        let id = match value.identity() {
            Some(id) => id,
            None => return Ok(false),
        };
        match self.bindings.remove(&id) {
            Some((index, _)) => {
                self.write_size(w, SizedType::BindingDelete, index as u64)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stack-delta record: unseen filenames first get `ADD_FILENAME`
    /// records, then the delta itself as `(drop, [(index, line)])`.
    pub fn write_stack<W: Write>(
        &mut self,
        w: &mut W,
        to_drop: u64,
        frames: &[(Arc<str>, u16)],
    ) -> Result<(), Error> {
        for (filename, _) in frames {
            let id = Arc::as_ptr(filename) as *const u8 as usize;
            if self.filenames.contains_key(&id) {
                continue;
            }
            if self.filename_counter == u16::MAX {
                return Err(Error::Overflow("filename table exhausted".to_string()));
            }
            self.write_fixed(w, FixedType::AddFilename)?;
            self.write_str(w, filename)?;
            self.filenames.insert(id, (self.filename_counter, filename.clone()));
            self.filename_counter += 1;
        }

        self.write_fixed(w, FixedType::Stack)?;
        self.write_expected(w, to_drop)?;
        self.write_expected(w, frames.len() as u64)?;
        for (filename, line) in frames {
            let id = Arc::as_ptr(filename) as *const u8 as usize;
            let index = self.filenames[&id].0;
            w.write_u16::<LittleEndian>(index)?;
            w.write_u16::<LittleEndian>(*line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_encoder() -> Encoder {
    Encoder::new(
        Box::new(|value| Err(Error::BindError(format!("no serializer for {:?}", value)))),
        false,
    )
}
