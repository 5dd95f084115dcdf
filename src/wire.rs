use num_traits::FromPrimitive;

/// Size of a frame header on the sink: 4-byte PID + 2-byte payload length.
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest frame the framer will emit, header included.
pub const MAX_FRAME: usize = 65536;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME - FRAME_HEADER_SIZE;

/// Size of a pooled serialization buffer slot.
pub const BUFFER_SLOT_SIZE: usize = 65536;

/// Optional per-message sync marker, written as a little-endian u64.
pub const MAGIC_MARKER: u64 = 0x5245_5452_4143_4553;

/// Escape byte for the out-of-line form of an expected-int.
pub const EXPECTED_INT_ESCAPE: u8 = 255;

/// Item kinds selected by the low nibble of a control byte. The high nibble
/// carries the size: 0..=11 inline, or one of the `*_BYTE_SIZE` codes when
/// the size follows out of line.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
pub enum SizedType {
    Bytes = 0,
    List,
    Dict,
    Tuple,
    Str,
    Pickled,
    Uint,
    Delete,
    Handle,
    BigInt,
    Set,
    FrozenSet,
    Binding,
    BindingDelete,
    FixedSize,
    StrRef,
}

/// Record kinds selected by the high nibble when the low nibble is
/// [`SizedType::FixedSize`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
pub enum FixedType {
    None = 0,
    True,
    False,
    Float,
    Neg1,
    Int64,
    NewHandle,
    Ref,
    ThreadSwitch,
    Bind,
    ExtBind,
    Stack,
    AddFilename,
    Dropped,
}

/// Out-of-line size codes for the high nibble of a sized control.
pub const ONE_BYTE_SIZE: u8 = 12;
pub const TWO_BYTE_SIZE: u8 = 13;
pub const FOUR_BYTE_SIZE: u8 = 14;
pub const EIGHT_BYTE_SIZE: u8 = 15;

/// Largest size the high nibble can carry inline.
pub const MAX_INLINE_SIZE: u64 = 11;

/// The one-byte dispatch tag preceding each encoded item.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Control(pub u8);

impl Control {
    pub fn sized(typ: SizedType, high: u8) -> Control {
        debug_assert!(high < 16);
        Control((typ as u8) | (high << 4))
    }

    pub fn fixed(typ: FixedType) -> Control {
        Control((SizedType::FixedSize as u8) | ((typ as u8) << 4))
    }

    /// The low nibble as a sized type, if it is a known one.
    pub fn sized_type(self) -> Option<SizedType> {
        SizedType::from_u8(self.0 & 0x0F)
    }

    /// The high nibble: an inline size or an out-of-line size code.
    pub fn high(self) -> u8 {
        self.0 >> 4
    }

    pub fn is_fixed(self) -> bool {
        self.0 & 0x0F == SizedType::FixedSize as u8
    }

    /// The high nibble as a fixed-size type, if it is a known one.
    pub fn fixed_type(self) -> Option<FixedType> {
        FixedType::from_u8(self.0 >> 4)
    }
}
