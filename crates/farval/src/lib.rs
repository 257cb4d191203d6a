//! # Farval
//!
//! Self-describing argument values for calls that cross a process boundary.
//!
//! ## Philosophy
//!
//! - **Closed**: An `ArgValue` is one of eight payload kinds, and the enum tag is the
//!   only source of truth for which payload is live. Setting a value replaces the
//!   whole enum, so nothing leaks from one kind into the next.
//! - **Widened**: Immediates are stored in a 64-bit slot, sign-extended when signed.
//!   The declared width is kept next to them so the exact bit pattern can be recovered.
//! - **Owned**: Strings and data payloads live in buffers owned by the value. The engine
//!   copies them into the target before a call, and copies data-pointer buffers back
//!   out afterwards.


/// Width in bytes of a native register slot on the controller.
///
/// Data structs at or below this width are passed as immediates.
pub const SLOT_SIZE: usize = std::mem::size_of::<usize>();

/// Argument value errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Immediates must be 1, 2, 4 or 8 bytes wide.
    #[error("invalid immediate width: {0} bytes (expected 1, 2, 4 or 8)")]
    InvalidWidth(u8),
}

/// Specialized `Result` for argument value operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The payload kind of an `ArgValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Int,
    Float,
    Double,
    NarrowStr,
    WideStr,
    Pointer,
    DataPtr,
    DataStruct,
}

/// A single call argument.
///
/// The string and data variants hold their bytes without any trailing terminator;
/// strings gain their NUL when they are marshalled into the target.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// An integer immediate, widened to 64 bits.
    Int { bits: u64, width: u8, signed: bool },
    Float(f32),
    Double(f64),
    /// A narrow (8-bit) string, passed as a pointer to a NUL-terminated copy.
    NarrowStr(Vec<u8>),
    /// A wide (UTF-16) string, passed as a pointer to a NUL-terminated copy.
    WideStr(Vec<u16>),
    /// A raw pointer into the target, passed through unchanged.
    Pointer(u64),
    /// A caller-owned buffer passed by pointer. Refreshed from the target after the call.
    DataPtr(Vec<u8>),
    /// An inline value wider than a register slot, passed by value.
    DataStruct(Vec<u8>),
}

impl Default for ArgValue {
    fn default() -> Self {
        Self::Int { bits: 0, width: 4, signed: true }
    }
}

impl ArgValue {
    /// Builds an integer immediate. See [`ArgValue::set_integer`].
    pub fn int(value: u64, width: u8, signed: bool) -> Result<Self> {
        let mut arg = Self::default();
        arg.set_integer(value, width, signed)?;
        Ok(arg)
    }

    /// Builds a pointer argument.
    pub fn pointer(address: u64) -> Self {
        Self::Pointer(address)
    }

    /// Builds a zero-filled output buffer of `len` bytes, passed by pointer.
    pub fn out_buffer(len: usize) -> Self {
        Self::DataPtr(vec![0; len])
    }

    /// Builds a wide string argument from UTF-8 text.
    pub fn wide(text: &str) -> Self {
        Self::WideStr(text.encode_utf16().collect())
    }

    /// Sets an integer immediate of `width` bytes.
    ///
    /// `value` is truncated to `width` and then widened, sign-extending when `signed`.
    /// An unsupported width is rejected and leaves the value untouched.
    pub fn set_integer(&mut self, value: u64, width: u8, signed: bool) -> Result<()> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(Error::InvalidWidth(width));
        }
        *self = Self::Int { bits: widen(value, width, signed), width, signed };
        Ok(())
    }

    pub fn set_float32(&mut self, value: f32) {
        *self = Self::Float(value);
    }

    pub fn set_float64(&mut self, value: f64) {
        *self = Self::Double(value);
    }

    /// Sets a narrow string. The copy stops at the first NUL, as a C string would.
    pub fn set_narrow_string(&mut self, text: impl AsRef<[u8]>) {
        let bytes = text.as_ref();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        *self = Self::NarrowStr(bytes[..end].to_vec());
    }

    /// Sets a wide string from UTF-8 text.
    pub fn set_wide_string(&mut self, text: &str) {
        *self = Self::wide(text);
    }

    /// Sets a wide string from raw UTF-16 units. The copy stops at the first NUL.
    pub fn set_wide_units(&mut self, units: &[u16]) {
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        *self = Self::WideStr(units[..end].to_vec());
    }

    pub fn set_pointer(&mut self, address: u64) {
        *self = Self::Pointer(address);
    }

    /// Marks this value as a by-pointer buffer. The buffer's length is the payload size.
    ///
    /// After a successful remote call the buffer holds whatever the callee wrote into
    /// the target-side copy.
    pub fn set_data_pointer(&mut self, buffer: impl Into<Vec<u8>>) {
        *self = Self::DataPtr(buffer.into());
    }

    /// Sets an inline value passed by value.
    ///
    /// Payloads that fit in a register slot become an unsigned little-endian immediate
    /// of the same width; anything wider is copied into an owned buffer. An empty
    /// payload becomes a one-byte zero, the size C++ gives an empty struct.
    pub fn set_data_struct(&mut self, bytes: &[u8]) {
        if bytes.len() <= SLOT_SIZE {
            let mut slot = [0u8; 8];
            slot[..bytes.len()].copy_from_slice(bytes);
            *self = Self::Int {
                bits: u64::from_le_bytes(slot),
                width: bytes.len().max(1) as u8,
                signed: false,
            };
        } else {
            *self = Self::DataStruct(bytes.to_vec());
        }
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Int { .. } => ArgKind::Int,
            Self::Float(_) => ArgKind::Float,
            Self::Double(_) => ArgKind::Double,
            Self::NarrowStr(_) => ArgKind::NarrowStr,
            Self::WideStr(_) => ArgKind::WideStr,
            Self::Pointer(_) => ArgKind::Pointer,
            Self::DataPtr(_) => ArgKind::DataPtr,
            Self::DataStruct(_) => ArgKind::DataStruct,
        }
    }

    /// Byte width of the value's slot, or the payload length for data kinds.
    pub fn size(&self) -> usize {
        match self {
            Self::Int { width, .. } => usize::from(*width),
            Self::Float(_) => 4,
            Self::Double(_) => 8,
            Self::NarrowStr(_) | Self::WideStr(_) | Self::Pointer(_) => SLOT_SIZE,
            Self::DataPtr(buf) | Self::DataStruct(buf) => buf.len(),
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Int { signed: true, .. })
    }

    /// The exact bit pattern of a scalar, truncated to its declared width.
    ///
    /// Returns `None` for strings and data payloads, which have no scalar form.
    pub fn bits(&self) -> Option<u64> {
        match self {
            Self::Int { bits, width, .. } => Some(truncate(*bits, *width)),
            Self::Float(v) => Some(u64::from(v.to_bits())),
            Self::Double(v) => Some(v.to_bits()),
            Self::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    /// The scalar as it sits in a 64-bit slot (sign-extended for signed immediates).
    pub fn widened(&self) -> Option<u64> {
        match self {
            Self::Int { bits, .. } => Some(*bits),
            other => other.bits(),
        }
    }

    /// Borrowed payload of a data pointer, a data struct or a narrow string. String
    /// bytes come without the terminator `payload` adds.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::DataPtr(buf) | Self::DataStruct(buf) => Some(buf),
            Self::NarrowStr(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Mutable view of a data pointer's buffer; the only payload a call may change.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::DataPtr(buf) => Some(buf),
            _ => None,
        }
    }

    /// Bytes this value occupies in the target's argument area, terminators included.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::NarrowStr(bytes) => bytes.len() + 1,
            Self::WideStr(units) => (units.len() + 1) * 2,
            Self::DataPtr(buf) | Self::DataStruct(buf) => buf.len(),
            _ => 0,
        }
    }

    /// The payload exactly as it is written into the target, terminators included.
    pub fn payload(&self) -> Option<Vec<u8>> {
        match self {
            Self::NarrowStr(bytes) => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.extend_from_slice(bytes);
                out.push(0);
                Some(out)
            }
            Self::WideStr(units) => Some(
                units.iter()
                    .chain(std::iter::once(&0u16))
                    .flat_map(|u| u.to_le_bytes())
                    .collect(),
            ),
            Self::DataPtr(buf) | Self::DataStruct(buf) => Some(buf.clone()),
            _ => None,
        }
    }
}

fn widen(value: u64, width: u8, signed: bool) -> u64 {
    let shift = 64 - u32::from(width.min(8)) * 8;
    match (shift, signed) {
        (0, _) => value,
        (64, _) => 0,
        (s, true) => (((value << s) as i64) >> s) as u64,
        (s, false) => (value << s) >> s,
    }
}

fn truncate(value: u64, width: u8) -> u64 {
    match width {
        0 => 0,
        w if w >= 8 => value,
        w => value & ((1u64 << (u32::from(w) * 8)) - 1),
    }
}

macro_rules! impl_from_int {
    ($($ty:ty => $width:expr, $signed:expr);* $(;)?) => {
        $(
            impl From<$ty> for ArgValue {
                fn from(v: $ty) -> Self {
                    Self::Int { bits: widen(v as u64, $width, $signed), width: $width, signed: $signed }
                }
            }
        )*
    };
}

impl_from_int! {
    u8 => 1, false;
    u16 => 2, false;
    u32 => 4, false;
    u64 => 8, false;
    i8 => 1, true;
    i16 => 2, true;
    i32 => 4, true;
    i64 => 8, true;
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for ArgValue {
    fn from(text: &str) -> Self {
        let mut arg = Self::default();
        arg.set_narrow_string(text);
        arg
    }
}
