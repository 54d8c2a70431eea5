//! Wire format for Google's Protocol Buffers, aka [protobuf](https://protobuf.dev).
//!
//! Reading goes through a [`Cursor`] which tracks the current position and
//! the limit of the enclosing length-delimited frame. Writing goes through
//! any [`bytes::BufMut`].

use core::num::NonZeroU64;

use crate::error::{DecodeError, DecodeErrorKind};
use crate::leb128::LebCodec;
use crate::util::{CastFrom, likely, unlikely};

/// Minimum value of a protobuf field number.
pub const MINIMUM_FIELD_NUMBER: u32 = 1;
/// Maximum value of a protobuf field number.
pub const MAXIMUM_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Largest length prefix we accept, matching the reference implementations.
pub const MAXIMUM_LENGTH: u64 = i32::MAX as u64;

/// A decoded protobuf field key containing a wire type and field number.
///
/// Packed into a [`NonZeroU64`] to enable register-based returns from
/// [`Cursor::read_tag`].
///
/// The layout mirrors the protobuf wire format:
/// * Bits 0-2: wire type (0-5)
/// * Bits 3-31: field number (1 to 2^29-1)
///
/// Since field numbers start at 1, the minimum raw value is 8 (`1 << 3`),
/// guaranteeing the value is always non-zero.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ProtoKey(NonZeroU64);

static_assertions::assert_eq_size!(ProtoKey, Option<ProtoKey>);

#[allow(clippy::as_conversions)]
impl ProtoKey {
    /// Creates a new [`ProtoKey`] from a raw key value, validating the wire
    /// type and field number.
    #[inline(always)]
    pub fn try_from_raw(raw_key: u64) -> Result<Self, DecodeErrorKind> {
        if unlikely(raw_key > u64::from(u32::MAX)) {
            return Err(DecodeErrorKind::MalformedTag);
        }

        let wire_type_raw = (raw_key & 0b111) as u8;
        if unlikely(wire_type_raw > WireType::MAX_VAL) {
            return Err(DecodeErrorKind::MalformedTag);
        }

        let number = (raw_key >> 3) as u32;
        if unlikely(number < MINIMUM_FIELD_NUMBER || number > MAXIMUM_FIELD_NUMBER) {
            return Err(DecodeErrorKind::MalformedTag);
        }

        // `number >= 1` so the raw key is at least 8.
        NonZeroU64::new(raw_key)
            .map(ProtoKey)
            .ok_or(DecodeErrorKind::MalformedTag)
    }

    /// Build a key from parts that are already known to be valid.
    #[inline(always)]
    pub fn new(number: u32, wire_type: WireType) -> Option<Self> {
        if number < MINIMUM_FIELD_NUMBER || number > MAXIMUM_FIELD_NUMBER {
            return None;
        }
        let raw = (u64::from(number) << 3) | u64::from(wire_type.into_val());
        NonZeroU64::new(raw).map(ProtoKey)
    }

    /// Returns the [`WireType`] component of this key.
    #[inline(always)]
    pub const fn wire_type(self) -> WireType {
        let raw = (self.0.get() & 0b111) as u8;
        match WireType::from_val(raw) {
            Some(wire_type) => wire_type,
            // Validated during construction.
            None => WireType::Varint,
        }
    }

    /// Returns the field number component of this key.
    #[inline(always)]
    pub const fn field_number(self) -> u32 {
        (self.0.get() >> 3) as u32
    }

    /// Decomposes this key into its field number and [`WireType`].
    #[inline(always)]
    pub const fn into_parts(self) -> (u32, WireType) {
        (self.field_number(), self.wire_type())
    }

    /// The raw `(number << 3) | wire_type` value.
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }
}

impl core::fmt::Debug for ProtoKey {
    #[cold]
    #[inline(never)]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProtoKey")
            .field("field_number", &self.field_number())
            .field("wire_type", &self.wire_type())
            .finish()
    }
}

/// Denotes the type of a field in an encoded protobuf message.
///
/// Protobuf messages are a series of key-value pairs. When encoded each key-value pair
/// is turned into a record consisting of a field number, a [`WireType`], and a payload.
/// The [`WireType`] indicates how large the proceeding payload is.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum WireType {
    /// Variable length integer.
    ///
    /// Used for: `int32`, `int64`, `uint32`, `uint64`, `sint32`, `sint64`, `bool`, `enum`.
    Varint = 0,
    /// 64-bit integer.
    ///
    /// Used for: `fixed64`, `sfixed64`, `double`.
    I64 = 1,
    /// Variable length field.
    ///
    /// Used for: `string`, `bytes`, `message`, packed `repeated` fields.
    Len = 2,
    /// Group start (deprecated).
    SGroup = 3,
    /// Group end (deprecated).
    EGroup = 4,
    /// 32-bit integer.
    ///
    /// Used for: `fixed32`, `sfixed32`, `float`.
    I32 = 5,
}

#[allow(clippy::as_conversions)]
impl WireType {
    /// Maximum value an [`WireType`] can be.
    const MAX_VAL: u8 = WireType::I32 as u8;

    // Compile-time check that our discriminants are contiguous 0..=MAX_VAL.
    //
    // If someone reorders the enum, this will fail to compile.
    const _DISCRIMINANT_CHECK: () = {
        assert!(WireType::Varint as u8 == 0);
        assert!(WireType::I64 as u8 == 1);
        assert!(WireType::Len as u8 == 2);
        assert!(WireType::SGroup as u8 == 3);
        assert!(WireType::EGroup as u8 == 4);
        assert!(WireType::I32 as u8 == 5);
    };

    #[inline(always)]
    const fn from_val(value: u8) -> Option<Self> {
        match value {
            0 => Some(WireType::Varint),
            1 => Some(WireType::I64),
            2 => Some(WireType::Len),
            3 => Some(WireType::SGroup),
            4 => Some(WireType::EGroup),
            5 => Some(WireType::I32),
            _ => None,
        }
    }

    /// Return the raw value for this [`WireType`].
    #[inline(always)]
    pub const fn into_val(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for WireType {
    type Error = DecodeErrorKind;

    #[inline(always)]
    fn try_from(value: u8) -> Result<Self, DecodeErrorKind> {
        WireType::from_val(value).ok_or(DecodeErrorKind::MalformedTag)
    }
}

/// Read position over a contiguous input with a movable frame limit.
///
/// Reads never advance past the offending byte when they fail, the error
/// carries the offset where the bad value starts.
#[derive(Debug, Clone)]
pub struct Cursor<'b> {
    data: &'b [u8],
    pos: usize,
    limit: usize,
}

impl<'b> Cursor<'b> {
    pub fn new(data: &'b [u8]) -> Self {
        Cursor {
            data,
            pos: 0,
            limit: data.len(),
        }
    }

    /// Current byte offset from the start of the input.
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left before the current frame limit.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Whether the cursor reached the current frame limit.
    #[inline(always)]
    pub fn is_at_limit(&self) -> bool {
        self.pos == self.limit
    }

    /// The complete input this cursor reads from.
    pub fn data(&self) -> &'b [u8] {
        self.data
    }

    /// The input bytes between `start` and the current position.
    pub fn consumed_since(&self, start: usize) -> &'b [u8] {
        &self.data[start..self.pos]
    }

    /// A cursor over `len` bytes of the same input starting at `start`,
    /// positions stay relative to the whole input.
    pub fn sub_range(&self, start: usize, len: usize) -> Cursor<'b> {
        debug_assert!(start + len <= self.data.len());
        Cursor {
            data: self.data,
            pos: start,
            limit: start + len,
        }
    }

    #[cold]
    fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError::new(kind, self.pos)
    }

    /// Restrict reads to the next `len` bytes, returning the previous limit
    /// for [`Cursor::pop_limit`].
    #[inline]
    pub fn push_limit(&mut self, len: usize) -> Result<usize, DecodeError> {
        if unlikely(len > self.remaining()) {
            return Err(self.error(DecodeErrorKind::UnexpectedEndOfBuffer));
        }
        let previous = self.limit;
        self.limit = self.pos + len;
        Ok(previous)
    }

    /// Restore a limit returned by [`Cursor::push_limit`].
    #[inline]
    pub fn pop_limit(&mut self, previous: usize) {
        debug_assert!(previous >= self.limit);
        self.limit = previous;
    }

    #[inline]
    pub fn read_varint64(&mut self) -> Result<u64, DecodeError> {
        let chunk = &self.data[self.pos..self.limit];
        match u64::decode_leb128(chunk) {
            Ok((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            Err(kind) => Err(self.error(kind)),
        }
    }

    /// Reads a varint and keeps the low 32 bits.
    #[inline]
    pub fn read_varint32(&mut self) -> Result<u32, DecodeError> {
        let chunk = &self.data[self.pos..self.limit];
        match u32::decode_leb128(chunk) {
            Ok((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            Err(kind) => Err(self.error(kind)),
        }
    }

    #[inline]
    pub fn read_fixed32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_array::<4>()?;
        Ok(u32::from_le_bytes(bytes))
    }

    #[inline]
    pub fn read_fixed64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_array::<8>()?;
        Ok(u64::from_le_bytes(bytes))
    }

    #[inline(always)]
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        match self.data[self.pos..self.limit].first_chunk::<N>() {
            Some(bytes) => {
                self.pos += N;
                Ok(*bytes)
            }
            None => Err(self.error(DecodeErrorKind::UnexpectedEndOfBuffer)),
        }
    }

    /// Decodes the key of the next field.
    ///
    /// Follows the specification from <https://protobuf.dev/programming-guides/encoding>
    /// under the "Message Structure" section.
    #[inline]
    pub fn read_tag(&mut self) -> Result<ProtoKey, DecodeError> {
        let start = self.pos;
        let raw = self.read_varint64()?;
        ProtoKey::try_from_raw(raw).map_err(|kind| {
            self.pos = start;
            DecodeError::new(kind, start)
        })
    }

    /// Reads the varint length prefix of a length-delimited field and checks
    /// that the payload fits in the current frame.
    #[inline]
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let start = self.pos;
        let chunk = &self.data[self.pos..self.limit];
        // Fast path, most lengths fit in one byte (< 128).
        let len = if likely(!chunk.is_empty() && chunk[0] < 0x80) {
            self.pos += 1;
            u64::from(chunk[0])
        } else {
            self.read_varint64()?
        };

        if unlikely(len > MAXIMUM_LENGTH) {
            self.pos = start;
            return Err(DecodeError::new(DecodeErrorKind::LengthOverflow, start));
        }
        let len = usize::cast_from(len);
        if unlikely(len > self.remaining()) {
            self.pos = start;
            return Err(DecodeError::new(
                DecodeErrorKind::UnexpectedEndOfBuffer,
                start,
            ));
        }
        Ok(len)
    }

    /// Reads a length prefix followed by that many bytes.
    #[inline]
    pub fn read_length_delimited(&mut self) -> Result<&'b [u8], DecodeError> {
        let len = self.read_len()?;
        self.read_bytes(len)
    }

    /// Reads exactly `len` raw bytes.
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'b [u8], DecodeError> {
        if unlikely(len > self.remaining()) {
            return Err(self.error(DecodeErrorKind::UnexpectedEndOfBuffer));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Skips over the value of a field whose key was already read.
    ///
    /// Groups are skipped recursively until their matching end tag, at most
    /// `depth` levels deep.
    pub fn skip_field(&mut self, key: ProtoKey, depth: u32) -> Result<(), DecodeError> {
        match key.wire_type() {
            WireType::Varint => {
                self.read_varint64()?;
            }
            WireType::I64 => {
                self.read_bytes(8)?;
            }
            WireType::I32 => {
                self.read_bytes(4)?;
            }
            WireType::Len => {
                let len = self.read_len()?;
                self.read_bytes(len)?;
            }
            WireType::SGroup => {
                if depth == 0 {
                    return Err(self.error(DecodeErrorKind::DepthExceeded));
                }
                loop {
                    if self.is_at_limit() {
                        return Err(self.error(DecodeErrorKind::BadGroupEnd));
                    }
                    let inner = self.read_tag()?;
                    if inner.wire_type() == WireType::EGroup {
                        if inner.field_number() == key.field_number() {
                            return Ok(());
                        }
                        return Err(self.error(DecodeErrorKind::BadGroupEnd));
                    }
                    self.skip_field(inner, depth - 1)?;
                }
            }
            WireType::EGroup => return Err(self.error(DecodeErrorKind::BadGroupEnd)),
        }
        Ok(())
    }
}

/// Encodes the provided field number and wire type as a protobuf field key.
///
/// Hot path for encoding - called for every field in every message.
#[inline(always)]
pub fn encode_key<B: bytes::BufMut>(number: u32, wire_type: WireType, buf: &mut B) {
    let key = (number << 3) | u32::cast_from(wire_type.into_val());
    key.encode_leb128(buf);
}

/// Returns the encoded length of a field key.
#[inline(always)]
pub fn encoded_key_len(number: u32) -> usize {
    // The wire type only occupies the low three bits and never changes the
    // encoded length.
    (number << 3).encoded_leb128_len()
}

/// Encodes a varint value.
#[inline(always)]
pub fn encode_varint<B: bytes::BufMut>(value: u64, buf: &mut B) {
    value.encode_leb128(buf);
}

/// Encoded length of a varint value.
#[inline(always)]
pub fn encoded_varint_len(value: u64) -> usize {
    value.encoded_leb128_len()
}

/// Length of a length-delimited record payload including its length prefix.
#[inline(always)]
pub fn encoded_len_delimited_len(len: usize) -> usize {
    encoded_varint_len(u64::cast_from(len)) + len
}
