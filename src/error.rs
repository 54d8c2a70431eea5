//! Error types for every stage of the engine.
//!
//! Wire errors keep a small `Copy` kind plus the byte offset where decoding
//! stopped, schema errors carry the fully-qualified name of the offending
//! symbol.

use core::fmt;

use crate::layout::CType;

/// What went wrong while reading protobuf wire data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DecodeErrorKind {
    /// A varint ran past 10 bytes or past the end of its enclosing frame.
    MalformedVarint,
    /// The input ended inside a varint.
    ///
    /// Only surfaced by the standalone wire primitives, a complete decode
    /// reports this as [`DecodeErrorKind::MalformedVarint`].
    NeedMoreData,
    /// Reserved wire type (6 or 7) or a field number outside `1..=2^29-1`.
    MalformedTag,
    /// A fixed-width or length-delimited value was truncated.
    UnexpectedEndOfBuffer,
    /// Sub-message or group nesting exceeded the configured maximum.
    DepthExceeded,
    /// An end-group tag didn't match the enclosing start-group tag.
    BadGroupEnd,
    /// A string field that validates UTF-8 contained invalid data.
    BadUtf8,
    /// A required field was absent at the end of its message.
    MissingRequired,
    /// The arena could not satisfy an allocation.
    OutOfMemory,
    /// A packed block of fixed-width values had a length that isn't a
    /// multiple of the element size.
    InvalidPackedLength,
    /// A length prefix was larger than `i32::MAX`.
    LengthOverflow,
    /// A sub-message field was present on the wire but its layout was never
    /// linked.
    UnlinkedSubMessage,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorKind::MalformedVarint => write!(f, "malformed varint"),
            DecodeErrorKind::NeedMoreData => write!(f, "input ended inside a varint"),
            DecodeErrorKind::MalformedTag => write!(f, "malformed tag"),
            DecodeErrorKind::UnexpectedEndOfBuffer => write!(f, "unexpected end of buffer"),
            DecodeErrorKind::DepthExceeded => write!(f, "maximum nesting depth exceeded"),
            DecodeErrorKind::BadGroupEnd => write!(f, "end-group tag does not match start-group"),
            DecodeErrorKind::BadUtf8 => write!(f, "invalid UTF-8 in string field"),
            DecodeErrorKind::MissingRequired => write!(f, "missing required field"),
            DecodeErrorKind::OutOfMemory => write!(f, "arena out of memory"),
            DecodeErrorKind::InvalidPackedLength => {
                write!(f, "packed field length is not a multiple of the element size")
            }
            DecodeErrorKind::LengthOverflow => write!(f, "length prefix exceeds i32::MAX"),
            DecodeErrorKind::UnlinkedSubMessage => {
                write!(f, "unlinked sub-message field was present")
            }
        }
    }
}

/// A [`DecodeErrorKind`] together with the byte offset where it occurred.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[error("{kind} at byte offset {offset}")]
pub struct DecodeError {
    kind: DecodeErrorKind,
    offset: usize,
}

impl DecodeError {
    #[cold]
    pub fn new(kind: DecodeErrorKind, offset: usize) -> Self {
        DecodeError { kind, offset }
    }

    /// The kind of failure.
    pub fn kind(&self) -> DecodeErrorKind {
        self.kind
    }

    /// Byte offset into the input where the failure was detected.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Failure returned by [`crate::Arena`] allocations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("arena out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },
}

/// Failure while serializing a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("missing required field {field}")]
    MissingRequired { field: u32 },
    #[error("maximum nesting depth exceeded")]
    DepthExceeded,
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Failure while building or linking a message layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    /// The compact (base-92) encoding was malformed.
    #[error("invalid descriptor encoding: {0}")]
    InvalidDescriptorEncoding(String),
    /// The instance size exceeded 65535 bytes.
    #[error("message layout of {size} bytes exceeds the 65535 byte limit")]
    LayoutOverflow { size: usize },
    #[error("invalid map entry: {0}")]
    InvalidMapEntry(&'static str),
    #[error("too many required fields: {count} (max 63)")]
    TooManyRequired { count: usize },
    #[error("invalid field {number}: {reason}")]
    InvalidField { number: u32, reason: &'static str },
    #[error("oneof {index} has no fields")]
    EmptyOneof { index: usize },
    #[error("link failed: {0}")]
    Link(String),
}

impl LayoutError {
    #[cold]
    pub(crate) fn encoding(reason: impl Into<String>) -> Self {
        LayoutError::InvalidDescriptorEncoding(reason.into())
    }
}

/// Misuse of the reflection surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReflectError {
    #[error("type mismatch for field {field}: expected {expected:?}")]
    TypeMismatch { field: u32, expected: CType },
    #[error("field {field} is not repeated")]
    NotRepeated { field: u32 },
    #[error("field {field} is not a map")]
    NotMap { field: u32 },
    #[error("field {field} is repeated")]
    NotSingular { field: u32 },
    #[error("field {field} is not a message")]
    NotMessage { field: u32 },
    #[error("field {field} has no linked sub-layout")]
    Unlinked { field: u32 },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("value belongs to a different arena or layout")]
    ForeignValue,
    #[error("extension does not extend this message")]
    WrongExtendee,
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Failure while adding descriptors to a [`crate::SchemaContext`].
///
/// Every variant except [`SchemaError::Decode`] names the offending symbol.
/// When any of these is returned the context is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("{symbol}: unresolved reference to '{name}'")]
    UnresolvedReference { symbol: String, name: String },
    #[error("duplicate symbol '{symbol}'")]
    DuplicateSymbol { symbol: String },
    #[error("file '{name}' was already added with different contents")]
    DuplicateFile { name: String },
    #[error("{symbol}: layout of {size} bytes exceeds the 65535 byte limit")]
    LayoutOverflow { symbol: String, size: usize },
    #[error("{symbol}: invalid descriptor encoding: {reason}")]
    InvalidDescriptorEncoding { symbol: String, reason: String },
    #[error("{symbol}: {reason}")]
    InvalidDescriptor { symbol: String, reason: String },
    #[error("failed to parse descriptor set: {0}")]
    Decode(#[from] DecodeError),
}

impl SchemaError {
    #[cold]
    pub(crate) fn invalid(symbol: &str, reason: impl Into<String>) -> Self {
        SchemaError::InvalidDescriptor {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach a symbol name to a layout failure.
    #[cold]
    pub(crate) fn from_layout(symbol: &str, err: LayoutError) -> Self {
        match err {
            LayoutError::LayoutOverflow { size } => SchemaError::LayoutOverflow {
                symbol: symbol.to_string(),
                size,
            },
            LayoutError::InvalidDescriptorEncoding(reason) => {
                SchemaError::InvalidDescriptorEncoding {
                    symbol: symbol.to_string(),
                    reason,
                }
            }
            other => SchemaError::invalid(symbol, other.to_string()),
        }
    }
}
