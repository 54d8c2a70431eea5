//! Message layouts: the concrete byte arrangement of one message type.
//!
//! A [`MessageLayout`] is immutable once built and lives inside a
//! [`LayoutSet`], which also owns the enum and extension layouts its fields
//! refer to. Layouts reference each other by index so a set can describe
//! recursive and mutually recursive messages.

pub mod builder;
mod enums;
mod extension;
mod index;
pub mod mini_descriptor;

use core::fmt;
use core::ops::Deref;

pub use builder::{FieldSpec, Label, MessageKind, MessageSpec};
pub use enums::EnumLayout;
pub use extension::{ExtensionLayout, ExtensionRegistry};

use crate::error::LayoutError;
use crate::util::CastFrom;
use crate::wire::WireType;

/// Sentinel stored in [`FieldEntry::sub_index`] for fields without a
/// sub-layout.
pub(crate) const NO_SUB: u16 = u16::MAX;

/// The 18 protobuf field types, numbered as in `descriptor.proto`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FieldType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    UInt64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    UInt32 = 13,
    Enum = 14,
    SFixed32 = 15,
    SFixed64 = 16,
    SInt32 = 17,
    SInt64 = 18,
}

impl FieldType {
    pub fn from_i32(value: i32) -> Option<Self> {
        let ty = match value {
            1 => FieldType::Double,
            2 => FieldType::Float,
            3 => FieldType::Int64,
            4 => FieldType::UInt64,
            5 => FieldType::Int32,
            6 => FieldType::Fixed64,
            7 => FieldType::Fixed32,
            8 => FieldType::Bool,
            9 => FieldType::String,
            10 => FieldType::Group,
            11 => FieldType::Message,
            12 => FieldType::Bytes,
            13 => FieldType::UInt32,
            14 => FieldType::Enum,
            15 => FieldType::SFixed32,
            16 => FieldType::SFixed64,
            17 => FieldType::SInt32,
            18 => FieldType::SInt64,
            _ => return None,
        };
        Some(ty)
    }

    /// The value category exposed through reflection.
    pub const fn ctype(self) -> CType {
        match self {
            FieldType::Double => CType::Double,
            FieldType::Float => CType::Float,
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => CType::Int64,
            FieldType::UInt64 | FieldType::Fixed64 => CType::UInt64,
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => CType::Int32,
            FieldType::UInt32 | FieldType::Fixed32 => CType::UInt32,
            FieldType::Bool => CType::Bool,
            FieldType::Enum => CType::Enum,
            FieldType::String => CType::String,
            FieldType::Bytes => CType::Bytes,
            FieldType::Message | FieldType::Group => CType::Message,
        }
    }

    /// The wire type of a single, unpacked value of this type.
    pub const fn wire_type(self) -> WireType {
        match self {
            FieldType::Double | FieldType::Fixed64 | FieldType::SFixed64 => WireType::I64,
            FieldType::Float | FieldType::Fixed32 | FieldType::SFixed32 => WireType::I32,
            FieldType::String | FieldType::Bytes | FieldType::Message => WireType::Len,
            FieldType::Group => WireType::SGroup,
            FieldType::Int64
            | FieldType::UInt64
            | FieldType::Int32
            | FieldType::Bool
            | FieldType::UInt32
            | FieldType::Enum
            | FieldType::SInt32
            | FieldType::SInt64 => WireType::Varint,
        }
    }

    /// Whether repeated fields of this type may use the packed encoding.
    pub const fn is_packable(self) -> bool {
        !matches!(
            self,
            FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group
        )
    }

    /// Whether values of this type are sub-messages.
    pub const fn is_message(self) -> bool {
        matches!(self, FieldType::Message | FieldType::Group)
    }

    /// Storage representation of a single (non-repeated) value.
    pub const fn rep(self) -> Rep {
        match self {
            FieldType::Bool => Rep::OneByte,
            FieldType::Float
            | FieldType::Int32
            | FieldType::UInt32
            | FieldType::SInt32
            | FieldType::Fixed32
            | FieldType::SFixed32
            | FieldType::Enum => Rep::FourByte,
            FieldType::String | FieldType::Bytes => Rep::StringView,
            FieldType::Double
            | FieldType::Int64
            | FieldType::UInt64
            | FieldType::SInt64
            | FieldType::Fixed64
            | FieldType::SFixed64
            | FieldType::Message
            | FieldType::Group => Rep::EightByte,
        }
    }
}

/// Value categories, the discriminant of [`crate::Value`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CType {
    Bool,
    Float,
    Int32,
    UInt32,
    Enum,
    Message,
    Double,
    Int64,
    UInt64,
    String,
    Bytes,
}

/// Storage representation of a field slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Rep {
    OneByte = 0,
    FourByte = 1,
    /// Pointer and length, two words.
    StringView = 2,
    /// 64-bit scalars and every pointer (sub-messages, arrays, maps).
    EightByte = 3,
}

impl Rep {
    pub const fn size(self) -> usize {
        match self {
            Rep::OneByte => 1,
            Rep::FourByte => 4,
            Rep::StringView => 16,
            Rep::EightByte => 8,
        }
    }

    pub const fn align(self) -> usize {
        match self {
            Rep::OneByte => 1,
            Rep::FourByte => 4,
            Rep::StringView | Rep::EightByte => 8,
        }
    }
}

/// Cardinality of a field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FieldMode {
    Scalar,
    Array,
    Map,
}

/// Bit flags OR'd onto a field's mode.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldFlags(u8);

impl FieldFlags {
    /// Repeated scalar emitted as one length-delimited block.
    pub const PACKED: FieldFlags = FieldFlags(1 << 0);
    /// Field belongs to an [`ExtensionLayout`].
    pub const EXTENSION: FieldFlags = FieldFlags(1 << 1);
    /// Declared type is handled like its storage type: an open enum behaves
    /// like `int32` and a string skips UTF-8 validation.
    pub const ALTERNATE: FieldFlags = FieldFlags(1 << 2);

    pub const fn empty() -> Self {
        FieldFlags(0)
    }

    pub const fn contains(self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FieldFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FieldFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for FieldFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(FieldFlags::PACKED) {
            set.entry(&"PACKED");
        }
        if self.contains(FieldFlags::EXTENSION) {
            set.entry(&"EXTENSION");
        }
        if self.contains(FieldFlags::ALTERNATE) {
            set.entry(&"ALTERNATE");
        }
        set.finish()
    }
}

/// Runtime record describing one field's number, storage and type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub(crate) number: u32,
    /// Byte offset of the slot from the start of the instance's field data.
    pub(crate) offset: u16,
    /// Positive: hasbit index. Negative: `!case_offset` of the owning oneof.
    /// Zero: implicit presence.
    pub(crate) presence: i32,
    pub(crate) sub_index: u16,
    pub(crate) descriptor_type: FieldType,
    pub(crate) mode: FieldMode,
    pub(crate) flags: FieldFlags,
    pub(crate) rep: Rep,
}

impl FieldEntry {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn presence(&self) -> i32 {
        self.presence
    }

    pub fn field_type(&self) -> FieldType {
        self.descriptor_type
    }

    pub fn ctype(&self) -> CType {
        self.descriptor_type.ctype()
    }

    pub fn mode(&self) -> FieldMode {
        self.mode
    }

    pub fn rep(&self) -> Rep {
        self.rep
    }

    pub fn flags(&self) -> FieldFlags {
        self.flags
    }

    /// Index into the owning layout's sub-layout table.
    pub fn sub_index(&self) -> Option<u16> {
        (self.sub_index != NO_SUB).then_some(self.sub_index)
    }

    /// The hasbit index tracking this field, if any.
    pub fn hasbit(&self) -> Option<u16> {
        u16::try_from(self.presence).ok().filter(|bit| *bit > 0)
    }

    /// Offset of the case slot of the oneof this field belongs to.
    pub fn oneof_case_offset(&self) -> Option<u16> {
        if self.presence < 0 {
            u16::try_from(!self.presence).ok()
        } else {
            None
        }
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Array
    }

    pub fn is_map(&self) -> bool {
        self.mode == FieldMode::Map
    }

    pub fn is_packed(&self) -> bool {
        self.flags.contains(FieldFlags::PACKED)
    }

    pub fn is_extension(&self) -> bool {
        self.flags.contains(FieldFlags::EXTENSION)
    }

    pub fn is_sub_message(&self) -> bool {
        self.descriptor_type.is_message()
    }

    /// Enum whose unknown values are diverted to the unknown-field buffer.
    pub fn is_closed_enum(&self) -> bool {
        self.descriptor_type == FieldType::Enum && !self.flags.contains(FieldFlags::ALTERNATE)
    }

    pub fn validates_utf8(&self) -> bool {
        self.descriptor_type == FieldType::String && !self.flags.contains(FieldFlags::ALTERNATE)
    }

    /// Whether the field tracks presence explicitly (hasbit or oneof).
    pub fn has_presence(&self) -> bool {
        self.presence != 0
    }

    /// Size in bytes of a single element of a repeated field, or of the slot
    /// of a singular field.
    pub(crate) fn element_size(&self) -> usize {
        self.descriptor_type.rep().size()
    }
}

/// Extension handling of a message layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExtMode {
    NonExtendable,
    Extendable,
    /// Legacy extension-only message with its own wire encoding.
    MessageSet,
    /// Synthetic key/value message backing a map field.
    MapEntry,
}

/// Reference from a field to the layout of its values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SubLayout {
    /// Not linked yet: message data can't be decoded and a closed enum
    /// accepts every value.
    Unlinked,
    Message(LayoutId),
    Enum(EnumId),
}

/// Case and data slot of one oneof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneofLayout {
    pub(crate) case_offset: u16,
    pub(crate) data_offset: u16,
    /// Member field numbers, ascending.
    pub(crate) members: Box<[u32]>,
}

impl OneofLayout {
    pub fn case_offset(&self) -> u16 {
        self.case_offset
    }

    pub fn data_offset(&self) -> u16 {
        self.data_offset
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }
}

macro_rules! layout_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                usize::cast_from(self.0)
            }

            pub(crate) fn from_index(index: usize) -> Self {
                $name(u32::try_from(index).unwrap_or(u32::MAX))
            }
        }
    };
}

layout_id!(
    /// Index of a [`MessageLayout`] within its [`LayoutSet`].
    LayoutId
);
layout_id!(
    /// Index of an [`EnumLayout`] within its [`LayoutSet`].
    EnumId
);
layout_id!(
    /// Index of an [`ExtensionLayout`] within its [`LayoutSet`].
    ExtensionId
);

/// Computed byte arrangement of one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLayout {
    /// Bytes of field data per instance, a multiple of 8.
    pub(crate) size: u16,
    /// Sorted by field number.
    pub(crate) fields: Box<[FieldEntry]>,
    pub(crate) subs: Box<[SubLayout]>,
    /// `fields[..dense_below]` are numbered `1..=dense_below`.
    pub(crate) dense_below: u16,
    pub(crate) required_count: u8,
    pub(crate) ext_mode: ExtMode,
    pub(crate) oneofs: Box<[OneofLayout]>,
}

impl MessageLayout {
    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn fields(&self) -> &[FieldEntry] {
        &self.fields
    }

    pub fn subs(&self) -> &[SubLayout] {
        &self.subs
    }

    pub fn dense_below(&self) -> u16 {
        self.dense_below
    }

    pub fn required_count(&self) -> u8 {
        self.required_count
    }

    pub fn ext_mode(&self) -> ExtMode {
        self.ext_mode
    }

    pub fn oneofs(&self) -> &[OneofLayout] {
        &self.oneofs
    }

    pub fn is_extendable(&self) -> bool {
        matches!(self.ext_mode, ExtMode::Extendable | ExtMode::MessageSet)
    }

    /// Hasbits of all required fields, bits `1..=required_count`.
    pub fn required_mask(&self) -> u64 {
        match self.required_count {
            0 => 0,
            count => (u64::MAX >> (64 - u32::from(count))) << 1,
        }
    }

    /// Bytes at the start of the instance reserved for hasbits.
    pub fn hasbit_bytes(&self) -> usize {
        let last = self
            .fields
            .iter()
            .filter_map(FieldEntry::hasbit)
            .max()
            .unwrap_or(0);
        if last == 0 {
            0
        } else {
            usize::cast_from(last) / 8 + 1
        }
    }

    /// The oneof a field belongs to.
    pub fn oneof_of(&self, field: &FieldEntry) -> Option<&OneofLayout> {
        let case = field.oneof_case_offset()?;
        self.oneofs.iter().find(|oneof| oneof.case_offset == case)
    }

    pub(crate) fn sub(&self, field: &FieldEntry) -> SubLayout {
        field
            .sub_index()
            .and_then(|index| self.subs.get(usize::from(index)).copied())
            .unwrap_or(SubLayout::Unlinked)
    }
}

/// Owner of a family of message, enum and extension layouts.
#[derive(Debug, Clone, Default)]
pub struct LayoutSet {
    messages: Vec<MessageLayout>,
    enums: Vec<EnumLayout>,
    extensions: Vec<ExtensionLayout>,
}

impl LayoutSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn enum_count(&self) -> usize {
        self.enums.len()
    }

    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }

    /// Id the next added message layout will receive.
    pub fn next_layout_id(&self) -> LayoutId {
        LayoutId::from_index(self.messages.len())
    }

    /// Id the next added enum layout will receive.
    pub fn next_enum_id(&self) -> EnumId {
        EnumId::from_index(self.enums.len())
    }

    pub fn add_message(&mut self, layout: MessageLayout) -> LayoutId {
        let id = self.next_layout_id();
        self.messages.push(layout);
        id
    }

    /// Build a layout from a field-level description and add it.
    pub fn build_message(&mut self, spec: &MessageSpec) -> Result<LayoutId, LayoutError> {
        let layout = builder::build_layout(spec)?;
        Ok(self.add_message(layout))
    }

    /// Build a message layout from its compact (base-92) encoding.
    ///
    /// Sub-message and closed-enum fields start out unlinked, see
    /// [`LayoutSet::link_message`] and [`LayoutSet::link_enum`].
    pub fn add_mini_descriptor(&mut self, encoded: &str) -> Result<LayoutId, LayoutError> {
        let spec = mini_descriptor::decode_message(encoded)?;
        self.build_message(&spec)
    }

    pub fn add_enum(&mut self, layout: EnumLayout) -> EnumId {
        let id = self.next_enum_id();
        self.enums.push(layout);
        id
    }

    /// Build an enum layout from its compact encoding.
    pub fn add_enum_mini_descriptor(&mut self, encoded: &str) -> Result<EnumId, LayoutError> {
        let layout = mini_descriptor::decode_enum(encoded)?;
        Ok(self.add_enum(layout))
    }

    pub fn add_extension(&mut self, extension: ExtensionLayout) -> Result<ExtensionId, LayoutError> {
        let extendee = self
            .messages
            .get(extension.extendee.index())
            .ok_or_else(|| LayoutError::Link(format!("no layout {:?}", extension.extendee)))?;
        if !extendee.is_extendable() {
            return Err(LayoutError::Link(format!(
                "layout {:?} is not extendable",
                extension.extendee
            )));
        }
        if extendee.ext_mode == ExtMode::MessageSet
            && (!extension.field.is_sub_message() || extension.field.mode != FieldMode::Scalar)
        {
            return Err(LayoutError::Link(
                "message set extensions must be singular messages".to_string(),
            ));
        }
        let id = ExtensionId::from_index(self.extensions.len());
        self.extensions.push(extension);
        Ok(id)
    }

    /// Build an extension from its compact encoding and add it.
    pub fn add_extension_mini_descriptor(
        &mut self,
        encoded: &str,
        extendee: LayoutId,
        sub: SubLayout,
    ) -> Result<ExtensionId, LayoutError> {
        let spec = mini_descriptor::decode_extension(encoded)?;
        let extension = ExtensionLayout::from_spec(&spec, extendee, sub)?;
        self.add_extension(extension)
    }

    pub fn message(&self, id: LayoutId) -> LayoutRef<'_> {
        LayoutRef { set: self, id }
    }

    pub fn layout(&self, id: LayoutId) -> &MessageLayout {
        &self.messages[id.index()]
    }

    pub fn enum_layout(&self, id: EnumId) -> &EnumLayout {
        &self.enums[id.index()]
    }

    pub fn extension(&self, id: ExtensionId) -> &ExtensionLayout {
        &self.extensions[id.index()]
    }

    pub fn extensions(&self) -> impl Iterator<Item = (ExtensionId, &ExtensionLayout)> {
        self.extensions
            .iter()
            .enumerate()
            .map(|(index, ext)| (ExtensionId::from_index(index), ext))
    }

    fn field_mut(
        &mut self,
        id: LayoutId,
        number: u32,
    ) -> Result<(usize, &mut MessageLayout), LayoutError> {
        let layout = self
            .messages
            .get_mut(id.index())
            .ok_or_else(|| LayoutError::Link(format!("no layout {id:?}")))?;
        let position = layout
            .fields
            .iter()
            .position(|field| field.number == number)
            .ok_or_else(|| LayoutError::Link(format!("no field {number} in layout {id:?}")))?;
        Ok((position, layout))
    }

    /// Point a message or group field of `id` at the layout of its values.
    ///
    /// Linking a repeated message field to a map-entry layout turns the
    /// field into a map.
    pub fn link_message(
        &mut self,
        id: LayoutId,
        number: u32,
        sub: LayoutId,
    ) -> Result<(), LayoutError> {
        let sub_mode = self
            .messages
            .get(sub.index())
            .map(|layout| layout.ext_mode)
            .ok_or_else(|| LayoutError::Link(format!("no layout {sub:?}")))?;

        let (position, layout) = self.field_mut(id, number)?;
        let field = &layout.fields[position];
        if !field.is_sub_message() {
            return Err(LayoutError::Link(format!("field {number} is not a message")));
        }
        let mode = match (sub_mode, field.mode) {
            (ExtMode::MapEntry, FieldMode::Array | FieldMode::Map) => FieldMode::Map,
            (ExtMode::MapEntry, FieldMode::Scalar) => {
                return Err(LayoutError::Link(format!(
                    "map entry linked to non-repeated field {number}"
                )));
            }
            (_, FieldMode::Map) => {
                return Err(LayoutError::Link(format!(
                    "map field {number} linked to a non map-entry layout"
                )));
            }
            (_, mode) => mode,
        };
        let index = field
            .sub_index()
            .ok_or_else(|| LayoutError::Link(format!("field {number} has no sub slot")))?;

        layout.subs[usize::from(index)] = SubLayout::Message(sub);
        layout.fields[position].mode = mode;
        Ok(())
    }

    /// Point a closed-enum field of `id` at its value set.
    pub fn link_enum(&mut self, id: LayoutId, number: u32, sub: EnumId) -> Result<(), LayoutError> {
        if sub.index() >= self.enums.len() {
            return Err(LayoutError::Link(format!("no enum {sub:?}")));
        }
        let (position, layout) = self.field_mut(id, number)?;
        let field = &layout.fields[position];
        if !field.is_closed_enum() {
            return Err(LayoutError::Link(format!("field {number} is not a closed enum")));
        }
        let index = field
            .sub_index()
            .ok_or_else(|| LayoutError::Link(format!("field {number} has no sub slot")))?;
        layout.subs[usize::from(index)] = SubLayout::Enum(sub);
        Ok(())
    }
}

/// A message layout together with the set that resolves its references.
#[derive(Clone, Copy)]
pub struct LayoutRef<'s> {
    set: &'s LayoutSet,
    id: LayoutId,
}

impl<'s> LayoutRef<'s> {
    pub fn set(&self) -> &'s LayoutSet {
        self.set
    }

    pub fn id(&self) -> LayoutId {
        self.id
    }

    pub fn layout(&self) -> &'s MessageLayout {
        self.set.layout(self.id)
    }

    /// Layout of the values of a message-typed field, if linked.
    pub fn sub_message(&self, field: &FieldEntry) -> Option<LayoutRef<'s>> {
        match self.layout().sub(field) {
            SubLayout::Message(id) => Some(self.set.message(id)),
            _ => None,
        }
    }

    /// Value set of a closed-enum field, if linked.
    pub fn sub_enum(&self, field: &FieldEntry) -> Option<&'s EnumLayout> {
        match self.layout().sub(field) {
            SubLayout::Enum(id) => Some(self.set.enum_layout(id)),
            _ => None,
        }
    }

    /// Whether both refer to the same layout of the same set.
    pub fn same_as(&self, other: &LayoutRef<'_>) -> bool {
        core::ptr::eq(self.set, other.set) && self.id == other.id
    }
}

impl<'s> Deref for LayoutRef<'s> {
    type Target = MessageLayout;

    fn deref(&self) -> &MessageLayout {
        self.set.layout(self.id)
    }
}

impl fmt::Debug for LayoutRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutRef")
            .field("id", &self.id)
            .field("size", &self.layout().size)
            .field("fields", &self.layout().fields.len())
            .finish()
    }
}
