//! Computes a [`MessageLayout`] from a field-level description.
//!
//! Fields are placed by representation, largest alignment first, so the
//! instance needs as little padding as possible. Oneof members share one data
//! slot sized for their largest member plus a 4-byte case slot.

use super::index::dense_prefix;
use super::{
    ExtMode, FieldEntry, FieldFlags, FieldMode, FieldType, MessageLayout, NO_SUB, OneofLayout,
    Rep, SubLayout,
};
use crate::error::LayoutError;
use crate::util::align_up;
use crate::wire::{MAXIMUM_FIELD_NUMBER, MINIMUM_FIELD_NUMBER};

/// Largest instance a layout may describe.
pub const MAX_LAYOUT_SIZE: usize = u16::MAX as usize;

/// Most required fields one message may have, they all need a hasbit in
/// the 64-bit required mask.
pub const MAX_REQUIRED_FIELDS: usize = 63;

/// Shape of the message being described.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MessageKind {
    #[default]
    Message,
    MapEntry,
    MessageSet,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Label {
    #[default]
    Optional,
    Required,
    Repeated,
}

/// Description of one field handed to the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub number: u32,
    pub field_type: FieldType,
    pub label: Label,
    /// Use the packed encoding. Ignored unless repeated and packable.
    pub packed: bool,
    /// Proto3 singular field: no hasbit, zero values are not serialized.
    pub implicit_presence: bool,
    pub validate_utf8: bool,
    /// Only meaningful for enums, unknown values go to the unknown fields.
    pub closed_enum: bool,
    /// Repeated message field whose values are map entries.
    pub map: bool,
    /// Index of the oneof this field belongs to.
    pub oneof: Option<usize>,
    pub sub: SubLayout,
}

impl FieldSpec {
    /// An optional proto2-style field of the given type.
    pub fn new(number: u32, field_type: FieldType) -> Self {
        FieldSpec {
            number,
            field_type,
            label: Label::Optional,
            packed: false,
            implicit_presence: false,
            validate_utf8: false,
            closed_enum: true,
            map: false,
            oneof: None,
            sub: SubLayout::Unlinked,
        }
    }

    fn is_repeated(&self) -> bool {
        self.label == Label::Repeated
    }

    fn has_hasbit(&self) -> bool {
        self.label != Label::Repeated && !self.implicit_presence && self.oneof.is_none()
    }

    fn needs_sub(&self) -> bool {
        self.field_type.is_message() || (self.field_type == FieldType::Enum && self.closed_enum)
    }

    fn flags(&self) -> FieldFlags {
        let mut flags = FieldFlags::empty();
        if self.packed && self.is_repeated() && self.field_type.is_packable() {
            flags.insert(FieldFlags::PACKED);
        }
        let alternate = match self.field_type {
            FieldType::Enum => !self.closed_enum,
            FieldType::String => !self.validate_utf8,
            _ => false,
        };
        if alternate {
            flags.insert(FieldFlags::ALTERNATE);
        }
        flags
    }

    fn mode(&self) -> FieldMode {
        match (self.map, self.label) {
            (true, _) => FieldMode::Map,
            (false, Label::Repeated) => FieldMode::Array,
            (false, _) => FieldMode::Scalar,
        }
    }

    /// Representation of the slot this field occupies in the instance.
    fn slot_rep(&self) -> Rep {
        match self.mode() {
            FieldMode::Scalar => self.field_type.rep(),
            FieldMode::Array | FieldMode::Map => Rep::EightByte,
        }
    }

    fn validate(&self, oneof_count: usize) -> Result<(), LayoutError> {
        let invalid = |reason| LayoutError::InvalidField {
            number: self.number,
            reason,
        };

        if self.number < MINIMUM_FIELD_NUMBER || self.number > MAXIMUM_FIELD_NUMBER {
            return Err(invalid("field number out of range"));
        }
        match self.label {
            Label::Repeated if self.implicit_presence => {
                return Err(invalid("repeated field cannot have implicit presence"));
            }
            Label::Required if self.implicit_presence => {
                return Err(invalid("field cannot be both singular and required"));
            }
            _ => {}
        }
        if self.implicit_presence && self.field_type.is_message() {
            return Err(invalid("cannot be a singular submessage"));
        }
        if self.map && (!self.is_repeated() || self.field_type != FieldType::Message) {
            return Err(invalid("map field must be a repeated message"));
        }
        if let Some(oneof) = self.oneof {
            if oneof >= oneof_count {
                return Err(invalid("oneof index out of range"));
            }
            if self.label != Label::Optional || self.implicit_presence {
                return Err(invalid("cannot add repeated, required, or singular field to oneof"));
            }
        }
        Ok(())
    }
}

/// Field-level description of a whole message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageSpec {
    pub kind: MessageKind,
    pub extendable: bool,
    pub fields: Vec<FieldSpec>,
    /// Number of oneofs referenced by [`FieldSpec::oneof`].
    pub oneof_count: usize,
}

/// What a placed item stores.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ItemKind {
    Field,
    OneofCase,
    OneofData,
}

#[derive(Debug)]
struct Item {
    rep: Rep,
    kind: ItemKind,
    /// Field index for [`ItemKind::Field`], oneof index otherwise.
    index: usize,
    offset: usize,
}

impl Item {
    fn sort_key(&self) -> (u8, ItemKind, usize) {
        let rank = match self.rep {
            Rep::StringView => 0,
            Rep::EightByte => 1,
            Rep::FourByte => 2,
            Rep::OneByte => 3,
        };
        (rank, self.kind, self.index)
    }
}

/// Build a layout, every sub-layout stays as given in the field specs.
pub fn build_layout(spec: &MessageSpec) -> Result<MessageLayout, LayoutError> {
    let layout = match spec.kind {
        MessageKind::Message => build_message(spec)?,
        MessageKind::MapEntry => build_map_entry(spec)?,
        MessageKind::MessageSet => {
            if !spec.fields.is_empty() || spec.oneof_count != 0 {
                return Err(LayoutError::encoding("message set cannot declare fields"));
            }
            MessageLayout {
                size: 0,
                fields: Box::default(),
                subs: Box::default(),
                dense_below: 0,
                required_count: 0,
                ext_mode: ExtMode::MessageSet,
                oneofs: Box::default(),
            }
        }
    };

    tracing::debug!(
        kind = ?spec.kind,
        size = layout.size,
        fields = layout.fields.len(),
        ext_mode = ?layout.ext_mode,
        "built message layout"
    );
    Ok(layout)
}

fn build_message(spec: &MessageSpec) -> Result<MessageLayout, LayoutError> {
    let mut fields: Vec<&FieldSpec> = spec.fields.iter().collect();
    fields.sort_by_key(|field| field.number);

    for field in &fields {
        field.validate(spec.oneof_count)?;
    }
    if let Some(pair) = fields.windows(2).find(|pair| pair[0].number == pair[1].number) {
        return Err(LayoutError::InvalidField {
            number: pair[0].number,
            reason: "duplicate field number",
        });
    }

    // Hasbits, required fields take the lowest bits starting at 1.
    let mut hasbits = vec![0i32; fields.len()];
    let required: Vec<usize> = (0..fields.len())
        .filter(|i| fields[*i].label == Label::Required)
        .collect();
    if required.len() > MAX_REQUIRED_FIELDS {
        return Err(LayoutError::TooManyRequired {
            count: required.len(),
        });
    }
    let mut next_bit = 1;
    for i in required {
        hasbits[i] = next_bit;
        next_bit += 1;
    }
    for (i, field) in fields.iter().enumerate() {
        if field.has_hasbit() && field.label != Label::Required {
            hasbits[i] = next_bit;
            next_bit += 1;
        }
    }
    let last_bit = usize::try_from(next_bit - 1).unwrap_or(0);
    let hasbit_bytes = if last_bit == 0 { 0 } else { last_bit / 8 + 1 };

    // Oneof members, in field-number order.
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); spec.oneof_count];
    for (i, field) in fields.iter().enumerate() {
        if let Some(oneof) = field.oneof {
            members[oneof].push(i);
        }
    }
    if let Some(index) = members.iter().position(Vec::is_empty) {
        return Err(LayoutError::EmptyOneof { index });
    }

    let mut items = Vec::with_capacity(fields.len() + 2 * spec.oneof_count);
    for (index, field) in fields.iter().enumerate() {
        if field.oneof.is_none() {
            items.push(Item {
                rep: field.slot_rep(),
                kind: ItemKind::Field,
                index,
                offset: 0,
            });
        }
    }
    for (index, group) in members.iter().enumerate() {
        let data_rep = group
            .iter()
            .map(|i| fields[*i].slot_rep())
            .max_by_key(|rep| rep.size())
            .unwrap_or(Rep::OneByte);
        items.push(Item {
            rep: Rep::FourByte,
            kind: ItemKind::OneofCase,
            index,
            offset: 0,
        });
        items.push(Item {
            rep: data_rep,
            kind: ItemKind::OneofData,
            index,
            offset: 0,
        });
    }
    items.sort_by_key(Item::sort_key);

    let mut cursor = hasbit_bytes;
    for item in &mut items {
        item.offset = align_up(cursor, item.rep.align());
        cursor = item.offset + item.rep.size();
    }
    let size = align_up(cursor, 8);
    if size > MAX_LAYOUT_SIZE {
        return Err(LayoutError::LayoutOverflow { size });
    }

    let mut field_offsets = vec![0u16; fields.len()];
    let mut oneof_slots = vec![(0u16, 0u16); spec.oneof_count];
    for item in &items {
        // Bounded by `size` above.
        let offset = u16::try_from(item.offset).unwrap_or(u16::MAX);
        match item.kind {
            ItemKind::Field => field_offsets[item.index] = offset,
            ItemKind::OneofCase => oneof_slots[item.index].0 = offset,
            ItemKind::OneofData => oneof_slots[item.index].1 = offset,
        }
    }

    // Sub-message layouts come first in the sub table, closed enums after.
    let mut sub_indices = vec![NO_SUB; fields.len()];
    let mut subs = Vec::new();
    let message_subs = fields.iter().enumerate().filter(|(_, f)| f.field_type.is_message());
    let enum_subs = fields
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.field_type.is_message() && f.needs_sub());
    for (i, field) in message_subs.chain(enum_subs) {
        sub_indices[i] = u16::try_from(subs.len()).unwrap_or(NO_SUB);
        subs.push(field.sub);
    }

    let entries: Vec<FieldEntry> = fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let (offset, presence) = match field.oneof {
                Some(oneof) => {
                    let (case, data) = oneof_slots[oneof];
                    (data, !i32::from(case))
                }
                None => (field_offsets[i], hasbits[i]),
            };
            FieldEntry {
                number: field.number,
                offset,
                presence,
                sub_index: sub_indices[i],
                descriptor_type: field.field_type,
                mode: field.mode(),
                flags: field.flags(),
                rep: field.slot_rep(),
            }
        })
        .collect();

    let oneofs = members
        .iter()
        .zip(&oneof_slots)
        .map(|(group, (case, data))| OneofLayout {
            case_offset: *case,
            data_offset: *data,
            members: group.iter().map(|i| fields[*i].number).collect(),
        })
        .collect();

    let required_count = fields
        .iter()
        .filter(|field| field.label == Label::Required)
        .count();

    Ok(MessageLayout {
        size: u16::try_from(size).unwrap_or(u16::MAX),
        dense_below: dense_prefix(&entries),
        fields: entries.into_boxed_slice(),
        subs: subs.into_boxed_slice(),
        required_count: u8::try_from(required_count).unwrap_or(u8::MAX),
        ext_mode: if spec.extendable {
            ExtMode::Extendable
        } else {
            ExtMode::NonExtendable
        },
        oneofs,
    })
}

/// Map entries have a fixed shape: key at offset 0, value at offset 16.
fn build_map_entry(spec: &MessageSpec) -> Result<MessageLayout, LayoutError> {
    let [key, value] = spec.fields.as_slice() else {
        return Err(LayoutError::InvalidMapEntry("map entry must have exactly two fields"));
    };
    if key.number != 1 {
        return Err(LayoutError::InvalidMapEntry("map key did not have expected number"));
    }
    if value.number != 2 {
        return Err(LayoutError::InvalidMapEntry("map value did not have expected number"));
    }
    if spec.oneof_count != 0 || key.oneof.is_some() || value.oneof.is_some() {
        return Err(LayoutError::InvalidMapEntry("map entry cannot have oneof"));
    }
    if key.is_repeated() || value.is_repeated() || key.map || value.map {
        return Err(LayoutError::InvalidMapEntry("map entry fields cannot be repeated"));
    }
    if matches!(
        key.field_type,
        FieldType::Float
            | FieldType::Double
            | FieldType::Message
            | FieldType::Group
            | FieldType::Bytes
            | FieldType::Enum
    ) {
        return Err(LayoutError::InvalidMapEntry("map key cannot have type"));
    }
    if value.field_type == FieldType::Group {
        return Err(LayoutError::InvalidMapEntry("map value cannot be a group"));
    }

    let mut subs = Vec::new();
    let mut entry = |field: &FieldSpec, offset: u16| {
        let sub_index = if field.needs_sub() {
            subs.push(field.sub);
            u16::try_from(subs.len() - 1).unwrap_or(NO_SUB)
        } else {
            NO_SUB
        };
        FieldEntry {
            number: field.number,
            offset,
            presence: 0,
            sub_index,
            descriptor_type: field.field_type,
            mode: FieldMode::Scalar,
            flags: field.flags(),
            rep: field.field_type.rep(),
        }
    };
    let fields = vec![entry(key, 0), entry(value, 16)];

    Ok(MessageLayout {
        size: 32,
        fields: fields.into_boxed_slice(),
        subs: subs.into_boxed_slice(),
        dense_below: 2,
        required_count: 0,
        ext_mode: ExtMode::MapEntry,
        oneofs: Box::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oneof_field(number: u32, field_type: FieldType, oneof: usize) -> FieldSpec {
        FieldSpec {
            oneof: Some(oneof),
            ..FieldSpec::new(number, field_type)
        }
    }

    #[test]
    fn test_offsets_sorted_by_alignment() {
        let spec = MessageSpec {
            fields: vec![
                FieldSpec::new(1, FieldType::Bool),
                FieldSpec::new(2, FieldType::Int32),
                FieldSpec::new(3, FieldType::String),
                FieldSpec::new(4, FieldType::Int64),
            ],
            ..MessageSpec::default()
        };
        let layout = build_layout(&spec).unwrap();
        let offsets: Vec<u16> = layout.fields().iter().map(FieldEntry::offset).collect();
        // One hasbit byte, then string view, int64, int32, bool.
        assert_eq!(offsets, vec![36, 32, 8, 24]);
        assert_eq!(layout.size(), 40);
        assert_eq!(layout.hasbit_bytes(), 1);
        assert_eq!(layout.dense_below(), 4);
    }

    #[test]
    fn test_oneof_members_share_slots() {
        let spec = MessageSpec {
            fields: vec![
                FieldSpec::new(1, FieldType::Int32),
                oneof_field(5, FieldType::Int32, 0),
                oneof_field(6, FieldType::String, 0),
            ],
            oneof_count: 1,
            ..MessageSpec::default()
        };
        let layout = build_layout(&spec).unwrap();
        let f5 = layout.find_field(5).unwrap();
        let f6 = layout.find_field(6).unwrap();
        assert_eq!(f5.offset(), f6.offset());
        assert_eq!(f5.presence(), f6.presence());
        assert!(f5.presence() < 0);

        let oneof = &layout.oneofs()[0];
        assert_eq!(Some(oneof.case_offset()), f5.oneof_case_offset());
        assert_eq!(oneof.data_offset(), f6.offset());
        assert_eq!(oneof.members(), &[5, 6]);
        // The data slot is sized for the string view.
        assert_eq!(oneof.data_offset() % 8, 0);
        assert_eq!(f6.rep(), Rep::StringView);
    }

    #[test]
    fn test_implicit_presence_has_no_hasbit() {
        let spec = MessageSpec {
            fields: vec![FieldSpec {
                implicit_presence: true,
                ..FieldSpec::new(1, FieldType::Int32)
            }],
            ..MessageSpec::default()
        };
        let layout = build_layout(&spec).unwrap();
        assert_eq!(layout.fields()[0].presence(), 0);
        assert_eq!(layout.hasbit_bytes(), 0);
        assert_eq!(layout.fields()[0].offset(), 0);
        assert_eq!(layout.size(), 8);
    }

    #[test]
    fn test_sub_indices_messages_before_enums() {
        let spec = MessageSpec {
            fields: vec![
                FieldSpec::new(1, FieldType::Enum),
                FieldSpec::new(2, FieldType::Message),
                FieldSpec {
                    closed_enum: false,
                    ..FieldSpec::new(3, FieldType::Enum)
                },
                FieldSpec::new(4, FieldType::Group),
            ],
            ..MessageSpec::default()
        };
        let layout = build_layout(&spec).unwrap();
        let subs: Vec<Option<u16>> = layout.fields().iter().map(FieldEntry::sub_index).collect();
        assert_eq!(subs, vec![Some(2), Some(0), None, Some(1)]);
        assert!(layout.fields()[2].flags().contains(FieldFlags::ALTERNATE));
        assert!(!layout.fields()[2].is_closed_enum());
        assert!(layout.fields()[0].is_closed_enum());
    }

    #[test]
    fn test_packed_only_for_packable_repeated() {
        let spec = MessageSpec {
            fields: vec![
                FieldSpec {
                    label: Label::Repeated,
                    packed: true,
                    ..FieldSpec::new(1, FieldType::Int32)
                },
                FieldSpec {
                    packed: true,
                    ..FieldSpec::new(2, FieldType::Int32)
                },
                FieldSpec {
                    label: Label::Repeated,
                    packed: true,
                    ..FieldSpec::new(3, FieldType::String)
                },
            ],
            ..MessageSpec::default()
        };
        let layout = build_layout(&spec).unwrap();
        let packed: Vec<bool> = layout.fields().iter().map(FieldEntry::is_packed).collect();
        assert_eq!(packed, vec![true, false, false]);
        assert_eq!(layout.fields()[0].mode(), FieldMode::Array);
        assert_eq!(layout.fields()[0].rep(), Rep::EightByte);
    }

    #[test]
    fn test_invalid_fields() {
        let cases = [
            (FieldSpec::new(0, FieldType::Int32), "field number out of range"),
            (
                FieldSpec {
                    implicit_presence: true,
                    ..FieldSpec::new(1, FieldType::Message)
                },
                "cannot be a singular submessage",
            ),
            (
                FieldSpec {
                    label: Label::Required,
                    implicit_presence: true,
                    ..FieldSpec::new(1, FieldType::Int32)
                },
                "field cannot be both singular and required",
            ),
            (
                FieldSpec {
                    map: true,
                    ..FieldSpec::new(1, FieldType::Message)
                },
                "map field must be a repeated message",
            ),
        ];
        for (field, expected) in cases {
            let spec = MessageSpec {
                fields: vec![field],
                ..MessageSpec::default()
            };
            match build_layout(&spec) {
                Err(LayoutError::InvalidField { reason, .. }) => assert_eq!(reason, expected),
                other => panic!("unexpected {other:?}"),
            }
        }

        let duplicate = MessageSpec {
            fields: vec![
                FieldSpec::new(3, FieldType::Int32),
                FieldSpec::new(3, FieldType::Bool),
            ],
            ..MessageSpec::default()
        };
        assert!(matches!(
            build_layout(&duplicate),
            Err(LayoutError::InvalidField { number: 3, .. })
        ));

        let empty_oneof = MessageSpec {
            oneof_count: 1,
            ..MessageSpec::default()
        };
        assert_eq!(
            build_layout(&empty_oneof),
            Err(LayoutError::EmptyOneof { index: 0 })
        );
    }

    #[test]
    fn test_too_many_required() {
        let spec = MessageSpec {
            fields: (1..=64)
                .map(|n| FieldSpec {
                    label: Label::Required,
                    ..FieldSpec::new(n, FieldType::Bool)
                })
                .collect(),
            ..MessageSpec::default()
        };
        assert_eq!(
            build_layout(&spec),
            Err(LayoutError::TooManyRequired { count: 64 })
        );
    }

    #[test]
    fn test_layout_overflow() {
        let spec = MessageSpec {
            fields: (1..=5000)
                .map(|n| FieldSpec::new(n, FieldType::String))
                .collect(),
            ..MessageSpec::default()
        };
        assert!(matches!(
            build_layout(&spec),
            Err(LayoutError::LayoutOverflow { .. })
        ));
    }

    #[test]
    fn test_map_entry() {
        let spec = MessageSpec {
            kind: MessageKind::MapEntry,
            fields: vec![
                FieldSpec::new(1, FieldType::Int64),
                FieldSpec::new(2, FieldType::Message),
            ],
            ..MessageSpec::default()
        };
        let layout = build_layout(&spec).unwrap();
        assert_eq!(layout.ext_mode(), ExtMode::MapEntry);
        assert_eq!(layout.size(), 32);
        assert_eq!(layout.fields()[0].offset(), 0);
        assert_eq!(layout.fields()[1].offset(), 16);
        assert_eq!(layout.fields()[1].sub_index(), Some(0));

        let bad_key = MessageSpec {
            kind: MessageKind::MapEntry,
            fields: vec![
                FieldSpec::new(1, FieldType::Double),
                FieldSpec::new(2, FieldType::Int32),
            ],
            ..MessageSpec::default()
        };
        assert_eq!(
            build_layout(&bad_key),
            Err(LayoutError::InvalidMapEntry("map key cannot have type"))
        );

        let wrong_numbers = MessageSpec {
            kind: MessageKind::MapEntry,
            fields: vec![
                FieldSpec::new(2, FieldType::Int32),
                FieldSpec::new(3, FieldType::Int32),
            ],
            ..MessageSpec::default()
        };
        assert_eq!(
            build_layout(&wrong_numbers),
            Err(LayoutError::InvalidMapEntry("map key did not have expected number"))
        );
    }
}
