//! Arena messages into wire bytes.
//!
//! Encoding makes two passes over the message tree. The first measures
//! every message and map entry and records the body sizes in the order the
//! second pass visits them, so each length prefix is known before its body
//! is written and the output can be reserved up front.

use bytes::BufMut;
use smallvec::SmallVec;

use crate::arena::{Arena, ArenaPtr};
use crate::decode::DEFAULT_MAX_DEPTH;
use crate::error::EncodeError;
use crate::layout::{ExtMode, FieldEntry, FieldMode, FieldType, Rep};
use crate::leb128::{encode_zigzag32, encode_zigzag64};
use crate::message::{MapKey, Message, Place, map, value};
use crate::util::{CastFrom, low32};
use crate::wire::{self, WireType};

/// Where the unknown-field buffer of each message goes in the output.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum UnknownFields {
    /// After the known fields.
    #[default]
    Last,
    /// Before the known fields.
    First,
    /// Left out.
    Skip,
}

/// Knobs for [`encode`] and friends.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub(crate) deterministic: bool,
    pub(crate) check_required: bool,
    pub(crate) max_depth: u32,
    pub(crate) unknown_fields: UnknownFields,
    pub(crate) length_prefixed: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            deterministic: false,
            check_required: true,
            max_depth: DEFAULT_MAX_DEPTH,
            unknown_fields: UnknownFields::Last,
            length_prefixed: false,
        }
    }
}

impl EncodeOptions {
    /// Create a new EncodeOptions with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit map entries sorted by key instead of in insertion order.
    pub fn deterministic(&mut self, deterministic: bool) -> &mut Self {
        self.deterministic = deterministic;
        self
    }

    /// Skip the required-field check.
    pub fn partial(&mut self) -> &mut Self {
        self.check_required = false;
        self
    }

    pub fn check_required(&mut self, check: bool) -> &mut Self {
        self.check_required = check;
        self
    }

    /// Maximum nesting of sub-messages, groups and map entries.
    pub fn max_depth(&mut self, depth: u32) -> &mut Self {
        self.max_depth = depth;
        self
    }

    pub fn unknown_fields(&mut self, placement: UnknownFields) -> &mut Self {
        self.unknown_fields = placement;
        self
    }

    /// Prefix the output with its length as a varint.
    pub fn length_prefixed(&mut self, prefixed: bool) -> &mut Self {
        self.length_prefixed = prefixed;
        self
    }
}

/// Number of bytes [`encode`] would write.
///
/// # Panics
///
/// If `message` doesn't live in `arena`.
pub fn encoded_len(
    message: Message<'_>,
    arena: &Arena,
    options: &EncodeOptions,
) -> Result<usize, EncodeError> {
    let (_, len) = measure(message, arena, options)?;
    Ok(total_len(len, options))
}

/// Encode `message` into `buf`.
///
/// Fields go out in ascending number order with extensions interleaved, the
/// unknown fields where [`EncodeOptions::unknown_fields`] puts them. Nothing
/// is written when an error is returned.
///
/// # Panics
///
/// If `message` doesn't live in `arena`.
pub fn encode<B: BufMut>(
    message: Message<'_>,
    arena: &Arena,
    options: &EncodeOptions,
    buf: &mut B,
) -> Result<(), EncodeError> {
    let (mut encoder, len) = measure(message, arena, options)?;
    if options.length_prefixed {
        wire::encode_varint(u64::cast_from(len), buf);
    }
    encoder.write_message(message, buf);
    Ok(())
}

/// Encode `message` into a new `Vec`, allocated once at its final size.
pub fn encode_to_vec(
    message: Message<'_>,
    arena: &Arena,
    options: &EncodeOptions,
) -> Result<Vec<u8>, EncodeError> {
    let (mut encoder, len) = measure(message, arena, options)?;
    let mut buf = Vec::with_capacity(total_len(len, options));
    if options.length_prefixed {
        wire::encode_varint(u64::cast_from(len), &mut buf);
    }
    encoder.write_message(message, &mut buf);
    debug_assert_eq!(buf.len(), total_len(len, options));
    Ok(buf)
}

fn measure<'a>(
    message: Message<'_>,
    arena: &'a Arena,
    options: &'a EncodeOptions,
) -> Result<(Encoder<'a>, usize), EncodeError> {
    message.assert_arena(arena);
    let mut encoder = Encoder {
        arena,
        options,
        sizes: Vec::new(),
        next: 0,
    };
    let len = encoder.measure_message(message, 0)?;
    tracing::trace!(
        layout = ?message.layout().id(),
        len,
        frames = encoder.sizes.len(),
        "measured"
    );
    Ok((encoder, len))
}

fn total_len(len: usize, options: &EncodeOptions) -> usize {
    if options.length_prefixed {
        wire::encoded_len_delimited_len(len)
    } else {
        len
    }
}

/// Number of the first required field of `message` that isn't set.
fn first_missing_required(arena: &Arena, message: Message<'_>) -> Option<u32> {
    let layout = message.layout();
    let required = u16::from(layout.required_count());
    layout
        .layout()
        .fields()
        .iter()
        .find(|field| {
            field
                .hasbit()
                .is_some_and(|bit| bit <= required && !message.has_hasbit(arena, bit))
        })
        .map(|field| field.number)
}

fn extension_present(arena: &Arena, place: &Place<'_>) -> bool {
    match place.field.mode {
        FieldMode::Scalar => true,
        FieldMode::Array => place
            .array(arena)
            .is_some_and(|array| array.len(arena) > 0),
        FieldMode::Map => false,
    }
}

/// Present fields and extensions of `message`, ascending by number.
fn targets<'s>(arena: &Arena, message: Message<'s>) -> SmallVec<[Place<'s>; 16]> {
    let set = message.layout().set();
    let mut fields = message
        .layout()
        .layout()
        .fields()
        .iter()
        .filter(|field| message.has_unchecked(arena, field))
        .map(|field| message.place(field))
        .peekable();
    let mut extensions = message
        .extension_entries(arena)
        .iter()
        .map(|entry| Place::extension(entry.slot, set.extension(entry.id), set))
        .filter(|place| extension_present(arena, place))
        .peekable();

    let mut targets = SmallVec::new();
    loop {
        let next = match (fields.peek(), extensions.peek()) {
            (Some(field), Some(extension)) if extension.field.number < field.field.number => {
                extensions.next()
            }
            (Some(_), _) => fields.next(),
            (None, _) => extensions.next(),
        };
        match next {
            Some(place) => targets.push(place),
            None => return targets,
        }
    }
}

/// Raw bits of a scalar slot, zero-extended.
fn read_bits(arena: &Arena, slot: ArenaPtr, ty: FieldType) -> u64 {
    match ty.rep() {
        Rep::OneByte => u64::from(arena.read_u8(slot)),
        Rep::FourByte => u64::from(arena.read_u32(slot)),
        Rep::EightByte | Rep::StringView => arena.read_u64(slot),
    }
}

/// The varint written for a scalar of `ty` holding `bits`.
fn varint_value(ty: FieldType, bits: u64) -> u64 {
    match ty {
        // Negative 32-bit values are sign extended to ten bytes.
        FieldType::Int32 | FieldType::Enum => i64::from(low32(bits).cast_signed()).cast_unsigned(),
        FieldType::SInt32 => u64::from(encode_zigzag32(low32(bits).cast_signed())),
        FieldType::SInt64 => encode_zigzag64(bits.cast_signed()),
        FieldType::Bool => u64::from(bits != 0),
        _ => bits,
    }
}

fn scalar_len(ty: FieldType, bits: u64) -> usize {
    match ty.wire_type() {
        WireType::I32 => 4,
        WireType::I64 => 8,
        _ => wire::encoded_varint_len(varint_value(ty, bits)),
    }
}

fn put_scalar<B: BufMut>(ty: FieldType, bits: u64, buf: &mut B) {
    match ty.wire_type() {
        WireType::I32 => buf.put_u32_le(low32(bits)),
        WireType::I64 => buf.put_u64_le(bits),
        _ => wire::encode_varint(varint_value(ty, bits), buf),
    }
}

struct Encoder<'a> {
    arena: &'a Arena,
    options: &'a EncodeOptions,
    /// Body size of every message and map entry, in visiting order.
    sizes: Vec<usize>,
    /// Index into `sizes` of the next body the write pass starts.
    next: usize,
}

impl<'a> Encoder<'a> {
    /// The message stored in a message slot.
    fn child<'s>(&self, place: &Place<'s>, slot: ArenaPtr) -> Option<Message<'s>> {
        let sub = place.sub_layout()?;
        let ptr = ArenaPtr::from_raw(self.arena.read_u64(slot))?;
        Some(Message::from_parts(sub, ptr, self.arena.id()))
    }

    /// Entries of a map field, sorted by key when encoding deterministically.
    fn map_entries(&self, place: &Place<'_>) -> SmallVec<[(&'a MapKey, ArenaPtr); 8]> {
        let mut entries: SmallVec<[(&'a MapKey, ArenaPtr); 8]> = map::storage(self.arena, place.slot)
            .map(|storage| storage.entries.iter().map(|(key, ptr)| (key, *ptr)).collect())
            .unwrap_or_default();
        if self.options.deterministic {
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        }
        entries
    }

    fn unknown_len(&self, message: Message<'_>) -> usize {
        match self.options.unknown_fields {
            UnknownFields::Skip => 0,
            UnknownFields::First | UnknownFields::Last => message.unknown_fields(self.arena).len(),
        }
    }

    // Sizing pass.

    fn measure_message(&mut self, message: Message<'_>, depth: u32) -> Result<usize, EncodeError> {
        if depth > self.options.max_depth {
            return Err(EncodeError::DepthExceeded);
        }
        if self.options.check_required {
            if let Some(field) = first_missing_required(self.arena, message) {
                return Err(EncodeError::MissingRequired { field });
            }
        }

        let index = self.sizes.len();
        self.sizes.push(0);
        let message_set = message.layout().ext_mode() == ExtMode::MessageSet;
        let mut len = self.unknown_len(message);
        for place in targets(self.arena, message) {
            len += if message_set {
                self.measure_item(&place, depth)?
            } else {
                self.measure_field(&place, depth)?
            };
        }
        self.sizes[index] = len;
        Ok(len)
    }

    fn measure_field(&mut self, place: &Place<'_>, depth: u32) -> Result<usize, EncodeError> {
        let field = &place.field;
        let ty = field.field_type();
        let key_len = wire::encoded_key_len(field.number);
        match field.mode {
            FieldMode::Scalar => Ok(key_len + self.measure_value(place, place.slot, depth)?),
            FieldMode::Array => {
                let Some(array) = place.array(self.arena) else {
                    return Ok(0);
                };
                let count = array.len(self.arena);
                if field.is_packed() && ty.is_packable() {
                    let payload = self.packed_len(place, count);
                    return Ok(key_len + wire::encoded_len_delimited_len(payload));
                }
                let mut len = key_len * count;
                for index in 0..count {
                    len += self.measure_value(place, array.element(self.arena, index), depth)?;
                }
                Ok(len)
            }
            FieldMode::Map => {
                let Some(layout) = place.sub_layout() else {
                    return Ok(0);
                };
                let [key_field, value_field] = layout.layout().fields() else {
                    return Ok(0);
                };
                let mut len = 0;
                for (_, ptr) in self.map_entries(place) {
                    let entry = Message::from_parts(layout, ptr, self.arena.id());
                    let body = self.measure_entry(entry, [key_field, value_field], depth + 1)?;
                    len += key_len + wire::encoded_len_delimited_len(body);
                }
                Ok(len)
            }
        }
    }

    /// Size of one value without its tag.
    fn measure_value(
        &mut self,
        place: &Place<'_>,
        slot: ArenaPtr,
        depth: u32,
    ) -> Result<usize, EncodeError> {
        let ty = place.field.field_type();
        let len = match ty {
            FieldType::Message | FieldType::Group => {
                let body = match self.child(place, slot) {
                    Some(child) => self.measure_message(child, depth + 1)?,
                    None => 0,
                };
                if ty == FieldType::Group {
                    body + wire::encoded_key_len(place.field.number)
                } else {
                    wire::encoded_len_delimited_len(body)
                }
            }
            FieldType::String | FieldType::Bytes => {
                wire::encoded_len_delimited_len(value::read_bytes(self.arena, slot).len())
            }
            _ => scalar_len(ty, read_bits(self.arena, slot, ty)),
        };
        Ok(len)
    }

    fn packed_len(&self, place: &Place<'_>, count: usize) -> usize {
        let ty = place.field.field_type();
        match ty.wire_type() {
            WireType::I32 => 4 * count,
            WireType::I64 => 8 * count,
            _ => place.array(self.arena).map_or(0, |array| {
                (0..count)
                    .map(|index| scalar_len(ty, read_bits(self.arena, array.element(self.arena, index), ty)))
                    .sum()
            }),
        }
    }

    /// Map entries always carry both key and value.
    fn measure_entry(
        &mut self,
        entry: Message<'_>,
        fields: [&FieldEntry; 2],
        depth: u32,
    ) -> Result<usize, EncodeError> {
        if depth > self.options.max_depth {
            return Err(EncodeError::DepthExceeded);
        }
        let index = self.sizes.len();
        self.sizes.push(0);
        let mut len = 0;
        for field in fields {
            let place = entry.place(field);
            len += wire::encoded_key_len(field.number) + self.measure_value(&place, place.slot, depth)?;
        }
        self.sizes[index] = len;
        Ok(len)
    }

    /// A MessageSet item: `group 1 { type_id = 2; message = 3; }`.
    fn measure_item(&mut self, place: &Place<'_>, depth: u32) -> Result<usize, EncodeError> {
        let body = match self.child(place, place.slot) {
            Some(child) => self.measure_message(child, depth + 1)?,
            None => 0,
        };
        Ok(2 * wire::encoded_key_len(1)
            + wire::encoded_key_len(2)
            + wire::encoded_varint_len(u64::from(place.field.number))
            + wire::encoded_key_len(3)
            + wire::encoded_len_delimited_len(body))
    }

    // Write pass, visits everything in the order it was measured.

    fn take_size(&mut self) -> usize {
        let size = self.sizes[self.next];
        self.next += 1;
        size
    }

    fn write_message<B: BufMut>(&mut self, message: Message<'_>, buf: &mut B) {
        // The caller already wrote the length prefix.
        self.take_size();
        let unknown = match self.options.unknown_fields {
            UnknownFields::Skip => &[][..],
            UnknownFields::First | UnknownFields::Last => message.unknown_fields(self.arena),
        };
        if self.options.unknown_fields == UnknownFields::First {
            buf.put_slice(unknown);
        }

        let message_set = message.layout().ext_mode() == ExtMode::MessageSet;
        for place in targets(self.arena, message) {
            if message_set {
                self.write_item(&place, buf);
            } else {
                self.write_field(&place, buf);
            }
        }

        if self.options.unknown_fields == UnknownFields::Last {
            buf.put_slice(unknown);
        }
    }

    fn write_field<B: BufMut>(&mut self, place: &Place<'_>, buf: &mut B) {
        let field = &place.field;
        let ty = field.field_type();
        match field.mode {
            FieldMode::Scalar => {
                wire::encode_key(field.number, ty.wire_type(), buf);
                self.write_value(place, place.slot, buf);
            }
            FieldMode::Array => {
                let Some(array) = place.array(self.arena) else {
                    return;
                };
                let count = array.len(self.arena);
                if field.is_packed() && ty.is_packable() {
                    wire::encode_key(field.number, WireType::Len, buf);
                    wire::encode_varint(u64::cast_from(self.packed_len(place, count)), buf);
                    for index in 0..count {
                        let bits = read_bits(self.arena, array.element(self.arena, index), ty);
                        put_scalar(ty, bits, buf);
                    }
                    return;
                }
                for index in 0..count {
                    wire::encode_key(field.number, ty.wire_type(), buf);
                    self.write_value(place, array.element(self.arena, index), buf);
                }
            }
            FieldMode::Map => {
                let Some(layout) = place.sub_layout() else {
                    return;
                };
                let [key_field, value_field] = layout.layout().fields() else {
                    return;
                };
                for (_, ptr) in self.map_entries(place) {
                    let entry = Message::from_parts(layout, ptr, self.arena.id());
                    wire::encode_key(field.number, WireType::Len, buf);
                    let size = self.take_size();
                    wire::encode_varint(u64::cast_from(size), buf);
                    for field in [key_field, value_field] {
                        let place = entry.place(field);
                        wire::encode_key(field.number, field.field_type().wire_type(), buf);
                        self.write_value(&place, place.slot, buf);
                    }
                }
            }
        }
    }

    fn write_value<B: BufMut>(&mut self, place: &Place<'_>, slot: ArenaPtr, buf: &mut B) {
        let ty = place.field.field_type();
        match ty {
            FieldType::Message => match self.child(place, slot) {
                Some(child) => {
                    wire::encode_varint(u64::cast_from(self.sizes[self.next]), buf);
                    self.write_message(child, buf);
                }
                None => buf.put_u8(0),
            },
            FieldType::Group => {
                if let Some(child) = self.child(place, slot) {
                    self.write_message(child, buf);
                }
                wire::encode_key(place.field.number, WireType::EGroup, buf);
            }
            FieldType::String | FieldType::Bytes => {
                let bytes = value::read_bytes(self.arena, slot);
                wire::encode_varint(u64::cast_from(bytes.len()), buf);
                buf.put_slice(bytes);
            }
            _ => put_scalar(ty, read_bits(self.arena, slot, ty), buf),
        }
    }

    fn write_item<B: BufMut>(&mut self, place: &Place<'_>, buf: &mut B) {
        wire::encode_key(1, WireType::SGroup, buf);
        wire::encode_key(2, WireType::Varint, buf);
        wire::encode_varint(u64::from(place.field.number), buf);
        wire::encode_key(3, WireType::Len, buf);
        match self.child(place, place.slot) {
            Some(child) => {
                wire::encode_varint(u64::cast_from(self.sizes[self.next]), buf);
                self.write_message(child, buf);
            }
            None => buf.put_u8(0),
        }
        wire::encode_key(1, WireType::EGroup, buf);
    }
}
