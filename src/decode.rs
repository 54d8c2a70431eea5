//! Wire bytes into arena messages.
//!
//! The decoder walks the layout of the message being filled: each tag is
//! looked up by field number, its value is converted according to the
//! field's declared type and stored into the message's slots. Tags the
//! layout doesn't know, and tags whose wire type doesn't fit the field, are
//! kept byte-exact in the message's unknown-field buffer.

use bytes::Bytes;

use crate::arena::{Arena, ArenaPtr};
use crate::error::{ArenaError, DecodeError, DecodeErrorKind, ReflectError};
use crate::layout::{ExtMode, ExtensionRegistry, FieldEntry, FieldMode, FieldType, LayoutRef, Rep, SubLayout};
use crate::leb128::{decode_zigzag32, decode_zigzag64};
use crate::message::{MapKey, Message, Place, map, value};
use crate::util::{low32, unlikely};
use crate::wire::{self, Cursor, ProtoKey, WireType};

/// Nesting limit used unless [`DecodeOptions::max_depth`] says otherwise.
pub const DEFAULT_MAX_DEPTH: u32 = 100;

/// Knobs for [`decode`] and [`merge`].
#[derive(Debug, Clone)]
pub struct DecodeOptions<'r> {
    pub(crate) max_depth: u32,
    pub(crate) check_required: bool,
    pub(crate) alias_strings: bool,
    pub(crate) strict_utf8: bool,
    pub(crate) discard_unknown: bool,
    pub(crate) extensions: Option<&'r ExtensionRegistry>,
}

impl Default for DecodeOptions<'_> {
    fn default() -> Self {
        DecodeOptions {
            max_depth: DEFAULT_MAX_DEPTH,
            check_required: false,
            alias_strings: false,
            strict_utf8: false,
            discard_unknown: false,
            extensions: None,
        }
    }
}

impl<'r> DecodeOptions<'r> {
    /// Create a new DecodeOptions with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum nesting of sub-messages and groups.
    pub fn max_depth(&mut self, depth: u32) -> &mut Self {
        self.max_depth = depth;
        self
    }

    /// Fail with [`DecodeErrorKind::MissingRequired`] when a required field
    /// is absent. The check runs after the whole input was read.
    pub fn check_required(&mut self, check: bool) -> &mut Self {
        self.check_required = check;
        self
    }

    /// Let string and bytes fields point into the input instead of copying.
    ///
    /// The arena keeps a reference to the input buffer alive.
    pub fn alias_strings(&mut self, alias: bool) -> &mut Self {
        self.alias_strings = alias;
        self
    }

    /// Fail with [`DecodeErrorKind::BadUtf8`] instead of storing invalid
    /// UTF-8 and flagging the message.
    pub fn strict_utf8(&mut self, strict: bool) -> &mut Self {
        self.strict_utf8 = strict;
        self
    }

    /// Drop unknown fields instead of keeping them for re-encoding.
    pub fn discard_unknown(&mut self, discard: bool) -> &mut Self {
        self.discard_unknown = discard;
        self
    }

    /// Decode extensions known to `registry`, other extension numbers are
    /// kept as unknown fields.
    ///
    /// The registry must describe extensions of the layout set the decoded
    /// messages belong to.
    pub fn extensions(&mut self, registry: &'r ExtensionRegistry) -> &mut Self {
        self.extensions = Some(registry);
        self
    }
}

/// Decode `input` into a new instance of `layout`.
///
/// With [`DecodeOptions::check_required`] a missing required field is
/// reported once the whole input was read. Use [`decode_partial`] to get
/// the parsed message along with that error.
pub fn decode<'s>(
    layout: LayoutRef<'s>,
    input: Bytes,
    arena: &mut Arena,
    options: &DecodeOptions<'_>,
) -> Result<Message<'s>, DecodeError> {
    match decode_partial(layout, input, arena, options)? {
        (message, None) => Ok(message),
        (_, Some(err)) => Err(err),
    }
}

/// Decode `input` into a new instance of `layout`, keeping the message when
/// required fields are missing.
///
/// Malformed input is an error. A [`DecodeErrorKind::MissingRequired`] error
/// is returned next to the fully parsed message, which stays in `arena`.
pub fn decode_partial<'s>(
    layout: LayoutRef<'s>,
    input: Bytes,
    arena: &mut Arena,
    options: &DecodeOptions<'_>,
) -> Result<(Message<'s>, Option<DecodeError>), DecodeError> {
    let message = Message::new(layout, arena).map_err(out_of_memory(0))?;
    match decode_into(message, &input, arena, options, options.check_required) {
        Ok(()) => Ok((message, None)),
        Err(err) if err.kind() == DecodeErrorKind::MissingRequired => Ok((message, Some(err))),
        Err(err) => Err(err),
    }
}

/// Decode `input` on top of an existing message.
///
/// The input is first decoded into a scratch instance, so `message` is left
/// untouched when the input is malformed. Singular fields take the last
/// value, repeated fields append. A [`DecodeErrorKind::MissingRequired`]
/// error is returned after the merge happened.
///
/// # Panics
///
/// If `message` doesn't live in `arena`.
pub fn merge(
    message: Message<'_>,
    input: Bytes,
    arena: &mut Arena,
    options: &DecodeOptions<'_>,
) -> Result<(), DecodeError> {
    message.assert_arena(arena);
    let scratch = Message::new(message.layout(), arena).map_err(out_of_memory(0))?;
    decode_into(scratch, &input, arena, options, false)?;
    message
        .merge_from(arena, scratch)
        .map_err(|err| reflect_error(err, input.len()))?;

    if options.check_required && message.missing_required(arena).is_some() {
        return Err(DecodeError::new(
            DecodeErrorKind::MissingRequired,
            input.len(),
        ));
    }
    Ok(())
}

/// Decode one message preceded by its varint length.
///
/// Returns the message and the number of input bytes consumed, prefix
/// included, so consecutive messages can be read from one buffer.
pub fn decode_length_prefixed<'s>(
    layout: LayoutRef<'s>,
    input: Bytes,
    arena: &mut Arena,
    options: &DecodeOptions<'_>,
) -> Result<(Message<'s>, usize), DecodeError> {
    let mut cursor = Cursor::new(&input);
    let len = cursor.read_len().map_err(normalize)?;
    let start = cursor.position();
    let body = input.slice(start..start + len);
    let message = decode(layout, body, arena, options)
        .map_err(|err| DecodeError::new(err.kind(), err.offset() + start))?;
    Ok((message, start + len))
}

fn decode_into(
    message: Message<'_>,
    input: &Bytes,
    arena: &mut Arena,
    options: &DecodeOptions<'_>,
    check_required: bool,
) -> Result<(), DecodeError> {
    let aliased = if options.alias_strings {
        arena.alias_input(input.clone())
    } else {
        None
    };
    tracing::trace!(
        layout = ?message.layout().id(),
        len = input.len(),
        aliased = aliased.is_some(),
        "decode"
    );

    let mut decoder = Decoder {
        arena,
        options,
        input: aliased,
        depth: 0,
        check_required,
        missing_required: None,
    };
    let mut cursor = Cursor::new(input);
    decoder
        .decode_message(&mut cursor, message, None)
        .map_err(normalize)?;

    match decoder.missing_required {
        Some(offset) => Err(DecodeError::new(DecodeErrorKind::MissingRequired, offset)),
        None => Ok(()),
    }
}

/// Input ending inside a varint is malformed once the whole message is
/// known to be present.
fn normalize(err: DecodeError) -> DecodeError {
    match err.kind() {
        DecodeErrorKind::NeedMoreData => {
            DecodeError::new(DecodeErrorKind::MalformedVarint, err.offset())
        }
        _ => err,
    }
}

fn out_of_memory(offset: usize) -> impl FnOnce(ArenaError) -> DecodeError {
    move |_| DecodeError::new(DecodeErrorKind::OutOfMemory, offset)
}

fn reflect_error(err: ReflectError, offset: usize) -> DecodeError {
    let kind = match err {
        ReflectError::Arena(_) => DecodeErrorKind::OutOfMemory,
        // Decoding only materializes values of message-typed fields, the
        // one thing that can be missing is their layout.
        _ => DecodeErrorKind::UnlinkedSubMessage,
    };
    DecodeError::new(kind, offset)
}

/// What happened to one field record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Outcome {
    Stored,
    /// A closed enum didn't know the value, it went to the unknown fields.
    Diverted,
    /// The wire type doesn't fit the field, the record is unknown.
    Mismatch,
}

/// Whether a record of `wire_type` can be read into `field`.
fn accepts(field: &FieldEntry, wire_type: WireType) -> bool {
    let ty = field.field_type();
    wire_type == ty.wire_type()
        || (field.mode() == FieldMode::Array && ty.is_packable() && wire_type == WireType::Len)
}

/// Size of one element of a packed block, `None` for varints.
fn fixed_size(ty: FieldType) -> Option<usize> {
    match ty.wire_type() {
        WireType::I32 => Some(4),
        WireType::I64 => Some(8),
        _ => None,
    }
}

/// Read one non-string scalar as the little-endian bits of its slot.
#[inline]
fn read_scalar(cursor: &mut Cursor<'_>, ty: FieldType) -> Result<u64, DecodeError> {
    let bits = match ty {
        FieldType::Bool => u64::from(cursor.read_varint64()? != 0),
        FieldType::Int32 | FieldType::UInt32 | FieldType::Enum => {
            u64::from(cursor.read_varint32()?)
        }
        FieldType::SInt32 => u64::from(decode_zigzag32(cursor.read_varint32()?).cast_unsigned()),
        FieldType::Int64 | FieldType::UInt64 => cursor.read_varint64()?,
        FieldType::SInt64 => decode_zigzag64(cursor.read_varint64()?).cast_unsigned(),
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
            u64::from(cursor.read_fixed32()?)
        }
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => cursor.read_fixed64()?,
        // Length-delimited and group values are dispatched before this.
        FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group => 0,
    };
    Ok(bits)
}

fn store_scalar(arena: &mut Arena, slot: ArenaPtr, ty: FieldType, bits: u64) {
    match ty.rep() {
        Rep::OneByte => arena.write_u8(slot, u8::from(bits != 0)),
        Rep::FourByte => arena.write_u32(slot, low32(bits)),
        Rep::EightByte | Rep::StringView => arena.write_u64(slot, bits),
    }
}

struct Decoder<'a, 'r> {
    arena: &'a mut Arena,
    options: &'a DecodeOptions<'r>,
    /// Handle of the input buffer when strings alias it.
    input: Option<ArenaPtr>,
    depth: u32,
    check_required: bool,
    /// End offset of the first message found without all required fields.
    missing_required: Option<usize>,
}

impl Decoder<'_, '_> {
    fn remaining_depth(&self) -> u32 {
        self.options.max_depth.saturating_sub(self.depth)
    }

    /// Read fields into `message` until the end of the current frame, or
    /// until the end-group tag of `group`.
    fn decode_message<'s>(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'s>,
        group: Option<u32>,
    ) -> Result<(), DecodeError> {
        let layout = message.layout();
        loop {
            if cursor.is_at_limit() {
                if group.is_some() {
                    return Err(DecodeError::new(
                        DecodeErrorKind::BadGroupEnd,
                        cursor.position(),
                    ));
                }
                break;
            }

            let start = cursor.position();
            let key = cursor.read_tag()?;
            let (number, wire_type) = key.into_parts();
            if wire_type == WireType::EGroup {
                if group == Some(number) {
                    break;
                }
                return Err(DecodeError::new(DecodeErrorKind::BadGroupEnd, start));
            }

            let outcome = match layout.layout().find_field(number) {
                Some(field) => {
                    self.decode_field(cursor, message, message.place(field), wire_type, start)?
                }
                None if layout.ext_mode() == ExtMode::MessageSet
                    && number == 1
                    && wire_type == WireType::SGroup =>
                {
                    self.decode_message_set_item(cursor, message, start)?;
                    Outcome::Stored
                }
                None => self.decode_extension(cursor, message, number, wire_type, start)?,
            };
            if outcome == Outcome::Mismatch {
                self.skip_unknown(cursor, message, key, start)?;
            }
        }

        if self.check_required && self.missing_required.is_none() {
            let required = u16::from(layout.required_count());
            if !(1..=required).all(|bit| message.has_hasbit(self.arena, bit)) {
                self.missing_required = Some(cursor.position());
            }
        }
        Ok(())
    }

    fn skip_unknown(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'_>,
        key: ProtoKey,
        start: usize,
    ) -> Result<(), DecodeError> {
        cursor.skip_field(key, self.remaining_depth())?;
        if self.options.discard_unknown {
            return Ok(());
        }
        let record = cursor.consumed_since(start);
        tracing::trace!(
            field = key.field_number(),
            len = record.len(),
            "unknown field"
        );
        message
            .append_unknown(self.arena, record)
            .map_err(out_of_memory(start))
    }

    /// Decode one record into `place`, a field slot of `message` or one of
    /// its extension slots.
    fn decode_field<'s>(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'s>,
        place: Place<'s>,
        wire_type: WireType,
        start: usize,
    ) -> Result<Outcome, DecodeError> {
        let field = place.field;
        if !accepts(&field, wire_type) {
            return Ok(Outcome::Mismatch);
        }
        let ty = field.field_type();

        match field.mode() {
            FieldMode::Map => self.decode_map_entry(cursor, message, place, start)?,
            FieldMode::Array if wire_type == WireType::Len && ty.is_packable() => {
                self.decode_packed(cursor, message, place, start)?;
            }
            FieldMode::Array if ty.is_message() => {
                let child = place
                    .array_push_message(self.arena)
                    .map_err(|err| reflect_error(err, start))?;
                self.decode_sub_message(cursor, child, field.number(), wire_type, start)?;
            }
            FieldMode::Array if matches!(ty, FieldType::String | FieldType::Bytes) => {
                let element = place
                    .array_mut(self.arena)
                    .and_then(|array| array.push(self.arena))
                    .map_err(out_of_memory(start))?;
                self.decode_string(cursor, message, &field, element)?;
            }
            FieldMode::Array => {
                let bits = read_scalar(cursor, ty)?;
                if self.is_unknown_enum(&place, bits) {
                    self.push_unknown_enum(message, field.number(), bits, start)?;
                    return Ok(Outcome::Diverted);
                }
                let element = place
                    .array_mut(self.arena)
                    .and_then(|array| array.push(self.arena))
                    .map_err(out_of_memory(start))?;
                store_scalar(self.arena, element, ty, bits);
            }
            FieldMode::Scalar if ty.is_message() => {
                if place.sub_layout().is_none() {
                    return Err(DecodeError::new(
                        DecodeErrorKind::UnlinkedSubMessage,
                        start,
                    ));
                }
                message.mark_present(self.arena, &field);
                let child = place
                    .mutable_message(self.arena)
                    .map_err(|err| reflect_error(err, start))?;
                self.decode_sub_message(cursor, child, field.number(), wire_type, start)?;
            }
            FieldMode::Scalar if matches!(ty, FieldType::String | FieldType::Bytes) => {
                message.mark_present(self.arena, &field);
                self.decode_string(cursor, message, &field, place.slot)?;
            }
            FieldMode::Scalar => {
                let bits = read_scalar(cursor, ty)?;
                if self.is_unknown_enum(&place, bits) {
                    self.push_unknown_enum(message, field.number(), bits, start)?;
                    return Ok(Outcome::Diverted);
                }
                message.mark_present(self.arena, &field);
                store_scalar(self.arena, place.slot, ty, bits);
            }
        }
        Ok(Outcome::Stored)
    }

    fn decode_sub_message(
        &mut self,
        cursor: &mut Cursor<'_>,
        child: Message<'_>,
        number: u32,
        wire_type: WireType,
        start: usize,
    ) -> Result<(), DecodeError> {
        if unlikely(self.depth >= self.options.max_depth) {
            return Err(DecodeError::new(DecodeErrorKind::DepthExceeded, start));
        }
        self.depth += 1;
        tracing::trace!(depth = self.depth, field = number, "push frame");

        if wire_type == WireType::SGroup {
            self.decode_message(cursor, child, Some(number))?;
        } else {
            let len = cursor.read_len()?;
            let previous = cursor.push_limit(len)?;
            self.decode_message(cursor, child, None)?;
            cursor.pop_limit(previous);
        }

        tracing::trace!(depth = self.depth, field = number, "pop frame");
        self.depth -= 1;
        Ok(())
    }

    fn decode_string(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'_>,
        field: &FieldEntry,
        slot: ArenaPtr,
    ) -> Result<(), DecodeError> {
        let len = cursor.read_len()?;
        let offset = cursor.position();
        let bytes = cursor.read_bytes(len)?;

        if field.validates_utf8() && unlikely(core::str::from_utf8(bytes).is_err()) {
            if self.options.strict_utf8 {
                return Err(DecodeError::new(DecodeErrorKind::BadUtf8, offset));
            }
            tracing::warn!(
                field = field.number(),
                offset,
                "invalid UTF-8 in string field, stored as bytes"
            );
            message.flag_invalid_utf8(self.arena);
        }

        let ptr = match self.input {
            Some(input) => (len > 0).then(|| input.add(offset)),
            None => self
                .arena
                .copy_in(bytes)
                .map_err(out_of_memory(offset))?,
        };
        value::write_view(self.arena, slot, ptr, len);
        Ok(())
    }

    fn decode_packed<'s>(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'s>,
        place: Place<'s>,
        start: usize,
    ) -> Result<(), DecodeError> {
        let ty = place.field.field_type();
        let len = cursor.read_len()?;
        let size = fixed_size(ty);
        if size.is_some_and(|size| len % size != 0) {
            return Err(DecodeError::new(
                DecodeErrorKind::InvalidPackedLength,
                start,
            ));
        }

        let previous = cursor.push_limit(len)?;
        let array = place.array_mut(self.arena).map_err(out_of_memory(start))?;
        if let Some(size) = size {
            array
                .reserve(self.arena, len / size)
                .map_err(out_of_memory(start))?;
        }
        while !cursor.is_at_limit() {
            let bits = read_scalar(cursor, ty)?;
            if self.is_unknown_enum(&place, bits) {
                self.push_unknown_enum(message, place.field.number(), bits, start)?;
                continue;
            }
            let element = array.push(self.arena).map_err(out_of_memory(start))?;
            store_scalar(self.arena, element, ty, bits);
        }
        cursor.pop_limit(previous);
        Ok(())
    }

    /// Decode a map entry into a transient instance and insert it, the last
    /// entry for a key wins.
    ///
    /// An entry that left anything in its unknown fields is kept whole as an
    /// unknown record of `message` instead.
    fn decode_map_entry(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'_>,
        place: Place<'_>,
        start: usize,
    ) -> Result<(), DecodeError> {
        let layout = place
            .sub_layout()
            .ok_or(DecodeError::new(DecodeErrorKind::UnlinkedSubMessage, start))?;
        let entry = Message::new(layout, self.arena).map_err(out_of_memory(start))?;
        self.decode_sub_message(cursor, entry, place.field.number(), WireType::Len, start)?;
        if !entry.unknown_fields(self.arena).is_empty() {
            let record = cursor.consumed_since(start);
            tracing::trace!(
                field = place.field.number(),
                len = record.len(),
                "map entry kept as unknown"
            );
            return message
                .append_unknown(self.arena, record)
                .map_err(out_of_memory(start));
        }

        let [key_field, value_field] = layout.layout().fields() else {
            return Ok(());
        };
        // An entry without a value maps the key to an empty message.
        if value_field.is_sub_message() && layout.sub_message(value_field).is_some() {
            entry
                .mutable_submessage(self.arena, value_field)
                .map_err(|err| reflect_error(err, start))?;
        }
        let Some(key) = MapKey::from_value(&entry.get_unchecked(self.arena, key_field)) else {
            return Ok(());
        };
        let index = map::storage_index(self.arena, place.slot).map_err(out_of_memory(start))?;
        self.arena.maps[index].entries.insert(key, entry.ptr());
        Ok(())
    }

    /// Decode a record whose number isn't a field of the layout.
    fn decode_extension(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'_>,
        number: u32,
        wire_type: WireType,
        start: usize,
    ) -> Result<Outcome, DecodeError> {
        let layout = message.layout();
        if !layout.is_extendable() {
            return Ok(Outcome::Mismatch);
        }
        let Some(id) = self
            .options
            .extensions
            .and_then(|registry| registry.find(layout.id(), number))
        else {
            return Ok(Outcome::Mismatch);
        };
        let extension = layout.set().extension(id);
        if !accepts(extension.field(), wire_type) {
            return Ok(Outcome::Mismatch);
        }

        let (slot, created) = message
            .extension_slot_mut(self.arena, id)
            .map_err(out_of_memory(start))?;
        let place = Place::extension(slot, extension, layout.set());
        let outcome = self.decode_field(cursor, message, place, wire_type, start)?;
        if outcome == Outcome::Diverted && created && !extension.field().is_repeated() {
            message.discard_extension(self.arena, number);
        }
        Ok(outcome)
    }

    /// One `group 1 { type_id = 2; message = 3; }` item of a MessageSet.
    ///
    /// Items whose type the registry doesn't know are kept whole as
    /// unknown fields.
    fn decode_message_set_item(
        &mut self,
        cursor: &mut Cursor<'_>,
        message: Message<'_>,
        start: usize,
    ) -> Result<(), DecodeError> {
        let mut type_id = None;
        let mut payload = None;
        loop {
            if cursor.is_at_limit() {
                return Err(DecodeError::new(
                    DecodeErrorKind::BadGroupEnd,
                    cursor.position(),
                ));
            }
            let key = cursor.read_tag()?;
            match key.into_parts() {
                (1, WireType::EGroup) => break,
                (2, WireType::Varint) => {
                    let id = cursor.read_varint32()?;
                    type_id.get_or_insert(id);
                }
                (3, WireType::Len) => {
                    let len = cursor.read_len()?;
                    let offset = cursor.position();
                    cursor.read_bytes(len)?;
                    payload.get_or_insert((offset, len));
                }
                _ => cursor.skip_field(key, self.remaining_depth())?,
            }
        }

        let layout = message.layout();
        let extension = type_id.and_then(|number| self.options.extensions?.find(layout.id(), number));
        match (extension, payload) {
            (Some(id), Some((offset, len))) => {
                if unlikely(self.depth >= self.options.max_depth) {
                    return Err(DecodeError::new(DecodeErrorKind::DepthExceeded, start));
                }
                let set = layout.set();
                let (slot, _) = message
                    .extension_slot_mut(self.arena, id)
                    .map_err(out_of_memory(start))?;
                let child = Place::extension(slot, set.extension(id), set)
                    .mutable_message(self.arena)
                    .map_err(|err| reflect_error(err, start))?;

                let mut body = cursor.sub_range(offset, len);
                self.depth += 1;
                self.decode_message(&mut body, child, None)?;
                self.depth -= 1;
            }
            _ if self.options.discard_unknown => {}
            _ => {
                let item = cursor.consumed_since(start);
                tracing::trace!(?type_id, len = item.len(), "unknown message set item");
                message
                    .append_unknown(self.arena, item)
                    .map_err(out_of_memory(start))?;
            }
        }
        Ok(())
    }

    /// Whether `bits` is a value the closed enum of `place` doesn't define.
    fn is_unknown_enum(&self, place: &Place<'_>, bits: u64) -> bool {
        if !place.field.is_closed_enum() {
            return false;
        }
        match place.sub {
            SubLayout::Enum(id) => !place
                .set
                .enum_layout(id)
                .contains(low32(bits).cast_signed()),
            // Unlinked closed enums accept every value.
            SubLayout::Message(_) | SubLayout::Unlinked => false,
        }
    }

    /// Keep an unknown closed-enum value as a varint record.
    fn push_unknown_enum(
        &mut self,
        message: Message<'_>,
        number: u32,
        bits: u64,
        start: usize,
    ) -> Result<(), DecodeError> {
        if self.options.discard_unknown {
            return Ok(());
        }
        let value = i64::from(low32(bits).cast_signed());
        let mut record = [0u8; 16];
        let mut buf = &mut record[..];
        wire::encode_key(number, WireType::Varint, &mut buf);
        wire::encode_varint(value.cast_unsigned(), &mut buf);
        let unused = buf.len();
        let written = record.len() - unused;
        message
            .append_unknown(self.arena, &record[..written])
            .map_err(out_of_memory(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{
        EnumLayout, ExtensionLayout, FieldSpec, Label, LayoutId, LayoutSet, MessageKind,
        MessageSpec,
    };
    use crate::message::Value;

    fn single(field: FieldSpec) -> (LayoutSet, LayoutId) {
        let mut set = LayoutSet::new();
        let id = set
            .build_message(&MessageSpec {
                fields: vec![field],
                ..MessageSpec::default()
            })
            .unwrap();
        (set, id)
    }

    fn decode_err(layout: LayoutRef<'_>, input: &'static [u8], options: &DecodeOptions<'_>) -> DecodeError {
        let mut arena = Arena::new();
        decode(layout, Bytes::from_static(input), &mut arena, options).unwrap_err()
    }

    #[test]
    fn test_closed_enum_diverts_unknown_values() {
        let mut set = LayoutSet::new();
        let values = set.add_enum(EnumLayout::from_values([0, 1, 2]));
        let id = set
            .build_message(&MessageSpec {
                fields: vec![
                    FieldSpec::new(1, FieldType::Enum),
                    FieldSpec {
                        label: Label::Repeated,
                        packed: true,
                        ..FieldSpec::new(2, FieldType::Enum)
                    },
                ],
                ..MessageSpec::default()
            })
            .unwrap();
        set.link_enum(id, 1, values).unwrap();
        set.link_enum(id, 2, values).unwrap();

        let mut arena = Arena::new();
        // 1: 5 (unknown), 2: [1, 7, 2]
        let input = Bytes::from_static(&[0x08, 0x05, 0x12, 0x03, 0x01, 0x07, 0x02]);
        let message = decode(set.message(id), input, &mut arena, &DecodeOptions::new()).unwrap();
        let status = message.field(1).unwrap();
        let repeated = message.field(2).unwrap();

        assert!(!message.has(&arena, status));
        let values: Vec<_> = message
            .array_iter(&arena, repeated)
            .filter_map(|value| value.as_i32())
            .collect();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(message.unknown_fields(&arena), &[0x08, 0x05, 0x10, 0x07]);
    }

    #[test]
    fn test_open_enum_keeps_unknown_values() {
        let (set, id) = single(FieldSpec {
            closed_enum: false,
            ..FieldSpec::new(1, FieldType::Enum)
        });
        let mut arena = Arena::new();
        let input = Bytes::from_static(&[0x08, 0x63]);
        let message = decode(set.message(id), input, &mut arena, &DecodeOptions::new()).unwrap();
        assert_eq!(message.get(&arena, message.field(1).unwrap()), Value::Enum(99));
        assert!(message.unknown_fields(&arena).is_empty());
    }

    #[test]
    fn test_negative_int32_and_zigzag() {
        let mut set = LayoutSet::new();
        let id = set
            .build_message(&MessageSpec {
                fields: vec![
                    FieldSpec::new(1, FieldType::Int32),
                    FieldSpec::new(2, FieldType::SInt32),
                    FieldSpec::new(3, FieldType::SInt64),
                    FieldSpec::new(4, FieldType::Bool),
                ],
                ..MessageSpec::default()
            })
            .unwrap();
        let mut arena = Arena::new();
        let input = Bytes::from_static(&[
            0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01, // 1: -1
            0x10, 0x03, // 2: -2
            0x18, 0x04, // 3: 2
            0x20, 0x02, // 4: true
        ]);
        let message = decode(set.message(id), input, &mut arena, &DecodeOptions::new()).unwrap();
        let get = |number| message.get(&arena, message.field(number).unwrap());
        assert_eq!(get(1), Value::I32(-1));
        assert_eq!(get(2), Value::I32(-2));
        assert_eq!(get(3), Value::I64(2));
        assert_eq!(get(4), Value::Bool(true));
    }

    #[test]
    fn test_malformed_input() {
        let (set, id) = single(FieldSpec::new(1, FieldType::Int32));
        let layout = set.message(id);
        let options = DecodeOptions::new();

        let err = decode_err(layout, &[0x08, 0x96], &options);
        assert_eq!(err.kind(), DecodeErrorKind::MalformedVarint);
        assert_eq!(err.offset(), 1);

        let err = decode_err(layout, &[0x0F, 0x00], &options);
        assert_eq!(err.kind(), DecodeErrorKind::MalformedTag);

        let err = decode_err(layout, &[0x12, 0x05, 0x01], &options);
        assert_eq!(err.kind(), DecodeErrorKind::UnexpectedEndOfBuffer);

        // Unexpected end-group tag.
        let err = decode_err(layout, &[0x08, 0x01, 0x0C], &options);
        assert_eq!(err.kind(), DecodeErrorKind::BadGroupEnd);
        assert_eq!(err.offset(), 2);
    }

    #[test]
    fn test_packed_fixed_length_must_divide() {
        let (set, id) = single(FieldSpec {
            label: Label::Repeated,
            ..FieldSpec::new(1, FieldType::Fixed32)
        });
        let err = decode_err(
            set.message(id),
            &[0x0A, 0x05, 1, 0, 0, 0, 2],
            &DecodeOptions::new(),
        );
        assert_eq!(err.kind(), DecodeErrorKind::InvalidPackedLength);
    }

    #[test]
    fn test_depth_limit() {
        let mut set = LayoutSet::new();
        let id = set
            .build_message(&MessageSpec {
                fields: vec![FieldSpec::new(1, FieldType::Message)],
                ..MessageSpec::default()
            })
            .unwrap();
        set.link_message(id, 1, id).unwrap();
        let layout = set.message(id);

        // Three levels of nesting below the root.
        let input: &'static [u8] = &[0x0A, 0x04, 0x0A, 0x02, 0x0A, 0x00];
        let mut arena = Arena::new();
        let mut options = DecodeOptions::new();
        options.max_depth(3);
        decode(layout, Bytes::from_static(input), &mut arena, &options).unwrap();

        options.max_depth(2);
        let err = decode_err(layout, input, &options);
        assert_eq!(err.kind(), DecodeErrorKind::DepthExceeded);
        assert_eq!(err.offset(), 4);
    }

    #[test]
    fn test_groups() {
        let mut set = LayoutSet::new();
        let inner = set
            .build_message(&MessageSpec {
                fields: vec![FieldSpec::new(1, FieldType::Int32)],
                ..MessageSpec::default()
            })
            .unwrap();
        let outer = set
            .build_message(&MessageSpec {
                fields: vec![FieldSpec::new(2, FieldType::Group)],
                ..MessageSpec::default()
            })
            .unwrap();
        set.link_message(outer, 2, inner).unwrap();
        let layout = set.message(outer);

        let mut arena = Arena::new();
        let input = Bytes::from_static(&[0x13, 0x08, 0x2A, 0x14]);
        let message = decode(layout, input, &mut arena, &DecodeOptions::new()).unwrap();
        let child = message
            .get_submessage(&arena, message.field(2).unwrap())
            .unwrap();
        assert_eq!(child.get(&arena, child.field(1).unwrap()), Value::I32(42));

        // Closed by the wrong end tag, or not closed at all.
        let err = decode_err(layout, &[0x13, 0x08, 0x2A, 0x1C], &DecodeOptions::new());
        assert_eq!(err.kind(), DecodeErrorKind::BadGroupEnd);
        let err = decode_err(layout, &[0x13, 0x08, 0x2A], &DecodeOptions::new());
        assert_eq!(err.kind(), DecodeErrorKind::BadGroupEnd);
    }

    #[test]
    fn test_utf8_policies() {
        let (set, id) = single(FieldSpec {
            validate_utf8: true,
            ..FieldSpec::new(1, FieldType::String)
        });
        let layout = set.message(id);
        let input: &'static [u8] = &[0x0A, 0x02, 0xC3, 0x28];

        let mut arena = Arena::new();
        let message =
            decode(layout, Bytes::from_static(input), &mut arena, &DecodeOptions::new()).unwrap();
        assert!(message.has_invalid_utf8(&arena));
        assert_eq!(
            message.get(&arena, message.field(1).unwrap()),
            Value::String(&[0xC3, 0x28])
        );

        let mut options = DecodeOptions::new();
        options.strict_utf8(true);
        let err = decode_err(layout, input, &options);
        assert_eq!(err.kind(), DecodeErrorKind::BadUtf8);
        assert_eq!(err.offset(), 2);
    }

    #[test]
    fn test_aliased_strings() {
        let (set, id) = single(FieldSpec::new(1, FieldType::Bytes));
        let mut arena = Arena::new();
        let mut options = DecodeOptions::new();
        options.alias_strings(true);
        let input = Bytes::from(vec![0x0A, 0x03, b'a', b'b', b'c']);
        let message = decode(set.message(id), input, &mut arena, &options).unwrap();
        assert_eq!(
            message.get(&arena, message.field(1).unwrap()),
            Value::Bytes(b"abc")
        );
        // The payload stays in the input, only the message went into a block.
        assert_eq!(arena.block_count(), 1);

        let mut copied = Arena::new();
        let input = Bytes::from(vec![0x0A, 0x03, b'a', b'b', b'c']);
        let message = decode(set.message(id), input, &mut copied, &DecodeOptions::new()).unwrap();
        assert_eq!(
            message.get(&copied, message.field(1).unwrap()),
            Value::Bytes(b"abc")
        );
    }

    #[test]
    fn test_map_entry_with_unknown_data_stays_unknown() {
        let mut set = LayoutSet::new();
        let values = set.add_enum(EnumLayout::from_values([0, 1]));
        let entry = set
            .build_message(&MessageSpec {
                kind: MessageKind::MapEntry,
                fields: vec![
                    FieldSpec::new(1, FieldType::Int32),
                    FieldSpec::new(2, FieldType::Enum),
                ],
                ..MessageSpec::default()
            })
            .unwrap();
        set.link_enum(entry, 2, values).unwrap();
        let id = set
            .build_message(&MessageSpec {
                fields: vec![FieldSpec {
                    label: Label::Repeated,
                    map: true,
                    ..FieldSpec::new(1, FieldType::Message)
                }],
                ..MessageSpec::default()
            })
            .unwrap();
        set.link_message(id, 1, entry).unwrap();

        // { 7: 5 }, and 5 is not a value of the closed enum.
        let input: &'static [u8] = &[0x0A, 0x04, 0x08, 0x07, 0x10, 0x05];
        let mut arena = Arena::new();
        let message = decode(
            set.message(id),
            Bytes::from_static(input),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();
        let field = message.field(1).unwrap();
        assert_eq!(message.map_len(&arena, field), 0);
        assert_eq!(message.unknown_fields(&arena), input);

        let bytes =
            crate::encode::encode_to_vec(message, &arena, &crate::encode::EncodeOptions::new())
                .unwrap();
        assert_eq!(bytes, input);

        // The same entry followed by { 3: 1 }.
        let input: &'static [u8] = &[
            0x0A, 0x04, 0x08, 0x07, 0x10, 0x05, //
            0x0A, 0x04, 0x08, 0x03, 0x10, 0x01,
        ];
        let message = decode(
            set.message(id),
            Bytes::from_static(input),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();
        assert_eq!(message.map_len(&arena, field), 1);
        assert_eq!(
            message.map_get(&arena, field, &MapKey::I32(3)),
            Some(Value::Enum(1))
        );
        assert_eq!(message.unknown_fields(&arena), &input[..6]);
    }

    #[test]
    fn test_required_fields() {
        let (set, id) = single(FieldSpec {
            label: Label::Required,
            ..FieldSpec::new(1, FieldType::Int32)
        });
        let layout = set.message(id);
        let mut options = DecodeOptions::new();
        options.check_required(true);

        let err = decode_err(layout, &[0x10, 0x01], &options);
        assert_eq!(err.kind(), DecodeErrorKind::MissingRequired);
        assert_eq!(err.offset(), 2);

        // Merging keeps the partial result for inspection.
        let mut arena = Arena::new();
        let message = Message::new(layout, &mut arena).unwrap();
        let err = merge(message, Bytes::from_static(&[0x10, 0x01]), &mut arena, &options)
            .unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::MissingRequired);
        assert_eq!(message.unknown_fields(&arena), &[0x10, 0x01]);

        merge(message, Bytes::from_static(&[0x08, 0x01]), &mut arena, &options).unwrap();
        assert_eq!(message.missing_required(&arena), None);
    }

    #[test]
    fn test_merge_leaves_message_untouched_on_error() {
        let (set, id) = single(FieldSpec::new(1, FieldType::Int32));
        let mut arena = Arena::new();
        let message = Message::new(set.message(id), &mut arena).unwrap();
        let field = message.field(1).unwrap();
        message.set(&mut arena, field, Value::I32(3)).unwrap();

        let input = Bytes::from_static(&[0x08, 0x07, 0x08]);
        merge(message, input, &mut arena, &DecodeOptions::new()).unwrap_err();
        assert_eq!(message.get(&arena, field), Value::I32(3));
    }

    #[test]
    fn test_extensions_need_a_registry() {
        let mut set = LayoutSet::new();
        let id = set
            .build_message(&MessageSpec {
                extendable: true,
                ..MessageSpec::default()
            })
            .unwrap();
        let ext = set
            .add_extension(
                ExtensionLayout::from_spec(
                    &FieldSpec::new(100, FieldType::UInt64),
                    id,
                    SubLayout::Unlinked,
                )
                .unwrap(),
            )
            .unwrap();
        let registry = ExtensionRegistry::from_set(&set).unwrap();
        let input: &'static [u8] = &[0xA0, 0x06, 0x2A];

        let mut arena = Arena::new();
        let plain = decode(
            set.message(id),
            Bytes::from_static(input),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();
        assert!(!plain.has_extension(&arena, ext));
        assert_eq!(plain.unknown_fields(&arena), input);

        let mut options = DecodeOptions::new();
        options.extensions(&registry);
        let message = decode(set.message(id), Bytes::from_static(input), &mut arena, &options).unwrap();
        assert_eq!(message.get_extension(&arena, ext), Some(Value::U64(42)));
        assert!(message.unknown_fields(&arena).is_empty());
    }

    #[test]
    fn test_message_set_items() {
        let mut set = LayoutSet::new();
        let container = set
            .build_message(&MessageSpec {
                kind: MessageKind::MessageSet,
                ..MessageSpec::default()
            })
            .unwrap();
        let payload = set
            .build_message(&MessageSpec {
                fields: vec![FieldSpec::new(1, FieldType::Int32)],
                ..MessageSpec::default()
            })
            .unwrap();
        let ext = set
            .add_extension(
                ExtensionLayout::from_spec(
                    &FieldSpec::new(77, FieldType::Message),
                    container,
                    SubLayout::Message(payload),
                )
                .unwrap(),
            )
            .unwrap();
        let registry = ExtensionRegistry::from_set(&set).unwrap();
        let mut options = DecodeOptions::new();
        options.extensions(&registry);

        // Known item for type 77, then an item for unknown type 78.
        let input = Bytes::from_static(&[
            0x0B, 0x10, 0x4D, 0x1A, 0x02, 0x08, 0x05, 0x0C, //
            0x0B, 0x10, 0x4E, 0x1A, 0x00, 0x0C,
        ]);
        let mut arena = Arena::new();
        let message = decode(set.message(container), input, &mut arena, &options).unwrap();
        let item = message
            .get_extension(&arena, ext)
            .and_then(|value| value.as_message())
            .unwrap();
        assert_eq!(item.get(&arena, item.field(1).unwrap()), Value::I32(5));
        assert_eq!(
            message.unknown_fields(&arena),
            &[0x0B, 0x10, 0x4E, 0x1A, 0x00, 0x0C]
        );
    }

    #[test]
    fn test_length_prefixed() {
        let (set, id) = single(FieldSpec::new(1, FieldType::Int32));
        let mut arena = Arena::new();
        let input = Bytes::from_static(&[0x02, 0x08, 0x07, 0x02, 0x08, 0x09]);
        let (first, used) =
            decode_length_prefixed(set.message(id), input.clone(), &mut arena, &DecodeOptions::new())
                .unwrap();
        assert_eq!(used, 3);
        assert_eq!(first.get(&arena, first.field(1).unwrap()), Value::I32(7));

        let (second, used) = decode_length_prefixed(
            set.message(id),
            input.slice(used..),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap();
        assert_eq!(used, 3);
        assert_eq!(second.get(&arena, second.field(1).unwrap()), Value::I32(9));

        let err = decode_length_prefixed(
            set.message(id),
            Bytes::from_static(&[0x05, 0x08]),
            &mut arena,
            &DecodeOptions::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), DecodeErrorKind::UnexpectedEndOfBuffer);
    }
}
