//! Message instances and the reflection surface.
//!
//! A [`Message`] is a small `Copy` handle: the layout that describes it and
//! the address of its memory in an [`Arena`]. The memory starts with a fixed
//! header, followed by the field data the layout describes:
//!
//! ```text
//! +0   unknown-field buffer pointer   u64
//! +8   unknown-field buffer length    u32
//! +12  unknown-field buffer capacity  u32
//! +16  extension set index + 1        u32
//! +20  flags                          u32
//! +24  field data (hasbits first)     layout.size bytes
//! ```
//!
//! Every operation takes the arena explicitly. Reads panic when handed an
//! arena the message doesn't live in, mutations report
//! [`ReflectError::ForeignValue`] instead.

pub(crate) mod array;
pub(crate) mod extension;
pub(crate) mod map;
mod merge;
pub(crate) mod value;

use core::fmt;

pub use map::MapKey;
pub use value::Value;

use self::array::RawArray;
use self::extension::{ExtensionEntry, ExtensionSet};
use crate::arena::{Arena, ArenaPtr};
use crate::error::{ArenaError, ReflectError};
use crate::layout::{
    ExtensionId, ExtensionLayout, FieldEntry, FieldMode, LayoutRef, LayoutSet, SubLayout,
};
use crate::util::CastFrom;

pub(crate) const HEADER_SIZE: usize = 24;
const UNKNOWN_DATA: usize = 0;
const UNKNOWN_LEN: usize = 8;
const UNKNOWN_CAPACITY: usize = 12;
const EXTENSIONS: usize = 16;
const FLAGS: usize = 20;

/// A validated string field held invalid UTF-8 and was stored anyway.
const FLAG_BAD_UTF8: u32 = 1 << 0;

const MIN_UNKNOWN_CAPACITY: usize = 64;

/// Handle to a message instance living in an [`Arena`].
#[derive(Clone, Copy)]
pub struct Message<'s> {
    layout: LayoutRef<'s>,
    ptr: ArenaPtr,
    arena: u32,
}

impl<'s> Message<'s> {
    /// Allocate an empty instance of `layout`.
    pub fn new(layout: LayoutRef<'s>, arena: &mut Arena) -> Result<Self, ArenaError> {
        let size = HEADER_SIZE + usize::from(layout.size());
        let ptr = arena.alloc(size, 8)?;
        Ok(Message::from_parts(layout, ptr, arena.id()))
    }

    pub(crate) fn from_parts(layout: LayoutRef<'s>, ptr: ArenaPtr, arena: u32) -> Self {
        Message { layout, ptr, arena }
    }

    pub fn layout(&self) -> LayoutRef<'s> {
        self.layout
    }

    pub(crate) fn ptr(&self) -> ArenaPtr {
        self.ptr
    }

    /// The entry for field `number`.
    pub fn field(&self, number: u32) -> Option<&'s FieldEntry> {
        self.layout.layout().find_field(number)
    }

    /// Whether this message lives in `arena` (and the arena wasn't reset
    /// since).
    pub fn belongs_to(&self, arena: &Arena) -> bool {
        self.arena == arena.id()
    }

    #[track_caller]
    pub(crate) fn assert_arena(&self, arena: &Arena) {
        assert!(self.belongs_to(arena), "message used with a foreign arena");
    }

    fn check_arena(&self, arena: &Arena) -> Result<(), ReflectError> {
        if self.belongs_to(arena) {
            Ok(())
        } else {
            Err(ReflectError::ForeignValue)
        }
    }

    pub(crate) fn data(&self) -> ArenaPtr {
        self.ptr.add(HEADER_SIZE)
    }

    pub(crate) fn slot(&self, field: &FieldEntry) -> ArenaPtr {
        self.data().add(usize::from(field.offset))
    }

    pub(crate) fn place(&self, field: &FieldEntry) -> Place<'s> {
        Place {
            slot: self.slot(field),
            field: *field,
            sub: self.layout.sub(field),
            set: self.layout.set(),
        }
    }

    // Presence.

    fn hasbit_ptr(&self, bit: u16) -> (ArenaPtr, u8) {
        (self.data().add(usize::from(bit / 8)), 1 << (bit % 8))
    }

    pub(crate) fn has_hasbit(&self, arena: &Arena, bit: u16) -> bool {
        let (ptr, mask) = self.hasbit_ptr(bit);
        arena.read_u8(ptr) & mask != 0
    }

    fn set_hasbit(&self, arena: &mut Arena, bit: u16) {
        let (ptr, mask) = self.hasbit_ptr(bit);
        let byte = arena.read_u8(ptr);
        arena.write_u8(ptr, byte | mask);
    }

    fn clear_hasbit(&self, arena: &mut Arena, bit: u16) {
        let (ptr, mask) = self.hasbit_ptr(bit);
        let byte = arena.read_u8(ptr);
        arena.write_u8(ptr, byte & !mask);
    }

    fn oneof_case(&self, arena: &Arena, case_offset: u16) -> u32 {
        arena.read_u32(self.data().add(usize::from(case_offset)))
    }

    /// Record that `field` is set: sets its hasbit, or makes it the active
    /// member of its oneof. Switching members zeroes the shared slot.
    pub(crate) fn mark_present(&self, arena: &mut Arena, field: &FieldEntry) {
        if let Some(bit) = field.hasbit() {
            self.set_hasbit(arena, bit);
        } else if let Some(case_offset) = field.oneof_case_offset() {
            let case = self.data().add(usize::from(case_offset));
            if arena.read_u32(case) != field.number {
                arena.bytes_mut(self.slot(field), field.rep.size()).fill(0);
                arena.write_u32(case, field.number);
            }
        }
    }

    /// The stored sub-message of a singular message field, if any.
    pub(crate) fn present_message(&self, arena: &Arena, field: &FieldEntry) -> Option<ArenaPtr> {
        if let Some(case_offset) = field.oneof_case_offset() {
            if self.oneof_case(arena, case_offset) != field.number {
                return None;
            }
        }
        ArenaPtr::from_raw(arena.read_u64(self.slot(field)))
    }

    /// Whether `field` is set.
    ///
    /// Repeated and map fields are set when non-empty, implicit-presence
    /// scalars when they hold a non-zero value.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn has(&self, arena: &Arena, field: &FieldEntry) -> bool {
        self.assert_arena(arena);
        self.has_unchecked(arena, field)
    }

    pub(crate) fn has_unchecked(&self, arena: &Arena, field: &FieldEntry) -> bool {
        match field.mode {
            FieldMode::Array => self.place(field).array_len(arena) > 0,
            FieldMode::Map => map::storage(arena, self.slot(field))
                .is_some_and(|storage| !storage.entries.is_empty()),
            FieldMode::Scalar => {
                if let Some(bit) = field.hasbit() {
                    self.has_hasbit(arena, bit)
                } else if let Some(case_offset) = field.oneof_case_offset() {
                    self.oneof_case(arena, case_offset) == field.number
                } else {
                    !value::is_zero(arena, self.slot(field), field.descriptor_type)
                }
            }
        }
    }

    /// The value of a singular field, or its type's zero value when unset.
    ///
    /// Repeated and map fields also read as the zero value, see
    /// [`Message::array_get`] and [`Message::map_get`].
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn get<'a>(&self, arena: &'a Arena, field: &FieldEntry) -> Value<'a>
    where
        's: 'a,
    {
        self.assert_arena(arena);
        self.get_unchecked(arena, field)
    }

    pub(crate) fn get_unchecked<'a>(&self, arena: &'a Arena, field: &FieldEntry) -> Value<'a>
    where
        's: 'a,
    {
        if field.mode != FieldMode::Scalar {
            return Value::default_for(field.descriptor_type);
        }
        if let Some(case_offset) = field.oneof_case_offset() {
            if self.oneof_case(arena, case_offset) != field.number {
                return Value::default_for(field.descriptor_type);
            }
        }
        self.place(field).read(arena)
    }

    /// Store `value` into a singular field, marking it present.
    ///
    /// Setting a oneof member makes it the active one. A message value must
    /// live in the same arena and have the field's sub-layout, `None`
    /// clears the field.
    pub fn set(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        value: Value<'_>,
    ) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        if field.mode != FieldMode::Scalar {
            return Err(ReflectError::NotSingular {
                field: field.number,
            });
        }
        let place = self.place(field);
        place.check_value(arena, &value)?;
        if value == Value::Message(None) {
            return self.clear(arena, field);
        }
        // Payloads are copied in first so a failed copy leaves the field as it was.
        let payload = match value {
            Value::String(bytes) | Value::Bytes(bytes) => {
                Some((arena.copy_in(bytes)?, bytes.len()))
            }
            _ => None,
        };
        self.mark_present(arena, field);
        match payload {
            Some((ptr, len)) => value::write_view(arena, place.slot, ptr, len),
            None => place.write(arena, &value)?,
        }
        Ok(())
    }

    /// Reset a field to its unset state.
    pub fn clear(&self, arena: &mut Arena, field: &FieldEntry) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        match field.mode {
            FieldMode::Array => {
                if let Some(array) = self.place(field).array(arena) {
                    array.set_len(arena, 0)?;
                }
            }
            FieldMode::Map => {
                if map::storage(arena, self.slot(field)).is_some() {
                    let index = map::storage_index(arena, self.slot(field))?;
                    arena.maps[index].entries.clear();
                }
            }
            FieldMode::Scalar => {
                if let Some(case_offset) = field.oneof_case_offset() {
                    if self.oneof_case(arena, case_offset) != field.number {
                        return Ok(());
                    }
                    arena.write_u32(self.data().add(usize::from(case_offset)), 0);
                }
                if let Some(bit) = field.hasbit() {
                    self.clear_hasbit(arena, bit);
                }
                arena.bytes_mut(self.slot(field), field.rep.size()).fill(0);
            }
        }
        Ok(())
    }

    /// The sub-message stored in a singular message field.
    ///
    /// `None` when unset, callers read defaults from the field's layout.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn get_submessage(&self, arena: &Arena, field: &FieldEntry) -> Option<Message<'s>> {
        self.assert_arena(arena);
        if !field.is_sub_message() || field.mode != FieldMode::Scalar {
            return None;
        }
        let sub = self.layout.sub_message(field)?;
        let ptr = self.present_message(arena, field)?;
        Some(Message::from_parts(sub, ptr, self.arena))
    }

    /// The sub-message of a singular message field, created if unset.
    ///
    /// Returns the child and whether it was just created. Creating it marks
    /// the field present (and active, for a oneof member).
    pub fn mutable_submessage(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
    ) -> Result<(Message<'s>, bool), ReflectError> {
        self.check_arena(arena)?;
        let number = field.number;
        if !field.is_sub_message() {
            return Err(ReflectError::NotMessage { field: number });
        }
        if field.mode != FieldMode::Scalar {
            return Err(ReflectError::NotSingular { field: number });
        }
        let sub = self
            .layout
            .sub_message(field)
            .ok_or(ReflectError::Unlinked { field: number })?;
        if let Some(ptr) = self.present_message(arena, field) {
            return Ok((Message::from_parts(sub, ptr, self.arena), false));
        }
        let child = Message::new(sub, arena)?;
        self.mark_present(arena, field);
        arena.write_u64(self.slot(field), ArenaPtr::to_raw(Some(child.ptr)));
        Ok((child, true))
    }

    /// Field number of the active member of oneof `index`, 0 if none.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena` or the layout has no oneof
    /// `index`.
    pub fn which_oneof(&self, arena: &Arena, index: usize) -> u32 {
        self.assert_arena(arena);
        self.oneof_case(arena, self.layout.oneofs()[index].case_offset)
    }

    // Repeated fields.

    fn array_place(&self, field: &FieldEntry) -> Result<Place<'s>, ReflectError> {
        if field.mode != FieldMode::Array {
            return Err(ReflectError::NotRepeated {
                field: field.number,
            });
        }
        Ok(self.place(field))
    }

    /// Number of elements of a repeated field, 0 for other fields.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn array_len(&self, arena: &Arena, field: &FieldEntry) -> usize {
        self.assert_arena(arena);
        match field.mode {
            FieldMode::Array => self.place(field).array_len(arena),
            FieldMode::Scalar | FieldMode::Map => 0,
        }
    }

    /// Element `index` of a repeated field.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn array_get<'a>(&self, arena: &'a Arena, field: &FieldEntry, index: usize) -> Option<Value<'a>>
    where
        's: 'a,
    {
        self.assert_arena(arena);
        match field.mode {
            FieldMode::Array => self.place(field).array_get(arena, index),
            FieldMode::Scalar | FieldMode::Map => None,
        }
    }

    /// Iterate the elements of a repeated field.
    pub fn array_iter<'a>(
        &self,
        arena: &'a Arena,
        field: &FieldEntry,
    ) -> impl Iterator<Item = Value<'a>> + use<'a, 's>
    where
        's: 'a,
    {
        let len = self.array_len(arena, field);
        let place = self.place(field);
        (0..len).filter_map(move |index| place.array_get(arena, index))
    }

    pub fn array_set(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        index: usize,
        value: Value<'_>,
    ) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        self.array_place(field)?.array_set(arena, index, &value)
    }

    pub fn array_append(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        value: Value<'_>,
    ) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        self.array_place(field)?.array_push(arena, &value)
    }

    /// Append a new, empty message to a repeated message field.
    pub fn append_message(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
    ) -> Result<Message<'s>, ReflectError> {
        self.check_arena(arena)?;
        self.array_place(field)?.array_push_message(arena)
    }

    /// Truncate a repeated field or extend it with zero values (empty
    /// messages for message fields).
    pub fn array_resize(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        len: usize,
    ) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        self.array_place(field)?.array_resize(arena, len)
    }

    // Maps.

    /// Layout of the map entry plus its key and value fields.
    fn map_entry(
        &self,
        field: &FieldEntry,
    ) -> Result<(LayoutRef<'s>, &'s FieldEntry, &'s FieldEntry), ReflectError> {
        let number = field.number;
        if field.mode != FieldMode::Map {
            return Err(ReflectError::NotMap { field: number });
        }
        let entry = self
            .layout
            .sub_message(field)
            .ok_or(ReflectError::Unlinked { field: number })?;
        let fields = entry.layout().fields();
        match fields {
            [key, value] => Ok((entry, key, value)),
            _ => Err(ReflectError::NotMap { field: number }),
        }
    }

    /// Number of entries of a map field, 0 for other fields.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn map_len(&self, arena: &Arena, field: &FieldEntry) -> usize {
        self.assert_arena(arena);
        if field.mode != FieldMode::Map {
            return 0;
        }
        map::storage(arena, self.slot(field)).map_or(0, |storage| storage.entries.len())
    }

    /// The value stored under `key`.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn map_get<'a>(&self, arena: &'a Arena, field: &FieldEntry, key: &MapKey) -> Option<Value<'a>>
    where
        's: 'a,
    {
        self.assert_arena(arena);
        let (entry, _, value_field) = self.map_entry(field).ok()?;
        let ptr = *map::storage(arena, self.slot(field))?.entries.get(key)?;
        Some(Message::from_parts(entry, ptr, self.arena).get_unchecked(arena, value_field))
    }

    /// Iterate a map field's entries in insertion order.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn map_iter<'a>(
        &self,
        arena: &'a Arena,
        field: &FieldEntry,
    ) -> impl Iterator<Item = (&'a MapKey, Value<'a>)> + use<'a, 's>
    where
        's: 'a,
    {
        self.assert_arena(arena);
        let entry = self.map_entry(field).ok();
        let storage = entry.and_then(|_| map::storage(arena, self.slot(field)));
        let id = self.arena;
        storage
            .into_iter()
            .flat_map(|storage| storage.entries.iter())
            .filter_map(move |(key, ptr)| {
                let (layout, _, value_field) = entry?;
                let value = Message::from_parts(layout, *ptr, id).get_unchecked(arena, value_field);
                Some((key, value))
            })
    }

    /// Insert or replace the entry for `key`.
    ///
    /// Returns whether an existing entry was replaced. A `None` message
    /// value stores an empty message.
    pub fn map_insert(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        key: MapKey,
        value: Value<'_>,
    ) -> Result<bool, ReflectError> {
        self.check_arena(arena)?;
        let (layout, key_field, value_field) = self.map_entry(field)?;
        if key.ctype() != key_field.ctype() {
            return Err(ReflectError::TypeMismatch {
                field: key_field.number,
                expected: key_field.ctype(),
            });
        }
        let entry = Message::new(layout, arena)?;
        entry.place(value_field).check_value(arena, &value)?;

        entry.place(key_field).write(arena, &key.as_value())?;
        match value {
            Value::Message(None) => {
                entry.mutable_submessage(arena, value_field)?;
            }
            value => entry.place(value_field).write(arena, &value)?,
        }

        let index = map::storage_index(arena, self.slot(field))?;
        Ok(arena.maps[index].entries.insert(key, entry.ptr).is_some())
    }

    /// Remove the entry for `key`, returning whether there was one.
    pub fn map_remove(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        key: &MapKey,
    ) -> Result<bool, ReflectError> {
        self.check_arena(arena)?;
        self.map_entry(field)?;
        if map::storage(arena, self.slot(field)).is_none() {
            return Ok(false);
        }
        let index = map::storage_index(arena, self.slot(field))?;
        Ok(arena.maps[index].entries.shift_remove(key).is_some())
    }

    /// The message value stored under `key`, inserting an empty one if the
    /// key is absent.
    pub fn map_mutable_message(
        &self,
        arena: &mut Arena,
        field: &FieldEntry,
        key: MapKey,
    ) -> Result<Message<'s>, ReflectError> {
        self.check_arena(arena)?;
        let (layout, _, value_field) = self.map_entry(field)?;
        if !value_field.is_sub_message() {
            return Err(ReflectError::NotMessage {
                field: field.number,
            });
        }
        let existing = map::storage(arena, self.slot(field))
            .and_then(|storage| storage.entries.get(&key))
            .copied();
        match existing {
            Some(ptr) => {
                let entry = Message::from_parts(layout, ptr, self.arena);
                Ok(entry.mutable_submessage(arena, value_field)?.0)
            }
            None => {
                self.map_insert(arena, field, key.clone(), Value::Message(None))?;
                let ptr = map::storage(arena, self.slot(field))
                    .and_then(|storage| storage.entries.get(&key))
                    .copied()
                    .ok_or(ReflectError::NotMap {
                        field: field.number,
                    })?;
                let entry = Message::from_parts(layout, ptr, self.arena);
                Ok(entry.mutable_submessage(arena, value_field)?.0)
            }
        }
    }

    // Extensions.

    fn extension_set_index(&self, arena: &Arena) -> Option<usize> {
        usize::cast_from(arena.read_u32(self.ptr.add(EXTENSIONS))).checked_sub(1)
    }

    pub(crate) fn extension_entries<'a>(&self, arena: &'a Arena) -> &'a [ExtensionEntry] {
        self.extension_set_index(arena)
            .and_then(|index| arena.extension_sets.get(index))
            .map_or(&[], |set| set.entries.as_slice())
    }

    /// Slot of extension `id`, created zeroed on first use.
    pub(crate) fn extension_slot_mut(
        &self,
        arena: &mut Arena,
        id: ExtensionId,
    ) -> Result<(ArenaPtr, bool), ArenaError> {
        let index = match self.extension_set_index(arena) {
            Some(index) => index,
            None => {
                arena.extension_sets.push(ExtensionSet::default());
                let index = arena.extension_sets.len() - 1;
                let raw = u32::try_from(index + 1)
                    .map_err(|_| ArenaError::OutOfMemory { requested: 0 })?;
                arena.write_u32(self.ptr.add(EXTENSIONS), raw);
                index
            }
        };
        let number = self.layout.set().extension(id).number();
        ExtensionSet::get_or_insert(arena, index, number, id)
    }

    /// Drop the entry of extension `number`, if present.
    pub(crate) fn discard_extension(&self, arena: &mut Arena, number: u32) {
        if let Some(index) = self.extension_set_index(arena) {
            arena.extension_sets[index].remove(number);
        }
    }

    fn extension_layout(&self, id: ExtensionId) -> Result<&'s ExtensionLayout, ReflectError> {
        let extension = self.layout.set().extension(id);
        if extension.extendee() != self.layout.id() {
            return Err(ReflectError::WrongExtendee);
        }
        Ok(extension)
    }

    fn extension_place(
        &self,
        arena: &Arena,
        extension: &'s ExtensionLayout,
    ) -> Option<Place<'s>> {
        let entry = self
            .extension_entries(arena)
            .iter()
            .find(|entry| entry.number == extension.number())?;
        Some(Place::extension(entry.slot, extension, self.layout.set()))
    }

    fn extension_place_mut(
        &self,
        arena: &mut Arena,
        id: ExtensionId,
    ) -> Result<Place<'s>, ReflectError> {
        self.check_arena(arena)?;
        let extension = self.extension_layout(id)?;
        let (slot, _) = self.extension_slot_mut(arena, id)?;
        Ok(Place::extension(slot, extension, self.layout.set()))
    }

    /// Whether extension `id` is set on this message.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn has_extension(&self, arena: &Arena, id: ExtensionId) -> bool {
        self.assert_arena(arena);
        let Ok(extension) = self.extension_layout(id) else {
            return false;
        };
        match self.extension_place(arena, extension) {
            Some(place) if place.field.is_repeated() => place.array_len(arena) > 0,
            Some(_) => true,
            None => false,
        }
    }

    /// Value of a singular extension, `None` when unset or repeated.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn get_extension<'a>(&self, arena: &'a Arena, id: ExtensionId) -> Option<Value<'a>>
    where
        's: 'a,
    {
        self.assert_arena(arena);
        let extension = self.extension_layout(id).ok()?;
        let place = self.extension_place(arena, extension)?;
        (!place.field.is_repeated()).then(|| place.read(arena))
    }

    pub fn set_extension(
        &self,
        arena: &mut Arena,
        id: ExtensionId,
        value: Value<'_>,
    ) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        let extension = self.extension_layout(id)?;
        if extension.field().is_repeated() {
            return Err(ReflectError::NotSingular {
                field: extension.number(),
            });
        }
        if value == Value::Message(None) {
            return self.clear_extension(arena, id).map(|_| ());
        }
        // Check before the slot exists so a rejected value doesn't leave an
        // empty extension behind.
        Place::extension(self.ptr, extension, self.layout.set()).check_value(arena, &value)?;
        self.extension_place_mut(arena, id)?.write(arena, &value)
    }

    /// Remove extension `id`, returning whether it was set.
    pub fn clear_extension(&self, arena: &mut Arena, id: ExtensionId) -> Result<bool, ReflectError> {
        self.check_arena(arena)?;
        let number = self.extension_layout(id)?.number();
        let removed = match self.extension_set_index(arena) {
            Some(index) => arena.extension_sets[index].remove(number),
            None => false,
        };
        Ok(removed)
    }

    /// The message value of a singular message extension, created if unset.
    pub fn mutable_extension_message(
        &self,
        arena: &mut Arena,
        id: ExtensionId,
    ) -> Result<Message<'s>, ReflectError> {
        let extension = self.extension_layout(id)?;
        let field = extension.field();
        if !field.is_sub_message() {
            return Err(ReflectError::NotMessage {
                field: field.number,
            });
        }
        if field.is_repeated() {
            return Err(ReflectError::NotSingular {
                field: field.number,
            });
        }
        let place = self.extension_place_mut(arena, id)?;
        place.mutable_message(arena)
    }

    /// Number of elements of a repeated extension.
    pub fn extension_len(&self, arena: &Arena, id: ExtensionId) -> usize {
        self.assert_arena(arena);
        self.extension_layout(id)
            .ok()
            .filter(|extension| extension.field().is_repeated())
            .and_then(|extension| self.extension_place(arena, extension))
            .map_or(0, |place| place.array_len(arena))
    }

    /// Element `index` of a repeated extension.
    pub fn extension_get_at<'a>(
        &self,
        arena: &'a Arena,
        id: ExtensionId,
        index: usize,
    ) -> Option<Value<'a>>
    where
        's: 'a,
    {
        self.assert_arena(arena);
        let extension = self.extension_layout(id).ok()?;
        if !extension.field().is_repeated() {
            return None;
        }
        self.extension_place(arena, extension)?.array_get(arena, index)
    }

    /// Append to a repeated extension.
    pub fn append_extension(
        &self,
        arena: &mut Arena,
        id: ExtensionId,
        value: Value<'_>,
    ) -> Result<(), ReflectError> {
        let extension = self.extension_layout(id)?;
        if !extension.field().is_repeated() {
            return Err(ReflectError::NotRepeated {
                field: extension.number(),
            });
        }
        let place = self.extension_place_mut(arena, id)?;
        if extension.field().is_sub_message() {
            if let Value::Message(None) = value {
                return place.array_push_message(arena).map(|_| ());
            }
        }
        place.array_push(arena, &value)
    }

    /// Ids of the extensions set on this message, ascending by number.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn extensions<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = ExtensionId> + use<'a, 's> {
        self.assert_arena(arena);
        self.extension_entries(arena).iter().map(|entry| entry.id)
    }

    // Unknown fields and flags.

    /// Raw wire bytes of every field the layout didn't recognise, in the
    /// order they were read.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn unknown_fields<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        self.assert_arena(arena);
        let len = usize::cast_from(arena.read_u32(self.ptr.add(UNKNOWN_LEN)));
        match ArenaPtr::from_raw(arena.read_u64(self.ptr.add(UNKNOWN_DATA))) {
            Some(data) if len > 0 => arena.bytes(data, len),
            _ => &[],
        }
    }

    pub(crate) fn append_unknown(&self, arena: &mut Arena, bytes: &[u8]) -> Result<(), ArenaError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let data = ArenaPtr::from_raw(arena.read_u64(self.ptr.add(UNKNOWN_DATA)));
        let len = usize::cast_from(arena.read_u32(self.ptr.add(UNKNOWN_LEN)));
        let capacity = usize::cast_from(arena.read_u32(self.ptr.add(UNKNOWN_CAPACITY)));
        let needed = len + bytes.len();
        let oom = ArenaError::OutOfMemory { requested: needed };

        let data = if needed > capacity {
            let new_capacity = needed.max(capacity * 2).max(MIN_UNKNOWN_CAPACITY);
            let raw_capacity = u32::try_from(new_capacity).map_err(|_| oom)?;
            let grown = arena.grow(data, len, capacity, new_capacity, 1)?;
            arena.write_u64(self.ptr.add(UNKNOWN_DATA), ArenaPtr::to_raw(Some(grown)));
            arena.write_u32(self.ptr.add(UNKNOWN_CAPACITY), raw_capacity);
            grown
        } else {
            data.ok_or(oom)?
        };
        arena
            .bytes_mut(data.add(len), bytes.len())
            .copy_from_slice(bytes);
        let raw_len = u32::try_from(needed).map_err(|_| oom)?;
        arena.write_u32(self.ptr.add(UNKNOWN_LEN), raw_len);
        Ok(())
    }

    /// Forget the unknown fields, the buffer is kept for reuse.
    pub fn clear_unknown_fields(&self, arena: &mut Arena) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        arena.write_u32(self.ptr.add(UNKNOWN_LEN), 0);
        Ok(())
    }

    /// Whether decoding stored invalid UTF-8 into a validated string field
    /// of this message.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn has_invalid_utf8(&self, arena: &Arena) -> bool {
        self.assert_arena(arena);
        arena.read_u32(self.ptr.add(FLAGS)) & FLAG_BAD_UTF8 != 0
    }

    pub(crate) fn flag_invalid_utf8(&self, arena: &mut Arena) {
        let flags = arena.read_u32(self.ptr.add(FLAGS));
        arena.write_u32(self.ptr.add(FLAGS), flags | FLAG_BAD_UTF8);
    }
}

impl PartialEq for Message<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.arena == other.arena && self.ptr == other.ptr && self.layout.same_as(&other.layout)
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("layout", &self.layout.id())
            .field("ptr", &self.ptr)
            .finish()
    }
}

/// Where one field value lives: a message slot or an extension slot.
#[derive(Clone, Copy)]
pub(crate) struct Place<'s> {
    pub(crate) slot: ArenaPtr,
    pub(crate) field: FieldEntry,
    pub(crate) sub: SubLayout,
    pub(crate) set: &'s LayoutSet,
}

impl<'s> Place<'s> {
    pub(crate) fn extension(slot: ArenaPtr, extension: &ExtensionLayout, set: &'s LayoutSet) -> Self {
        Place {
            slot,
            field: *extension.field(),
            sub: extension.sub(),
            set,
        }
    }

    pub(crate) fn sub_layout(&self) -> Option<LayoutRef<'s>> {
        match self.sub {
            SubLayout::Message(id) => Some(self.set.message(id)),
            SubLayout::Enum(_) | SubLayout::Unlinked => None,
        }
    }

    fn unlinked(&self) -> ReflectError {
        ReflectError::Unlinked {
            field: self.field.number,
        }
    }

    /// Type and identity checks for a value about to be stored here.
    fn check_value(&self, arena: &Arena, value: &Value<'_>) -> Result<(), ReflectError> {
        if value.ctype() != self.field.ctype() {
            return Err(ReflectError::TypeMismatch {
                field: self.field.number,
                expected: self.field.ctype(),
            });
        }
        if let Value::Message(Some(message)) = value {
            let sub = self.sub_layout().ok_or_else(|| self.unlinked())?;
            if !message.belongs_to(arena) || !message.layout.same_as(&sub) {
                return Err(ReflectError::ForeignValue);
            }
        }
        Ok(())
    }

    fn read<'a>(&self, arena: &'a Arena) -> Value<'a>
    where
        's: 'a,
    {
        value::read(arena, self.slot, self.field.descriptor_type, self.set, self.sub)
    }

    fn write(&self, arena: &mut Arena, value: &Value<'_>) -> Result<(), ReflectError> {
        self.check_value(arena, value)?;
        value::write(arena, self.slot, value)?;
        Ok(())
    }

    /// The message stored in a singular message slot, created if empty.
    pub(crate) fn mutable_message(&self, arena: &mut Arena) -> Result<Message<'s>, ReflectError> {
        let sub = self.sub_layout().ok_or_else(|| self.unlinked())?;
        if let Some(ptr) = ArenaPtr::from_raw(arena.read_u64(self.slot)) {
            return Ok(Message::from_parts(sub, ptr, arena.id()));
        }
        let child = Message::new(sub, arena)?;
        arena.write_u64(self.slot, ArenaPtr::to_raw(Some(child.ptr)));
        Ok(child)
    }

    pub(crate) fn array(&self, arena: &Arena) -> Option<RawArray> {
        RawArray::get(arena, self.slot, self.field.element_size())
    }

    pub(crate) fn array_mut(&self, arena: &mut Arena) -> Result<RawArray, ArenaError> {
        RawArray::get_or_create(arena, self.slot, self.field.element_size())
    }

    fn array_len(&self, arena: &Arena) -> usize {
        self.array(arena).map_or(0, |array| array.len(arena))
    }

    fn array_get<'a>(&self, arena: &'a Arena, index: usize) -> Option<Value<'a>>
    where
        's: 'a,
    {
        let array = self.array(arena)?;
        if index >= array.len(arena) {
            return None;
        }
        let element = array.element(arena, index);
        Some(value::read(
            arena,
            element,
            self.field.descriptor_type,
            self.set,
            self.sub,
        ))
    }

    fn array_set(&self, arena: &mut Arena, index: usize, value: &Value<'_>) -> Result<(), ReflectError> {
        self.check_value(arena, value)?;
        let len = self.array_len(arena);
        let array = match self.array(arena) {
            Some(array) if index < len => array,
            _ => return Err(ReflectError::IndexOutOfBounds { index, len }),
        };
        if *value == Value::Message(None) {
            return Err(ReflectError::TypeMismatch {
                field: self.field.number,
                expected: self.field.ctype(),
            });
        }
        let element = array.element(arena, index);
        value::write(arena, element, value)?;
        Ok(())
    }

    fn array_push(&self, arena: &mut Arena, value: &Value<'_>) -> Result<(), ReflectError> {
        self.check_value(arena, value)?;
        if *value == Value::Message(None) {
            return self.array_push_message(arena).map(|_| ());
        }
        let array = self.array_mut(arena)?;
        let element = array.push(arena)?;
        value::write(arena, element, value)?;
        Ok(())
    }

    pub(crate) fn array_push_message(&self, arena: &mut Arena) -> Result<Message<'s>, ReflectError> {
        if !self.field.is_sub_message() {
            return Err(ReflectError::NotMessage {
                field: self.field.number,
            });
        }
        let sub = self.sub_layout().ok_or_else(|| self.unlinked())?;
        let child = Message::new(sub, arena)?;
        let array = self.array_mut(arena)?;
        let element = array.push(arena)?;
        arena.write_u64(element, ArenaPtr::to_raw(Some(child.ptr)));
        Ok(child)
    }

    fn array_resize(&self, arena: &mut Arena, len: usize) -> Result<(), ReflectError> {
        let array = self.array_mut(arena)?;
        let old = array.len(arena);
        if self.field.is_sub_message() && len > old {
            let sub = self.sub_layout().ok_or_else(|| self.unlinked())?;
            array.reserve(arena, len - old)?;
            for _ in old..len {
                let child = Message::new(sub, arena)?;
                let element = array.push(arena)?;
                arena.write_u64(element, ArenaPtr::to_raw(Some(child.ptr)));
            }
            return Ok(());
        }
        array.set_len(arena, len)?;
        Ok(())
    }
}
