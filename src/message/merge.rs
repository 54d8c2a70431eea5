//! Merging one message into another and the deep required-field check.

use super::extension::ExtensionEntry;
use super::{Message, Place, map};
use crate::arena::{Arena, ArenaPtr};
use crate::error::ReflectError;
use crate::layout::FieldMode;

impl<'s> Message<'s> {
    /// Merge `other` into this message, the way decoding its encoding on top
    /// of this message would.
    ///
    /// Set scalars overwrite, repeated fields append, present sub-messages
    /// merge recursively and map entries replace entries with the same key.
    /// Unknown fields and extensions are carried over.
    pub fn merge_from(&self, arena: &mut Arena, other: Message<'s>) -> Result<(), ReflectError> {
        self.check_arena(arena)?;
        other.check_arena(arena)?;
        if !self.layout.same_as(&other.layout) {
            return Err(ReflectError::ForeignValue);
        }
        fuse(arena, *self, other)
    }

    /// Path of field numbers down to the first required field that isn't
    /// set, searching this message and every sub-message.
    ///
    /// # Panics
    ///
    /// If the message doesn't live in `arena`.
    pub fn missing_required(&self, arena: &Arena) -> Option<Vec<u32>> {
        self.assert_arena(arena);
        let mut path = Vec::new();
        find_missing(arena, *self, &mut path).then_some(path)
    }
}

fn fuse<'s>(arena: &mut Arena, dst: Message<'s>, src: Message<'s>) -> Result<(), ReflectError> {
    let id = arena.id();
    for field in dst.layout.layout().fields() {
        if !src.has_unchecked(arena, field) {
            continue;
        }
        if field.mode == FieldMode::Scalar {
            dst.mark_present(arena, field);
        }
        fuse_place(arena, dst.place(field), src.place(field), id)?;
    }

    let set = dst.layout.set();
    let entries: Vec<ExtensionEntry> = src.extension_entries(arena).to_vec();
    for entry in entries {
        let extension = set.extension(entry.id);
        let (slot, _) = dst.extension_slot_mut(arena, entry.id)?;
        fuse_place(
            arena,
            Place::extension(slot, extension, set),
            Place::extension(entry.slot, extension, set),
            id,
        )?;
    }

    let unknown = src.unknown_fields(arena).to_vec();
    dst.append_unknown(arena, &unknown)?;
    if src.has_invalid_utf8(arena) {
        dst.flag_invalid_utf8(arena);
    }
    Ok(())
}

/// Merge the value at `src` into `dst`, both describing the same field.
fn fuse_place<'s>(
    arena: &mut Arena,
    dst: Place<'s>,
    src: Place<'s>,
    id: u32,
) -> Result<(), ReflectError> {
    let field = src.field;
    match field.mode {
        FieldMode::Scalar if field.is_sub_message() => {
            let source = ArenaPtr::from_raw(arena.read_u64(src.slot));
            if let (Some(ptr), Some(sub)) = (source, src.sub_layout()) {
                let child = dst.mutable_message(arena)?;
                fuse(arena, child, Message::from_parts(sub, ptr, id))?;
            }
        }
        FieldMode::Scalar => arena.copy_within(src.slot, dst.slot, field.rep.size()),
        FieldMode::Array => {
            let Some(source) = src.array(arena) else {
                return Ok(());
            };
            let len = source.len(arena);
            let target = dst.array_mut(arena)?;
            target.reserve(arena, len)?;
            for index in 0..len {
                let from = source.element(arena, index);
                match (field.is_sub_message(), src.sub_layout()) {
                    (true, Some(sub)) => {
                        let Some(ptr) = ArenaPtr::from_raw(arena.read_u64(from)) else {
                            continue;
                        };
                        let child = Message::new(sub, arena)?;
                        let to = target.push(arena)?;
                        arena.write_u64(to, ArenaPtr::to_raw(Some(child.ptr)));
                        fuse(arena, child, Message::from_parts(sub, ptr, id))?;
                    }
                    (true, None) => {}
                    (false, _) => {
                        let to = target.push(arena)?;
                        arena.copy_within(from, to, field.element_size());
                    }
                }
            }
        }
        FieldMode::Map => {
            let (Some(storage), Some(layout)) = (map::storage(arena, src.slot), src.sub_layout())
            else {
                return Ok(());
            };
            let Some(value_field) = layout.layout().fields().get(1) else {
                return Ok(());
            };
            let entries: Vec<_> = storage
                .entries
                .iter()
                .map(|(key, ptr)| (key.clone(), *ptr))
                .collect();
            let index = map::storage_index(arena, dst.slot)?;
            for (key, ptr) in entries {
                // Entries are replaced, never merged, so copy the source
                // entry and give it its own value message.
                let source = Message::from_parts(layout, ptr, id);
                let entry = Message::new(layout, arena)?;
                arena.copy_within(source.data(), entry.data(), usize::from(layout.size()));
                if let (Some(value), Some(sub)) = (
                    source.present_message(arena, value_field),
                    layout.sub_message(value_field),
                ) {
                    let copy = Message::new(sub, arena)?;
                    arena.write_u64(entry.slot(value_field), ArenaPtr::to_raw(Some(copy.ptr)));
                    fuse(arena, copy, Message::from_parts(sub, value, id))?;
                }
                arena.maps[index].entries.insert(key, entry.ptr);
            }
        }
    }
    Ok(())
}

/// Depth-first search for an unset required field, `path` ends up holding
/// the field numbers leading to it.
fn find_missing(arena: &Arena, message: Message<'_>, path: &mut Vec<u32>) -> bool {
    let layout = message.layout.layout();
    let required = u16::from(layout.required_count());
    for field in layout.fields() {
        if let Some(bit) = field.hasbit().filter(|bit| *bit <= required) {
            if !message.has_hasbit(arena, bit) {
                path.push(field.number);
                return true;
            }
        }
    }

    let id = arena.id();
    for field in layout.fields().iter().filter(|field| field.is_sub_message()) {
        path.push(field.number);
        let found = match field.mode {
            FieldMode::Scalar => message
                .present_message(arena, field)
                .zip(message.layout.sub_message(field))
                .is_some_and(|(ptr, sub)| {
                    find_missing(arena, Message::from_parts(sub, ptr, id), path)
                }),
            FieldMode::Array | FieldMode::Map => {
                children_missing(arena, message.place(field), path)
            }
        };
        if found {
            return true;
        }
        path.pop();
    }

    let set = message.layout.set();
    for entry in message.extension_entries(arena) {
        let extension = set.extension(entry.id);
        if !extension.field().is_sub_message() {
            continue;
        }
        path.push(entry.number);
        if children_missing(arena, Place::extension(entry.slot, extension, set), path) {
            return true;
        }
        path.pop();
    }
    false
}

/// [`find_missing`] over every message stored in a message-typed place.
fn children_missing(arena: &Arena, place: Place<'_>, path: &mut Vec<u32>) -> bool {
    let id = arena.id();
    let Some(sub) = place.sub_layout() else {
        return false;
    };
    let check = |ptr: Option<ArenaPtr>, path: &mut Vec<u32>| {
        ptr.is_some_and(|ptr| find_missing(arena, Message::from_parts(sub, ptr, id), path))
    };
    match place.field.mode {
        // Only extension slots get here, they are never oneof members.
        FieldMode::Scalar => check(ArenaPtr::from_raw(arena.read_u64(place.slot)), path),
        FieldMode::Array => place.array(arena).is_some_and(|array| {
            (0..array.len(arena))
                .any(|index| check(ArenaPtr::from_raw(arena.read_u64(array.element(arena, index))), path))
        }),
        FieldMode::Map => {
            let (Some(storage), Some(value_field)) =
                (map::storage(arena, place.slot), sub.layout().fields().get(1))
            else {
                return false;
            };
            let Some(value_layout) = sub.sub_message(value_field) else {
                return false;
            };
            storage.entries.values().any(|ptr| {
                Message::from_parts(sub, *ptr, id)
                    .present_message(arena, value_field)
                    .is_some_and(|value| {
                        find_missing(arena, Message::from_parts(value_layout, value, id), path)
                    })
            })
        }
    }
}
