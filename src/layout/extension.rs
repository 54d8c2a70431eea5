use std::collections::HashMap;

use super::builder::{FieldSpec, Label};
use super::{
    ExtensionId, FieldEntry, FieldFlags, FieldMode, FieldType, LayoutId, LayoutSet, NO_SUB, Rep,
    SubLayout,
};
use crate::error::LayoutError;
use crate::wire::{MAXIMUM_FIELD_NUMBER, MINIMUM_FIELD_NUMBER};

/// A field declared outside of the message it extends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionLayout {
    pub(crate) field: FieldEntry,
    pub(crate) extendee: LayoutId,
    pub(crate) sub: SubLayout,
}

impl ExtensionLayout {
    pub fn from_spec(
        spec: &FieldSpec,
        extendee: LayoutId,
        sub: SubLayout,
    ) -> Result<Self, LayoutError> {
        let invalid = |reason| LayoutError::InvalidField {
            number: spec.number,
            reason,
        };
        if spec.number < MINIMUM_FIELD_NUMBER || spec.number > MAXIMUM_FIELD_NUMBER {
            return Err(invalid("field number out of range"));
        }
        if spec.oneof.is_some() || spec.map {
            return Err(invalid("extensions cannot be maps or oneof members"));
        }
        if spec.label == Label::Required || spec.implicit_presence {
            return Err(invalid("extensions cannot be required or singular"));
        }
        let needs_sub = spec.field_type.is_message()
            || (spec.field_type == FieldType::Enum && spec.closed_enum);
        match sub {
            SubLayout::Message(_) if !spec.field_type.is_message() => {
                return Err(invalid("message sub-layout on a non-message extension"));
            }
            SubLayout::Enum(_) if !needs_sub || spec.field_type.is_message() => {
                return Err(invalid("enum sub-layout on a non-enum extension"));
            }
            _ => {}
        }

        let repeated = spec.label == Label::Repeated;
        let mut flags = FieldFlags::EXTENSION;
        if spec.packed && repeated && spec.field_type.is_packable() {
            flags.insert(FieldFlags::PACKED);
        }
        let alternate = match spec.field_type {
            FieldType::Enum => !spec.closed_enum,
            FieldType::String => !spec.validate_utf8,
            _ => false,
        };
        if alternate {
            flags.insert(FieldFlags::ALTERNATE);
        }

        let (mode, rep) = if repeated {
            (FieldMode::Array, Rep::EightByte)
        } else {
            (FieldMode::Scalar, spec.field_type.rep())
        };
        Ok(ExtensionLayout {
            field: FieldEntry {
                number: spec.number,
                offset: 0,
                presence: 0,
                sub_index: if needs_sub { 0 } else { NO_SUB },
                descriptor_type: spec.field_type,
                mode,
                flags,
                rep,
            },
            extendee,
            sub,
        })
    }

    pub fn number(&self) -> u32 {
        self.field.number
    }

    pub fn field(&self) -> &FieldEntry {
        &self.field
    }

    pub fn extendee(&self) -> LayoutId {
        self.extendee
    }

    pub fn sub(&self) -> SubLayout {
        self.sub
    }

    /// Sub table of the extension field, at most one entry.
    pub(crate) fn subs(&self) -> &[SubLayout] {
        std::slice::from_ref(&self.sub)
    }
}

/// Index of known extensions by `(extendee, field number)`.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    by_number: HashMap<(LayoutId, u32), ExtensionId>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of every extension in `set`.
    pub fn from_set(set: &LayoutSet) -> Result<Self, LayoutError> {
        let mut registry = ExtensionRegistry::new();
        for (id, _) in set.extensions() {
            registry.add(set, id)?;
        }
        Ok(registry)
    }

    pub fn add(&mut self, set: &LayoutSet, id: ExtensionId) -> Result<(), LayoutError> {
        let extension = set.extension(id);
        let key = (extension.extendee, extension.number());
        match self.by_number.insert(key, id) {
            Some(previous) if previous != id => {
                self.by_number.insert(key, previous);
                Err(LayoutError::Link(format!(
                    "extension number {} already registered for {:?}",
                    extension.number(),
                    extension.extendee
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn find(&self, extendee: LayoutId, number: u32) -> Option<ExtensionId> {
        self.by_number.get(&(extendee, number)).copied()
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}
