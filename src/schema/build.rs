//! Turns parsed descriptor files into staged definitions and layouts.
//!
//! Staging works on copies: a cloned [`LayoutSet`] and registry plus fresh
//! tables for the new definitions. Nothing touches the context until the
//! result is committed.

use std::ops::Range;

use indexmap::IndexMap;

use super::default::DefaultValue;
use super::descriptor::{EnumProto, FieldProto, FileProto, MessageProto};
use super::{
    EnumData, EnumValueData, ExtensionData, FieldData, FieldSub, FileData, MessageData, OneofData,
    SchemaContext, SymbolKind, Syntax, resolve_with,
};
use crate::error::SchemaError;
use crate::layout::{
    EnumId, EnumLayout, ExtensionLayout, ExtensionRegistry, FieldSpec, FieldType, Label, LayoutId,
    LayoutSet, MessageKind, MessageSpec, SubLayout,
};
use crate::wire::{MAXIMUM_FIELD_NUMBER, MINIMUM_FIELD_NUMBER};

/// Field numbers reserved for the protobuf implementation itself.
const RESERVED_NUMBERS: Range<u32> = 19000..20000;

/// Everything one call to `add_descriptors` adds, ready to commit.
#[derive(Debug)]
pub(crate) struct Staged {
    pub(crate) layouts: LayoutSet,
    pub(crate) registry: ExtensionRegistry,
    pub(crate) files: Vec<FileData>,
    pub(crate) messages: Vec<MessageData>,
    pub(crate) enums: Vec<EnumData>,
    pub(crate) extensions: Vec<ExtensionData>,
    pub(crate) symbols: IndexMap<String, SymbolKind>,
}

/// Validate, resolve and compile `files` against `context`.
pub(crate) fn stage(context: &SchemaContext, files: Vec<FileProto>) -> Result<Staged, SchemaError> {
    let mut files_to_add = Vec::with_capacity(files.len());
    for file in files {
        let existing = context
            .files
            .iter()
            .map(|data| (data.name.as_str(), data.encoded.as_slice()))
            .chain(
                files_to_add
                    .iter()
                    .map(|proto: &FileProto| (proto.name.as_str(), proto.encoded.as_slice())),
            )
            .find(|(name, _)| *name == file.name);
        match existing {
            Some((_, encoded)) if encoded == file.encoded.as_slice() => {
                tracing::warn!(file = %file.name, "file already added, skipping");
            }
            Some(_) => return Err(SchemaError::DuplicateFile { name: file.name }),
            None => files_to_add.push(file),
        }
    }

    let mut stage = Stage {
        context,
        layouts: context.layouts.clone(),
        registry: context.registry.clone(),
        files: Vec::new(),
        messages: Vec::new(),
        pending: Vec::new(),
        enums: Vec::new(),
        extensions: Vec::new(),
        pending_extensions: Vec::new(),
        symbols: IndexMap::new(),
    };
    for file in &files_to_add {
        stage.collect_file(file)?;
    }
    stage.check_dependencies()?;
    for local in 0..stage.pending.len() {
        stage.compile_message(local)?;
    }
    stage.build_layouts()?;
    stage.add_extensions()?;

    let Stage {
        layouts,
        registry,
        files,
        messages,
        enums,
        extensions,
        symbols,
        ..
    } = stage;
    Ok(Staged {
        layouts,
        registry,
        files,
        messages,
        enums,
        extensions,
        symbols,
    })
}

/// A collected message whose fields are not resolved yet.
struct Pending<'p> {
    proto: &'p MessageProto,
    syntax: Syntax,
}

struct PendingExtension<'p> {
    proto: &'p FieldProto,
    full_name: String,
    /// Scope references in the extension are resolved from.
    scope: String,
    message: Option<usize>,
    file: usize,
    syntax: Syntax,
}

struct Stage<'c, 'p> {
    context: &'c SchemaContext,
    layouts: LayoutSet,
    registry: ExtensionRegistry,
    files: Vec<FileData>,
    /// Parallel to `pending`.
    messages: Vec<MessageData>,
    pending: Vec<Pending<'p>>,
    enums: Vec<EnumData>,
    extensions: Vec<ExtensionData>,
    pending_extensions: Vec<PendingExtension<'p>>,
    symbols: IndexMap<String, SymbolKind>,
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

/// `foo_bar_baz` to `fooBarBaz`.
fn json_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for ch in name.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn syntax_of(file: &FileProto) -> Result<Syntax, SchemaError> {
    if file.edition.is_some() {
        return Err(SchemaError::invalid(&file.name, "editions are not supported"));
    }
    match file.syntax.as_deref() {
        None | Some("") | Some("proto2") => Ok(Syntax::Proto2),
        Some("proto3") => Ok(Syntax::Proto3),
        Some("editions") => Err(SchemaError::invalid(&file.name, "editions are not supported")),
        Some(other) => Err(SchemaError::invalid(
            &file.name,
            format!("unknown syntax '{other}'"),
        )),
    }
}

impl<'c, 'p> Stage<'c, 'p> {
    fn next_message(&self) -> usize {
        self.context.messages.len() + self.messages.len()
    }

    fn next_enum(&self) -> usize {
        self.context.enums.len() + self.enums.len()
    }

    fn message(&self, index: usize) -> &MessageData {
        match index.checked_sub(self.context.messages.len()) {
            Some(local) => &self.messages[local],
            None => &self.context.messages[index],
        }
    }

    fn enum_data(&self, index: usize) -> &EnumData {
        match index.checked_sub(self.context.enums.len()) {
            Some(local) => &self.enums[local],
            None => &self.context.enums[index],
        }
    }

    fn find(&self, full_name: &str) -> Option<SymbolKind> {
        self.symbols
            .get(full_name)
            .or_else(|| self.context.symbols.get(full_name))
            .copied()
    }

    fn define(&mut self, full_name: String, kind: SymbolKind) -> Result<(), SchemaError> {
        if self.find(&full_name).is_some() {
            return Err(SchemaError::DuplicateSymbol { symbol: full_name });
        }
        self.symbols.insert(full_name, kind);
        Ok(())
    }

    /// Define `package` and each of its enclosing packages. Packages may be
    /// shared between files.
    fn define_package(&mut self, package: &str) -> Result<(), SchemaError> {
        let mut end = 0;
        for part in package.split('.') {
            if part.is_empty() {
                return Err(SchemaError::invalid(package, "invalid package name"));
            }
            end += part.len();
            let prefix = &package[..end];
            match self.find(prefix) {
                Some(SymbolKind::Package) => {}
                Some(_) => {
                    return Err(SchemaError::DuplicateSymbol {
                        symbol: prefix.to_string(),
                    });
                }
                None => {
                    self.symbols.insert(prefix.to_string(), SymbolKind::Package);
                }
            }
            end += 1;
        }
        Ok(())
    }

    fn collect_file(&mut self, proto: &'p FileProto) -> Result<(), SchemaError> {
        let syntax = syntax_of(proto)?;
        let file = self.context.files.len() + self.files.len();
        if !proto.package.is_empty() {
            self.define_package(&proto.package)?;
        }

        let package = proto.package.as_str();
        let messages = proto
            .messages
            .iter()
            .map(|message| self.collect_message(message, package, file, None, syntax))
            .collect::<Result<Vec<_>, _>>()?;
        let enums = proto
            .enums
            .iter()
            .map(|value| self.collect_enum(value, package, file, None, syntax))
            .collect::<Result<Vec<_>, _>>()?;
        let extensions = proto
            .extensions
            .iter()
            .map(|extension| self.collect_extension(extension, package, None, file, syntax))
            .collect::<Result<Vec<_>, _>>()?;

        self.files.push(FileData {
            name: proto.name.clone(),
            package: proto.package.clone(),
            syntax,
            dependencies: proto.dependencies.clone(),
            encoded: proto.encoded.clone(),
            messages,
            enums,
            extensions,
        });
        Ok(())
    }

    fn collect_message(
        &mut self,
        proto: &'p MessageProto,
        scope: &str,
        file: usize,
        parent: Option<usize>,
        syntax: Syntax,
    ) -> Result<usize, SchemaError> {
        let full_name = qualify(scope, &proto.name);
        if proto.name.is_empty() {
            return Err(SchemaError::invalid(&full_name, "message has no name"));
        }
        let index = self.next_message();
        self.define(full_name.clone(), SymbolKind::Message(index))?;
        for (position, field) in proto.fields.iter().enumerate() {
            self.define(
                qualify(&full_name, &field.name),
                SymbolKind::Field(index, position),
            )?;
        }
        for (position, oneof) in proto.oneofs.iter().enumerate() {
            self.define(qualify(&full_name, oneof), SymbolKind::Oneof(index, position))?;
        }

        let extension_ranges = proto
            .extension_ranges
            .iter()
            .map(|(start, end)| {
                let start = u32::try_from(*start).ok().filter(|start| *start >= 1);
                let end = u32::try_from(*end).ok();
                match (start, end) {
                    (Some(start), Some(end)) if start < end => Ok(start..end),
                    _ => Err(SchemaError::invalid(&full_name, "invalid extension range")),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.messages.push(MessageData {
            name: proto.name.clone(),
            full_name: full_name.clone(),
            file,
            parent,
            layout: LayoutId::from_index(index),
            spec: MessageSpec::default(),
            fields: Vec::new(),
            oneofs: Vec::new(),
            nested: Vec::new(),
            enums: Vec::new(),
            extensions: Vec::new(),
            extension_ranges,
            map_entry: proto.map_entry,
            message_set: proto.message_set_wire_format,
        });
        self.pending.push(Pending { proto, syntax });

        let nested = proto
            .nested
            .iter()
            .map(|message| self.collect_message(message, &full_name, file, Some(index), syntax))
            .collect::<Result<Vec<_>, _>>()?;
        let enums = proto
            .enums
            .iter()
            .map(|value| self.collect_enum(value, &full_name, file, Some(index), syntax))
            .collect::<Result<Vec<_>, _>>()?;
        let extensions = proto
            .extensions
            .iter()
            .map(|extension| {
                self.collect_extension(extension, &full_name, Some(index), file, syntax)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let local = index - self.context.messages.len();
        let data = &mut self.messages[local];
        data.nested = nested;
        data.enums = enums;
        data.extensions = extensions;
        Ok(index)
    }

    /// Enum values are scoped as siblings of their enum.
    fn collect_enum(
        &mut self,
        proto: &EnumProto,
        scope: &str,
        file: usize,
        parent: Option<usize>,
        syntax: Syntax,
    ) -> Result<usize, SchemaError> {
        let full_name = qualify(scope, &proto.name);
        match proto.values.first() {
            None => return Err(SchemaError::invalid(&full_name, "enum has no values")),
            Some((_, first)) if syntax == Syntax::Proto3 && *first != 0 => {
                return Err(SchemaError::invalid(
                    &full_name,
                    "first value of a proto3 enum must be zero",
                ));
            }
            Some(_) => {}
        }

        let index = self.next_enum();
        self.define(full_name.clone(), SymbolKind::Enum(index))?;
        let mut values = Vec::with_capacity(proto.values.len());
        for (position, (name, number)) in proto.values.iter().enumerate() {
            let value_name = qualify(scope, name);
            self.define(value_name.clone(), SymbolKind::EnumValue(index, position))?;
            values.push(EnumValueData {
                name: name.clone(),
                full_name: value_name,
                number: *number,
            });
        }

        let layout = self
            .layouts
            .add_enum(EnumLayout::from_values(values.iter().map(|value| value.number)));
        self.enums.push(EnumData {
            name: proto.name.clone(),
            full_name,
            file,
            parent,
            values,
            closed: syntax == Syntax::Proto2,
            layout,
        });
        Ok(index)
    }

    fn collect_extension(
        &mut self,
        proto: &'p FieldProto,
        scope: &str,
        message: Option<usize>,
        file: usize,
        syntax: Syntax,
    ) -> Result<usize, SchemaError> {
        let full_name = qualify(scope, &proto.name);
        let index = self.context.extensions.len() + self.pending_extensions.len();
        self.define(full_name.clone(), SymbolKind::Extension(index))?;
        self.pending_extensions.push(PendingExtension {
            proto,
            full_name,
            scope: scope.to_string(),
            message,
            file,
            syntax,
        });
        Ok(index)
    }

    fn check_dependencies(&self) -> Result<(), SchemaError> {
        let known = |name: &str| {
            self.context.files.iter().any(|file| file.name == name)
                || self.files.iter().any(|file| file.name == name)
        };
        for file in &self.files {
            if let Some(missing) = file.dependencies.iter().find(|name| !known(name)) {
                return Err(SchemaError::UnresolvedReference {
                    symbol: file.name.clone(),
                    name: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolve a type reference written inside `scope`, only messages and
    /// enums are considered.
    fn resolve_type(&self, scope: &str, name: &str, symbol: &str) -> Result<SymbolKind, SchemaError> {
        resolve_with(scope, name, |candidate| self.find(candidate), SymbolKind::is_type)
            .map(|(_, kind)| kind)
            .ok_or_else(|| SchemaError::UnresolvedReference {
                symbol: symbol.to_string(),
                name: name.to_string(),
            })
    }

    /// Resolve and check one field, returning its definition and the
    /// description the layout builder needs.
    fn compile_field(
        &self,
        proto: &FieldProto,
        full_name: String,
        scope: &str,
        syntax: Syntax,
        extension: bool,
    ) -> Result<(FieldData, FieldSpec), SchemaError> {
        let invalid = |reason: &str| SchemaError::invalid(&full_name, reason);

        let number = proto
            .number
            .ok_or_else(|| invalid("missing field number"))
            .and_then(|number| u32::try_from(number).map_err(|_| invalid("field number out of range")))?;
        if !(MINIMUM_FIELD_NUMBER..=MAXIMUM_FIELD_NUMBER).contains(&number) {
            return Err(invalid("field number out of range"));
        }
        if RESERVED_NUMBERS.contains(&number) {
            return Err(invalid("field numbers 19000 through 19999 are reserved"));
        }

        let label = match proto.label {
            None | Some(1) => Label::Optional,
            Some(2) => Label::Required,
            Some(3) => Label::Repeated,
            Some(_) => return Err(invalid("unknown label")),
        };
        let declared = match proto.field_type {
            Some(raw) => Some(FieldType::from_i32(raw).ok_or_else(|| invalid("unknown field type"))?),
            None => None,
        };

        let needs_name = declared.is_none_or(|ty| ty.is_message() || ty == FieldType::Enum);
        let (field_type, sub) = match (&proto.type_name, needs_name) {
            (Some(type_name), true) => {
                let kind = self.resolve_type(scope, type_name, &full_name)?;
                match (kind, declared) {
                    (SymbolKind::Message(index), None) => (FieldType::Message, FieldSub::Message(index)),
                    (SymbolKind::Message(index), Some(ty)) if ty.is_message() => {
                        (ty, FieldSub::Message(index))
                    }
                    (SymbolKind::Enum(index), None | Some(FieldType::Enum)) => {
                        (FieldType::Enum, FieldSub::Enum(index))
                    }
                    _ => {
                        return Err(invalid("type_name does not match the field type"));
                    }
                }
            }
            (None, true) => return Err(invalid("missing type_name")),
            (_, false) => match declared {
                Some(ty) => (ty, FieldSub::None),
                None => return Err(invalid("missing field type")),
            },
        };

        if syntax == Syntax::Proto3 {
            if label == Label::Required {
                return Err(invalid("required fields are not allowed in proto3"));
            }
            if proto.default_value.is_some() {
                return Err(invalid("explicit default values are not allowed in proto3"));
            }
            if field_type == FieldType::Group {
                return Err(invalid("groups are not allowed in proto3"));
            }
        }
        if extension && label == Label::Required {
            return Err(invalid("extensions cannot be required"));
        }
        if extension && proto.oneof_index.is_some() {
            return Err(invalid("extensions cannot belong to a oneof"));
        }
        if proto.proto3_optional && proto.oneof_index.is_none() {
            return Err(invalid("proto3 optional field must belong to a oneof"));
        }
        if proto.default_value.is_some() && (label == Label::Repeated || field_type.is_message()) {
            return Err(invalid("repeated and message fields cannot have defaults"));
        }

        let map = match sub {
            FieldSub::Message(index) if self.message(index).map_entry => {
                if label != Label::Repeated {
                    return Err(invalid("map entry type used by a non-repeated field"));
                }
                true
            }
            _ => false,
        };
        let (closed_enum, first_value) = match sub {
            FieldSub::Enum(index) => {
                let data = self.enum_data(index);
                (data.closed, data.values.first().map(|value| value.number))
            }
            _ => (false, None),
        };

        let default = match (&proto.default_value, sub) {
            (Some(text), FieldSub::Enum(index)) => {
                let values = self
                    .enum_data(index)
                    .values
                    .iter()
                    .map(|value| (value.name.as_str(), value.number));
                DefaultValue::parse(field_type, text, values)
            }
            (Some(text), _) => DefaultValue::parse(field_type, text, []),
            (None, _) => Ok(DefaultValue::zero(field_type, first_value)),
        }
        .map_err(invalid)?;

        let packed = label == Label::Repeated
            && field_type.is_packable()
            && match syntax {
                Syntax::Proto3 => proto.packed.unwrap_or(true),
                Syntax::Proto2 => proto.packed.unwrap_or(false),
            };
        let implicit_presence = syntax == Syntax::Proto3
            && !extension
            && label == Label::Optional
            && proto.oneof_index.is_none()
            && !field_type.is_message();
        let oneof = proto
            .oneof_index
            .map(|index| usize::try_from(index).map_err(|_| invalid("oneof index out of range")))
            .transpose()?;

        let spec = FieldSpec {
            number,
            field_type,
            label,
            packed,
            implicit_presence,
            validate_utf8: syntax == Syntax::Proto3 && field_type == FieldType::String,
            closed_enum,
            map,
            // Remapped by the caller, synthetic oneofs have no slot.
            oneof,
            sub: match sub {
                FieldSub::Message(index) => SubLayout::Message(LayoutId::from_index(index)),
                FieldSub::Enum(index) if closed_enum => SubLayout::Enum(EnumId::from_index(index)),
                FieldSub::Enum(_) | FieldSub::None => SubLayout::Unlinked,
            },
        };
        let data = FieldData {
            name: proto.name.clone(),
            json_name: proto.json_name.clone().unwrap_or_else(|| json_name(&proto.name)),
            full_name,
            number,
            label,
            field_type,
            sub,
            oneof,
            proto3_optional: proto.proto3_optional,
            packed,
            has_presence: label != Label::Repeated && !implicit_presence,
            has_default: proto.default_value.is_some(),
            default,
        };
        Ok((data, spec))
    }

    fn compile_message(&mut self, local: usize) -> Result<(), SchemaError> {
        let Pending { proto, syntax } = self.pending[local];
        let full_name = self.messages[local].full_name.clone();

        let mut fields = Vec::with_capacity(proto.fields.len());
        let mut specs = Vec::with_capacity(proto.fields.len());
        for field in &proto.fields {
            let (data, spec) =
                self.compile_field(field, qualify(&full_name, &field.name), &full_name, syntax, false)?;
            fields.push(data);
            specs.push(spec);
        }

        let mut oneofs: Vec<OneofData> = proto
            .oneofs
            .iter()
            .map(|name| OneofData {
                name: name.clone(),
                full_name: qualify(&full_name, name),
                fields: Vec::new(),
                synthetic: false,
            })
            .collect();
        for (position, field) in fields.iter().enumerate() {
            if let Some(index) = field.oneof {
                let oneof = oneofs.get_mut(index).ok_or_else(|| {
                    SchemaError::invalid(&field.full_name, "oneof index out of range")
                })?;
                oneof.fields.push(position);
            }
        }
        let mut remap = Vec::with_capacity(oneofs.len());
        let mut oneof_count = 0;
        for oneof in &mut oneofs {
            if oneof.fields.is_empty() {
                return Err(SchemaError::invalid(&oneof.full_name, "oneof has no fields"));
            }
            oneof.synthetic = oneof.fields.iter().all(|i| fields[*i].proto3_optional);
            if oneof.synthetic {
                remap.push(None);
            } else {
                remap.push(Some(oneof_count));
                oneof_count += 1;
            }
        }

        let map_entry = self.messages[local].map_entry;
        for spec in &mut specs {
            spec.oneof = spec.oneof.and_then(|index| remap[index]);
            if map_entry {
                spec.implicit_presence = false;
            }
        }

        let data = &self.messages[local];
        let kind = if data.map_entry {
            MessageKind::MapEntry
        } else if data.message_set {
            MessageKind::MessageSet
        } else {
            MessageKind::Message
        };
        let spec = MessageSpec {
            kind,
            extendable: !data.extension_ranges.is_empty(),
            fields: specs,
            oneof_count,
        };

        let data = &mut self.messages[local];
        data.fields = fields;
        data.oneofs = oneofs;
        data.spec = spec;
        Ok(())
    }

    fn build_layouts(&mut self) -> Result<(), SchemaError> {
        for message in &self.messages {
            // Names the layout in the builder's events.
            let span = tracing::debug_span!("layout", message = %message.full_name);
            span.in_scope(|| self.layouts.build_message(&message.spec))
                .map_err(|err| SchemaError::from_layout(&message.full_name, err))?;
        }
        tracing::trace!(
            layouts = self.layouts.message_count(),
            enums = self.layouts.enum_count(),
            "built staged layouts"
        );
        Ok(())
    }

    fn add_extensions(&mut self) -> Result<(), SchemaError> {
        for pending in std::mem::take(&mut self.pending_extensions) {
            let PendingExtension {
                proto,
                full_name,
                scope,
                message,
                file,
                syntax,
            } = pending;

            let extendee_name = proto
                .extendee
                .as_deref()
                .ok_or_else(|| SchemaError::invalid(&full_name, "extension has no extendee"))?;
            let extendee = match self.resolve_type(&scope, extendee_name, &full_name)? {
                SymbolKind::Message(index) => index,
                _ => return Err(SchemaError::invalid(&full_name, "extendee is not a message")),
            };
            let (field, spec) = self.compile_field(proto, full_name, &scope, syntax, true)?;

            let target = self.message(extendee);
            if !target
                .extension_ranges
                .iter()
                .any(|range| range.contains(&field.number))
            {
                return Err(SchemaError::invalid(
                    &field.full_name,
                    format!(
                        "{} is not in an extension range of {}",
                        field.number, target.full_name
                    ),
                ));
            }

            let layout = ExtensionLayout::from_spec(&spec, target.layout, spec.sub)
                .map_err(|err| SchemaError::from_layout(&field.full_name, err))?;
            let id = self
                .layouts
                .add_extension(layout)
                .map_err(|err| SchemaError::from_layout(&field.full_name, err))?;
            self.registry
                .add(&self.layouts, id)
                .map_err(|err| SchemaError::from_layout(&field.full_name, err))?;

            self.extensions.push(ExtensionData {
                field,
                extendee,
                scope: message,
                file,
                id,
            });
        }
        Ok(())
    }
}
