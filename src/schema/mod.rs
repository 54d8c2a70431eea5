//! The schema context: a symbol table built from `FileDescriptorSet`s.
//!
//! Descriptor bytes are parsed with the engine's own decoder, validated,
//! resolved against everything already known and compiled into layouts.
//! Adding a set is atomic, on any error the context is left exactly as it
//! was. Once added, definitions never change, so the context can be shared
//! between threads and the layouts it hands out live as long as it does.

mod bootstrap;
mod build;
mod default;
mod defs;
mod descriptor;

use std::ops::Range;

use indexmap::IndexMap;

pub use defs::{EnumDef, EnumValueDef, ExtensionDef, FieldDef, FileDef, MessageDef, OneofDef};

use crate::error::SchemaError;
use crate::layout::{
    EnumId, ExtensionId, ExtensionRegistry, FieldType, Label, LayoutId, LayoutSet, MessageSpec,
};
use default::DefaultValue;

/// Language rules a file was written against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Syntax {
    Proto2,
    Proto3,
}

/// Anything a fully-qualified name can refer to.
#[derive(Debug, Clone, Copy)]
pub enum Symbol<'c> {
    /// A package, or one of its enclosing packages.
    Package(&'c str),
    Message(MessageDef<'c>),
    Enum(EnumDef<'c>),
    EnumValue(EnumValueDef<'c>),
    Field(FieldDef<'c>),
    Oneof(OneofDef<'c>),
    Extension(ExtensionDef<'c>),
}

/// Table entry behind a [`Symbol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolKind {
    Package,
    Message(usize),
    Enum(usize),
    /// Enum index, value index.
    EnumValue(usize, usize),
    /// Message index, field index.
    Field(usize, usize),
    /// Message index, oneof index.
    Oneof(usize, usize),
    Extension(usize),
}

impl SymbolKind {
    fn is_type(self) -> bool {
        matches!(self, SymbolKind::Message(_) | SymbolKind::Enum(_))
    }
}

#[derive(Debug)]
pub(crate) struct FileData {
    pub(crate) name: String,
    pub(crate) package: String,
    pub(crate) syntax: Syntax,
    pub(crate) dependencies: Vec<String>,
    pub(crate) encoded: Vec<u8>,
    pub(crate) messages: Vec<usize>,
    pub(crate) enums: Vec<usize>,
    pub(crate) extensions: Vec<usize>,
}

#[derive(Debug)]
pub(crate) struct MessageData {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) file: usize,
    pub(crate) parent: Option<usize>,
    pub(crate) layout: LayoutId,
    /// What the layout was built from, kept for the compact encoding.
    pub(crate) spec: MessageSpec,
    pub(crate) fields: Vec<FieldData>,
    pub(crate) oneofs: Vec<OneofData>,
    pub(crate) nested: Vec<usize>,
    pub(crate) enums: Vec<usize>,
    pub(crate) extensions: Vec<usize>,
    pub(crate) extension_ranges: Vec<Range<u32>>,
    pub(crate) map_entry: bool,
    pub(crate) message_set: bool,
}

/// What a message or enum field's `type_name` resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldSub {
    None,
    Message(usize),
    Enum(usize),
}

#[derive(Debug)]
pub(crate) struct FieldData {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) json_name: String,
    pub(crate) number: u32,
    pub(crate) label: Label,
    pub(crate) field_type: FieldType,
    pub(crate) sub: FieldSub,
    /// Index into the owning message's oneofs, synthetic ones included.
    pub(crate) oneof: Option<usize>,
    pub(crate) proto3_optional: bool,
    pub(crate) packed: bool,
    pub(crate) has_presence: bool,
    pub(crate) default: DefaultValue,
    pub(crate) has_default: bool,
}

#[derive(Debug)]
pub(crate) struct OneofData {
    pub(crate) name: String,
    pub(crate) full_name: String,
    /// Indices into the owning message's fields.
    pub(crate) fields: Vec<usize>,
    /// Wraps a single proto3 `optional` field and has no layout slot.
    pub(crate) synthetic: bool,
}

#[derive(Debug)]
pub(crate) struct EnumData {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) file: usize,
    pub(crate) parent: Option<usize>,
    pub(crate) values: Vec<EnumValueData>,
    pub(crate) closed: bool,
    pub(crate) layout: EnumId,
}

#[derive(Debug)]
pub(crate) struct EnumValueData {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) number: i32,
}

#[derive(Debug)]
pub(crate) struct ExtensionData {
    pub(crate) field: FieldData,
    pub(crate) extendee: usize,
    /// Message the extension is declared in, if any.
    pub(crate) scope: Option<usize>,
    pub(crate) file: usize,
    pub(crate) id: ExtensionId,
}

/// A symbol table of message, enum and extension definitions together with
/// the layouts compiled from them.
///
/// ```ignore
/// let mut context = SchemaContext::new();
/// context.add_descriptors(&descriptor_set_bytes)?;
/// let person = context.find_message("example.Person").unwrap();
/// let message = decode(person.layout(), input, &mut arena, &DecodeOptions::new())?;
/// ```
#[derive(Debug, Default)]
pub struct SchemaContext {
    pub(crate) layouts: LayoutSet,
    pub(crate) registry: ExtensionRegistry,
    pub(crate) files: Vec<FileData>,
    pub(crate) messages: Vec<MessageData>,
    pub(crate) enums: Vec<EnumData>,
    pub(crate) extensions: Vec<ExtensionData>,
    pub(crate) symbols: IndexMap<String, SymbolKind>,
}

static_assertions::assert_impl_all!(SchemaContext: Send, Sync);

impl SchemaContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized `FileDescriptorSet` and add every file in it.
    ///
    /// Files already present with identical contents are skipped. All
    /// references must resolve against this set plus what the context
    /// already holds. On error nothing is added.
    pub fn add_descriptors(&mut self, descriptor_set: &[u8]) -> Result<(), SchemaError> {
        let files = descriptor::parse_file_set(descriptor_set)?;
        let staged = build::stage(self, files)?;
        self.commit(staged);
        Ok(())
    }

    fn commit(&mut self, staged: build::Staged) {
        let build::Staged {
            layouts,
            registry,
            files,
            messages,
            enums,
            extensions,
            symbols,
        } = staged;

        tracing::debug!(
            files = files.len(),
            messages = messages.len(),
            enums = enums.len(),
            extensions = extensions.len(),
            symbols = symbols.len(),
            "committing descriptors"
        );

        self.layouts = layouts;
        self.registry = registry;
        self.files.extend(files);
        self.messages.extend(messages);
        self.enums.extend(enums);
        self.extensions.extend(extensions);
        self.symbols.extend(symbols);
    }

    /// Every layout compiled so far.
    pub fn layouts(&self) -> &LayoutSet {
        &self.layouts
    }

    /// Registry of every extension, for [`crate::DecodeOptions::extensions`].
    pub fn extension_registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// The symbol with exactly this fully-qualified name, no leading dot.
    pub fn lookup(&self, full_name: &str) -> Option<Symbol<'_>> {
        self.symbols
            .get_key_value(full_name)
            .map(|(name, kind)| self.symbol(name, *kind))
    }

    /// Look `name` up the way a reference written inside `scope` would be.
    ///
    /// A leading `.` makes the name absolute. Otherwise `scope.name` is
    /// tried first, then the name in every enclosing scope up to the root.
    pub fn resolve(&self, scope: &str, name: &str) -> Option<Symbol<'_>> {
        let (full_name, kind) =
            resolve_with(scope, name, |candidate| self.symbols.get(candidate).copied(), |_| true)?;
        let (full_name, _) = self.symbols.get_key_value(full_name.as_str())?;
        Some(self.symbol(full_name, kind))
    }

    /// Every symbol with its fully-qualified name, in definition order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, Symbol<'_>)> {
        self.symbols
            .iter()
            .map(|(name, kind)| (name.as_str(), self.symbol(name, *kind)))
    }

    pub fn files(&self) -> impl Iterator<Item = FileDef<'_>> {
        (0..self.files.len()).map(|index| FileDef::new(self, index))
    }

    pub fn find_file(&self, name: &str) -> Option<FileDef<'_>> {
        self.files
            .iter()
            .position(|file| file.name == name)
            .map(|index| FileDef::new(self, index))
    }

    pub fn find_message(&self, full_name: &str) -> Option<MessageDef<'_>> {
        match self.symbols.get(full_name)? {
            SymbolKind::Message(index) => Some(MessageDef::new(self, *index)),
            _ => None,
        }
    }

    pub fn find_enum(&self, full_name: &str) -> Option<EnumDef<'_>> {
        match self.symbols.get(full_name)? {
            SymbolKind::Enum(index) => Some(EnumDef::new(self, *index)),
            _ => None,
        }
    }

    pub fn find_extension(&self, full_name: &str) -> Option<ExtensionDef<'_>> {
        match self.symbols.get(full_name)? {
            SymbolKind::Extension(index) => Some(FieldDef::extension(self, *index)),
            _ => None,
        }
    }

    /// The extension of `extendee` with field number `number`.
    pub fn find_extension_by_number(
        &self,
        extendee: MessageDef<'_>,
        number: u32,
    ) -> Option<ExtensionDef<'_>> {
        let id = self.registry.find(extendee.data().layout, number)?;
        self.extensions
            .iter()
            .position(|extension| extension.id == id)
            .map(|index| FieldDef::extension(self, index))
    }

    fn symbol<'c>(&'c self, full_name: &'c str, kind: SymbolKind) -> Symbol<'c> {
        match kind {
            SymbolKind::Package => Symbol::Package(full_name),
            SymbolKind::Message(index) => Symbol::Message(MessageDef::new(self, index)),
            SymbolKind::Enum(index) => Symbol::Enum(EnumDef::new(self, index)),
            SymbolKind::EnumValue(index, value) => {
                Symbol::EnumValue(EnumValueDef::new(self, index, value))
            }
            SymbolKind::Field(message, field) => {
                Symbol::Field(FieldDef::member(self, message, field))
            }
            SymbolKind::Oneof(message, oneof) => Symbol::Oneof(OneofDef::new(self, message, oneof)),
            SymbolKind::Extension(index) => Symbol::Extension(FieldDef::extension(self, index)),
        }
    }
}

/// C++-style name lookup.
///
/// `lookup` maps a fully-qualified candidate to its symbol, `accept` decides
/// whether a found symbol ends the search or lookup moves on to the next
/// enclosing scope.
pub(crate) fn resolve_with<L, A>(
    scope: &str,
    name: &str,
    lookup: L,
    accept: A,
) -> Option<(String, SymbolKind)>
where
    L: Fn(&str) -> Option<SymbolKind>,
    A: Fn(SymbolKind) -> bool,
{
    if let Some(absolute) = name.strip_prefix('.') {
        return lookup(absolute).map(|kind| (absolute.to_string(), kind));
    }

    let mut scope = scope;
    loop {
        let candidate = if scope.is_empty() {
            name.to_string()
        } else {
            format!("{scope}.{name}")
        };
        if let Some(kind) = lookup(&candidate).filter(|kind| accept(*kind)) {
            return Some((candidate, kind));
        }
        if scope.is_empty() {
            return None;
        }
        scope = scope.rsplit_once('.').map_or("", |(outer, _)| outer);
    }
}
