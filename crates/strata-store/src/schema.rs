//! Object types and their attribute declarations.
//!
//! A [`Schema`] is plain data: a name, a set of [`Attribute`]s, a retention
//! policy and an [`ObjectKind`] that selects special behavior (symlink
//! resolution, stream strategies). Every schema carries the base attributes
//! in [`attributes`]. Types are looked up by name in a [`SchemaRegistry`],
//! so an object's type can change over its version history without any
//! runtime dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use strata_types::{Value, ValueKind};

use crate::error::{StoreError, StoreResult};

/// Well-known attribute keys.
pub mod attributes {
    /// Recorded type of the object (versioned).
    pub const TYPE: &str = "metadata:type";
    /// Time of the last flush (unversioned).
    pub const LAST: &str = "metadata:last";
    /// Free-form labels (unversioned).
    pub const LABELS: &str = "metadata:labels";
    /// Time content was last flushed to a chunked stream.
    pub const CONTENT_LAST: &str = "metadata:content_last";
    /// Target of a symlink object.
    pub const SYMLINK_TARGET: &str = "metadata:symlink_target";
    /// Body of a single-cell stream.
    pub const CONTENT: &str = "stream:content";
    /// Logical size of a stream in bytes.
    pub const SIZE: &str = "stream:size";
    /// Chunk size actually used by a chunked stream.
    pub const CHUNKSIZE: &str = "stream:chunksize";
}

/// Built-in type names.
pub mod types {
    pub const OBJECT: &str = "Object";
    pub const VOLUME: &str = "Volume";
    pub const SYMLINK: &str = "Symlink";
    pub const MEMORY_STREAM: &str = "MemoryStream";
    pub const UNVERSIONED_MEMORY_STREAM: &str = "UnversionedMemoryStream";
    pub const IMAGE: &str = "Image";
    pub const UNVERSIONED_IMAGE: &str = "UnversionedImage";
}

/// Declaration of one named, typed attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    key: String,
    kind: ValueKind,
    description: String,
    default: Option<Value>,
    versioned: bool,
    lock_protected: bool,
}

impl Attribute {
    /// A versioned, unprotected attribute without a default.
    pub fn new(key: impl Into<String>, kind: ValueKind, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            description: description.into(),
            default: None,
            versioned: true,
            lock_protected: false,
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Only the latest value is ever retained.
    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }

    /// Writable only under a live lease (or by a blind create).
    pub fn lock_protected(mut self) -> Self {
        self.lock_protected = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn is_versioned(&self) -> bool {
        self.versioned
    }

    pub fn is_lock_protected(&self) -> bool {
        self.lock_protected
    }
}

/// How many historical values of versioned attributes a flush retains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Retention {
    /// Every flushed value is kept.
    #[default]
    KeepAll,
    /// A flush keeps only the most recent value of each attribute.
    KeepNewest,
}

/// Special behavior attached to a type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjectKind {
    #[default]
    Generic,
    /// Resolves to the URN in [`attributes::SYMLINK_TARGET`].
    Symlink,
    /// Body held in a single [`attributes::CONTENT`] cell.
    MemoryStream,
    /// Body split into fixed-size chunk child objects.
    Image,
}

/// A named object type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    name: String,
    attributes: BTreeMap<String, Attribute>,
    retention: Retention,
    kind: ObjectKind,
    chunk_type: Option<String>,
}

impl Schema {
    /// A generic keep-all type with only the base attributes.
    pub fn new(name: impl Into<String>) -> Self {
        let base = [
            Attribute::new(attributes::TYPE, ValueKind::String, "Recorded object type"),
            Attribute::new(attributes::LAST, ValueKind::Timestamp, "Time of the last flush")
                .unversioned(),
            Attribute::new(attributes::LABELS, ValueKind::List, "Labels attached to the object")
                .unversioned()
                .default_value(Value::List(Vec::new())),
        ];
        Self {
            name: name.into(),
            attributes: base.into_iter().map(|a| (a.key.clone(), a)).collect(),
            retention: Retention::KeepAll,
            kind: ObjectKind::Generic,
            chunk_type: None,
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.insert(attribute.key.clone(), attribute);
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_kind(mut self, kind: ObjectKind) -> Self {
        self.kind = kind;
        self
    }

    /// Type used for the chunk objects of an image.
    pub fn with_chunk_type(mut self, chunk_type: impl Into<String>) -> Self {
        self.chunk_type = Some(chunk_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    pub fn declares(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn chunk_type(&self) -> Option<&str> {
        self.chunk_type.as_deref()
    }
}

/// Registry of known types, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<Schema>>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in generic, symlink and stream types.
    pub fn with_builtins() -> Self {
        let content = || Attribute::new(attributes::CONTENT, ValueKind::Bytes, "Stream body");
        let size = || {
            Attribute::new(attributes::SIZE, ValueKind::Integer, "Stream size in bytes")
                .default_value(0i64)
        };
        let chunksize = || {
            Attribute::new(attributes::CHUNKSIZE, ValueKind::Integer, "Chunk size in bytes")
                .unversioned()
        };
        let content_last = || {
            Attribute::new(
                attributes::CONTENT_LAST,
                ValueKind::Timestamp,
                "Time content was last flushed",
            )
        };

        let mut registry = Self::new();
        registry.register(Schema::new(types::OBJECT));
        registry.register(Schema::new(types::VOLUME));
        registry.register(
            Schema::new(types::SYMLINK)
                .with_kind(ObjectKind::Symlink)
                .with_attribute(Attribute::new(
                    attributes::SYMLINK_TARGET,
                    ValueKind::Urn,
                    "Target of the link",
                )),
        );
        registry.register(
            Schema::new(types::MEMORY_STREAM)
                .with_kind(ObjectKind::MemoryStream)
                .with_attribute(content())
                .with_attribute(size()),
        );
        registry.register(
            Schema::new(types::UNVERSIONED_MEMORY_STREAM)
                .with_kind(ObjectKind::MemoryStream)
                .with_attribute(content().unversioned())
                .with_attribute(size().unversioned()),
        );
        registry.register(
            Schema::new(types::IMAGE)
                .with_kind(ObjectKind::Image)
                .with_chunk_type(types::MEMORY_STREAM)
                .with_attribute(size())
                .with_attribute(chunksize())
                .with_attribute(content_last()),
        );
        registry.register(
            Schema::new(types::UNVERSIONED_IMAGE)
                .with_kind(ObjectKind::Image)
                .with_chunk_type(types::UNVERSIONED_MEMORY_STREAM)
                .with_attribute(size().unversioned())
                .with_attribute(chunksize())
                .with_attribute(content_last().unversioned()),
        );
        registry
    }

    /// Add or replace a type.
    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> StoreResult<Arc<Schema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
