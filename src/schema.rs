// src/schema.rs

//! Schema descriptors and the tag registry
//!
//! A schema describes one kind of persistent model: its tag (which names the
//! schema inside documents), whether it is a folder, and its fields. Each
//! field carries a type guard, an optional default (a scalar or a factory),
//! nullability, and an optional coercion that runs before the guard.
//!
//! Schemas live in a process-scoped registry keyed by tag; the serializer
//! uses it to dispatch document tags back to schemas on load. The registry is
//! the crate's only module-level state. Registering a tag twice replaces the
//! earlier schema; the tags `folder` and `blob` are reserved by the crate.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::value::Value;

/// Type guard for a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// Any value is accepted
    Any,
    Bool,
    Int,
    Float,
    Str,
    /// An ordered sequence (wrapper list)
    List,
    /// A string-keyed mapping (wrapper map)
    Map,
    /// A nested persistent model, optionally restricted to one schema tag
    Model(Option<String>),
}

impl Kind {
    /// Whether a value passes this guard
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Kind::Any, _) => true,
            (Kind::Bool, Value::Bool(_)) => true,
            (Kind::Int, Value::Int(_)) => true,
            (Kind::Float, Value::Float(_)) => true,
            (Kind::Str, Value::Str(_)) => true,
            (Kind::List, Value::List(_)) => true,
            (Kind::Map, Value::Map(_)) => true,
            (Kind::Model(None), Value::Model(_)) => true,
            (Kind::Model(Some(tag)), Value::Model(m)) => m.schema().tag() == tag,
            _ => false,
        }
    }

    /// Short name used in validation messages
    pub fn name(&self) -> &str {
        match self {
            Kind::Any => "any",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Float => "float",
            Kind::Str => "str",
            Kind::List => "list",
            Kind::Map => "map",
            Kind::Model(_) => "model",
        }
    }
}

/// Default for a field with no stored value
///
/// Scalar defaults are copied into the field map on first read; factory
/// defaults are invoked, so mutable defaults (empty lists, maps, models) are
/// never shared between objects.
#[derive(Clone)]
pub enum FieldDefault {
    /// Reading an absent value is a `FieldUnset` error
    Unset,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Zero-argument factory producing a fresh value
    Factory(fn() -> Value),
}

impl From<bool> for FieldDefault {
    fn from(v: bool) -> Self {
        FieldDefault::Bool(v)
    }
}

impl From<i64> for FieldDefault {
    fn from(v: i64) -> Self {
        FieldDefault::Int(v)
    }
}

impl From<f64> for FieldDefault {
    fn from(v: f64) -> Self {
        FieldDefault::Float(v)
    }
}

impl From<&str> for FieldDefault {
    fn from(v: &str) -> Self {
        FieldDefault::Str(v.to_string())
    }
}

/// Descriptor for a single field
#[derive(Clone)]
pub struct FieldSpec {
    name: String,
    kind: Kind,
    default: FieldDefault,
    nullable: bool,
    coerce: Option<fn(Value) -> Result<Value, String>>,
}

impl FieldSpec {
    /// A field with an explicit kind guard
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        FieldSpec {
            name: name.into(),
            kind,
            default: FieldDefault::Unset,
            nullable: false,
            coerce: None,
        }
    }

    /// A field accepting any value
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Any)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Bool)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Float)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Str)
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, Kind::List)
    }

    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, Kind::Map)
    }

    /// A nested-model field, optionally restricted to one schema tag
    pub fn model(name: impl Into<String>, tag: Option<&str>) -> Self {
        Self::new(name, Kind::Model(tag.map(str::to_string)))
    }

    /// Scalar default, copied on first read
    pub fn default(mut self, value: impl Into<FieldDefault>) -> Self {
        self.default = value.into();
        self
    }

    /// Null default; implies the field is nullable
    pub fn default_null(mut self) -> Self {
        self.default = FieldDefault::Null;
        self.nullable = true;
        self
    }

    /// Factory default, invoked on first read
    pub fn default_with(mut self, factory: fn() -> Value) -> Self {
        self.default = FieldDefault::Factory(factory);
        self
    }

    /// Allow null assignments
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Coercion applied to assigned values before the kind guard
    pub fn coerce(mut self, f: fn(Value) -> Result<Value, String>) -> Self {
        self.coerce = Some(f);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub(crate) fn default_spec(&self) -> &FieldDefault {
        &self.default
    }

    pub(crate) fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub(crate) fn coercion(&self) -> Option<fn(Value) -> Result<Value, String>> {
        self.coerce
    }
}

/// Schema for one kind of persistent model
pub struct Schema {
    tag: String,
    folder: bool,
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
    sort_key: Option<fn(&str, &str) -> Ordering>,
}

impl Schema {
    /// Start building a leaf model schema
    pub fn model(tag: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            tag: tag.into(),
            folder: false,
            fields: Vec::new(),
            sort_key: None,
        }
    }

    /// Start building a folder schema
    pub fn folder(tag: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            tag: tag.into(),
            folder: true,
            fields: Vec::new(),
            sort_key: None,
        }
    }

    /// Look up a registered schema by tag
    pub fn lookup(tag: &str) -> Option<Arc<Schema>> {
        registry()
            .read()
            .ok()
            .and_then(|reg| reg.get(tag).cloned())
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_folder(&self) -> bool {
        self.folder
    }

    /// Field descriptor by name
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.index.get(name).map(|i| &self.fields[*i])
    }

    /// All field descriptors, in declaration order
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Comparator ordering child names during folder iteration, if declared
    pub(crate) fn sort_key(&self) -> Option<fn(&str, &str) -> Ordering> {
        self.sort_key
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("tag", &self.tag)
            .field("folder", &self.folder)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Builder returned by [`Schema::model`] and [`Schema::folder`]
pub struct SchemaBuilder {
    tag: String,
    folder: bool,
    fields: Vec<FieldSpec>,
    sort_key: Option<fn(&str, &str) -> Ordering>,
}

impl SchemaBuilder {
    /// Add a field descriptor
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Declare a comparator for folder iteration order
    pub fn sort_by(mut self, cmp: fn(&str, &str) -> Ordering) -> Self {
        self.sort_key = Some(cmp);
        self
    }

    /// Register the schema, replacing any earlier schema with the same tag
    pub fn register(self) -> Arc<Schema> {
        let index = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let schema = Arc::new(Schema {
            tag: self.tag,
            folder: self.folder,
            fields: self.fields,
            index,
            sort_key: self.sort_key,
        });
        if let Ok(mut reg) = registry().write() {
            reg.insert(schema.tag.clone(), schema.clone());
        }
        schema
    }
}

fn registry() -> &'static RwLock<HashMap<String, Arc<Schema>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<Schema>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// The built-in empty folder schema (tag `folder`), registered on first use
pub fn builtin_folder() -> Arc<Schema> {
    if let Some(schema) = Schema::lookup("folder") {
        return schema;
    }
    Schema::folder("folder").register()
}

impl std::fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_after_register() {
        Schema::model("schema-test-note")
            .field(FieldSpec::text("body"))
            .register();
        let schema = Schema::lookup("schema-test-note").unwrap();
        assert_eq!(schema.tag(), "schema-test-note");
        assert!(!schema.is_folder());
        assert!(schema.field("body").is_some());
        assert!(schema.field("missing").is_none());
    }

    #[test]
    fn test_register_replaces() {
        Schema::model("schema-test-swap").register();
        Schema::model("schema-test-swap")
            .field(FieldSpec::int("n"))
            .register();
        let schema = Schema::lookup("schema-test-swap").unwrap();
        assert!(schema.field("n").is_some());
    }

    #[test]
    fn test_kind_accepts() {
        assert!(Kind::Int.accepts(&Value::Int(3)));
        assert!(!Kind::Int.accepts(&Value::Str("3".to_string())));
        assert!(Kind::Any.accepts(&Value::Bool(true)));
        assert!(Kind::List.accepts(&Value::from(Vec::<Value>::new())));
    }

    #[test]
    fn test_kind_accepts_model_tag() {
        let schema = Schema::model("schema-test-cog").register();
        let m = crate::model::Model::new(&schema);
        assert!(Kind::Model(None).accepts(&Value::Model(m.clone())));
        assert!(Kind::Model(Some("schema-test-cog".to_string())).accepts(&Value::Model(m.clone())));
        assert!(!Kind::Model(Some("other".to_string())).accepts(&Value::Model(m)));
    }

    #[test]
    fn test_builtin_folder() {
        let schema = builtin_folder();
        assert!(schema.is_folder());
        assert_eq!(schema.tag(), "folder");
    }
}
