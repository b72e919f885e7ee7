// src/value.rs

//! Dynamic values and wrapper containers
//!
//! Field values are [`Value`]s: scalars, wrapper containers, or nested
//! persistent models. The wrapper containers [`TrackedList`] and
//! [`TrackedMap`] intercept every mutating operation: each mutation first
//! re-parents inserted persistent values onto the container's owning model,
//! then marks that model dirty, then performs the operation. Containers are
//! cheap handles; clones share the same underlying storage.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::model::{Model, ModelCell};

/// A dynamic field value
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered sequence wrapper
    List(TrackedList),
    /// String-keyed mapping wrapper
    Map(TrackedMap),
    /// Nested persistent model
    Model(Model),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<TrackedList> {
        match self {
            Value::List(l) => Some(l.clone()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<TrackedMap> {
        match self {
            Value::Map(m) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<Model> {
        match self {
            Value::Model(m) => Some(m.clone()),
            _ => None,
        }
    }

    /// Short name used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Model(_) => "model",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.to_vec() == b.to_vec(),
            (Value::Map(a), Value::Map(b)) => a.entries() == b.entries(),
            (Value::Model(a), Value::Model(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(l) => f.debug_list().entries(l.to_vec()).finish(),
            Value::Map(m) => f.debug_map().entries(m.entries()).finish(),
            Value::Model(m) => m.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(TrackedList::from_values(items))
    }
}

impl From<TrackedList> for Value {
    fn from(l: TrackedList) -> Self {
        Value::List(l)
    }
}

impl From<TrackedMap> for Value {
    fn from(m: TrackedMap) -> Self {
        Value::Map(m)
    }
}

impl From<Model> for Value {
    fn from(m: Model) -> Self {
        Value::Model(m)
    }
}

/// Re-parent a value onto the model that owns it
///
/// Persistent models get their `top` pointed at `top`; containers get the
/// same and re-parent their elements recursively, so dirtiness from any depth
/// promotes to the owning persistent model.
pub(crate) fn connect(top: &Model, value: &Value) {
    match value {
        Value::Model(m) => m.set_top(top),
        Value::List(l) => {
            *l.inner.top.borrow_mut() = Some(top.downgrade());
            for item in l.inner.items.borrow().iter() {
                connect(top, item);
            }
        }
        Value::Map(m) => {
            *m.inner.top.borrow_mut() = Some(top.downgrade());
            for item in m.inner.items.borrow().values() {
                connect(top, item);
            }
        }
        _ => {}
    }
}

struct ListInner {
    items: RefCell<Vec<Value>>,
    top: RefCell<Option<Weak<ModelCell>>>,
}

/// Ordered sequence that dirties its owning model on every mutation
#[derive(Clone)]
pub struct TrackedList {
    inner: Rc<ListInner>,
}

impl TrackedList {
    pub fn new() -> Self {
        Self::from_values(Vec::new())
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        TrackedList {
            inner: Rc::new(ListInner {
                items: RefCell::new(items),
                top: RefCell::new(None),
            }),
        }
    }

    fn top(&self) -> Option<Model> {
        self.inner
            .top
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Model::from_cell)
    }

    fn adopt(&self, value: &Value) {
        if let Some(top) = self.top() {
            connect(&top, value);
        }
    }

    fn touch(&self) {
        if let Some(top) = self.top() {
            top.mark_dirty();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.items.borrow().get(index).cloned()
    }

    /// Replace the element at `index`
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: impl Into<Value>) {
        let value = value.into();
        self.adopt(&value);
        self.touch();
        self.inner.items.borrow_mut()[index] = value;
    }

    pub fn push(&self, value: impl Into<Value>) {
        let value = value.into();
        self.adopt(&value);
        self.touch();
        self.inner.items.borrow_mut().push(value);
    }

    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn insert(&self, index: usize, value: impl Into<Value>) {
        let value = value.into();
        self.adopt(&value);
        self.touch();
        self.inner.items.borrow_mut().insert(index, value);
    }

    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn remove(&self, index: usize) -> Value {
        self.touch();
        self.inner.items.borrow_mut().remove(index)
    }

    pub fn pop(&self) -> Option<Value> {
        self.touch();
        self.inner.items.borrow_mut().pop()
    }

    pub fn clear(&self) {
        self.touch();
        self.inner.items.borrow_mut().clear();
    }

    pub fn extend(&self, values: impl IntoIterator<Item = Value>) {
        let values: Vec<Value> = values.into_iter().collect();
        for value in &values {
            self.adopt(value);
        }
        self.touch();
        self.inner.items.borrow_mut().extend(values);
    }

    /// Replace the whole contents (slice assignment)
    pub fn replace(&self, values: Vec<Value>) {
        for value in &values {
            self.adopt(value);
        }
        self.touch();
        *self.inner.items.borrow_mut() = values;
    }

    pub fn reverse(&self) {
        self.touch();
        self.inner.items.borrow_mut().reverse();
    }

    /// Snapshot of the elements
    pub fn to_vec(&self) -> Vec<Value> {
        self.inner.items.borrow().clone()
    }
}

impl Default for TrackedList {
    fn default() -> Self {
        Self::new()
    }
}

struct MapInner {
    items: RefCell<IndexMap<String, Value>>,
    top: RefCell<Option<Weak<ModelCell>>>,
}

/// Insertion-ordered string-keyed mapping that dirties its owning model on
/// every mutation
#[derive(Clone)]
pub struct TrackedMap {
    inner: Rc<MapInner>,
}

impl TrackedMap {
    pub fn new() -> Self {
        TrackedMap {
            inner: Rc::new(MapInner {
                items: RefCell::new(IndexMap::new()),
                top: RefCell::new(None),
            }),
        }
    }

    pub fn from_entries(entries: Vec<(String, Value)>) -> Self {
        let map = TrackedMap::new();
        *map.inner.items.borrow_mut() = entries.into_iter().collect();
        map
    }

    fn top(&self) -> Option<Model> {
        self.inner
            .top
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Model::from_cell)
    }

    fn adopt(&self, value: &Value) {
        if let Some(top) = self.top() {
            connect(&top, value);
        }
    }

    fn touch(&self) {
        if let Some(top) = self.top() {
            top.mark_dirty();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.items.borrow().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.items.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let value = value.into();
        self.adopt(&value);
        self.touch();
        self.inner.items.borrow_mut().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.touch();
        self.inner.items.borrow_mut().shift_remove(key)
    }

    pub fn clear(&self) {
        self.touch();
        self.inner.items.borrow_mut().clear();
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        let entries: Vec<(String, Value)> = entries.into_iter().collect();
        for (_, value) in &entries {
            self.adopt(value);
        }
        self.touch();
        self.inner.items.borrow_mut().extend(entries);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.items.borrow().keys().cloned().collect()
    }

    /// Snapshot of the entries, in insertion order
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.inner
            .items
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for TrackedMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, Schema};

    fn host() -> Model {
        let schema = Schema::model("value-test-host")
            .field(FieldSpec::list("items").default_with(|| TrackedList::new().into()))
            .field(FieldSpec::map("attrs").default_with(|| TrackedMap::new().into()))
            .register();
        Model::new(&schema)
    }

    #[test]
    fn test_list_mutation_dirties_top() {
        let m = host();
        let list = m.get("items").unwrap().as_list().unwrap();
        assert!(!m.is_dirty());

        list.push(1i64);
        assert!(m.is_dirty());

        m.clear_dirty_for_test();
        list.set(0, 2i64);
        assert!(m.is_dirty());

        m.clear_dirty_for_test();
        assert_eq!(list.pop(), Some(Value::Int(2)));
        assert!(m.is_dirty());
    }

    #[test]
    fn test_list_replace_and_snapshot() {
        let m = host();
        let list = m.get("items").unwrap().as_list().unwrap();
        list.replace((0..4i64).map(Value::from).collect());
        assert_eq!(list.len(), 4);
        assert_eq!(list.get(2), Some(Value::Int(2)));
        list.reverse();
        assert_eq!(list.get(0), Some(Value::Int(3)));
        assert!(m.is_dirty());
    }

    #[test]
    fn test_map_mutation_dirties_top() {
        let m = host();
        let map = m.get("attrs").unwrap().as_map().unwrap();
        assert!(!m.is_dirty());

        map.insert("a", 1i64);
        assert!(m.is_dirty());
        assert_eq!(map.get("a"), Some(Value::Int(1)));

        m.clear_dirty_for_test();
        map.remove("a");
        assert!(m.is_dirty());
        assert!(!map.contains_key("a"));
    }

    #[test]
    fn test_map_preserves_insertion_order() {
        let map = TrackedMap::new();
        map.insert("b", 1i64);
        map.insert("a", 2i64);
        map.insert("c", 3i64);
        assert_eq!(map.keys(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_inserted_model_reparents_to_top() {
        let m = host();
        let child_schema = Schema::model("value-test-child")
            .field(FieldSpec::int("n").default(0))
            .register();
        let child = Model::new(&child_schema);

        let list = m.get("items").unwrap().as_list().unwrap();
        list.push(child.clone());

        m.clear_dirty_for_test();
        child.set("n", 7i64).unwrap();
        // Mutating the nested model promotes dirtiness to the list's owner
        assert!(m.is_dirty());
    }

    #[test]
    fn test_nested_container_reparents_recursively() {
        let m = host();
        let inner = TrackedList::from_values(vec![Value::Int(1)]);
        let outer = m.get("items").unwrap().as_list().unwrap();
        outer.push(inner.clone());

        m.clear_dirty_for_test();
        inner.push(2i64);
        assert!(m.is_dirty());
    }

    #[test]
    fn test_unconnected_container_is_inert() {
        let list = TrackedList::new();
        list.push(1i64);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::from("a"), Value::from("a"));
        assert_ne!(Value::from(1i64), Value::from(2i64));
        assert_eq!(
            Value::from(vec![Value::Int(1)]),
            Value::from(vec![Value::Int(1)])
        );
    }
}
