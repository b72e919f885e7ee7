// src/model/mod.rs

//! Persistent models
//!
//! A [`Model`] is a handle to one persistent object: a schema, a raw field
//! map, and a state block tracking dirtiness, session membership, location
//! (path and document file), and tree identity (parent and name). Handles
//! are cheap clones sharing one cell; within a session, one object on disk
//! materializes as exactly one cell.
//!
//! Dirtiness propagates in two directions: mutating any field dirties the
//! *top* — the nearest persistent ancestor, which is the model itself unless
//! the value sits inside another model's field — and a dirty attached model
//! walks its parent chain setting `dirty_children`, which is what steers the
//! save traversal down to it.

mod folder;

pub(crate) use folder::{attach, mark_dirty_children, FolderEntry};

use std::cell::{Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::schema::{FieldDefault, Schema};
use crate::session::SessionInner;
use crate::value::{connect, Value};

/// Session membership of a model
#[derive(Clone, Default)]
pub(crate) enum SessionRef {
    /// Freshly constructed, never part of a tree
    #[default]
    Unattached,
    /// Removed from a live tree; may be re-attached in the same transaction
    Detached,
    /// Attached to a live session
    Live(Weak<SessionInner>),
}

impl SessionRef {
    pub(crate) fn is_unattached(&self) -> bool {
        matches!(self, SessionRef::Unattached)
    }

    /// The live session, if any
    pub(crate) fn live(&self) -> Option<Rc<SessionInner>> {
        match self {
            SessionRef::Live(weak) => weak.upgrade(),
            _ => None,
        }
    }
}

/// Per-object state block
#[derive(Default)]
pub(crate) struct ModelState {
    pub(crate) dirty: bool,
    pub(crate) dirty_children: bool,
    pub(crate) session: SessionRef,
    pub(crate) path: Option<String>,
    pub(crate) file: Option<String>,
    /// Path this model was attached at immediately before removal; drives
    /// on-disk moves instead of rewrites
    pub(crate) detached_from: Option<String>,
    pub(crate) parent: Option<Weak<ModelCell>>,
    pub(crate) name: Option<String>,
    /// Nearest persistent ancestor for values nested inside another model
    pub(crate) top: Option<Weak<ModelCell>>,
    /// Folder contents cache; `None` until first access
    pub(crate) contents: Option<IndexMap<String, FolderEntry>>,
}

pub(crate) struct ModelCell {
    pub(crate) schema: Arc<Schema>,
    pub(crate) fields: RefCell<IndexMap<String, Value>>,
    pub(crate) state: RefCell<ModelState>,
}

/// Handle to a persistent object
#[derive(Clone)]
pub struct Model {
    pub(crate) cell: Rc<ModelCell>,
}

impl Model {
    /// Construct a fresh, unattached model of the given schema
    pub fn new(schema: &Arc<Schema>) -> Model {
        Model {
            cell: Rc::new(ModelCell {
                schema: schema.clone(),
                fields: RefCell::new(IndexMap::new()),
                state: RefCell::new(ModelState::default()),
            }),
        }
    }

    pub(crate) fn from_cell(cell: Rc<ModelCell>) -> Model {
        Model { cell }
    }

    pub(crate) fn downgrade(&self) -> Weak<ModelCell> {
        Rc::downgrade(&self.cell)
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.cell.schema.clone()
    }

    pub fn is_folder(&self) -> bool {
        self.cell.schema.is_folder()
    }

    /// Whether the two handles refer to the same object
    pub fn ptr_eq(&self, other: &Model) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// Store path, if attached
    pub fn path(&self) -> Option<String> {
        self.state().path.clone()
    }

    /// Child name under the parent folder, if attached
    pub fn name(&self) -> Option<String> {
        self.state().name.clone()
    }

    pub fn parent(&self) -> Option<Model> {
        self.state()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Model::from_cell)
    }

    /// Whether the model is attached to a live session
    pub fn is_attached(&self) -> bool {
        matches!(self.state().session, SessionRef::Live(_))
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// Read a field
    ///
    /// An absent value materializes the field's default into the model (a
    /// factory default is invoked). The returned value is re-parented onto
    /// this model's top so nested mutations promote dirtiness correctly.
    pub fn get(&self, name: &str) -> Result<Value> {
        let spec = self
            .cell
            .schema
            .field(name)
            .ok_or_else(|| Error::FieldUnset(name.to_string()))?;
        let existing = self.cell.fields.borrow().get(name).cloned();
        let value = match existing {
            Some(v) => v,
            None => {
                let v = match spec.default_spec() {
                    FieldDefault::Unset => return Err(Error::FieldUnset(name.to_string())),
                    FieldDefault::Null => Value::Null,
                    FieldDefault::Bool(b) => Value::Bool(*b),
                    FieldDefault::Int(i) => Value::Int(*i),
                    FieldDefault::Float(f) => Value::Float(*f),
                    FieldDefault::Str(s) => Value::Str(s.clone()),
                    FieldDefault::Factory(factory) => factory(),
                };
                self.cell
                    .fields
                    .borrow_mut()
                    .insert(name.to_string(), v.clone());
                v
            }
        };
        connect(&self.top_model(), &value);
        Ok(value)
    }

    /// Write a field
    ///
    /// Null is rejected unless the field is nullable; a configured coercion
    /// runs before the kind guard. The model's top is marked dirty.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let spec = self.cell.schema.field(name).ok_or_else(|| Error::Validation {
            field: name.to_string(),
            reason: "no such field".to_string(),
        })?;
        let mut value = value.into();
        if value.is_null() {
            if !spec.is_nullable() {
                return Err(Error::Validation {
                    field: name.to_string(),
                    reason: "null is not allowed".to_string(),
                });
            }
        } else {
            if let Some(coerce) = spec.coercion() {
                value = coerce(value).map_err(|reason| Error::Validation {
                    field: name.to_string(),
                    reason,
                })?;
            }
            if !spec.kind().accepts(&value) {
                return Err(Error::Validation {
                    field: name.to_string(),
                    reason: format!(
                        "expected {}, got {}",
                        spec.kind().name(),
                        value.type_name()
                    ),
                });
            }
        }
        self.cell
            .fields
            .borrow_mut()
            .insert(name.to_string(), value.clone());
        connect(&self.top_model(), &value);
        self.mark_dirty();
        Ok(())
    }

    /// The nearest persistent ancestor, or the model itself
    pub(crate) fn top_model(&self) -> Model {
        self.state()
            .top
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Model::from_cell)
            .unwrap_or_else(|| self.clone())
    }

    pub(crate) fn set_top(&self, top: &Model) {
        self.state_mut().top = Some(top.downgrade());
    }

    /// Mark this model's top dirty and flag dirty-children up the tree
    pub(crate) fn mark_dirty(&self) {
        let top = self.top_model();
        top.state_mut().dirty = true;
        if let Some(parent) = top.parent() {
            mark_dirty_children(&parent);
        }
    }

    pub(crate) fn state(&self) -> Ref<'_, ModelState> {
        self.cell.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, ModelState> {
        self.cell.state.borrow_mut()
    }

    /// Raw stored fields, bypassing descriptors (serializer use)
    pub(crate) fn raw_fields(&self) -> Ref<'_, IndexMap<String, Value>> {
        self.cell.fields.borrow()
    }

    /// Store a raw field value, bypassing validation and dirtiness
    /// (deserializer use)
    pub(crate) fn set_raw(&self, name: &str, value: Value) {
        self.cell
            .fields
            .borrow_mut()
            .insert(name.to_string(), value);
    }

    #[cfg(test)]
    pub(crate) fn clear_dirty_for_test(&self) {
        let mut st = self.state_mut();
        st.dirty = false;
        st.dirty_children = false;
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.path() {
            Some(path) => write!(f, "Model(!{} at {})", self.cell.schema.tag(), path),
            None => write!(f, "Model(!{})", self.cell.schema.tag()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;
    use crate::value::TrackedList;

    fn gear_schema() -> Arc<Schema> {
        Schema::model("model-test-gear")
            .field(FieldSpec::int("size").default(5))
            .field(FieldSpec::int("rate").default(2))
            .field(FieldSpec::text("label"))
            .field(FieldSpec::model("mate", None).default_null())
            .field(FieldSpec::list("teeth").default_with(|| TrackedList::new().into()))
            .register()
    }

    #[test]
    fn test_defaults_materialize_on_read() {
        let m = Model::new(&gear_schema());
        assert_eq!(m.get("size").unwrap(), Value::Int(5));
        // The default is now stored
        assert!(m.raw_fields().contains_key("size"));
        assert!(!m.is_dirty());
    }

    #[test]
    fn test_unset_field() {
        let m = Model::new(&gear_schema());
        assert!(matches!(m.get("label"), Err(Error::FieldUnset(_))));
        assert!(matches!(m.get("nope"), Err(Error::FieldUnset(_))));
    }

    #[test]
    fn test_set_marks_dirty() {
        let m = Model::new(&gear_schema());
        m.set("size", 9i64).unwrap();
        assert!(m.is_dirty());
        assert_eq!(m.get("size").unwrap(), Value::Int(9));
    }

    #[test]
    fn test_type_guard() {
        let m = Model::new(&gear_schema());
        let err = m.set("size", "nine").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        // Rejected assignment leaves state untouched
        assert!(!m.is_dirty());
        assert_eq!(m.get("size").unwrap(), Value::Int(5));
    }

    #[test]
    fn test_null_rejected_unless_nullable() {
        let m = Model::new(&gear_schema());
        assert!(m.set("size", Value::Null).is_err());
        m.set("mate", Value::Null).unwrap();
        assert_eq!(m.get("mate").unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_field_write_rejected() {
        let m = Model::new(&gear_schema());
        assert!(matches!(
            m.set("bogus", 1i64),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_coercion_runs_before_guard() {
        let schema = Schema::model("model-test-coerced")
            .field(FieldSpec::int("n").coerce(|v| match v {
                Value::Str(s) => s.parse::<i64>().map(Value::Int).map_err(|e| e.to_string()),
                other => Ok(other),
            }))
            .register();
        let m = Model::new(&schema);
        m.set("n", "42").unwrap();
        assert_eq!(m.get("n").unwrap(), Value::Int(42));
        assert!(m.set("n", "not a number").is_err());
    }

    #[test]
    fn test_nested_model_dirties_owner() {
        let m = Model::new(&gear_schema());
        let inner = Model::new(&gear_schema());
        m.set("mate", inner.clone()).unwrap();
        m.clear_dirty_for_test();

        inner.set("size", 10i64).unwrap();
        // Dirtiness promotes to the owning model
        assert!(m.is_dirty());
    }

    #[test]
    fn test_factory_defaults_not_shared() {
        let a = Model::new(&gear_schema());
        let b = Model::new(&gear_schema());
        let la = a.get("teeth").unwrap().as_list().unwrap();
        la.push(1i64);
        let lb = b.get("teeth").unwrap().as_list().unwrap();
        assert_eq!(lb.len(), 0);
    }

    #[test]
    fn test_handle_identity() {
        let a = Model::new(&gear_schema());
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Model::new(&gear_schema())));
    }
}
