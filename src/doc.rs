// src/doc.rs

//! Document serialization
//!
//! One document per object: a YAML mapping tagged with the schema tag
//! (`!widget`). Wrapper containers serialize as plain sequences and
//! mappings; nested models serialize as tagged mappings in place. Fields
//! with no stored value are omitted on write; unknown fields and keys are
//! ignored on load for forward compatibility. Unknown tags fail the load.

use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::Mapping;

use crate::error::{Error, Result};
use crate::model::Model;
use crate::schema::Schema;
use crate::value::{TrackedList, TrackedMap, Value};

/// Suffix of every document file
pub(crate) const DOC_SUFFIX: &str = ".doc";
/// Stem of the reserved folder index document
pub(crate) const INDEX_STEM: &str = "__index__";
/// The reserved folder index document name
pub(crate) const INDEX_DOC: &str = "__index__.doc";

/// The document file for an object at `path`
pub(crate) fn doc_file(path: &str, is_folder: bool) -> String {
    if is_folder {
        if path == "/" {
            format!("/{INDEX_DOC}")
        } else {
            format!("{path}/{INDEX_DOC}")
        }
    } else {
        format!("{path}{DOC_SUFFIX}")
    }
}

/// Serialize a model to document text
pub(crate) fn encode(model: &Model) -> Result<String> {
    let value = model_to_yaml(model);
    serde_yaml::to_string(&value).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to serialize document: {e}"),
        ))
    })
}

/// Deserialize document text into a fresh, unattached model
pub(crate) fn decode(file: &str, bytes: &[u8]) -> Result<Model> {
    let value: serde_yaml::Value = serde_yaml::from_slice(bytes).map_err(|e| Error::Load {
        file: file.to_string(),
        reason: format!("malformed document: {e}"),
    })?;
    yaml_to_model(file, value)
}

fn model_to_yaml(model: &Model) -> serde_yaml::Value {
    let mut map = Mapping::new();
    for spec in model.schema().fields() {
        let stored = model.raw_fields().get(spec.name()).cloned();
        if let Some(value) = stored {
            map.insert(
                serde_yaml::Value::String(spec.name().to_string()),
                value_to_yaml(&value),
            );
        }
    }
    serde_yaml::Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(model.schema().tag()),
        value: serde_yaml::Value::Mapping(map),
    }))
}

fn value_to_yaml(value: &Value) -> serde_yaml::Value {
    match value {
        Value::Null => serde_yaml::Value::Null,
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Int(i) => serde_yaml::Value::Number((*i).into()),
        Value::Float(f) => serde_yaml::Value::Number((*f).into()),
        Value::Str(s) => serde_yaml::Value::String(s.clone()),
        Value::List(list) => {
            serde_yaml::Value::Sequence(list.to_vec().iter().map(value_to_yaml).collect())
        }
        Value::Map(map) => {
            let mut out = Mapping::new();
            for (k, v) in map.entries() {
                out.insert(serde_yaml::Value::String(k), value_to_yaml(&v));
            }
            serde_yaml::Value::Mapping(out)
        }
        Value::Model(model) => model_to_yaml(model),
    }
}

fn yaml_to_model(file: &str, value: serde_yaml::Value) -> Result<Model> {
    let serde_yaml::Value::Tagged(tagged) = value else {
        return Err(Error::Load {
            file: file.to_string(),
            reason: "document is not a tagged mapping".to_string(),
        });
    };
    tagged_to_model(file, tagged)
}

fn tagged_to_model(file: &str, tagged: Box<TaggedValue>) -> Result<Model> {
    let tag_text = tagged.tag.to_string();
    let tag = tag_text.strip_prefix('!').unwrap_or(&tag_text);
    let schema = Schema::lookup(tag).ok_or_else(|| Error::Load {
        file: file.to_string(),
        reason: format!("unknown schema tag '!{tag}'"),
    })?;
    let serde_yaml::Value::Mapping(map) = tagged.value else {
        return Err(Error::Load {
            file: file.to_string(),
            reason: format!("'!{tag}' document is not a mapping"),
        });
    };

    let model = Model::new(&schema);
    for (key, value) in map {
        let serde_yaml::Value::String(key) = key else {
            continue;
        };
        if schema.field(&key).is_none() {
            // Unknown field, written by some other revision of the schema
            continue;
        }
        model.set_raw(&key, yaml_to_value(file, value)?);
    }
    Ok(model)
}

fn yaml_to_value(file: &str, value: serde_yaml::Value) -> Result<Value> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(Error::Load {
                    file: file.to_string(),
                    reason: format!("unrepresentable number: {n}"),
                });
            }
        }
        serde_yaml::Value::String(s) => Value::Str(s),
        serde_yaml::Value::Sequence(seq) => {
            let mut items = Vec::with_capacity(seq.len());
            for item in seq {
                items.push(yaml_to_value(file, item)?);
            }
            Value::List(TrackedList::from_values(items))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (k, v) in map {
                let serde_yaml::Value::String(k) = k else {
                    return Err(Error::Load {
                        file: file.to_string(),
                        reason: "mapping with a non-string key".to_string(),
                    });
                };
                entries.push((k, yaml_to_value(file, v)?));
            }
            Value::Map(TrackedMap::from_entries(entries))
        }
        serde_yaml::Value::Tagged(tagged) => Value::Model(tagged_to_model(file, tagged)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;
    use crate::value::TrackedMap;

    fn widget_schema() {
        Schema::model("doc-test-widget")
            .field(FieldSpec::text("label"))
            .field(FieldSpec::int("count").default(0))
            .field(FieldSpec::model("gear", None).default_null())
            .field(FieldSpec::list("parts"))
            .field(FieldSpec::map("attrs"))
            .register();
        Schema::model("doc-test-gear")
            .field(FieldSpec::int("size").default(5))
            .register();
    }

    #[test]
    fn test_round_trip_scalars() {
        widget_schema();
        let schema = Schema::lookup("doc-test-widget").unwrap();
        let m = Model::new(&schema);
        m.set("label", "hello").unwrap();
        m.set("count", 3i64).unwrap();

        let text = encode(&m).unwrap();
        let back = decode("/w.doc", text.as_bytes()).unwrap();
        assert_eq!(back.get("label").unwrap(), Value::from("hello"));
        assert_eq!(back.get("count").unwrap(), Value::Int(3));
        assert_eq!(back.schema().tag(), "doc-test-widget");
    }

    #[test]
    fn test_unset_fields_omitted() {
        widget_schema();
        let schema = Schema::lookup("doc-test-widget").unwrap();
        let m = Model::new(&schema);
        m.set("count", 1i64).unwrap();
        let text = encode(&m).unwrap();
        assert!(!text.contains("label"));
        assert!(text.contains("count"));
    }

    #[test]
    fn test_round_trip_nested_model() {
        widget_schema();
        let widget = Schema::lookup("doc-test-widget").unwrap();
        let gear = Schema::lookup("doc-test-gear").unwrap();
        let m = Model::new(&widget);
        let g = Model::new(&gear);
        g.set("size", 9i64).unwrap();
        m.set("gear", g).unwrap();

        let text = encode(&m).unwrap();
        let back = decode("/w.doc", text.as_bytes()).unwrap();
        let gear_back = back.get("gear").unwrap().as_model().unwrap();
        assert_eq!(gear_back.schema().tag(), "doc-test-gear");
        assert_eq!(gear_back.get("size").unwrap(), Value::Int(9));
    }

    #[test]
    fn test_round_trip_containers() {
        widget_schema();
        let schema = Schema::lookup("doc-test-widget").unwrap();
        let m = Model::new(&schema);
        m.set("parts", vec![Value::Int(1), Value::from("two"), Value::Null])
            .unwrap();
        let attrs = TrackedMap::new();
        attrs.insert("b", 2i64);
        attrs.insert("a", 1i64);
        m.set("attrs", attrs).unwrap();

        let text = encode(&m).unwrap();
        let back = decode("/w.doc", text.as_bytes()).unwrap();
        let parts = back.get("parts").unwrap().as_list().unwrap();
        assert_eq!(parts.get(0), Some(Value::Int(1)));
        assert_eq!(parts.get(1), Some(Value::from("two")));
        assert_eq!(parts.get(2), Some(Value::Null));
        let attrs = back.get("attrs").unwrap().as_map().unwrap();
        // Mapping order survives the round trip
        assert_eq!(attrs.keys(), vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_field_ignored() {
        widget_schema();
        let text = "!doc-test-widget\ncount: 2\nvestigial: true\n";
        let back = decode("/w.doc", text.as_bytes()).unwrap();
        assert_eq!(back.get("count").unwrap(), Value::Int(2));
        assert!(back.raw_fields().get("vestigial").is_none());
    }

    #[test]
    fn test_unknown_tag_fails() {
        let text = "!doc-test-never-registered\nx: 1\n";
        let err = decode("/w.doc", text.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
    }

    #[test]
    fn test_untagged_document_fails() {
        widget_schema();
        let err = decode("/w.doc", b"count: 2\n").unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        let err = decode("/w.doc", b"{ not yaml").unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
    }

    #[test]
    fn test_doc_file_layout() {
        assert_eq!(doc_file("/", true), "/__index__.doc");
        assert_eq!(doc_file("/a", true), "/a/__index__.doc");
        assert_eq!(doc_file("/a", false), "/a.doc");
        assert_eq!(doc_file("/a/b", false), "/a/b.doc");
    }
}
