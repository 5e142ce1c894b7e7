use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cascade_types::{ChangeKind, ChangeRecord};

use crate::error::ModelError;

/// Value type of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    String,
    Integer,
    Float,
    Boolean,
    /// Any JSON value (arrays, objects, mixed).
    Json,
}

impl AttributeKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Json => true,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub kind: AttributeKind,
    pub optional: bool,
}

/// Schema of one entity: its attributes and whether they may be absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    pub attributes: BTreeMap<String, AttributeDescription>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add a required attribute.
    pub fn attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeDescription {
                kind,
                optional: false,
            },
        );
        self
    }

    /// Add an attribute that may be absent or null.
    pub fn optional_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.insert(
            name.into(),
            AttributeDescription {
                kind,
                optional: true,
            },
        );
        self
    }
}

/// The object model change records are validated against on save.
///
/// Loading a model from a file belongs to the caller; this type is the
/// already-resolved handle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectModel {
    entities: BTreeMap<String, EntityDescription>,
}

impl ObjectModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityDescription) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.get(name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Check one change record against the model.
    ///
    /// Inserts must carry every required attribute; updates are checked on
    /// their dirty attributes only; deletes only need a known entity.
    pub fn validate(&self, record: &ChangeRecord) -> Result<(), ModelError> {
        let entity = self
            .entities
            .get(&record.entity)
            .ok_or_else(|| ModelError::UnknownEntity(record.entity.clone()))?;

        match record.kind {
            ChangeKind::Delete => Ok(()),
            ChangeKind::Insert => {
                for (name, desc) in &entity.attributes {
                    let present = record.values.get(name).is_some_and(|v| !v.is_null());
                    if !desc.optional && !present {
                        return Err(ModelError::MissingAttribute {
                            entity: entity.name.clone(),
                            attribute: name.clone(),
                        });
                    }
                }
                for (name, value) in &record.values {
                    check_value(entity, name, value)?;
                }
                Ok(())
            }
            ChangeKind::Update => {
                for name in &record.dirty {
                    let value = record.values.get(name).unwrap_or(&Value::Null);
                    check_value(entity, name, value)?;
                }
                Ok(())
            }
        }
    }
}

fn check_value(entity: &EntityDescription, name: &str, value: &Value) -> Result<(), ModelError> {
    let desc = entity
        .attributes
        .get(name)
        .ok_or_else(|| ModelError::UnknownAttribute {
            entity: entity.name.clone(),
            attribute: name.to_string(),
        })?;

    if value.is_null() {
        if desc.optional {
            return Ok(());
        }
        return Err(ModelError::MissingAttribute {
            entity: entity.name.clone(),
            attribute: name.to_string(),
        });
    }

    if !desc.kind.accepts(value) {
        return Err(ModelError::TypeMismatch {
            entity: entity.name.clone(),
            attribute: name.to_string(),
            expected: desc.kind.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_types::{Attributes, ManagedObject, ObjectId};
    use serde_json::json;

    fn model() -> ObjectModel {
        ObjectModel::new().with_entity(
            EntityDescription::new("User")
                .attribute("name", AttributeKind::String)
                .optional_attribute("age", AttributeKind::Integer)
                .optional_attribute("score", AttributeKind::Float),
        )
    }

    fn user(values: &[(&str, Value)]) -> ManagedObject {
        let attributes: Attributes = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ManagedObject::new(ObjectId::new(), "User", attributes, 1)
    }

    #[test]
    fn valid_insert_passes() {
        let record = ChangeRecord::insert(&user(&[("name", json!("ada")), ("age", json!(36))]));
        assert!(model().validate(&record).is_ok());
    }

    #[test]
    fn insert_missing_required_attribute_fails() {
        let record = ChangeRecord::insert(&user(&[("age", json!(36))]));
        assert_eq!(
            model().validate(&record),
            Err(ModelError::MissingAttribute {
                entity: "User".into(),
                attribute: "name".into(),
            })
        );
    }

    #[test]
    fn unknown_entity_fails() {
        let obj = ManagedObject::new(ObjectId::new(), "Group", Attributes::new(), 1);
        let record = ChangeRecord::insert(&obj);
        assert_eq!(
            model().validate(&record),
            Err(ModelError::UnknownEntity("Group".into()))
        );
    }

    #[test]
    fn unknown_attribute_fails() {
        let record = ChangeRecord::insert(&user(&[("name", json!("ada")), ("email", json!("x"))]));
        assert!(matches!(
            model().validate(&record),
            Err(ModelError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn type_mismatch_fails() {
        let record = ChangeRecord::insert(&user(&[("name", json!(42))]));
        assert!(matches!(
            model().validate(&record),
            Err(ModelError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn float_accepts_integers() {
        let record = ChangeRecord::insert(&user(&[("name", json!("ada")), ("score", json!(3))]));
        assert!(model().validate(&record).is_ok());
    }

    #[test]
    fn update_checks_only_dirty_attributes() {
        let obj = user(&[("name", json!("ada"))]);
        let dirty = ["age".to_string()].into_iter().collect();
        let mut record = ChangeRecord::update(&obj, dirty, Some(1));
        record.values.insert("age".into(), json!(37));
        assert!(model().validate(&record).is_ok());

        record.values.insert("age".into(), json!("old"));
        assert!(model().validate(&record).is_err());
    }

    #[test]
    fn update_cannot_null_required_attribute() {
        let mut obj = user(&[("name", json!("ada"))]);
        obj.attributes.insert("name".into(), Value::Null);
        let dirty = ["name".to_string()].into_iter().collect();
        let record = ChangeRecord::update(&obj, dirty, Some(1));
        assert!(matches!(
            model().validate(&record),
            Err(ModelError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn delete_only_needs_known_entity() {
        let record = ChangeRecord::delete(&user(&[]), Some(1));
        assert!(model().validate(&record).is_ok());
    }

    #[test]
    fn entity_names_are_sorted() {
        let model = model().with_entity(EntityDescription::new("Group"));
        assert_eq!(model.entity_names().collect::<Vec<_>>(), vec!["Group", "User"]);
    }
}
