//! The registry exposed as a hierarchical model.
//!
//! Two columns per row: column 0 is the object itself (display: type name,
//! raw: identity), column 1 is its attribute bag (display: compact JSON,
//! raw: the JSON object). Rows are the alive children of the addressed
//! subtree, in registration order.

use periscope_core::{Model, ModelError, ModelPath, ObjectId, Role, Value};

use crate::registry::ObjectRegistry;

/// Column holding the object identity and type.
pub const COLUMN_OBJECT: u32 = 0;
/// Column holding the attribute bag.
pub const COLUMN_ATTRIBUTES: u32 = 1;

const COLUMN_COUNT: u32 = 2;

impl ObjectRegistry {
    fn resolve_for_model(&self, path: &ModelPath) -> Result<Option<ObjectId>, ModelError> {
        self.resolve(path)
            .map_err(|_| ModelError::StaleIndex(path.clone()))
    }

    fn attributes_value(attributes: &[(String, Value)]) -> Value {
        Value::Object(
            attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl Model for ObjectRegistry {
    fn row_count(&self, parent: &ModelPath) -> Result<u32, ModelError> {
        match self.resolve_for_model(parent)? {
            None => Ok(self.roots().len() as u32),
            Some(id) => {
                let entry = self
                    .entry(id)
                    .ok_or_else(|| ModelError::StaleIndex(parent.clone()))?;
                Ok(entry.children.len() as u32)
            }
        }
    }

    fn column_count(&self, parent: &ModelPath) -> Result<u32, ModelError> {
        // Resolve purely for staleness detection.
        self.resolve_for_model(parent)?;
        Ok(COLUMN_COUNT)
    }

    fn value(&self, path: &ModelPath, role: Role) -> Result<Value, ModelError> {
        let stale = || ModelError::StaleIndex(path.clone());

        let id = self.resolve_for_model(path)?.ok_or_else(stale)?;
        let entry = self.entry(id).ok_or_else(stale)?;
        let column = path.last().map_or(COLUMN_OBJECT, |step| step.column);

        match (column, role) {
            (COLUMN_OBJECT, Role::Display) => Ok(Value::from(entry.type_name.clone())),
            (COLUMN_OBJECT, Role::Raw) => Ok(Value::from(entry.id.0)),
            (COLUMN_ATTRIBUTES, Role::Display) => {
                let bag = Self::attributes_value(&entry.attributes);
                Ok(Value::from(bag.to_string()))
            }
            (COLUMN_ATTRIBUTES, Role::Raw) => Ok(Self::attributes_value(&entry.attributes)),
            _ => Err(stale()),
        }
    }

    fn set_value(&mut self, path: &ModelPath, role: Role, value: Value) -> Result<(), ModelError> {
        let stale = || ModelError::StaleIndex(path.clone());

        let id = self.resolve_for_model(path)?.ok_or_else(stale)?;
        let column = path.last().map_or(COLUMN_OBJECT, |step| step.column);
        if column != COLUMN_ATTRIBUTES || role != Role::Raw {
            return Err(ModelError::UnknownRole);
        }

        let Value::Object(map) = value else {
            return Err(ModelError::UnknownRole);
        };
        let attributes = map.into_iter().collect();
        self.set_attributes(id, attributes).map_err(|_| stale())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::ObjectData;
    use periscope_core::IdentityAllocator;
    use std::collections::HashSet;

    fn data(name: &str) -> ObjectData {
        ObjectData {
            type_name: name.to_string(),
            attributes: vec![("enabled".into(), Value::from(false))],
            inconsistent: false,
        }
    }

    fn sample() -> (ObjectRegistry, ObjectId) {
        let mut reg = ObjectRegistry::new();
        let mut ids = IdentityAllocator::new();
        let window = ids.allocate();
        reg.insert(window, None, data("Window")).unwrap();
        for name in ["Button", "Label", "Slider"] {
            let id = ids.allocate();
            reg.insert(id, Some(window), data(name)).unwrap();
        }
        (reg, window)
    }

    #[test]
    fn counts_follow_the_tree() {
        let (reg, _) = sample();
        assert_eq!(reg.row_count(&ModelPath::root()).unwrap(), 1);
        assert_eq!(reg.row_count(&ModelPath::root().child(0, 0)).unwrap(), 3);
        assert_eq!(reg.column_count(&ModelPath::root()).unwrap(), 2);
    }

    #[test]
    fn values_by_column_and_role() {
        let (reg, window) = sample();
        let window_path = ModelPath::root().child(0, 0);

        assert_eq!(
            reg.value(&window_path, Role::Display).unwrap(),
            Value::from("Window")
        );
        assert_eq!(
            reg.value(&window_path, Role::Raw).unwrap(),
            Value::from(window.0)
        );

        let attrs = reg
            .value(&ModelPath::root().child(0, 1), Role::Raw)
            .unwrap();
        assert_eq!(attrs["enabled"], Value::from(false));
    }

    #[test]
    fn out_of_range_is_stale_index() {
        let (reg, _) = sample();
        let bogus = ModelPath::root().child(7, 0);
        assert!(matches!(
            reg.row_count(&bogus),
            Err(ModelError::StaleIndex(_))
        ));
        assert!(matches!(
            reg.value(&bogus, Role::Display),
            Err(ModelError::StaleIndex(_))
        ));
    }

    #[test]
    fn set_value_replaces_attribute_bag() {
        let (mut reg, window) = sample();
        let path = ModelPath::root().child(0, 1);

        let new_bag = serde_json::json!({ "enabled": true, "title": "main" });
        reg.set_value(&path, Role::Raw, new_bag).unwrap();

        let entry = reg.entry(window).unwrap();
        assert_eq!(entry.attributes.len(), 2);

        // Only the raw attribute column is writable.
        assert_eq!(
            reg.set_value(&path, Role::Display, Value::Null),
            Err(ModelError::UnknownRole)
        );
        assert_eq!(
            reg.set_value(&ModelPath::root().child(0, 0), Role::Raw, Value::Null),
            Err(ModelError::UnknownRole)
        );
    }

    #[test]
    fn destroyed_subtree_shrinks_counts() {
        let (mut reg, window) = sample();
        let first_child = *reg.entry(window).unwrap().children.first().unwrap();
        reg.destroy(first_child, HashSet::new()).unwrap();
        assert_eq!(reg.row_count(&ModelPath::root().child(0, 0)).unwrap(), 2);
    }
}
