//! Read results.
//!
//! Reads never expose dots or causal context, only the observable value of
//! each field. Empty containers are omitted, so a map that was never written
//! and a map whose fields were all removed read the same.

use std::collections::BTreeMap;

/// Observable value of one field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    /// Every concurrently assigned value, sorted and deduplicated.
    Register(Vec<Vec<u8>>),
    /// Sum of all increments since the last observed reset.
    Counter(i64),
    /// Members of the set, sorted.
    Set(Vec<Vec<u8>>),
    /// Nested fields.
    Map(MapValue),
}

/// Observable value of a map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapValue {
    fields: BTreeMap<String, FieldValue>,
}

impl MapValue {
    /// Creates an empty map value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field value, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Returns true if the map holds no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Raw field lookup.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Register values of a field, if it is a register.
    pub fn register(&self, name: &str) -> Option<&[Vec<u8>]> {
        match self.fields.get(name) {
            Some(FieldValue::Register(values)) => Some(values),
            _ => None,
        }
    }

    /// Counter value of a field, if it is a counter.
    pub fn counter(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::Counter(value)) => Some(*value),
            _ => None,
        }
    }

    /// Set members of a field, if it is a set.
    pub fn set(&self, name: &str) -> Option<&[Vec<u8>]> {
        match self.fields.get(name) {
            Some(FieldValue::Set(members)) => Some(members),
            _ => None,
        }
    }

    /// Nested map of a field, if it is a map.
    pub fn map(&self, name: &str) -> Option<&MapValue> {
        match self.fields.get(name) {
            Some(FieldValue::Map(map)) => Some(map),
            _ => None,
        }
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_accessors() {
        let mut children = MapValue::new();
        children.insert("a", FieldValue::Set(vec![vec![1], vec![2]]));

        let mut map = MapValue::new();
        map.insert("size", FieldValue::Register(vec![vec![4]]));
        map.insert("nlink", FieldValue::Counter(2));
        map.insert("children", FieldValue::Map(children));

        assert_eq!(map.len(), 3);
        assert_eq!(map.register("size"), Some(&[vec![4u8]][..]));
        assert_eq!(map.counter("nlink"), Some(2));
        assert_eq!(map.map("children").and_then(|c| c.set("a")).map(|s| s.len()), Some(2));
        assert_eq!(map.counter("size"), None);
        assert!(map.register("missing").is_none());
    }
}
