/// Record Module
///
/// A record is anything that maps column names to values. Lookups are
/// case-insensitive; stored names keep their original case.
use crate::core::db::value::Value;
use std::collections::{BTreeMap, HashMap};

/// Name-to-value mapping used for rows passed to insert/update/save and
/// rows returned from queries.
pub trait Record {
    /// Value stored under `name`, matched case-insensitively.
    fn field(&self, name: &str) -> Option<&Value>;

    /// Stores `value` under `name`, replacing a case-insensitive match if present.
    fn set_field(&mut self, name: &str, value: Value);

    /// Field names in their stored case.
    fn field_names(&self) -> Vec<String>;

    fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// An ordered row of named values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new() -> Self {
        Row::default()
    }

    /// Builds a row from parallel column and value lists.
    pub fn from_parts(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Row { columns, values }
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.position(name) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.columns.push(name.to_string());
                self.values.push(value);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.values[idx])
    }

    pub fn get_index(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.position(name)?;
        self.columns.remove(idx);
        Some(self.values.remove(idx))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }

    /// Renders the row as a JSON object, in column order where the JSON map
    /// preserves it.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
    }
}

impl Record for Row {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn set_field(&mut self, name: &str, value: Value) {
        self.set(name, value);
    }

    fn field_names(&self) -> Vec<String> {
        self.columns.clone()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            let name: String = name.into();
            row.set(&name, value);
        }
        row
    }
}

fn find_key<'a, I>(keys: I, name: &str) -> Option<&'a String>
where
    I: Iterator<Item = &'a String> + Clone,
{
    keys.clone()
        .find(|k| k.as_str() == name)
        .or_else(|| keys.into_iter().find(|k| k.eq_ignore_ascii_case(name)))
}

impl Record for HashMap<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
            .or_else(|| find_key(self.keys(), name).and_then(|k| self.get(k)))
    }

    fn set_field(&mut self, name: &str, value: Value) {
        let key = find_key(self.keys(), name)
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.insert(key, value);
    }

    fn field_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}

impl Record for BTreeMap<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
            .or_else(|| find_key(self.keys(), name).and_then(|k| self.get(k)))
    }

    fn set_field(&mut self, name: &str, value: Value) {
        let key = find_key(self.keys(), name)
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.insert(key, value);
    }

    fn field_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}
