//! A field→bytes mapping (`HSET`/`HGET`/...), ported from the plain
//! `map[string][]byte` a Go `dict.Dict` held for hash-typed entities in
//! the original. Insertion order is not significant (§3), so a plain
//! `HashMap` is the right fit — unlike the data/TTL/version maps this
//! never needs independent sharding, since it already lives behind the
//! owning key's own lock.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct HashValue {
    fields: HashMap<String, Vec<u8>>,
}

impl HashValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[u8]> {
        self.fields.get(field).map(|v| v.as_slice())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Returns `true` if this created a new field (mirrors `HSET`'s
    /// reply semantics, which count newly-created fields).
    pub fn set(&mut self, field: impl Into<String>, value: Vec<u8>) -> bool {
        self.fields.insert(field.into(), value).is_none()
    }

    pub fn set_if_absent(&mut self, field: impl Into<String>, value: Vec<u8>) -> bool {
        let field = field.into();
        if self.fields.contains_key(&field) {
            return false;
        }
        self.fields.insert(field, value);
        true
    }

    pub fn remove(&mut self, field: &str) -> bool {
        self.fields.remove(field).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Vec<u8>> {
        self.fields.values().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_whether_a_field_was_new() {
        let mut h = HashValue::new();
        assert!(h.set("a", b"1".to_vec()));
        assert!(!h.set("a", b"2".to_vec()));
        assert_eq!(h.get("a"), Some(b"2".as_slice()));
    }

    #[test]
    fn set_if_absent_does_not_overwrite() {
        let mut h = HashValue::new();
        assert!(h.set_if_absent("a", b"1".to_vec()));
        assert!(!h.set_if_absent("a", b"2".to_vec()));
        assert_eq!(h.get("a"), Some(b"1".as_slice()));
    }

    #[test]
    fn remove_and_len() {
        let mut h = HashValue::new();
        h.set("a", b"1".to_vec());
        h.set("b", b"2".to_vec());
        assert!(h.remove("a"));
        assert!(!h.remove("a"));
        assert_eq!(h.len(), 1);
    }
}
