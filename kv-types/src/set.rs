//! A deduplicated set of members, ported from the `Set` type in
//! `original_source/datastruct/set/set.go`, which itself wraps a
//! `dict.Dict` keyed by member with an ignored value — the same
//! "map used as a set" idiom this mirrors with `HashSet<Vec<u8>>`.

use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct SetValue {
    members: HashSet<Vec<u8>>,
}

impl SetValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        self.members.contains(member)
    }

    /// Returns `true` if `member` was newly added.
    pub fn add(&mut self, member: Vec<u8>) -> bool {
        self.members.insert(member)
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        self.members.remove(member)
    }

    pub fn members(&self) -> Vec<Vec<u8>> {
        self.members.iter().cloned().collect()
    }

    /// Remove and return up to `count` arbitrary members (`SPOP`).
    pub fn pop(&mut self, count: usize) -> Vec<Vec<u8>> {
        let chosen: Vec<Vec<u8>> = self.members.iter().take(count).cloned().collect();
        for m in &chosen {
            self.members.remove(m);
        }
        chosen
    }

    pub fn intersect(sets: &[&SetValue]) -> SetValue {
        let Some((first, rest)) = sets.split_first() else {
            return SetValue::new();
        };
        let members = first
            .members
            .iter()
            .filter(|m| rest.iter().all(|s| s.members.contains(*m)))
            .cloned()
            .collect();
        SetValue { members }
    }

    pub fn union(sets: &[&SetValue]) -> SetValue {
        let mut members = HashSet::new();
        for s in sets {
            members.extend(s.members.iter().cloned());
        }
        SetValue { members }
    }

    /// Members present in `sets[0]` but none of `sets[1..]`.
    pub fn difference(sets: &[&SetValue]) -> SetValue {
        let Some((first, rest)) = sets.split_first() else {
            return SetValue::new();
        };
        let members = first
            .members
            .iter()
            .filter(|m| !rest.iter().any(|s| s.members.contains(*m)))
            .cloned()
            .collect();
        SetValue { members }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> SetValue {
        let mut s = SetValue::new();
        for i in items {
            s.add(i.as_bytes().to_vec());
        }
        s
    }

    #[test]
    fn add_reports_novelty() {
        let mut s = SetValue::new();
        assert!(s.add(b"a".to_vec()));
        assert!(!s.add(b"a".to_vec()));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn intersect_union_difference() {
        let a = set(&["a", "b", "c"]);
        let b = set(&["b", "c", "d"]);
        let mut inter = SetValue::intersect(&[&a, &b]).members();
        inter.sort();
        assert_eq!(inter, vec![b"b".to_vec(), b"c".to_vec()]);

        let mut uni = SetValue::union(&[&a, &b]).members();
        uni.sort();
        assert_eq!(uni, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let diff = SetValue::difference(&[&a, &b]).members();
        assert_eq!(diff, vec![b"a".to_vec()]);
    }

    #[test]
    fn pop_removes_what_it_returns() {
        let mut s = set(&["a", "b", "c"]);
        let popped = s.pop(2);
        assert_eq!(popped.len(), 2);
        assert_eq!(s.len(), 1);
        for m in &popped {
            assert!(!s.contains(m));
        }
    }
}
