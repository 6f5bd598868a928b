//! A sorted set: a skip list ordered by `(score, member)` paired with a
//! member→score map, ported from
//! `original_source/datastruct/sortedset/{skiplist,border}.go`.
//!
//! The skip list here is an arena of nodes addressed by index rather
//! than the original's pointer-linked nodes — safe Rust has no
//! equivalent of a node holding a direct reference to its neighbors
//! without `Rc<RefCell<_>>` overhead per link, and an index arena keeps
//! the per-level span bookkeeping exactly as simple as the original's
//! pointer arithmetic. Removed slots are recycled via a free list so
//! long-running `ZADD`/`ZREM` churn doesn't grow the arena unbounded.

use std::cmp::Ordering;
use std::collections::HashMap;

use rand::Rng;

const MAX_LEVEL: usize = 16;
const SKIPLIST_P: u32 = (0.25 * 65536.0) as u32;

/// One (member, score) pair as returned by range queries.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub member: String,
    pub score: f64,
}

fn score_member_cmp(a_score: f64, a_member: &str, b_score: f64, b_member: &str) -> Ordering {
    a_score
        .total_cmp(&b_score)
        .then_with(|| a_member.cmp(b_member))
}

/// An open/closed score bound, or one of the two infinities, ported from
/// `border.go`'s `ScoreBorder`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBorder {
    NegativeInf,
    PositiveInf,
    Value { value: f64, exclude: bool },
}

impl ScoreBorder {
    pub fn closed(value: f64) -> Self {
        ScoreBorder::Value { value, exclude: false }
    }

    pub fn open(value: f64) -> Self {
        ScoreBorder::Value { value, exclude: true }
    }

    /// `"inf"`/`"+inf"`/`"-inf"`, `"(1.5"` for exclusive, or a plain
    /// number — the grammar `ParseScoreBorder` accepts.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "inf" | "+inf" => Ok(ScoreBorder::PositiveInf),
            "-inf" => Ok(ScoreBorder::NegativeInf),
            _ if s.starts_with('(') => {
                let value: f64 = s[1..]
                    .parse()
                    .map_err(|_| format!("min or max is not a float: '{s}'"))?;
                Ok(ScoreBorder::open(value))
            }
            _ => {
                let value: f64 = s
                    .parse()
                    .map_err(|_| format!("min or max is not a float: '{s}'"))?;
                Ok(ScoreBorder::closed(value))
            }
        }
    }

    /// Is `score` strictly greater than this lower bound?
    pub fn less_than(&self, score: f64) -> bool {
        match self {
            ScoreBorder::NegativeInf => true,
            ScoreBorder::PositiveInf => false,
            ScoreBorder::Value { value, exclude } => {
                if *exclude {
                    score > *value
                } else {
                    score >= *value
                }
            }
        }
    }

    /// Is `score` strictly less than this upper bound?
    pub fn greater_than(&self, score: f64) -> bool {
        match self {
            ScoreBorder::NegativeInf => false,
            ScoreBorder::PositiveInf => true,
            ScoreBorder::Value { value, exclude } => {
                if *exclude {
                    score < *value
                } else {
                    score <= *value
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct LevelLink {
    forward: Option<usize>,
    span: i64,
}

#[derive(Debug, Clone)]
struct Node {
    member: String,
    score: f64,
    backward: Option<usize>,
    levels: Vec<LevelLink>,
    alive: bool,
}

/// Arena-indexed skip list. Index `0` is always the header sentinel and
/// is never reused or removed.
#[derive(Debug, Clone)]
struct Skiplist {
    arena: Vec<Node>,
    free: Vec<usize>,
    tail: Option<usize>,
    length: i64,
    level: usize,
}

impl Skiplist {
    fn new() -> Self {
        let header = Node {
            member: String::new(),
            score: 0.0,
            backward: None,
            levels: (0..MAX_LEVEL)
                .map(|_| LevelLink { forward: None, span: 0 })
                .collect(),
            alive: true,
        };
        Self {
            arena: vec![header],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
        }
    }

    fn random_level() -> usize {
        let mut level = 1;
        let mut rng = rand::rng();
        while level < MAX_LEVEL && (rng.random::<u32>() & 0xFFFF) < SKIPLIST_P {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.arena[idx] = node;
            idx
        } else {
            self.arena.push(node);
            self.arena.len() - 1
        }
    }

    fn insert(&mut self, member: String, score: f64) -> usize {
        let mut update = [0usize; MAX_LEVEL];
        let mut rank = [0i64; MAX_LEVEL];
        let mut x = 0usize;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.arena[x].levels[i].forward {
                let n = &self.arena[next];
                if score_member_cmp(n.score, &n.member, score, &member) == Ordering::Less {
                    rank[i] += self.arena[x].levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let new_level = Self::random_level();
        if new_level > self.level {
            for i in self.level..new_level {
                rank[i] = 0;
                update[i] = 0;
                self.arena[0].levels[i].span = self.length;
            }
            self.level = new_level;
        }

        let node = Node {
            member: member.clone(),
            score,
            backward: None,
            levels: (0..new_level)
                .map(|_| LevelLink { forward: None, span: 0 })
                .collect(),
            alive: true,
        };
        let idx = self.alloc(node);

        for i in 0..new_level {
            let u = update[i];
            self.arena[idx].levels[i].forward = self.arena[u].levels[i].forward;
            self.arena[u].levels[i].forward = Some(idx);
            self.arena[idx].levels[i].span = self.arena[u].levels[i].span - (rank[0] - rank[i]);
            self.arena[u].levels[i].span = (rank[0] - rank[i]) + 1;
        }
        for i in new_level..self.level {
            self.arena[update[i]].levels[i].span += 1;
        }

        self.arena[idx].backward = if update[0] == 0 { None } else { Some(update[0]) };
        if let Some(next) = self.arena[idx].levels[0].forward {
            self.arena[next].backward = Some(idx);
        } else {
            self.tail = Some(idx);
        }
        self.length += 1;
        idx
    }

    fn find_update_path(&self, score: f64, member: &str) -> [usize; MAX_LEVEL] {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = 0usize;
        for i in (0..self.level).rev() {
            while let Some(next) = self.arena[x].levels[i].forward {
                let n = &self.arena[next];
                if score_member_cmp(n.score, &n.member, score, member) == Ordering::Less {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }
        update
    }

    fn remove_at(&mut self, idx: usize, update: &[usize; MAX_LEVEL]) {
        for i in 0..self.level {
            if self.arena[update[i]].levels[i].forward == Some(idx) {
                let span = self.arena[idx].levels[i].span;
                self.arena[update[i]].levels[i].span += span - 1;
                self.arena[update[i]].levels[i].forward = self.arena[idx].levels[i].forward;
            } else {
                self.arena[update[i]].levels[i].span -= 1;
            }
        }
        if let Some(fwd) = self.arena[idx].levels[0].forward {
            self.arena[fwd].backward = self.arena[idx].backward;
        } else {
            self.tail = self.arena[idx].backward;
        }
        while self.level > 1 && self.arena[0].levels[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.arena[idx].alive = false;
        self.free.push(idx);
    }

    fn remove(&mut self, member: &str, score: f64) -> bool {
        let update = self.find_update_path(score, member);
        let candidate = self.arena[update[0]].levels[0].forward;
        if let Some(idx) = candidate {
            if self.arena[idx].alive && self.arena[idx].member == member && self.arena[idx].score == score {
                self.remove_at(idx, &update);
                return true;
            }
        }
        false
    }

    /// 1-based rank if found, `None` otherwise.
    fn rank(&self, member: &str, score: f64) -> Option<i64> {
        let mut x = 0usize;
        let mut rank: i64 = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.arena[x].levels[i].forward {
                let n = &self.arena[next];
                let cmp = score_member_cmp(n.score, &n.member, score, member);
                if cmp == Ordering::Less || (cmp == Ordering::Equal) {
                    rank += self.arena[x].levels[i].span;
                    x = next;
                    if cmp == Ordering::Equal {
                        break;
                    }
                } else {
                    break;
                }
            }
        }
        if x != 0 && self.arena[x].member == member {
            Some(rank)
        } else {
            None
        }
    }

    /// 1-based rank lookup by walking the bottom level, returning the
    /// arena index of the node at that rank.
    fn index_at_rank(&self, rank: i64) -> Option<usize> {
        if rank <= 0 {
            return None;
        }
        let mut x = 0usize;
        let mut traversed: i64 = 0;
        for i in (0..self.level).rev() {
            while let Some(next) = self.arena[x].levels[i].forward {
                let span = self.arena[x].levels[i].span;
                if traversed + span <= rank {
                    traversed += span;
                    x = next;
                } else {
                    break;
                }
            }
            if traversed == rank {
                break;
            }
        }
        if traversed == rank && x != 0 {
            Some(x)
        } else {
            None
        }
    }

    fn first_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        let mut x = 0usize;
        for i in (0..self.level).rev() {
            while let Some(next) = self.arena[x].levels[i].forward {
                if !min.less_than(self.arena[next].score) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        let candidate = self.arena[x].levels[0].forward?;
        let n = &self.arena[candidate];
        if min.less_than(n.score) && max.greater_than(n.score) {
            Some(candidate)
        } else {
            None
        }
    }

    fn last_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        let mut x = 0usize;
        for i in (0..self.level).rev() {
            while let Some(next) = self.arena[x].levels[i].forward {
                if max.greater_than(self.arena[next].score) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        if x == 0 {
            return None;
        }
        let n = &self.arena[x];
        if min.less_than(n.score) && max.greater_than(n.score) {
            Some(x)
        } else {
            None
        }
    }

    fn iter_from(&self, mut idx: Option<usize>) -> impl Iterator<Item = &Node> {
        std::iter::from_fn(move || {
            let i = idx?;
            let node = &self.arena[i];
            idx = node.levels[0].forward;
            Some(node)
        })
    }
}

/// A sorted set: the skip list paired with an O(1) member→score lookup,
/// matching `SortedSet`'s `dict` field.
#[derive(Debug, Clone)]
pub struct SortedSet {
    skiplist: Skiplist,
    dict: HashMap<String, f64>,
}

impl Default for SortedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SortedSet {
    pub fn new() -> Self {
        Self {
            skiplist: Skiplist::new(),
            dict: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.dict.get(member).copied()
    }

    /// `ZADD`: insert or update a member's score. Returns `true` if this
    /// created a brand-new member.
    pub fn add(&mut self, member: impl Into<String>, score: f64) -> bool {
        let member = member.into();
        if let Some(&old) = self.dict.get(&member) {
            if old != score {
                self.skiplist.remove(&member, old);
                self.skiplist.insert(member.clone(), score);
            }
            self.dict.insert(member, score);
            false
        } else {
            self.skiplist.insert(member.clone(), score);
            self.dict.insert(member, score);
            true
        }
    }

    /// `ZINCRBY`: returns the resulting score.
    pub fn incr_by(&mut self, member: impl Into<String>, delta: f64) -> f64 {
        let member = member.into();
        let new_score = self.dict.get(&member).copied().unwrap_or(0.0) + delta;
        self.add(member, new_score);
        new_score
    }

    pub fn remove(&mut self, member: &str) -> bool {
        if let Some(score) = self.dict.remove(member) {
            self.skiplist.remove(member, score);
            true
        } else {
            false
        }
    }

    /// 0-based ascending rank.
    pub fn rank(&self, member: &str) -> Option<i64> {
        let score = self.dict.get(member)?;
        self.skiplist.rank(member, *score).map(|r| r - 1)
    }

    /// 0-based rank from the highest score downward.
    pub fn rev_rank(&self, member: &str) -> Option<i64> {
        self.rank(member).map(|r| self.len() as i64 - 1 - r)
    }

    pub fn count_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> i64 {
        let Some(first) = self.skiplist.first_in_range(min, max) else {
            return 0;
        };
        let Some(first_rank) = self
            .skiplist
            .rank(&self.skiplist.arena[first].member, self.skiplist.arena[first].score)
        else {
            return 0;
        };
        let Some(last) = self.skiplist.last_in_range(min, max) else {
            return 0;
        };
        let last_rank = self
            .skiplist
            .rank(&self.skiplist.arena[last].member, self.skiplist.arena[last].score)
            .unwrap_or(first_rank);
        last_rank - first_rank + 1
    }

    /// Ascending-order elements with 0-based inclusive rank
    /// `[start, end]`; pass `desc = true` to walk from the high end
    /// instead (`ZREVRANGE`).
    pub fn range_by_rank(&self, start: i64, end: i64, desc: bool) -> Vec<Element> {
        if self.is_empty() || start > end || start < 0 {
            return Vec::new();
        }
        let len = self.len() as i64;
        let end = end.min(len - 1);
        let mut out = Vec::new();
        if !desc {
            let Some(first_idx) = self.skiplist.index_at_rank(start + 1) else {
                return out;
            };
            for node in self.skiplist.iter_from(Some(first_idx)).take((end - start + 1) as usize) {
                out.push(Element { member: node.member.clone(), score: node.score });
            }
        } else {
            let asc_start = len - 1 - end;
            let asc_end = len - 1 - start;
            let mut asc = self.range_by_rank(asc_start, asc_end, false);
            asc.reverse();
            out = asc;
        }
        out
    }

    /// `ZRANGEBYSCORE` / `ZREVRANGEBYSCORE`.
    pub fn range_by_score(&self, min: &ScoreBorder, max: &ScoreBorder, desc: bool) -> Vec<Element> {
        let Some(first) = self.skiplist.first_in_range(min, max) else {
            return Vec::new();
        };
        let mut out: Vec<Element> = self
            .skiplist
            .iter_from(Some(first))
            .take_while(|n| max.greater_than(n.score))
            .map(|n| Element { member: n.member.clone(), score: n.score })
            .collect();
        if desc {
            out.reverse();
        }
        out
    }

    pub fn remove_range_by_score(&mut self, min: &ScoreBorder, max: &ScoreBorder) -> Vec<Element> {
        let victims: Vec<Element> = self.range_by_score(min, max, false);
        for v in &victims {
            self.remove(&v.member);
        }
        victims
    }

    /// 0-based inclusive rank range.
    pub fn remove_range_by_rank(&mut self, start: i64, end: i64) -> Vec<Element> {
        let victims = self.range_by_rank(start, end, false);
        for v in &victims {
            self.remove(&v.member);
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> SortedSet {
        let mut z = SortedSet::new();
        z.add("a", 1.0);
        z.add("b", 2.0);
        z.add("c", 3.0);
        z.add("d", 4.0);
        z
    }

    #[test]
    fn add_reports_new_vs_update() {
        let mut z = SortedSet::new();
        assert!(z.add("a", 1.0));
        assert!(!z.add("a", 2.0));
        assert_eq!(z.score("a"), Some(2.0));
    }

    #[test]
    fn rank_is_zero_based_ascending() {
        let z = build();
        assert_eq!(z.rank("a"), Some(0));
        assert_eq!(z.rank("d"), Some(3));
        assert_eq!(z.rank("missing"), None);
    }

    #[test]
    fn rev_rank_mirrors_rank() {
        let z = build();
        assert_eq!(z.rev_rank("d"), Some(0));
        assert_eq!(z.rev_rank("a"), Some(3));
    }

    #[test]
    fn range_by_rank_ascending_and_descending() {
        let z = build();
        let asc = z.range_by_rank(0, 1, false);
        assert_eq!(asc.iter().map(|e| e.member.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
        let desc = z.range_by_rank(0, 1, true);
        assert_eq!(desc.iter().map(|e| e.member.clone()).collect::<Vec<_>>(), vec!["d", "c"]);
    }

    #[test]
    fn range_by_score_respects_open_closed_bounds() {
        let z = build();
        let closed = z.range_by_score(&ScoreBorder::closed(2.0), &ScoreBorder::closed(3.0), false);
        assert_eq!(closed.len(), 2);
        let open = z.range_by_score(&ScoreBorder::open(2.0), &ScoreBorder::closed(3.0), false);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].member, "c");
    }

    #[test]
    fn count_in_range_matches_range_len() {
        let z = build();
        let min = ScoreBorder::closed(2.0);
        let max = ScoreBorder::PositiveInf;
        assert_eq!(z.count_in_range(&min, &max), 3);
    }

    #[test]
    fn remove_drops_member_and_rebalances_ranks() {
        let mut z = build();
        assert!(z.remove("b"));
        assert!(!z.remove("b"));
        assert_eq!(z.rank("c"), Some(1));
        assert_eq!(z.len(), 3);
    }

    #[test]
    fn incr_by_accumulates() {
        let mut z = SortedSet::new();
        assert_eq!(z.incr_by("a", 5.0), 5.0);
        assert_eq!(z.incr_by("a", -2.0), 3.0);
    }

    #[test]
    fn remove_range_by_score_removes_matching_members() {
        let mut z = build();
        let removed = z.remove_range_by_score(&ScoreBorder::closed(2.0), &ScoreBorder::closed(3.0));
        assert_eq!(removed.len(), 2);
        assert_eq!(z.len(), 2);
    }

    #[test]
    fn score_border_parses_inf_and_exclusive() {
        assert_eq!(ScoreBorder::parse("+inf").unwrap(), ScoreBorder::PositiveInf);
        assert_eq!(ScoreBorder::parse("-inf").unwrap(), ScoreBorder::NegativeInf);
        assert_eq!(ScoreBorder::parse("(1.5").unwrap(), ScoreBorder::open(1.5));
        assert_eq!(ScoreBorder::parse("2.5").unwrap(), ScoreBorder::closed(2.5));
        assert!(ScoreBorder::parse("notanumber").is_err());
    }
}
