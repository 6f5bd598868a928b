//! Sorted set commands: `ZADD`, `ZSCORE`, `ZINCRBY`, `ZRANK`, `ZREVRANK`,
//! `ZCARD`, `ZCOUNT`, `ZRANGE[BYSCORE]`, `ZREVRANGE[BYSCORE]`, `ZREM`,
//! `ZREMRANGEBYSCORE`, `ZREMRANGEBYRANK`.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};
use kv_types::{Entity, ScoreBorder, SortedSet};

use super::keys::restore_key;
use super::util::{bytes_to_string, key_of, ok_or_range, parse_f64, parse_i64, single_read, single_write};
use crate::db::SingleDb;
use crate::registry::{CommandFlags, CommandSpec};

fn with_zset_mut<R>(db: &SingleDb, key: &str, f: impl FnOnce(&mut SortedSet) -> R) -> Result<R, Reply> {
    let result = db.mutate_entity(key, |entry| match entry {
        None => {
            let mut z = SortedSet::new();
            let r = f(&mut z);
            Ok((r, Some(Entity::SortedSet(z))))
        }
        Some(Entity::SortedSet(z)) => {
            let r = f(z);
            Ok((r, None))
        }
        Some(_) => Err(Reply::error(ServerError::WrongType)),
    });
    match result {
        Ok((r, Some(entity))) => {
            db.put_entity(key.to_string(), entity);
            Ok(r)
        }
        Ok((r, None)) => Ok(r),
        Err(e) => Err(e),
    }
}

fn parse_score(b: &Bytes) -> Result<f64, Reply> {
    ok_or_range(parse_f64(b))
}

fn parse_border(b: &Bytes) -> Result<ScoreBorder, Reply> {
    ScoreBorder::parse(&bytes_to_string(b)).map_err(|msg| Reply::error(ServerError::Range(msg)))
}

fn exec_zadd(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    if args.len() < 3 || (args.len() - 1) % 2 != 0 {
        return Reply::error(ServerError::ArgNum("zadd".to_string()));
    }
    let mut pairs = Vec::with_capacity((args.len() - 1) / 2);
    for chunk in args[1..].chunks(2) {
        match parse_score(&chunk[0]) {
            Ok(score) => pairs.push((score, bytes_to_string(&chunk[1]))),
            Err(r) => return r,
        }
    }
    let result = with_zset_mut(db, &key, |z| pairs.into_iter().filter(|(score, member)| z.add(member.clone(), *score)).count());
    match result {
        Ok(n) => Reply::integer(n as i64),
        Err(r) => r,
    }
}

fn exec_zscore(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::null_bulk(),
        Some(Entity::SortedSet(z)) => match z.score(&bytes_to_string(&args[1])) {
            Some(s) => Reply::bulk(format_score(s).into_bytes()),
            None => Reply::null_bulk(),
        },
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_zincrby(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let delta = match parse_score(&args[1]) {
        Ok(d) => d,
        Err(r) => return r,
    };
    let member = bytes_to_string(&args[2]);
    let result = with_zset_mut(db, &key, |z| z.incr_by(member.clone(), delta));
    match result {
        Ok(next) => Reply::bulk(format_score(next).into_bytes()),
        Err(r) => r,
    }
}

fn exec_zrank(db: &SingleDb, args: &[Bytes]) -> Reply {
    rank_impl(db, args, false)
}

fn exec_zrevrank(db: &SingleDb, args: &[Bytes]) -> Reply {
    rank_impl(db, args, true)
}

fn rank_impl(db: &SingleDb, args: &[Bytes], rev: bool) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::null_bulk(),
        Some(Entity::SortedSet(z)) => {
            let member = bytes_to_string(&args[1]);
            let rank = if rev { z.rev_rank(&member) } else { z.rank(&member) };
            match rank {
                Some(r) => Reply::integer(r),
                None => Reply::null_bulk(),
            }
        }
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_zcard(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::SortedSet(z)) => Reply::integer(z.len() as i64),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_zcount(db: &SingleDb, args: &[Bytes]) -> Reply {
    let min = match parse_border(&args[1]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let max = match parse_border(&args[2]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::SortedSet(z)) => Reply::integer(z.count_in_range(&min, &max)),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn elements_reply(elements: Vec<kv_types::sorted_set::Element>, with_scores: bool) -> Reply {
    let mut items = Vec::with_capacity(elements.len() * if with_scores { 2 } else { 1 });
    for e in elements {
        items.push(Reply::bulk(e.member.into_bytes()));
        if with_scores {
            items.push(Reply::bulk(format_score(e.score).into_bytes()));
        }
    }
    Reply::array(items)
}

fn has_withscores(args: &[Bytes]) -> bool {
    args.last().map(|a| a.eq_ignore_ascii_case(b"withscores")).unwrap_or(false)
}

fn exec_zrange(db: &SingleDb, args: &[Bytes]) -> Reply {
    range_by_rank_impl(db, args, false)
}

fn exec_zrevrange(db: &SingleDb, args: &[Bytes]) -> Reply {
    range_by_rank_impl(db, args, true)
}

fn range_by_rank_impl(db: &SingleDb, args: &[Bytes], desc: bool) -> Reply {
    let with_scores = has_withscores(args);
    let bound = if with_scores { args.len() - 1 } else { args.len() };
    let start = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(_) => return Reply::error(ServerError::Range("value is not an integer or out of range".to_string())),
    };
    let end = match parse_i64(&args[2]) {
        Ok(n) => n,
        Err(_) => return Reply::error(ServerError::Range("value is not an integer or out of range".to_string())),
    };
    if bound != 3 {
        return Reply::error(ServerError::Syntax);
    }
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::SortedSet(z)) => {
            let len = z.len() as i64;
            let (start, end) = normalize_rank(len, start, end);
            elements_reply(z.range_by_rank(start, end, desc), with_scores)
        }
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn normalize_rank(len: i64, start: i64, end: i64) -> (i64, i64) {
    let fix = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    (fix(start), fix(end))
}

fn exec_zrangebyscore(db: &SingleDb, args: &[Bytes]) -> Reply {
    range_by_score_impl(db, args, false)
}

fn exec_zrevrangebyscore(db: &SingleDb, args: &[Bytes]) -> Reply {
    range_by_score_impl(db, args, true)
}

fn range_by_score_impl(db: &SingleDb, args: &[Bytes], desc: bool) -> Reply {
    let with_scores = has_withscores(args);
    let (min_raw, max_raw) = if desc { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
    let min = match parse_border(min_raw) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let max = match parse_border(max_raw) {
        Ok(b) => b,
        Err(r) => return r,
    };
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::SortedSet(z)) => elements_reply(z.range_by_score(&min, &max, desc), with_scores),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_zrem(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let members: Vec<String> = args[1..].iter().map(bytes_to_string).collect();
    let result = with_zset_mut(db, &key, |z| {
        let removed = members.iter().filter(|m| z.remove(m)).count();
        (removed, z.is_empty())
    });
    match result {
        Ok((removed, now_empty)) => {
            if now_empty {
                db.remove(&key);
            }
            Reply::integer(removed as i64)
        }
        Err(r) => r,
    }
}

fn exec_zremrangebyscore(db: &SingleDb, args: &[Bytes]) -> Reply {
    let min = match parse_border(&args[1]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let max = match parse_border(&args[2]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let key = key_of(&args[0]);
    let result = with_zset_mut(db, &key, |z| {
        let removed = z.remove_range_by_score(&min, &max);
        (removed.len(), z.is_empty())
    });
    match result {
        Ok((n, now_empty)) => {
            if now_empty {
                db.remove(&key);
            }
            Reply::integer(n as i64)
        }
        Err(r) => r,
    }
}

fn exec_zremrangebyrank(db: &SingleDb, args: &[Bytes]) -> Reply {
    let start = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(_) => return Reply::error(ServerError::Range("value is not an integer or out of range".to_string())),
    };
    let end = match parse_i64(&args[2]) {
        Ok(n) => n,
        Err(_) => return Reply::error(ServerError::Range("value is not an integer or out of range".to_string())),
    };
    let key = key_of(&args[0]);
    let result = with_zset_mut(db, &key, |z| {
        let len = z.len() as i64;
        let (start, end) = normalize_rank(len, start, end);
        let removed = z.remove_range_by_rank(start, end);
        (removed.len(), z.is_empty())
    });
    match result {
        Ok((n, now_empty)) => {
            if now_empty {
                db.remove(&key);
            }
            Reply::integer(n as i64)
        }
        Err(r) => r,
    }
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.is_finite() {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

fn undo_single_key(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let write = CommandFlags { write: true };
    let read = CommandFlags { write: false };

    table.insert("zadd".to_string(), CommandSpec { name: "zadd", arity: -4, flags: write, prepare: single_write, executor: exec_zadd, undo: Some(undo_single_key) });
    table.insert("zscore".to_string(), CommandSpec { name: "zscore", arity: 3, flags: read, prepare: single_read, executor: exec_zscore, undo: None });
    table.insert("zincrby".to_string(), CommandSpec { name: "zincrby", arity: 4, flags: write, prepare: single_write, executor: exec_zincrby, undo: Some(undo_single_key) });
    table.insert("zrank".to_string(), CommandSpec { name: "zrank", arity: 3, flags: read, prepare: single_read, executor: exec_zrank, undo: None });
    table.insert("zrevrank".to_string(), CommandSpec { name: "zrevrank", arity: 3, flags: read, prepare: single_read, executor: exec_zrevrank, undo: None });
    table.insert("zcard".to_string(), CommandSpec { name: "zcard", arity: 2, flags: read, prepare: single_read, executor: exec_zcard, undo: None });
    table.insert("zcount".to_string(), CommandSpec { name: "zcount", arity: 4, flags: read, prepare: single_read, executor: exec_zcount, undo: None });
    table.insert("zrange".to_string(), CommandSpec { name: "zrange", arity: -4, flags: read, prepare: single_read, executor: exec_zrange, undo: None });
    table.insert("zrevrange".to_string(), CommandSpec { name: "zrevrange", arity: -4, flags: read, prepare: single_read, executor: exec_zrevrange, undo: None });
    table.insert("zrangebyscore".to_string(), CommandSpec { name: "zrangebyscore", arity: -4, flags: read, prepare: single_read, executor: exec_zrangebyscore, undo: None });
    table.insert("zrevrangebyscore".to_string(), CommandSpec { name: "zrevrangebyscore", arity: -4, flags: read, prepare: single_read, executor: exec_zrevrangebyscore, undo: None });
    table.insert("zrem".to_string(), CommandSpec { name: "zrem", arity: -3, flags: write, prepare: single_write, executor: exec_zrem, undo: Some(undo_single_key) });
    table.insert("zremrangebyscore".to_string(), CommandSpec { name: "zremrangebyscore", arity: 4, flags: write, prepare: single_write, executor: exec_zremrangebyscore, undo: Some(undo_single_key) });
    table.insert("zremrangebyrank".to_string(), CommandSpec { name: "zremrangebyrank", arity: 4, flags: write, prepare: single_write, executor: exec_zremrangebyrank, undo: Some(undo_single_key) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::sync::Arc;

    fn test_db() -> Arc<SingleDb> {
        SingleDb::new(0, Arc::new(Registry::build()), Arc::new(crate::db::NoopAofSink), Arc::new(kv_store::TimeWheel::new()))
    }

    #[test]
    fn zadd_and_zscore_round_trip() {
        let db = test_db();
        assert_eq!(exec_zadd(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"1"), Bytes::from_static(b"a")]), Reply::integer(1));
        assert_eq!(exec_zscore(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"a")]), Reply::bulk(b"1".to_vec()));
    }

    #[test]
    fn zrange_orders_ascending_by_score() {
        let db = test_db();
        exec_zadd(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"3"), Bytes::from_static(b"c"), Bytes::from_static(b"1"), Bytes::from_static(b"a"), Bytes::from_static(b"2"), Bytes::from_static(b"b")]);
        let Reply::Array(Some(items)) = exec_zrange(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"0"), Bytes::from_static(b"-1")]) else {
            panic!("expected array");
        };
        assert_eq!(items, vec![Reply::bulk(b"a".to_vec()), Reply::bulk(b"b".to_vec()), Reply::bulk(b"c".to_vec())]);
    }

    #[test]
    fn zrangebyscore_supports_exclusive_bound() {
        let db = test_db();
        exec_zadd(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"1"), Bytes::from_static(b"a"), Bytes::from_static(b"3"), Bytes::from_static(b"c")]);
        let Reply::Array(Some(items)) = exec_zrangebyscore(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"(1"), Bytes::from_static(b"3")]) else {
            panic!("expected array");
        };
        assert_eq!(items, vec![Reply::bulk(b"c".to_vec())]);
    }

    #[test]
    fn zincrby_creates_then_accumulates() {
        let db = test_db();
        exec_zincrby(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"5"), Bytes::from_static(b"a")]);
        assert_eq!(exec_zincrby(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"2"), Bytes::from_static(b"a")]), Reply::bulk(b"7".to_vec()));
    }

    #[test]
    fn zrem_removes_key_when_last_member_goes() {
        let db = test_db();
        exec_zadd(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"1"), Bytes::from_static(b"a")]);
        assert_eq!(exec_zrem(&db, &[Bytes::from_static(b"z"), Bytes::from_static(b"a")]), Reply::integer(1));
        assert!(db.get_entity("z").is_none());
    }

    #[test]
    fn wrongtype_on_non_zset() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        assert_eq!(exec_zscore(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"a")]), Reply::error(ServerError::WrongType));
    }
}
