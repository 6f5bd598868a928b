//! List commands: `LPUSH`, `RPUSH`, `LPOP`, `RPOP`, `RPOPLPUSH`, `LLEN`,
//! `LINDEX`, `LSET`, `LRANGE`, `LREM`.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};
use kv_types::{Entity, SegmentedList};

use super::keys::restore_key;
use super::util::{key_of, parse_i64, single_read, single_write};
use crate::db::SingleDb;
use crate::registry::{CommandFlags, CommandSpec};

/// Normalize a possibly-negative Redis index against `len`, clamping out
/// of range indices to the nearest bound. Returns `None` only when `len`
/// is zero.
fn normalize_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let clamp = |i: i64| -> i64 {
        let i = if i < 0 { (len_i + i).max(0) } else { i };
        i.min(len_i - 1)
    };
    let start = clamp(start).max(0);
    let end = clamp(end);
    if start > end {
        None
    } else {
        Some((start as usize, end as usize))
    }
}

fn with_list_mut<R>(db: &SingleDb, key: &str, f: impl FnOnce(&mut SegmentedList) -> R) -> Result<R, Reply> {
    db.mutate_entity(key, |entry| match entry {
        None => {
            let mut list = SegmentedList::new();
            let r = f(&mut list);
            Ok((r, Some(Entity::List(list))))
        }
        Some(Entity::List(l)) => {
            let r = f(l);
            Ok((r, None))
        }
        Some(_) => Err(Reply::error(ServerError::WrongType)),
    })
    .and_then(|result| match result {
        Ok((r, Some(new_entity))) => {
            db.put_entity(key.to_string(), new_entity);
            Ok(r)
        }
        Ok((r, None)) => Ok(r),
        Err(e) => Err(e),
    })
}

fn push(db: &SingleDb, key: &str, values: &[Bytes], front: bool) -> Reply {
    let result = with_list_mut(db, key, |list| {
        for v in values {
            if front {
                list.push_front(v.to_vec());
            } else {
                list.push_back(v.to_vec());
            }
        }
        list.len()
    });
    match result {
        Ok(len) => Reply::integer(len as i64),
        Err(r) => r,
    }
}

fn exec_lpush(db: &SingleDb, args: &[Bytes]) -> Reply {
    push(db, &key_of(&args[0]), &args[1..], true)
}

fn exec_rpush(db: &SingleDb, args: &[Bytes]) -> Reply {
    push(db, &key_of(&args[0]), &args[1..], false)
}

fn pop(db: &SingleDb, key: &str, front: bool) -> Reply {
    let Some(entity) = db.get_entity(key) else {
        return Reply::null_bulk();
    };
    let Entity::List(_) = &entity else {
        return Reply::error(ServerError::WrongType);
    };
    let mut list = entity.as_list().cloned().unwrap();
    let popped = if front { list.pop_front() } else { list.pop_back() };
    match popped {
        None => Reply::null_bulk(),
        Some(v) => {
            if list.is_empty() {
                db.remove(key);
            } else {
                db.put_entity(key.to_string(), Entity::List(list));
            }
            Reply::bulk(v)
        }
    }
}

fn exec_lpop(db: &SingleDb, args: &[Bytes]) -> Reply {
    pop(db, &key_of(&args[0]), true)
}

fn exec_rpop(db: &SingleDb, args: &[Bytes]) -> Reply {
    pop(db, &key_of(&args[0]), false)
}

fn rpoplpush_prepare(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0]), key_of(&args[1])], vec![])
}

fn exec_rpoplpush(db: &SingleDb, args: &[Bytes]) -> Reply {
    let src = key_of(&args[0]);
    let dst = key_of(&args[1]);
    let Some(entity) = db.get_entity(&src) else {
        return Reply::null_bulk();
    };
    let Entity::List(mut src_list) = entity else {
        return Reply::error(ServerError::WrongType);
    };
    let Some(value) = src_list.pop_back() else {
        return Reply::null_bulk();
    };
    if src_list.is_empty() {
        db.remove(&src);
    } else {
        db.put_entity(src.clone(), Entity::List(src_list));
    }
    match push_one_front(db, &dst, value.clone()) {
        Ok(()) => Reply::bulk(value),
        Err(r) => r,
    }
}

fn push_one_front(db: &SingleDb, key: &str, value: Vec<u8>) -> Result<(), Reply> {
    match db.get_entity(key) {
        None => {
            let mut l = SegmentedList::new();
            l.push_front(value);
            db.put_entity(key.to_string(), Entity::List(l));
            Ok(())
        }
        Some(Entity::List(mut l)) => {
            l.push_front(value);
            db.put_entity(key.to_string(), Entity::List(l));
            Ok(())
        }
        Some(_) => Err(Reply::error(ServerError::WrongType)),
    }
}

fn undo_rpoplpush(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    let mut cmds = restore_key(db, &key_of(&args[0]));
    cmds.extend(restore_key(db, &key_of(&args[1])));
    cmds
}

fn exec_llen(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::List(l)) => Reply::integer(l.len() as i64),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_lindex(db: &SingleDb, args: &[Bytes]) -> Reply {
    let Ok(idx) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::null_bulk(),
        Some(Entity::List(l)) => {
            let Some((start, end)) = normalize_range(l.len(), idx, idx) else {
                return Reply::null_bulk();
            };
            if start != end {
                return Reply::null_bulk();
            }
            match l.get(start) {
                Some(v) => Reply::bulk(v.to_vec()),
                None => Reply::null_bulk(),
            }
        }
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_lset(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(idx) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    let result = db.mutate_entity(&key, |entry| match entry {
        Some(Entity::List(l)) => {
            let len = l.len();
            let Some((start, end)) = normalize_range(len, idx, idx) else {
                return Err(ServerError::Other("ERR index out of range".to_string()));
            };
            if start != end || !l.set(start, args[2].to_vec()) {
                return Err(ServerError::Other("ERR index out of range".to_string()));
            }
            Ok(())
        }
        Some(_) => Err(ServerError::WrongType),
        None => Err(ServerError::Other("ERR no such key".to_string())),
    });
    match result {
        Ok(()) => Reply::ok(),
        Err(e) => Reply::error(e),
    }
}

fn undo_lset(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

fn exec_lrange(db: &SingleDb, args: &[Bytes]) -> Reply {
    let (Ok(start), Ok(end)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::List(l)) => match normalize_range(l.len(), start, end) {
            None => Reply::empty_array(),
            Some((s, e)) => Reply::array(l.range(s, e).into_iter().map(Reply::bulk).collect()),
        },
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_lrem(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(count) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    let value = args[2].to_vec();
    let result = db.mutate_entity(&key, |entry| match entry {
        Some(Entity::List(l)) => {
            let removed = l.remove_matching(&value, count);
            let now_empty = l.is_empty();
            Ok((removed, now_empty))
        }
        Some(_) => Err(ServerError::WrongType),
        None => Ok((0, false)),
    });
    match result {
        Ok((removed, now_empty)) => {
            if now_empty {
                db.remove(&key);
            }
            Reply::integer(removed as i64)
        }
        Err(e) => Reply::error(e),
    }
}

fn undo_lrem(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

fn undo_single_key(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let write = CommandFlags { write: true };
    let read = CommandFlags { write: false };

    table.insert("lpush".to_string(), CommandSpec { name: "lpush", arity: -3, flags: write, prepare: single_write, executor: exec_lpush, undo: Some(undo_single_key) });
    table.insert("rpush".to_string(), CommandSpec { name: "rpush", arity: -3, flags: write, prepare: single_write, executor: exec_rpush, undo: Some(undo_single_key) });
    table.insert("lpop".to_string(), CommandSpec { name: "lpop", arity: 2, flags: write, prepare: single_write, executor: exec_lpop, undo: Some(undo_single_key) });
    table.insert("rpop".to_string(), CommandSpec { name: "rpop", arity: 2, flags: write, prepare: single_write, executor: exec_rpop, undo: Some(undo_single_key) });
    table.insert("rpoplpush".to_string(), CommandSpec { name: "rpoplpush", arity: 3, flags: write, prepare: rpoplpush_prepare, executor: exec_rpoplpush, undo: Some(undo_rpoplpush) });
    table.insert("llen".to_string(), CommandSpec { name: "llen", arity: 2, flags: read, prepare: single_read, executor: exec_llen, undo: None });
    table.insert("lindex".to_string(), CommandSpec { name: "lindex", arity: 3, flags: read, prepare: single_read, executor: exec_lindex, undo: None });
    table.insert("lset".to_string(), CommandSpec { name: "lset", arity: 4, flags: write, prepare: single_write, executor: exec_lset, undo: Some(undo_lset) });
    table.insert("lrange".to_string(), CommandSpec { name: "lrange", arity: 4, flags: read, prepare: single_read, executor: exec_lrange, undo: None });
    table.insert("lrem".to_string(), CommandSpec { name: "lrem", arity: 4, flags: write, prepare: single_write, executor: exec_lrem, undo: Some(undo_lrem) });
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
    fn push_and_range() {
        let db = test_db();
        exec_rpush(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        exec_lpush(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"z")]);
        assert_eq!(exec_llen(&db, &[Bytes::from_static(b"l")]), Reply::integer(3));
        assert_eq!(
            exec_lrange(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"0"), Bytes::from_static(b"-1")]),
            Reply::array(vec![Reply::bulk(b"z".to_vec()), Reply::bulk(b"a".to_vec()), Reply::bulk(b"b".to_vec())])
        );
    }

    #[test]
    fn pop_removes_empty_key() {
        let db = test_db();
        exec_rpush(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"only")]);
        assert_eq!(exec_rpop(&db, &[Bytes::from_static(b"l")]), Reply::bulk(b"only".to_vec()));
        assert_eq!(exec_llen(&db, &[Bytes::from_static(b"l")]), Reply::integer(0));
        assert!(db.get_entity("l").is_none());
    }

    #[test]
    fn rpoplpush_moves_between_keys() {
        let db = test_db();
        exec_rpush(&db, &[Bytes::from_static(b"src"), Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        let r = exec_rpoplpush(&db, &[Bytes::from_static(b"src"), Bytes::from_static(b"dst")]);
        assert_eq!(r, Reply::bulk(b"b".to_vec()));
        assert_eq!(exec_llen(&db, &[Bytes::from_static(b"dst")]), Reply::integer(1));
        assert_eq!(exec_llen(&db, &[Bytes::from_static(b"src")]), Reply::integer(1));
    }

    #[test]
    fn lset_out_of_range_errors() {
        let db = test_db();
        exec_rpush(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"a")]);
        assert!(exec_lset(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"5"), Bytes::from_static(b"x")]).is_error());
    }

    #[test]
    fn lrem_respects_count_direction() {
        let db = test_db();
        for v in ["a", "x", "a", "x", "a"] {
            exec_rpush(&db, &[Bytes::from_static(b"l"), Bytes::copy_from_slice(v.as_bytes())]);
        }
        assert_eq!(exec_lrem(&db, &[Bytes::from_static(b"l"), Bytes::from_static(b"1"), Bytes::from_static(b"a")]), Reply::integer(1));
        assert_eq!(exec_llen(&db, &[Bytes::from_static(b"l")]), Reply::integer(4));
    }

    #[test]
    fn wrongtype_on_string_key() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        assert_eq!(exec_llen(&db, &[Bytes::from_static(b"k")]), Reply::error(ServerError::WrongType));
    }
}
