//! Set commands: `SADD`, `SISMEMBER`, `SREM`, `SPOP`, `SCARD`,
//! `SMEMBERS`, `SINTER[STORE]`, `SUNION[STORE]`, `SDIFF[STORE]`.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};
use kv_types::{Entity, SetValue};

use super::keys::restore_key;
use super::util::{all_read, key_of, parse_i64, single_read, single_write};
use crate::db::SingleDb;
use crate::registry::{CommandFlags, CommandSpec};

fn with_set_mut<R>(db: &SingleDb, key: &str, f: impl FnOnce(&mut SetValue) -> R) -> Result<R, Reply> {
    let result = db.mutate_entity(key, |entry| match entry {
        None => {
            let mut s = SetValue::new();
            let r = f(&mut s);
            Ok((r, Some(Entity::Set(s))))
        }
        Some(Entity::Set(s)) => {
            let r = f(s);
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

fn exec_sadd(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let members = &args[1..];
    let result = with_set_mut(db, &key, |s| members.iter().filter(|m| s.add(m.to_vec())).count());
    match result {
        Ok(n) => Reply::integer(n as i64),
        Err(r) => r,
    }
}

fn exec_sismember(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::Set(s)) => Reply::integer(if s.contains(&args[1]) { 1 } else { 0 }),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_srem(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let members = &args[1..];
    let result = with_set_mut(db, &key, |s| {
        let removed = members.iter().filter(|m| s.remove(m)).count();
        (removed, s.is_empty())
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

fn exec_spop(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let count = if args.len() > 1 {
        match parse_i64(&args[1]) {
            Ok(n) if n >= 0 => n as usize,
            _ => return Reply::error(ServerError::Range("value is out of range, must be positive".to_string())),
        }
    } else {
        1
    };
    let result = with_set_mut(db, &key, |s| {
        let popped = s.pop(count);
        (popped, s.is_empty())
    });
    match result {
        Ok((popped, now_empty)) => {
            if now_empty {
                db.remove(&key);
            }
            if args.len() > 1 {
                Reply::array(popped.into_iter().map(Reply::bulk).collect())
            } else {
                match popped.into_iter().next() {
                    Some(v) => Reply::bulk(v),
                    None => Reply::null_bulk(),
                }
            }
        }
        Err(r) => r,
    }
}

fn exec_scard(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::Set(s)) => Reply::integer(s.len() as i64),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_smembers(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::Set(s)) => Reply::array(s.members().into_iter().map(Reply::bulk).collect()),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn load_sets(db: &SingleDb, keys: &[Bytes]) -> Result<Vec<SetValue>, Reply> {
    keys.iter()
        .map(|k| match db.get_entity(&key_of(k)) {
            None => Ok(SetValue::new()),
            Some(Entity::Set(s)) => Ok(s),
            Some(_) => Err(Reply::error(ServerError::WrongType)),
        })
        .collect()
}

fn combine(db: &SingleDb, args: &[Bytes], op: impl Fn(&[&SetValue]) -> SetValue) -> Reply {
    match load_sets(db, args) {
        Ok(sets) => {
            let refs: Vec<&SetValue> = sets.iter().collect();
            Reply::array(op(&refs).members().into_iter().map(Reply::bulk).collect())
        }
        Err(r) => r,
    }
}

fn combine_store(db: &SingleDb, args: &[Bytes], op: impl Fn(&[&SetValue]) -> SetValue) -> Reply {
    let dst = key_of(&args[0]);
    match load_sets(db, &args[1..]) {
        Ok(sets) => {
            let refs: Vec<&SetValue> = sets.iter().collect();
            let result = op(&refs);
            let len = result.len();
            if result.is_empty() {
                db.remove(&dst);
            } else {
                db.put_entity(dst, Entity::Set(result));
            }
            Reply::integer(len as i64)
        }
        Err(r) => r,
    }
}

fn exec_sinter(db: &SingleDb, args: &[Bytes]) -> Reply {
    combine(db, args, SetValue::intersect)
}

fn exec_sinterstore(db: &SingleDb, args: &[Bytes]) -> Reply {
    combine_store(db, args, SetValue::intersect)
}

fn exec_sunion(db: &SingleDb, args: &[Bytes]) -> Reply {
    combine(db, args, SetValue::union)
}

fn exec_sunionstore(db: &SingleDb, args: &[Bytes]) -> Reply {
    combine_store(db, args, SetValue::union)
}

fn exec_sdiff(db: &SingleDb, args: &[Bytes]) -> Reply {
    combine(db, args, SetValue::difference)
}

fn exec_sdiffstore(db: &SingleDb, args: &[Bytes]) -> Reply {
    combine_store(db, args, SetValue::difference)
}

fn store_prepare(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    let write = vec![key_of(&args[0])];
    let read = args[1..].iter().map(key_of).collect();
    (write, read)
}

fn undo_single_key(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let write = CommandFlags { write: true };
    let read = CommandFlags { write: false };

    table.insert("sadd".to_string(), CommandSpec { name: "sadd", arity: -3, flags: write, prepare: single_write, executor: exec_sadd, undo: Some(undo_single_key) });
    table.insert("sismember".to_string(), CommandSpec { name: "sismember", arity: 3, flags: read, prepare: single_read, executor: exec_sismember, undo: None });
    table.insert("srem".to_string(), CommandSpec { name: "srem", arity: -3, flags: write, prepare: single_write, executor: exec_srem, undo: Some(undo_single_key) });
    table.insert("spop".to_string(), CommandSpec { name: "spop", arity: -2, flags: write, prepare: single_write, executor: exec_spop, undo: Some(undo_single_key) });
    table.insert("scard".to_string(), CommandSpec { name: "scard", arity: 2, flags: read, prepare: single_read, executor: exec_scard, undo: None });
    table.insert("smembers".to_string(), CommandSpec { name: "smembers", arity: 2, flags: read, prepare: single_read, executor: exec_smembers, undo: None });
    table.insert("sinter".to_string(), CommandSpec { name: "sinter", arity: -2, flags: read, prepare: all_read, executor: exec_sinter, undo: None });
    table.insert("sinterstore".to_string(), CommandSpec { name: "sinterstore", arity: -3, flags: write, prepare: store_prepare, executor: exec_sinterstore, undo: Some(undo_single_key) });
    table.insert("sunion".to_string(), CommandSpec { name: "sunion", arity: -2, flags: read, prepare: all_read, executor: exec_sunion, undo: None });
    table.insert("sunionstore".to_string(), CommandSpec { name: "sunionstore", arity: -3, flags: write, prepare: store_prepare, executor: exec_sunionstore, undo: Some(undo_single_key) });
    table.insert("sdiff".to_string(), CommandSpec { name: "sdiff", arity: -2, flags: read, prepare: all_read, executor: exec_sdiff, undo: None });
    table.insert("sdiffstore".to_string(), CommandSpec { name: "sdiffstore", arity: -3, flags: write, prepare: store_prepare, executor: exec_sdiffstore, undo: Some(undo_single_key) });
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
    fn sadd_dedupes() {
        let db = test_db();
        assert_eq!(exec_sadd(&db, &[Bytes::from_static(b"s"), Bytes::from_static(b"a"), Bytes::from_static(b"a")]), Reply::integer(1));
        assert_eq!(exec_scard(&db, &[Bytes::from_static(b"s")]), Reply::integer(1));
    }

    #[test]
    fn srem_removes_key_when_empty() {
        let db = test_db();
        exec_sadd(&db, &[Bytes::from_static(b"s"), Bytes::from_static(b"a")]);
        assert_eq!(exec_srem(&db, &[Bytes::from_static(b"s"), Bytes::from_static(b"a")]), Reply::integer(1));
        assert!(db.get_entity("s").is_none());
    }

    #[test]
    fn sinterstore_writes_the_intersection() {
        let db = test_db();
        exec_sadd(&db, &[Bytes::from_static(b"a"), Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
        exec_sadd(&db, &[Bytes::from_static(b"b"), Bytes::from_static(b"y"), Bytes::from_static(b"z")]);
        let r = exec_sinterstore(&db, &[Bytes::from_static(b"dst"), Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(r, Reply::integer(1));
        assert_eq!(exec_scard(&db, &[Bytes::from_static(b"dst")]), Reply::integer(1));
    }

    #[test]
    fn spop_without_count_returns_bare_bulk() {
        let db = test_db();
        exec_sadd(&db, &[Bytes::from_static(b"s"), Bytes::from_static(b"only")]);
        assert_eq!(exec_spop(&db, &[Bytes::from_static(b"s")]), Reply::bulk(b"only".to_vec()));
    }

    #[test]
    fn wrongtype_on_non_set() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        assert_eq!(exec_scard(&db, &[Bytes::from_static(b"k")]), Reply::error(ServerError::WrongType));
    }
}
