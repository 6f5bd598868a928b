//! Hash commands: `HSET`, `HSETNX`, `HGET`, `HEXISTS`, `HDEL`, `HLEN`,
//! `HMGET`, `HKEYS`, `HVALS`, `HGETALL`, `HINCRBY`.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};
use kv_types::{Entity, HashValue};

use super::keys::restore_key;
use super::util::{bytes_to_string, key_of, parse_i64, single_read, single_write};
use crate::db::SingleDb;
use crate::registry::{CommandFlags, CommandSpec};

fn with_hash_mut<R>(db: &SingleDb, key: &str, f: impl FnOnce(&mut HashValue) -> R) -> Result<R, Reply> {
    let result = db.mutate_entity(key, |entry| match entry {
        None => {
            let mut h = HashValue::new();
            let r = f(&mut h);
            Ok((r, Some(Entity::Hash(h))))
        }
        Some(Entity::Hash(h)) => {
            let r = f(h);
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

fn exec_hset(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    if args.len() < 3 || (args.len() - 1) % 2 != 0 {
        return Reply::error(ServerError::ArgNum("hset".to_string()));
    }
    let pairs = &args[1..];
    let result = with_hash_mut(db, &key, |h| {
        let mut created = 0;
        for pair in pairs.chunks(2) {
            if h.set(bytes_to_string(&pair[0]), pair[1].to_vec()) {
                created += 1;
            }
        }
        created
    });
    match result {
        Ok(created) => Reply::integer(created),
        Err(r) => r,
    }
}

fn exec_hsetnx(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let field = bytes_to_string(&args[1]);
    let result = with_hash_mut(db, &key, |h| h.set_if_absent(field.clone(), args[2].to_vec()));
    match result {
        Ok(true) => Reply::integer(1),
        Ok(false) => Reply::integer(0),
        Err(r) => r,
    }
}

fn exec_hget(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::null_bulk(),
        Some(Entity::Hash(h)) => match h.get(&bytes_to_string(&args[1])) {
            Some(v) => Reply::bulk(v.to_vec()),
            None => Reply::null_bulk(),
        },
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hexists(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::Hash(h)) => Reply::integer(if h.contains(&bytes_to_string(&args[1])) { 1 } else { 0 }),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hdel(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let fields: Vec<String> = args[1..].iter().map(bytes_to_string).collect();
    let result = with_hash_mut(db, &key, |h| {
        let removed = fields.iter().filter(|f| h.remove(f)).count();
        (removed, h.is_empty())
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

fn exec_hlen(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::integer(0),
        Some(Entity::Hash(h)) => Reply::integer(h.len() as i64),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hmget(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::array(args[1..].iter().map(|_| Reply::null_bulk()).collect()),
        Some(Entity::Hash(h)) => Reply::array(
            args[1..]
                .iter()
                .map(|f| match h.get(&bytes_to_string(f)) {
                    Some(v) => Reply::bulk(v.to_vec()),
                    None => Reply::null_bulk(),
                })
                .collect(),
        ),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hkeys(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::Hash(h)) => Reply::array(h.keys().into_iter().map(|k| Reply::bulk(k.into_bytes())).collect()),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hvals(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::Hash(h)) => Reply::array(h.values().into_iter().map(Reply::bulk).collect()),
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hgetall(db: &SingleDb, args: &[Bytes]) -> Reply {
    match db.get_entity(&key_of(&args[0])) {
        None => Reply::empty_array(),
        Some(Entity::Hash(h)) => {
            let mut items = Vec::with_capacity(h.len() * 2);
            for (f, v) in h.entries() {
                items.push(Reply::bulk(f.as_bytes().to_vec()));
                items.push(Reply::bulk(v.clone()));
            }
            Reply::array(items)
        }
        Some(_) => Reply::error(ServerError::WrongType),
    }
}

fn exec_hincrby(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let field = bytes_to_string(&args[1]);
    let Ok(delta) = parse_i64(&args[2]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    let result = with_hash_mut(db, &key, |h| {
        let current = match h.get(&field) {
            None => 0,
            Some(raw) => match String::from_utf8_lossy(raw).parse::<i64>() {
                Ok(n) => n,
                Err(_) => return Err(ServerError::Range("hash value is not an integer".to_string())),
            },
        };
        let Some(next) = current.checked_add(delta) else {
            return Err(ServerError::Range("increment or decrement would overflow".to_string()));
        };
        h.set(field.clone(), next.to_string().into_bytes());
        Ok(next)
    });
    match result {
        Ok(Ok(n)) => Reply::integer(n),
        Ok(Err(e)) | Err(Reply::Error(e)) => Reply::error(e),
        Err(r) => r,
    }
}

fn undo_single_key(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let write = CommandFlags { write: true };
    let read = CommandFlags { write: false };

    table.insert("hset".to_string(), CommandSpec { name: "hset", arity: -4, flags: write, prepare: single_write, executor: exec_hset, undo: Some(undo_single_key) });
    table.insert("hsetnx".to_string(), CommandSpec { name: "hsetnx", arity: 4, flags: write, prepare: single_write, executor: exec_hsetnx, undo: Some(undo_single_key) });
    table.insert("hget".to_string(), CommandSpec { name: "hget", arity: 3, flags: read, prepare: single_read, executor: exec_hget, undo: None });
    table.insert("hexists".to_string(), CommandSpec { name: "hexists", arity: 3, flags: read, prepare: single_read, executor: exec_hexists, undo: None });
    table.insert("hdel".to_string(), CommandSpec { name: "hdel", arity: -3, flags: write, prepare: single_write, executor: exec_hdel, undo: Some(undo_single_key) });
    table.insert("hlen".to_string(), CommandSpec { name: "hlen", arity: 2, flags: read, prepare: single_read, executor: exec_hlen, undo: None });
    table.insert("hmget".to_string(), CommandSpec { name: "hmget", arity: -3, flags: read, prepare: single_read, executor: exec_hmget, undo: None });
    table.insert("hkeys".to_string(), CommandSpec { name: "hkeys", arity: 2, flags: read, prepare: single_read, executor: exec_hkeys, undo: None });
    table.insert("hvals".to_string(), CommandSpec { name: "hvals", arity: 2, flags: read, prepare: single_read, executor: exec_hvals, undo: None });
    table.insert("hgetall".to_string(), CommandSpec { name: "hgetall", arity: 2, flags: read, prepare: single_read, executor: exec_hgetall, undo: None });
    table.insert("hincrby".to_string(), CommandSpec { name: "hincrby", arity: 4, flags: write, prepare: single_write, executor: exec_hincrby, undo: Some(undo_single_key) });
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
    fn hset_counts_new_fields_only() {
        let db = test_db();
        assert_eq!(exec_hset(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"a"), Bytes::from_static(b"1")]), Reply::integer(1));
        assert_eq!(exec_hset(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"a"), Bytes::from_static(b"2")]), Reply::integer(0));
        assert_eq!(exec_hget(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"a")]), Reply::bulk(b"2".to_vec()));
    }

    #[test]
    fn hdel_removes_key_when_last_field_goes() {
        let db = test_db();
        exec_hset(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"a"), Bytes::from_static(b"1")]);
        assert_eq!(exec_hdel(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"a")]), Reply::integer(1));
        assert!(db.get_entity("h").is_none());
    }

    #[test]
    fn hincrby_tracks_integer_values() {
        let db = test_db();
        exec_hincrby(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"n"), Bytes::from_static(b"5")]);
        assert_eq!(exec_hincrby(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"n"), Bytes::from_static(b"3")]), Reply::integer(8));
    }

    #[test]
    fn hgetall_returns_flattened_pairs() {
        let db = test_db();
        exec_hset(&db, &[Bytes::from_static(b"h"), Bytes::from_static(b"a"), Bytes::from_static(b"1")]);
        let Reply::Array(Some(items)) = exec_hgetall(&db, &[Bytes::from_static(b"h")]) else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn wrongtype_on_non_hash() {
        let db = test_db();
        db.put_entity("k", Entity::Str(b"v".to_vec()));
        assert_eq!(exec_hget(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"f")]), Reply::error(ServerError::WrongType));
    }
}
