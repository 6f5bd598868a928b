//! String commands: `GET`, `SET [NX|XX] [EX|PX n]`, `SETNX`, `SETEX`,
//! `GETSET`, `GETDEL`, `MSET`, `MGET`, `INCR`, `INCRBY`, `DECR`,
//! `DECRBY`, `STRLEN`, `APPEND`.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};
use kv_types::Entity;

use super::keys::restore_key;
use super::util::{all_read, cmd_line, key_of, parse_i64, single_read, single_write};
use crate::db::{now_millis, SingleDb};
use crate::registry::{CommandFlags, CommandSpec};

fn as_str_or_wrongtype(entity: &Entity) -> Result<&[u8], Reply> {
    entity.as_str().ok_or_else(|| Reply::error(ServerError::WrongType))
}

fn exec_get(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    match db.get_entity(&key) {
        None => Reply::null_bulk(),
        Some(e) => match as_str_or_wrongtype(&e) {
            Ok(v) => Reply::bulk(v.to_vec()),
            Err(r) => r,
        },
    }
}

struct SetOpts {
    nx: bool,
    xx: bool,
    expire_at_millis: Option<i64>,
}

fn parse_set_opts(args: &[Bytes]) -> Result<SetOpts, ServerError> {
    let mut opts = SetOpts { nx: false, xx: false, expire_at_millis: None };
    let mut i = 2;
    while i < args.len() {
        let flag = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match flag.as_str() {
            "NX" => {
                if opts.xx {
                    return Err(ServerError::Syntax);
                }
                opts.nx = true;
                i += 1;
            }
            "XX" => {
                if opts.nx {
                    return Err(ServerError::Syntax);
                }
                opts.xx = true;
                i += 1;
            }
            "EX" | "PX" => {
                let Some(raw) = args.get(i + 1) else {
                    return Err(ServerError::Syntax);
                };
                let n = parse_i64(raw)?;
                opts.expire_at_millis = Some(if flag == "EX" { now_millis() + n * 1000 } else { now_millis() + n });
                i += 2;
            }
            _ => return Err(ServerError::Syntax),
        }
    }
    Ok(opts)
}

fn exec_set(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let opts = match parse_set_opts(args) {
        Ok(o) => o,
        Err(e) => return Reply::error(e),
    };
    let exists = db.get_entity(&key).is_some();
    if (opts.nx && exists) || (opts.xx && !exists) {
        return Reply::null_bulk();
    }
    db.put_entity(key.clone(), Entity::Str(args[1].to_vec()));
    match opts.expire_at_millis {
        Some(at) => db.set_ttl_and_schedule(&key, at),
        None => {
            db.persist(&key);
        }
    }
    Reply::ok()
}

fn exec_setnx(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let created = db.put_if_absent(key, Entity::Str(args[1].to_vec()));
    Reply::integer(if created { 1 } else { 0 })
}

fn exec_setex(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(secs) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    if secs <= 0 {
        return Reply::error(ServerError::Range("invalid expire time in 'setex' command".to_string()));
    }
    db.put_entity(key.clone(), Entity::Str(args[2].to_vec()));
    db.set_ttl_and_schedule(&key, now_millis() + secs * 1000);
    Reply::ok()
}

fn exec_getset(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let prior = db.get_entity(&key);
    db.put_entity(key.clone(), Entity::Str(args[1].to_vec()));
    db.persist(&key);
    match prior {
        None => Reply::null_bulk(),
        Some(e) => match as_str_or_wrongtype(&e) {
            Ok(v) => Reply::bulk(v.to_vec()),
            Err(r) => r,
        },
    }
}

fn exec_getdel(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    match db.get_entity(&key) {
        None => Reply::null_bulk(),
        Some(e) => match as_str_or_wrongtype(&e) {
            Ok(v) => {
                let v = v.to_vec();
                db.remove(&key);
                Reply::bulk(v)
            }
            Err(r) => r,
        },
    }
}

fn mset_prepare(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().step_by(2).map(key_of).collect(), vec![])
}

fn exec_mset(db: &SingleDb, args: &[Bytes]) -> Reply {
    if args.len() % 2 != 0 {
        return Reply::error(ServerError::ArgNum("mset".to_string()));
    }
    for pair in args.chunks(2) {
        db.put_entity(key_of(&pair[0]), Entity::Str(pair[1].to_vec()));
        db.persist(&key_of(&pair[0]));
    }
    Reply::ok()
}

fn undo_mset(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    args.chunks(2).flat_map(|pair| restore_key(db, &key_of(&pair[0]))).collect()
}

fn exec_mget(db: &SingleDb, args: &[Bytes]) -> Reply {
    let items = args
        .iter()
        .map(|k| match db.get_entity(&key_of(k)) {
            Some(e) => match e.as_str() {
                Some(v) => Reply::bulk(v.to_vec()),
                None => Reply::null_bulk(),
            },
            None => Reply::null_bulk(),
        })
        .collect();
    Reply::array(items)
}

fn incr_by(db: &SingleDb, key: &str, delta: i64) -> Result<i64, Reply> {
    let current = match db.get_entity(key) {
        None => 0,
        Some(e) => {
            let raw = e.as_str().ok_or_else(|| Reply::error(ServerError::WrongType))?;
            String::from_utf8_lossy(raw)
                .parse::<i64>()
                .map_err(|_| Reply::error(ServerError::Range("value is not an integer or out of range".to_string())))?
        }
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| Reply::error(ServerError::Range("increment or decrement would overflow".to_string())))?;
    db.put_entity(key.to_string(), Entity::Str(next.to_string().into_bytes()));
    Ok(next)
}

fn exec_incr(db: &SingleDb, args: &[Bytes]) -> Reply {
    match incr_by(db, &key_of(&args[0]), 1) {
        Ok(n) => Reply::integer(n),
        Err(r) => r,
    }
}

fn exec_incrby(db: &SingleDb, args: &[Bytes]) -> Reply {
    let Ok(delta) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    match incr_by(db, &key_of(&args[0]), delta) {
        Ok(n) => Reply::integer(n),
        Err(r) => r,
    }
}

fn exec_decr(db: &SingleDb, args: &[Bytes]) -> Reply {
    match incr_by(db, &key_of(&args[0]), -1) {
        Ok(n) => Reply::integer(n),
        Err(r) => r,
    }
}

fn exec_decrby(db: &SingleDb, args: &[Bytes]) -> Reply {
    let Ok(delta) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    match incr_by(db, &key_of(&args[0]), -delta) {
        Ok(n) => Reply::integer(n),
        Err(r) => r,
    }
}

fn exec_strlen(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    match db.get_entity(&key) {
        None => Reply::integer(0),
        Some(e) => match as_str_or_wrongtype(&e) {
            Ok(v) => Reply::integer(v.len() as i64),
            Err(r) => r,
        },
    }
}

fn exec_append(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    let new_len = match db.get_entity(&key) {
        None => {
            db.put_entity(key.clone(), Entity::Str(args[1].to_vec()));
            args[1].len()
        }
        Some(e) => match &e {
            Entity::Str(existing) => {
                let mut v = existing.clone();
                v.extend_from_slice(&args[1]);
                let len = v.len();
                db.put_entity(key.clone(), Entity::Str(v));
                len
            }
            _ => return Reply::error(ServerError::WrongType),
        },
    };
    Reply::integer(new_len as i64)
}

fn undo_single_key(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let write = CommandFlags { write: true };
    let read = CommandFlags { write: false };

    table.insert("get".to_string(), CommandSpec { name: "get", arity: 2, flags: read, prepare: single_read, executor: exec_get, undo: None });
    table.insert("set".to_string(), CommandSpec { name: "set", arity: -3, flags: write, prepare: single_write, executor: exec_set, undo: Some(undo_single_key) });
    table.insert("setnx".to_string(), CommandSpec { name: "setnx", arity: 3, flags: write, prepare: single_write, executor: exec_setnx, undo: Some(undo_single_key) });
    table.insert("setex".to_string(), CommandSpec { name: "setex", arity: 4, flags: write, prepare: single_write, executor: exec_setex, undo: Some(undo_single_key) });
    table.insert("getset".to_string(), CommandSpec { name: "getset", arity: 3, flags: write, prepare: single_write, executor: exec_getset, undo: Some(undo_single_key) });
    table.insert("getdel".to_string(), CommandSpec { name: "getdel", arity: 2, flags: write, prepare: single_write, executor: exec_getdel, undo: Some(undo_single_key) });
    table.insert("mset".to_string(), CommandSpec { name: "mset", arity: -3, flags: write, prepare: mset_prepare, executor: exec_mset, undo: Some(undo_mset) });
    table.insert("mget".to_string(), CommandSpec { name: "mget", arity: -2, flags: read, prepare: all_read, executor: exec_mget, undo: None });
    table.insert("incr".to_string(), CommandSpec { name: "incr", arity: 2, flags: write, prepare: single_write, executor: exec_incr, undo: Some(undo_single_key) });
    table.insert("incrby".to_string(), CommandSpec { name: "incrby", arity: 3, flags: write, prepare: single_write, executor: exec_incrby, undo: Some(undo_single_key) });
    table.insert("decr".to_string(), CommandSpec { name: "decr", arity: 2, flags: write, prepare: single_write, executor: exec_decr, undo: Some(undo_single_key) });
    table.insert("decrby".to_string(), CommandSpec { name: "decrby", arity: 3, flags: write, prepare: single_write, executor: exec_decrby, undo: Some(undo_single_key) });
    table.insert("strlen".to_string(), CommandSpec { name: "strlen", arity: 2, flags: read, prepare: single_read, executor: exec_strlen, undo: None });
    table.insert("append".to_string(), CommandSpec { name: "append", arity: 3, flags: write, prepare: single_write, executor: exec_append, undo: Some(undo_single_key) });
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
    fn set_then_get_round_trips() {
        let db = test_db();
        assert_eq!(exec_set(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"v")]), Reply::ok());
        assert_eq!(exec_get(&db, &[Bytes::from_static(b"k")]), Reply::bulk(b"v".to_vec()));
    }

    #[test]
    fn set_nx_refuses_when_present() {
        let db = test_db();
        exec_set(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"v")]);
        let r = exec_set(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"v2"), Bytes::from_static(b"NX")]);
        assert_eq!(r, Reply::null_bulk());
        assert_eq!(exec_get(&db, &[Bytes::from_static(b"k")]), Reply::bulk(b"v".to_vec()));
    }

    #[test]
    fn set_ex_schedules_ttl() {
        let db = test_db();
        exec_set(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"v"), Bytes::from_static(b"EX"), Bytes::from_static(b"100")]);
        assert!(db.ttl_millis("k").is_some());
    }

    #[test]
    fn incr_on_absent_key_starts_at_zero() {
        let db = test_db();
        assert_eq!(exec_incr(&db, &[Bytes::from_static(b"counter")]), Reply::integer(1));
        assert_eq!(exec_incrby(&db, &[Bytes::from_static(b"counter"), Bytes::from_static(b"4")]), Reply::integer(5));
    }

    #[test]
    fn incr_on_non_integer_is_a_range_error() {
        let db = test_db();
        exec_set(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"notanumber")]);
        assert!(exec_incr(&db, &[Bytes::from_static(b"k")]).is_error());
    }

    #[test]
    fn wrongtype_on_non_string() {
        let db = test_db();
        db.put_entity("k", Entity::List(Default::default()));
        assert_eq!(exec_get(&db, &[Bytes::from_static(b"k")]), Reply::error(ServerError::WrongType));
    }

    #[test]
    fn append_creates_and_extends() {
        let db = test_db();
        assert_eq!(exec_append(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"ab")]), Reply::integer(2));
        assert_eq!(exec_append(&db, &[Bytes::from_static(b"k"), Bytes::from_static(b"cd")]), Reply::integer(4));
        assert_eq!(exec_get(&db, &[Bytes::from_static(b"k")]), Reply::bulk(b"abcd".to_vec()));
    }

    #[test]
    fn mset_and_mget() {
        let db = test_db();
        exec_mset(&db, &[Bytes::from_static(b"a"), Bytes::from_static(b"1"), Bytes::from_static(b"b"), Bytes::from_static(b"2")]);
        assert_eq!(
            exec_mget(&db, &[Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"missing")]),
            Reply::array(vec![Reply::bulk(b"1".to_vec()), Reply::bulk(b"2".to_vec()), Reply::null_bulk()])
        );
    }
}
