//! Key-space commands: `DEL`, `EXISTS`, `EXPIRE`/`PEXPIRE`/`PEXPIREAT`,
//! `TTL`/`PTTL`, `PERSIST`, `TYPE`, `RENAME`/`RENAMENX`, `KEYS`.

use std::collections::HashMap;

use bytes::Bytes;
use kv_proto::{CmdLine, Reply, ServerError};

use super::util::{all_write, cmd_line, key_of, parse_i64, single_read, single_write};
use crate::db::{now_millis, SingleDb};
use crate::glob;
use crate::registry::{CommandFlags, CommandSpec};

/// Snapshot a key's current entity and TTL into the command(s) that
/// would recreate it, or a bare `DEL` if it's currently absent. Used as
/// the undo log for every command that mutates exactly this key.
pub fn restore_key(db: &SingleDb, key: &str) -> Vec<CmdLine> {
    let Some(entity) = db.get_entity(key) else {
        return vec![cmd_line(vec![b"DEL".to_vec(), key.as_bytes().to_vec()])];
    };
    let mut cmds = vec![cmd_line(vec![b"DEL".to_vec(), key.as_bytes().to_vec()])];
    use kv_types::Entity;
    match &entity {
        Entity::Str(v) => cmds.push(cmd_line(vec![b"SET".to_vec(), key.as_bytes().to_vec(), v.clone()])),
        Entity::List(l) => {
            let mut parts = vec![b"RPUSH".to_vec(), key.as_bytes().to_vec()];
            for i in 0..l.len() {
                if let Some(v) = l.get(i) {
                    parts.push(v.to_vec());
                }
            }
            if parts.len() > 2 {
                cmds.push(cmd_line(parts));
            }
        }
        Entity::Hash(h) => {
            let mut parts = vec![b"HSET".to_vec(), key.as_bytes().to_vec()];
            for (f, v) in h.entries() {
                parts.push(f.as_bytes().to_vec());
                parts.push(v.clone());
            }
            if parts.len() > 2 {
                cmds.push(cmd_line(parts));
            }
        }
        Entity::Set(s) => {
            let mut parts = vec![b"SADD".to_vec(), key.as_bytes().to_vec()];
            for m in s.members() {
                parts.push(m);
            }
            if parts.len() > 2 {
                cmds.push(cmd_line(parts));
            }
        }
        Entity::SortedSet(z) => {
            let mut parts = vec![b"ZADD".to_vec(), key.as_bytes().to_vec()];
            for e in z.range_by_rank(0, z.len() as i64 - 1, false) {
                parts.push(e.score.to_string().into_bytes());
                parts.push(e.member.into_bytes());
            }
            if parts.len() > 2 {
                cmds.push(cmd_line(parts));
            }
        }
    }
    if let Some(exp) = db.ttl_millis(key) {
        cmds.push(cmd_line(vec![b"PEXPIREAT".to_vec(), key.as_bytes().to_vec(), exp.to_string().into_bytes()]));
    }
    cmds
}

fn undo_single_key(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    restore_key(db, &key_of(&args[0]))
}

fn exec_del(db: &SingleDb, args: &[Bytes]) -> Reply {
    let keys: Vec<String> = args.iter().map(key_of).collect();
    Reply::integer(db.removes(&keys) as i64)
}

fn undo_del(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    args.iter().flat_map(|k| restore_key(db, &key_of(k))).collect()
}

fn exec_exists(db: &SingleDb, args: &[Bytes]) -> Reply {
    let count = args.iter().filter(|k| db.get_entity(&key_of(k)).is_some()).count();
    Reply::integer(count as i64)
}

fn expire_at(db: &SingleDb, args: &[Bytes], to_millis: impl Fn(i64) -> i64) -> Reply {
    let key = key_of(&args[0]);
    let Ok(n) = parse_i64(&args[1]) else {
        return Reply::error(ServerError::Range("value is not an integer or out of range".to_string()));
    };
    if db.get_entity(&key).is_none() {
        return Reply::integer(0);
    }
    db_expire_with_wheel(db, &key, to_millis(n));
    Reply::integer(1)
}

fn db_expire_with_wheel(db: &SingleDb, key: &str, at_millis: i64) {
    db.set_ttl_and_schedule(key, at_millis);
}

fn exec_expire(db: &SingleDb, args: &[Bytes]) -> Reply {
    expire_at(db, args, |secs| now_millis() + secs * 1000)
}

fn exec_pexpire(db: &SingleDb, args: &[Bytes]) -> Reply {
    expire_at(db, args, |ms| now_millis() + ms)
}

fn exec_pexpireat(db: &SingleDb, args: &[Bytes]) -> Reply {
    expire_at(db, args, |ms| ms)
}

fn exec_ttl(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    if db.get_entity(&key).is_none() {
        return Reply::integer(-2);
    }
    match db.ttl_millis(&key) {
        None => Reply::integer(-1),
        Some(exp) => Reply::integer(((exp - now_millis()).max(0) + 999) / 1000),
    }
}

fn exec_pttl(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    if db.get_entity(&key).is_none() {
        return Reply::integer(-2);
    }
    match db.ttl_millis(&key) {
        None => Reply::integer(-1),
        Some(exp) => Reply::integer((exp - now_millis()).max(0)),
    }
}

fn exec_persist(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    Reply::integer(if db.persist(&key) { 1 } else { 0 })
}

fn exec_type(db: &SingleDb, args: &[Bytes]) -> Reply {
    let key = key_of(&args[0]);
    match db.get_entity(&key) {
        Some(e) => Reply::Simple(e.type_name().to_string()),
        None => Reply::Simple("none".to_string()),
    }
}

fn rename_prepare(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0]), key_of(&args[1])], vec![])
}

fn exec_rename(db: &SingleDb, args: &[Bytes]) -> Reply {
    let src = key_of(&args[0]);
    let dst = key_of(&args[1]);
    let Some(entity) = db.get_entity(&src) else {
        return Reply::error(ServerError::Other("ERR no such key".to_string()));
    };
    let ttl = db.ttl_millis(&src);
    db.remove(&src);
    db.put_entity(dst.clone(), entity);
    match ttl {
        Some(exp) => db.set_ttl_and_schedule(&dst, exp),
        None => {
            db.persist(&dst);
        }
    }
    Reply::ok()
}

fn undo_rename(db: &SingleDb, args: &[Bytes]) -> Vec<CmdLine> {
    let mut cmds = restore_key(db, &key_of(&args[0]));
    cmds.extend(restore_key(db, &key_of(&args[1])));
    cmds
}

fn exec_renamenx(db: &SingleDb, args: &[Bytes]) -> Reply {
    let dst = key_of(&args[1]);
    if db.get_entity(&dst).is_some() {
        return Reply::integer(0);
    }
    match exec_rename(db, args) {
        Reply::Simple(_) => Reply::integer(1),
        other => other,
    }
}

fn exec_keys(db: &SingleDb, args: &[Bytes]) -> Reply {
    let pattern = key_of(&args[0]);
    let mut matched = Vec::new();
    db.for_each(|k, _| {
        if glob::matches(&pattern, k) {
            matched.push(Reply::bulk(k.as_bytes().to_vec()));
        }
        true
    });
    Reply::array(matched)
}

pub fn register(table: &mut HashMap<String, CommandSpec>) {
    let write = CommandFlags { write: true };
    let read = CommandFlags { write: false };

    table.insert("del".to_string(), CommandSpec { name: "del", arity: -2, flags: write, prepare: all_write, executor: exec_del, undo: Some(undo_del) });
    table.insert("exists".to_string(), CommandSpec { name: "exists", arity: -2, flags: read, prepare: super::util::all_read, executor: exec_exists, undo: None });
    table.insert("expire".to_string(), CommandSpec { name: "expire", arity: 3, flags: write, prepare: single_write, executor: exec_expire, undo: Some(undo_single_key) });
    table.insert("pexpire".to_string(), CommandSpec { name: "pexpire", arity: 3, flags: write, prepare: single_write, executor: exec_pexpire, undo: Some(undo_single_key) });
    table.insert("pexpireat".to_string(), CommandSpec { name: "pexpireat", arity: 3, flags: write, prepare: single_write, executor: exec_pexpireat, undo: Some(undo_single_key) });
    table.insert("ttl".to_string(), CommandSpec { name: "ttl", arity: 2, flags: read, prepare: single_read, executor: exec_ttl, undo: None });
    table.insert("pttl".to_string(), CommandSpec { name: "pttl", arity: 2, flags: read, prepare: single_read, executor: exec_pttl, undo: None });
    table.insert("persist".to_string(), CommandSpec { name: "persist", arity: 2, flags: write, prepare: single_write, executor: exec_persist, undo: Some(undo_single_key) });
    table.insert("type".to_string(), CommandSpec { name: "type", arity: 2, flags: read, prepare: single_read, executor: exec_type, undo: None });
    table.insert("rename".to_string(), CommandSpec { name: "rename", arity: 3, flags: write, prepare: rename_prepare, executor: exec_rename, undo: Some(undo_rename) });
    table.insert("renamenx".to_string(), CommandSpec { name: "renamenx", arity: 3, flags: write, prepare: rename_prepare, executor: exec_renamenx, undo: Some(undo_rename) });
    table.insert("keys".to_string(), CommandSpec { name: "keys", arity: 2, flags: read, prepare: |_| (vec![], vec![]), executor: exec_keys, undo: None });
}
