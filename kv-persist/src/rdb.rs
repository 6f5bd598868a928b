//! RDB snapshot emission and loading (§4.8 "RDB emission", §6 "RDB file
//! format"), ported from the opcode sequence `original_source/aof/rdb.go`
//! drives through the `github.com/hdt3213/rdb` encoder.
//!
//! This crate has no dependency on that third-party encoder; it is a
//! from-scratch binary writer/reader for exactly the opcode subset this
//! engine's five value types need, checksummed with the same CRC-64
//! variant (see [`crate::crc64`]) real Redis RDB files use. It is not a
//! general-purpose reader for third-party RDB files — only for what
//! [`save_rdb`] itself produced.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use kv_engine::MultiDb;
use kv_types::Entity;

use crate::crc64;

const MAGIC: &[u8] = b"REDIS";
const VERSION: &[u8] = b"0011";

const OP_AUX: u8 = 0xFA;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_SELECTDB: u8 = 0xFE;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_HASH: u8 = 2;
const TYPE_SET: u8 = 3;
const TYPE_ZSET: u8 = 4;

fn write_len(buf: &mut Vec<u8>, len: usize) {
    if len < 254 {
        buf.push(len as u8);
    } else {
        buf.push(254);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
    }
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_len(buf, data.len());
    buf.extend_from_slice(data);
}

fn write_object(buf: &mut Vec<u8>, entity: &Entity) {
    match entity {
        Entity::Str(s) => {
            buf.push(TYPE_STRING);
            write_bytes(buf, s);
        }
        Entity::List(list) => {
            buf.push(TYPE_LIST);
            let items = list.range(0, list.len());
            write_len(buf, items.len());
            for item in items {
                write_bytes(buf, &item);
            }
        }
        Entity::Hash(hash) => {
            buf.push(TYPE_HASH);
            write_len(buf, hash.len());
            for (field, value) in hash.entries() {
                write_bytes(buf, field.as_bytes());
                write_bytes(buf, value);
            }
        }
        Entity::Set(set) => {
            buf.push(TYPE_SET);
            let members = set.members();
            write_len(buf, members.len());
            for member in members {
                write_bytes(buf, &member);
            }
        }
        Entity::SortedSet(zset) => {
            buf.push(TYPE_ZSET);
            let len = zset.len() as i64;
            let elements = if len == 0 { Vec::new() } else { zset.range_by_rank(0, len - 1, false) };
            write_len(buf, elements.len());
            for el in elements {
                write_bytes(buf, el.member.as_bytes());
                buf.extend_from_slice(&el.score.to_le_bytes());
            }
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_secs()
}

/// Serialize every database's keyspace to `path` (§4.8 "RDB emission").
/// Callers that need the pause-then-replay-then-atomic-rename protocol
/// (`SAVE`/`BGSAVE`) build on top of this through [`crate::AofHandler`];
/// this function only knows how to turn a [`MultiDb`] snapshot into
/// bytes.
pub fn save_rdb(multidb: &MultiDb, path: &Path) -> io::Result<()> {
    let buf = save_rdb_bytes(multidb);
    let tmp_path = path.with_extension("rdb.tmp");
    std::fs::write(&tmp_path, &buf)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Serialize every database's keyspace to an in-memory buffer — the same
/// format [`save_rdb`] writes to disk, used by the replication master
/// side to ship a full-resync snapshot as a RESP bulk payload without a
/// round trip through the filesystem (§4.9 handshake step 7).
pub fn save_rdb_bytes(multidb: &MultiDb) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(VERSION);

    let aux: &[(&str, String)] = &[
        ("redis-ver", "6.0.0".to_string()),
        ("redis-bits", "64".to_string()),
        ("aof-preamble", "0".to_string()),
        ("ctime", now_unix_secs().to_string()),
    ];
    for (k, v) in aux {
        buf.push(OP_AUX);
        write_bytes(&mut buf, k.as_bytes());
        write_bytes(&mut buf, v.as_bytes());
    }

    for i in 0..multidb.num_databases() {
        let Some(db) = multidb.database(i) else { continue };
        let mut entries: Vec<(String, Entity, Option<i64>)> = Vec::new();
        db.for_each(|key, entity| {
            entries.push((key.to_string(), entity.clone(), db.ttl_millis(key)));
            true
        });
        if entries.is_empty() {
            continue;
        }
        let ttl_count = entries.iter().filter(|(_, _, ttl)| ttl.is_some()).count();
        buf.push(OP_SELECTDB);
        write_len(&mut buf, i);
        buf.push(OP_RESIZEDB);
        write_len(&mut buf, entries.len());
        write_len(&mut buf, ttl_count);
        for (key, entity, ttl) in &entries {
            if let Some(at_millis) = ttl {
                buf.push(OP_EXPIRETIME_MS);
                buf.extend_from_slice(&(*at_millis as u64).to_le_bytes());
            }
            write_bytes(&mut buf, key.as_bytes());
            write_object(&mut buf, entity);
        }
    }

    buf.push(OP_EOF);
    let checksum = crc64::checksum(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// One key loaded from an RDB file, handed back to the caller so it can
/// apply it into whichever [`kv_engine::SingleDb`] it chooses (a fresh
/// engine at startup, or the live engine's replacement DBs during a full
/// resync — see `kv-replication`).
pub struct LoadedKey {
    pub key: String,
    pub entity: Entity,
    pub expire_at_millis: Option<i64>,
}

/// One database's worth of loaded keys.
pub struct LoadedDb {
    pub index: usize,
    pub keys: Vec<LoadedKey>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> io::Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(eof)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(eof());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn len_prefixed(&mut self) -> io::Result<usize> {
        let first = self.byte()?;
        if first < 254 {
            Ok(first as usize)
        } else {
            let bytes = self.take(4)?;
            Ok(u32::from_le_bytes(bytes.try_into().unwrap()) as usize)
        }
    }

    fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.len_prefixed()?;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> io::Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn u64_le(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64_le(&mut self) -> io::Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated RDB file")
}

fn bad(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_object(r: &mut Reader<'_>) -> io::Result<Entity> {
    let tag = r.byte()?;
    match tag {
        TYPE_STRING => Ok(Entity::Str(r.bytes()?)),
        TYPE_LIST => {
            let count = r.len_prefixed()?;
            let mut list = kv_types::SegmentedList::new();
            for _ in 0..count {
                list.push_back(r.bytes()?);
            }
            Ok(Entity::List(list))
        }
        TYPE_HASH => {
            let count = r.len_prefixed()?;
            let mut hash = kv_types::HashValue::new();
            for _ in 0..count {
                let field = r.string()?;
                let value = r.bytes()?;
                hash.set(field, value);
            }
            Ok(Entity::Hash(hash))
        }
        TYPE_SET => {
            let count = r.len_prefixed()?;
            let mut set = kv_types::SetValue::new();
            for _ in 0..count {
                set.add(r.bytes()?);
            }
            Ok(Entity::Set(set))
        }
        TYPE_ZSET => {
            let count = r.len_prefixed()?;
            let mut zset = kv_types::SortedSet::new();
            for _ in 0..count {
                let member = r.string()?;
                let score = r.f64_le()?;
                zset.add(member, score);
            }
            Ok(Entity::SortedSet(zset))
        }
        other => Err(bad(format!("unknown RDB object type tag {other}"))),
    }
}

/// Parse an RDB file produced by [`save_rdb`] back into per-database key
/// lists (§8 invariant 6, "RDB round-trip").
pub fn load_rdb(path: &Path) -> io::Result<Vec<LoadedDb>> {
    let mut file = std::fs::File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    load_rdb_bytes(&contents)
}

/// Parse an in-memory RDB buffer produced by [`save_rdb_bytes`] — the
/// replication slave side decodes a full-resync bulk payload this way
/// without ever touching the filesystem (§4.9 handshake step 7).
pub fn load_rdb_bytes(contents: &[u8]) -> io::Result<Vec<LoadedDb>> {
    if contents.len() < 8 {
        return Err(bad("file too short to contain a CRC64 trailer"));
    }
    let (body, trailer) = contents.split_at(contents.len() - 8);
    let expected = u64::from_le_bytes(trailer.try_into().unwrap());
    let actual = crc64::checksum(body);
    if expected != actual {
        return Err(bad("RDB checksum mismatch"));
    }

    let mut r = Reader { buf: body, pos: 0 };
    if r.take(MAGIC.len())? != MAGIC {
        return Err(bad("missing REDIS magic header"));
    }
    r.take(VERSION.len())?;

    let mut dbs: Vec<LoadedDb> = Vec::new();
    let mut current: Option<LoadedDb> = None;
    loop {
        let Ok(op) = r.byte() else { break };
        match op {
            OP_EOF => break,
            OP_AUX => {
                r.bytes()?;
                r.bytes()?;
            }
            OP_SELECTDB => {
                if let Some(db) = current.take() {
                    dbs.push(db);
                }
                let index = r.len_prefixed()?;
                current = Some(LoadedDb { index, keys: Vec::new() });
            }
            OP_RESIZEDB => {
                r.len_prefixed()?;
                r.len_prefixed()?;
            }
            OP_EXPIRETIME_MS => {
                let at = r.u64_le()? as i64;
                let key = r.string()?;
                let entity = read_object(&mut r)?;
                let db = current.as_mut().ok_or_else(|| bad("key before SELECTDB"))?;
                db.keys.push(LoadedKey { key, entity, expire_at_millis: Some(at) });
            }
            other => {
                // No opcode byte: `other` is the first byte of a bare key (a length prefix or
                // the 254/4-byte-length escape), not a recognized control opcode.
                let key = read_bare_key(&mut r, other)?;
                let entity = read_object(&mut r)?;
                let db = current.as_mut().ok_or_else(|| bad("key before SELECTDB"))?;
                db.keys.push(LoadedKey { key, entity, expire_at_millis: None });
            }
        }
    }
    if let Some(db) = current.take() {
        dbs.push(db);
    }
    Ok(dbs)
}

/// A key without a preceding `EXPIRETIME_MS` opcode starts directly with
/// its length-prefixed bytes; `first` is the length byte already
/// consumed by the main dispatch loop.
fn read_bare_key(r: &mut Reader<'_>, first: u8) -> io::Result<String> {
    let len = if first < 254 {
        first as usize
    } else {
        u32::from_le_bytes(r.take(4)?.try_into().unwrap()) as usize
    };
    let bytes = r.take(len)?.to_vec();
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_engine::MultiDb;
    use kv_store::TimeWheel;
    use kv_engine::db::NoopAofSink;
    use kv_engine::registry::Registry;
    use std::sync::Arc;

    fn test_multidb() -> Arc<MultiDb> {
        MultiDb::new(2, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()), None)
    }

    #[test]
    fn round_trips_all_five_value_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        let server = test_multidb();
        let db0 = server.database(0).unwrap();
        db0.put_entity("str", Entity::Str(b"hello".to_vec()));
        db0.set_ttl_and_schedule("str", kv_engine::db::now_millis() + 60_000);

        let mut list = kv_types::SegmentedList::new();
        list.push_back(b"a".to_vec());
        list.push_back(b"b".to_vec());
        db0.put_entity("list", Entity::List(list));

        let mut hash = kv_types::HashValue::new();
        hash.set("f1", b"v1".to_vec());
        db0.put_entity("hash", Entity::Hash(hash));

        let mut set = kv_types::SetValue::new();
        set.add(b"m1".to_vec());
        set.add(b"m2".to_vec());
        db0.put_entity("set", Entity::Set(set));

        let mut zset = kv_types::SortedSet::new();
        zset.add("alice", 1.0);
        zset.add("bob", 2.0);
        db0.put_entity("zset", Entity::SortedSet(zset));

        save_rdb(&server, &path).unwrap();
        let loaded = load_rdb(&path).unwrap();

        let db0_loaded = loaded.iter().find(|d| d.index == 0).expect("db0 present");
        assert_eq!(db0_loaded.keys.len(), 5);

        let str_key = db0_loaded.keys.iter().find(|k| k.key == "str").unwrap();
        assert_eq!(str_key.entity.as_str(), Some(b"hello".as_slice()));
        assert!(str_key.expire_at_millis.is_some());

        let zset_key = db0_loaded.keys.iter().find(|k| k.key == "zset").unwrap();
        assert_eq!(zset_key.entity.as_sorted_set().unwrap().score("bob"), Some(2.0));
    }

    #[test]
    fn empty_databases_are_skipped_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let server = test_multidb();
        save_rdb(&server, &path).unwrap();
        let loaded = load_rdb(&path).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn tampered_file_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        let server = test_multidb();
        server.database(0).unwrap().put_entity("k", Entity::Str(b"v".to_vec()));
        save_rdb(&server, &path).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(load_rdb(&path).is_err());
    }
}
