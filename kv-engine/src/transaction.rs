//! `EXEC`'s body (C6, §4.6): batch-lock every key the queued commands
//! touch, abort on a watch mismatch, run the queue under the held
//! locks, and unwind via undo logs if any command in the queue errors.

use std::sync::Arc;

use kv_proto::{CmdLine, Reply, ServerError};

use crate::conn::{ConnState, MultiState};
use crate::db::SingleDb;

fn ascii_lowercase(b: &bytes::Bytes) -> String {
    String::from_utf8_lossy(b).to_ascii_lowercase()
}

pub fn exec_multi(db: &Arc<SingleDb>, conn: &ConnState) -> Reply {
    match conn.multi_state() {
        MultiState::Normal => return Reply::error(ServerError::ExecWithoutMulti),
        MultiState::MultiDirty => {
            conn.end_multi();
            return Reply::error(ServerError::ExecAbort);
        }
        MultiState::Multi => {}
    }

    let watched = conn.watching_snapshot();
    let queued = conn.end_multi();

    let mut write_keys: Vec<String> = Vec::new();
    let mut read_keys: Vec<String> = watched.keys().cloned().collect();
    for cmd in &queued {
        if cmd.is_empty() {
            continue;
        }
        let name = ascii_lowercase(&cmd[0]);
        if let Some(spec) = db.registry().get(&name) {
            let (w, r) = (spec.prepare)(&cmd[1..]);
            write_keys.extend(w);
            read_keys.extend(r);
        }
    }

    let _guard = db.rw_locks(&write_keys, &read_keys);

    for (key, snapshot_version) in &watched {
        if db.get_version(key) != *snapshot_version {
            return Reply::null_array();
        }
    }

    let mut undo_batches: Vec<Vec<CmdLine>> = Vec::with_capacity(queued.len());
    let mut replies: Vec<Reply> = Vec::with_capacity(queued.len());
    let mut aborted = false;

    for cmd in &queued {
        let undo = db.undo_logs(cmd);
        let reply = db.exec_with_lock(cmd);
        let is_error = reply.is_error();
        undo_batches.push(undo);
        replies.push(reply);
        if is_error {
            aborted = true;
            break;
        }
    }

    if aborted {
        for undo in undo_batches.into_iter().rev() {
            for undo_cmd in undo {
                db.exec_with_lock(&undo_cmd);
            }
        }
        return Reply::error(ServerError::ExecAbort);
    }

    db.bump_versions(&write_keys);
    Reply::array(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NoopAofSink;
    use crate::registry::Registry;
    use bytes::Bytes;
    use kv_store::TimeWheel;

    fn test_db() -> Arc<SingleDb> {
        SingleDb::new(0, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()))
    }

    fn dummy_conn() -> ConnState {
        ConnState::new(Arc::new(|_: &Reply| {}))
    }

    #[test]
    fn exec_without_multi_is_an_error() {
        let db = test_db();
        let conn = dummy_conn();
        assert_eq!(exec_multi(&db, &conn), Reply::error(ServerError::ExecWithoutMulti));
    }

    #[test]
    fn queued_commands_run_in_order() {
        let db = test_db();
        let conn = dummy_conn();
        conn.start_multi();
        conn.queue_cmd(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"1")]);
        conn.queue_cmd(vec![Bytes::from_static(b"INCR"), Bytes::from_static(b"k")]);
        let Reply::Array(Some(items)) = exec_multi(&db, &conn) else {
            panic!("expected array");
        };
        assert_eq!(items, vec![Reply::ok(), Reply::integer(2)]);
        assert_eq!(conn.multi_state(), MultiState::Normal);
    }

    #[test]
    fn watch_mismatch_aborts_with_null_array() {
        let db = test_db();
        let conn = dummy_conn();
        db.exec(&conn, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"1")]);
        conn.watch("k", db.get_version("k"));
        db.exec(&conn, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"2")]);
        conn.start_multi();
        conn.queue_cmd(vec![Bytes::from_static(b"GET"), Bytes::from_static(b"k")]);
        assert_eq!(exec_multi(&db, &conn), Reply::null_array());
    }

    #[test]
    fn a_failing_command_rolls_back_the_whole_batch() {
        let db = test_db();
        let conn = dummy_conn();
        db.exec(&conn, vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"1")]);
        conn.start_multi();
        conn.queue_cmd(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k"), Bytes::from_static(b"2")]);
        conn.queue_cmd(vec![Bytes::from_static(b"LPUSH"), Bytes::from_static(b"k"), Bytes::from_static(b"x")]);
        let reply = exec_multi(&db, &conn);
        assert_eq!(reply, Reply::error(ServerError::ExecAbort));
        assert_eq!(db.get_entity("k").unwrap().as_str(), Some(b"1".as_ref()));
    }
}
