//! Cross-DB admin helpers invoked directly by the multi-DB server (§4.5
//! step 6) rather than through the per-DB [`crate::registry::Registry`]
//! — `COPY` is the one admin verb that needs two `SingleDb` handles at
//! once, so it lives here instead of as a registered command.

use crate::db::SingleDb;

/// Copies `src_key` in `src` to `dst_key` in `dst`, preserving any TTL.
/// Returns `false` (no-op) if the source key is absent, or if the
/// destination key exists and `replace` is `false`.
pub fn copy(src: &SingleDb, dst: &SingleDb, src_key: &str, dst_key: &str, replace: bool) -> bool {
    let Some(entity) = src.get_entity(src_key) else {
        return false;
    };
    if !replace && dst.get_entity(dst_key).is_some() {
        return false;
    }
    let ttl = src.ttl_millis(src_key);
    dst.put_entity(dst_key.to_string(), entity);
    match ttl {
        Some(at) => dst.set_ttl_and_schedule(dst_key, at),
        None => {
            dst.persist(dst_key);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NoopAofSink;
    use crate::registry::Registry;
    use kv_store::TimeWheel;
    use kv_types::Entity;
    use std::sync::Arc;

    fn test_db() -> Arc<SingleDb> {
        SingleDb::new(0, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()))
    }

    #[test]
    fn copy_duplicates_value_and_ttl() {
        let src = test_db();
        let dst = test_db();
        src.put_entity("k", Entity::Str(b"v".to_vec()));
        src.set_ttl_and_schedule("k", crate::db::now_millis() + 60_000);
        assert!(copy(&src, &dst, "k", "k2", false));
        assert!(dst.ttl_millis("k2").is_some());
    }

    #[test]
    fn copy_refuses_to_overwrite_without_replace() {
        let src = test_db();
        let dst = test_db();
        src.put_entity("k", Entity::Str(b"v".to_vec()));
        dst.put_entity("k2", Entity::Str(b"existing".to_vec()));
        assert!(!copy(&src, &dst, "k", "k2", false));
        assert!(copy(&src, &dst, "k", "k2", true));
    }

    #[test]
    fn copy_of_missing_key_is_a_no_op() {
        let src = test_db();
        let dst = test_db();
        assert!(!copy(&src, &dst, "missing", "k2", false));
    }
}
