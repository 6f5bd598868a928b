//! Glue between the accept loop and `kv-replication`'s master side: the
//! registry of attached replicas that `PSYNC` needs to hand a connection
//! off to, kept independent of whichever [`kv_engine::multi_db::ReplicationControl`]
//! (master or slave-capable) this process is running as — any server can
//! have replicas attach to it regardless of its own role.

use std::sync::Arc;

use kv_replication::MasterReplicas;

pub struct ReplicationBridge {
    replicas: Arc<MasterReplicas>,
}

impl ReplicationBridge {
    pub fn new(replicas: Arc<MasterReplicas>) -> Arc<Self> {
        Arc::new(Self { replicas })
    }

    pub fn replicas(&self) -> &MasterReplicas {
        &self.replicas
    }
}
