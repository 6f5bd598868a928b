//! Binary-crate bootstrap (§9 "Ambient-stack placement"): configuration,
//! logging, metrics-recorder install, and the Tokio accept loop all live
//! here rather than in the library crates that implement C1-C13, mirroring
//! the teacher workspace's split between process-agnostic library crates
//! and the `readyset-server` binary crate that owns bootstrap concerns.

mod config;
mod metrics;
mod replication_bridge;
mod server;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kv_engine::db::NoopAofSink;
use kv_engine::multi_db::{NoopPersistenceHooks, PersistenceHooks};
use kv_engine::registry::Registry;
use kv_engine::MultiDb;
use kv_persist::{AofConfig, AofHandler, FanOutAofSink};
use kv_replication::{MasterReplicas, SlaveConfig, SlaveReplication};
use kv_store::TimeWheel;

use config::{Cli, Config};
use replication_bridge::ReplicationBridge;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Builds the fresh, disconnected `MultiDb` the AOF rewrite procedure
/// replays into (§9 "Cyclic references") — a private registry and a
/// disabled `AofSink`, entirely independent of the live server.
fn tmp_db_maker(num_databases: usize) -> Arc<dyn Fn() -> Arc<MultiDb> + Send + Sync> {
    Arc::new(move || MultiDb::new(num_databases, Arc::new(Registry::build()), Arc::new(NoopAofSink), Arc::new(TimeWheel::new()), None))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: config error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing();
    metrics::install();

    let registry = Arc::new(Registry::build());
    let time_wheel = Arc::new(TimeWheel::new());
    let replicas = MasterReplicas::new();

    let aof_handler = if config.appendonly {
        let aof_config = AofConfig {
            aof_filename: config.appendfilename.clone().into(),
            rdb_filename: config.dbfilename.clone().into(),
            num_databases: config.databases,
        };
        match AofHandler::open(aof_config, tmp_db_maker(config.databases)) {
            Ok(handler) => Some(Arc::new(handler)),
            Err(e) => {
                tracing::error!(error = %e, "failed to open AOF file");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let aof_sink: Arc<dyn kv_engine::AofSink> = match &aof_handler {
        Some(handler) => Arc::new(FanOutAofSink::new(vec![handler.clone(), replicas.clone()])),
        None => replicas.clone(),
    };

    let mut multidb = MultiDb::new(config.databases, registry.clone(), aof_sink, time_wheel.clone(), config.requirepass.clone());

    let slave_config = SlaveConfig {
        masterauth: config.masterauth.clone(),
        announce_port: config.slave_announce_port.unwrap_or(config.port),
        announce_ip: config.slave_announce_ip.clone(),
        repl_timeout: config.repl_timeout,
    };
    multidb = multidb.with_replication(SlaveReplication::new(Arc::downgrade(&multidb), slave_config));

    if let Some(handler) = &aof_handler {
        multidb = multidb.with_persistence(handler.clone() as Arc<dyn PersistenceHooks>);
        if let Err(e) = handler.load_into(&multidb) {
            tracing::warn!(error = %e, "failed to load existing AOF on startup");
        }
    } else {
        multidb = multidb.with_persistence(Arc::new(NoopPersistenceHooks));
    }

    let wheel_for_tick = time_wheel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            wheel_for_tick.tick();
        }
    });

    let bridge = ReplicationBridge::new(replicas);

    tracing::info!(databases = config.databases, appendonly = config.appendonly, "starting kv-server");
    server::run(&config.bind_addr(), multidb, bridge).await
}
