//! Runs every member of a cluster config in one process over the in-process
//! network, with a key-value store on each, and reads commands from stdin.
//!
//! ```text
//! set <key> <value>      replicate through the leader
//! del <key>
//! get <key> [node]       read a node's local store (default: the leader)
//! status
//! partition <node> | heal <node>
//! quit
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tally_common::config::load_config;
use tally_common::types::ClusterConfig;
use tally_consensus::{
    BincodeEncoder, FileStorage, KeyValueStore, KvCommand, LocalNetwork, MemoryStorage, RaftConfig, RaftServer, Role,
    ServerHandle, StateMachineRegistry, Storage, TypedCommand,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Member {
    handle: ServerHandle,
    store: KeyValueStore,
}

fn open_storage(config: &ClusterConfig, id: &str) -> anyhow::Result<Box<dyn Storage>> {
    match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            let storage = FileStorage::open(dir.join(format!("{id}.raft")))?;
            Ok(Box::new(storage))
        }
        None => Ok(Box::new(MemoryStorage::new())),
    }
}

fn start_cluster(config: &ClusterConfig, network: &Arc<LocalNetwork>) -> anyhow::Result<BTreeMap<String, Member>> {
    let raft_config = RaftConfig::from(config);
    let mut members = BTreeMap::new();

    for id in config.node_ids() {
        let store = KeyValueStore::default();
        let registry = StateMachineRegistry::builder().register(store.clone())?.build();
        let inbound = network.register(&id);
        let server = RaftServer::builder(id.clone(), config.peers_of(&id), registry)
            .config(raft_config.clone())
            .storage(open_storage(config, &id)?)
            .encoder(network.encoder())
            .build(network.clone(), inbound)?;
        members.insert(
            id,
            Member {
                handle: server.start(),
                store,
            },
        );
    }
    Ok(members)
}

fn leader(members: &BTreeMap<String, Member>, network: &LocalNetwork) -> Option<String> {
    members
        .iter()
        .find(|(id, m)| network.is_connected(id) && m.handle.metrics().borrow().role == Role::Leader)
        .map(|(id, _)| id.clone())
}

async fn execute(line: &str, members: &BTreeMap<String, Member>, network: &LocalNetwork) -> anyhow::Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let member = |id: &str| members.get(id).ok_or_else(|| anyhow!("unknown node {id}"));
    let current_leader = || leader(members, network).ok_or_else(|| anyhow!("no leader elected yet"));

    match words.as_slice() {
        [] => {}
        ["set", key, value] => {
            let command = KvCommand::Set(key.to_string(), value.to_string()).encode()?;
            let index = member(&current_leader()?)?.handle.submit_and_wait(command).await?;
            println!("ok (index {index})");
        }
        ["del", key] => {
            let command = KvCommand::Delete(key.to_string()).encode()?;
            let index = member(&current_leader()?)?.handle.submit_and_wait(command).await?;
            println!("ok (index {index})");
        }
        ["get", key] => {
            let value = member(&current_leader()?)?.store.get(key);
            println!("{}", value.as_deref().unwrap_or("(nil)"));
        }
        ["get", key, node] => {
            let value = member(node)?.store.get(key);
            println!("{}", value.as_deref().unwrap_or("(nil)"));
        }
        ["status"] => {
            for (id, m) in members {
                let metrics = m.handle.metrics().borrow().clone();
                let link = if network.is_connected(id) { "" } else { " (partitioned)" };
                println!(
                    "{id}: {} term={} commit={} applied={} leader={:?}{link}",
                    metrics.role, metrics.term, metrics.commit_index, metrics.last_applied, metrics.leader
                );
            }
        }
        ["partition", node] => {
            member(node)?;
            network.disconnect(node);
        }
        ["heal", node] => {
            member(node)?;
            network.reconnect(node);
        }
        ["quit"] | ["exit"] => return Ok(false),
        _ => bail!("unrecognised command: {line}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "cluster.json".to_string());
    let config = load_config(&path).with_context(|| format!("loading cluster config from {path}"))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let network = LocalNetwork::new(Arc::new(BincodeEncoder::default()));
    let members = start_cluster(&config, &network)?;
    info!(nodes = members.len(), "cluster started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match execute(line.trim(), &members, &network).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err}"),
        }
    }

    for member in members.values() {
        member.handle.shutdown().await;
    }
    info!("cluster stopped");
    Ok(())
}
