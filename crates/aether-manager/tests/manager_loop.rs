//! End-to-end tests for the manager event loop over an in-memory control channel.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use aether_manager::bridge::codec::EnvelopeCodec;
use aether_manager::{
    BuildInfo, ControlChannel, DispatchTable, Envelope, EventType, KillReason, ManagerConfig,
    ResourceRegistry, Shutdown, run_manager_with,
};

const STEP: Duration = Duration::from_secs(5);

struct Supervisor {
    tx: FramedWrite<WriteHalf<DuplexStream>, EnvelopeCodec>,
    rx: FramedRead<ReadHalf<DuplexStream>, EnvelopeCodec>,
    stop: Option<oneshot::Sender<()>>,
    manager: JoinHandle<std::io::Result<Shutdown>>,
    resources: Arc<ResourceRegistry>,
}

impl Supervisor {
    fn start(config: ManagerConfig) -> Self {
        Self::start_with(config, 64 * 1024, |_, table| table)
    }

    /// Start a manager over a duplex with `buffer` bytes per direction.
    fn start_with<E>(config: ManagerConfig, buffer: usize, extend: E) -> Self
    where
        E: FnOnce(&ControlChannel, DispatchTable) -> DispatchTable + Send + 'static,
    {
        let (manager_io, supervisor_io) = tokio::io::duplex(buffer);
        let (reader, writer) = tokio::io::split(manager_io);
        let (sup_reader, sup_writer) = tokio::io::split(supervisor_io);

        let resources = Arc::new(ResourceRegistry::new());
        let (stop, stopped) = oneshot::channel::<()>();
        let registry = Arc::clone(&resources);
        let manager = tokio::spawn(async move {
            let shutdown = async {
                let _ = stopped.await;
            };
            run_manager_with(reader, writer, &config, registry, shutdown, extend).await
        });

        Self {
            tx: FramedWrite::new(sup_writer, EnvelopeCodec::new()),
            rx: FramedRead::new(sup_reader, EnvelopeCodec::new()),
            stop: Some(stop),
            manager,
            resources,
        }
    }

    async fn send(&mut self, kind: EventType, data: Value) {
        self.tx.send(Envelope::new(kind, data)).await.unwrap();
    }

    /// Write a frame body as-is, bypassing envelope encoding.
    async fn send_raw(&mut self, body: &[u8]) {
        let writer = self.tx.get_mut();
        writer.write_u32(body.len() as u32).await.unwrap();
        writer.write_all(body).await.unwrap();
        writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(STEP, self.rx.next())
            .await
            .expect("timed out waiting for manager frame")
            .expect("manager closed the channel")
            .unwrap()
            .unwrap()
    }

    async fn outcome(self) -> Shutdown {
        tokio::time::timeout(STEP, self.manager)
            .await
            .expect("manager did not stop")
            .unwrap()
            .unwrap()
    }
}

fn config() -> ManagerConfig {
    ManagerConfig::new(3, 4, [2, 3])
        .with_name("Fire")
        .with_process_tag("7")
        .with_build(BuildInfo::new().with_commit("abc123"))
}

fn guild(id: &str) -> Value {
    json!({"id": id, "member": {"id": "bot", "present": true}})
}

fn restart(id: u32, shard_count: u32, shards: &[u32]) -> Value {
    json!({
        "force": false,
        "id": id,
        "shardCount": shard_count,
        "shards": shards,
        "session": "session-2",
        "state": {"clusters": 2},
    })
}

#[tokio::test]
async fn restart_with_compatible_layout_rebroadcasts() {
    let mut sup = Supervisor::start(config());
    let mut listed = guild("100");
    listed["discovery"] = json!({"id": "100", "name": "Fire HQ", "members": 12});
    sup.send(EventType::GuildCreate, listed).await;
    sup.send(EventType::GuildCreate, guild("200")).await;
    sup.send(EventType::RestartClient, restart(3, 8, &[2, 3, 6, 7]))
        .await;

    let mut announced = BTreeSet::new();
    for _ in 0..2 {
        let envelope = sup.recv().await;
        assert_eq!(envelope.kind, EventType::GuildCreate);
        assert_eq!(envelope.data["member"]["present"], json!(true));
        assert!(envelope.data.get("discovery").is_none());
        announced.insert(envelope.data["id"].as_str().unwrap().to_string());
    }
    assert_eq!(
        announced,
        BTreeSet::from(["100".to_string(), "200".to_string()])
    );

    let ready = sup.recv().await;
    assert_eq!(ready.kind, EventType::ReadyClient);
    assert_eq!(ready.data["id"], json!(3));
    assert_eq!(ready.data["name"], json!("Fire"));
    assert_eq!(ready.data["commit"], json!("abc123"));
    assert_eq!(ready.data["uuid"], json!("7"));

    let discovery = sup.recv().await;
    assert_eq!(discovery.kind, EventType::DiscoveryUpdate);
    assert_eq!(
        discovery.data,
        json!([{"id": "100", "name": "Fire HQ", "members": 12}])
    );

    sup.tx.close().await.unwrap();
    assert_eq!(sup.outcome().await, Shutdown::ChannelClosed);
}

#[tokio::test]
async fn forced_restart_terminates_without_sending() {
    let mut sup = Supervisor::start(config());
    sup.send(EventType::GuildCreate, guild("100")).await;
    sup.send(EventType::RestartClient, json!({"force": true})).await;

    let resources = Arc::clone(&sup.resources);
    let outcome = sup.outcome().await;
    assert_eq!(
        outcome,
        Shutdown::Terminated {
            reason: KillReason::ForcedRestart
        }
    );
    assert_eq!(outcome.exit_code(), 1);
    assert!(resources.is_empty());
}

#[tokio::test]
async fn lost_shard_terminates_with_resharding() {
    let mut sup = Supervisor::start(config());
    sup.send(EventType::RestartClient, restart(3, 8, &[2, 6, 7]))
        .await;

    assert_eq!(
        sup.outcome().await,
        Shutdown::Terminated {
            reason: KillReason::Resharding
        }
    );
}

#[tokio::test]
async fn cluster_mismatch_terminates() {
    let mut sup = Supervisor::start(config());
    sup.send(EventType::RestartClient, restart(5, 4, &[2, 3]))
        .await;

    assert_eq!(
        sup.outcome().await,
        Shutdown::Terminated {
            reason: KillReason::ClusterIdMismatch
        }
    );
}

#[tokio::test]
async fn bad_frames_do_not_stop_the_loop() {
    let mut sup = Supervisor::start(config());

    sup.send_raw(br#"{"type": "PRESENCE_UPDATE", "data": {}}"#).await;
    sup.send_raw(b"{not json").await;
    // known tag, payload missing every conditional field
    sup.send(EventType::RestartClient, json!({"force": false}))
        .await;
    sup.send(EventType::RestartClient, restart(3, 4, &[2, 3]))
        .await;

    assert_eq!(sup.recv().await.kind, EventType::ReadyClient);
    assert_eq!(sup.recv().await.kind, EventType::DiscoveryUpdate);

    sup.stop.take().unwrap().send(()).unwrap();
    assert_eq!(sup.outcome().await, Shutdown::Signal);
}

#[tokio::test]
async fn shutdown_signal_stops_the_loop() {
    let mut sup = Supervisor::start(config());
    sup.stop.take().unwrap().send(()).unwrap();

    let outcome = sup.outcome().await;
    assert_eq!(outcome, Shutdown::Signal);
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn event_stats_are_persisted_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socketstats.json");

    let mut sup = Supervisor::start(config().with_stats_path(&path));
    sup.send(EventType::GuildCreate, guild("100")).await;
    sup.send(EventType::GuildCreate, guild("200")).await;
    sup.send(EventType::RestartClient, json!({"force": true})).await;
    sup.outcome().await;

    let saved: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(saved, json!({"GUILD_CREATE": 2, "RESTART_CLIENT": 1}));
}

#[tokio::test]
async fn stats_are_flushed_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("socketstats.json");

    let mut sup = Supervisor::start(
        config()
            .with_stats_path(&path)
            .with_stats_flush_interval(Duration::from_millis(50)),
    );
    sup.send(EventType::GuildCreate, guild("100")).await;

    let expected = json!({"GUILD_CREATE": 1});
    let flushed = tokio::time::timeout(STEP, async {
        loop {
            if let Ok(bytes) = std::fs::read(&path)
                && serde_json::from_slice::<Value>(&bytes).ok().as_ref() == Some(&expected)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(flushed.is_ok(), "stats were never flushed by the timer");
    assert!(!sup.manager.is_finished());

    sup.stop.take().unwrap().send(()).unwrap();
    assert_eq!(sup.outcome().await, Shutdown::Signal);
}

#[tokio::test]
async fn stalled_supervisor_does_not_block_exit() {
    // tiny buffer and a supervisor that never reads: the writer wedges
    let config = config().with_writer_drain_timeout(Duration::from_millis(200));
    let mut sup = Supervisor::start_with(config, 256, |_, table| table);

    for i in 0..50 {
        sup.send(EventType::GuildCreate, guild(&i.to_string())).await;
    }
    sup.send(EventType::RestartClient, restart(3, 4, &[2, 3]))
        .await;
    sup.send(EventType::RestartClient, json!({"force": true})).await;

    let outcome = sup.outcome().await;
    assert_eq!(
        outcome,
        Shutdown::Terminated {
            reason: KillReason::ForcedRestart
        }
    );
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn request_resolves_through_the_loop() {
    let (handle_tx, handle_rx) = oneshot::channel();
    let mut sup = Supervisor::start_with(config(), 64 * 1024, move |channel, table| {
        let _ = handle_tx.send(channel.clone());
        table
    });
    let channel: ControlChannel = handle_rx.await.unwrap();

    let request = tokio::spawn(async move {
        channel
            .request(EventType::DiscoveryUpdate, json!({"query": "members"}), STEP)
            .await
    });

    let outbound = sup.recv().await;
    assert_eq!(outbound.kind, EventType::DiscoveryUpdate);
    assert_eq!(outbound.data, json!({"query": "members"}));
    let nonce = outbound.nonce.unwrap();

    sup.tx
        .send(Envelope::new(EventType::RequestReply, json!({"members": 42})).with_nonce(nonce))
        .await
        .unwrap();

    let reply = tokio::time::timeout(STEP, request)
        .await
        .unwrap()
        .unwrap()
        .expect("request was not answered");
    assert_eq!(reply.kind, EventType::RequestReply);
    assert_eq!(reply.data, json!({"members": 42}));

    sup.stop.take().unwrap().send(()).unwrap();
    assert_eq!(sup.outcome().await, Shutdown::Signal);
}
