//! Gossiper - periodic anti-entropy push of the full value set.
//!
//! Every `gossip_interval` the gossiper samples up to `fanout` peers and pushes
//! `{"type": "gossip", "messages": [...]}` to each. Pushes carry no `msg_id`,
//! so peers do not reply.
//!
//! Each push runs on its own task. A failed push is retried with jittered
//! exponential backoff, re-reading the store on every attempt so a retry never
//! sends stale data. At most one push per destination is outstanding: a tick
//! that samples a peer with a push still in flight skips it.
//!
//! Lifecycle is one-shot and enforced by type: [`Gossiper::start`] consumes the
//! gossiper and returns a [`RunningGossiper`], whose [`stop`](RunningGossiper::stop)
//! consumes it in turn.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gossamer_node::Node;
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::BroadcastConfig;
use crate::sampler::sample_peers;
use crate::store::ValueStore;

type InFlight = Arc<Mutex<HashSet<String>>>;

/// A gossiper that has not been started.
#[derive(Debug, Clone)]
pub struct Gossiper {
    config: BroadcastConfig,
}

/// A gossiper whose background loop is running.
#[derive(Debug)]
pub struct RunningGossiper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Gossiper {
    /// Create a stopped gossiper.
    pub fn new(config: BroadcastConfig) -> Self {
        Self { config }
    }

    /// Spawn the background loop. Must be called inside a tokio runtime.
    pub fn start(self, store: Arc<ValueStore>, node: Node) -> RunningGossiper {
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            interval = ?self.config.gossip_interval,
            fanout = self.config.fanout,
            "Starting gossiper"
        );
        let handle = tokio::spawn(gossip_loop(self.config, store, node, shutdown_rx));

        RunningGossiper { shutdown, handle }
    }
}

impl RunningGossiper {
    /// Signal the loop to exit after its current tick and wait for it.
    ///
    /// Pushes already in flight finish their current attempt but do not retry.
    pub async fn stop(self) {
        // The loop may already be gone; nothing to signal then.
        let _ = self.shutdown.send(true);

        if let Err(e) = self.handle.await {
            warn!("Gossip loop ended abnormally: {}", e);
        }
        info!("Gossiper stopped");
    }
}

async fn gossip_loop(
    config: BroadcastConfig,
    store: Arc<ValueStore>,
    node: Node,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.gossip_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let in_flight: InFlight = Arc::default();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                gossip_round(&config, &store, &node, &in_flight, &shutdown).await;
            }
        }
    }

    debug!("Gossip loop exited");
}

async fn gossip_round(
    config: &BroadcastConfig,
    store: &Arc<ValueStore>,
    node: &Node,
    in_flight: &InFlight,
    shutdown: &watch::Receiver<bool>,
) {
    let Some(self_id) = node.id() else {
        trace!("Node not initialized, skipping gossip round");
        return;
    };

    if store.is_empty().await {
        return;
    }

    let targets = sample_peers(node.peer_ids(), self_id, config.fanout, &mut rand::thread_rng());

    for peer in targets {
        let Some(slot) = PushSlot::claim(in_flight, &peer) else {
            trace!(peer = %peer, "Push still in flight, skipping");
            continue;
        };

        tokio::spawn(push_with_retry(
            config.clone(),
            Arc::clone(store),
            node.clone(),
            peer,
            slot,
            shutdown.clone(),
        ));
    }
}

async fn push_with_retry(
    config: BroadcastConfig,
    store: Arc<ValueStore>,
    node: Node,
    peer: String,
    _slot: PushSlot,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = config.retry_backoff;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let values = store.snapshot().await;
        let body = json!({ "type": "gossip", "messages": values });

        match node.send(&peer, body).await {
            Ok(()) => {
                trace!(peer = %peer, values = values.len(), attempt, "Pushed gossip");
                return;
            }
            Err(e) => {
                debug!(peer = %peer, attempt, "Gossip push failed: {}", e);
            }
        }

        if *shutdown.borrow() {
            return;
        }

        let delay = jittered(backoff);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(config.max_retry_backoff);
    }
}

/// `base` plus up to half again, so retries to many peers spread out.
fn jittered(base: Duration) -> Duration {
    let half = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=half))
}

/// Marks a destination as having a push outstanding; released on drop.
struct PushSlot {
    in_flight: InFlight,
    peer: String,
}

impl PushSlot {
    fn claim(in_flight: &InFlight, peer: &str) -> Option<Self> {
        let claimed = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.to_string());

        claimed.then(|| Self {
            in_flight: Arc::clone(in_flight),
            peer: peer.to_string(),
        })
    }
}

impl Drop for PushSlot {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;
    use gossamer_node::Message;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader, DuplexStream, Lines};

    type Output = Lines<BufReader<DuplexStream>>;

    fn fast_config() -> BroadcastConfig {
        BroadcastConfig::default()
            .with_gossip_interval(Duration::from_millis(10))
            .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    fn cluster_node(writer: impl AsyncWrite + Send + Unpin + 'static) -> Node {
        node_with_peers(writer, &["n1", "n2", "n3"])
    }

    fn node_with_peers(writer: impl AsyncWrite + Send + Unpin + 'static, peers: &[&str]) -> Node {
        let node = Node::new(writer);
        node.initialize("n1", peers.iter().map(|p| p.to_string()).collect())
            .unwrap();
        node
    }

    async fn next_within(out: &mut Output, wait: Duration) -> Option<Message> {
        match tokio::time::timeout(wait, out.next_line()).await {
            Ok(Ok(Some(line))) => Some(Message::from_line(&line).unwrap()),
            _ => None,
        }
    }

    /// Fails the first `failures` writes, then passes through.
    struct FlakyWriter {
        failures: Arc<AtomicUsize>,
        inner: DuplexStream,
    }

    impl AsyncWrite for FlakyWriter {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let failed = this
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer unreachable")));
            }
            Pin::new(&mut this.inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_pushes_full_set_to_peers() {
        let (writer, reader) = tokio::io::duplex(1 << 20);
        let mut out = BufReader::new(reader).lines();
        let node = cluster_node(writer);

        let store = Arc::new(ValueStore::new());
        store.merge([10_i64, 20].into_iter().map(Value::from)).await;

        let gossiper = Gossiper::new(fast_config().with_fanout(2)).start(Arc::clone(&store), node);

        let mut destinations = HashSet::new();
        for _ in 0..6 {
            let msg = next_within(&mut out, Duration::from_secs(2)).await.expect("gossip push");
            assert_eq!(msg.src, "n1");
            assert_eq!(msg.kind(), "gossip");
            assert_eq!(msg.body["messages"], json!([10, 20]));
            assert!(msg.header().unwrap().msg_id.is_none());
            destinations.insert(msg.dest);
        }
        gossiper.stop().await;

        assert!(!destinations.contains("n1"));
        assert_eq!(destinations, HashSet::from(["n2".to_string(), "n3".to_string()]));
    }

    #[tokio::test]
    async fn test_skips_empty_store_and_uninitialized_node() {
        let (writer, reader) = tokio::io::duplex(1 << 20);
        let mut out = BufReader::new(reader).lines();
        let node = cluster_node(writer);
        let gossiper = Gossiper::new(fast_config()).start(Arc::new(ValueStore::new()), node);
        assert!(next_within(&mut out, Duration::from_millis(80)).await.is_none());
        gossiper.stop().await;

        let (writer, reader) = tokio::io::duplex(1 << 20);
        let mut out = BufReader::new(reader).lines();
        let store = Arc::new(ValueStore::new());
        store.try_add(Value::from(1_i64)).await;
        let gossiper = Gossiper::new(fast_config()).start(store, Node::new(writer));
        assert!(next_within(&mut out, Duration::from_millis(80)).await.is_none());
        gossiper.stop().await;
    }

    #[tokio::test]
    async fn test_failed_push_is_retried() {
        let (writer, reader) = tokio::io::duplex(1 << 20);
        let mut out = BufReader::new(reader).lines();
        let failures = Arc::new(AtomicUsize::new(3));
        let node = cluster_node(FlakyWriter {
            failures: Arc::clone(&failures),
            inner: writer,
        });

        let store = Arc::new(ValueStore::new());
        store.try_add(Value::from(7_i64)).await;
        let gossiper = Gossiper::new(fast_config()).start(store, node);

        let msg = next_within(&mut out, Duration::from_secs(2)).await.expect("push after retries");
        assert_eq!(msg.body["messages"], json!([7]));
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        gossiper.stop().await;
    }

    #[tokio::test]
    async fn test_retry_sends_latest_values() {
        let (writer, reader) = tokio::io::duplex(1 << 20);
        let mut out = BufReader::new(reader).lines();
        let failures = Arc::new(AtomicUsize::new(1));
        let node = node_with_peers(
            FlakyWriter {
                failures: Arc::clone(&failures),
                inner: writer,
            },
            &["n1", "n2"],
        );

        let store = Arc::new(ValueStore::new());
        store.try_add(Value::from(1_i64)).await;
        let config = fast_config()
            .with_gossip_interval(Duration::from_secs(60))
            .with_retry_backoff(Duration::from_millis(50), Duration::from_millis(50));
        let gossiper = Gossiper::new(config).start(Arc::clone(&store), node);

        // The first tick fires immediately and its first attempt fails.
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.try_add(Value::from(2_i64)).await;

        let msg = next_within(&mut out, Duration::from_secs(2)).await.expect("retried push");
        assert_eq!(msg.body["messages"], json!([1, 2]));
        gossiper.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_pushes() {
        let (writer, reader) = tokio::io::duplex(1 << 20);
        let mut out = BufReader::new(reader).lines();
        let node = cluster_node(writer);
        let store = Arc::new(ValueStore::new());
        store.try_add(Value::from(1_i64)).await;

        let gossiper = Gossiper::new(fast_config()).start(store, node);
        assert!(next_within(&mut out, Duration::from_secs(2)).await.is_some());
        gossiper.stop().await;

        // Drain pushes that were already spawned, then expect silence.
        while next_within(&mut out, Duration::from_millis(30)).await.is_some() {}
        assert!(next_within(&mut out, Duration::from_millis(100)).await.is_none());
    }

    #[test]
    fn test_push_slot_is_exclusive_per_peer() {
        let in_flight: InFlight = Arc::default();
        let first = PushSlot::claim(&in_flight, "n2").unwrap();
        assert!(PushSlot::claim(&in_flight, "n2").is_none());
        assert!(PushSlot::claim(&in_flight, "n3").is_some());

        drop(first);
        assert!(PushSlot::claim(&in_flight, "n2").is_some());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= Duration::from_millis(150));
        }
    }
}
