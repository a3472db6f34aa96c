//! pubsub.rs - topic-keyed fan-out bus.
//!
//! Every subscription owns a dedicated dispatcher task fed by its own FIFO
//! channel, so delivery is serial per subscription and publication order is
//! preserved. Publishing never blocks: a subscriber that falls behind its
//! channel capacity is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

use crate::network::node::NodeSnapshot;
use crate::protocol::payload::PayloadProxyUpdate;
use crate::socks::BandwidthMessage;

/// Per-subscription queue depth before the subscriber is cancelled.
const SUBSCRIPTION_DEPTH: usize = 64;

/// Messages carried by the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A tunnel lifecycle event, local or propagated.
    Tunnel(PayloadProxyUpdate),
    /// A bandwidth sample from the local proxy.
    Bandwidth(BandwidthMessage),
    /// A snapshot of a node whose state changed.
    Node(NodeSnapshot),
    /// The tracer reached a previously closed peer.
    ConnDiscovered(String),
}

/// A subscription request. `run` is invoked serially for every message on
/// the topic; returning an error cancels the subscription. `post_run` is
/// invoked exactly once when the subscription ends, with the terminating
/// error (`None` on clean cancel).
pub struct Command {
    pub topic: &'static str,
    pub run: Box<dyn FnMut(Event) -> anyhow::Result<()> + Send>,
    pub post_run: Option<Box<dyn FnOnce(Option<anyhow::Error>) + Send>>,
}

struct Entry {
    id: u64,
    tx: mpsc::Sender<Event>,
    lagged: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct PubSub {
    topics: Mutex<HashMap<&'static str, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl PubSub {
    pub fn new() -> Arc<PubSub> {
        Arc::new(PubSub::default())
    }

    /// Registers a subscription and spawns its dispatcher task. The
    /// returned handle cancels it.
    pub fn sub(self: &Arc<Self>, cmd: Command) -> CancelHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let lagged = Arc::new(AtomicBool::new(false));

        self.topics.lock().unwrap().entry(cmd.topic).or_default().push(Entry {
            id,
            tx,
            lagged: lagged.clone(),
        });

        let ps = self.clone();
        let topic = cmd.topic;
        let mut run = cmd.run;
        let mut post_run = cmd.post_run;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Some(ev) => {
                        if let Err(e) = run(ev) {
                            ps.remove(topic, id);
                            if let Some(f) = post_run.take() {
                                f(Some(e));
                            }
                            return;
                        }
                    }
                    None => {
                        let err = if lagged.load(Ordering::Relaxed) {
                            Some(anyhow::anyhow!("subscriber on [{}] lagged behind", topic))
                        } else {
                            None
                        };
                        if let Some(f) = post_run.take() {
                            f(err);
                        }
                        return;
                    }
                }
            }
        });

        CancelHandle {
            ps: self.clone(),
            topic: cmd.topic,
            id,
        }
    }

    /// Delivers a message to every live subscriber of the topic, in
    /// publication order per subscription. Best effort: subscribers that
    /// cannot keep up are dropped.
    pub fn publish(&self, topic: &'static str, ev: Event) {
        let mut topics = self.topics.lock().unwrap();
        let Some(entries) = topics.get_mut(topic) else {
            return;
        };
        entries.retain(|e| match e.tx.try_send(ev.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("pubsub: dropping slow subscriber on [{}]", topic);
                e.lagged.store(true, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if entries.is_empty() {
            topics.remove(topic);
        }
    }

    fn remove(&self, topic: &'static str, id: u64) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Cancels the subscription it was returned for. Dropping the handle does
/// nothing; cancellation is explicit.
pub struct CancelHandle {
    ps: Arc<PubSub>,
    topic: &'static str,
    id: u64,
}

impl CancelHandle {
    pub fn cancel(self) {
        self.ps.remove(self.topic, self.id);
    }
}
