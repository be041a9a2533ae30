use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

/// Capacity of each subscriber's frame buffer. A subscriber that falls
/// further behind loses frames; nobody else does.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    GraphUpdated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NoteCreated => "note.created",
            EventKind::NoteUpdated => "note.updated",
            EventKind::NoteDeleted => "note.deleted",
            EventKind::GraphUpdated => "graph.updated",
        }
    }
}

/// A change notification before wire encoding.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub path: Option<String>,
}

impl Event {
    pub fn note(kind: EventKind, path: &str) -> Self {
        Event {
            kind,
            path: Some(path.to_string()),
        }
    }

    pub fn graph() -> Self {
        Event {
            kind: EventKind::GraphUpdated,
            path: None,
        }
    }

    /// Serialize to the SSE wire form once; subscribers receive the
    /// already-encoded bytes.
    pub fn encode(&self) -> Arc<str> {
        let data = match &self.path {
            Some(path) => serde_json::json!({ "path": path }),
            None => serde_json::json!({}),
        };
        Arc::from(format!("event: {}\ndata: {}\n\n", self.kind.as_str(), data))
    }
}

enum Command {
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: u64,
    },
    Publish {
        event: Event,
    },
    Close,
}

struct Slot {
    tx: mpsc::Sender<Arc<str>>,
    dropped: u64,
}

/// One client's view of the event stream. Dropping it unregisters the
/// subscriber inside the broker loop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<str>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    /// Next pre-encoded SSE frame; `None` once the broker closes.
    pub async fn next(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }

    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { id: self.id });
    }
}

/// In-process pub/sub fanning index mutations out to SSE clients.
///
/// All mutable state (subscriber set, graph-throttle timestamp) is owned
/// by one loop task; the clonable handle only enqueues commands, so the
/// publish path never blocks on a slow consumer.
#[derive(Clone)]
pub struct Broker {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Broker {
    /// Spawn the broker loop. `graph_throttle` is the minimum interval
    /// between `graph.updated` broadcasts.
    pub fn start(graph_throttle: Duration) -> Broker {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = Broker {
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(run_loop(cmd_rx, cmd_tx, graph_throttle));
        handle
    }

    /// Register a subscriber. After `close()` the returned subscription
    /// yields no frames.
    pub async fn subscribe(&self) -> Subscription {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Subscribe { reply: reply_tx })
            .is_ok()
        {
            if let Ok(sub) = reply_rx.await {
                return sub;
            }
        }
        // Broker already closed: hand back a subscription that is done.
        let (_tx, rx) = mpsc::channel(1);
        Subscription {
            id: 0,
            rx,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.cmd_tx.send(Command::Publish { event });
    }

    pub fn publish_note_event(&self, kind: EventKind, path: &str) {
        self.publish(Event::note(kind, path));
    }

    /// Shut the loop down and close every subscriber channel.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

async fn run_loop(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    graph_throttle: Duration,
) {
    let mut subscribers: HashMap<u64, Slot> = HashMap::new();
    let mut next_id: u64 = 1;
    let mut last_graph: Option<Instant> = None;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Subscribe { reply } => {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                let id = next_id;
                next_id += 1;
                let sub = Subscription {
                    id,
                    rx,
                    cmd_tx: cmd_tx.clone(),
                };
                if reply.send(sub).is_ok() {
                    subscribers.insert(id, Slot { tx, dropped: 0 });
                }
            }
            Command::Unsubscribe { id } => {
                subscribers.remove(&id);
            }
            Command::Publish { event } => {
                fan_out(&mut subscribers, &event.encode());

                // Every note event also refreshes the graph, throttled.
                if event.kind != EventKind::GraphUpdated {
                    let due = last_graph
                        .map(|t| t.elapsed() >= graph_throttle)
                        .unwrap_or(true);
                    if due {
                        last_graph = Some(Instant::now());
                        fan_out(&mut subscribers, &Event::graph().encode());
                    }
                }
            }
            Command::Close => break,
        }
    }

    // Dropping the senders closes every subscriber stream.
    subscribers.clear();
}

fn fan_out(subscribers: &mut HashMap<u64, Slot>, frame: &Arc<str>) {
    for (id, slot) in subscribers.iter_mut() {
        match slot.tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                slot.dropped += 1;
                tracing::debug!(
                    subscriber = id,
                    dropped = slot.dropped,
                    "subscriber buffer full, frame dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Cleaned up on the Unsubscribe command from Drop.
            }
        }
    }
}
