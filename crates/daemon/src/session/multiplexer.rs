//! Session event multiplexer.
//!
//! Fans a session's events out to every attached viewer and keeps a bounded
//! replay buffer so late joiners see recent history. Each viewer owns a
//! bounded queue; a viewer that stops draining it is detached instead of
//! stalling the session.
//!
//! The buffer, the subscriber table and the liveness flag live under one
//! lock, so an attach observes an exact split: everything before it comes
//! from the replay snapshot, everything after it through the live queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::Event;
use tokio::sync::mpsc;

/// Unique identifier for an attached viewer.
pub type ClientId = u64;

/// Maximum number of events kept for replay.
pub const REPLAY_BUFFER_CAPACITY: usize = 5000;

/// Per-viewer queue capacity. A viewer this far behind is detached.
pub const CLIENT_QUEUE_CAPACITY: usize = 1024;

/// Statistics about a viewer's deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Events delivered to the viewer's queue.
    pub events_sent: u64,
}

/// A registered viewer.
struct ClientHandle {
    tx: mpsc::Sender<Event>,
    stats: ClientStats,
}

impl ClientHandle {
    /// Queues an event without blocking. Returns false if the viewer must go.
    fn try_send(&mut self, id: ClientId, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.events_sent += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    client_id = id,
                    sent = self.stats.events_sent,
                    "Viewer queue full, detaching"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = id, "Viewer channel closed");
                false
            }
        }
    }
}

struct Inner {
    buffer: VecDeque<Event>,
    clients: HashMap<ClientId, ClientHandle>,
    next_client_id: ClientId,
    alive: bool,
    closed: bool,
}

impl Inner {
    fn append(&mut self, event: &Event, capacity: usize) {
        if !event.is_replayable() {
            return;
        }
        if self.buffer.len() == capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event.clone());
    }

    fn deliver(&mut self, event: &Event) -> usize {
        let mut dropped = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            if !client.try_send(*id, event.clone()) {
                dropped.push(*id);
            }
        }
        for id in &dropped {
            self.clients.remove(id);
        }
        self.clients.len()
    }
}

/// What a viewer gets when it attaches.
pub struct Attachment {
    /// Buffered events, oldest first, as of the moment of attach.
    pub replay: Vec<Event>,
    /// Liveness at the moment of attach.
    pub alive: bool,
    /// Live events published after the attach.
    pub receiver: mpsc::Receiver<Event>,
    /// Handle that detaches the viewer when dropped.
    pub subscription: Subscription,
}

/// Detach handle for one viewer. Detaching twice is harmless.
pub struct Subscription {
    id: ClientId,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Returns the viewer id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Detaches the viewer. Returns true if it was still attached.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => lock(&inner).clients.remove(&self.id).is_some(),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Broadcasts one session's events to its viewers.
pub struct EventBroadcaster {
    inner: Arc<Mutex<Inner>>,
    /// Replay buffer capacity.
    capacity: usize,
    /// Per-viewer queue capacity.
    queue_capacity: usize,
    /// Last activity timestamp (Unix epoch milliseconds).
    last_activity: AtomicU64,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    /// Creates a broadcaster with the default buffer and queue sizes.
    pub fn new() -> Self {
        Self::with_capacity(REPLAY_BUFFER_CAPACITY, CLIENT_QUEUE_CAPACITY)
    }

    /// Creates a broadcaster with explicit buffer and queue sizes.
    pub fn with_capacity(capacity: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                clients: HashMap::new(),
                next_client_id: 0,
                alive: true,
                closed: false,
            })),
            capacity: capacity.max(1),
            queue_capacity: queue_capacity.max(1),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    /// Appends `event` to the replay buffer (unless it is a ping) and queues
    /// it for every viewer. Returns the number of viewers still attached.
    ///
    /// Once the exit has been published the stream is final and further
    /// events are dropped.
    pub fn publish(&self, event: Event) -> usize {
        let mut inner = lock(&self.inner);
        if !inner.alive {
            tracing::trace!("Dropping event published after exit");
            return inner.clients.len();
        }
        self.touch();
        inner.append(&event, self.capacity);
        inner.deliver(&event)
    }

    /// Records the end of the stream: publishes `banner` and a
    /// `status: false` event, and clears the liveness flag.
    ///
    /// Only the first call has any effect; it returns true.
    pub fn publish_exit(&self, banner: impl Into<String>) -> bool {
        self.touch();
        let mut inner = lock(&self.inner);
        if !inner.alive {
            return false;
        }
        inner.alive = false;

        for event in [Event::output(banner), Event::status(false)] {
            inner.append(&event, self.capacity);
            inner.deliver(&event);
        }
        true
    }

    /// Attaches a new viewer.
    ///
    /// The replay snapshot and the registration happen atomically. After
    /// [`EventBroadcaster::close`], the receiver is already closed and the
    /// viewer only gets the replay.
    pub fn attach(&self) -> Attachment {
        let mut inner = lock(&self.inner);
        let id = inner.next_client_id;
        inner.next_client_id += 1;

        let (tx, receiver) = mpsc::channel(self.queue_capacity);
        if !inner.closed {
            inner.clients.insert(
                id,
                ClientHandle {
                    tx,
                    stats: ClientStats::default(),
                },
            );
        }

        Attachment {
            replay: inner.buffer.iter().cloned().collect(),
            alive: inner.alive,
            receiver,
            subscription: Subscription {
                id,
                inner: Arc::downgrade(&self.inner),
            },
        }
    }

    /// Detaches every viewer and refuses new live registrations.
    ///
    /// Viewers drain what is already queued and then see their stream end.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.clients.clear();
    }

    /// Returns whether the stream is still live.
    pub fn is_alive(&self) -> bool {
        lock(&self.inner).alive
    }

    /// Returns whether [`EventBroadcaster::close`] has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Returns the number of attached viewers.
    pub fn client_count(&self) -> usize {
        lock(&self.inner).clients.len()
    }

    /// Returns delivery statistics for one viewer.
    pub fn client_stats(&self, id: ClientId) -> Option<ClientStats> {
        lock(&self.inner).clients.get(&id).map(|c| c.stats)
    }

    /// Returns the number of buffered events.
    pub fn buffer_len(&self) -> usize {
        lock(&self.inner).buffer.len()
    }

    /// Returns a copy of the replay buffer, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        lock(&self.inner).buffer.iter().cloned().collect()
    }

    /// Updates the last activity timestamp to now.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Returns the last activity timestamp (Unix epoch milliseconds).
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
