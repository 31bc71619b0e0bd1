//! Per-viewer event streams.
//!
//! A viewer gets the session's replay buffer, then a `status` snapshot, then
//! live events interleaved with `ping` heartbeats. Dropping the stream
//! detaches the viewer; the stream ends by itself once the session is closed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use protocol::Event;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::session::{Session, SessionId, Subscription};

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Detaches the viewer when the stream is dropped.
struct ViewerGuard {
    session_id: SessionId,
    subscription: Subscription,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if self.subscription.unsubscribe() {
            tracing::debug!(
                session_id = %self.session_id,
                client_id = self.subscription.id(),
                "Viewer detached"
            );
        }
    }
}

enum Step {
    Live(Option<Event>),
    Heartbeat,
}

/// Attaches to `session` and returns the viewer's event stream.
///
/// The replay snapshot is taken here, not on first poll.
pub fn event_stream(session: &Arc<Session>, heartbeat: Duration) -> impl Stream<Item = Event> + Send + 'static {
    let attachment = session.attach();
    let guard = ViewerGuard {
        session_id: session.id().clone(),
        subscription: attachment.subscription,
    };
    let replay = attachment.replay;
    let alive = attachment.alive;
    let mut receiver = attachment.receiver;

    tracing::debug!(
        session_id = %guard.session_id,
        replay = replay.len(),
        alive,
        "Viewer attached"
    );

    async_stream::stream! {
        let _guard = guard;

        for event in replay {
            yield event;
        }
        yield Event::status(alive);

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                event = receiver.recv() => Step::Live(event),
                _ = ticker.tick() => Step::Heartbeat,
            };

            match step {
                Step::Live(Some(event)) => yield event,
                Step::Live(None) => break,
                Step::Heartbeat => yield Event::Ping,
            }
        }
    }
}
