//! In-memory fan-out of session events to live subscribers.
//!
//! The hub keeps every event the runner has published (bounded by the event
//! cap) next to a broadcast channel. Subscribing takes the replay slice and
//! the broadcast receiver under the same lock that publishing holds, so a
//! subscriber sees each event exactly once: from the replay or from the live
//! feed, never both, never neither.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::models::event::{DoneInfo, SessionEvent, StreamItem};

/// Broadcast buffer per hub; a slower subscriber backfills from the hub.
const LIVE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum HubMessage {
    Event(SessionEvent),
    Done(DoneInfo),
}

#[derive(Debug, Default)]
struct HubState {
    events: Vec<SessionEvent>,
    done: Option<DoneInfo>,
}

/// Shared event buffer plus live broadcast for one session.
#[derive(Debug)]
pub struct EventHub {
    state: Mutex<HubState>,
    live: broadcast::Sender<HubMessage>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            state: Mutex::new(HubState::default()),
            live,
        }
    }

    /// Record an event and deliver it to live subscribers.
    pub fn publish(&self, event: SessionEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.events.push(event.clone());
        // No receivers is fine; the event is still buffered for replay.
        let _ = self.live.send(HubMessage::Event(event));
    }

    /// Record the terminal signal. Later calls are ignored.
    pub fn finish(&self, done: DoneInfo) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done.is_some() {
            return;
        }
        state.done = Some(done.clone());
        let _ = self.live.send(HubMessage::Done(done));
    }

    /// Number of events published so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    /// Whether nothing has been published yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replay from `offset`, then follow live events until `done`.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, offset: u64, keepalive: Duration) -> Subscription {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let replay: VecDeque<SessionEvent> = events_from(&state.events, offset).into();
        let done = state.done.clone();
        let live = if done.is_some() {
            None
        } else {
            Some(LiveFeed {
                hub: Arc::clone(self),
                rx: self.live.subscribe(),
            })
        };
        drop(state);
        Subscription::new(replay, offset, live, done, keepalive)
    }

    /// Missed events from `next_id`, the terminal signal if any, and a fresh
    /// receiver when the session is still live. Taken under one lock so
    /// nothing published in between is lost.
    fn backfill(
        &self,
        next_id: u64,
    ) -> (
        Vec<SessionEvent>,
        Option<DoneInfo>,
        Option<broadcast::Receiver<HubMessage>>,
    ) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = state.done.is_none().then(|| self.live.subscribe());
        (events_from(&state.events, next_id), state.done.clone(), rx)
    }
}

fn events_from(events: &[SessionEvent], offset: u64) -> Vec<SessionEvent> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(events.len());
    events[start..].to_vec()
}

#[derive(Debug)]
struct LiveFeed {
    hub: Arc<EventHub>,
    rx: broadcast::Receiver<HubMessage>,
}

/// Ordered stream of [`StreamItem`]s for one viewer.
///
/// Yields the replay, then live events, then a single `Done`, after which
/// [`Subscription::next`] returns `None`. While waiting on live events a
/// `Keepalive` is yielded every keepalive period.
#[derive(Debug)]
pub struct Subscription {
    replay: VecDeque<SessionEvent>,
    next_id: u64,
    live: Option<LiveFeed>,
    done: Option<DoneInfo>,
    keepalive: Interval,
    finished: bool,
}

impl Subscription {
    fn new(
        replay: VecDeque<SessionEvent>,
        offset: u64,
        live: Option<LiveFeed>,
        done: Option<DoneInfo>,
        keepalive: Duration,
    ) -> Self {
        let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            replay,
            next_id: offset,
            live,
            done,
            keepalive: ticker,
            finished: false,
        }
    }

    /// A subscription over a session that has already ended: replay, then done.
    #[must_use]
    pub fn finished(
        replay: Vec<SessionEvent>,
        offset: u64,
        done: DoneInfo,
        keepalive: Duration,
    ) -> Self {
        Self::new(replay.into(), offset, None, Some(done), keepalive)
    }

    /// Next item, or `None` once `Done` has been yielded.
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.replay.pop_front() {
                if event.id < self.next_id {
                    continue;
                }
                self.next_id = event.id + 1;
                return Some(StreamItem::Event(event));
            }
            if self.live.is_none() {
                self.finished = true;
                return self.done.take().map(StreamItem::Done);
            }
            if let Some(item) = self.next_live().await {
                return Some(item);
            }
        }
    }

    /// Wait for one live message. `None` means the replay queue or the
    /// terminal state changed and the caller should loop.
    async fn next_live(&mut self) -> Option<StreamItem> {
        let live = self.live.as_mut()?;
        let received = tokio::select! {
            msg = live.rx.recv() => msg,
            _ = self.keepalive.tick() => return Some(StreamItem::Keepalive),
        };
        match received {
            Ok(HubMessage::Event(event)) => {
                if event.id < self.next_id {
                    return None;
                }
                if event.id > self.next_id {
                    self.refill();
                    return None;
                }
                self.next_id = event.id + 1;
                Some(StreamItem::Event(event))
            }
            Ok(HubMessage::Done(done)) => {
                self.live = None;
                self.finished = true;
                Some(StreamItem::Done(done))
            }
            Err(broadcast::error::RecvError::Lagged(_) | broadcast::error::RecvError::Closed) => {
                self.refill();
                None
            }
        }
    }

    /// Re-read missed events from the hub buffer after lag or a gap.
    fn refill(&mut self) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let hub = Arc::clone(&live.hub);
        let (missed, done, rx) = hub.backfill(self.next_id);
        self.replay.extend(missed);
        match rx {
            Some(rx) => self.live = Some(LiveFeed { hub, rx }),
            None => {
                // Everything up to the final event is in `missed`; finish after it.
                self.live = None;
                self.done = done;
            }
        }
    }

    /// Adapt into a [`futures_util::Stream`].
    pub fn into_stream(self) -> impl futures_util::Stream<Item = StreamItem> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
    }
}
