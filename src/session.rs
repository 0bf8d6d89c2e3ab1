//! HTTP session table
//!
//! A session owns a [`Peer`] and a bounded outbound buffer. The dispatcher
//! writes into the buffer and SSE streams lease messages out of it, so
//! anything produced while no stream is attached waits for the next one.
//!
//! Streams come in two kinds. A request stream is opened by a POST and only
//! takes messages related to the request ids it carried. A standalone stream
//! (GET) takes everything no live request stream has claimed.
//!
//! Every buffered message gets a per-session event id. Messages a standalone
//! stream has taken stay in a bounded replay window, so a client that lost
//! its connection can resume with `Last-Event-ID`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{ProtocolError, TransportError};
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::message::{Message, RequestId};
use crate::mcp::peer::{Outbound, Peer};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub idle_timeout: Duration,
    pub buffer_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Clone)]
struct Queued {
    event_id: u64,
    message: Message,
    related: Option<RequestId>,
}

struct Session {
    peer: Arc<Peer>,
    outbound: VecDeque<Queued>,
    /// Already delivered on a standalone stream, oldest first.
    replay: VecDeque<Queued>,
    next_event_id: u64,
    /// Requests still owed a terminal message.
    open: HashSet<RequestId>,
    /// Request id -> lease of the POST stream that carries it.
    claims: HashMap<RequestId, u64>,
    streams: usize,
    last_seen_at: Instant,
    notify: Arc<Notify>,
    failed: bool,
}

impl Session {
    fn retain(&mut self, queued: Queued, capacity: usize) {
        self.replay.push_back(queued);
        while self.replay.len() > capacity {
            self.replay.pop_front();
        }
    }

    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.streams == 0
            && (self.failed || now.saturating_duration_since(self.last_seen_at) >= timeout)
    }
}

enum Push {
    Queued,
    Dropped,
    Overflow,
}

/// What a stream gets next.
#[derive(Debug, PartialEq)]
pub enum Delivery {
    Message(Message),
    /// Every request the stream carried has been answered.
    Settled,
    /// The session is closed or failed.
    Gone,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<Arc<str>, Session>>,
    dispatcher: Arc<Dispatcher>,
    options: SessionOptions,
    next_lease: AtomicU64,
    closing: AtomicBool,
}

impl SessionManager {
    pub fn new(dispatcher: Arc<Dispatcher>, options: SessionOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            dispatcher,
            options,
            next_lease: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails with [`TransportError::Closed`] once shutdown has begun.
    pub fn create_session(self: &Arc<Self>) -> Result<(Arc<str>, Arc<Peer>), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let session_id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        let sink = Arc::new(SessionSink {
            manager: Arc::downgrade(self),
            session_id: Arc::clone(&session_id),
        });
        let peer = Arc::new(Peer::new(Arc::clone(&session_id), sink));

        self.sessions.lock().insert(
            Arc::clone(&session_id),
            Session {
                peer: Arc::clone(&peer),
                outbound: VecDeque::new(),
                replay: VecDeque::new(),
                next_event_id: 1,
                open: HashSet::new(),
                claims: HashMap::new(),
                streams: 0,
                last_seen_at: Instant::now(),
                notify: Arc::new(Notify::new()),
                failed: false,
            },
        );
        info!(session_id = %session_id, "session created");
        Ok((session_id, peer))
    }

    /// Looks up a live session and marks it as seen.
    pub fn peer(&self, session_id: &str) -> Result<Arc<Peer>, TransportError> {
        let mut sessions = self.sessions.lock();
        let session = live_session(&mut sessions, session_id)?;
        session.last_seen_at = Instant::now();
        Ok(Arc::clone(&session.peer))
    }

    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.lock().get_mut(session_id) {
            Some(session) => {
                session.last_seen_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Appends to the session buffer. At capacity the oldest notification
    /// is evicted; a buffer holding only responses fails the session.
    pub fn enqueue(
        &self,
        session_id: &str,
        message: Message,
        related: Option<RequestId>,
    ) -> Result<(), TransportError> {
        let push = {
            let mut sessions = self.sessions.lock();
            let session = live_session(&mut sessions, session_id)?;
            self.push(session, message, related)
        };

        match push {
            Push::Queued => Ok(()),
            Push::Dropped => {
                debug!(session_id, "buffer full of responses, notification dropped");
                Ok(())
            }
            Push::Overflow => {
                let cancelled = self.dispatcher.cancel_scope(session_id);
                warn!(session_id, cancelled, "outbound buffer overflow, session failed");
                Err(TransportError::SessionFailed(session_id.to_string()))
            }
        }
    }

    fn push(&self, session: &mut Session, message: Message, related: Option<RequestId>) -> Push {
        if session.outbound.len() >= self.options.buffer_capacity {
            match session
                .outbound
                .iter()
                .position(|queued| queued.message.is_notification())
            {
                Some(index) => {
                    session.outbound.remove(index);
                }
                None if message.is_notification() => return Push::Dropped,
                None => {
                    session.failed = true;
                    session.notify.notify_waiters();
                    return Push::Overflow;
                }
            }
        }

        if message.is_terminal() {
            if let Some(id) = message.id() {
                session.open.remove(id);
            }
        }
        let event_id = session.next_event_id;
        session.next_event_id += 1;
        session.outbound.push_back(Queued {
            event_id,
            message,
            related,
        });
        session.notify.notify_waiters();
        Push::Queued
    }

    /// The request was cancelled; streams waiting on it may settle.
    fn abandon(&self, session_id: &str, id: &RequestId) {
        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            session.open.remove(id);
            session.claims.remove(id);
            session.notify.notify_waiters();
        }
    }

    /// Opens a stream for the requests of one POST. Their ids are claimed
    /// before dispatch so no other stream takes their responses.
    ///
    /// The returned mask says, per id in order, whether it was claimed. An
    /// id that is still owed a response, or that repeats within `ids`, is
    /// not claimed and must be answered without dispatching it.
    pub fn open_request_stream(
        self: &Arc<Self>,
        session_id: &str,
        ids: impl IntoIterator<Item = RequestId>,
    ) -> Result<(StreamLease, Vec<bool>), TransportError> {
        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock();
        let session = live_session(&mut sessions, session_id)?;

        let mut pending = HashSet::new();
        let mut claimed = Vec::new();
        for id in ids {
            if session.open.contains(&id)
                || session.claims.contains_key(&id)
                || self.dispatcher.is_in_flight(session_id, &id)
            {
                claimed.push(false);
                continue;
            }
            session.open.insert(id.clone());
            session.claims.insert(id.clone(), lease_id);
            pending.insert(id);
            claimed.push(true);
        }
        session.streams += 1;
        session.last_seen_at = Instant::now();

        let lease = StreamLease {
            manager: Arc::clone(self),
            session_id: Arc::from(session_id),
            lease_id,
            kind: LeaseKind::Request { pending },
            replay: VecDeque::new(),
            last_event_id: None,
        };
        Ok((lease, claimed))
    }

    /// Attaches a GET stream. With `last_event_id`, retained messages after
    /// that id are delivered again before anything still buffered.
    pub fn open_standalone_stream(
        self: &Arc<Self>,
        session_id: &str,
        last_event_id: Option<u64>,
    ) -> Result<StreamLease, TransportError> {
        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock();
        let session = live_session(&mut sessions, session_id)?;
        session.streams += 1;
        session.last_seen_at = Instant::now();

        let replay = match last_event_id {
            Some(last) => {
                session.replay.retain(|queued| queued.event_id > last);
                session.replay.clone()
            }
            None => VecDeque::new(),
        };
        debug!(
            session_id,
            buffered = session.outbound.len(),
            replayed = replay.len(),
            "standalone stream attached"
        );

        Ok(StreamLease {
            manager: Arc::clone(self),
            session_id: Arc::from(session_id),
            lease_id,
            kind: LeaseKind::Standalone,
            replay,
            last_event_id: None,
        })
    }

    /// Destroys a session and cancels whatever it still had in flight.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().remove(session_id);
        let Some(session) = removed else {
            return false;
        };
        self.teardown(session_id, session);
        info!(session_id, "session closed");
        true
    }

    fn teardown(&self, session_id: &str, session: Session) {
        session.peer.close();
        session.notify.notify_waiters();
        self.dispatcher.cancel_scope(session_id);
    }

    /// Removes idle and failed sessions without an attached stream.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired = {
            let mut sessions = self.sessions.lock();
            let ids = sessions
                .iter()
                .filter(|(_, session)| session.is_idle(now, self.options.idle_timeout))
                .map(|(id, _)| Arc::clone(id))
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
                .collect::<Vec<_>>()
        };

        for (session_id, session) in &expired {
            debug!(session_id = %session_id, failed = session.failed, "reaping session");
        }
        let count = expired.len();
        for (session_id, session) in expired {
            self.teardown(&session_id, session);
        }
        count
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = manager.sweep_at(Instant::now());
                        if reaped > 0 {
                            info!(reaped, remaining = manager.len(), "idle sessions swept");
                        }
                    }
                }
            }
        })
    }

    /// Stops new sessions, lets in-flight requests finish within `grace`,
    /// then closes every session so attached streams end.
    pub async fn shutdown(&self, grace: Duration) {
        self.closing.store(true, Ordering::Release);
        let cancelled = self.dispatcher.drain(None, grace).await;
        let sessions = self.sessions.lock().drain().collect::<Vec<_>>();
        let count = sessions.len();
        for (session_id, session) in sessions {
            self.teardown(&session_id, session);
        }
        info!(sessions = count, cancelled, "sessions shut down");
    }
}

fn live_session<'a>(
    sessions: &'a mut HashMap<Arc<str>, Session>,
    session_id: &str,
) -> Result<&'a mut Session, TransportError> {
    let session = sessions
        .get_mut(session_id)
        .ok_or_else(|| TransportError::SessionNotFound(session_id.to_string()))?;
    if session.failed {
        return Err(TransportError::SessionFailed(session_id.to_string()));
    }
    Ok(session)
}

struct SessionSink {
    manager: Weak<SessionManager>,
    session_id: Arc<str>,
}

#[async_trait]
impl Outbound for SessionSink {
    async fn send(&self, message: Message, related: Option<RequestId>) -> Result<(), TransportError> {
        let manager = self.manager.upgrade().ok_or(TransportError::Closed)?;
        manager.enqueue(&self.session_id, message, related)
    }

    fn abandon(&self, id: &RequestId) {
        if let Some(manager) = self.manager.upgrade() {
            manager.abandon(&self.session_id, id);
        }
    }
}

enum LeaseKind {
    Request { pending: HashSet<RequestId> },
    Standalone,
}

/// An attached stream. Dropping it detaches the stream and releases its
/// claims, so undelivered messages go to the next stream instead.
pub struct StreamLease {
    manager: Arc<SessionManager>,
    session_id: Arc<str>,
    lease_id: u64,
    kind: LeaseKind,
    replay: VecDeque<Queued>,
    last_event_id: Option<u64>,
}

impl StreamLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Event id of the message `next` returned last, if it was buffered.
    pub fn last_event_id(&self) -> Option<u64> {
        self.last_event_id
    }

    pub async fn next(&mut self) -> Delivery {
        loop {
            let notify = self
                .manager
                .sessions
                .lock()
                .get(&*self.session_id)
                .map(|session| Arc::clone(&session.notify));
            let Some(notify) = notify else {
                return Delivery::Gone;
            };
            let notified = notify.notified();
            if let Some(delivery) = self.poll() {
                return delivery;
            }
            notified.await;
        }
    }

    fn poll(&mut self) -> Option<Delivery> {
        self.last_event_id = None;
        let mut sessions = self.manager.sessions.lock();
        let Some(session) = sessions.get_mut(&*self.session_id) else {
            return Some(Delivery::Gone);
        };

        if !session.failed {
            if let Some(queued) = self.replay.pop_front() {
                self.last_event_id = Some(queued.event_id);
                return Some(Delivery::Message(queued.message));
            }
        }

        if session.failed {
            let LeaseKind::Request { pending } = &mut self.kind else {
                return Some(Delivery::Gone);
            };
            let Some(id) = pending.iter().next().cloned() else {
                return Some(Delivery::Gone);
            };
            pending.remove(&id);
            let error = ProtocolError::Transport(TransportError::SessionFailed(
                self.session_id.to_string(),
            ));
            return Some(Delivery::Message(error.into_message(Some(id))));
        }

        let index = session.outbound.iter().position(|queued| match &self.kind {
            LeaseKind::Request { pending } => queued
                .related
                .as_ref()
                .is_some_and(|id| pending.contains(id)),
            LeaseKind::Standalone => queued
                .related
                .as_ref()
                .map_or(true, |id| !session.claims.contains_key(id)),
        });

        if let Some(queued) = index.and_then(|index| session.outbound.remove(index)) {
            if let (LeaseKind::Request { pending }, Some(id)) = (&mut self.kind, queued.message.id()) {
                if queued.message.is_terminal() {
                    pending.remove(id);
                    if session.claims.get(id) == Some(&self.lease_id) {
                        session.claims.remove(id);
                    }
                }
            }
            session.last_seen_at = Instant::now();
            self.last_event_id = Some(queued.event_id);
            let message = queued.message.clone();
            if matches!(self.kind, LeaseKind::Standalone) {
                session.retain(queued, self.manager.options.buffer_capacity);
            }
            return Some(Delivery::Message(message));
        }

        match &self.kind {
            LeaseKind::Request { pending } if pending.iter().all(|id| !session.open.contains(id)) => {
                Some(Delivery::Settled)
            }
            _ => None,
        }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let mut sessions = self.manager.sessions.lock();
        let Some(session) = sessions.get_mut(&*self.session_id) else {
            return;
        };
        session.streams = session.streams.saturating_sub(1);
        if let LeaseKind::Request { pending } = &self.kind {
            for id in pending {
                if session.claims.get(id) == Some(&self.lease_id) {
                    session.claims.remove(id);
                }
            }
        }
        session.last_seen_at = Instant::now();
        session.notify.notify_waiters();
    }
}
