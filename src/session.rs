use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broadcaster, SubscriberId, DEFAULT_QUEUE_CAPACITY};
use crate::protocol::{AnalysisRequest, SessionEvent};

/// Lifecycle state of a session.
///
/// `Running` is the only entry state. `Completed` and `Failed` are terminal:
/// nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session already finished: {0}")]
    AlreadyFinished(String),
}

/// Point-in-time copy of a session, as returned by `GET /api/session/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    pub output: Vec<String>,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub company_name: String,
    pub stock_code: String,
    pub market: String,
    pub subscribers: usize,
}

/// Compact listing entry for `GET /api/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub company_name: String,
    pub stock_code: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Everything that changes after creation. Guarded by one lock per session.
#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    output: Vec<String>,
    result: String,
    error: Option<String>,
    ended_at: Option<DateTime<Utc>>,
    broadcaster: Broadcaster,
}

impl SessionState {
    fn terminal_event(&self) -> Option<SessionEvent> {
        match self.status {
            SessionStatus::Running => None,
            SessionStatus::Completed => Some(SessionEvent::completed(self.result.clone())),
            SessionStatus::Failed => Some(SessionEvent::error(
                self.error.clone().unwrap_or_default(),
            )),
        }
    }
}

/// One analysis job and its observers.
///
/// Cheap to clone: clones share the same state. The job runner is the only
/// caller of [`Session::publish`] and friends; connection handlers only
/// attach and detach.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub request: Arc<AnalysisRequest>,
    pub started_at: DateTime<Utc>,
    /// Fires when the job should stop early (explicit cancel or shutdown).
    pub cancelled: CancellationToken,
    state: Arc<RwLock<SessionState>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("company_name", &self.request.company_name)
            .field("stock_code", &self.request.stock_code)
            .finish_non_exhaustive()
    }
}

/// A live subscription created by [`Session::attach`].
///
/// Yields every event published after the attach point. Dropping it detaches
/// the subscriber from the session.
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::Receiver<SessionEvent>,
    session: Session,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next live event. `None` once the session has finished (after the
    /// terminal event) or if the subscriber was dropped for falling behind.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session.detach(self.id);
    }
}

impl Session {
    pub fn new(id: impl Into<String>, request: AnalysisRequest, queue_capacity: usize) -> Self {
        let id = id.into();
        Self {
            request: Arc::new(request),
            started_at: Utc::now(),
            cancelled: CancellationToken::new(),
            state: Arc::new(RwLock::new(SessionState {
                status: SessionStatus::Running,
                output: Vec::new(),
                result: String::new(),
                error: None,
                ended_at: None,
                broadcaster: Broadcaster::new(id.clone(), queue_capacity),
            })),
            id,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().ended_at
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().broadcaster.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            id: self.id.clone(),
            status: state.status,
            output: state.output.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            start_time: self.started_at,
            end_time: state.ended_at,
            company_name: self.request.company_name.clone(),
            stock_code: self.request.stock_code.clone(),
            market: self.request.market.clone(),
            subscribers: state.broadcaster.len(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state.read();
        SessionSummary {
            id: self.id.clone(),
            status: state.status,
            company_name: self.request.company_name.clone(),
            stock_code: self.request.stock_code.clone(),
            start_time: self.started_at,
            end_time: state.ended_at,
        }
    }

    /// Attach a new subscriber.
    ///
    /// Returns the history to replay (every output line so far, followed by
    /// the terminal event if the session already finished) and a
    /// subscription carrying everything published afterwards. Snapshot and
    /// registration happen under the same write lock that `publish` takes,
    /// so the replay and the live stream neither overlap nor leave a gap.
    pub fn attach(&self) -> (Vec<SessionEvent>, Subscription) {
        let mut state = self.state.write();
        let mut replay: Vec<SessionEvent> = state
            .output
            .iter()
            .map(|line| SessionEvent::output(line.clone()))
            .collect();
        replay.extend(state.terminal_event());
        let (id, events) = state.broadcaster.subscribe();
        drop(state);

        let subscription = Subscription {
            id,
            events,
            session: self.clone(),
        };
        (replay, subscription)
    }

    /// Remove a subscriber. Detaching twice, or detaching an id that was
    /// never attached, is a no-op.
    pub fn detach(&self, id: SubscriberId) {
        if self.state.write().broadcaster.unsubscribe(id) {
            tracing::debug!(session = %self.id, subscriber = id, "subscriber detached");
        }
    }

    /// Apply `event` to the session and fan it out to every subscriber.
    ///
    /// Output lines are appended to the log. `Completed` and `Error` move the
    /// session to its terminal state and close the subscriber set. Once
    /// terminal, every further publish is rejected.
    pub fn publish(&self, event: SessionEvent) -> Result<(), SessionError> {
        let mut state = self.state.write();
        if state.status.is_terminal() {
            return Err(SessionError::AlreadyFinished(self.id.clone()));
        }

        match &event {
            SessionEvent::Output { data } => state.output.push(data.clone()),
            SessionEvent::Status { .. } => {}
            SessionEvent::Completed { result } => {
                state.status = SessionStatus::Completed;
                state.result = result.clone();
            }
            SessionEvent::Error { data } => {
                state.status = SessionStatus::Failed;
                state.error = Some(data.clone());
            }
        }
        if event.is_terminal() {
            state.ended_at.get_or_insert_with(Utc::now);
        }

        state.broadcaster.deliver(&event);
        if event.is_terminal() {
            state.broadcaster.close();
        }
        Ok(())
    }

    /// Transition to `Completed` with the final result.
    pub fn complete(&self, result: impl Into<String>) -> Result<(), SessionError> {
        self.publish(SessionEvent::completed(result))
    }

    /// Transition to `Failed` with a human-readable message.
    pub fn fail(&self, message: impl Into<String>) -> Result<(), SessionError> {
        self.publish(SessionEvent::error(message))
    }

    /// Record the end timestamp. Only the first call has an effect; a
    /// terminal `publish` has usually stamped it already.
    pub fn mark_ended(&self) -> bool {
        let mut state = self.state.write();
        if state.ended_at.is_some() {
            return false;
        }
        state.ended_at = Some(Utc::now());
        true
    }

    /// Ask the running job to stop. Returns `false` if the session has
    /// already finished, in which case nothing happens.
    pub fn cancel(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.cancelled.cancel();
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("registry is closed to new sessions")]
    Closed,
}

/// Limits applied by a [`SessionRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    /// Cap on retained sessions (running and finished). `None` = unlimited.
    pub max_sessions: Option<usize>,
    /// Queue depth handed to each session's broadcaster.
    pub subscriber_queue: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_sessions: None,
            subscriber_queue: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    limits: RegistryLimits,
    /// Set by `drain`; no sessions are created afterwards.
    closed: bool,
}

/// Process-wide map from session id to [`Session`].
///
/// The registry lock only guards insertion, lookup and removal; it never
/// covers session internals.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_limits(RegistryLimits::default())
    }

    pub fn with_limits(limits: RegistryLimits) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                limits,
                closed: false,
            })),
        }
    }

    /// Create a `Running` session for `request` and register it.
    ///
    /// The session is visible to `get` before this returns. Starting the job
    /// is the caller's business; this never waits on it.
    pub fn create(&self, request: AnalysisRequest) -> Result<Session, RegistryError> {
        let mut inner = self.inner.write();

        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if let Some(max) = inner.limits.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Session::new(id.clone(), request, inner.limits.subscriber_queue);
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Look up a session by id, returning a clone if found.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Summaries of all sessions, newest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Session> = self.inner.read().sessions.values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions.iter().map(Session::summary).collect();
        summaries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        summaries
    }

    /// Return the number of sessions.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Return true if the registry contains no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove finished sessions that ended before `cutoff`. Running sessions
    /// are kept.
    pub fn evict_ended_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let before = inner.sessions.len();
        inner.sessions.retain(|id, session| {
            let expired = session.is_finished()
                && session.ended_at().is_some_and(|ended| ended < cutoff);
            if expired {
                tracing::info!(session = %id, "evicting finished session");
            }
            !expired
        });
        before - inner.sessions.len()
    }

    /// Remove finished sessions that ended more than `ttl` ago.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        match cutoff {
            Some(cutoff) => self.evict_ended_before(cutoff),
            None => 0,
        }
    }

    /// Periodically evict expired sessions until `stop` fires.
    pub fn spawn_sweeper(
        &self,
        ttl: Duration,
        every: Duration,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = registry.evict_expired(ttl);
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = registry.len(), "session sweep");
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    }

    /// Close the registry to new sessions and cancel every running one.
    /// Called during server shutdown.
    ///
    /// Sessions stay registered so their final state remains queryable while
    /// the runners wind down. Returns the number of sessions cancelled.
    pub fn drain(&self) -> usize {
        let sessions: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.closed = true;
            inner.sessions.values().cloned().collect()
        };
        sessions.iter().filter(|session| session.cancel()).count()
    }
}
