//! Session store — stateful context reconstruction for stateless protocols.
//!
//! Agent traffic is request/response, but security analysis needs
//! *conversation context*: what the agent said five turns ago matters when
//! detecting multi-hop injection chains. Each session keeps a bounded ring
//! buffer of recent messages; expired sessions are removed by a background
//! sweep task.
//!
//! Memory model: each session holds at most `max_messages` entries and the
//! TTL defaults to one hour, so total memory stays proportional to the
//! number of active sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interval between TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The side of the conversation a buffered message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Agent,
    Server,
}

/// One entry in a session's ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: Value,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Reconstructed conversation context for one agent connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    messages: VecDeque<SessionMessage>,
    max_messages: usize,
}

impl Session {
    pub fn new(session_id: impl Into<String>, agent_id: impl Into<String>, max_messages: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            created_at: now,
            last_active: now,
            messages: VecDeque::with_capacity(max_messages.min(64)),
            max_messages,
        }
    }

    /// Append a message, evicting from the front when the buffer is full.
    pub fn push(&mut self, role: MessageRole, content: Value) {
        self.messages.push_back(SessionMessage {
            role,
            content,
            timestamp: Utc::now(),
        });
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
        self.last_active = Utc::now();
    }

    /// Snapshot of the most recent `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<SessionMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A session handle shared between a transport and the store. Locks are
/// held only for short synchronous sections, never across an await.
pub type SharedSession = Arc<Mutex<Session>>;

/// A session is expired only when its idle age strictly exceeds the TTL;
/// age exactly equal to the TTL is retained.
fn is_expired(now: DateTime<Utc>, last_active: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    now - last_active > ttl
}

/// In-memory session store with TTL-based eviction.
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SharedSession>>>,
    buffer_size: usize,
    ttl: chrono::Duration,
    sweep_guard: Arc<Mutex<()>>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(buffer_size: usize, ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            buffer_size,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            sweep_guard: Arc::new(Mutex::new(())),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Retrieve an existing session or create a new one. Both paths stamp
    /// `last_active`.
    pub async fn get_or_create(&self, session_id: &str, agent_id: &str) -> SharedSession {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            session.lock().await.last_active = Utc::now();
            return Arc::clone(session);
        }

        debug!(session_id, agent_id, "created new session");
        let session = Arc::new(Mutex::new(Session::new(
            session_id,
            agent_id,
            self.buffer_size,
        )));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    /// Look up a session without creating or touching it.
    pub async fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Start the background TTL sweeper.
    pub fn start(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                store.sweep_now().await;
            }
        });
        if let Ok(mut slot) = self.sweeper.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
        info!(buffer = self.buffer_size, ttl_secs = self.ttl.num_seconds(), "session store started");
    }

    /// Remove sessions whose idle age strictly exceeds the TTL. The sweep
    /// guard keeps sweeps from running concurrently.
    pub async fn sweep_now(&self) -> usize {
        let _guard = self.sweep_guard.lock().await;
        let now = Utc::now();

        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                let last_active = session.lock().await.last_active;
                if is_expired(now, last_active, self.ttl) {
                    expired.push(id.clone());
                }
            }
        }

        if expired.is_empty() {
            return 0;
        }

        let mut sessions = self.sessions.write().await;
        for id in &expired {
            sessions.remove(id);
        }
        warn!(count = expired.len(), "swept expired sessions");
        expired.len()
    }

    /// Cancel the sweeper and clear all sessions.
    pub async fn stop(&self) {
        let handle = self.sweeper.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let mut sessions = self.sessions.write().await;
        let cleared = sessions.len();
        sessions.clear();
        info!(cleared, "session store stopped");
    }
}
