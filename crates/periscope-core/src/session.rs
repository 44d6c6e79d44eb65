//! Session registry and channel bundles.
//!
//! A session is one proxy + PAC + decode pipeline instance. Its bundle of
//! channels and its sequencer are created together and torn down together;
//! the registry is the only place that owns bundles, and it is passed by
//! handle to the interceptor, the lifecycle controller, and the control
//! plane (no process-global state).
//!
//! Channel roles:
//! - `proxy_control` / `pac_control`: capacity-1 stop signals for the two
//!   listeners.
//! - `error_signal`: capacity-1 defect reporting channel for pipeline tasks.
//! - `output`: the bounded queue of decoded text the streaming endpoint
//!   consumes.
//!
//! Receiver halves are handed out at most once (take semantics); a second
//! subscriber is a wiring defect, not a runtime condition. Sends on a
//! closed channel return errors rather than panicking, so teardown order
//! cannot corrupt a session mid-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sequencer::Sequencer;

/// Key of the session the control plane drives by default.
pub const DEFAULT_SESSION: &str = "default";

/// Capacity of the decoded-output queue.
pub const OUTPUT_BUFFER: usize = 32;

/// Capacity of the control channels.
const CONTROL_BUFFER: usize = 1;

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A session with this key is already registered.
    #[error("session already exists: {0:?}")]
    AlreadyExists(String),

    /// No session with this key is registered.
    #[error("session not found: {0:?}")]
    NotFound(String),

    /// The single-active-session lookup needs exactly one registration.
    #[error("expected exactly one active session, found {0}")]
    NotExclusive(usize),

    /// A receiver half was requested twice.
    #[error("{0} receiver was already taken")]
    ReceiverTaken(&'static str),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Token sent over the control channels to stop a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Shut the listener down gracefully.
    Stop,
}

/// An entry on a session's output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// One decoded text segment.
    Data(String),
    /// Sentinel closing the stream.
    Stop,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Bundle created, listeners not yet running.
    #[default]
    Uninitialized,
    /// Listeners up, pipeline emitting.
    Running,
    /// Stop requested, drain in progress.
    Stopping,
    /// Removed from the registry.
    Terminated,
}

impl SessionState {
    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One proxy + PAC + decode pipeline instance.
pub struct Session {
    key: String,
    sequencer: Sequencer,
    receivable: AtomicBool,
    state: RwLock<SessionState>,

    proxy_control: mpsc::Sender<ControlSignal>,
    pac_control: mpsc::Sender<ControlSignal>,
    error_signal: mpsc::Sender<String>,
    output: mpsc::Sender<StreamItem>,

    proxy_control_rx: Mutex<Option<mpsc::Receiver<ControlSignal>>>,
    pac_control_rx: Mutex<Option<mpsc::Receiver<ControlSignal>>>,
    error_signal_rx: Mutex<Option<mpsc::Receiver<String>>>,
    output_rx: Mutex<Option<mpsc::Receiver<StreamItem>>>,
}

impl Session {
    fn new(key: &str) -> Self {
        let (proxy_control, proxy_control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (pac_control, pac_control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (error_signal, error_signal_rx) = mpsc::channel(CONTROL_BUFFER);
        let (output, output_rx) = mpsc::channel(OUTPUT_BUFFER);

        Self {
            key: key.to_string(),
            sequencer: Sequencer::new(),
            receivable: AtomicBool::new(false),
            state: RwLock::new(SessionState::Uninitialized),
            proxy_control,
            pac_control,
            error_signal,
            output,
            proxy_control_rx: Mutex::new(Some(proxy_control_rx)),
            pac_control_rx: Mutex::new(Some(pac_control_rx)),
            error_signal_rx: Mutex::new(Some(error_signal_rx)),
            output_rx: Mutex::new(Some(output_rx)),
        }
    }

    /// Returns the session key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the session's delivery sequencer.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Whether decoded output may currently be enqueued.
    pub fn is_receivable(&self) -> bool {
        self.receivable.load(Ordering::Acquire)
    }

    /// Opens or closes the emission gate. While closed, decode tasks still
    /// run and release their tickets, but their output is discarded.
    pub fn set_receivable(&self, receivable: bool) {
        self.receivable.store(receivable, Ordering::Release);
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Moves the session to a new lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    /// Sender for the proxy listener's stop signal.
    pub fn proxy_control(&self) -> &mpsc::Sender<ControlSignal> {
        &self.proxy_control
    }

    /// Sender for the PAC listener's stop signal.
    pub fn pac_control(&self) -> &mpsc::Sender<ControlSignal> {
        &self.pac_control
    }

    /// Sender for defect reports from pipeline and listener tasks.
    pub fn error_signal(&self) -> &mpsc::Sender<String> {
        &self.error_signal
    }

    /// Sender for decoded output.
    pub fn output(&self) -> &mpsc::Sender<StreamItem> {
        &self.output
    }

    /// Takes the proxy listener's control receiver. Take-once.
    pub fn take_proxy_control(&self) -> Result<mpsc::Receiver<ControlSignal>> {
        self.proxy_control_rx
            .lock()
            .take()
            .ok_or(SessionError::ReceiverTaken("proxy control"))
    }

    /// Takes the PAC listener's control receiver. Take-once.
    pub fn take_pac_control(&self) -> Result<mpsc::Receiver<ControlSignal>> {
        self.pac_control_rx
            .lock()
            .take()
            .ok_or(SessionError::ReceiverTaken("pac control"))
    }

    /// Takes the defect-report receiver. Take-once.
    pub fn take_error_signal(&self) -> Result<mpsc::Receiver<String>> {
        self.error_signal_rx
            .lock()
            .take()
            .ok_or(SessionError::ReceiverTaken("error signal"))
    }

    /// Takes the decoded-output receiver. Take-once: the stream endpoint is
    /// the only consumer.
    pub fn take_output(&self) -> Result<mpsc::Receiver<StreamItem>> {
        self.output_rx
            .lock()
            .take()
            .ok_or(SessionError::ReceiverTaken("output"))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("receivable", &self.is_receivable())
            .field("reserved", &self.sequencer.reserved())
            .finish()
    }
}

/// Lookup table from session key to channel bundle.
///
/// Create/remove are mutually exclusive with lookups, so decode dispatch
/// never observes a half-created or half-removed bundle.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a session bundle under `key`.
    pub fn create(&self, key: &str) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(key) {
            return Err(SessionError::AlreadyExists(key.to_string()));
        }
        let session = Arc::new(Session::new(key));
        sessions.insert(key.to_string(), session.clone());
        tracing::debug!(key, "session registered");
        Ok(session)
    }

    /// Looks up a session by key.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(key).cloned()
    }

    /// Whether a session with `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.sessions.read().contains_key(key)
    }

    /// Removes a session, marking it terminated and closing its emission
    /// gate. Channels close when the last handle to the bundle drops; any
    /// late send is a returned error on the sender side.
    pub fn remove(&self, key: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .write()
            .remove(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        session.set_receivable(false);
        session.set_state(SessionState::Terminated);
        tracing::debug!(key, "session removed");
        Ok(session)
    }

    /// Returns the single active session.
    ///
    /// Supported only while exactly one session is registered; any other
    /// count fails so callers cannot silently pick an arbitrary session.
    pub fn active(&self) -> Result<Arc<Session>> {
        let sessions = self.sessions.read();
        if sessions.len() != 1 {
            return Err(SessionError::NotExclusive(sessions.len()));
        }
        sessions
            .values()
            .next()
            .cloned()
            .ok_or(SessionError::NotExclusive(0))
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_get_contains() {
        let registry = SessionRegistry::new();
        assert!(!registry.contains(DEFAULT_SESSION));

        let session = registry.create(DEFAULT_SESSION).unwrap();
        assert_eq!(session.key(), DEFAULT_SESSION);
        assert!(registry.contains(DEFAULT_SESSION));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(DEFAULT_SESSION).is_some());
    }

    #[test]
    fn duplicate_create_fails() {
        let registry = SessionRegistry::new();
        registry.create(DEFAULT_SESSION).unwrap();
        let err = registry.create(DEFAULT_SESSION).unwrap_err();
        assert_eq!(err, SessionError::AlreadyExists(DEFAULT_SESSION.into()));
    }

    #[test]
    fn remove_marks_terminated() {
        let registry = SessionRegistry::new();
        let session = registry.create(DEFAULT_SESSION).unwrap();
        session.set_receivable(true);
        session.set_state(SessionState::Running);

        let removed = registry.remove(DEFAULT_SESSION).unwrap();
        assert_eq!(removed.state(), SessionState::Terminated);
        assert!(!removed.is_receivable());
        assert!(!registry.contains(DEFAULT_SESSION));

        let err = registry.remove(DEFAULT_SESSION).unwrap_err();
        assert_eq!(err, SessionError::NotFound(DEFAULT_SESSION.into()));
    }

    #[test]
    fn active_requires_exactly_one_session() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.active().unwrap_err(),
            SessionError::NotExclusive(0)
        );

        registry.create("solo").unwrap();
        assert_eq!(registry.active().unwrap().key(), "solo");

        registry.create("second").unwrap();
        assert_eq!(
            registry.active().unwrap_err(),
            SessionError::NotExclusive(2)
        );
    }

    #[test]
    fn receivers_are_take_once() {
        let registry = SessionRegistry::new();
        let session = registry.create(DEFAULT_SESSION).unwrap();

        assert!(session.take_output().is_ok());
        assert_eq!(
            session.take_output().unwrap_err(),
            SessionError::ReceiverTaken("output")
        );
        assert!(session.take_proxy_control().is_ok());
        assert!(session.take_pac_control().is_ok());
        assert!(session.take_error_signal().is_ok());
    }

    #[tokio::test]
    async fn output_channel_delivers_in_send_order() {
        let registry = SessionRegistry::new();
        let session = registry.create(DEFAULT_SESSION).unwrap();
        let mut output = session.take_output().unwrap();

        session
            .output()
            .send(StreamItem::Data("one".into()))
            .await
            .unwrap();
        session.output().send(StreamItem::Stop).await.unwrap();

        assert_eq!(output.recv().await, Some(StreamItem::Data("one".into())));
        assert_eq!(output.recv().await, Some(StreamItem::Stop));
    }

    #[tokio::test]
    async fn send_after_teardown_is_an_error_not_a_panic() {
        let registry = SessionRegistry::new();
        let session = registry.create(DEFAULT_SESSION).unwrap();
        let output = session.take_output().unwrap();
        drop(output);
        registry.remove(DEFAULT_SESSION).unwrap();

        assert!(session
            .output()
            .send(StreamItem::Data("late".into()))
            .await
            .is_err());
    }

    #[test]
    fn new_session_defaults() {
        let registry = SessionRegistry::new();
        let session = registry.create(DEFAULT_SESSION).unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.is_receivable());
        assert_eq!(session.sequencer().reserved(), 0);
    }
}
