//! Session lifecycle control.
//!
//! The controller owns starting and stopping a session's listeners through
//! the registry's channel bundle. A session moves through
//! `Uninitialized -> Running -> Stopping -> Terminated`; stop is
//! best-effort and non-blocking overall: each stop signal gets its own
//! bounded send, every attempt is made regardless of earlier outcomes, and
//! the bundle is removed from the registry unconditionally afterwards.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use periscope_core::session::{
    ControlSignal, Session, SessionRegistry, SessionState, StreamItem,
};

use crate::error::ProxyError;
use crate::intercept::Interceptor;
use crate::{pac, relay, validate};

/// Bound on each individual stop-signal send.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Why one stop signal did not land.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StopFailure {
    /// No session with this key is registered.
    #[error("session not found: {0:?}")]
    NotFound(String),

    /// Nobody consumed the signal in time; the listener is presumed gone.
    #[error("stop signal unacknowledged after {0:?}")]
    Timeout(Duration),

    /// The channel was already closed.
    #[error("listener already gone (channel closed)")]
    Closed,
}

/// Per-channel outcome of a stop request. `None` means the signal landed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Outcome of the stop sentinel on the output channel.
    pub output: Option<StopFailure>,
    /// Outcome of the proxy listener's stop signal.
    pub proxy: Option<StopFailure>,
    /// Outcome of the PAC listener's stop signal.
    pub pac: Option<StopFailure>,
}

impl StopReport {
    fn not_found(key: &str) -> Self {
        let failure = StopFailure::NotFound(key.to_string());
        Self {
            output: Some(failure.clone()),
            proxy: Some(failure.clone()),
            pac: Some(failure),
        }
    }

    /// Whether every stop signal landed.
    pub fn is_clean(&self) -> bool {
        self.output.is_none() && self.proxy.is_none() && self.pac.is_none()
    }
}

/// Starts and stops a session's proxy and PAC listeners.
pub struct LifecycleController {
    registry: Arc<SessionRegistry>,
}

impl LifecycleController {
    /// Creates a controller over the given registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry handle.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Validates the request, creates the session bundle, and brings up the
    /// relay and PAC listeners.
    ///
    /// On any failure after the bundle exists, the bundle is removed again;
    /// a failed start leaves no trace.
    pub async fn start(
        &self,
        key: &str,
        proxy_port: u16,
        pac_port: u16,
        target: &str,
    ) -> Result<(), ProxyError> {
        let upstream = validate::validate_start(proxy_port, pac_port, target)?;
        let session = self.registry.create(key)?;

        match self
            .spawn_listeners(&session, proxy_port, pac_port, upstream)
            .await
        {
            Ok(()) => {
                session.set_receivable(true);
                session.set_state(SessionState::Running);
                tracing::info!(key, proxy_port, pac_port, %upstream, "session started");
                Ok(())
            }
            Err(error) => {
                let _ = self.registry.remove(key);
                Err(error)
            }
        }
    }

    async fn spawn_listeners(
        &self,
        session: &Arc<Session>,
        proxy_port: u16,
        pac_port: u16,
        upstream: std::net::SocketAddr,
    ) -> Result<(), ProxyError> {
        let proxy_control = session.take_proxy_control()?;
        let pac_control = session.take_pac_control()?;
        let mut defects = session.take_error_signal()?;

        let proxy_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, proxy_port))
            .await
            .map_err(|source| ProxyError::Listen {
                role: "proxy",
                port: proxy_port,
                source,
            })?;
        let pac_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, pac_port))
            .await
            .map_err(|source| ProxyError::Listen {
                role: "pac",
                port: pac_port,
                source,
            })?;

        let interceptor = Interceptor::new(self.registry.clone());
        tokio::spawn(relay::run(
            proxy_listener,
            upstream,
            interceptor,
            proxy_control,
        ));
        tokio::spawn(pac::run(pac_listener, proxy_port, pac_control));
        tokio::spawn(async move {
            while let Some(report) = defects.recv().await {
                tracing::error!(%report, "pipeline defect reported");
            }
        });
        Ok(())
    }

    /// Stops a session and removes it from the registry.
    ///
    /// All three stop signals are attempted regardless of earlier outcomes,
    /// and each outcome is reported separately so the caller can tell which
    /// sub-listener was unresponsive.
    pub async fn stop(&self, key: &str) -> StopReport {
        let Some(session) = self.registry.get(key) else {
            tracing::warn!(key, "stop requested for unknown session");
            return StopReport::not_found(key);
        };
        session.set_state(SessionState::Stopping);
        session.set_receivable(false);

        let report = StopReport {
            output: send_with_timeout(session.output(), StreamItem::Stop).await,
            proxy: send_with_timeout(session.proxy_control(), ControlSignal::Stop).await,
            pac: send_with_timeout(session.pac_control(), ControlSignal::Stop).await,
        };

        if let Err(error) = self.registry.remove(key) {
            tracing::debug!(key, %error, "session vanished during stop");
        }

        if report.is_clean() {
            tracing::info!(key, "session stopped");
        } else {
            tracing::warn!(key, ?report, "session stopped with unacknowledged signals");
        }
        report
    }
}

async fn send_with_timeout<T>(sender: &mpsc::Sender<T>, token: T) -> Option<StopFailure> {
    match tokio::time::timeout(STOP_TIMEOUT, sender.send(token)).await {
        Ok(Ok(())) => None,
        Ok(Err(_)) => Some(StopFailure::Closed),
        Err(_) => Some(StopFailure::Timeout(STOP_TIMEOUT)),
    }
}
