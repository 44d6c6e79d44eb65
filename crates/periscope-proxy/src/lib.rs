//! Periscope Proxy - response tap for a fixed upstream.
//!
//! This crate provides the data plane of Periscope: a reverse proxy pinned
//! to one allowlisted upstream that relays traffic byte-for-byte and hands a
//! copy of every response to the decode pipeline, plus the PAC file server
//! that points browsers at the proxy, and the lifecycle controller that the
//! control plane drives.
//!
//! ## Architecture
//!
//! ```text
//! Client ──▶ relay listener ──▶ upstream (fixed, allowlisted)
//!                │  ▲                │
//!                │  └── raw bytes ◀──┘  (response streamed back verbatim)
//!                │
//!                └──▶ interceptor: 200 + text/plain?
//!                          │
//!                          ▼
//!                 reserve ticket ─▶ decode ─▶ acquire ─▶ output channel
//!                                                          (in ticket order)
//! ```
//!
//! Responses are observed, never rewritten: the bytes the client receives
//! are exactly the bytes the upstream sent.

pub mod error;
pub mod intercept;
pub mod lifecycle;
pub mod pac;
pub mod relay;
pub mod targets;
pub mod validate;

pub use error::{ProxyError, RelayError, Result};
pub use intercept::{Interceptor, WATCHED_CONTENT_TYPE};
pub use lifecycle::{LifecycleController, StopFailure, StopReport, STOP_TIMEOUT};
pub use targets::{resolve, DEFAULT_UPSTREAM_PORT, KNOWN_UPSTREAMS};
pub use validate::{validate_start, ValidationError, RESERVED_PORT_CEILING};
