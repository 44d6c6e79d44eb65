//! Periscope Core - decoding, ordering, and session bookkeeping.
//!
//! This crate holds the pieces of the tap pipeline that are independent of
//! any socket: the raw-response decoder, the ticket sequencer that turns
//! concurrent decode completion back into arrival order, and the registry of
//! session channel bundles shared between the proxy and the control plane.
//!
//! ## Pipeline
//!
//! ```text
//! raw response ──▶ decode ──▶ reserve ticket ──▶ await head of line ──▶ output channel
//!                  (decode)    (sequencer)        (sequencer)            (session)
//! ```
//!
//! Each intercepted response is decoded on its own task; the [`sequencer`]
//! guarantees that decoded text reaches the session's output channel in the
//! order the responses were observed, no matter which task finishes first.

pub mod decode;
pub mod sequencer;
pub mod session;

pub use decode::{DecodeError, DecodedBody};
pub use sequencer::{OrderingViolation, Sequencer, Ticket};
pub use session::{
    ControlSignal, Session, SessionError, SessionRegistry, SessionState, StreamItem,
    DEFAULT_SESSION, OUTPUT_BUFFER,
};
