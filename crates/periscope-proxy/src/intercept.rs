//! Response interception and ordered emission.
//!
//! The relay hands every captured response here. Responses that are not
//! `200` + `text/plain`, or that arrive while no session is active, are
//! observed and dropped. Matching responses reserve a ticket and decode on
//! their own task; the sequencer then serializes emission so the output
//! channel sees decoded text in the order the responses were observed, not
//! the order decoding happened to finish.

use std::sync::Arc;

use periscope_core::decode;
use periscope_core::sequencer::Ticket;
use periscope_core::session::{Session, SessionRegistry, StreamItem};

/// The only content type that is decoded and republished.
pub const WATCHED_CONTENT_TYPE: &str = "text/plain";

/// Response hook shared by all relay connections.
#[derive(Clone)]
pub struct Interceptor {
    registry: Arc<SessionRegistry>,
}

impl Interceptor {
    /// Creates an interceptor dispatching into the given registry.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Observes one raw response dump.
    ///
    /// Never blocks the relay: matching responses are decoded on a spawned
    /// task, and any per-response failure is contained there.
    pub fn observe(&self, raw: &[u8]) {
        let (head, body) = match decode::split_response(raw) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::warn!(%error, "discarding unparseable response");
                return;
            }
        };
        let head = String::from_utf8_lossy(head).into_owned();

        let status = match decode::status_code(&head) {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(%error, "discarding response without status");
                return;
            }
        };
        if status != 200 {
            tracing::debug!(status, "skipping non-200 response");
            return;
        }

        let media = match decode::content_type(&head) {
            Ok(media) => media,
            Err(error) => {
                tracing::debug!(%error, "skipping response without content type");
                return;
            }
        };
        if media != WATCHED_CONTENT_TYPE {
            tracing::debug!(content_type = %media, "skipping unwatched content type");
            return;
        }

        let session = match self.registry.active() {
            Ok(session) => session,
            Err(_) => {
                tracing::debug!("no active session, response observed but not decoded");
                return;
            }
        };

        let content_length = decode::declared_content_length(&head);
        let transfer_encodings = decode::transfer_encodings(&head);
        let content_encodings = decode::content_encodings(&head);
        let ticket = session.sequencer().reserve();
        tracing::debug!(
            %ticket,
            content_length,
            ?transfer_encodings,
            ?content_encodings,
            "decoding response"
        );

        let body = body.to_vec();
        tokio::spawn(decode_and_emit(
            session,
            ticket,
            body,
            content_length,
            transfer_encodings,
            content_encodings,
        ));
    }
}

/// Decodes one response body and emits it in ticket order.
///
/// The ticket is cycled through acquire/release on every path, including
/// decode failure; skipping release would starve every later response.
async fn decode_and_emit(
    session: Arc<Session>,
    ticket: Ticket,
    body: Vec<u8>,
    content_length: i64,
    transfer_encodings: Vec<String>,
    content_encodings: Vec<String>,
) {
    let decoded = decode::decode_body(
        &body,
        content_length,
        &transfer_encodings,
        &content_encodings,
    );

    if let Err(violation) = session.sequencer().acquire(ticket).await {
        tracing::error!(%violation, "delivery order corrupted");
        let _ = session
            .error_signal()
            .try_send(format!("delivery order corrupted: {violation}"));
        return;
    }

    match decoded {
        Ok(segments) => {
            if session.is_receivable() {
                for segment in segments {
                    let text = String::from_utf8_lossy(&segment).into_owned();
                    if session.output().send(StreamItem::Data(text)).await.is_err() {
                        tracing::debug!(%ticket, "output channel closed, discarding segment");
                        break;
                    }
                }
            } else {
                tracing::debug!(%ticket, "session not receivable, output discarded");
            }
        }
        Err(error) => {
            tracing::warn!(%ticket, %error, "response dropped from stream");
        }
    }

    if let Err(violation) = session.sequencer().release(ticket) {
        tracing::error!(%violation, "delivery order corrupted on release");
        let _ = session
            .error_signal()
            .try_send(format!("delivery order corrupted: {violation}"));
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use periscope_core::session::{SessionRegistry, StreamItem, DEFAULT_SESSION};

    use super::*;

    fn plain_response(body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn chunked_gzip_response(payload: &[u8]) -> Vec<u8> {
        let compressed = gzip(payload);
        let mut raw = b"HTTP/1.1 200 OK\r\n\
                        Content-Type: text/plain\r\n\
                        Content-Encoding: gzip\r\n\
                        Transfer-Encoding: chunked\r\n\
                        \r\n"
            .to_vec();
        raw.extend(format!("{:x}\r\n", compressed.len()).into_bytes());
        raw.extend_from_slice(&compressed);
        raw.extend_from_slice(b"\r\n0\r\n\r\n");
        raw
    }

    fn active_session(registry: &SessionRegistry) -> Arc<Session> {
        let session = registry.create(DEFAULT_SESSION).unwrap();
        session.set_receivable(true);
        session
    }

    #[tokio::test]
    async fn plain_response_reaches_the_output_channel() {
        let registry = Arc::new(SessionRegistry::new());
        let session = active_session(&registry);
        let mut output = session.take_output().unwrap();

        Interceptor::new(registry).observe(&plain_response(b"payload"));

        assert_eq!(
            output.recv().await,
            Some(StreamItem::Data("payload".into()))
        );
    }

    #[tokio::test]
    async fn chunked_gzip_response_is_fully_decoded() {
        let registry = Arc::new(SessionRegistry::new());
        let session = active_session(&registry);
        let mut output = session.take_output().unwrap();

        Interceptor::new(registry).observe(&chunked_gzip_response(b"decoded plaintext"));

        assert_eq!(
            output.recv().await,
            Some(StreamItem::Data("decoded plaintext".into()))
        );
    }

    #[tokio::test]
    async fn non_200_and_unwatched_responses_are_skipped() {
        let registry = Arc::new(SessionRegistry::new());
        let session = active_session(&registry);
        let interceptor = Interceptor::new(registry);

        interceptor.observe(b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnope");
        interceptor.observe(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html></html>");
        interceptor.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

        assert_eq!(session.sequencer().reserved(), 0);
    }

    #[tokio::test]
    async fn no_active_session_observes_without_decoding() {
        let registry = Arc::new(SessionRegistry::new());
        // Never panics or reserves anything; there is nothing to reserve on.
        Interceptor::new(registry.clone()).observe(&plain_response(b"payload"));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn finish_order_does_not_reorder_delivery() {
        let registry = Arc::new(SessionRegistry::new());
        let session = active_session(&registry);
        let mut output = session.take_output().unwrap();

        // Tickets 0, 1, 2 finish decoding in the order 2, 0, 1: the decode
        // tasks sleep before acquiring, with ticket 2 sleeping least.
        for (ticket_delay, text) in [(20u64, "first"), (40, "second"), (0, "third")] {
            let ticket = session.sequencer().reserve();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ticket_delay)).await;
                session.sequencer().acquire(ticket).await.unwrap();
                session
                    .output()
                    .send(StreamItem::Data(text.into()))
                    .await
                    .unwrap();
                session.sequencer().release(ticket).unwrap();
            });
        }

        assert_eq!(output.recv().await, Some(StreamItem::Data("first".into())));
        assert_eq!(output.recv().await, Some(StreamItem::Data("second".into())));
        assert_eq!(output.recv().await, Some(StreamItem::Data("third".into())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_decode_is_absent_without_disturbing_order() {
        let registry = Arc::new(SessionRegistry::new());
        let session = active_session(&registry);
        let mut output = session.take_output().unwrap();
        let interceptor = Interceptor::new(registry);

        interceptor.observe(&plain_response(b"before"));
        // Chunked body with a malformed size line: decode fails, but the
        // ticket is still released so the next response flows.
        interceptor.observe(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nbad\r\n",
        );
        interceptor.observe(&plain_response(b"after"));

        assert_eq!(output.recv().await, Some(StreamItem::Data("before".into())));
        assert_eq!(output.recv().await, Some(StreamItem::Data("after".into())));
    }

    #[tokio::test]
    async fn receivable_gate_discards_output() {
        let registry = Arc::new(SessionRegistry::new());
        let session = active_session(&registry);
        session.set_receivable(false);
        let mut output = session.take_output().unwrap();
        let interceptor = Interceptor::new(registry);

        interceptor.observe(&plain_response(b"suppressed"));
        // The ticket cycles even though nothing is emitted.
        while session.sequencer().head() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        session.set_receivable(true);
        interceptor.observe(&plain_response(b"visible"));
        assert_eq!(
            output.recv().await,
            Some(StreamItem::Data("visible".into()))
        );
    }
}
