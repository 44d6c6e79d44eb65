//! PAC file server.
//!
//! Serves the proxy auto-configuration script that steers browsers at the
//! tap: allowlisted upstream hosts go through the relay, everything else
//! goes direct. One route, shut down by the session's pac-control channel
//! or a process interrupt.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use periscope_core::session::ControlSignal;

use crate::targets;

/// Media type registered for PAC scripts.
pub const PAC_MEDIA_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Path the script is served under.
pub const PAC_PATH: &str = "/proxy.pac";

/// Renders the PAC script for a relay listening on `proxy_port`.
pub fn pac_body(proxy_port: u16) -> String {
    let conditions: Vec<String> = targets::known_addresses()
        .map(|addr| format!("host == \"{addr}\""))
        .collect();
    format!(
        "function FindProxyForURL(url, host) {{\n  \
         if ({}) {{\n    \
         return \"PROXY 127.0.0.1:{}\";\n  \
         }}\n  \
         return \"DIRECT\";\n}}\n",
        conditions.join(" || "),
        proxy_port
    )
}

/// Runs the PAC listener until a stop signal or process interrupt.
pub async fn run(
    listener: TcpListener,
    proxy_port: u16,
    mut control: mpsc::Receiver<ControlSignal>,
) {
    let body = Arc::new(pac_body(proxy_port));
    let app = Router::new()
        .route(PAC_PATH, get(serve_pac))
        .with_state(body);

    let shutdown = async move {
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);
        tokio::select! {
            _ = &mut interrupt => tracing::info!("interrupt received, stopping pac listener"),
            signal = control.recv() => match signal {
                Some(ControlSignal::Stop) => {
                    tracing::info!("stop signal received, stopping pac listener");
                }
                None => tracing::debug!("control channel closed, stopping pac listener"),
            },
        }
    };

    if let Err(error) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(%error, "pac server failed");
    }
    tracing::info!("pac listener stopped");
}

async fn serve_pac(State(body): State<Arc<String>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PAC_MEDIA_TYPE)],
        body.as_str().to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pac_script_routes_known_upstreams_through_the_proxy() {
        let body = pac_body(48123);
        assert!(body.starts_with("function FindProxyForURL(url, host)"));
        assert!(body.contains("PROXY 127.0.0.1:48123"));
        assert!(body.contains("return \"DIRECT\";"));
        for addr in targets::known_addresses() {
            assert!(body.contains(&format!("host == \"{addr}\"")));
        }
    }
}
