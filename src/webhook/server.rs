use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::bootstrap::ShutdownState;
use crate::gateway::GatewayHandle;
use crate::provider::{require_basic_auth, ProviderEntry};

use super::WebhookContext;

pub const GREETING: &str = "You have successfully reached sms-over-xmpp.\n";
pub const UNKNOWN_PROVIDER: &str =
    "You have reached sms-over-xmpp, but the provider indicated in the URL is not known.\n";

async fn greeting() -> impl IntoResponse {
    GREETING
}

async fn unknown_provider() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, UNKNOWN_PROVIDER)
}

/// Mount every provider's routes under `/<name>`.
pub fn router(
    providers: &[ProviderEntry],
    gateway: &GatewayHandle,
    default_prefix: Option<&str>,
) -> Router {
    let mut app = Router::new().route("/", get(greeting));

    for entry in providers {
        let ctx = WebhookContext::new(entry.name(), gateway.clone(), default_prefix);
        let mut routes: Router = entry.provider.routes().with_state(ctx);

        if let Some(auth) = &entry.auth {
            routes = routes.layer(middleware::from_fn_with_state(
                Arc::new(auth.clone()),
                require_basic_auth,
            ));
        }

        debug!(
            provider = %entry.name(),
            kind = entry.provider.kind(),
            auth = entry.auth.is_some(),
            "mounting provider webhooks"
        );
        app = app.nest(&format!("/{}", entry.name()), routes);
    }

    app.fallback(unknown_provider)
}

/// Webhook HTTP server.
///
/// The socket is bound up front so a bad address fails startup; each
/// [`serve`](Self::serve) call accepts on a clone of it, which lets the
/// server be restarted without rebinding.
pub struct WebhookServer {
    listener: std::net::TcpListener,
    app: Router,
    shutdown_rx: watch::Receiver<ShutdownState>,
}

impl WebhookServer {
    pub fn bind(
        address: SocketAddr,
        app: Router,
        shutdown_rx: watch::Receiver<ShutdownState>,
    ) -> std::io::Result<Self> {
        let listener = std::net::TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            app,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown begins; in-flight requests are allowed to finish.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::from_std(self.listener.try_clone()?)?;
        info!(address = %listener.local_addr()?, "webhook server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        axum::serve(listener, self.app.clone())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx
                    .wait_for(|state| *state != ShutdownState::Running)
                    .await;
                info!("webhook server shutting down");
            })
            .await?;

        Ok(())
    }
}
