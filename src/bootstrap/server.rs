use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::admin::{AdminServer, AdminState};
use crate::config::Config;
use crate::gateway::{self, ProviderMap, ReceiptTracker, RouterContext};
use crate::provider::ProviderRegistry;
use crate::telemetry::Metrics;
use crate::webhook::{self, WebhookServer};
use crate::xmpp;

use super::shutdown::ShutdownManager;
use super::supervisor::supervise;

/// Timeout for carrier API calls
const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Main xmpp-smsd server
///
/// Tasks:
/// - XMPP transport: component stream with its own reconnect loop
/// - Router: supervised, owns contact and roster state
/// - Webhook server: supervised, one sub-router per provider
/// - Admin server: health, stats and metrics
/// - Shutdown manager: graceful drain with configurable timeout
pub struct Server {
    config: Arc<Config>,
    shutdown: Arc<ShutdownManager>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let shutdown = ShutdownManager::new(config.settings.shutdown.drain_timeout);

        Self {
            config: Arc::new(config),
            shutdown,
        }
    }

    /// Run the server until shutdown
    pub async fn run(self) -> Result<()> {
        let span = info_span!("xmpp-smsd", version = env!("CARGO_PKG_VERSION"));
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<()> {
        let config = self.config.clone();

        info!(
            domain = %config.xmpp.domain,
            server = %config.xmpp.server,
            users = config.users.len(),
            providers = config.providers.len(),
            rosters = config.rosters.len(),
            "starting xmpp-smsd"
        );

        let metrics = if config.admin.metrics {
            Some(Arc::new(Metrics::new()?))
        } else {
            None
        };

        let mapper = Arc::new(config.mapper()?);

        let client = reqwest::Client::builder()
            .timeout(PROVIDER_HTTP_TIMEOUT)
            .user_agent(concat!("xmpp-smsd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let entries = ProviderRegistry::with_builtin()
            .build_all(&config.providers, config.http.public_url.as_deref(), &client)
            .context("failed to configure providers")?;

        let mut providers: ProviderMap = HashMap::new();
        for user in &config.users {
            let entry = config
                .provider_for(user)
                .and_then(|p| entries.iter().find(|e| e.name() == p.name))
                .with_context(|| format!("no provider for user {}", user.jid))?;
            info!(user = %user.jid, provider = %entry.name(), "user configured");
            providers.insert(user.jid.bare(), entry.provider.clone());
        }

        let receipts = Arc::new(ReceiptTracker::new(config.gateway.receipt_capacity));

        // XMPP transport
        let (events_tx, events_rx) = mpsc::channel(config.xmpp.channel_size.max(1));
        let (transport, transport_status, xmpp_task) =
            xmpp::start(config.xmpp.clone(), events_tx, self.shutdown.subscribe());
        let xmpp_task = self.track("xmpp", xmpp_task);

        // Router
        let ctx = RouterContext {
            mapper: mapper.clone(),
            providers,
            receipts: receipts.clone(),
            transport,
            roster_users: config.rosters.clone(),
        };
        let (gateway, router_task) = gateway::start(
            ctx,
            events_rx,
            self.shutdown.subscribe(),
            config.gateway.channel_size,
            config.settings.supervisor,
        );
        let router_task = self.track("router", router_task);

        // Webhooks
        let app = webhook::router(&entries, &gateway, mapper.default_prefix());
        let webhook_server = Arc::new(
            WebhookServer::bind(config.http.address, app, self.shutdown.subscribe())
                .with_context(|| format!("failed to bind webhook listener on {}", config.http.address))?,
        );
        let webhook_task = {
            let server = webhook_server.clone();
            tokio::spawn(
                supervise(
                    "webhook",
                    config.settings.supervisor,
                    self.shutdown.subscribe(),
                    move || {
                        let server = server.clone();
                        async move { server.serve().await.context("webhook server failed") }
                    },
                )
                .instrument(info_span!("webhook")),
            )
        };
        let webhook_task = self.track("webhook", webhook_task);

        // Admin
        let admin_state = Arc::new(AdminState::new(
            transport_status,
            receipts,
            gateway,
            self.shutdown.clone(),
            metrics,
        ));
        let admin = AdminServer::new(&config.admin, admin_state, self.shutdown.clone());
        let admin_task = tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "admin server failed");
            }
        });

        info!(
            webhook_address = %webhook_server.local_addr()?,
            admin_address = %config.admin.address,
            public_url = ?config.http.public_url,
            drain_timeout_secs = config.settings.shutdown.drain_timeout.as_secs(),
            "xmpp-smsd started"
        );

        // Wait for shutdown signal
        self.wait_for_shutdown().await?;

        info!("shutdown signal received, starting graceful shutdown");

        // Start drain period
        self.shutdown.start_drain();

        // Wait for drain or timeout
        let drain_timeout = config.settings.shutdown.drain_timeout;
        if tokio::time::timeout(drain_timeout, self.shutdown.terminated())
            .await
            .is_err()
        {
            warn!(
                active_tasks = self.shutdown.active_tasks(),
                "drain timeout reached, forcing shutdown"
            );
        }

        // Force terminate if not already
        self.shutdown.terminate();

        let remaining = config
            .settings
            .shutdown
            .parent_shutdown_timeout
            .saturating_sub(drain_timeout);
        for (name, task) in [
            ("xmpp", xmpp_task),
            ("router", router_task),
            ("webhook", webhook_task),
            ("admin", admin_task),
        ] {
            let abort = task.abort_handle();
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!(task = name, "task did not stop in time, aborting");
                abort.abort();
            }
        }

        // Flush tracing
        crate::telemetry::shutdown_tracing();

        info!("xmpp-smsd stopped");

        Ok(())
    }

    /// Keep the drain open until `task` finishes.
    fn track(&self, name: &'static str, task: JoinHandle<()>) -> JoinHandle<()> {
        let guard = self.shutdown.track(name);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "task ended abnormally");
            }
            drop(guard);
        })
    }

    /// Wait for shutdown signal (SIGINT or SIGTERM)
    async fn wait_for_shutdown(&self) -> Result<()> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;

        #[cfg(unix)]
        let terminate = terminate.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                info!("received SIGTERM");
            }
        }

        Ok(())
    }

    /// Get shutdown manager
    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        self.shutdown.clone()
    }
}
