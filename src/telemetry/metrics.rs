use anyhow::{Context, Result};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

/// OTEL metrics with a Prometheus exporter.
///
/// The OTEL instruments in [`counters`] are read through the registry and
/// rendered in text format by the admin server.
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
}

impl Metrics {
    /// Create the OTEL → Prometheus pipeline and register the gateway counters.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let exporter = exporter()
            .with_registry(registry.clone())
            .build()
            .context("failed to build prometheus exporter")?;

        let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(meter_provider.clone());

        counters::init(&meter_provider.meter("xmpp-smsd"));
        info!("OTEL metrics configured with Prometheus exporter");

        Ok(Self {
            registry,
            meter_provider,
        })
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// Gateway metrics with the `smsd_` prefix.
///
/// Every recorder is a no-op until [`init`] has run, so library code and
/// tests can call them freely.
pub mod counters {
    use opentelemetry::metrics::{Counter, Gauge};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // XMPP

    static XMPP_CONNECTED: OnceLock<Gauge<i64>> = OnceLock::new();
    static XMPP_RECONNECTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static XMPP_STANZAS_RECEIVED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static XMPP_STANZAS_SENT_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // SMS

    static SMS_SENT_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SMS_FAILED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static WEBHOOK_REQUESTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static ROUTE_IGNORED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // Receipts

    static RECEIPTS_REGISTERED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static RECEIPTS_RESOLVED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static RECEIPTS_DROPPED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // Process

    static TASK_RESTARTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    pub fn init(meter: &opentelemetry::metrics::Meter) {
        let _ = XMPP_CONNECTED.set(
            meter
                .i64_gauge("smsd_xmpp_connected")
                .with_description("1 while the component stream is established")
                .build(),
        );
        let _ = XMPP_RECONNECTS_TOTAL.set(
            meter
                .u64_counter("smsd_xmpp_reconnects_total")
                .with_description("Component reconnect attempts")
                .build(),
        );
        let _ = XMPP_STANZAS_RECEIVED_TOTAL.set(
            meter
                .u64_counter("smsd_xmpp_stanzas_received_total")
                .with_description("Stanzas received by kind")
                .build(),
        );
        let _ = XMPP_STANZAS_SENT_TOTAL.set(
            meter
                .u64_counter("smsd_xmpp_stanzas_sent_total")
                .with_description("Stanzas written by kind")
                .build(),
        );
        let _ = SMS_SENT_TOTAL.set(
            meter
                .u64_counter("smsd_sms_sent_total")
                .with_description("Messages accepted by a carrier")
                .build(),
        );
        let _ = SMS_FAILED_TOTAL.set(
            meter
                .u64_counter("smsd_sms_failed_total")
                .with_description("Messages a carrier refused or could not be reached for")
                .build(),
        );
        let _ = WEBHOOK_REQUESTS_TOTAL.set(
            meter
                .u64_counter("smsd_webhook_requests_total")
                .with_description("Carrier webhook requests by provider and outcome")
                .build(),
        );
        let _ = ROUTE_IGNORED_TOTAL.set(
            meter
                .u64_counter("smsd_route_ignored_total")
                .with_description("Events dropped for lack of an address mapping")
                .build(),
        );
        let _ = RECEIPTS_REGISTERED_TOTAL.set(
            meter
                .u64_counter("smsd_receipts_registered_total")
                .with_description("Delivery receipts awaiting a carrier report")
                .build(),
        );
        let _ = RECEIPTS_RESOLVED_TOTAL.set(
            meter
                .u64_counter("smsd_receipts_resolved_total")
                .with_description("Delivery receipts matched to a carrier report")
                .build(),
        );
        let _ = RECEIPTS_DROPPED_TOTAL.set(
            meter
                .u64_counter("smsd_receipts_dropped_total")
                .with_description("Pending receipts discarded when the table filled")
                .build(),
        );
        let _ = TASK_RESTARTS_TOTAL.set(
            meter
                .u64_counter("smsd_task_restarts_total")
                .with_description("Supervised task restarts by task")
                .build(),
        );
    }

    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }

    pub fn xmpp_connected(connected: bool) {
        if let Some(g) = XMPP_CONNECTED.get() {
            g.record(i64::from(connected), &[]);
        }
    }

    pub fn xmpp_reconnect() {
        if let Some(c) = XMPP_RECONNECTS_TOTAL.get() {
            c.add(1, &[]);
        }
    }

    pub fn xmpp_stanza_received(kind: &str) {
        if let Some(c) = XMPP_STANZAS_RECEIVED_TOTAL.get() {
            c.add(1, &[kv("kind", kind)]);
        }
    }

    pub fn xmpp_stanza_sent(kind: &str) {
        if let Some(c) = XMPP_STANZAS_SENT_TOTAL.get() {
            c.add(1, &[kv("kind", kind)]);
        }
    }

    pub fn sms_sent(provider: &str) {
        if let Some(c) = SMS_SENT_TOTAL.get() {
            c.add(1, &[kv("provider", provider)]);
        }
    }

    pub fn sms_failed(provider: &str) {
        if let Some(c) = SMS_FAILED_TOTAL.get() {
            c.add(1, &[kv("provider", provider)]);
        }
    }

    pub fn webhook(provider: &str, outcome: &str) {
        if let Some(c) = WEBHOOK_REQUESTS_TOTAL.get() {
            c.add(1, &[kv("provider", provider), kv("outcome", outcome)]);
        }
    }

    /// `direction` is `xmpp` or `sms`, the side the event arrived from.
    pub fn route_ignored(direction: &str) {
        if let Some(c) = ROUTE_IGNORED_TOTAL.get() {
            c.add(1, &[kv("direction", direction)]);
        }
    }

    pub fn receipt_registered() {
        if let Some(c) = RECEIPTS_REGISTERED_TOTAL.get() {
            c.add(1, &[]);
        }
    }

    pub fn receipt_resolved() {
        if let Some(c) = RECEIPTS_RESOLVED_TOTAL.get() {
            c.add(1, &[]);
        }
    }

    pub fn receipts_dropped(count: u64) {
        if let Some(c) = RECEIPTS_DROPPED_TOTAL.get() {
            c.add(count, &[]);
        }
    }

    pub fn task_restarted(task: &str) {
        if let Some(c) = TASK_RESTARTS_TOTAL.get() {
            c.add(1, &[kv("task", task)]);
        }
    }
}
