use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub workers_live: IntGauge,
    pub workers_busy: IntGauge,
    pub workers_created: IntCounter,
    pub workers_recycled: IntCounterVec,
    pub fetches: IntCounterVec,
    pub urls_skipped: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Live browser workers (idle + busy)
        let workers_live = IntGauge::with_opts(Opts::new(
            "crawl_hive_workers_live",
            "Number of browser workers currently alive",
        ))?;
        registry.register(Box::new(workers_live.clone()))?;

        // Workers currently fetching
        let workers_busy = IntGauge::with_opts(Opts::new(
            "crawl_hive_workers_busy",
            "Number of browser workers currently processing a URL",
        ))?;
        registry.register(Box::new(workers_busy.clone()))?;

        let workers_created = IntCounter::with_opts(Opts::new(
            "crawl_hive_workers_created_total",
            "Total number of browser workers launched",
        ))?;
        registry.register(Box::new(workers_created.clone()))?;

        let workers_recycled = IntCounterVec::new(
            Opts::new(
                "crawl_hive_workers_retired_total",
                "Total number of browser workers torn down, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(workers_recycled.clone()))?;

        // Fetch outcomes: success or a failure reason
        let fetches = IntCounterVec::new(
            Opts::new(
                "crawl_hive_fetches_total",
                "Total number of fetches, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(fetches.clone()))?;

        let urls_skipped = IntCounter::with_opts(Opts::new(
            "crawl_hive_urls_skipped_total",
            "URLs skipped because the ledger already records success",
        ))?;
        registry.register(Box::new(urls_skipped.clone()))?;

        Ok(Self {
            registry,
            workers_live,
            workers_busy,
            workers_created,
            workers_recycled,
            fetches,
            urls_skipped,
        })
    }

    /// Start HTTP server for Prometheus metrics on specified port
    pub async fn start_server(self, port: u16) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let app = app.with_state(self);

        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Metrics server listening on {}", addr);

        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Metrics>,
) -> impl IntoResponse {
    match metrics.render() {
        Ok(buffer) => (StatusCode::OK, buffer),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.workers_created.inc();
        metrics.fetches.with_label_values(&["success"]).inc();
        metrics
            .workers_recycled
            .with_label_values(&["memory_exceeded"])
            .inc();

        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(text.contains("crawl_hive_workers_created_total 1"));
        assert!(text.contains("crawl_hive_fetches_total{outcome=\"success\"} 1"));
        assert!(text.contains("reason=\"memory_exceeded\""));
    }
}
