use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::DeviceCache;
use crate::client::FlumeClient;
use crate::metrics::Metrics;

/// Orchestrates one polling cycle: refresh the device cache if stale, then per
/// device fetch the instantaneous flow rate and the trailing hour of
/// consumption, writing results into the metric registry. Per-device failures
/// are isolated; the cycle never aborts early and never propagates errors.
pub struct Collector {
    client: Arc<FlumeClient>,
    cache: DeviceCache,
    metrics: Arc<Metrics>,
}

impl Collector {
    pub fn new(client: Arc<FlumeClient>, cache: DeviceCache, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            cache,
            metrics,
        }
    }

    pub async fn run_cycle(&mut self) {
        self.cache
            .refresh_if_stale(&self.client, &self.metrics)
            .await;

        let devices = self.cache.devices().to_vec();
        for device in &devices {
            match self.client.current_flow_rate(&device.id).await {
                Ok(Some(gpm)) => self.metrics.set_flow_rate(device, gpm),
                Ok(None) => debug!(device_id = %device.id, "no active flow reading"),
                Err(err) => {
                    warn!(device_id = %device.id, "flow rate poll failed: {err}");
                    self.metrics.inc_api_error("query_active", err.kind());
                }
            }

            // Trailing hour at one-minute buckets, well under the server's
            // 24h span limit.
            let until = Utc::now();
            let since = until - ChronoDuration::hours(1);
            match self.client.consumption(&device.id, since, until).await {
                Ok(buckets) => {
                    if let Some(latest) = buckets.last() {
                        self.metrics.set_consumption(device, latest.value);
                    }
                }
                Err(err) => {
                    warn!(device_id = %device.id, "consumption poll failed: {err}");
                    self.metrics.inc_api_error("query", err.kind());
                }
            }

            // Day-to-date total: midnight-to-now stays at most 1439 one-minute
            // buckets, inside the server's span limit.
            let day_start = start_of_day(until);
            match self.client.consumption(&device.id, day_start, until).await {
                Ok(buckets) => {
                    if !buckets.is_empty() {
                        let total: f64 = buckets.iter().map(|b| b.value).sum();
                        let date = day_start.format("%Y-%m-%d").to_string();
                        self.metrics.set_daily_consumption(device, &date, total);
                    }
                }
                Err(err) => {
                    warn!(device_id = %device.id, "daily consumption poll failed: {err}");
                    self.metrics.inc_api_error("query", err.kind());
                }
            }
        }
    }

    /// Spawns the fixed-interval polling loop. The first tick fires
    /// immediately, so one cycle runs at startup; a cycle that outlasts the
    /// interval causes later ticks to be skipped rather than overlap.
    pub fn start(mut self, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.run_cycle().await,
                }
            }
        })
    }
}

/// 00:00:00 UTC of the civil day containing `now`. The fallback arm is
/// unreachable; midnight exists for every calendar date.
fn start_of_day(now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|start| start.and_utc())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Credentials;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::json;

    fn gpm_response(gpm: f64) -> Json<serde_json::Value> {
        Json(json!({"data": [{"gpm": gpm, "datetime": "2024-01-01 00:00:00"}]}))
    }

    fn consumption_response(first: f64, latest: f64) -> Json<serde_json::Value> {
        Json(json!({
            "data": [{
                "consumption": [
                    {"datetime": "2024-01-01 00:00:00", "value": first},
                    {"datetime": "2024-01-01 00:01:00", "value": latest},
                ],
            }],
        }))
    }

    /// Upstream with three devices; dev-2's flow-rate endpoint always fails.
    async fn spawn_upstream() -> String {
        let access_token = format!(
            "header.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"user_id": "42"}"#)
        );
        let router = Router::new()
            .route(
                "/oauth/token",
                post(move || {
                    let access_token = access_token.clone();
                    async move {
                        Json(json!({"data": [{"access_token": access_token, "expires_in": 3600}]}))
                    }
                }),
            )
            .route(
                "/users/42/devices",
                get(|| async {
                    Json(json!({
                        "data": [
                            {"id": "dev-1", "product": "Bridge", "location_id": 100, "connected": true},
                            {"id": "dev-2", "product": "Sensor", "location_id": 100, "connected": true},
                            {"id": "dev-3", "product": "Sensor", "location_id": 101, "connected": true},
                        ],
                    }))
                }),
            )
            .route(
                "/users/42/devices/dev-1/query/active",
                get(|| async { gpm_response(1.5) }),
            )
            .route(
                "/users/42/devices/dev-2/query/active",
                get(|| async { StatusCode::BAD_GATEWAY }),
            )
            .route(
                "/users/42/devices/dev-3/query/active",
                get(|| async { gpm_response(0.25) }),
            )
            .route(
                "/users/42/devices/dev-1/query",
                post(|| async { consumption_response(0.25, 0.5) }),
            )
            .route(
                "/users/42/devices/dev-2/query",
                post(|| async { consumption_response(0.5, 1.0) }),
            )
            .route(
                "/users/42/devices/dev-3/query",
                post(|| async { consumption_response(0.25, 0.25) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }

    async fn test_collector(base: String, metrics: Arc<Metrics>) -> Collector {
        let client = Arc::new(FlumeClient::new(
            reqwest::Client::new(),
            base,
            Credentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                username: "user".to_string(),
                password: "pass".to_string(),
            },
        ));
        let cache = DeviceCache::new(Duration::from_secs(3600));
        Collector::new(client, cache, metrics)
    }

    #[tokio::test]
    async fn one_failing_device_does_not_block_the_others() {
        let base = spawn_upstream().await;
        let metrics = Arc::new(Metrics::new());
        let mut collector = test_collector(base, metrics.clone()).await;

        collector.run_cycle().await;

        let text = metrics.encode();
        let flow_lines: Vec<&str> = text
            .lines()
            .filter(|line| line.starts_with("flume_water_flow_rate{"))
            .collect();
        assert_eq!(flow_lines.len(), 2);
        assert!(flow_lines.iter().any(|l| l.contains("device_id=\"dev-1\"")));
        assert!(flow_lines.iter().any(|l| l.contains("device_id=\"dev-3\"")));
        assert!(!flow_lines.iter().any(|l| l.contains("device_id=\"dev-2\"")));

        // The failure is counted, and consumption for dev-2 still lands.
        assert!(text.contains("endpoint=\"query_active\""));
        assert!(text
            .lines()
            .any(|l| l.starts_with("flume_water_consumption_gallons{")
                && l.contains("device_id=\"dev-2\"")));
    }

    #[test]
    fn start_of_day_truncates_to_utc_midnight() {
        let now = chrono::DateTime::parse_from_rfc3339("2024-06-15T17:42:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            start_of_day(now).to_rfc3339(),
            "2024-06-15T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn daily_consumption_totals_the_day_to_date_buckets() {
        let base = spawn_upstream().await;
        let metrics = Arc::new(Metrics::new());
        let mut collector = test_collector(base, metrics.clone()).await;

        collector.run_cycle().await;

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let text = metrics.encode();
        let daily_line = text
            .lines()
            .find(|l| {
                l.starts_with("flume_daily_consumption_gallons{")
                    && l.contains("device_id=\"dev-1\"")
            })
            .expect("no daily consumption series for dev-1");
        assert!(daily_line.contains(&format!("date=\"{today}\"")));
        assert!(daily_line.ends_with(" 0.75"));

        // The trailing-hour gauge keeps reporting the latest bucket, not the sum.
        assert!(text
            .lines()
            .any(|l| l.starts_with("flume_water_consumption_gallons{")
                && l.contains("device_id=\"dev-1\"")
                && l.ends_with(" 0.5")));
    }

    #[tokio::test]
    async fn cycles_with_unchanged_upstream_data_are_idempotent() {
        let base = spawn_upstream().await;
        let metrics = Arc::new(Metrics::new());
        let mut collector = test_collector(base, metrics.clone()).await;

        collector.run_cycle().await;
        let first = metrics.encode();
        collector.run_cycle().await;
        let second = metrics.encode();

        // dev-2's counted failure is the only thing allowed to move between
        // cycles; every gauge family must be byte-identical.
        let gauges = |text: &str| -> Vec<String> {
            let mut lines = text
                .lines()
                .filter(|l| l.starts_with("flume_"))
                .filter(|l| !l.starts_with("flume_api_errors"))
                .map(str::to_string)
                .collect::<Vec<_>>();
            // Family iteration order is not stable across encodes.
            lines.sort();
            lines
        };
        assert_eq!(gauges(&first), gauges(&second));
    }

    #[tokio::test]
    async fn scheduler_runs_a_cycle_immediately_and_stops_on_cancel() {
        let base = spawn_upstream().await;
        let metrics = Arc::new(Metrics::new());
        let collector = test_collector(base, metrics.clone()).await;

        let cancel = CancellationToken::new();
        let handle = collector.start(Duration::from_secs(3600), cancel.clone());

        // First tick fires immediately; wait for the startup cycle to land.
        let mut populated = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if metrics.encode().contains("flume_water_flow_rate{") {
                populated = true;
                break;
            }
        }
        assert!(populated, "startup cycle never populated the registry");

        cancel.cancel();
        handle.await.unwrap();
    }
}
