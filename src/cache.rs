use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::{Device, FlumeClient};
use crate::metrics::Metrics;

/// Last-fetched device listing with a time-to-live. The set is replaced
/// wholesale on refresh; a failed refresh keeps the previous snapshot so the
/// exporter can keep serving (possibly stale) series while upstream is down.
pub struct DeviceCache {
    devices: Vec<Device>,
    fetched_at: Option<DateTime<Utc>>,
    ttl: ChronoDuration,
}

impl DeviceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            devices: Vec::new(),
            fetched_at: None,
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.fetched_at {
            Some(fetched_at) => now - fetched_at > self.ttl,
            None => true,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Refreshes the listing from upstream when stale, rebuilding the
    /// `flume_device` info series from the new set. No-op while fresh; at most
    /// one upstream fetch per call. Failures are logged and counted, leaving
    /// the previous cache in place.
    pub async fn refresh_if_stale(&mut self, client: &FlumeClient, metrics: &Metrics) {
        if !self.is_stale(Utc::now()) {
            return;
        }

        match client.devices().await {
            Ok(devices) => {
                metrics.replace_devices(&devices);
                for device in &devices {
                    debug!(
                        device_id = %device.id,
                        kind = ?device.kind,
                        connected = device.connected,
                        "cached device"
                    );
                }
                info!(count = devices.len(), "refreshed device cache");
                self.devices = devices;
                self.fetched_at = Some(Utc::now());
            }
            Err(err) => {
                warn!("device cache refresh failed: {err}");
                metrics.inc_api_error("devices", err.kind());
            }
        }
    }
}
