use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::client::Device;

const GALLONS_TO_LITERS: f64 = 3.78541;

/// Labels on the `flume_device` info series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeviceLabels {
    pub device_id: String,
    pub device_name: String,
    pub location: String,
}

/// Labels on the per-device reading gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SeriesLabels {
    pub device_id: String,
    pub device_name: String,
}

/// Labels on the day-to-date consumption gauge; `date` pins each sample to
/// the civil day it totals.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DailyLabels {
    pub device_id: String,
    pub device_name: String,
    pub date: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ApiErrorLabels {
    pub endpoint: String,
    pub error_type: String,
}

/// Current exported metric state, shared between the collector (writer) and the
/// HTTP `/metrics` endpoint (reader). All updates are latest-write-wins per
/// label set; no history is retained.
pub struct Metrics {
    registry: Registry,
    device_info: Family<DeviceLabels, Gauge>,
    flow_rate: Family<SeriesLabels, Gauge<f64, AtomicU64>>,
    consumption_gallons: Family<SeriesLabels, Gauge<f64, AtomicU64>>,
    consumption_liters: Family<SeriesLabels, Gauge<f64, AtomicU64>>,
    daily_consumption: Family<DailyLabels, Gauge<f64, AtomicU64>>,
    api_errors: Family<ApiErrorLabels, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let device_info = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "flume_device",
            "Information about Flume devices",
            device_info.clone(),
        );

        let flow_rate = Family::<SeriesLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "flume_water_flow_rate",
            "Current water flow rate in gallons per minute",
            flow_rate.clone(),
        );

        let consumption_gallons = Family::<SeriesLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "flume_water_consumption_gallons",
            "Water consumption in gallons",
            consumption_gallons.clone(),
        );

        let consumption_liters = Family::<SeriesLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "flume_water_consumption_liters",
            "Water consumption in liters",
            consumption_liters.clone(),
        );

        let daily_consumption = Family::<DailyLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "flume_daily_consumption_gallons",
            "Daily water consumption in gallons",
            daily_consumption.clone(),
        );

        let api_errors = Family::<ApiErrorLabels, Counter>::default();
        registry.register(
            "flume_api_errors",
            "Total number of API errors",
            api_errors.clone(),
        );

        Self {
            registry,
            device_info,
            flow_rate,
            consumption_gallons,
            consumption_liters,
            daily_consumption,
            api_errors,
        }
    }

    /// Rebuilds the `flume_device` info family from a fresh device listing.
    /// The set is replaced wholesale, never merged, matching the device cache.
    pub fn replace_devices(&self, devices: &[Device]) {
        self.device_info.clear();
        for device in devices {
            self.device_info
                .get_or_create(&DeviceLabels {
                    device_id: device.id.clone(),
                    device_name: device.display_name(),
                    location: device.location_id.clone(),
                })
                .set(1);
        }
    }

    pub fn set_flow_rate(&self, device: &Device, gpm: f64) {
        self.flow_rate.get_or_create(&series_labels(device)).set(gpm);
    }

    pub fn set_consumption(&self, device: &Device, gallons: f64) {
        let labels = series_labels(device);
        self.consumption_gallons.get_or_create(&labels).set(gallons);
        self.consumption_liters
            .get_or_create(&labels)
            .set(gallons * GALLONS_TO_LITERS);
    }

    pub fn set_daily_consumption(&self, device: &Device, date: &str, gallons: f64) {
        self.daily_consumption
            .get_or_create(&DailyLabels {
                device_id: device.id.clone(),
                device_name: device.display_name(),
                date: date.to_string(),
            })
            .set(gallons);
    }

    pub fn inc_api_error(&self, endpoint: &str, error_type: &str) {
        self.api_errors
            .get_or_create(&ApiErrorLabels {
                endpoint: endpoint.to_string(),
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Text serialization of current state for the pull endpoint.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        // encode only fails on fmt::Write errors, which String never raises
        encode(&mut out, &self.registry).ok();
        out
    }
}

fn series_labels(device: &Device) -> SeriesLabels {
    SeriesLabels {
        device_id: device.id.clone(),
        device_name: device.display_name(),
    }
}
