//! Telemetry sink writing container records as InfluxDB line protocol
//!
//! Lines are emitted on the `metrics` tracing target, which the logging setup routes
//! to the rolling metrics file.

use chrono::Utc;
use influxdb_line_protocol::LineProtocolBuilder;

use crate::domain::pu_management::{ContainerRecord, EventCollector};

const MEASUREMENT: &str = "pu_container_event";

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    host: Option<String>,
}

impl MetricsCollector {
    pub fn new(host: Option<String>) -> Self {
        Self { host }
    }

    /// Encode one record. Policy tags are written as line-protocol tags.
    pub fn encode(&self, record: &ContainerRecord, timestamp: i64) -> String {
        let mut builder = LineProtocolBuilder::new()
            .measurement(MEASUREMENT)
            .tag("context_id", &record.context_id)
            .tag("event", record.event.as_str());
        if let Some(host) = &self.host {
            builder = builder.tag("host", host);
        }
        for (key, value) in &record.tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            builder = builder.tag(key, value);
        }

        let line = builder
            .field("ip_address", record.ip_address.as_deref().unwrap_or_default())
            .timestamp(timestamp)
            .close_line()
            .build();
        String::from_utf8_lossy(&line).trim_end().to_string()
    }
}

impl EventCollector for MetricsCollector {
    fn collect_container_event(&self, record: ContainerRecord) {
        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let line = self.encode(&record, timestamp);
        tracing::info!(target: "metrics", msg = %line);
    }
}
