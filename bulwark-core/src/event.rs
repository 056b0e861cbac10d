//! Telemetry event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Component an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryCategory {
    Request,
    Cache,
    CircuitBreaker,
    RateLimit,
    Retry,
    Health,
}

impl TelemetryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryCategory::Request => "request",
            TelemetryCategory::Cache => "cache",
            TelemetryCategory::CircuitBreaker => "circuit_breaker",
            TelemetryCategory::RateLimit => "rate_limit",
            TelemetryCategory::Retry => "retry",
            TelemetryCategory::Health => "health",
        }
    }
}

impl fmt::Display for TelemetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub category: TelemetryCategory,
    /// Event name within the category, e.g. `hit`, `opened`, `exhausted`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Map<String, Value>,
}

impl TelemetryEvent {
    pub fn new(category: TelemetryCategory, event_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            event_type: event_type.into(),
            data: Map::new(),
        }
    }

    /// Add a payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Aggregate key, `category.type`.
    pub fn stat_key(&self) -> String {
        format!("{}.{}", self.category, self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder_and_key() {
        let event = TelemetryEvent::new(TelemetryCategory::CircuitBreaker, "opened")
            .with("failures", 5)
            .with("endpoint", "posts");
        assert_eq!(event.stat_key(), "circuit_breaker.opened");
        assert_eq!(event.data.get("failures"), Some(&Value::from(5)));
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = TelemetryEvent::new(TelemetryCategory::Cache, "hit");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "hit");
        assert_eq!(json["category"], "cache");
    }
}
