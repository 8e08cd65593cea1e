//! Message headers that survive retry republish.

use chrono::Utc;
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;

pub const RETRY_COUNT: &str = "x-retry-count";
pub const FIRST_SEEN_AT: &str = "x-first-seen-at";
pub const TRACE_CONTEXT: &str = "x-trace-context";

/// Header table for a (re)publish carrying the retry chain state.
pub fn build(retry_count: u32, first_seen_at: &str, trace_context: Option<&str>) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(RETRY_COUNT.into(), AMQPValue::LongInt(retry_count as i32));
    headers.insert(
        FIRST_SEEN_AT.into(),
        AMQPValue::LongString(first_seen_at.to_string().into()),
    );
    if let Some(trace) = trace_context {
        headers.insert(
            TRACE_CONTEXT.into(),
            AMQPValue::LongString(trace.to_string().into()),
        );
    }
    headers
}

fn lookup<'a>(properties: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    let table = properties.headers().as_ref()?;
    for (key, value) in table {
        if key.as_str() == name {
            return Some(value);
        }
    }
    None
}

/// Retries already performed for this delivery; absent header means zero.
pub fn retry_count(properties: &BasicProperties) -> u32 {
    match lookup(properties, RETRY_COUNT) {
        Some(AMQPValue::LongInt(v)) => (*v).max(0) as u32,
        Some(AMQPValue::LongLongInt(v)) => (*v).max(0) as u32,
        Some(AMQPValue::ShortInt(v)) => (*v).max(0) as u32,
        Some(AMQPValue::LongString(s)) => s.to_string().parse().unwrap_or(0),
        _ => 0,
    }
}

/// First-seen timestamp, defaulting to now for fresh deliveries.
pub fn first_seen_at(properties: &BasicProperties) -> String {
    match lookup(properties, FIRST_SEEN_AT) {
        Some(AMQPValue::LongString(s)) => s.to_string(),
        _ => Utc::now().to_rfc3339(),
    }
}

/// W3C trace context propagated across republishes.
pub fn trace_context(properties: &BasicProperties) -> Option<String> {
    match lookup(properties, TRACE_CONTEXT) {
        Some(AMQPValue::LongString(s)) => Some(s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let table = build(3, "2025-01-01T00:00:00Z", Some("00-abc-def-01"));
        let properties = BasicProperties::default().with_headers(table);
        assert_eq!(retry_count(&properties), 3);
        assert_eq!(first_seen_at(&properties), "2025-01-01T00:00:00Z");
        assert_eq!(
            trace_context(&properties).as_deref(),
            Some("00-abc-def-01")
        );
    }

    #[test]
    fn test_missing_headers_default() {
        let properties = BasicProperties::default();
        assert_eq!(retry_count(&properties), 0);
        assert!(trace_context(&properties).is_none());
        assert!(!first_seen_at(&properties).is_empty());
    }
}
