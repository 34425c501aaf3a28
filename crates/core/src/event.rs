//! Engagement events: the immutable rows of the analytic event store.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::universal_id::UniversalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    SiteVisit,
    SmsClick,
    ProductView,
    CartAdd,
    SearchPerformed,
    SupportTicket,
    UnsubscribeRequest,
    SpamReport,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Sent => "sent",
            EventType::Delivered => "delivered",
            EventType::Opened => "opened",
            EventType::Clicked => "clicked",
            EventType::Bounced => "bounced",
            EventType::Complained => "complained",
            EventType::Unsubscribed => "unsubscribed",
            EventType::SiteVisit => "site_visit",
            EventType::SmsClick => "sms_click",
            EventType::ProductView => "product_view",
            EventType::CartAdd => "cart_add",
            EventType::SearchPerformed => "search_performed",
            EventType::SupportTicket => "support_ticket",
            EventType::UnsubscribeRequest => "unsubscribe_request",
            EventType::SpamReport => "spam_report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(EventType::Sent),
            "delivered" => Some(EventType::Delivered),
            "opened" => Some(EventType::Opened),
            "clicked" => Some(EventType::Clicked),
            "bounced" => Some(EventType::Bounced),
            // "complaint" appears in some upstream feeds for the same signal
            "complained" | "complaint" => Some(EventType::Complained),
            "unsubscribed" => Some(EventType::Unsubscribed),
            "site_visit" => Some(EventType::SiteVisit),
            "sms_click" => Some(EventType::SmsClick),
            "product_view" => Some(EventType::ProductView),
            "cart_add" => Some(EventType::CartAdd),
            "search_performed" => Some(EventType::SearchPerformed),
            "support_ticket" => Some(EventType::SupportTicket),
            "unsubscribe_request" => Some(EventType::UnsubscribeRequest),
            "spam_report" => Some(EventType::SpamReport),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional latency-model training features, extracted from inbound
/// metadata into typed nullable columns at ingest time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour_of_day: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth_estimate: Option<u64>,
}

impl LatencyFeatures {
    /// Fill hour/minute/day-of-week from the event timestamp when the
    /// upstream payload did not carry them.
    pub fn backfill_from_timestamp(&mut self, ts: DateTime<Utc>) {
        if self.hour_of_day.is_none() {
            self.hour_of_day = Some(ts.hour() as u8);
        }
        if self.minute.is_none() {
            self.minute = Some(ts.minute() as u8);
        }
        if self.day_of_week.is_none() {
            self.day_of_week = Some(ts.weekday().num_days_from_monday() as u8);
        }
    }
}

/// One row of the event store, keyed by `(esp, universal_id, timestamp,
/// event_type)` and deduplicated by `(esp, event_id, campaign_id)`.
/// The recipient email is stored only as its SHA-256 hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub event_id: String,
    pub esp: String,
    pub universal_id: UniversalId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub latency_features: LatencyFeatures,
    /// Free-form row metadata; bot flags live here
    /// (`suspected_bot`, `bot_reasons`).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EngagementEvent {
    pub fn suspected_bot(&self) -> bool {
        self.metadata
            .get("suspected_bot")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn bot_reasons(&self) -> Vec<String> {
        self.metadata
            .get("bot_reasons")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Recency/frequency counters derived alongside the engagement curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementCounters {
    pub clicks_1d: u64,
    pub clicks_7d: u64,
    pub clicks_30d: u64,
    pub opens_1d: u64,
    pub opens_7d: u64,
    pub opens_30d: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_click_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_click_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_open_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_open_ts: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_event_type_roundtrip() {
        for t in [
            EventType::Clicked,
            EventType::SiteVisit,
            EventType::UnsubscribeRequest,
            EventType::SpamReport,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("complaint"), Some(EventType::Complained));
        assert_eq!(EventType::parse("nonsense"), None);
    }

    #[test]
    fn test_latency_features_backfill() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 7, 14, 25, 0).unwrap(); // Wednesday
        let mut f = LatencyFeatures {
            hour_of_day: Some(9),
            ..Default::default()
        };
        f.backfill_from_timestamp(ts);
        assert_eq!(f.hour_of_day, Some(9)); // supplied value wins
        assert_eq!(f.minute, Some(25));
        assert_eq!(f.day_of_week, Some(2));
    }

    #[test]
    fn test_bot_metadata_accessors() {
        let event = EngagementEvent {
            event_id: "e1".into(),
            esp: "klaviyo".into(),
            universal_id: UniversalId::new("sf_0000000000000000"),
            event_type: EventType::Opened,
            timestamp: Utc::now(),
            recipient_email_hash: None,
            campaign_id: None,
            latency_features: LatencyFeatures::default(),
            metadata: serde_json::json!({
                "suspected_bot": true,
                "bot_reasons": ["instant_open", "bot_user_agent"],
            }),
        };
        assert!(event.suspected_bot());
        assert_eq!(
            event.bot_reasons(),
            vec!["instant_open".to_string(), "bot_user_agent".to_string()]
        );
    }
}
