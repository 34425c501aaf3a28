//! Bot and scanner detection for inbound engagement events.
//!
//! Mail privacy proxies and security scanners open (and sometimes click)
//! every message; letting those events into the curves would teach the
//! model the scanner's schedule instead of the recipient's. Flagged events
//! stay in the store but are excluded from engagement pulls.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use regex::Regex;

use sf_core::EventType;

pub const REASON_INSTANT_OPEN: &str = "instant_open";
pub const REASON_APPLE_MAIL_PROXY: &str = "apple_mail_privacy_proxy";
pub const REASON_SCANNER_IP: &str = "scanner_ip_range";
pub const REASON_BOT_UA: &str = "bot_user_agent";

/// Instant-open threshold: opens arriving within this many milliseconds of
/// `now` are scanner prefetches, not humans.
const INSTANT_OPEN_MS: i64 = 2_000;

pub struct BotFlagger {
    apple_mail: Regex,
    keyword: Regex,
}

impl Default for BotFlagger {
    fn default() -> Self {
        Self::new()
    }
}

impl BotFlagger {
    pub fn new() -> Self {
        Self {
            apple_mail: Regex::new(r"AppleWebKit.*Mail/").unwrap(),
            keyword: Regex::new(r"(?i)bot|crawler|spider").unwrap(),
        }
    }

    /// All reasons that apply to one event; empty means not suspected.
    pub fn reasons(
        &self,
        event_type: EventType,
        event_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Vec<&'static str> {
        let mut reasons = Vec::new();

        if event_type == EventType::Opened
            && (now - event_timestamp).num_milliseconds() < INSTANT_OPEN_MS
        {
            reasons.push(REASON_INSTANT_OPEN);
        }
        if let Some(ua) = user_agent {
            if self.apple_mail.is_match(ua) {
                reasons.push(REASON_APPLE_MAIL_PROXY);
            }
            if self.keyword.is_match(ua) {
                reasons.push(REASON_BOT_UA);
            }
        }
        if let Some(ip) = ip {
            if ip.parse::<Ipv4Addr>().map(is_scanner_ip).unwrap_or(false) {
                reasons.push(REASON_SCANNER_IP);
            }
        }
        reasons
    }
}

/// Known scanner ranges: Apple 17.0.0.0/8, Google 66.102.0.0/16 and
/// 66.249.0.0/16.
fn is_scanner_ip(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 17 || (octets[0] == 66 && (octets[1] == 102 || octets[1] == 249))
}
