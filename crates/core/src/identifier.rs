//! Identifier types and normalization for identity resolution.
//!
//! Identifiers come in two families: deterministic (hashed email, E.164
//! phone) carrying weight 1.0, and probabilistic (platform IDs, device
//! signatures) carrying fixed default weights in [0.5, 0.95]. The closed
//! enum replaces the stringly-typed keys of upstream webhook payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::universal_id::UniversalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    // Deterministic
    EmailHash,
    PhoneNumber,
    // Probabilistic
    KlaviyoId,
    ShopifyCustomerId,
    EspUserId,
    IpDeviceSignature,
    // Internal
    UniversalId,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::EmailHash => "email_hash",
            IdentifierType::PhoneNumber => "phone_number",
            IdentifierType::KlaviyoId => "klaviyo_id",
            IdentifierType::ShopifyCustomerId => "shopify_customer_id",
            IdentifierType::EspUserId => "esp_user_id",
            IdentifierType::IpDeviceSignature => "ip_device_signature",
            IdentifierType::UniversalId => "universal_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email_hash" => Some(IdentifierType::EmailHash),
            "phone_number" => Some(IdentifierType::PhoneNumber),
            "klaviyo_id" => Some(IdentifierType::KlaviyoId),
            "shopify_customer_id" => Some(IdentifierType::ShopifyCustomerId),
            "esp_user_id" => Some(IdentifierType::EspUserId),
            "ip_device_signature" => Some(IdentifierType::IpDeviceSignature),
            "universal_id" => Some(IdentifierType::UniversalId),
            _ => None,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            IdentifierType::EmailHash | IdentifierType::PhoneNumber | IdentifierType::UniversalId
        )
    }

    /// Built-in default weight; configuration may override the
    /// probabilistic entries.
    pub fn default_weight(&self) -> f64 {
        match self {
            IdentifierType::EmailHash
            | IdentifierType::PhoneNumber
            | IdentifierType::UniversalId => 1.0,
            IdentifierType::KlaviyoId => 0.95,
            IdentifierType::ShopifyCustomerId => 0.90,
            IdentifierType::EspUserId => 0.85,
            IdentifierType::IpDeviceSignature => 0.50,
        }
    }

    /// Deterministic lookup order for the resolver.
    pub const DETERMINISTIC_PRIORITY: [IdentifierType; 2] =
        [IdentifierType::EmailHash, IdentifierType::PhoneNumber];

    /// Probabilistic lookup order: highest default weight first.
    pub const PROBABILISTIC_PRIORITY: [IdentifierType; 4] = [
        IdentifierType::KlaviyoId,
        IdentifierType::ShopifyCustomerId,
        IdentifierType::EspUserId,
        IdentifierType::IpDeviceSignature,
    ];
}

impl std::fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged `(type, value)` pair. Values are opaque strings; normalization
/// happens before an `Identifier` is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn new(id_type: IdentifierType, value: impl Into<String>) -> Self {
        Self {
            id_type,
            value: value.into(),
        }
    }

    pub fn universal(uid: &UniversalId) -> Self {
        Self::new(IdentifierType::UniversalId, uid.as_str())
    }

    /// Truncated value for audit steps and logs; never log full PII-adjacent
    /// identifier material.
    pub fn truncated(&self) -> &str {
        let limit = if self.id_type == IdentifierType::EmailHash {
            8
        } else {
            12
        };
        let end = self
            .value
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(self.value.len());
        &self.value[..end]
    }
}

/// Lowercase SHA-256 hex of the trimmed, lowercased email.
pub fn hash_email(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize a phone number to E.164 using a default region when the input
/// carries no country code. Numbers already in E.164 pass through after
/// digit-stripping.
pub fn normalize_phone(phone: &str, default_region: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let cc = region_calling_code(default_region);

    if phone.trim_start().starts_with('+') {
        return format!("+{}", digits);
    }
    // National-format number: prepend the default region's calling code,
    // unless the digits already lead with it.
    if digits.starts_with(cc) && digits.len() > 10 {
        format!("+{}", digits)
    } else {
        format!("+{}{}", cc, digits)
    }
}

fn region_calling_code(region: &str) -> &'static str {
    match region.to_ascii_uppercase().as_str() {
        "US" | "CA" => "1",
        "GB" => "44",
        "FR" => "33",
        "DE" => "49",
        "AU" => "61",
        "IN" => "91",
        "BR" => "55",
        "JP" => "81",
        _ => "1",
    }
}

/// Raw identifier set as supplied by callers (decision API, webhook
/// adapters). Field names match the inbound wire contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawIdentifiers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub klaviyo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shopify_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esp_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_device_signature: Option<String>,
}

impl RawIdentifiers {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.phone.is_none()
            && self.klaviyo_id.is_none()
            && self.shopify_customer_id.is_none()
            && self.esp_user_id.is_none()
            && self.ip_device_signature.is_none()
    }

    /// Normalize into typed identifiers, deterministic types first.
    /// Blank values are dropped.
    pub fn normalize(&self, default_region: &str) -> Vec<Identifier> {
        let mut out = Vec::new();
        if let Some(email) = non_blank(&self.email) {
            out.push(Identifier::new(IdentifierType::EmailHash, hash_email(email)));
        }
        if let Some(phone) = non_blank(&self.phone) {
            out.push(Identifier::new(
                IdentifierType::PhoneNumber,
                normalize_phone(phone, default_region),
            ));
        }
        if let Some(v) = non_blank(&self.klaviyo_id) {
            out.push(Identifier::new(IdentifierType::KlaviyoId, v));
        }
        if let Some(v) = non_blank(&self.shopify_customer_id) {
            out.push(Identifier::new(IdentifierType::ShopifyCustomerId, v));
        }
        if let Some(v) = non_blank(&self.esp_user_id) {
            out.push(Identifier::new(IdentifierType::EspUserId, v));
        }
        if let Some(v) = non_blank(&self.ip_device_signature) {
            out.push(Identifier::new(IdentifierType::IpDeviceSignature, v));
        }
        out
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Undirected relation between two identifiers. Stored keyed on the
/// unordered pair; weight only ever increases for the same edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEdge {
    pub a: Identifier,
    pub b: Identifier,
    pub weight: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentityEdge {
    /// Edge weight rules: 1.0 when either endpoint is deterministic,
    /// otherwise the lower of the two endpoint weights, unless the source
    /// supplied an explicit weight.
    pub fn derive_weight(a: &Identifier, b: &Identifier, supplied: Option<f64>) -> f64 {
        if a.id_type.is_deterministic() || b.id_type.is_deterministic() {
            return 1.0;
        }
        supplied.unwrap_or_else(|| a.id_type.default_weight().min(b.id_type.default_weight()))
    }

    pub fn new(
        a: Identifier,
        b: Identifier,
        weight: f64,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            a,
            b,
            weight,
            source: source.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row of the per-identifier resolution cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionEntry {
    pub identifier: Identifier,
    pub universal_id: UniversalId,
    pub confidence: f64,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record; concatenating records sharing a
/// `resolution_id` reconstructs the derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub resolution_id: String,
    pub universal_id: UniversalId,
    pub input_identifier: String,
    pub input_type: IdentifierType,
    pub step: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_email_normalizes_case_and_whitespace() {
        let a = hash_email("Alice@Example.COM ");
        let b = hash_email("alice@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_normalize_phone_us_default() {
        assert_eq!(normalize_phone("(415) 555-1234", "US"), "+14155551234");
        assert_eq!(normalize_phone("14155551234", "US"), "+14155551234");
        assert_eq!(normalize_phone("+44 20 7946 0958", "US"), "+442079460958");
    }

    #[test]
    fn test_normalize_phone_other_region() {
        assert_eq!(normalize_phone("020 7946 0958", "GB"), "+4402079460958");
        assert_eq!(normalize_phone("+14155551234", "GB"), "+14155551234");
    }

    #[test]
    fn test_raw_identifiers_normalize_order() {
        let raw = RawIdentifiers {
            klaviyo_id: Some("k_1".into()),
            email: Some("a@b.com".into()),
            ..Default::default()
        };
        let ids = raw.normalize("US");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].id_type, IdentifierType::EmailHash);
        assert_eq!(ids[1].id_type, IdentifierType::KlaviyoId);
    }

    #[test]
    fn test_blank_identifiers_dropped() {
        let raw = RawIdentifiers {
            email: Some("   ".into()),
            ..Default::default()
        };
        assert!(raw.normalize("US").is_empty());
        assert!(!raw.is_empty());
    }

    #[test]
    fn test_edge_weight_rules() {
        let email = Identifier::new(IdentifierType::EmailHash, "h");
        let klaviyo = Identifier::new(IdentifierType::KlaviyoId, "k");
        let device = Identifier::new(IdentifierType::IpDeviceSignature, "d");

        assert_eq!(IdentityEdge::derive_weight(&email, &klaviyo, Some(0.2)), 1.0);
        assert_eq!(IdentityEdge::derive_weight(&klaviyo, &device, None), 0.50);
        assert_eq!(IdentityEdge::derive_weight(&klaviyo, &device, Some(0.7)), 0.7);
    }

    #[test]
    fn test_probabilistic_priority_is_weight_descending() {
        let weights: Vec<f64> = IdentifierType::PROBABILISTIC_PRIORITY
            .iter()
            .map(|t| t.default_weight())
            .collect();
        let mut sorted = weights.clone();
        sorted.sort_by(|x, y| y.partial_cmp(x).unwrap());
        assert_eq!(weights, sorted);
    }
}
