//! Event ingestion pipeline.
//!
//! Transforms raw inbound log messages into normalized event-store rows:
//! deserialize, validate, resolve identity, hash PII, flag bots, extract
//! training features, insert, then commit the upstream offset. Malformed
//! input is poison and dead-letters on first occurrence; transient
//! infrastructure failures retry with exponential backoff and jitter.
//! Workers run one per partition, strictly serial within a partition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use sf_core::{
    hash_email, EngagementEvent, EventType, LatencyFeatures, RawIdentifiers, Result, TimingConfig,
};
use sf_store::{DeadLetter, DeadLetterSink, EventStore, LogConsumer, LogMessage};

use crate::bot_flags::BotFlagger;
use crate::identity::IdentityResolver;

#[derive(Debug, Deserialize)]
struct RawEventRecord {
    event_id: Option<String>,
    event_type: Option<String>,
    timestamp: Option<String>,
    esp: Option<String>,
    campaign_id: Option<String>,
    recipient_email: Option<String>,
    phone: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Inserted,
    Duplicate,
    DeadLettered,
}

#[derive(Default)]
struct IngestStats {
    events_processed: AtomicU64,
    inserted: AtomicU64,
    duplicates: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    bots_flagged: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestStatsSnapshot {
    pub events_processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub bots_flagged: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub processed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    pub failed: usize,
}

pub struct IngestPipeline {
    resolver: Arc<IdentityResolver>,
    events: Arc<dyn EventStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    flagger: BotFlagger,
    config: Arc<TimingConfig>,
    stats: IngestStats,
}

impl IngestPipeline {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        events: Arc<dyn EventStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: Arc<TimingConfig>,
    ) -> Self {
        Self {
            resolver,
            events,
            dead_letters,
            flagger: BotFlagger::new(),
            config,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            events_processed: self.stats.events_processed.load(Ordering::Relaxed),
            inserted: self.stats.inserted.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            bots_flagged: self.stats.bots_flagged.load(Ordering::Relaxed),
        }
    }

    /// Process one log message. `Ok` means the offset may be committed
    /// (including the dead-letter case); `Err` means transient
    /// infrastructure failure and the message must be re-polled.
    pub fn process_message(
        &self,
        message: &LogMessage,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);

        let record: RawEventRecord = match serde_json::from_slice(&message.payload) {
            Ok(record) => record,
            Err(e) => return self.dead_letter(message, format!("deserialize: {}", e), now),
        };

        let Some(event_id) = record.event_id.as_deref().filter(|s| !s.is_empty()) else {
            return self.dead_letter(message, "missing event_id".to_string(), now);
        };
        let Some(event_type) = record.event_type.as_deref().and_then(EventType::parse) else {
            return self.dead_letter(
                message,
                format!("unknown event_type: {:?}", record.event_type),
                now,
            );
        };
        let Some(timestamp) = record
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            return self.dead_letter(
                message,
                format!("unparseable timestamp: {:?}", record.timestamp),
                now,
            );
        };

        // Identity resolution from the payload email plus platform IDs in
        // metadata.
        let meta = record.metadata.as_object().cloned().unwrap_or_default();
        let meta_str = |key: &str| meta.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let identifiers = RawIdentifiers {
            email: record.recipient_email.clone(),
            phone: record.phone.clone(),
            klaviyo_id: meta_str("klaviyo_id"),
            shopify_customer_id: meta_str("shopify_customer_id"),
            esp_user_id: meta_str("esp_user_id"),
            ip_device_signature: meta_str("ip_device_signature"),
        };
        if identifiers
            .normalize(&self.config.phone_default_region)
            .is_empty()
        {
            return self.dead_letter(message, "no resolvable identifiers".to_string(), now);
        }
        let universal_id = match self.with_retries(|| {
            self.resolver
                .resolve_at(&identifiers, now)
                .map(|outcome| outcome.universal_id)
        }) {
            Ok(uid) => uid,
            Err(e) => {
                return self.dead_letter(
                    message,
                    format!("identity resolution failed: {}", e),
                    now,
                )
            }
        };

        // Hash PII; the plain email never reaches the store.
        let recipient_email_hash = record.recipient_email.as_deref().map(hash_email);
        let mut metadata = meta;
        metadata.remove("recipient_email");
        metadata.remove("email");

        // Bot flagging.
        let user_agent = metadata
            .get("user_agent")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let ip = metadata
            .get("ip")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let reasons = self.flagger.reasons(
            event_type,
            timestamp,
            now,
            user_agent.as_deref(),
            ip.as_deref(),
        );
        if !reasons.is_empty() {
            metadata.insert("suspected_bot".to_string(), serde_json::json!(true));
            metadata.insert("bot_reasons".to_string(), serde_json::json!(reasons));
            self.stats.bots_flagged.fetch_add(1, Ordering::Relaxed);
        }

        // Training-feature extraction into typed columns.
        let mut latency_features = extract_latency_features(&metadata);
        latency_features.backfill_from_timestamp(timestamp);

        let event = EngagementEvent {
            event_id: event_id.to_string(),
            esp: record.esp.clone().unwrap_or_else(|| "unknown".to_string()),
            universal_id,
            event_type,
            timestamp,
            recipient_email_hash,
            campaign_id: record.campaign_id.clone(),
            latency_features,
            metadata: serde_json::Value::Object(metadata),
        };

        let inserted = self.with_retries(|| self.events.insert_event(&event))?;
        if inserted {
            self.stats.inserted.fetch_add(1, Ordering::Relaxed);
            Ok(ProcessOutcome::Inserted)
        } else {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            Ok(ProcessOutcome::Duplicate)
        }
    }

    /// Bulk path: same per-record steps, no offset tracking. Idempotent
    /// because the event store deduplicates on `(esp, event_id,
    /// campaign_id)`.
    pub fn backfill(&self, payloads: &[serde_json::Value], now: DateTime<Utc>) -> BackfillReport {
        let mut report = BackfillReport::default();
        for (index, payload) in payloads.iter().enumerate() {
            let message = LogMessage {
                key: None,
                payload: serde_json::to_vec(payload).unwrap_or_default(),
                partition: 0,
                offset: index as u64,
            };
            report.processed += 1;
            match self.process_message(&message, now) {
                Ok(ProcessOutcome::Inserted) => report.inserted += 1,
                Ok(ProcessOutcome::Duplicate) => report.duplicates += 1,
                Ok(ProcessOutcome::DeadLettered) => report.dead_lettered += 1,
                Err(e) => {
                    tracing::warn!(index, error = %e, "backfill record failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn dead_letter(
        &self,
        message: &LogMessage,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        tracing::warn!(
            partition = message.partition,
            offset = message.offset,
            error = %error,
            "dead-lettering message"
        );
        self.dead_letters.send(&DeadLetter {
            error,
            original_key: message.key.clone(),
            original_value: String::from_utf8_lossy(&message.payload).into_owned(),
            partition: message.partition,
            offset: message.offset,
            ingested_at: now,
        })?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        Ok(ProcessOutcome::DeadLettered)
    }

    /// Exponential backoff with jitter on retryable errors only.
    fn with_retries<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.ingest_max_retries => {
                    attempt += 1;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    let backoff_ms = 50u64 * (1 << attempt.min(6))
                        + rand::thread_rng().gen_range(0..50u64);
                    tracing::debug!(attempt, backoff_ms, error = %e, "retrying after backoff");
                    std::thread::sleep(StdDuration::from_millis(backoff_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn extract_latency_features(metadata: &serde_json::Map<String, serde_json::Value>) -> LatencyFeatures {
    let as_u8 = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v.min(u8::MAX as u64) as u8)
    };
    LatencyFeatures {
        latency_seconds: metadata.get("latency_seconds").and_then(|v| v.as_f64()),
        send_time: metadata
            .get("send_time")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)),
        hour_of_day: as_u8("hour_of_day"),
        minute: as_u8("minute"),
        day_of_week: as_u8("day_of_week"),
        campaign_type: metadata
            .get("campaign_type")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        payload_size_bytes: metadata.get("payload_size_bytes").and_then(|v| v.as_u64()),
        queue_depth_estimate: metadata
            .get("queue_depth_estimate")
            .and_then(|v| v.as_u64()),
    }
}

/// Synchronously process a partition until it is empty, committing after
/// each handled message. Used by tests and the backfill CLI path.
pub fn drain_partition(
    pipeline: &IngestPipeline,
    consumer: &dyn LogConsumer,
    partition: u32,
) -> Result<usize> {
    let mut handled = 0usize;
    while let Some(message) = consumer.poll(partition)? {
        pipeline.process_message(&message, Utc::now())?;
        consumer.commit(partition, message.offset)?;
        handled += 1;
    }
    Ok(handled)
}

/// Worker pool over the partitioned log: one blocking worker per
/// partition, serial within each partition.
pub struct PipelineRunner {
    shutdown: Arc<AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl PipelineRunner {
    pub fn start(pipeline: Arc<IngestPipeline>, consumer: Arc<dyn LogConsumer>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for partition in 0..consumer.partition_count() {
            let pipeline = pipeline.clone();
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                run_partition_worker(pipeline, consumer, partition, shutdown);
            }));
        }
        Self { shutdown, handles }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub async fn join(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn run_partition_worker(
    pipeline: Arc<IngestPipeline>,
    consumer: Arc<dyn LogConsumer>,
    partition: u32,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match consumer.poll(partition) {
            Ok(Some(message)) => {
                // At-least-once: keep retrying the same message until it is
                // handled, then commit its offset.
                loop {
                    match pipeline.process_message(&message, Utc::now()) {
                        Ok(_) => {
                            if let Err(e) = consumer.commit(partition, message.offset) {
                                tracing::warn!(partition, error = %e, "offset commit failed");
                            }
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(partition, offset = message.offset, error = %e,
                                "message processing failed, will retry");
                            std::thread::sleep(StdDuration::from_millis(500));
                            if shutdown.load(Ordering::Relaxed) {
                                return;
                            }
                        }
                    }
                }
            }
            Ok(None) => std::thread::sleep(StdDuration::from_millis(100)),
            Err(e) => {
                tracing::warn!(partition, error = %e, "poll failed");
                std::thread::sleep(StdDuration::from_millis(500));
            }
        }
    }
}
