//! Timing decision engine.
//!
//! Combines the recipient's engagement curve with real-time context
//! weights, clips to the caller's send window, picks the target minute,
//! subtracts the latency estimate, and persists an explanation row. The
//! engine never partially persists: a failure anywhere discards the
//! in-flight computation and nothing is written.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Timelike, Utc};
use uuid::Uuid;

use sf_core::{
    minute_grid, AppliedWeight, RawIdentifiers, Result, TimingConfig, TimingDecision,
    TimingError, TimingExplanation, UniversalId, WeightSpan, MINUTES_PER_WEEK, MODEL_VERSION,
};
use sf_store::{EventStore, ExplanationLog};

use crate::context::{pull_context, HotPathSignal};
use crate::feature_engine::FeatureEngine;
use crate::identity::IdentityResolver;
use crate::predictors::{
    HeuristicLatency, HeuristicSignalWeight, LatencyContext, LatencyPredictor,
    SignalWeightPredictor,
};

/// Acceleration applies to the hour immediately following `now`.
const ACCELERATION_SPAN_MINUTES: usize = 60;

#[derive(Debug, Clone, Default)]
pub struct DecisionRequest {
    /// Pre-resolved universal ID; skips identity resolution when present.
    pub universal_id: Option<UniversalId>,
    pub identifiers: RawIdentifiers,
    pub send_after: Option<DateTime<Utc>>,
    pub send_before: Option<DateTime<Utc>>,
    pub latency_estimate_seconds: Option<f64>,
    pub esp: Option<String>,
    pub campaign_type: Option<String>,
    pub payload_size_bytes: Option<u64>,
    pub queue_depth_estimate: Option<u64>,
}

pub struct DecisionEngine {
    resolver: Arc<IdentityResolver>,
    features: Arc<FeatureEngine>,
    events: Arc<dyn EventStore>,
    explanations: Arc<dyn ExplanationLog>,
    latency_predictor: Arc<dyn LatencyPredictor>,
    latency_is_fallback: bool,
    signal_predictor: Arc<dyn SignalWeightPredictor>,
    signal_is_fallback: bool,
    config: Arc<TimingConfig>,
}

impl DecisionEngine {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        features: Arc<FeatureEngine>,
        events: Arc<dyn EventStore>,
        explanations: Arc<dyn ExplanationLog>,
        config: Arc<TimingConfig>,
    ) -> Self {
        Self {
            resolver,
            features,
            events,
            explanations,
            latency_predictor: Arc::new(HeuristicLatency),
            latency_is_fallback: true,
            signal_predictor: Arc::new(HeuristicSignalWeight),
            signal_is_fallback: true,
            config,
        }
    }

    pub fn with_latency_predictor(mut self, predictor: Arc<dyn LatencyPredictor>) -> Self {
        self.latency_predictor = predictor;
        self.latency_is_fallback = false;
        self
    }

    pub fn with_signal_predictor(mut self, predictor: Arc<dyn SignalWeightPredictor>) -> Self {
        self.signal_predictor = predictor;
        self.signal_is_fallback = false;
        self
    }

    pub fn decide(&self, request: &DecisionRequest) -> Result<TimingDecision> {
        self.decide_at(request, Utc::now())
    }

    pub fn decide_at(
        &self,
        request: &DecisionRequest,
        now: DateTime<Utc>,
    ) -> Result<TimingDecision> {
        let started = Instant::now();

        if let (Some(after), Some(before)) = (request.send_after, request.send_before) {
            if before <= after {
                return Err(TimingError::InvalidInput(
                    "send_before must be after send_after".to_string(),
                ));
            }
        }
        if let Some(before) = request.send_before {
            if before <= now {
                return Err(TimingError::WindowExpired(format!(
                    "send_before {} is in the past",
                    before.to_rfc3339()
                )));
            }
        }

        // Resolve identity.
        let universal_id = match &request.universal_id {
            Some(uid) => uid.clone(),
            None => {
                self.resolver
                    .resolve_at(&request.identifiers, now)?
                    .universal_id
            }
        };

        // 1. Curve fetch.
        let snapshot = self.features.features_at(&universal_id, now)?;
        let base_confidence = snapshot.curve_confidence;
        let base_peak = snapshot.curve.peak_in_window(0, 0).unwrap_or(0) as u16;

        let mut warnings = Vec::new();

        // 2. Latency estimate.
        let latency = match request.latency_estimate_seconds {
            Some(supplied) => supplied,
            None => {
                if self.latency_is_fallback {
                    warnings.push("predictor_fallback:latency".to_string());
                }
                let ctx = LatencyContext {
                    esp: request.esp.clone(),
                    campaign_type: request.campaign_type.clone(),
                    payload_size_bytes: request.payload_size_bytes,
                    queue_depth_estimate: request.queue_depth_estimate,
                };
                self.latency_predictor
                    .predict(&ctx, now, self.config.default_latency_seconds)
            }
        };
        let latency = latency.clamp(
            self.config.latency_clamp_min_seconds,
            self.config.latency_clamp_max_seconds,
        );

        // 3. Context pull.
        let context = pull_context(self.events.as_ref(), &self.config, &universal_id, now)?;

        // 4. Circuit-breaker suppression: trigger at the release instant,
        // no latency subtraction.
        if let Some(suppression) = &context.suppression {
            let decision = self.build_decision(
                &universal_id,
                minute_grid::datetime_to_slot(suppression.until) as u16,
                suppression.until,
                latency,
                base_confidence,
                base_peak,
                Vec::new(),
                true,
                Some(suppression.reason.as_str().to_string()),
                Some(suppression.until),
                warnings,
                now,
            );
            self.persist(&decision, started)?;
            return Ok(decision);
        }

        // 5. Acceleration weights across the hour following now.
        let now_slot = minute_grid::datetime_to_slot(now);
        let mut applied_weights = Vec::new();
        let mut spans = Vec::new();
        if !context.hot_paths.is_empty() && self.signal_is_fallback {
            warnings.push("predictor_fallback:signal_weight".to_string());
        }
        for HotPathSignal {
            signal,
            minutes_ago,
            ..
        } in &context.hot_paths
        {
            let omega = self.signal_predictor.weight(*signal, *minutes_ago).max(0.0);
            if omega <= 0.0 {
                continue;
            }
            applied_weights.push(AppliedWeight {
                signal: signal.as_str().to_string(),
                magnitude: omega,
                minutes_ago: *minutes_ago,
            });
            spans.push(WeightSpan {
                start_slot: now_slot,
                len: ACCELERATION_SPAN_MINUTES,
                omega,
            });
        }

        // 6. Reweight and clip to the earliest viable week of the window.
        let mut curve = snapshot.curve.clone();
        curve.apply_weights(&spans);

        // Nothing can arrive earlier than now + latency; flooring the
        // window start there keeps hot-path triggers out of the past.
        let latency_duration = Duration::milliseconds((latency * 1000.0).round() as i64);
        let earliest_arrival = now + latency_duration;
        let effective_after = match request.send_after {
            Some(after) if after > earliest_arrival => after,
            _ => earliest_arrival,
        };
        let window = self.window_slots(effective_after, request.send_before)?;
        if let Some((start_slot, end_slot)) = window {
            curve.clip_to_window(start_slot, end_slot);
        }

        if curve.is_suppressed() {
            // Everything the weights and window left behind is zero.
            let trigger = ceil_to_minute(effective_after);
            let decision = self.build_decision(
                &universal_id,
                minute_grid::datetime_to_slot(trigger) as u16,
                trigger,
                latency,
                base_confidence,
                base_peak,
                applied_weights,
                true,
                Some("curve_collapsed".to_string()),
                None,
                warnings,
                now,
            );
            self.persist(&decision, started)?;
            return Ok(decision);
        }

        // 7. Target pick (ties break toward the lower slot).
        let (start_slot, end_slot) = window.unwrap_or((0, 0));
        let target_slot = curve
            .peak_in_window(start_slot, end_slot)
            .ok_or_else(|| TimingError::WindowExpired("no usable minute slot".to_string()))?;

        // 8. Trigger compute: next occurrence, minus latency, never in the
        // past.
        let mut target_instant = minute_grid::next_occurrence_after(target_slot, effective_after);
        let mut trigger = target_instant - latency_duration;
        while trigger < now {
            target_instant += Duration::days(7);
            trigger = target_instant - latency_duration;
        }
        if let Some(before) = request.send_before {
            if target_instant > before {
                return Err(TimingError::WindowExpired(format!(
                    "no occurrence of slot {} before {}",
                    target_slot,
                    before.to_rfc3339()
                )));
            }
        }

        // 9. Confidence: post-reweight sharpness, discounted by data
        // sufficiency.
        let sufficiency = (snapshot.counters.clicks_7d as f64 / 10.0).min(1.0);
        let confidence = (curve.confidence() * sufficiency).clamp(0.0, 1.0);

        // 10. Emit.
        let decision = self.build_decision(
            &universal_id,
            target_slot as u16,
            trigger,
            latency,
            confidence,
            base_peak,
            applied_weights,
            false,
            None,
            None,
            warnings,
            now,
        );
        self.persist(&decision, started)?;
        Ok(decision)
    }

    /// Slot window for the earliest viable week, or None for the whole
    /// grid. Start is rounded up to the next whole minute so every slot in
    /// the window still has an occurrence inside the absolute bounds.
    fn window_slots(
        &self,
        effective_after: DateTime<Utc>,
        send_before: Option<DateTime<Utc>>,
    ) -> Result<Option<(usize, usize)>> {
        let Some(before) = send_before else {
            return Ok(None);
        };
        if before - effective_after >= Duration::days(7) {
            return Ok(None);
        }
        let start_instant = ceil_to_minute(effective_after);
        if before <= start_instant {
            return Err(TimingError::WindowExpired(
                "window narrower than one minute".to_string(),
            ));
        }
        let start_slot = minute_grid::datetime_to_slot(start_instant);
        let mut end_slot = minute_grid::datetime_to_slot(before);
        if end_slot == start_slot {
            end_slot = (start_slot + 1) % MINUTES_PER_WEEK;
        }
        Ok(Some((start_slot, end_slot)))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_decision(
        &self,
        universal_id: &UniversalId,
        target_minute: u16,
        trigger: DateTime<Utc>,
        latency: f64,
        confidence: f64,
        base_peak: u16,
        applied_weights: Vec<AppliedWeight>,
        suppressed: bool,
        suppression_reason: Option<String>,
        suppression_until: Option<DateTime<Utc>>,
        warnings: Vec<String>,
        now: DateTime<Utc>,
    ) -> TimingDecision {
        let decision_id = Uuid::new_v4().to_string();
        TimingDecision {
            explanation_ref: format!("explain:{}:{}", universal_id, decision_id),
            decision_id,
            universal_id: universal_id.clone(),
            target_minute,
            trigger_timestamp_utc: trigger,
            latency_estimate_seconds: latency,
            confidence_score: confidence,
            model_version: MODEL_VERSION.to_string(),
            base_curve_peak_minute: base_peak,
            applied_weights,
            suppressed,
            suppression_reason,
            suppression_until,
            warnings,
            created_at: now,
        }
    }

    /// Deadline guard plus the explanation write. Exceeding the hard
    /// deadline surfaces `Timeout` with nothing persisted.
    fn persist(&self, decision: &TimingDecision, started: Instant) -> Result<()> {
        if started.elapsed().as_millis() as u64 > self.config.decision_deadline_ms {
            return Err(TimingError::Timeout(format!(
                "decision exceeded {} ms deadline",
                self.config.decision_deadline_ms
            )));
        }
        self.explanations
            .append(&TimingExplanation::for_decision(decision))?;
        tracing::debug!(
            decision_id = %decision.decision_id,
            universal_id = %decision.universal_id,
            target_minute = decision.target_minute,
            suppressed = decision.suppressed,
            "timing decision persisted"
        );
        Ok(())
    }
}

fn ceil_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = t
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    if truncated < t {
        truncated + Duration::minutes(1)
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ceil_to_minute() {
        let exact = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        assert_eq!(ceil_to_minute(exact), exact);
        let mid = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 30).unwrap();
        assert_eq!(
            ceil_to_minute(mid),
            Utc.with_ymd_and_hms(2026, 1, 5, 9, 1, 0).unwrap()
        );
    }
}
