//! Timing intelligence engines.
//!
//! This crate holds the inference side of the timing layer: identity
//! resolution, engagement feature computation, timing decisions, and the
//! event ingestion pipeline. Gateways come in from `sf-store`; everything
//! here is request-parallel and stateless apart from reads/writes through
//! those gateways.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐    ┌─────────────────┐    ┌──────────────┐
//!  │  adapters  │───▶│  durable log    │───▶│   Ingest     │──▶ EventStore
//!  │ (webhooks) │    │ (per-recipient  │    │   Pipeline   │──▶ DLQ
//!  └────────────┘    │  partitions)    │    └──────────────┘
//!                    └─────────────────┘
//!
//!  decision request
//!        │
//!        ▼
//!  ┌──────────────┐   ┌───────────────┐   ┌─────────────────┐
//!  │   Identity   │──▶│    Feature    │──▶│     Decision    │──▶ explanation
//!  │   Resolver   │   │    Engine     │   │     Engine      │    log + reply
//!  └──────────────┘   └───────────────┘   └─────────────────┘
//!   IdentityStore      EventStore +        context signals +
//!                      FeatureCache        predictor ports
//! ```

pub mod bot_flags;
pub mod context;
pub mod decision_engine;
pub mod feature_engine;
pub mod identity;
pub mod ingest;
pub mod predictors;
pub mod singleflight;

pub use bot_flags::BotFlagger;
pub use context::{pull_context, ContextSignals, HotPathSignal, Suppression};
pub use decision_engine::{DecisionEngine, DecisionRequest};
pub use feature_engine::FeatureEngine;
pub use identity::{IdentityResolver, ResolutionOutcome};
pub use ingest::{
    drain_partition, BackfillReport, IngestPipeline, IngestStatsSnapshot, PipelineRunner,
    ProcessOutcome,
};
pub use predictors::{
    CohortPrior, HeuristicLatency, HeuristicSignalWeight, LatencyContext, LatencyPredictor,
    SignalWeightPredictor,
};
pub use singleflight::Singleflight;
