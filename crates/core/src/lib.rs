//! Domain primitives for the send-timing intelligence layer.
//!
//! Everything here is pure: identifiers and their normalization, the
//! canonical 10,080-slot week grid, the continuous engagement curve,
//! decision records, the error taxonomy, and configuration. Gateways and
//! engines live in the `sf-store` and `sf-timingd` crates.

pub mod config;
pub mod curve;
pub mod decision;
pub mod error;
pub mod event;
pub mod features;
pub mod identifier;
pub mod minute_grid;
pub mod universal_id;

pub use config::TimingConfig;
pub use curve::{ContinuousCurve, WeightSpan};
pub use decision::{AppliedWeight, TimingDecision, TimingExplanation, MODEL_VERSION};
pub use error::{ErrorReport, Result, TimingError};
pub use event::{EngagementCounters, EngagementEvent, EventType, LatencyFeatures};
pub use features::{FeatureSnapshot, FeatureSummary, PeakWindow};
pub use identifier::{
    hash_email, normalize_phone, AuditRecord, Identifier, IdentifierType, IdentityEdge,
    RawIdentifiers, ResolutionEntry,
};
pub use minute_grid::{MINUTES_PER_DAY, MINUTES_PER_HOUR, MINUTES_PER_WEEK};
pub use universal_id::UniversalId;
