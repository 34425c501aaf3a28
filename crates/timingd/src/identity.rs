//! Identity resolver: deterministic lookup, probabilistic graph traversal,
//! synthesize-new.
//!
//! Resolution order:
//! 1. Deterministic cache hits (email hash, then phone), confidence 1.0.
//!    Two deterministic hits on different universal IDs trigger the
//!    merge-edge path: the older universal ID wins, the loser's mappings
//!    are repointed, nothing is deleted.
//! 2. Probabilistic identifiers in descending weight order. A cached
//!    mapping with confidence 1.0 short-circuits; otherwise a depth- and
//!    budget-bounded BFS over the edge graph looks for a
//!    deterministically-backed endpoint and wins when it is more confident
//!    than the cached mapping.
//! 3. Synthesis of a fresh `sf_` universal ID, unless disabled.
//!
//! Every resolution appends audit records keyed by a fresh resolution ID.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use sf_core::{
    AuditRecord, Identifier, IdentifierType, IdentityEdge, RawIdentifiers, ResolutionEntry,
    Result, TimingConfig, TimingError, UniversalId,
};
use sf_store::IdentityStore;

/// Result of one resolution: the universal ID plus its derivation.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub universal_id: UniversalId,
    pub confidence: f64,
    pub resolution_id: String,
    pub steps: Vec<String>,
    pub known_identifiers: Vec<ResolutionEntry>,
}

pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    config: Arc<TimingConfig>,
}

struct BfsHit {
    universal_id: UniversalId,
    confidence: f64,
    hop_steps: Vec<String>,
}

/// Frontier entry ordered by path-minimum weight, so the strongest edges
/// are explored first.
struct Frontier {
    weight: f64,
    depth: usize,
    node: Identifier,
    hops: Vec<(IdentifierType, IdentifierType)>,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight
    }
}
impl Eq for Frontier {}
impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.weight.total_cmp(&other.weight)
    }
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: Arc<TimingConfig>) -> Self {
        Self { store, config }
    }

    pub fn resolve(&self, raw: &RawIdentifiers) -> Result<ResolutionOutcome> {
        self.resolve_at(raw, Utc::now())
    }

    pub fn resolve_at(&self, raw: &RawIdentifiers, now: DateTime<Utc>) -> Result<ResolutionOutcome> {
        let normalized = raw.normalize(&self.config.phone_default_region);
        if normalized.is_empty() {
            return Err(TimingError::InvalidInput(
                "no identifiers supplied".to_string(),
            ));
        }

        let resolution_id = new_resolution_id();
        let mut steps: Vec<String> = Vec::new();

        // Step 1: deterministic hits, in fixed priority order.
        let mut deterministic_hits: Vec<ResolutionEntry> = Vec::new();
        for id_type in IdentifierType::DETERMINISTIC_PRIORITY {
            let Some(identifier) = normalized.iter().find(|i| i.id_type == id_type) else {
                continue;
            };
            match self.store.cached_resolution(identifier)? {
                Some(entry) => {
                    steps.push(format!(
                        "found_via_{}:{}",
                        identifier.id_type,
                        identifier.truncated()
                    ));
                    deterministic_hits.push(entry);
                }
                None => {
                    steps.push(format!(
                        "{}_miss:{}",
                        identifier.id_type,
                        identifier.truncated()
                    ));
                }
            }
        }

        if let Some(first) = deterministic_hits.first().cloned() {
            let mut universal_id = first.universal_id.clone();
            if let Some(second) = deterministic_hits.get(1) {
                if second.universal_id != universal_id {
                    universal_id = self.merge_conflict(
                        &first,
                        second,
                        &resolution_id,
                        &mut steps,
                        now,
                    )?;
                }
            }
            self.audit(
                &resolution_id,
                &universal_id,
                &first.identifier,
                &steps[steps
                    .iter()
                    .position(|s| s.starts_with("found_via_"))
                    .unwrap_or(0)],
                1.0,
                now,
            )?;
            return self.finish(resolution_id, universal_id, 1.0, normalized, steps, now);
        }

        // Step 2: probabilistic identifiers, highest effective weight first.
        let mut probabilistic: Vec<Identifier> = normalized
            .iter()
            .filter(|i| !i.id_type.is_deterministic())
            .cloned()
            .collect();
        probabilistic.sort_by(|a, b| {
            self.config
                .identifier_weight(b.id_type)
                .total_cmp(&self.config.identifier_weight(a.id_type))
        });

        for identifier in &probabilistic {
            let cached = self.store.cached_resolution(identifier)?;

            if let Some(entry) = &cached {
                if entry.confidence >= 1.0 {
                    let step = format!(
                        "found_via_{}:{}",
                        identifier.id_type,
                        identifier.truncated()
                    );
                    steps.push(step.clone());
                    self.audit(
                        &resolution_id,
                        &entry.universal_id,
                        identifier,
                        &step,
                        entry.confidence,
                        now,
                    )?;
                    let (uid, conf) = (entry.universal_id.clone(), entry.confidence);
                    return self.finish(resolution_id, uid, conf, normalized, steps, now);
                }
            }

            if let Some(hit) = self.traverse(identifier)? {
                let beats_cache = cached
                    .as_ref()
                    .map(|c| hit.confidence > c.confidence)
                    .unwrap_or(true);
                if beats_cache {
                    for step in &hit.hop_steps {
                        steps.push(step.clone());
                        self.audit(
                            &resolution_id,
                            &hit.universal_id,
                            identifier,
                            step,
                            hit.confidence,
                            now,
                        )?;
                    }
                    // A cached mapping losing to a stronger derivation is a
                    // conflict: link the universal IDs and repoint, keep both.
                    if let Some(stale) = &cached {
                        if stale.universal_id != hit.universal_id {
                            self.merge_universal_ids(
                                &hit.universal_id,
                                &stale.universal_id,
                                &resolution_id,
                                &mut steps,
                                now,
                            )?;
                        }
                    }
                    return self.finish(
                        resolution_id,
                        hit.universal_id,
                        hit.confidence,
                        normalized,
                        steps,
                        now,
                    );
                }
            }

            if let Some(entry) = cached {
                let step = format!(
                    "found_via_{}:{}",
                    identifier.id_type,
                    identifier.truncated()
                );
                steps.push(step.clone());
                self.audit(
                    &resolution_id,
                    &entry.universal_id,
                    identifier,
                    &step,
                    entry.confidence,
                    now,
                )?;
                return self.finish(
                    resolution_id,
                    entry.universal_id.clone(),
                    entry.confidence,
                    normalized,
                    steps,
                    now,
                );
            }

            steps.push(format!(
                "{}_miss:{}",
                identifier.id_type,
                identifier.truncated()
            ));
        }

        // Step 3: synthesize.
        if !self.config.allow_synthesis {
            return Err(TimingError::IdentityUnresolved);
        }
        let universal_id = UniversalId::generate();
        steps.push("created:new_universal_id".to_string());
        tracing::debug!(universal_id = %universal_id, "synthesized new universal id");
        self.audit(
            &resolution_id,
            &universal_id,
            &normalized[0],
            "created:new_universal_id",
            1.0,
            now,
        )?;
        for identifier in &normalized {
            self.store.cache_resolution(&ResolutionEntry {
                identifier: identifier.clone(),
                universal_id: universal_id.clone(),
                confidence: self.config.identifier_weight(identifier.id_type),
                last_seen: now,
                created_at: now,
            })?;
        }
        let known_identifiers = self.store.identifiers_for(&universal_id)?;
        Ok(ResolutionOutcome {
            universal_id,
            confidence: 1.0,
            resolution_id,
            steps,
            known_identifiers,
        })
    }

    /// Create (or refresh) an edge between two identifiers. The edge weight
    /// follows the deterministic-endpoint rule unless explicitly supplied.
    pub fn link_edge(
        &self,
        a: Identifier,
        b: Identifier,
        weight: Option<f64>,
        source: &str,
    ) -> Result<()> {
        let weight = IdentityEdge::derive_weight(&a, &b, weight);
        self.store
            .upsert_edge(&IdentityEdge::new(a, b, weight, source, Utc::now()))
    }

    pub fn identifiers_for(&self, universal_id: &UniversalId) -> Result<Vec<ResolutionEntry>> {
        self.store.identifiers_for(universal_id)
    }

    /// Weight-ordered BFS from `start`, bounded by depth and expansion
    /// budget. Stops at the first node with a known universal ID; the hit
    /// confidence is the minimum edge weight along the traversed path.
    fn traverse(&self, start: &Identifier) -> Result<Option<BfsHit>> {
        let mut heap: BinaryHeap<Frontier> = BinaryHeap::new();
        let mut visited: HashSet<Identifier> = HashSet::new();
        visited.insert(start.clone());
        let mut expansions = 0usize;

        for (node, weight) in self.store.neighbors(start)? {
            expansions += 1;
            heap.push(Frontier {
                weight,
                depth: 1,
                hops: vec![(start.id_type, node.id_type)],
                node,
            });
            if expansions >= self.config.bfs_budget {
                break;
            }
        }

        while let Some(frontier) = heap.pop() {
            if !visited.insert(frontier.node.clone()) {
                continue;
            }

            let hit_uid = if frontier.node.id_type == IdentifierType::UniversalId {
                Some(UniversalId::new(frontier.node.value.clone()))
            } else {
                self.store
                    .cached_resolution(&frontier.node)?
                    .map(|entry| entry.universal_id)
            };
            if let Some(universal_id) = hit_uid {
                let hop_steps = frontier
                    .hops
                    .iter()
                    .map(|(from, to)| format!("graph_traversal:{}->{}", from, to))
                    .collect();
                return Ok(Some(BfsHit {
                    universal_id,
                    confidence: frontier.weight,
                    hop_steps,
                }));
            }

            if frontier.depth >= self.config.bfs_depth || expansions >= self.config.bfs_budget {
                continue;
            }
            for (node, edge_weight) in self.store.neighbors(&frontier.node)? {
                if visited.contains(&node) {
                    continue;
                }
                expansions += 1;
                let mut hops = frontier.hops.clone();
                hops.push((frontier.node.id_type, node.id_type));
                heap.push(Frontier {
                    weight: frontier.weight.min(edge_weight),
                    depth: frontier.depth + 1,
                    hops,
                    node,
                });
                if expansions >= self.config.bfs_budget {
                    break;
                }
            }
        }
        Ok(None)
    }

    /// Two deterministic hits on different universal IDs: the older one
    /// (by cache-entry creation) wins.
    fn merge_conflict(
        &self,
        first: &ResolutionEntry,
        second: &ResolutionEntry,
        resolution_id: &str,
        steps: &mut Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<UniversalId> {
        let (winner, loser) = if first.created_at <= second.created_at {
            (first.universal_id.clone(), second.universal_id.clone())
        } else {
            (second.universal_id.clone(), first.universal_id.clone())
        };
        self.merge_universal_ids(&winner, &loser, resolution_id, steps, now)?;
        Ok(winner)
    }

    /// Append-only merge: a weight-1.0 edge between the two universal IDs,
    /// the loser's cache rows repointed at the winner. The losing universal
    /// ID itself is never deleted.
    fn merge_universal_ids(
        &self,
        winner: &UniversalId,
        loser: &UniversalId,
        resolution_id: &str,
        steps: &mut Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.upsert_edge(&IdentityEdge::new(
            Identifier::universal(winner),
            Identifier::universal(loser),
            1.0,
            "identity_merge",
            now,
        ))?;
        for entry in self.store.identifiers_for(loser)? {
            self.store.cache_resolution(&ResolutionEntry {
                universal_id: winner.clone(),
                last_seen: now,
                ..entry
            })?;
        }
        let step = format!("conflict_merged:{}->{}", loser, winner);
        steps.push(step.clone());
        tracing::info!(winner = %winner, loser = %loser, "merged conflicting universal ids");
        self.store.append_audit(&AuditRecord {
            resolution_id: resolution_id.to_string(),
            universal_id: winner.clone(),
            input_identifier: loser.as_str().to_string(),
            input_type: IdentifierType::UniversalId,
            step,
            confidence: 1.0,
            created_at: now,
        })?;
        Ok(())
    }

    /// Cache every supplied identifier against the resolved universal ID
    /// and assemble the outcome.
    fn finish(
        &self,
        resolution_id: String,
        universal_id: UniversalId,
        confidence: f64,
        normalized: Vec<Identifier>,
        steps: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<ResolutionOutcome> {
        for identifier in &normalized {
            let existing = self.store.cached_resolution(identifier)?;
            let entry_confidence = match &existing {
                Some(entry) if entry.universal_id == universal_id => {
                    entry.confidence.max(confidence)
                }
                _ => confidence,
            };
            self.store.cache_resolution(&ResolutionEntry {
                identifier: identifier.clone(),
                universal_id: universal_id.clone(),
                confidence: entry_confidence,
                last_seen: now,
                created_at: existing.map(|e| e.created_at).unwrap_or(now),
            })?;
        }
        let known_identifiers = self.store.identifiers_for(&universal_id)?;
        Ok(ResolutionOutcome {
            universal_id,
            confidence,
            resolution_id,
            steps,
            known_identifiers,
        })
    }

    fn audit(
        &self,
        resolution_id: &str,
        universal_id: &UniversalId,
        identifier: &Identifier,
        step: &str,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.append_audit(&AuditRecord {
            resolution_id: resolution_id.to_string(),
            universal_id: universal_id.clone(),
            input_identifier: identifier.value.clone(),
            input_type: identifier.id_type,
            step: step.to_string(),
            confidence,
            created_at: now,
        })
    }
}

fn new_resolution_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("res_{}", &hex[..12])
}
