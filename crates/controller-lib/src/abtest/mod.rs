//! A/B assignment framework
//!
//! Deterministic hash bucketing keyed on (test id, subject id): the
//! same subject always lands in the same variant for a given test,
//! with no coordination between processes. First assignments are
//! recorded once and emitted on the event bus.

mod events;

pub use events::{AbTestEvent, AbTestEventKind, EventBus};

use crate::error::{CanaryError, Result};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::store::{PersistedAbTest, StateStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One variant and its share of the bucket space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantAllocation {
    pub name: String,
    /// Percentage of subjects, 0-100
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOp {
    Equals,
    GreaterThan,
    LessThan,
    InSet,
}

/// A targeting predicate on a subject attribute. A subject qualifies
/// for a test only when every rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRule {
    pub attribute: String,
    pub op: SegmentOp,
    pub value: Value,
}

impl SegmentRule {
    pub fn matches(&self, attributes: &HashMap<String, Value>) -> bool {
        let Some(actual) = attributes.get(&self.attribute) else {
            return false;
        };
        match self.op {
            SegmentOp::Equals => actual == &self.value,
            SegmentOp::GreaterThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            SegmentOp::LessThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            SegmentOp::InSet => self
                .value
                .as_array()
                .is_some_and(|set| set.contains(actual)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestConfig {
    pub test_id: String,
    pub name: String,
    /// Variants in declaration order; bucketing assigns cumulative
    /// ranges in this order
    pub variants: Vec<VariantAllocation>,
    #[serde(default)]
    pub segment_rules: Vec<SegmentRule>,
    /// Unix timestamps bounding the test
    pub start_time: i64,
    pub end_time: i64,
}

impl AbTestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.test_id.is_empty() {
            return Err(CanaryError::Configuration(
                "test_id must not be empty".to_string(),
            ));
        }
        if self.variants.len() < 2 {
            return Err(CanaryError::Configuration(
                "a test needs at least two variants".to_string(),
            ));
        }
        let total: u32 = self.variants.iter().map(|v| v.percent as u32).sum();
        if total != 100 {
            return Err(CanaryError::Configuration(format!(
                "variant allocations must sum to 100, got {total}"
            )));
        }
        let mut names: Vec<&str> = self.variants.iter().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.variants.len() {
            return Err(CanaryError::Configuration(
                "variant names must be unique".to_string(),
            ));
        }
        if self.end_time <= self.start_time {
            return Err(CanaryError::Configuration(
                "end_time must be after start_time".to_string(),
            ));
        }
        Ok(())
    }

    pub fn phase_at(&self, now: i64) -> TestPhase {
        if now < self.start_time {
            TestPhase::Scheduled
        } else if now < self.end_time {
            TestPhase::Running
        } else {
            TestPhase::Ended
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Scheduled,
    Running,
    Ended,
}

/// Deterministic bucket in [0, 100) for a (test, subject) pair
pub fn bucket_for(test_id: &str, subject_id: &str) -> u8 {
    let digest = Sha256::digest(format!("{test_id}:{subject_id}").as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Registry of active tests and their sticky assignments
pub struct AbTestRegistry {
    tests: DashMap<String, AbTestConfig>,
    /// (test_id, subject_id) -> variant name
    assignments: DashMap<(String, String), String>,
    events: EventBus,
    store: Option<Arc<StateStore>>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl AbTestRegistry {
    pub fn new(store: Option<Arc<StateStore>>) -> Self {
        Self {
            tests: DashMap::new(),
            assignments: DashMap::new(),
            events: EventBus::new(),
            store,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("abtest"),
        }
    }

    pub fn subscribe_events(&self, capacity: usize) -> tokio::sync::mpsc::Receiver<AbTestEvent> {
        self.events.subscribe(capacity)
    }

    pub fn register(&self, config: AbTestConfig) -> Result<()> {
        config.validate()?;
        if self.tests.contains_key(&config.test_id) {
            return Err(CanaryError::Configuration(format!(
                "test {} already exists",
                config.test_id
            )));
        }
        let test_id = config.test_id.clone();
        self.tests.insert(test_id.clone(), config);
        self.persist(&test_id);
        Ok(())
    }

    /// Restore tests and their assignments from the store
    pub fn load_all(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let persisted = store
            .load_ab_tests()
            .map_err(|e| CanaryError::Store(e.to_string()))?;
        let mut loaded = 0;
        for saved in persisted {
            let test_id = saved.config.test_id.clone();
            for (subject_id, variant) in saved.assignments {
                self.assignments
                    .insert((test_id.clone(), subject_id), variant);
            }
            self.tests.insert(test_id, saved.config);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get_test(&self, test_id: &str) -> Option<AbTestConfig> {
        self.tests.get(test_id).map(|t| t.clone())
    }

    pub fn list_tests(&self) -> Vec<AbTestConfig> {
        self.tests.iter().map(|t| t.clone()).collect()
    }

    /// Resolve the variant for a subject. Returns `None` when the test
    /// is not running or the subject does not match the segment rules.
    /// A subject whose attributes stop matching keeps their stored
    /// assignment but is no longer served it; once the test ends the
    /// stored assignment is returned unconditionally for analysis.
    pub fn get_variant(
        &self,
        test_id: &str,
        subject_id: &str,
        attributes: &HashMap<String, Value>,
    ) -> Result<Option<String>> {
        self.get_variant_at(test_id, subject_id, attributes, Utc::now().timestamp())
    }

    pub fn get_variant_at(
        &self,
        test_id: &str,
        subject_id: &str,
        attributes: &HashMap<String, Value>,
        now: i64,
    ) -> Result<Option<String>> {
        let config = self
            .tests
            .get(test_id)
            .ok_or_else(|| CanaryError::UnknownTest(test_id.to_string()))?
            .clone();

        let key = (test_id.to_string(), subject_id.to_string());
        let phase = config.phase_at(now);

        // Ended tests keep serving prior assignments for analysis
        if phase == TestPhase::Ended {
            return Ok(self.assignments.get(&key).map(|v| v.clone()));
        }

        // Rules come before the cache: a subject whose attributes no
        // longer qualify is withheld, not reassigned
        if !config.segment_rules.iter().all(|r| r.matches(attributes)) {
            return Ok(None);
        }

        if let Some(existing) = self.assignments.get(&key) {
            return Ok(Some(existing.clone()));
        }

        if phase != TestPhase::Running {
            return Ok(None);
        }

        let bucket = bucket_for(test_id, subject_id);
        let variant = variant_for_bucket(&config.variants, bucket);

        // The entry API makes the first assignment the only one that
        // sticks under concurrent lookups
        let mut first_assignment = false;
        let assigned = self
            .assignments
            .entry(key)
            .or_insert_with(|| {
                first_assignment = true;
                variant.clone()
            })
            .clone();

        if first_assignment {
            self.metrics.inc_ab_assignments();
            self.logger.log_assignment(test_id, subject_id, &assigned);
            self.events.publish(AbTestEvent {
                test_id: test_id.to_string(),
                subject_id: subject_id.to_string(),
                variant: assigned.clone(),
                kind: AbTestEventKind::Assignment,
                timestamp: now,
            });
            self.persist(test_id);
        }

        Ok(Some(assigned))
    }

    /// Record that an assigned subject actually saw its variant
    pub fn track_exposure(&self, test_id: &str, subject_id: &str) -> Result<()> {
        if !self.tests.contains_key(test_id) {
            return Err(CanaryError::UnknownTest(test_id.to_string()));
        }
        let key = (test_id.to_string(), subject_id.to_string());
        let Some(variant) = self.assignments.get(&key).map(|v| v.clone()) else {
            return Err(CanaryError::InvalidState(format!(
                "subject {subject_id} has no assignment in test {test_id}"
            )));
        };
        self.metrics.inc_ab_exposures();
        self.events.publish(AbTestEvent {
            test_id: test_id.to_string(),
            subject_id: subject_id.to_string(),
            variant,
            kind: AbTestEventKind::Exposure,
            timestamp: Utc::now().timestamp(),
        });
        Ok(())
    }

    fn persist(&self, test_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(config) = self.get_test(test_id) else {
            return;
        };
        let assignments: HashMap<String, String> = self
            .assignments
            .iter()
            .filter(|entry| entry.key().0 == test_id)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        let saved = PersistedAbTest {
            config,
            assignments,
        };
        if let Err(e) = store.save_ab_test(&saved) {
            warn!(test_id = %test_id, error = %e, "Failed to persist test state");
        }
    }
}

fn variant_for_bucket(variants: &[VariantAllocation], bucket: u8) -> String {
    let mut upper = 0u32;
    for variant in variants {
        upper += variant.percent as u32;
        if (bucket as u32) < upper {
            return variant.name.clone();
        }
    }
    // Allocations sum to 100 and buckets are < 100, so this is only
    // reachable with an unvalidated config
    variants
        .last()
        .map(|v| v.name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> AbTestConfig {
        AbTestConfig {
            test_id: "checkout-flow".to_string(),
            name: "New checkout flow".to_string(),
            variants: vec![
                VariantAllocation {
                    name: "control".to_string(),
                    percent: 60,
                },
                VariantAllocation {
                    name: "treatment".to_string(),
                    percent: 30,
                },
                VariantAllocation {
                    name: "treatment-v2".to_string(),
                    percent: 10,
                },
            ],
            segment_rules: Vec::new(),
            start_time: 1_000,
            end_time: 2_000,
        }
    }

    #[test]
    fn test_validate_rejects_bad_allocations() {
        let mut config = test_config();
        config.variants[0].percent = 50;
        assert!(matches!(
            config.validate(),
            Err(CanaryError::Configuration(_))
        ));

        let mut config = test_config();
        config.variants[1].name = "control".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.end_time = config.start_time;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bucket_deterministic_and_bounded() {
        for i in 0..200 {
            let subject = format!("user-{i}");
            let a = bucket_for("checkout-flow", &subject);
            let b = bucket_for("checkout-flow", &subject);
            assert_eq!(a, b);
            assert!(a < 100);
        }
        // Different tests bucket the same subject independently
        assert_ne!(
            (0..50).map(|i| bucket_for("test-a", &format!("u{i}"))).collect::<Vec<_>>(),
            (0..50).map(|i| bucket_for("test-b", &format!("u{i}"))).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn test_assignment_sticky_and_deterministic() {
        let registry = AbTestRegistry::new(None);
        registry.register(test_config()).unwrap();
        let attrs = HashMap::new();

        let first = registry
            .get_variant_at("checkout-flow", "user-42", &attrs, 1_500)
            .unwrap()
            .unwrap();
        for _ in 0..10 {
            let again = registry
                .get_variant_at("checkout-flow", "user-42", &attrs, 1_500)
                .unwrap()
                .unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_distribution_approximates_allocations() {
        let registry = AbTestRegistry::new(None);
        registry.register(test_config()).unwrap();
        let attrs = HashMap::new();

        let mut counts: HashMap<String, u32> = HashMap::new();
        for i in 0..10_000 {
            let variant = registry
                .get_variant_at("checkout-flow", &format!("user-{i}"), &attrs, 1_500)
                .unwrap()
                .unwrap();
            *counts.entry(variant).or_default() += 1;
        }

        let pct = |name: &str| *counts.get(name).unwrap() as f64 / 100.0;
        assert!((pct("control") - 60.0).abs() < 5.0);
        assert!((pct("treatment") - 30.0).abs() < 5.0);
        assert!((pct("treatment-v2") - 10.0).abs() < 5.0);
    }

    #[test]
    fn test_segment_rules_gate_assignment() {
        let mut config = test_config();
        config.segment_rules = vec![
            SegmentRule {
                attribute: "country".to_string(),
                op: SegmentOp::InSet,
                value: json!(["US", "CA"]),
            },
            SegmentRule {
                attribute: "account_age_days".to_string(),
                op: SegmentOp::GreaterThan,
                value: json!(30),
            },
        ];
        let registry = AbTestRegistry::new(None);
        registry.register(config).unwrap();

        let eligible: HashMap<String, Value> = [
            ("country".to_string(), json!("US")),
            ("account_age_days".to_string(), json!(90)),
        ]
        .into();
        let too_new: HashMap<String, Value> = [
            ("country".to_string(), json!("US")),
            ("account_age_days".to_string(), json!(10)),
        ]
        .into();
        let missing_attr: HashMap<String, Value> =
            [("country".to_string(), json!("US"))].into();

        assert!(registry
            .get_variant_at("checkout-flow", "user-1", &eligible, 1_500)
            .unwrap()
            .is_some());
        assert!(registry
            .get_variant_at("checkout-flow", "user-2", &too_new, 1_500)
            .unwrap()
            .is_none());
        assert!(registry
            .get_variant_at("checkout-flow", "user-3", &missing_attr, 1_500)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_newly_excluded_subject_is_withheld_not_reassigned() {
        let mut config = test_config();
        config.segment_rules = vec![SegmentRule {
            attribute: "country".to_string(),
            op: SegmentOp::InSet,
            value: json!(["US", "CA"]),
        }];
        let registry = AbTestRegistry::new(None);
        registry.register(config).unwrap();

        let us: HashMap<String, Value> = [("country".to_string(), json!("US"))].into();
        let fr: HashMap<String, Value> = [("country".to_string(), json!("FR"))].into();

        let variant = registry
            .get_variant_at("checkout-flow", "user-42", &us, 1_500)
            .unwrap()
            .unwrap();

        // Attributes that stop matching withhold the variant without
        // disturbing the stored assignment
        assert_eq!(
            registry
                .get_variant_at("checkout-flow", "user-42", &fr, 1_500)
                .unwrap(),
            None
        );
        assert_eq!(
            registry
                .get_variant_at("checkout-flow", "user-42", &us, 1_500)
                .unwrap(),
            Some(variant)
        );
    }

    #[test]
    fn test_phase_gates_new_assignments() {
        let registry = AbTestRegistry::new(None);
        registry.register(test_config()).unwrap();
        let attrs = HashMap::new();

        // Before start and after end, no new assignments
        assert!(registry
            .get_variant_at("checkout-flow", "user-1", &attrs, 500)
            .unwrap()
            .is_none());
        assert!(registry
            .get_variant_at("checkout-flow", "user-1", &attrs, 3_000)
            .unwrap()
            .is_none());

        // An assignment made while running survives the end of the test
        let variant = registry
            .get_variant_at("checkout-flow", "user-1", &attrs, 1_500)
            .unwrap()
            .unwrap();
        assert_eq!(
            registry
                .get_variant_at("checkout-flow", "user-1", &attrs, 3_000)
                .unwrap(),
            Some(variant)
        );
    }

    #[test]
    fn test_unknown_test_errors() {
        let registry = AbTestRegistry::new(None);
        let attrs = HashMap::new();
        assert!(matches!(
            registry.get_variant_at("missing", "user-1", &attrs, 1_500),
            Err(CanaryError::UnknownTest(_))
        ));
    }

    #[tokio::test]
    async fn test_assignment_and_exposure_events() {
        let registry = AbTestRegistry::new(None);
        registry.register(test_config()).unwrap();
        let mut rx = registry.subscribe_events(8);
        let attrs = HashMap::new();

        let variant = registry
            .get_variant_at("checkout-flow", "user-7", &attrs, 1_500)
            .unwrap()
            .unwrap();
        // Repeat lookups do not re-emit assignment events
        registry
            .get_variant_at("checkout-flow", "user-7", &attrs, 1_500)
            .unwrap();
        registry.track_exposure("checkout-flow", "user-7").unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, AbTestEventKind::Assignment);
        assert_eq!(first.variant, variant);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, AbTestEventKind::Exposure);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_exposure_without_assignment_errors() {
        let registry = AbTestRegistry::new(None);
        registry.register(test_config()).unwrap();
        assert!(matches!(
            registry.track_exposure("checkout-flow", "user-9"),
            Err(CanaryError::InvalidState(_))
        ));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let attrs = HashMap::new();

        let variant = {
            let registry = AbTestRegistry::new(Some(store.clone()));
            registry.register(test_config()).unwrap();
            registry
                .get_variant_at("checkout-flow", "user-42", &attrs, 1_500)
                .unwrap()
                .unwrap()
        };

        let restored = AbTestRegistry::new(Some(store));
        assert_eq!(restored.load_all().unwrap(), 1);
        assert_eq!(
            restored
                .get_variant_at("checkout-flow", "user-42", &attrs, 1_500)
                .unwrap(),
            Some(variant)
        );
    }
}
