use crate::adaptation::AdaptationPlan;
use crate::detector::{BackendKind, EmotionLabel, EmotionSample};
use crate::error::{AttuneError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Current persisted-record schema version.
const STORE_VERSION: u32 = 2;

/// Single-writer container for the pipeline's shared outputs.
///
/// The sampling loop is the only writer of both the current sample and the
/// current plan. Reads hand out cheap snapshots, so
/// no reader ever observes a torn record.
pub struct EmotionStore {
    current: RwLock<Option<Arc<EmotionSample>>>,
    plan: RwLock<Arc<AdaptationPlan>>,
}

impl EmotionStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            plan: RwLock::new(Arc::new(AdaptationPlan::default())),
        }
    }

    /// Replace the current sample. The one write point for emotion state.
    pub fn publish_sample(&self, sample: EmotionSample) -> Arc<EmotionSample> {
        let sample = Arc::new(sample);
        *self.current.write() = Some(Arc::clone(&sample));
        sample
    }

    pub fn current_sample(&self) -> Option<Arc<EmotionSample>> {
        self.current.read().clone()
    }

    pub fn publish_plan(&self, plan: AdaptationPlan) -> Arc<AdaptationPlan> {
        let plan = Arc::new(plan);
        *self.plan.write() = Arc::clone(&plan);
        plan
    }

    pub fn current_plan(&self) -> Arc<AdaptationPlan> {
        Arc::clone(&self.plan.read())
    }

    /// Drop all published state, e.g. on emotion-source teardown.
    pub fn clear(&self) {
        *self.current.write() = None;
        *self.plan.write() = Arc::new(AdaptationPlan::default());
    }

    /// Serialize the current sample for persistence across sessions.
    pub fn export(&self) -> Result<Option<String>> {
        let Some(sample) = self.current_sample() else {
            return Ok(None);
        };

        let record = PersistedEmotion {
            version: STORE_VERSION,
            label: sample.label.as_str().to_string(),
            confidence: sample.confidence,
            timestamp_ms: sample.timestamp_ms,
            backend: Some(persisted_backend(sample.backend).to_string()),
        };
        Ok(Some(serde_json::to_string(&record)?))
    }

    /// Restore a previously exported sample, migrating legacy vocabularies
    /// at this boundary so consumers only ever see the three-label space.
    pub fn hydrate(&self, json: &str) -> Result<Arc<EmotionSample>> {
        let record: PersistedEmotion = serde_json::from_str(json)?;
        let sample = record.into_sample()?;
        info!(
            "Hydrated stored emotion: {:?} at {:.2}",
            sample.label, sample.confidence
        );
        Ok(self.publish_sample(sample))
    }
}

impl Default for EmotionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk record. Version 1 predates the canonical three-label space and
/// carried the old seven-emotion vocabulary with no backend field.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEmotion {
    version: u32,
    label: String,
    confidence: f64,
    timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
}

impl PersistedEmotion {
    fn into_sample(self) -> Result<EmotionSample> {
        let label = match self.version {
            1 => {
                let collapsed = EmotionLabel::from_name(&self.label);
                debug!(
                    "Migrated legacy emotion label '{}' to {:?}",
                    self.label, collapsed
                );
                collapsed
            }
            2 => match self.label.as_str() {
                "negative" => EmotionLabel::Negative,
                "neutral" => EmotionLabel::Neutral,
                "positive" => EmotionLabel::Positive,
                other => {
                    return Err(AttuneError::system(format!(
                        "Unknown canonical emotion label '{}'",
                        other
                    )))
                }
            },
            other => {
                return Err(AttuneError::system(format!(
                    "Unsupported emotion record version {}",
                    other
                )))
            }
        };

        let backend = match self.backend.as_deref() {
            Some("primary") => BackendKind::Primary,
            // Legacy records came out of the heuristic pipeline
            _ => BackendKind::Fallback,
        };

        Ok(EmotionSample::new(
            label,
            self.confidence,
            self.timestamp_ms,
            backend,
        ))
    }
}

fn persisted_backend(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Primary => "primary",
        BackendKind::Fallback => "fallback",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_snapshot() {
        let store = EmotionStore::new();
        assert!(store.current_sample().is_none());

        store.publish_sample(EmotionSample::new(
            EmotionLabel::Positive,
            0.8,
            100,
            BackendKind::Primary,
        ));
        let snapshot = store.current_sample().unwrap();
        assert_eq!(snapshot.label, EmotionLabel::Positive);

        // A later publish does not disturb the held snapshot.
        store.publish_sample(EmotionSample::new(
            EmotionLabel::Negative,
            0.6,
            200,
            BackendKind::Primary,
        ));
        assert_eq!(snapshot.label, EmotionLabel::Positive);
        assert_eq!(
            store.current_sample().unwrap().label,
            EmotionLabel::Negative
        );
    }

    #[test]
    fn test_clear_resets_everything() {
        let store = EmotionStore::new();
        store.publish_sample(EmotionSample::new(
            EmotionLabel::Neutral,
            0.5,
            1,
            BackendKind::Fallback,
        ));
        store.clear();
        assert!(store.current_sample().is_none());
        assert_eq!(*store.current_plan(), AdaptationPlan::default());
    }

    #[test]
    fn test_export_then_hydrate_round_trip() {
        let store = EmotionStore::new();
        store.publish_sample(EmotionSample::new(
            EmotionLabel::Negative,
            0.75,
            4242,
            BackendKind::Primary,
        ));

        let json = store.export().unwrap().unwrap();
        assert!(json.contains("\"version\":2"));

        let restored = EmotionStore::new();
        let sample = restored.hydrate(&json).unwrap();
        assert_eq!(sample.label, EmotionLabel::Negative);
        assert!((sample.confidence - 0.75).abs() < 1e-9);
        assert_eq!(sample.timestamp_ms, 4242);
        assert_eq!(sample.backend, BackendKind::Primary);
    }

    #[test]
    fn test_legacy_seven_label_records_collapse() {
        let store = EmotionStore::new();
        let json = r#"{"version":1,"label":"fearful","confidence":0.6,"timestamp_ms":10}"#;
        let sample = store.hydrate(json).unwrap();
        assert_eq!(sample.label, EmotionLabel::Negative);
        assert_eq!(sample.backend, BackendKind::Fallback);

        let json = r#"{"version":1,"label":"surprised","confidence":0.4,"timestamp_ms":11}"#;
        assert_eq!(
            store.hydrate(json).unwrap().label,
            EmotionLabel::Neutral
        );
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let store = EmotionStore::new();
        let json = r#"{"version":9,"label":"positive","confidence":0.5,"timestamp_ms":1}"#;
        assert!(store.hydrate(json).is_err());
    }
}
