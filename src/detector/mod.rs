use crate::error::DetectorError;
use crate::frame::VideoFrame;
use crate::signal::clamp01;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod assets;
pub mod classifier;
pub mod heuristic;
pub mod landmarks;
pub mod lifecycle;

pub use assets::{AssetFetcher, FsAssetFetcher, ModelBundle, ModelFormat, ModelManifest};
pub use classifier::{InferenceSession, ModelRuntime, PrimaryClassifier};
pub use heuristic::{ExpressionScores, FallbackDetector, FusionOutcome};
pub use landmarks::{
    FaceGeometry, FaceLandmarker, HandLandmarker, LandmarkEngine, LandmarkFamily,
    NormalizedLandmarkSet, PoseLandmarker,
};
pub use lifecycle::{DetectorState, LifecycleManager, TransitionRecord};

/// Canonical emotion vocabulary. Everything upstream (model labels, legacy
/// persisted values) collapses into these three before leaving the detector
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    Negative,
    Neutral,
    Positive,
}

impl EmotionLabel {
    /// Collapse a model or legacy label name into the canonical space.
    ///
    /// The older classifier vocabulary had seven discrete emotions; anything
    /// unrecognized lands on Neutral rather than failing, since a stale
    /// persisted value must never break detection.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "positive" | "happy" => EmotionLabel::Positive,
            "negative" | "sad" | "angry" | "fearful" | "disgusted" => EmotionLabel::Negative,
            _ => EmotionLabel::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Negative => "negative",
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Positive => "positive",
        }
    }
}

/// Which backend produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Primary,
    Fallback,
}

/// One detection cycle's output. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionSample {
    pub label: EmotionLabel,
    /// Always within [0,1]
    pub confidence: f64,
    /// Monotonic media timestamp of the frame that produced this sample
    pub timestamp_ms: u64,
    /// Backend that produced the sample
    pub backend: BackendKind,
    /// True when a proximity override decided the label. Surfaced to the UI
    /// for transparency; nothing branches on it.
    pub inferred_from_context: bool,
}

impl EmotionSample {
    pub fn new(label: EmotionLabel, confidence: f64, timestamp_ms: u64, backend: BackendKind) -> Self {
        Self {
            label,
            confidence: clamp01(confidence),
            timestamp_ms,
            backend,
            inferred_from_context: false,
        }
    }

    pub fn contextual(mut self) -> Self {
        self.inferred_from_context = true;
        self
    }
}

/// Output of a single proximity heuristic (e.g. "hand near cheek").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityInfo {
    /// The sub-detector behind this signal initialized successfully
    pub available: bool,
    /// The sub-detector saw its subject this frame
    pub detected: bool,
    /// Proximity in [0,1], higher means closer
    pub score: f64,
    /// Raw distance as a fraction of face width, when measured
    pub distance_ratio: Option<f64>,
}

impl ProximityInfo {
    /// The sub-detector never initialized.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            detected: false,
            score: 0.0,
            distance_ratio: None,
        }
    }

    /// The sub-detector ran but saw nothing this frame.
    pub fn absent() -> Self {
        Self {
            available: true,
            detected: false,
            score: 0.0,
            distance_ratio: None,
        }
    }

    pub fn measured(score: f64, distance_ratio: f64) -> Self {
        Self {
            available: true,
            detected: true,
            score: clamp01(score),
            distance_ratio: Some(distance_ratio),
        }
    }
}

/// The contract both backends implement.
///
/// `Ok(None)` means "nothing detected this cycle" and is not an error; the
/// sampling loop just reschedules. `Err` is a runtime failure the lifecycle
/// manager reacts to.
#[async_trait]
pub trait EmotionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn detect(&self, frame: &VideoFrame) -> Result<Option<EmotionSample>, DetectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_vocabulary_collapses_to_three() {
        assert_eq!(EmotionLabel::from_name("happy"), EmotionLabel::Positive);
        assert_eq!(EmotionLabel::from_name("sad"), EmotionLabel::Negative);
        assert_eq!(EmotionLabel::from_name("Angry"), EmotionLabel::Negative);
        assert_eq!(EmotionLabel::from_name("fearful"), EmotionLabel::Negative);
        assert_eq!(EmotionLabel::from_name("disgusted"), EmotionLabel::Negative);
        assert_eq!(EmotionLabel::from_name("surprised"), EmotionLabel::Neutral);
        assert_eq!(EmotionLabel::from_name("neutral"), EmotionLabel::Neutral);
        assert_eq!(EmotionLabel::from_name("NEGATIVE"), EmotionLabel::Negative);
        assert_eq!(EmotionLabel::from_name("unknown-junk"), EmotionLabel::Neutral);
    }

    #[test]
    fn test_sample_confidence_is_clamped() {
        let high = EmotionSample::new(EmotionLabel::Positive, 1.7, 1, BackendKind::Primary);
        assert_eq!(high.confidence, 1.0);

        let low = EmotionSample::new(EmotionLabel::Negative, -0.2, 2, BackendKind::Fallback);
        assert_eq!(low.confidence, 0.0);
    }

    #[test]
    fn test_contextual_flag() {
        let sample = EmotionSample::new(EmotionLabel::Negative, 0.5, 3, BackendKind::Fallback);
        assert!(!sample.inferred_from_context);
        assert!(sample.contextual().inferred_from_context);
    }

    #[test]
    fn test_proximity_constructors() {
        assert!(!ProximityInfo::unavailable().available);
        let absent = ProximityInfo::absent();
        assert!(absent.available && !absent.detected);
        let measured = ProximityInfo::measured(1.3, 0.1);
        assert_eq!(measured.score, 1.0);
        assert_eq!(measured.distance_ratio, Some(0.1));
    }
}
