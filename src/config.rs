use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AttuneConfig {
    pub detector: DetectorConfig,
    pub model: ModelConfig,
    pub landmarks: LandmarksConfig,
    pub sampling: SamplingConfig,
    pub fusion: FusionConfig,
    pub adaptation: AdaptationConfig,
    pub stabilizer: StabilizerConfig,
    pub telemetry: TelemetryConfig,
    pub system: SystemConfig,
}

/// Which backend the lifecycle manager tries first.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    Primary,
    Fallback,
}

/// Pixel value range the primary model was trained with. Never guessed at
/// runtime; the wrong convention silently ruins every prediction.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PixelNormalization {
    /// Scale bytes into [0,1]
    ZeroToOne,
    /// Scale bytes into [-1,1]
    NegOneToOne,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    /// Backend tried on first activation
    #[serde(default = "default_preferred_backend")]
    pub preferred_backend: BackendPreference,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    /// Model description file for the primary classifier
    #[serde(default = "default_model_manifest")]
    pub manifest_location: String,

    /// Sidecar ordered label list
    #[serde(default = "default_model_labels")]
    pub labels_location: String,

    /// Pixel normalization convention the model was trained with
    #[serde(default = "default_normalization")]
    pub normalization: PixelNormalization,

    /// Input size used when the session does not declare its dimensions
    #[serde(default = "default_input_size")]
    pub default_input_size: (u32, u32),
}

/// Asset locations for one landmark sub-detector.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EndpointConfig {
    /// Operator override for the runtime bundle; takes precedence over the
    /// candidate list when set
    pub runtime_override: Option<String>,

    /// Operator override for the model asset
    pub model_override: Option<String>,

    /// Default runtime locations, tried in order
    #[serde(default)]
    pub runtime_candidates: Vec<String>,

    /// Default model locations, tried in order
    #[serde(default)]
    pub model_candidates: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LandmarksConfig {
    #[serde(default = "default_face_endpoints")]
    pub face: EndpointConfig,

    #[serde(default = "default_hand_endpoints")]
    pub hand: EndpointConfig,

    #[serde(default = "default_pose_endpoints")]
    pub pose: EndpointConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SamplingConfig {
    /// Delay between detection cycles in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub interval_ms: u64,

    /// Retry delay when the current frame is not yet decodable
    #[serde(default = "default_not_ready_poll_ms")]
    pub not_ready_poll_ms: u64,

    /// Upper bound on one backend inference call
    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FusionConfig {
    /// Below this, the fused result is Neutral at that confidence
    #[serde(default = "default_neutral_floor")]
    pub neutral_floor: f64,

    /// Positive at or above this confidence resists the contextual override
    #[serde(default = "default_strong_positive_floor")]
    pub strong_positive_floor: f64,

    /// Weight of the brow-tension-dominant combination
    #[serde(default = "default_brow_tension_weight")]
    pub brow_tension_weight: f64,

    /// Hand-to-cheek distance (fraction of face width) where proximity
    /// starts registering
    #[serde(default = "default_cheek_distance_start")]
    pub cheek_distance_start: f64,

    /// Hand-to-cheek distance at which proximity saturates to 1.0
    #[serde(default = "default_cheek_distance_full")]
    pub cheek_distance_full: f64,

    /// Proximity score that triggers the contextual override
    #[serde(default = "default_cheek_score_threshold")]
    pub cheek_score_threshold: f64,

    /// Looser band for the wrist/elbow substitute signal
    #[serde(default = "default_pose_distance_start")]
    pub pose_distance_start: f64,

    #[serde(default = "default_pose_distance_full")]
    pub pose_distance_full: f64,

    #[serde(default = "default_pose_score_threshold")]
    pub pose_score_threshold: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AdaptationConfig {
    /// Negative confidence at or above this means the learner is struggling
    #[serde(default = "default_struggling_threshold")]
    pub struggling_threshold: f64,

    /// Positive confidence at or above this means the learner is engaged
    #[serde(default = "default_engaged_threshold")]
    pub engaged_threshold: f64,

    /// Negative confidence at or above this (but below struggling) shows
    /// encouragement only
    #[serde(default = "default_encouragement_floor")]
    pub encouragement_floor: f64,

    /// Performance score below this corroborates "struggling"
    #[serde(default = "default_low_performance_floor")]
    pub low_performance_floor: f64,

    /// How much a low performance score relaxes the struggling threshold
    #[serde(default = "default_performance_assist_margin")]
    pub performance_assist_margin: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StabilizerConfig {
    /// Recommendation must persist this long before a mode turns on
    #[serde(default = "default_activation_delay_ms")]
    pub activation_delay_ms: u64,

    /// Once on, a mode is held at least this long
    #[serde(default = "default_min_hold_ms")]
    pub min_hold_ms: u64,

    /// Extra delay appended after the hold expires
    #[serde(default = "default_deactivation_delay_ms")]
    pub deactivation_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelemetryConfig {
    /// Master switch for emotion telemetry
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    /// Minimum spacing between emissions per surface
    #[serde(default = "default_telemetry_interval_ms")]
    pub min_interval_ms: u64,

    /// Confidence floor for samples produced by the primary classifier
    #[serde(default = "default_primary_floor")]
    pub primary_confidence_floor: f64,

    /// Confidence floor for samples produced by the fallback heuristic;
    /// lower on purpose, the heuristic is a lower-precision signal
    #[serde(default = "default_fallback_floor")]
    pub fallback_confidence_floor: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// How many lifecycle transitions to keep for diagnostics
    #[serde(default = "default_transition_history")]
    pub transition_history: usize,
}

impl AttuneConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("attune.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default(
                "detector.preferred_backend",
                match default_preferred_backend() {
                    BackendPreference::Primary => "primary",
                    BackendPreference::Fallback => "fallback",
                },
            )?
            .set_default("model.manifest_location", default_model_manifest())?
            .set_default("model.labels_location", default_model_labels())?
            .set_default(
                "model.normalization",
                match default_normalization() {
                    PixelNormalization::ZeroToOne => "zero-to-one",
                    PixelNormalization::NegOneToOne => "neg-one-to-one",
                },
            )?
            .set_default(
                "model.default_input_size",
                vec![default_input_size().0 as i64, default_input_size().1 as i64],
            )?
            .set_default(
                "landmarks.face.runtime_candidates",
                default_face_endpoints().runtime_candidates,
            )?
            .set_default(
                "landmarks.face.model_candidates",
                default_face_endpoints().model_candidates,
            )?
            .set_default(
                "landmarks.hand.runtime_candidates",
                default_hand_endpoints().runtime_candidates,
            )?
            .set_default(
                "landmarks.hand.model_candidates",
                default_hand_endpoints().model_candidates,
            )?
            .set_default(
                "landmarks.pose.runtime_candidates",
                default_pose_endpoints().runtime_candidates,
            )?
            .set_default(
                "landmarks.pose.model_candidates",
                default_pose_endpoints().model_candidates,
            )?
            .set_default("sampling.interval_ms", default_sample_interval_ms() as i64)?
            .set_default(
                "sampling.not_ready_poll_ms",
                default_not_ready_poll_ms() as i64,
            )?
            .set_default(
                "sampling.inference_timeout_ms",
                default_inference_timeout_ms() as i64,
            )?
            .set_default("fusion.neutral_floor", default_neutral_floor())?
            .set_default(
                "fusion.strong_positive_floor",
                default_strong_positive_floor(),
            )?
            .set_default("fusion.brow_tension_weight", default_brow_tension_weight())?
            .set_default(
                "fusion.cheek_distance_start",
                default_cheek_distance_start(),
            )?
            .set_default("fusion.cheek_distance_full", default_cheek_distance_full())?
            .set_default(
                "fusion.cheek_score_threshold",
                default_cheek_score_threshold(),
            )?
            .set_default("fusion.pose_distance_start", default_pose_distance_start())?
            .set_default("fusion.pose_distance_full", default_pose_distance_full())?
            .set_default(
                "fusion.pose_score_threshold",
                default_pose_score_threshold(),
            )?
            .set_default(
                "adaptation.struggling_threshold",
                default_struggling_threshold(),
            )?
            .set_default("adaptation.engaged_threshold", default_engaged_threshold())?
            .set_default(
                "adaptation.encouragement_floor",
                default_encouragement_floor(),
            )?
            .set_default(
                "adaptation.low_performance_floor",
                default_low_performance_floor(),
            )?
            .set_default(
                "adaptation.performance_assist_margin",
                default_performance_assist_margin(),
            )?
            .set_default(
                "stabilizer.activation_delay_ms",
                default_activation_delay_ms() as i64,
            )?
            .set_default("stabilizer.min_hold_ms", default_min_hold_ms() as i64)?
            .set_default(
                "stabilizer.deactivation_delay_ms",
                default_deactivation_delay_ms() as i64,
            )?
            .set_default("telemetry.enabled", default_telemetry_enabled())?
            .set_default(
                "telemetry.min_interval_ms",
                default_telemetry_interval_ms() as i64,
            )?
            .set_default(
                "telemetry.primary_confidence_floor",
                default_primary_floor(),
            )?
            .set_default(
                "telemetry.fallback_confidence_floor",
                default_fallback_floor(),
            )?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "system.transition_history",
                default_transition_history() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with ATTUNE_ prefix
            .add_source(Environment::with_prefix("ATTUNE").separator("_"))
            .build()?;

        let config: AttuneConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.interval_ms == 0 {
            return Err(ConfigError::Message(
                "Sampling interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.sampling.inference_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Sampling inference_timeout_ms must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("fusion.neutral_floor", self.fusion.neutral_floor),
            (
                "fusion.strong_positive_floor",
                self.fusion.strong_positive_floor,
            ),
            (
                "fusion.cheek_score_threshold",
                self.fusion.cheek_score_threshold,
            ),
            (
                "fusion.pose_score_threshold",
                self.fusion.pose_score_threshold,
            ),
            (
                "adaptation.struggling_threshold",
                self.adaptation.struggling_threshold,
            ),
            (
                "adaptation.engaged_threshold",
                self.adaptation.engaged_threshold,
            ),
            (
                "telemetry.primary_confidence_floor",
                self.telemetry.primary_confidence_floor,
            ),
            (
                "telemetry.fallback_confidence_floor",
                self.telemetry.fallback_confidence_floor,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Message(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.fusion.cheek_distance_full >= self.fusion.cheek_distance_start {
            return Err(ConfigError::Message(
                "fusion.cheek_distance_full must be smaller than cheek_distance_start".to_string(),
            ));
        }

        if self.fusion.pose_distance_full >= self.fusion.pose_distance_start {
            return Err(ConfigError::Message(
                "fusion.pose_distance_full must be smaller than pose_distance_start".to_string(),
            ));
        }

        if self.stabilizer.activation_delay_ms == 0 {
            return Err(ConfigError::Message(
                "Stabilizer activation_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.landmarks.face.runtime_override.is_none()
            && self.landmarks.face.runtime_candidates.is_empty()
        {
            return Err(ConfigError::Message(
                "landmarks.face needs a runtime override or at least one candidate".to_string(),
            ));
        }

        if self.landmarks.face.model_override.is_none()
            && self.landmarks.face.model_candidates.is_empty()
        {
            return Err(ConfigError::Message(
                "landmarks.face needs a model override or at least one candidate".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl EndpointConfig {
    /// Runtime locations in resolution order: override wins outright.
    pub fn runtime_locations(&self) -> Vec<String> {
        match &self.runtime_override {
            Some(runtime) => vec![runtime.clone()],
            None => self.runtime_candidates.clone(),
        }
    }

    /// Model locations in resolution order: override wins outright.
    pub fn model_locations(&self) -> Vec<String> {
        match &self.model_override {
            Some(model) => vec![model.clone()],
            None => self.model_candidates.clone(),
        }
    }
}

impl Default for AttuneConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig {
                preferred_backend: default_preferred_backend(),
            },
            model: ModelConfig {
                manifest_location: default_model_manifest(),
                labels_location: default_model_labels(),
                normalization: default_normalization(),
                default_input_size: default_input_size(),
            },
            landmarks: LandmarksConfig {
                face: default_face_endpoints(),
                hand: default_hand_endpoints(),
                pose: default_pose_endpoints(),
            },
            sampling: SamplingConfig {
                interval_ms: default_sample_interval_ms(),
                not_ready_poll_ms: default_not_ready_poll_ms(),
                inference_timeout_ms: default_inference_timeout_ms(),
            },
            fusion: FusionConfig {
                neutral_floor: default_neutral_floor(),
                strong_positive_floor: default_strong_positive_floor(),
                brow_tension_weight: default_brow_tension_weight(),
                cheek_distance_start: default_cheek_distance_start(),
                cheek_distance_full: default_cheek_distance_full(),
                cheek_score_threshold: default_cheek_score_threshold(),
                pose_distance_start: default_pose_distance_start(),
                pose_distance_full: default_pose_distance_full(),
                pose_score_threshold: default_pose_score_threshold(),
            },
            adaptation: AdaptationConfig {
                struggling_threshold: default_struggling_threshold(),
                engaged_threshold: default_engaged_threshold(),
                encouragement_floor: default_encouragement_floor(),
                low_performance_floor: default_low_performance_floor(),
                performance_assist_margin: default_performance_assist_margin(),
            },
            stabilizer: StabilizerConfig {
                activation_delay_ms: default_activation_delay_ms(),
                min_hold_ms: default_min_hold_ms(),
                deactivation_delay_ms: default_deactivation_delay_ms(),
            },
            telemetry: TelemetryConfig {
                enabled: default_telemetry_enabled(),
                min_interval_ms: default_telemetry_interval_ms(),
                primary_confidence_floor: default_primary_floor(),
                fallback_confidence_floor: default_fallback_floor(),
            },
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                transition_history: default_transition_history(),
            },
        }
    }
}

// Default value functions
fn default_preferred_backend() -> BackendPreference {
    BackendPreference::Primary
}

fn default_model_manifest() -> String {
    "./models/emotion/model.json".to_string()
}
fn default_model_labels() -> String {
    "./models/emotion/labels.json".to_string()
}
fn default_normalization() -> PixelNormalization {
    PixelNormalization::ZeroToOne
}
fn default_input_size() -> (u32, u32) {
    (224, 224)
}

fn default_face_endpoints() -> EndpointConfig {
    EndpointConfig {
        runtime_override: None,
        model_override: None,
        runtime_candidates: vec![
            "./assets/landmarker/runtime".to_string(),
            "/usr/share/attune/landmarker/runtime".to_string(),
        ],
        model_candidates: vec![
            "./assets/landmarker/face_landmarker.task".to_string(),
            "/usr/share/attune/landmarker/face_landmarker.task".to_string(),
        ],
    }
}
fn default_hand_endpoints() -> EndpointConfig {
    EndpointConfig {
        runtime_override: None,
        model_override: None,
        runtime_candidates: vec![
            "./assets/landmarker/runtime".to_string(),
            "/usr/share/attune/landmarker/runtime".to_string(),
        ],
        model_candidates: vec![
            "./assets/landmarker/hand_landmarker.task".to_string(),
            "/usr/share/attune/landmarker/hand_landmarker.task".to_string(),
        ],
    }
}
fn default_pose_endpoints() -> EndpointConfig {
    EndpointConfig {
        runtime_override: None,
        model_override: None,
        runtime_candidates: vec![
            "./assets/landmarker/runtime".to_string(),
            "/usr/share/attune/landmarker/runtime".to_string(),
        ],
        model_candidates: vec![
            "./assets/landmarker/pose_landmarker.task".to_string(),
            "/usr/share/attune/landmarker/pose_landmarker.task".to_string(),
        ],
    }
}

fn default_sample_interval_ms() -> u64 {
    1000
}
fn default_not_ready_poll_ms() -> u64 {
    25
}
fn default_inference_timeout_ms() -> u64 {
    2000
}

fn default_neutral_floor() -> f64 {
    0.35
}
fn default_strong_positive_floor() -> f64 {
    0.7
}
fn default_brow_tension_weight() -> f64 {
    0.9
}
fn default_cheek_distance_start() -> f64 {
    0.42
}
fn default_cheek_distance_full() -> f64 {
    0.15
}
fn default_cheek_score_threshold() -> f64 {
    0.5
}
fn default_pose_distance_start() -> f64 {
    0.60
}
fn default_pose_distance_full() -> f64 {
    0.25
}
fn default_pose_score_threshold() -> f64 {
    0.6
}

fn default_struggling_threshold() -> f64 {
    0.6
}
fn default_engaged_threshold() -> f64 {
    0.6
}
fn default_encouragement_floor() -> f64 {
    0.4
}
fn default_low_performance_floor() -> f64 {
    0.4
}
fn default_performance_assist_margin() -> f64 {
    0.1
}

fn default_activation_delay_ms() -> u64 {
    4000
}
fn default_min_hold_ms() -> u64 {
    60_000
}
fn default_deactivation_delay_ms() -> u64 {
    6000
}

fn default_telemetry_enabled() -> bool {
    true
}
fn default_telemetry_interval_ms() -> u64 {
    5000
}
fn default_primary_floor() -> f64 {
    0.35
}
fn default_fallback_floor() -> f64 {
    0.20
}

fn default_event_bus_capacity() -> usize {
    100
}
fn default_transition_history() -> usize {
    32
}
