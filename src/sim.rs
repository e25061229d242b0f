//! Scripted stand-ins for the camera, the inference runtimes, and the
//! telemetry collector.
//!
//! The demo binary runs the full pipeline against these, and integration
//! tests use them to drive scenarios a live webcam cannot reproduce on
//! demand. Every stand-in reads the same [`Scenario`] script, so the
//! classifier, the landmark stubs, and the frame source agree about what
//! is in front of the camera at any frame.

use crate::config::AttuneConfig;
use crate::detector::assets::{AssetFetcher, ModelBundle};
use crate::detector::classifier::{InferenceSession, ModelRuntime};
use crate::detector::landmarks::{
    FaceGeometry, FaceLandmarker, HandLandmarker, LandmarkEngine, NormalizedLandmarkSet,
    PoseLandmarker,
};
use crate::error::{AssetError, AttuneError, DetectorError, Result};
use crate::frame::{FrameSource, VideoFrame};
use crate::signal::NormPoint;
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One scripted beat of a demo session. The frame source, the landmark
/// stubs, and the classifier stub all read the same script, so every layer
/// of the pipeline sees a consistent scene for a given frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPhase {
    /// Camera running but not yet decodable (zero-dimension frame)
    NotReady,
    Neutral,
    Smile,
    Frown,
    /// Neutral face with one hand resting on the cheek
    HandOnCheek,
    /// A hand is visible but nowhere near the face
    FarHand,
    /// No face in frame
    FaceLost,
    /// The shared landmark runtime reports a timestamp regression
    Desync,
}

/// A named sequence of phases, one per frame id. Ids past the end hold the
/// final phase, so short scripts describe long sessions.
#[derive(Debug, Clone)]
pub struct Scenario {
    name: String,
    phases: Vec<SimPhase>,
}

impl Scenario {
    pub fn new<S: Into<String>>(name: S, phases: Vec<SimPhase>) -> Self {
        Self {
            name: name.into(),
            phases,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase_for(&self, frame_id: u64) -> SimPhase {
        match self.phases.get(frame_id as usize) {
            Some(phase) => *phase,
            None => *self.phases.last().unwrap_or(&SimPhase::Neutral),
        }
    }

    /// True when the script only makes sense on the heuristic tier: context
    /// phases and desyncs are invisible to the pixel classifier.
    pub fn needs_fallback(&self) -> bool {
        self.phases.iter().any(|p| {
            matches!(
                p,
                SimPhase::HandOnCheek | SimPhase::FarHand | SimPhase::FaceLost | SimPhase::Desync
            )
        })
    }

    /// Look up one of the built-in demo scripts by CLI name.
    pub fn named(name: &str) -> Option<Scenario> {
        use SimPhase::*;
        let phases = match name {
            "calm" => vec![
                NotReady, NotReady, Neutral, Neutral, Smile, Smile, Smile, Smile, Neutral,
            ],
            "frustrated" => vec![Neutral, Neutral, Frown, Frown, Frown, Frown, Frown, Frown],
            "hand-on-cheek" => vec![
                Neutral, Neutral, FarHand, HandOnCheek, HandOnCheek, HandOnCheek, Neutral,
            ],
            "flaky" => vec![Neutral, Neutral, Desync, Neutral, Frown, Frown, Frown],
            "face-lost" => vec![Neutral, FaceLost, FaceLost, FaceLost, Neutral, Neutral],
            _ => return None,
        };
        Some(Scenario::new(name, phases))
    }

    pub fn known_names() -> &'static [&'static str] {
        &["calm", "frustrated", "hand-on-cheek", "flaky", "face-lost"]
    }
}

const FRAME_WIDTH: u32 = 16;
const FRAME_HEIGHT: u32 = 16;
const FRAME_INTERVAL_MS: u64 = 33;

/// Camera stand-in: produces one solid-gray frame per grab, advancing
/// through the scenario. NotReady phases yield zero-dimension frames the
/// sampling loop must skip without counting.
pub struct SimFrameSource {
    scenario: Arc<Scenario>,
    next_id: AtomicU64,
}

impl SimFrameSource {
    pub fn new(scenario: Arc<Scenario>) -> Self {
        Self {
            scenario,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn frames_produced(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for SimFrameSource {
    async fn grab(&self) -> Option<VideoFrame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timestamp_ms = id * FRAME_INTERVAL_MS;
        let frame = match self.scenario.phase_for(id) {
            SimPhase::NotReady => VideoFrame::new(id, timestamp_ms, Vec::new(), 0, 0),
            _ => VideoFrame::new(
                id,
                timestamp_ms,
                vec![128; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize],
                FRAME_WIDTH,
                FRAME_HEIGHT,
            ),
        };
        Some(frame)
    }
}

pub const SIM_MODEL_MANIFEST: &str = "mem://model/model.json";
pub const SIM_MODEL_LABELS: &str = "mem://model/labels.json";

/// In-memory asset store preloaded with a complete model bundle and one
/// runtime/model pair per landmark sub-detector.
pub struct SimAssetFetcher {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl SimAssetFetcher {
    pub fn new() -> Self {
        let mut files = HashMap::new();
        files.insert(
            SIM_MODEL_MANIFEST.to_string(),
            br#"{
                "format": "graph-model",
                "generatedBy": "sim",
                "modelTopology": {},
                "weightsManifest": [{"paths": ["weights.bin"]}]
            }"#
            .to_vec(),
        );
        files.insert(
            "mem://model/weights.bin".to_string(),
            vec![0u8; 64],
        );
        files.insert(
            SIM_MODEL_LABELS.to_string(),
            br#"["angry", "neutral", "happy"]"#.to_vec(),
        );
        for sub in ["face", "hand", "pose"] {
            files.insert(format!("mem://landmarks/{}/runtime.bin", sub), vec![1u8; 16]);
            files.insert(format!("mem://landmarks/{}/model.task", sub), vec![2u8; 16]);
        }
        Self {
            files: Mutex::new(files),
        }
    }

    /// Add or replace one asset; tests use this to break specific loads.
    pub fn insert<S: Into<String>>(&self, location: S, bytes: Vec<u8>) {
        self.files.lock().insert(location.into(), bytes);
    }

    pub fn remove(&self, location: &str) {
        self.files.lock().remove(location);
    }
}

impl Default for SimAssetFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetFetcher for SimAssetFetcher {
    async fn fetch(&self, location: &str) -> std::result::Result<Vec<u8>, AssetError> {
        self.files
            .lock()
            .get(location)
            .cloned()
            .ok_or_else(|| AssetError::Fetch {
                location: location.to_string(),
                details: "not in the scripted asset set".to_string(),
            })
    }
}

/// Point every asset location in the config at the scripted store.
pub fn scripted_locations(config: &mut AttuneConfig) {
    config.model.manifest_location = SIM_MODEL_MANIFEST.to_string();
    config.model.labels_location = SIM_MODEL_LABELS.to_string();
    for (endpoint, sub) in [
        (&mut config.landmarks.face, "face"),
        (&mut config.landmarks.hand, "hand"),
        (&mut config.landmarks.pose, "pose"),
    ] {
        endpoint.runtime_override = Some(format!("mem://landmarks/{}/runtime.bin", sub));
        endpoint.model_override = Some(format!("mem://landmarks/{}/model.task", sub));
    }
}

/// Scripted classifier session. Scores are indexed by call count rather
/// than frame id (the session never sees frames), so not-ready frames that
/// never reach inference shift the script by a beat; the demos do not care.
pub struct SimSession {
    scenario: Arc<Scenario>,
    calls: AtomicU64,
    fail_on_call: Option<u64>,
}

/// Scores are in sim label order: [angry, neutral, happy].
fn phase_scores(phase: SimPhase) -> Vec<f32> {
    match phase {
        SimPhase::Smile => vec![0.05, 0.15, 0.80],
        SimPhase::Frown => vec![0.75, 0.20, 0.05],
        _ => vec![0.10, 0.80, 0.10],
    }
}

#[async_trait]
impl InferenceSession for SimSession {
    fn input_size(&self) -> Option<(u32, u32)> {
        Some((8, 8))
    }

    async fn run(&self, input: &[f32]) -> std::result::Result<Vec<f32>, DetectorError> {
        debug_assert_eq!(input.len(), 8 * 8 * 3);
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_on_call == Some(call) {
            return Err(DetectorError::inference(
                "sim-session",
                "scripted inference failure",
            ));
        }
        Ok(phase_scores(self.scenario.phase_for(call)))
    }
}

/// Scripted model runtime. Can be told to refuse loading (forcing the
/// lifecycle onto the fallback tier) or to fail a specific inference call
/// (demonstrating mid-run demotion).
pub struct SimModelRuntime {
    scenario: Arc<Scenario>,
    fail_load: bool,
    fail_on_call: Option<u64>,
    loads: AtomicU64,
}

impl SimModelRuntime {
    pub fn new(scenario: Arc<Scenario>) -> Self {
        Self {
            scenario,
            fail_load: false,
            fail_on_call: None,
            loads: AtomicU64::new(0),
        }
    }

    pub fn failing_load(scenario: Arc<Scenario>) -> Self {
        Self {
            fail_load: true,
            ..Self::new(scenario)
        }
    }

    pub fn with_session_failure(mut self, call: u64) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    fn build_session(
        &self,
        bundle: &ModelBundle,
    ) -> std::result::Result<Box<dyn InferenceSession>, DetectorError> {
        if self.fail_load {
            return Err(DetectorError::Load(AssetError::Fetch {
                location: bundle.manifest_location.clone(),
                details: "scripted runtime refusal".to_string(),
            }));
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!("Sim session built from {}", bundle.manifest_location);
        Ok(Box::new(SimSession {
            scenario: Arc::clone(&self.scenario),
            calls: AtomicU64::new(0),
            fail_on_call: self.fail_on_call,
        }))
    }
}

#[async_trait]
impl ModelRuntime for SimModelRuntime {
    // Both formats script identically; the split only matters to real runtimes.
    async fn load_graph(
        &self,
        bundle: &ModelBundle,
    ) -> std::result::Result<Box<dyn InferenceSession>, DetectorError> {
        self.build_session(bundle)
    }

    async fn load_layers(
        &self,
        bundle: &ModelBundle,
    ) -> std::result::Result<Box<dyn InferenceSession>, DetectorError> {
        self.build_session(bundle)
    }
}

// FaceMesh indices the heuristics read: jaw endpoints for face width,
// cheek centers for the proximity target.
const OVAL_LEFT: usize = 234;
const OVAL_RIGHT: usize = 454;
const CHEEK_LEFT: usize = 205;
const CHEEK_RIGHT: usize = 425;
const FACE_MESH_POINTS: usize = 478;
const HAND_POINTS: usize = 21;
const POSE_POINTS: usize = 33;

fn sim_face_landmarks() -> NormalizedLandmarkSet {
    let mut points = vec![NormPoint::new(0.5, 0.5); FACE_MESH_POINTS];
    points[OVAL_LEFT] = NormPoint::new(0.30, 0.50);
    points[OVAL_RIGHT] = NormPoint::new(0.70, 0.50);
    points[CHEEK_LEFT] = NormPoint::new(0.36, 0.56);
    points[CHEEK_RIGHT] = NormPoint::new(0.64, 0.56);
    NormalizedLandmarkSet::new(points)
}

fn sim_blendshapes(phase: SimPhase) -> HashMap<String, f64> {
    let mut shapes = HashMap::new();
    let mut set = |name: &str, value: f64| {
        shapes.insert(name.to_string(), value);
    };
    match phase {
        SimPhase::Smile => {
            set("mouthSmileLeft", 0.85);
            set("mouthSmileRight", 0.75);
            set("browDownLeft", 0.05);
            set("browDownRight", 0.05);
        }
        SimPhase::Frown => {
            set("mouthFrownLeft", 0.70);
            set("mouthFrownRight", 0.70);
            set("browDownLeft", 0.80);
            set("browDownRight", 0.80);
            set("browInnerUp", 0.50);
        }
        _ => {
            set("mouthSmileLeft", 0.05);
            set("mouthSmileRight", 0.05);
            set("mouthFrownLeft", 0.10);
            set("mouthFrownRight", 0.10);
            set("browDownLeft", 0.15);
            set("browDownRight", 0.15);
        }
    }
    shapes
}

pub struct SimFaceLandmarker {
    scenario: Arc<Scenario>,
}

#[async_trait]
impl FaceLandmarker for SimFaceLandmarker {
    async fn detect(
        &self,
        frame: &VideoFrame,
        _timestamp_ms: u64,
    ) -> std::result::Result<Option<FaceGeometry>, DetectorError> {
        match self.scenario.phase_for(frame.id) {
            SimPhase::FaceLost | SimPhase::NotReady => Ok(None),
            SimPhase::Desync => Err(DetectorError::desync(
                "sim-face",
                "scripted timestamp regression",
            )),
            phase => Ok(Some(FaceGeometry {
                landmarks: sim_face_landmarks(),
                blendshapes: Some(sim_blendshapes(phase)),
            })),
        }
    }
}

pub struct SimHandLandmarker {
    scenario: Arc<Scenario>,
}

#[async_trait]
impl HandLandmarker for SimHandLandmarker {
    async fn detect(
        &self,
        frame: &VideoFrame,
        _timestamp_ms: u64,
    ) -> std::result::Result<Vec<NormalizedLandmarkSet>, DetectorError> {
        let hand_at = |x: f64, y: f64| {
            vec![NormalizedLandmarkSet::new(vec![
                NormPoint::new(x, y);
                HAND_POINTS
            ])]
        };
        match self.scenario.phase_for(frame.id) {
            SimPhase::HandOnCheek => Ok(hand_at(0.36, 0.57)),
            SimPhase::FarHand => Ok(hand_at(0.92, 0.92)),
            _ => Ok(Vec::new()),
        }
    }
}

pub struct SimPoseLandmarker {
    scenario: Arc<Scenario>,
}

#[async_trait]
impl PoseLandmarker for SimPoseLandmarker {
    async fn detect(
        &self,
        frame: &VideoFrame,
        _timestamp_ms: u64,
    ) -> std::result::Result<Option<NormalizedLandmarkSet>, DetectorError> {
        match self.scenario.phase_for(frame.id) {
            // The pose sees the same resting arm; hands being present means
            // this never decides anything during HandOnCheek.
            SimPhase::HandOnCheek => {
                let mut points = vec![NormPoint::new(0.5, 0.9); POSE_POINTS];
                points[15] = NormPoint::new(0.37, 0.58);
                Ok(Some(NormalizedLandmarkSet::new(points)))
            }
            _ => Ok(None),
        }
    }
}

/// Builds scripted sub-detectors. Runtime and model bytes are accepted and
/// discarded so the full asset-resolution path still runs.
pub struct SimLandmarkEngine {
    scenario: Arc<Scenario>,
    provide_hands: bool,
    provide_pose: bool,
}

impl SimLandmarkEngine {
    pub fn new(scenario: Arc<Scenario>) -> Self {
        Self {
            scenario,
            provide_hands: true,
            provide_pose: true,
        }
    }

    pub fn without_hands(mut self) -> Self {
        self.provide_hands = false;
        self
    }

    pub fn without_pose(mut self) -> Self {
        self.provide_pose = false;
        self
    }
}

#[async_trait]
impl LandmarkEngine for SimLandmarkEngine {
    async fn create_face(
        &self,
        _runtime: &[u8],
        _model: &[u8],
    ) -> std::result::Result<Box<dyn FaceLandmarker>, DetectorError> {
        Ok(Box::new(SimFaceLandmarker {
            scenario: Arc::clone(&self.scenario),
        }))
    }

    async fn create_hand(
        &self,
        _runtime: &[u8],
        _model: &[u8],
    ) -> std::result::Result<Box<dyn HandLandmarker>, DetectorError> {
        if !self.provide_hands {
            return Err(DetectorError::inference(
                "sim-hand",
                "hand tracking not scripted",
            ));
        }
        Ok(Box::new(SimHandLandmarker {
            scenario: Arc::clone(&self.scenario),
        }))
    }

    async fn create_pose(
        &self,
        _runtime: &[u8],
        _model: &[u8],
    ) -> std::result::Result<Box<dyn PoseLandmarker>, DetectorError> {
        if !self.provide_pose {
            return Err(DetectorError::inference(
                "sim-pose",
                "pose tracking not scripted",
            ));
        }
        Ok(Box::new(SimPoseLandmarker {
            scenario: Arc::clone(&self.scenario),
        }))
    }
}

/// Records every emission instead of talking to a collector.
pub struct SimTelemetrySink {
    records: Mutex<Vec<TelemetryRecord>>,
    fail: bool,
}

impl SimTelemetrySink {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for SimTelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for SimTelemetrySink {
    async fn log_emotion(&self, record: TelemetryRecord) -> Result<()> {
        if self.fail {
            return Err(AttuneError::system("scripted telemetry failure"));
        }
        self.records.lock().push(record);
        Ok(())
    }
}
