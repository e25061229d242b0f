pub mod config;
pub mod error;
pub mod events;
pub mod signal;
pub mod frame;
pub mod clock;
pub mod detector;
pub mod state;
pub mod adaptation;
pub mod stabilizer;
pub mod telemetry;
pub mod sampling;
pub mod engine;
pub mod sim;

pub use config::{AttuneConfig, BackendPreference, PixelNormalization};
pub use error::{AssetError, AttuneError, DetectorError, Result};
pub use events::{AttuneEvent, EventBus, EventFilter, EventReceiver};
pub use frame::{FrameBuffer, FrameSource, VideoFrame};
pub use clock::MonotonicClock;
pub use signal::NormPoint;
pub use detector::{
    AssetFetcher, BackendKind, DetectorState, EmotionBackend, EmotionLabel, EmotionSample,
    ExpressionScores, FaceGeometry, FaceLandmarker, FallbackDetector, FsAssetFetcher,
    FusionOutcome, HandLandmarker, InferenceSession, LandmarkEngine, LandmarkFamily,
    LifecycleManager, ModelBundle, ModelFormat, ModelManifest, ModelRuntime,
    NormalizedLandmarkSet, PoseLandmarker, PrimaryClassifier, ProximityInfo, TransitionRecord,
};
pub use state::EmotionStore;
pub use adaptation::{adapt, AdaptationPlan, Theme};
pub use stabilizer::{Stabilizer, StabilizerSnapshot};
pub use telemetry::{TelemetryRecord, TelemetrySink, TelemetryStats, TelemetryThrottle};
pub use sampling::{CycleStats, SamplingLoop};
pub use engine::{AttuneEngine, EngineBuilder, EngineStatus};
