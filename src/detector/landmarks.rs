use crate::clock::MonotonicClock;
use crate::config::LandmarksConfig;
use crate::detector::assets::{fetch_first, AssetFetcher};
use crate::error::DetectorError;
use crate::frame::VideoFrame;
use crate::signal::NormPoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Landmarks in normalized image coordinates, [0,1] on both axes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedLandmarkSet {
    pub points: Vec<NormPoint>,
}

impl NormalizedLandmarkSet {
    pub fn new(points: Vec<NormPoint>) -> Self {
        Self { points }
    }

    pub fn get(&self, index: usize) -> Option<NormPoint> {
        self.points.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Face mesh plus the expression coefficients some runtimes emit alongside
/// it. Heuristics prefer the coefficients and fall back to raw geometry.
#[derive(Debug, Clone, Default)]
pub struct FaceGeometry {
    pub landmarks: NormalizedLandmarkSet,
    pub blendshapes: Option<HashMap<String, f64>>,
}

impl FaceGeometry {
    pub fn from_landmarks(landmarks: NormalizedLandmarkSet) -> Self {
        Self {
            landmarks,
            blendshapes: None,
        }
    }

    pub fn blendshape(&self, name: &str) -> Option<f64> {
        self.blendshapes.as_ref().and_then(|map| map.get(name).copied())
    }
}

#[async_trait]
pub trait FaceLandmarker: Send + Sync {
    async fn detect(
        &self,
        frame: &VideoFrame,
        timestamp_ms: u64,
    ) -> Result<Option<FaceGeometry>, DetectorError>;
}

/// Up to two hands per frame, order unspecified.
#[async_trait]
pub trait HandLandmarker: Send + Sync {
    async fn detect(
        &self,
        frame: &VideoFrame,
        timestamp_ms: u64,
    ) -> Result<Vec<NormalizedLandmarkSet>, DetectorError>;
}

#[async_trait]
pub trait PoseLandmarker: Send + Sync {
    async fn detect(
        &self,
        frame: &VideoFrame,
        timestamp_ms: u64,
    ) -> Result<Option<NormalizedLandmarkSet>, DetectorError>;
}

/// Constructs sub-detectors from resolved asset bytes. Implementations own
/// the underlying vision runtime; the rest of the crate only sees traits.
#[async_trait]
pub trait LandmarkEngine: Send + Sync {
    async fn create_face(
        &self,
        runtime: &[u8],
        model: &[u8],
    ) -> Result<Box<dyn FaceLandmarker>, DetectorError>;

    async fn create_hand(
        &self,
        runtime: &[u8],
        model: &[u8],
    ) -> Result<Box<dyn HandLandmarker>, DetectorError>;

    async fn create_pose(
        &self,
        runtime: &[u8],
        model: &[u8],
    ) -> Result<Box<dyn PoseLandmarker>, DetectorError>;
}

/// One frame's worth of landmark output across all loaded sub-detectors.
#[derive(Debug, Clone, Default)]
pub struct LandmarkObservation {
    pub face: Option<FaceGeometry>,
    pub hands: Vec<NormalizedLandmarkSet>,
    pub pose: Option<NormalizedLandmarkSet>,
}

/// The assembled landmark trio behind the fallback detector.
///
/// The face landmarker is mandatory; hand and pose are best-effort extras
/// that widen the heuristic's evidence when their assets resolve. All three
/// share one inference runtime underneath, so every detect call must carry
/// a strictly increasing timestamp. The family owns that discipline: each
/// sub-detector call draws the next tick from the shared clock, in a fixed
/// face, hands, pose order.
pub struct LandmarkFamily {
    face: Box<dyn FaceLandmarker>,
    hands: Option<Box<dyn HandLandmarker>>,
    pose: Option<Box<dyn PoseLandmarker>>,
    clock: Arc<MonotonicClock>,
}

impl LandmarkFamily {
    /// Resolve assets for each sub-detector and build it via the engine.
    ///
    /// A face failure fails the whole load. Hand and pose failures are
    /// logged and leave that slot empty.
    pub async fn load(
        config: &LandmarksConfig,
        fetcher: &dyn AssetFetcher,
        engine: &dyn LandmarkEngine,
        clock: Arc<MonotonicClock>,
    ) -> Result<Self, DetectorError> {
        let (runtime, model) = resolve_endpoint_pair(fetcher, config, Sub::Face).await?;
        let face = engine.create_face(&runtime, &model).await?;
        info!("Face landmarker loaded");

        let hands = match resolve_endpoint_pair(fetcher, config, Sub::Hand).await {
            Ok((runtime, model)) => match engine.create_hand(&runtime, &model).await {
                Ok(hand) => {
                    info!("Hand landmarker loaded");
                    Some(hand)
                }
                Err(e) => {
                    warn!("Hand landmarker unavailable, continuing without it: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Hand landmarker assets unresolved, continuing without them: {}", e);
                None
            }
        };

        let pose = match resolve_endpoint_pair(fetcher, config, Sub::Pose).await {
            Ok((runtime, model)) => match engine.create_pose(&runtime, &model).await {
                Ok(pose) => {
                    info!("Pose landmarker loaded");
                    Some(pose)
                }
                Err(e) => {
                    warn!("Pose landmarker unavailable, continuing without it: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Pose landmarker assets unresolved, continuing without them: {}", e);
                None
            }
        };

        Ok(Self {
            face,
            hands,
            pose,
            clock,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        face: Box<dyn FaceLandmarker>,
        hands: Option<Box<dyn HandLandmarker>>,
        pose: Option<Box<dyn PoseLandmarker>>,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        Self {
            face,
            hands,
            pose,
            clock,
        }
    }

    pub fn has_hands(&self) -> bool {
        self.hands.is_some()
    }

    pub fn has_pose(&self) -> bool {
        self.pose.is_some()
    }

    /// Run every loaded sub-detector against one frame.
    ///
    /// Face errors and any desync propagate; other hand/pose errors reduce
    /// to an absent signal for this frame.
    pub async fn observe(&self, frame: &VideoFrame) -> Result<LandmarkObservation, DetectorError> {
        let ts = self.clock.next_timestamp(frame.timestamp_ms);
        let face = self.face.detect(frame, ts).await?;

        let hands = match &self.hands {
            Some(hand) => {
                let ts = self.clock.next_timestamp(frame.timestamp_ms);
                match hand.detect(frame, ts).await {
                    Ok(hands) => hands,
                    Err(e) if e.is_desync() => return Err(e),
                    Err(e) => {
                        debug!("Hand landmarks skipped this frame: {}", e);
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let pose = match &self.pose {
            Some(pose) => {
                let ts = self.clock.next_timestamp(frame.timestamp_ms);
                match pose.detect(frame, ts).await {
                    Ok(pose) => pose,
                    Err(e) if e.is_desync() => return Err(e),
                    Err(e) => {
                        debug!("Pose landmarks skipped this frame: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(LandmarkObservation { face, hands, pose })
    }
}

enum Sub {
    Face,
    Hand,
    Pose,
}

impl Sub {
    fn name(&self) -> &'static str {
        match self {
            Sub::Face => "face-landmarker",
            Sub::Hand => "hand-landmarker",
            Sub::Pose => "pose-landmarker",
        }
    }
}

async fn resolve_endpoint_pair(
    fetcher: &dyn AssetFetcher,
    config: &LandmarksConfig,
    sub: Sub,
) -> Result<(Vec<u8>, Vec<u8>), DetectorError> {
    let endpoint = match sub {
        Sub::Face => &config.face,
        Sub::Hand => &config.hand,
        Sub::Pose => &config.pose,
    };

    let (_, runtime) = fetch_first(fetcher, &endpoint.runtime_locations(), sub.name())
        .await
        .map_err(DetectorError::Load)?;
    let (_, model) = fetch_first(fetcher, &endpoint.model_locations(), sub.name())
        .await
        .map_err(DetectorError::Load)?;

    Ok((runtime, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingFace {
        timestamps: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl FaceLandmarker for RecordingFace {
        async fn detect(
            &self,
            _frame: &VideoFrame,
            timestamp_ms: u64,
        ) -> Result<Option<FaceGeometry>, DetectorError> {
            self.timestamps.lock().push(timestamp_ms);
            Ok(Some(FaceGeometry::default()))
        }
    }

    struct RecordingHand {
        timestamps: Arc<Mutex<Vec<u64>>>,
        fail_with: Option<fn() -> DetectorError>,
    }

    #[async_trait]
    impl HandLandmarker for RecordingHand {
        async fn detect(
            &self,
            _frame: &VideoFrame,
            timestamp_ms: u64,
        ) -> Result<Vec<NormalizedLandmarkSet>, DetectorError> {
            self.timestamps.lock().push(timestamp_ms);
            if let Some(make) = self.fail_with {
                return Err(make());
            }
            Ok(vec![NormalizedLandmarkSet::new(vec![NormPoint::new(
                0.5, 0.5,
            )])])
        }
    }

    struct RecordingPose {
        timestamps: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl PoseLandmarker for RecordingPose {
        async fn detect(
            &self,
            _frame: &VideoFrame,
            timestamp_ms: u64,
        ) -> Result<Option<NormalizedLandmarkSet>, DetectorError> {
            self.timestamps.lock().push(timestamp_ms);
            Ok(None)
        }
    }

    fn frame_at(timestamp_ms: u64) -> VideoFrame {
        VideoFrame::new(1, timestamp_ms, vec![0u8; 12], 2, 2)
    }

    #[tokio::test]
    async fn test_observe_issues_strictly_increasing_timestamps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let family = LandmarkFamily::from_parts(
            Box::new(RecordingFace {
                timestamps: Arc::clone(&seen),
            }),
            Some(Box::new(RecordingHand {
                timestamps: Arc::clone(&seen),
                fail_with: None,
            })),
            Some(Box::new(RecordingPose {
                timestamps: Arc::clone(&seen),
            })),
            Arc::new(MonotonicClock::new()),
        );

        family.observe(&frame_at(1000)).await.unwrap();
        // Same media timestamp again: the clock must keep climbing anyway.
        family.observe(&frame_at(1000)).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 6);
        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0], "timestamps not increasing: {:?}", *seen);
        }
        assert_eq!(seen[0], 1000);
        assert_eq!(seen[1], 1001);
        assert_eq!(seen[2], 1002);
    }

    #[tokio::test]
    async fn test_missing_optional_landmarkers_yield_empty_signals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let family = LandmarkFamily::from_parts(
            Box::new(RecordingFace {
                timestamps: Arc::clone(&seen),
            }),
            None,
            None,
            Arc::new(MonotonicClock::new()),
        );

        assert!(!family.has_hands());
        assert!(!family.has_pose());

        let observation = family.observe(&frame_at(5)).await.unwrap();
        assert!(observation.face.is_some());
        assert!(observation.hands.is_empty());
        assert!(observation.pose.is_none());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_hand_inference_error_degrades_to_absent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let family = LandmarkFamily::from_parts(
            Box::new(RecordingFace {
                timestamps: Arc::clone(&seen),
            }),
            Some(Box::new(RecordingHand {
                timestamps: Arc::clone(&seen),
                fail_with: Some(|| DetectorError::inference("hand-landmarker", "no palm found")),
            })),
            None,
            Arc::new(MonotonicClock::new()),
        );

        let observation = family.observe(&frame_at(10)).await.unwrap();
        assert!(observation.hands.is_empty());
    }

    #[tokio::test]
    async fn test_hand_desync_propagates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let family = LandmarkFamily::from_parts(
            Box::new(RecordingFace {
                timestamps: Arc::clone(&seen),
            }),
            Some(Box::new(RecordingHand {
                timestamps: Arc::clone(&seen),
                fail_with: Some(|| {
                    DetectorError::desync("hand-landmarker", "timestamp went backwards")
                }),
            })),
            None,
            Arc::new(MonotonicClock::new()),
        );

        let err = family.observe(&frame_at(10)).await.unwrap_err();
        assert!(err.is_desync());
    }
}
