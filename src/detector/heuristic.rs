use crate::config::FusionConfig;
use crate::detector::landmarks::{FaceGeometry, LandmarkFamily, NormalizedLandmarkSet};
use crate::detector::{BackendKind, EmotionBackend, EmotionLabel, EmotionSample, ProximityInfo};
use crate::error::DetectorError;
use crate::frame::VideoFrame;
use crate::signal::{distance, map_range, min_pairwise_distance, NormPoint};
use async_trait::async_trait;
use tracing::{debug, trace};

// Face mesh topology (MediaPipe FaceMesh indexing).
const FACE_OVAL_LEFT: usize = 234;
const FACE_OVAL_RIGHT: usize = 454;
const LEFT_CHEEK: usize = 205;
const RIGHT_CHEEK: usize = 425;
const MOUTH_CORNER_LEFT: usize = 61;
const MOUTH_CORNER_RIGHT: usize = 291;
const UPPER_LIP_CENTER: usize = 13;
const LOWER_LIP_CENTER: usize = 14;
const LEFT_BROW_INNER: usize = 55;
const RIGHT_BROW_INNER: usize = 285;
const LEFT_EYE_TOP: usize = 159;
const LEFT_EYE_BOTTOM: usize = 145;
const RIGHT_EYE_TOP: usize = 386;
const RIGHT_EYE_BOTTOM: usize = 374;
const LEFT_EYE_INNER: usize = 133;
const RIGHT_EYE_INNER: usize = 362;

/// Wrist plus the four finger-base knuckles. These stay visible from most
/// camera angles, unlike fingertips.
const STABLE_HAND_KEYPOINTS: [usize; 5] = [0, 5, 9, 13, 17];

/// Elbows and wrists in BlazePose indexing.
const POSE_UPPER_LIMB_KEYPOINTS: [usize; 4] = [13, 14, 15, 16];

// Geometry-to-score bands, all as fractions of face width. Empirically
// tuned against webcam footage; revalidate before changing camera setups.
const BROW_GAP_RELAXED: f64 = 0.28;
const BROW_GAP_TENSE: f64 = 0.14;
const MOUTH_CORNER_LIFT_FULL: f64 = 0.06;
const MOUTH_CORNER_DROP_FULL: f64 = 0.05;
const EYE_OPEN_REST: f64 = 0.055;
const EYE_OPEN_WIDE: f64 = 0.09;
const MOUTH_WIDTH_REST: f64 = 0.38;
const MOUTH_WIDTH_STRETCHED: f64 = 0.52;
const BROW_RAISE_REST: f64 = 0.06;
const BROW_RAISE_FULL: f64 = 0.12;

/// Blendshape-like expression coefficients in [0,1], one set per face.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpressionScores {
    pub smile: f64,
    pub frown: f64,
    pub brow_inner_up: f64,
    pub brow_down: f64,
    pub nose_sneer: f64,
    pub eye_wide: f64,
    pub mouth_stretch: f64,
    pub brow_tension: f64,
}

impl ExpressionScores {
    /// Prefer the runtime's own expression coefficients; fall back to raw
    /// mesh geometry when the model does not emit them.
    pub fn from_face(face: &FaceGeometry) -> Option<Self> {
        Self::from_blendshapes(face).or_else(|| Self::from_geometry(&face.landmarks))
    }

    fn from_blendshapes(face: &FaceGeometry) -> Option<Self> {
        face.blendshapes.as_ref()?;

        let pair = |left: &str, right: &str| {
            (face.blendshape(left).unwrap_or(0.0) + face.blendshape(right).unwrap_or(0.0)) / 2.0
        };

        let brow_down = pair("browDownLeft", "browDownRight");
        Some(Self {
            smile: pair("mouthSmileLeft", "mouthSmileRight"),
            frown: pair("mouthFrownLeft", "mouthFrownRight"),
            brow_inner_up: face.blendshape("browInnerUp").unwrap_or(0.0),
            brow_down,
            nose_sneer: pair("noseSneerLeft", "noseSneerRight"),
            eye_wide: pair("eyeWideLeft", "eyeWideRight"),
            mouth_stretch: pair("mouthStretchLeft", "mouthStretchRight"),
            // Lowered brows are the tension signal when coefficients exist
            brow_tension: brow_down,
        })
    }

    fn from_geometry(landmarks: &NormalizedLandmarkSet) -> Option<Self> {
        let (face_width, _) = face_metrics(landmarks)?;

        let corner_left = landmarks.get(MOUTH_CORNER_LEFT)?;
        let corner_right = landmarks.get(MOUTH_CORNER_RIGHT)?;
        let upper_lip = landmarks.get(UPPER_LIP_CENTER)?;
        let lower_lip = landmarks.get(LOWER_LIP_CENTER)?;
        let brow_left = landmarks.get(LEFT_BROW_INNER)?;
        let brow_right = landmarks.get(RIGHT_BROW_INNER)?;
        let eye_left_top = landmarks.get(LEFT_EYE_TOP)?;
        let eye_left_bottom = landmarks.get(LEFT_EYE_BOTTOM)?;
        let eye_right_top = landmarks.get(RIGHT_EYE_TOP)?;
        let eye_right_bottom = landmarks.get(RIGHT_EYE_BOTTOM)?;
        let eye_left_inner = landmarks.get(LEFT_EYE_INNER)?;
        let eye_right_inner = landmarks.get(RIGHT_EYE_INNER)?;

        // y grows downward; corners above the lip midline mean a smile.
        let mouth_mid_y = (upper_lip.y + lower_lip.y) / 2.0;
        let corners_y = (corner_left.y + corner_right.y) / 2.0;
        let lift = (mouth_mid_y - corners_y) / face_width;

        // Smaller inter-eyebrow gap reads as a furrowed, tense brow.
        let brow_gap = distance(brow_left, brow_right) / face_width;

        let eye_open = ((eye_left_bottom.y - eye_left_top.y).abs()
            + (eye_right_bottom.y - eye_right_top.y).abs())
            / 2.0
            / face_width;

        let mouth_width = distance(corner_left, corner_right) / face_width;

        let brow_raise = ((eye_left_inner.y - brow_left.y) + (eye_right_inner.y - brow_right.y))
            / 2.0
            / face_width;

        Some(Self {
            smile: map_range(lift, 0.0, MOUTH_CORNER_LIFT_FULL),
            frown: map_range(-lift, 0.0, MOUTH_CORNER_DROP_FULL),
            brow_inner_up: map_range(brow_raise, BROW_RAISE_REST, BROW_RAISE_FULL),
            brow_down: map_range(brow_gap, BROW_GAP_RELAXED, BROW_GAP_TENSE),
            // No reliable geometric correlate
            nose_sneer: 0.0,
            eye_wide: map_range(eye_open, EYE_OPEN_REST, EYE_OPEN_WIDE),
            mouth_stretch: map_range(mouth_width, MOUTH_WIDTH_REST, MOUTH_WIDTH_STRETCHED),
            brow_tension: map_range(brow_gap, BROW_GAP_RELAXED, BROW_GAP_TENSE),
        })
    }
}

/// Fused classification for one frame, before and after the proximity
/// override.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOutcome {
    pub label: EmotionLabel,
    pub confidence: f64,
    pub positive_score: f64,
    pub negative_score: f64,
    pub inferred_from_context: bool,
}

/// Collapse expression coefficients into one label + confidence.
pub fn fuse(scores: &ExpressionScores, config: &FusionConfig) -> FusionOutcome {
    let positive = scores.smile;

    let distress = [
        (scores.frown + scores.brow_inner_up) / 2.0,
        (scores.brow_down + scores.nose_sneer) / 2.0,
        (scores.eye_wide + scores.mouth_stretch) / 2.0,
        scores.brow_tension * config.brow_tension_weight,
    ];
    let negative = distress.iter().fold(0.0_f64, |acc, &v| acc.max(v));

    let (label, confidence) = classify_base(positive, negative, config);
    FusionOutcome {
        label,
        confidence,
        positive_score: positive,
        negative_score: negative,
        inferred_from_context: false,
    }
}

/// The label decision alone: winner takes the label unless both sides sit
/// under the neutral floor.
pub(crate) fn classify_base(
    positive: f64,
    negative: f64,
    config: &FusionConfig,
) -> (EmotionLabel, f64) {
    let strongest = positive.max(negative);
    if strongest < config.neutral_floor {
        return (EmotionLabel::Neutral, strongest);
    }
    if positive > negative {
        (EmotionLabel::Positive, positive)
    } else {
        (EmotionLabel::Negative, negative)
    }
}

/// Hand-on-cheek proximity from whichever hands were seen this frame.
pub(crate) fn hand_proximity(
    hands: &[NormalizedLandmarkSet],
    cheeks: &[NormPoint],
    face_width: f64,
    config: &FusionConfig,
) -> ProximityInfo {
    let mut keypoints = Vec::new();
    for hand in hands {
        for &index in STABLE_HAND_KEYPOINTS.iter() {
            if let Some(point) = hand.get(index) {
                keypoints.push(point);
            }
        }
    }

    match min_pairwise_distance(&keypoints, cheeks) {
        Some(min) => {
            let distance_ratio = min / face_width;
            let score = map_range(
                distance_ratio,
                config.cheek_distance_start,
                config.cheek_distance_full,
            );
            ProximityInfo::measured(score, distance_ratio)
        }
        None => ProximityInfo::absent(),
    }
}

/// Wrist/elbow substitute signal with a deliberately looser band; pose
/// keypoints are coarser than hand keypoints.
pub(crate) fn pose_proximity(
    pose: Option<&NormalizedLandmarkSet>,
    cheeks: &[NormPoint],
    face_width: f64,
    config: &FusionConfig,
) -> ProximityInfo {
    let Some(pose) = pose else {
        return ProximityInfo::absent();
    };

    let keypoints: Vec<NormPoint> = POSE_UPPER_LIMB_KEYPOINTS
        .iter()
        .filter_map(|&index| pose.get(index))
        .collect();

    match min_pairwise_distance(&keypoints, cheeks) {
        Some(min) => {
            let distance_ratio = min / face_width;
            let score = map_range(
                distance_ratio,
                config.pose_distance_start,
                config.pose_distance_full,
            );
            ProximityInfo::measured(score, distance_ratio)
        }
        None => ProximityInfo::absent(),
    }
}

/// Pick the proximity signal allowed to override, if any. The pose signal
/// only substitutes when no hand was seen at all; a visible hand that is
/// simply far from the face is evidence against "hand on cheek".
pub(crate) fn triggering_proximity(
    cheek: &ProximityInfo,
    pose: &ProximityInfo,
    config: &FusionConfig,
) -> Option<f64> {
    if cheek.detected {
        return (cheek.score > config.cheek_score_threshold).then_some(cheek.score);
    }
    if pose.detected && pose.score > config.pose_score_threshold {
        return Some(pose.score);
    }
    None
}

/// A hand held to the cheek usually reads as distress even under an
/// ambiguous face. High-confidence smiles are exempt.
pub(crate) fn apply_contextual_override(
    outcome: FusionOutcome,
    proximity_score: Option<f64>,
    config: &FusionConfig,
) -> FusionOutcome {
    let Some(proximity) = proximity_score else {
        return outcome;
    };

    if outcome.label == EmotionLabel::Positive && outcome.confidence >= config.strong_positive_floor
    {
        return outcome;
    }

    FusionOutcome {
        label: EmotionLabel::Negative,
        confidence: config.neutral_floor.max(proximity.max(outcome.confidence)),
        inferred_from_context: true,
        ..outcome
    }
}

fn face_metrics(landmarks: &NormalizedLandmarkSet) -> Option<(f64, [NormPoint; 2])> {
    let left = landmarks.get(FACE_OVAL_LEFT)?;
    let right = landmarks.get(FACE_OVAL_RIGHT)?;
    let width = distance(left, right);
    if width < f64::EPSILON {
        return None;
    }
    let cheeks = [landmarks.get(LEFT_CHEEK)?, landmarks.get(RIGHT_CHEEK)?];
    Some((width, cheeks))
}

/// Landmark-heuristic emotion backend.
pub struct FallbackDetector {
    family: LandmarkFamily,
    config: FusionConfig,
}

impl FallbackDetector {
    pub fn new(family: LandmarkFamily, config: FusionConfig) -> Self {
        Self { family, config }
    }

    pub fn has_hands(&self) -> bool {
        self.family.has_hands()
    }

    pub fn has_pose(&self) -> bool {
        self.family.has_pose()
    }
}

#[async_trait]
impl EmotionBackend for FallbackDetector {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn detect(&self, frame: &VideoFrame) -> Result<Option<EmotionSample>, DetectorError> {
        let observation = self.family.observe(frame).await?;

        let Some(face) = observation.face else {
            trace!("No face this frame");
            return Ok(None);
        };

        let Some(scores) = ExpressionScores::from_face(&face) else {
            trace!("Face output unusable for scoring this frame");
            return Ok(None);
        };

        let (cheek, pose) = match face_metrics(&face.landmarks) {
            Some((face_width, cheeks)) => {
                let cheek = if self.family.has_hands() {
                    hand_proximity(&observation.hands, &cheeks, face_width, &self.config)
                } else {
                    ProximityInfo::unavailable()
                };
                let pose = if self.family.has_pose() {
                    pose_proximity(observation.pose.as_ref(), &cheeks, face_width, &self.config)
                } else {
                    ProximityInfo::unavailable()
                };
                (cheek, pose)
            }
            None => (ProximityInfo::unavailable(), ProximityInfo::unavailable()),
        };

        let base = fuse(&scores, &self.config);
        let trigger = triggering_proximity(&cheek, &pose, &self.config);
        let outcome = apply_contextual_override(base, trigger, &self.config);

        debug!(
            "Fused {:?} at {:.3} (positive {:.3}, negative {:.3}, cheek {:.3}, override {})",
            outcome.label,
            outcome.confidence,
            outcome.positive_score,
            outcome.negative_score,
            cheek.score,
            outcome.inferred_from_context
        );

        let mut sample = EmotionSample::new(
            outcome.label,
            outcome.confidence,
            frame.timestamp_ms,
            BackendKind::Fallback,
        );
        if outcome.inferred_from_context {
            sample = sample.contextual();
        }
        Ok(Some(sample))
    }
}
