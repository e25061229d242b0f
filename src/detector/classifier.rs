use crate::config::{ModelConfig, PixelNormalization};
use crate::detector::assets::{load_model_bundle, AssetFetcher, ModelBundle, ModelFormat};
use crate::detector::{BackendKind, EmotionBackend, EmotionLabel, EmotionSample};
use crate::error::DetectorError;
use crate::frame::VideoFrame;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbImage;
use tracing::{debug, info};

/// Tensor execution seam for the primary classifier.
///
/// Input is a flattened [1, height, width, 3] buffer already normalized to
/// the model's pixel convention; output is one probability per label.
#[async_trait]
pub trait InferenceSession: Send + Sync {
    /// Input (width, height) declared by the model signature, when exposed.
    fn input_size(&self) -> Option<(u32, u32)>;

    async fn run(&self, input: &[f32]) -> Result<Vec<f32>, DetectorError>;
}

impl std::fmt::Debug for dyn InferenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceSession").finish_non_exhaustive()
    }
}

/// Builds sessions from a resolved model bundle. One method per supported
/// serialization format; the loader picks based on the manifest's format
/// tag, never by trial and error.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn load_graph(
        &self,
        bundle: &ModelBundle,
    ) -> Result<Box<dyn InferenceSession>, DetectorError>;

    async fn load_layers(
        &self,
        bundle: &ModelBundle,
    ) -> Result<Box<dyn InferenceSession>, DetectorError>;
}

/// Neural emotion classifier over an injected inference session.
pub struct PrimaryClassifier {
    session: Box<dyn InferenceSession>,
    labels: Vec<String>,
    canonical: Vec<EmotionLabel>,
    normalization: PixelNormalization,
    input_size: (u32, u32),
}

impl PrimaryClassifier {
    /// Resolve assets, pick the loader codepath from the manifest's format
    /// tag, and bind the ordered label list.
    pub async fn load(
        config: &ModelConfig,
        fetcher: &dyn AssetFetcher,
        runtime: &dyn ModelRuntime,
    ) -> Result<Self, DetectorError> {
        let bundle =
            load_model_bundle(fetcher, &config.manifest_location, &config.labels_location)
                .await
                .map_err(DetectorError::Load)?;

        let session = match bundle.format {
            ModelFormat::GraphModel => runtime.load_graph(&bundle).await?,
            ModelFormat::LayersModel => runtime.load_layers(&bundle).await?,
        };

        let input_size = match session.input_size() {
            Some(size) => size,
            None => {
                debug!(
                    "Model does not declare input dimensions, using configured default {:?}",
                    config.default_input_size
                );
                config.default_input_size
            }
        };

        let canonical = bundle
            .labels
            .iter()
            .map(|name| EmotionLabel::from_name(name))
            .collect();

        info!(
            "Primary classifier ready: {:?}, input {}x{}, {} labels, {:?} normalization",
            bundle.format,
            input_size.0,
            input_size.1,
            bundle.labels.len(),
            config.normalization
        );

        Ok(Self {
            session,
            labels: bundle.labels,
            canonical,
            normalization: config.normalization,
            input_size,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        session: Box<dyn InferenceSession>,
        labels: Vec<String>,
        normalization: PixelNormalization,
        input_size: (u32, u32),
    ) -> Self {
        let canonical = labels
            .iter()
            .map(|name| EmotionLabel::from_name(name))
            .collect();
        Self {
            session,
            labels,
            canonical,
            normalization,
            input_size,
        }
    }

    /// Run one frame through the model and return (label index, confidence).
    async fn classify(&self, frame: &VideoFrame) -> Result<(usize, f64), DetectorError> {
        let input = preprocess_frame(frame, self.input_size, self.normalization)
            .ok_or_else(|| {
                DetectorError::inference("primary-preprocess", "frame buffer is not valid RGB24")
            })?;

        let scores = self.session.run(&input).await?;

        if scores.len() != self.labels.len() {
            return Err(DetectorError::Inference {
                stage: "primary-postprocess".to_string(),
                details: format!(
                    "model emitted {} scores for {} labels",
                    scores.len(),
                    self.labels.len()
                ),
            });
        }

        let (best_index, best_score) = scores
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |(bi, bs), (i, &s)| {
                if s > bs {
                    (i, s)
                } else {
                    (bi, bs)
                }
            });

        Ok((best_index, best_score as f64))
    }
}

#[async_trait]
impl EmotionBackend for PrimaryClassifier {
    fn kind(&self) -> BackendKind {
        BackendKind::Primary
    }

    async fn detect(&self, frame: &VideoFrame) -> Result<Option<EmotionSample>, DetectorError> {
        let (index, confidence) = self.classify(frame).await?;
        let label = self.canonical[index];

        debug!(
            "Primary classified {:?} ({}) at {:.3}",
            label, self.labels[index], confidence
        );

        Ok(Some(EmotionSample::new(
            label,
            confidence,
            frame.timestamp_ms,
            BackendKind::Primary,
        )))
    }
}

/// Resize to the model's input dimensions, apply the configured pixel
/// normalization, and lay the result out as a flattened [1, h, w, 3] batch.
pub(crate) fn preprocess_frame(
    frame: &VideoFrame,
    (width, height): (u32, u32),
    normalization: PixelNormalization,
) -> Option<Vec<f32>> {
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.as_ref().clone())?;

    let resized = if frame.width == width && frame.height == height {
        image
    } else {
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    };

    let mut input = Vec::with_capacity((width * height * 3) as usize);
    for pixel in resized.pixels() {
        for &channel in pixel.0.iter() {
            let value = match normalization {
                PixelNormalization::ZeroToOne => channel as f32 / 255.0,
                PixelNormalization::NegOneToOne => channel as f32 / 127.5 - 1.0,
            };
            input.push(value);
        }
    }
    Some(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeSession {
        declared_size: Option<(u32, u32)>,
        scores: Vec<f32>,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InferenceSession for FakeSession {
        fn input_size(&self) -> Option<(u32, u32)> {
            self.declared_size
        }

        async fn run(&self, input: &[f32]) -> Result<Vec<f32>, DetectorError> {
            assert!(!input.is_empty());
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }
    }

    fn solid_frame(value: u8, width: u32, height: u32) -> VideoFrame {
        VideoFrame::new(7, 1234, vec![value; (width * height * 3) as usize], width, height)
    }

    fn classifier_with_scores(scores: Vec<f32>, labels: Vec<&str>) -> PrimaryClassifier {
        PrimaryClassifier::from_parts(
            Box::new(FakeSession {
                declared_size: Some((4, 4)),
                scores,
                runs: Arc::new(AtomicUsize::new(0)),
            }),
            labels.into_iter().map(String::from).collect(),
            PixelNormalization::ZeroToOne,
            (4, 4),
        )
    }

    #[test]
    fn test_preprocess_zero_to_one() {
        let frame = solid_frame(255, 4, 4);
        let input = preprocess_frame(&frame, (4, 4), PixelNormalization::ZeroToOne).unwrap();
        assert_eq!(input.len(), 4 * 4 * 3);
        assert!(input.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_preprocess_neg_one_to_one() {
        let frame = solid_frame(0, 4, 4);
        let input = preprocess_frame(&frame, (4, 4), PixelNormalization::NegOneToOne).unwrap();
        assert!(input.iter().all(|&v| (v + 1.0).abs() < 1e-6));

        let mid = solid_frame(255, 4, 4);
        let input = preprocess_frame(&mid, (4, 4), PixelNormalization::NegOneToOne).unwrap();
        assert!(input.iter().all(|&v| (v - 1.0).abs() < 1e-2));
    }

    #[test]
    fn test_preprocess_resizes_to_model_dims() {
        let frame = solid_frame(128, 8, 6);
        let input = preprocess_frame(&frame, (4, 4), PixelNormalization::ZeroToOne).unwrap();
        assert_eq!(input.len(), 4 * 4 * 3);
    }

    #[tokio::test]
    async fn test_argmax_maps_through_label_list() {
        let classifier =
            classifier_with_scores(vec![0.1, 0.7, 0.2], vec!["happy", "sad", "neutral"]);
        let sample = classifier
            .detect(&solid_frame(100, 4, 4))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sample.label, EmotionLabel::Negative);
        assert!((sample.confidence - 0.7).abs() < 1e-6);
        assert_eq!(sample.backend, BackendKind::Primary);
        assert_eq!(sample.timestamp_ms, 1234);
    }

    #[tokio::test]
    async fn test_score_label_cardinality_mismatch_is_an_error() {
        let classifier = classifier_with_scores(vec![0.5, 0.5], vec!["happy", "sad", "neutral"]);
        let err = classifier
            .detect(&solid_frame(100, 4, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectorError::Inference { .. }));
    }

    struct MapFetcher(std::collections::HashMap<String, Vec<u8>>);

    #[async_trait]
    impl AssetFetcher for MapFetcher {
        async fn fetch(&self, location: &str) -> Result<Vec<u8>, crate::error::AssetError> {
            self.0
                .get(location)
                .cloned()
                .ok_or_else(|| crate::error::AssetError::Fetch {
                    location: location.to_string(),
                    details: "not present".to_string(),
                })
        }
    }

    struct FakeRuntime {
        graph_loads: Arc<AtomicUsize>,
        layers_loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelRuntime for FakeRuntime {
        async fn load_graph(
            &self,
            _bundle: &ModelBundle,
        ) -> Result<Box<dyn InferenceSession>, DetectorError> {
            self.graph_loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                declared_size: Some((4, 4)),
                scores: vec![0.9, 0.1],
                runs: Arc::new(AtomicUsize::new(0)),
            }))
        }

        async fn load_layers(
            &self,
            _bundle: &ModelBundle,
        ) -> Result<Box<dyn InferenceSession>, DetectorError> {
            self.layers_loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                declared_size: Some((4, 4)),
                scores: vec![0.9, 0.1],
                runs: Arc::new(AtomicUsize::new(0)),
            }))
        }
    }

    #[tokio::test]
    async fn test_load_dispatches_on_manifest_format() {
        let manifest = r#"{
            "format": "graph-model",
            "modelTopology": {},
            "weightsManifest": [{"paths": ["group1-shard1of1.bin"]}]
        }"#;
        let mut files = std::collections::HashMap::new();
        files.insert("models/model.json".to_string(), manifest.as_bytes().to_vec());
        files.insert("models/group1-shard1of1.bin".to_string(), vec![0u8; 16]);
        files.insert(
            "models/labels.json".to_string(),
            br#"["happy", "sad"]"#.to_vec(),
        );
        let fetcher = MapFetcher(files);

        let graph_loads = Arc::new(AtomicUsize::new(0));
        let layers_loads = Arc::new(AtomicUsize::new(0));
        let runtime = FakeRuntime {
            graph_loads: Arc::clone(&graph_loads),
            layers_loads: Arc::clone(&layers_loads),
        };

        let config = ModelConfig {
            manifest_location: "models/model.json".to_string(),
            labels_location: "models/labels.json".to_string(),
            normalization: PixelNormalization::ZeroToOne,
            default_input_size: (224, 224),
        };

        let classifier = PrimaryClassifier::load(&config, &fetcher, &runtime)
            .await
            .unwrap();
        assert_eq!(graph_loads.load(Ordering::SeqCst), 1);
        assert_eq!(layers_loads.load(Ordering::SeqCst), 0);

        let sample = classifier
            .detect(&solid_frame(50, 4, 4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.label, EmotionLabel::Positive);
    }

    #[tokio::test]
    async fn test_session_without_declared_dims_uses_default() {
        let runs = Arc::new(AtomicUsize::new(0));
        let classifier = PrimaryClassifier::from_parts(
            Box::new(FakeSession {
                declared_size: None,
                scores: vec![1.0],
                runs: Arc::clone(&runs),
            }),
            vec!["happy".to_string()],
            PixelNormalization::ZeroToOne,
            (224, 224),
        );

        let sample = classifier
            .detect(&solid_frame(10, 8, 8))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.label, EmotionLabel::Positive);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
