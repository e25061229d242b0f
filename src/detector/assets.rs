use crate::error::AssetError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// Fetches raw asset bytes by location string.
///
/// Locations are opaque here; the shipped implementation reads the local
/// filesystem, a deployment that serves assets over HTTP supplies its own
/// fetcher.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, AssetError>;
}

/// Filesystem-backed asset fetcher.
#[derive(Debug, Default)]
pub struct FsAssetFetcher;

#[async_trait]
impl AssetFetcher for FsAssetFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, AssetError> {
        tokio::fs::read(location)
            .await
            .map_err(|e| AssetError::Fetch {
                location: location.to_string(),
                details: e.to_string(),
            })
    }
}

/// The two supported model serialization formats.
///
/// The manifest's `format` field decides the loader codepath up front;
/// feeding a layers-model into the graph loader (or vice versa) used to
/// surface as an opaque deserialization error halfway through the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    GraphModel,
    LayersModel,
}

impl ModelFormat {
    pub fn from_field(value: &str, location: &str) -> Result<Self, AssetError> {
        match value {
            "graph-model" => Ok(ModelFormat::GraphModel),
            "layers-model" => Ok(ModelFormat::LayersModel),
            other => Err(AssetError::UnsupportedFormat {
                location: location.to_string(),
                found: other.to_string(),
            }),
        }
    }
}

/// Weight shard group inside a model manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct WeightsGroup {
    pub paths: Vec<String>,
}

/// Model description file: format tag, opaque topology, shard listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelManifest {
    pub format: String,
    #[serde(default)]
    pub generated_by: Option<String>,
    pub model_topology: serde_json::Value,
    pub weights_manifest: Vec<WeightsGroup>,
}

impl ModelManifest {
    pub fn parse(bytes: &[u8], location: &str) -> Result<Self, AssetError> {
        serde_json::from_slice(bytes).map_err(|e| AssetError::Parse {
            location: location.to_string(),
            details: e.to_string(),
        })
    }

    pub fn model_format(&self, location: &str) -> Result<ModelFormat, AssetError> {
        ModelFormat::from_field(&self.format, location)
    }
}

/// Everything the classifier needs from disk/network, resolved and validated.
#[derive(Debug)]
pub struct ModelBundle {
    pub manifest: ModelManifest,
    pub format: ModelFormat,
    /// Concatenated weight shards in manifest order
    pub weights: Vec<u8>,
    /// Ordered label list from the sidecar
    pub labels: Vec<String>,
    pub manifest_location: String,
}

/// Load manifest + shards + label sidecar.
///
/// Fails before touching weights when the format tag is unsupported, and
/// fails the whole load when no label list is resolvable; a classifier that
/// guesses label order returns confidently mislabeled emotions.
pub async fn load_model_bundle(
    fetcher: &dyn AssetFetcher,
    manifest_location: &str,
    labels_location: &str,
) -> Result<ModelBundle, AssetError> {
    debug!("Loading model manifest from {}", manifest_location);
    let manifest_bytes = fetcher.fetch(manifest_location).await?;
    let manifest = ModelManifest::parse(&manifest_bytes, manifest_location)?;
    let format = manifest.model_format(manifest_location)?;

    if manifest.weights_manifest.is_empty() {
        return Err(AssetError::Parse {
            location: manifest_location.to_string(),
            details: "weightsManifest is empty".to_string(),
        });
    }

    let mut weights = Vec::new();
    for group in &manifest.weights_manifest {
        for path in &group.paths {
            let shard_location = sibling_location(manifest_location, path);
            debug!("Fetching weight shard {}", shard_location);
            let shard = fetcher.fetch(&shard_location).await?;
            weights.extend_from_slice(&shard);
        }
    }

    let labels = match fetcher.fetch(labels_location).await {
        Ok(bytes) => {
            let labels: Vec<String> =
                serde_json::from_slice(&bytes).map_err(|e| AssetError::Parse {
                    location: labels_location.to_string(),
                    details: e.to_string(),
                })?;
            labels
        }
        Err(e) => {
            warn!("Label list fetch failed: {}", e);
            return Err(AssetError::MissingLabels {
                location: labels_location.to_string(),
            });
        }
    };

    if labels.is_empty() {
        return Err(AssetError::MissingLabels {
            location: labels_location.to_string(),
        });
    }

    debug!(
        "Model bundle loaded: format {:?}, {} weight bytes, {} labels",
        format,
        weights.len(),
        labels.len()
    );

    Ok(ModelBundle {
        manifest,
        format,
        weights,
        labels,
        manifest_location: manifest_location.to_string(),
    })
}

/// Try each candidate location in order; the winner's location travels with
/// the bytes so diagnostics can say where an asset actually came from.
pub async fn fetch_first(
    fetcher: &dyn AssetFetcher,
    locations: &[String],
    what: &str,
) -> Result<(String, Vec<u8>), AssetError> {
    let mut attempted = Vec::new();

    for location in locations {
        match fetcher.fetch(location).await {
            Ok(bytes) => {
                debug!("Resolved {} from {}", what, location);
                return Ok((location.clone(), bytes));
            }
            Err(e) => {
                debug!("Candidate {} failed for {}: {}", location, what, e);
                attempted.push(location.clone());
            }
        }
    }

    Err(AssetError::CandidatesExhausted {
        detector: what.to_string(),
        attempted,
    })
}

/// Resolve a shard path relative to its manifest.
fn sibling_location(manifest_location: &str, file_name: &str) -> String {
    match manifest_location.rfind('/') {
        Some(idx) => format!("{}/{}", &manifest_location[..idx], file_name),
        None => file_name.to_string(),
    }
}
