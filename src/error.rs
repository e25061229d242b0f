use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttuneError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl AttuneError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while resolving model and landmark assets.
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Failed to fetch {location}: {details}")]
    Fetch { location: String, details: String },

    #[error("Failed to parse {location}: {details}")]
    Parse { location: String, details: String },

    #[error("Unsupported model format {found:?} in {location}: expected \"graph-model\" or \"layers-model\"")]
    UnsupportedFormat { location: String, found: String },

    #[error("No label list resolvable for model at {location}")]
    MissingLabels { location: String },

    #[error("All {detector} endpoint candidates failed, attempted: {}", attempted.join(", "))]
    CandidatesExhausted {
        detector: String,
        attempted: Vec<String>,
    },
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Backend load failed: {0}")]
    Load(#[source] AssetError),

    #[error("Inference call failed in {stage}: {details}")]
    Inference { stage: String, details: String },

    #[error("Shared runtime desynchronized at {stage}: {details}")]
    Desync { stage: String, details: String },

    #[error("No detector backend available: {details}")]
    Unavailable { details: String },
}

impl DetectorError {
    pub fn inference<S: Into<String>>(stage: S, details: S) -> Self {
        Self::Inference {
            stage: stage.into(),
            details: details.into(),
        }
    }

    pub fn desync<S: Into<String>>(stage: S, details: S) -> Self {
        Self::Desync {
            stage: stage.into(),
            details: details.into(),
        }
    }

    /// True when the shared landmark runtime must be torn down and rebuilt.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Desync { .. })
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Receiver lagged behind by {count} events")]
    Lagged { count: u64 },
}

pub type Result<T> = std::result::Result<T, AttuneError>;
