use crate::adaptation::AdaptationPlan;
use crate::detector::{DetectorState, EmotionSample};
use crate::error::EventError;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events emitted by the inference pipeline.
///
/// This is the one place the UI layer observes; nothing in the pipeline ever
/// calls into UI code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttuneEvent {
    /// A new emotion sample was published
    EmotionUpdated { sample: EmotionSample },
    /// The detector lifecycle moved to a new state
    DetectorStateChanged {
        from: DetectorState,
        to: DetectorState,
    },
    /// The recomputed adaptation plan differs from the previous one
    AdaptationChanged { plan: AdaptationPlan },
    /// A stabilized assistive mode turned on or off
    StabilizerChanged { surface_id: Uuid, enabled: bool },
    /// Every backend tier is gone; detection stopped until a forced retry
    DegradedMode { details: String },
    /// A sample cleared the telemetry floor and window and was handed off
    TelemetryEmitted { label: String, confidence: f64 },
}

impl AttuneEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            AttuneEvent::EmotionUpdated { sample } => {
                format!(
                    "Emotion {:?} at {:.2} (ts {})",
                    sample.label, sample.confidence, sample.timestamp_ms
                )
            }
            AttuneEvent::DetectorStateChanged { from, to } => {
                format!("Detector state {:?} -> {:?}", from, to)
            }
            AttuneEvent::AdaptationChanged { plan } => {
                format!("Adaptation changed: {}", plan.summary())
            }
            AttuneEvent::StabilizerChanged {
                surface_id,
                enabled,
            } => {
                format!(
                    "Stabilizer on surface {} {}",
                    surface_id,
                    if *enabled { "enabled" } else { "disabled" }
                )
            }
            AttuneEvent::DegradedMode { details } => {
                format!("Detection degraded: {}", details)
            }
            AttuneEvent::TelemetryEmitted { label, confidence } => {
                format!("Telemetry emitted: {} at {:.2}", label, confidence)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            AttuneEvent::EmotionUpdated { .. } => "emotion_updated",
            AttuneEvent::DetectorStateChanged { .. } => "detector_state_changed",
            AttuneEvent::AdaptationChanged { .. } => "adaptation_changed",
            AttuneEvent::StabilizerChanged { .. } => "stabilizer_changed",
            AttuneEvent::DegradedMode { .. } => "degraded_mode",
            AttuneEvent::TelemetryEmitted { .. } => "telemetry_emitted",
        }
    }
}

/// Async event bus for pipeline observers using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<AttuneEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: true,
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<AttuneEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Fails only when no subscriber exists, which callers in the pipeline
    /// ignore; detection never depends on being observed.
    pub fn publish(&self, event: AttuneEvent) -> Result<usize, EventError> {
        match &event {
            AttuneEvent::DetectorStateChanged { from, to } => {
                info!("Detector state changed: {:?} -> {:?}", from, to);
            }
            AttuneEvent::DegradedMode { details } => {
                warn!("Entering degraded mode: {}", details);
            }
            AttuneEvent::StabilizerChanged {
                surface_id,
                enabled,
            } => {
                info!(
                    "Stabilizer {} on surface {}",
                    if *enabled { "enabled" } else { "disabled" },
                    surface_id
                );
            }
            _ => {
                if self.debug_logging {
                    debug!("Event: {}", event.description());
                }
            }
        }

        self.sender
            .send(event)
            .map_err(|e| EventError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Custom filter function
    Custom(fn(&AttuneEvent) -> bool),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &AttuneEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Filtering receiver wrapper around a broadcast subscription
pub struct EventReceiver {
    receiver: broadcast::Receiver<AttuneEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(
        receiver: broadcast::Receiver<AttuneEvent>,
        filter: EventFilter,
        name: String,
    ) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event
    pub async fn recv(&mut self) -> Result<AttuneEvent, EventError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(event);
                    }
                    // Next iteration fetches the next event
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventError::Lagged { count: n });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<AttuneEvent>, EventError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    return Ok(None);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                    return Err(EventError::Lagged { count: n });
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(EventError::ChannelClosed);
                }
            }
        }
    }
}
