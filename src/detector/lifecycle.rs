use crate::clock::MonotonicClock;
use crate::config::{AttuneConfig, BackendPreference};
use crate::detector::assets::AssetFetcher;
use crate::detector::classifier::{ModelRuntime, PrimaryClassifier};
use crate::detector::heuristic::FallbackDetector;
use crate::detector::landmarks::{LandmarkEngine, LandmarkFamily};
use crate::detector::EmotionBackend;
use crate::error::DetectorError;
use crate::events::{AttuneEvent, EventBus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

/// Backend lifecycle state. One instance process-wide, written only by the
/// lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    Uninitialized,
    LoadingPrimary,
    ReadyPrimary,
    LoadingFallback,
    ReadyFallback,
    Unavailable,
}

impl DetectorState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::ReadyPrimary | Self::ReadyFallback)
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::LoadingPrimary => "loading-primary",
            Self::ReadyPrimary => "ready-primary",
            Self::LoadingFallback => "loading-fallback",
            Self::ReadyFallback => "ready-fallback",
            Self::Unavailable => "unavailable",
        };
        write!(f, "{}", name)
    }
}

/// One recorded lifecycle transition, for status surfaces and debugging.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: DetectorState,
    pub to: DetectorState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Selects, initializes, and recovers the active emotion backend.
///
/// Backend instances are memoized: each target initializes at most once and
/// a later switch back to it short-circuits to Ready. Single-flight is
/// enforced by holding the slot lock across the load await. All public
/// mutating operations serialize on one op lock so the state machine never
/// interleaves two recoveries.
pub struct LifecycleManager {
    config: AttuneConfig,
    fetcher: Arc<dyn AssetFetcher>,
    model_runtime: Arc<dyn ModelRuntime>,
    landmark_engine: Arc<dyn LandmarkEngine>,
    clock: Arc<MonotonicClock>,
    bus: EventBus,
    state: RwLock<DetectorState>,
    primary: AsyncMutex<Option<Arc<PrimaryClassifier>>>,
    fallback: AsyncMutex<Option<Arc<FallbackDetector>>>,
    history: Mutex<VecDeque<TransitionRecord>>,
    op: AsyncMutex<()>,
}

impl LifecycleManager {
    pub fn new(
        config: AttuneConfig,
        fetcher: Arc<dyn AssetFetcher>,
        model_runtime: Arc<dyn ModelRuntime>,
        landmark_engine: Arc<dyn LandmarkEngine>,
        clock: Arc<MonotonicClock>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            fetcher,
            model_runtime,
            landmark_engine,
            clock,
            bus,
            state: RwLock::new(DetectorState::Uninitialized),
            primary: AsyncMutex::new(None),
            fallback: AsyncMutex::new(None),
            history: Mutex::new(VecDeque::new()),
            op: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> DetectorState {
        *self.state.read()
    }

    pub fn transition_history(&self) -> Vec<TransitionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Bring up the preferred backend. Idempotent while a backend is ready;
    /// a no-op in Unavailable, which only a forced retry leaves.
    pub async fn activate(&self) -> DetectorState {
        let _op = self.op.lock().await;
        match self.state() {
            current if current.is_ready() => current,
            DetectorState::Unavailable => DetectorState::Unavailable,
            _ => match self.config.detector.preferred_backend {
                BackendPreference::Primary => self.bring_up_primary("activation").await,
                BackendPreference::Fallback => self.bring_up_fallback("activation").await,
            },
        }
    }

    /// The backend the sampling loop should dispatch to right now.
    pub async fn active_backend(&self) -> Option<Arc<dyn EmotionBackend>> {
        match self.state() {
            DetectorState::ReadyPrimary => self
                .primary
                .lock()
                .await
                .as_ref()
                .map(|p| Arc::clone(p) as Arc<dyn EmotionBackend>),
            DetectorState::ReadyFallback => self
                .fallback
                .lock()
                .await
                .as_ref()
                .map(|f| Arc::clone(f) as Arc<dyn EmotionBackend>),
            _ => None,
        }
    }

    /// Explicit user-requested backend switch. Only honored while some
    /// backend is ready; an already-initialized target short-circuits
    /// straight to Ready without reloading.
    pub async fn switch_to(&self, target: BackendPreference) -> DetectorState {
        let _op = self.op.lock().await;
        let current = self.state();
        if !current.is_ready() {
            warn!("Ignoring backend switch request in state {}", current);
            return current;
        }

        match target {
            BackendPreference::Primary => {
                if current == DetectorState::ReadyPrimary {
                    return current;
                }
                if self.primary.lock().await.is_some() {
                    self.transition(DetectorState::ReadyPrimary, "switch to initialized primary");
                    return DetectorState::ReadyPrimary;
                }
                self.bring_up_primary("user switch").await
            }
            BackendPreference::Fallback => {
                if current == DetectorState::ReadyFallback {
                    return current;
                }
                if self.fallback.lock().await.is_some() {
                    self.transition(
                        DetectorState::ReadyFallback,
                        "switch to initialized fallback",
                    );
                    return DetectorState::ReadyFallback;
                }
                self.bring_up_fallback("user switch").await
            }
        }
    }

    /// React to a runtime inference failure in the primary backend by
    /// demoting to the fallback tier. The failing cycle yields no sample.
    pub async fn demote_primary(&self, details: &str) -> DetectorState {
        let _op = self.op.lock().await;
        if self.state() != DetectorState::ReadyPrimary {
            return self.state();
        }
        warn!("Demoting primary backend: {}", details);
        self.bring_up_fallback("primary runtime failure").await
    }

    /// Recover from a shared-runtime desynchronization: tear down every
    /// landmark sub-detector, reset the shared clock, and rebuild the
    /// whole fallback tier. The current frame is abandoned, not retried.
    pub async fn handle_desync(&self, details: &str) -> DetectorState {
        let _op = self.op.lock().await;
        warn!("Landmark runtime desynchronized, rebuilding: {}", details);

        {
            let mut slot = self.fallback.lock().await;
            *slot = None;
        }
        self.clock.reset();

        self.bring_up_fallback("desync recovery").await
    }

    /// User-forced retry out of Unavailable: drop every memoized backend
    /// and run a fresh activation.
    pub async fn force_retry(&self) -> DetectorState {
        let _op = self.op.lock().await;
        if self.state() != DetectorState::Unavailable {
            return self.state();
        }
        info!("Forced retry requested, reinitializing detection");

        {
            let mut slot = self.primary.lock().await;
            *slot = None;
        }
        {
            let mut slot = self.fallback.lock().await;
            *slot = None;
        }
        self.clock.reset();
        self.transition(DetectorState::Uninitialized, "forced retry");

        match self.config.detector.preferred_backend {
            BackendPreference::Primary => self.bring_up_primary("forced retry").await,
            BackendPreference::Fallback => self.bring_up_fallback("forced retry").await,
        }
    }

    async fn bring_up_primary(&self, reason: &str) -> DetectorState {
        self.transition(DetectorState::LoadingPrimary, reason);

        match self.ensure_primary().await {
            Ok(_) => {
                self.transition(DetectorState::ReadyPrimary, "primary loaded");
                DetectorState::ReadyPrimary
            }
            Err(e) => {
                warn!("Primary backend failed to load: {}", e);
                self.bring_up_fallback("primary load failed").await
            }
        }
    }

    async fn bring_up_fallback(&self, reason: &str) -> DetectorState {
        self.transition(DetectorState::LoadingFallback, reason);

        match self.ensure_fallback().await {
            Ok(_) => {
                self.transition(DetectorState::ReadyFallback, "fallback loaded");
                DetectorState::ReadyFallback
            }
            Err(e) => {
                error!("Fallback backend failed to load: {}", e);
                let _ = self.bus.publish(AttuneEvent::DegradedMode {
                    details: e.to_string(),
                });
                self.transition(DetectorState::Unavailable, "all backends failed");
                DetectorState::Unavailable
            }
        }
    }

    async fn ensure_primary(&self) -> Result<Arc<PrimaryClassifier>, DetectorError> {
        let mut slot = self.primary.lock().await;
        if let Some(classifier) = slot.as_ref() {
            return Ok(Arc::clone(classifier));
        }

        let classifier = PrimaryClassifier::load(
            &self.config.model,
            self.fetcher.as_ref(),
            self.model_runtime.as_ref(),
        )
        .await?;
        let classifier = Arc::new(classifier);
        *slot = Some(Arc::clone(&classifier));
        Ok(classifier)
    }

    async fn ensure_fallback(&self) -> Result<Arc<FallbackDetector>, DetectorError> {
        let mut slot = self.fallback.lock().await;
        if let Some(detector) = slot.as_ref() {
            return Ok(Arc::clone(detector));
        }

        let family = LandmarkFamily::load(
            &self.config.landmarks,
            self.fetcher.as_ref(),
            self.landmark_engine.as_ref(),
            Arc::clone(&self.clock),
        )
        .await?;
        let detector = Arc::new(FallbackDetector::new(family, self.config.fusion.clone()));
        *slot = Some(Arc::clone(&detector));
        Ok(detector)
    }

    fn transition(&self, to: DetectorState, reason: &str) {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            *state = to;
            from
        };
        if from == to {
            return;
        }

        info!("Detector {} -> {} ({})", from, to, reason);

        {
            let mut history = self.history.lock();
            history.push_back(TransitionRecord {
                from,
                to,
                at: Utc::now(),
                reason: reason.to_string(),
            });
            while history.len() > self.config.system.transition_history {
                history.pop_front();
            }
        }

        let _ = self
            .bus
            .publish(AttuneEvent::DetectorStateChanged { from, to });
    }
}
