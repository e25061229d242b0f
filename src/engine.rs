use crate::adaptation::AdaptationPlan;
use crate::clock::MonotonicClock;
use crate::config::{AttuneConfig, BackendPreference};
use crate::detector::assets::AssetFetcher;
use crate::detector::classifier::ModelRuntime;
use crate::detector::landmarks::LandmarkEngine;
use crate::detector::lifecycle::{DetectorState, LifecycleManager, TransitionRecord};
use crate::detector::EmotionSample;
use crate::error::{AttuneError, Result};
use crate::events::{AttuneEvent, EventBus};
use crate::frame::FrameSource;
use crate::sampling::{CycleStats, SamplingLoop};
use crate::stabilizer::{Stabilizer, StabilizerSnapshot};
use crate::state::EmotionStore;
use crate::telemetry::{TelemetrySink, TelemetryStats, TelemetryThrottle};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view over every moving part, for status endpoints and the
/// demo binary's end-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub detector_state: DetectorState,
    pub sampling_active: bool,
    pub cycles: CycleStats,
    pub telemetry: TelemetryStats,
    pub transitions: Vec<TransitionRecord>,
    pub current_emotion: Option<EmotionSample>,
    pub current_plan: AdaptationPlan,
    pub surfaces: HashMap<Uuid, StabilizerSnapshot>,
}

/// Builder for [`AttuneEngine`]. Every external seam must be supplied; the
/// engine itself owns no I/O.
pub struct EngineBuilder {
    config: Option<AttuneConfig>,
    frames: Option<Arc<dyn FrameSource>>,
    fetcher: Option<Arc<dyn AssetFetcher>>,
    model_runtime: Option<Arc<dyn ModelRuntime>>,
    landmark_engine: Option<Arc<dyn LandmarkEngine>>,
    telemetry_sink: Option<Arc<dyn TelemetrySink>>,
    user_id: Option<Uuid>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            frames: None,
            fetcher: None,
            model_runtime: None,
            landmark_engine: None,
            telemetry_sink: None,
            user_id: None,
        }
    }

    pub fn config(mut self, config: AttuneConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn AssetFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn model_runtime(mut self, runtime: Arc<dyn ModelRuntime>) -> Self {
        self.model_runtime = Some(runtime);
        self
    }

    pub fn landmark_engine(mut self, engine: Arc<dyn LandmarkEngine>) -> Self {
        self.landmark_engine = Some(engine);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry_sink = Some(sink);
        self
    }

    /// Learner identity attached to telemetry records. A fresh anonymous id
    /// is generated when not provided.
    pub fn user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn build(self) -> Result<AttuneEngine> {
        let config = self.config.unwrap_or_default();
        let frames = self
            .frames
            .ok_or_else(|| AttuneError::component("engine_builder", "Frame source is required"))?;
        let fetcher = self
            .fetcher
            .ok_or_else(|| AttuneError::component("engine_builder", "Asset fetcher is required"))?;
        let model_runtime = self.model_runtime.ok_or_else(|| {
            AttuneError::component("engine_builder", "Model runtime is required")
        })?;
        let landmark_engine = self.landmark_engine.ok_or_else(|| {
            AttuneError::component("engine_builder", "Landmark engine is required")
        })?;
        let telemetry_sink = self.telemetry_sink.ok_or_else(|| {
            AttuneError::component("engine_builder", "Telemetry sink is required")
        })?;
        let user_id = self.user_id.unwrap_or_else(Uuid::new_v4);

        let bus = EventBus::new(config.system.event_bus_capacity);
        let store = Arc::new(EmotionStore::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            fetcher,
            model_runtime,
            landmark_engine,
            Arc::new(MonotonicClock::new()),
            bus.clone(),
        ));
        let telemetry = Arc::new(TelemetryThrottle::new(
            config.telemetry.clone(),
            telemetry_sink,
            bus.clone(),
            user_id,
        ));
        let chain = Arc::new(SamplingLoop::new(
            config.sampling.clone(),
            config.adaptation.clone(),
            frames,
            Arc::clone(&lifecycle),
            Arc::clone(&store),
            Arc::clone(&telemetry),
            bus.clone(),
        ));

        Ok(AttuneEngine {
            config,
            bus,
            store,
            lifecycle,
            chain,
            telemetry,
            stabilizers: Arc::new(Mutex::new(HashMap::new())),
            observer: Mutex::new(None),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled pipeline: lifecycle manager, sampling loop, adaptation
/// state, telemetry throttle, and one stabilizer per mounted assistive
/// surface, all sharing one event bus.
impl std::fmt::Debug for AttuneEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttuneEngine").finish_non_exhaustive()
    }
}

pub struct AttuneEngine {
    config: AttuneConfig,
    bus: EventBus,
    store: Arc<EmotionStore>,
    lifecycle: Arc<LifecycleManager>,
    chain: Arc<SamplingLoop>,
    telemetry: Arc<TelemetryThrottle>,
    stabilizers: Arc<Mutex<HashMap<Uuid, Arc<Stabilizer>>>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl AttuneEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Bring up detection and start sampling. Safe to call while running;
    /// the sampling chain restarts under a fresh generation.
    ///
    /// A start that ends with the detector Unavailable still returns Ok:
    /// the engine is alive, idling, and a forced retry can recover it.
    pub async fn start(&self) -> Result<()> {
        {
            let mut slot = self.observer.lock();
            let running = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
            if !running {
                *slot = Some(self.spawn_observer());
            }
        }

        let state = self.lifecycle.activate().await;
        if !state.is_ready() {
            warn!("Detection not ready after activation (state {})", state);
        }
        self.chain.activate();
        Ok(())
    }

    /// Stop sampling and cancel every stabilizer timer. Initialized
    /// backends stay memoized; a later start resumes without reloading.
    pub async fn stop(&self) {
        self.chain.deactivate();
        if let Some(handle) = self.observer.lock().take() {
            handle.abort();
        }
        for stabilizer in self.mounted() {
            stabilizer.clear().await;
        }
        info!("Engine stopped");
    }

    /// Register an assistive surface and return its id. Each surface gets
    /// its own hysteresis state; a modal hint and a reading-mode toggle
    /// should not share hold timers.
    pub fn mount_surface(&self) -> Uuid {
        let surface_id = Uuid::new_v4();
        let stabilizer = Arc::new(Stabilizer::new(
            surface_id,
            self.config.stabilizer.clone(),
            self.bus.clone(),
        ));
        self.stabilizers.lock().insert(surface_id, stabilizer);
        info!("Mounted assistive surface {}", surface_id);
        surface_id
    }

    /// Remove a surface, cancelling its timers. Returns false for unknown ids.
    pub async fn unmount_surface(&self, surface_id: Uuid) -> bool {
        let removed = self.stabilizers.lock().remove(&surface_id);
        match removed {
            Some(stabilizer) => {
                stabilizer.clear().await;
                info!("Unmounted assistive surface {}", surface_id);
                true
            }
            None => false,
        }
    }

    pub fn stabilizer(&self, surface_id: Uuid) -> Option<Arc<Stabilizer>> {
        self.stabilizers.lock().get(&surface_id).cloned()
    }

    pub async fn force_retry(&self) -> DetectorState {
        self.lifecycle.force_retry().await
    }

    pub async fn switch_backend(&self, target: BackendPreference) -> DetectorState {
        self.lifecycle.switch_to(target).await
    }

    pub fn set_performance(&self, score: Option<f64>) {
        self.chain.set_performance(score);
    }

    /// Material currently being studied; attached to telemetry records.
    pub fn set_material(&self, material_id: Option<Uuid>) {
        self.telemetry.set_material(material_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttuneEvent> {
        self.bus.subscribe()
    }

    pub fn detector_state(&self) -> DetectorState {
        self.lifecycle.state()
    }

    /// Serialize the current emotion for session handoff, if there is one.
    pub fn export_state(&self) -> Result<Option<String>> {
        self.store.export()
    }

    /// Restore a previously exported emotion into the store. Versioned
    /// records from older sessions are migrated on the way in.
    pub fn hydrate_state(&self, json: &str) -> Result<Arc<EmotionSample>> {
        self.store.hydrate(json)
    }

    pub async fn status(&self) -> EngineStatus {
        let mut surfaces = HashMap::new();
        for stabilizer in self.mounted() {
            surfaces.insert(stabilizer.surface_id(), stabilizer.snapshot().await);
        }

        EngineStatus {
            detector_state: self.lifecycle.state(),
            sampling_active: self.chain.is_active(),
            cycles: self.chain.stats(),
            telemetry: self.telemetry.stats(),
            transitions: self.lifecycle.transition_history(),
            current_emotion: self.store.current_sample().map(|s| (*s).clone()),
            current_plan: (*self.store.current_plan()).clone(),
            surfaces,
        }
    }

    fn mounted(&self) -> Vec<Arc<Stabilizer>> {
        self.stabilizers.lock().values().cloned().collect()
    }

    /// Feed each published sample's plan recommendation into every mounted
    /// stabilizer. Runs until aborted; lagging behind the bus only costs
    /// skipped observations, which the hysteresis absorbs.
    fn spawn_observer(&self) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        let store = Arc::clone(&self.store);
        let stabilizers = Arc::clone(&self.stabilizers);

        tokio::spawn(async move {
            debug!("Plan observer started");
            loop {
                match receiver.recv().await {
                    Ok(AttuneEvent::EmotionUpdated { .. }) => {
                        let recommendation = store.current_plan().recommends_assist();
                        let targets: Vec<Arc<Stabilizer>> =
                            stabilizers.lock().values().cloned().collect();
                        for stabilizer in targets {
                            stabilizer.observe(recommendation).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Plan observer lagged behind by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Plan observer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::EmotionLabel;
    use crate::sim::{
        scripted_locations, Scenario, SimAssetFetcher, SimFrameSource, SimLandmarkEngine,
        SimModelRuntime, SimPhase, SimTelemetrySink,
    };
    use tokio::time::{advance, Duration};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    struct Rig {
        engine: AttuneEngine,
        fetcher: Arc<SimAssetFetcher>,
        sink: Arc<SimTelemetrySink>,
    }

    fn rig(scenario: Scenario, fail_primary_load: bool) -> Rig {
        let scenario = Arc::new(scenario);
        let mut config = AttuneConfig::default();
        scripted_locations(&mut config);

        let fetcher = Arc::new(SimAssetFetcher::new());
        let sink = Arc::new(SimTelemetrySink::new());
        let runtime = if fail_primary_load {
            SimModelRuntime::failing_load(Arc::clone(&scenario))
        } else {
            SimModelRuntime::new(Arc::clone(&scenario))
        };

        let engine = AttuneEngine::builder()
            .config(config)
            .frames(Arc::new(SimFrameSource::new(Arc::clone(&scenario))))
            .fetcher(Arc::clone(&fetcher) as Arc<dyn AssetFetcher>)
            .model_runtime(Arc::new(runtime))
            .landmark_engine(Arc::new(SimLandmarkEngine::new(scenario)))
            .telemetry_sink(Arc::clone(&sink) as Arc<dyn TelemetrySink>)
            .build()
            .unwrap();

        Rig {
            engine,
            fetcher,
            sink,
        }
    }

    #[test]
    fn test_builder_rejects_missing_seams() {
        let err = EngineBuilder::new().build().unwrap_err();
        assert!(err.to_string().contains("Frame source"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_frustration_enables_the_surface() {
        let rig = rig(Scenario::new("frown", vec![SimPhase::Frown]), false);
        let surface = rig.engine.mount_surface();

        rig.engine.start().await.unwrap();
        settle().await;

        // First sample lands immediately; the surface waits out the
        // activation delay before turning on.
        assert!(rig.engine.status().await.current_plan.recommends_assist());
        assert!(!rig.engine.stabilizer(surface).unwrap().is_enabled());

        for _ in 0..5 {
            advance(Duration::from_millis(1000)).await;
            settle().await;
        }

        let status = rig.engine.status().await;
        assert!(status.surfaces[&surface].enabled);
        assert_eq!(
            status.current_emotion.as_ref().map(|s| s.label),
            Some(EmotionLabel::Negative)
        );
        assert!(status.cycles.samples_published >= 5);
        assert_eq!(status.telemetry.emitted, rig.sink.len() as u64);
        assert!(rig.sink.len() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_forgets_the_surface() {
        let rig = rig(Scenario::new("calm", vec![SimPhase::Neutral]), false);
        let surface = rig.engine.mount_surface();

        assert!(rig.engine.unmount_surface(surface).await);
        assert!(!rig.engine.unmount_surface(surface).await);
        assert!(rig.engine.status().await.surfaces.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_retry_recovers_from_unavailable() {
        let rig = rig(Scenario::new("calm", vec![SimPhase::Neutral]), true);
        // Break the fallback tier too: no face runtime, no detection at all.
        rig.fetcher.remove("mem://landmarks/face/runtime.bin");

        rig.engine.start().await.unwrap();
        settle().await;
        assert_eq!(rig.engine.detector_state(), DetectorState::Unavailable);

        // Sampling idles rather than erroring while nothing is ready.
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(rig.engine.status().await.cycles.samples_published, 0);

        // Restore the asset; only an explicit retry leaves Unavailable.
        rig.fetcher.insert(
            "mem://landmarks/face/runtime.bin".to_string(),
            vec![1u8; 16],
        );
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(rig.engine.detector_state(), DetectorState::Unavailable);

        assert_eq!(
            rig.engine.force_retry().await,
            DetectorState::ReadyFallback
        );

        advance(Duration::from_millis(1000)).await;
        settle().await;
        let status = rig.engine.status().await;
        assert!(status.cycles.samples_published >= 1);
        assert_eq!(
            status.current_emotion.as_ref().map(|s| s.label),
            Some(EmotionLabel::Neutral)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_stabilizer_timers() {
        let rig = rig(Scenario::new("frown", vec![SimPhase::Frown]), false);
        let surface = rig.engine.mount_surface();

        rig.engine.start().await.unwrap();
        settle().await;
        advance(Duration::from_millis(1000)).await;
        settle().await;

        // The activation timer is pending; stopping must cancel it.
        rig.engine.stop().await;
        advance(Duration::from_millis(10_000)).await;
        settle().await;

        let status = rig.engine.status().await;
        assert!(!status.surfaces[&surface].enabled);
        assert!(!status.sampling_active);
    }
}
