use crate::adaptation::adapt;
use crate::config::{AdaptationConfig, SamplingConfig};
use crate::detector::lifecycle::LifecycleManager;
use crate::detector::{BackendKind, EmotionSample};
use crate::events::{AttuneEvent, EventBus};
use crate::frame::FrameSource;
use crate::state::EmotionStore;
use crate::telemetry::TelemetryThrottle;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Counters for one sampling loop instance. Snapshot type for status
/// surfaces; the live values are atomics inside the loop.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleStats {
    pub cycles_completed: u64,
    pub samples_published: u64,
    /// Cycles where the backend ran but found nothing to report
    pub empty_cycles: u64,
    /// Grabs that returned nothing decodable; not counted as cycles
    pub frames_not_ready: u64,
    pub backend_errors: u64,
    pub inference_timeouts: u64,
    /// Cycle triggers dropped because one was already in flight
    pub overlaps_skipped: u64,
}

/// Cooperative detection scheduler.
///
/// One cycle grabs the newest frame, dispatches it to whichever backend the
/// lifecycle manager currently offers, publishes the result, and schedules
/// the next cycle. At most one cycle is ever in flight; a trigger that
/// lands while another cycle runs is dropped, not queued.
///
/// Cancellation is by generation counter: every activation and every
/// deactivation bumps it, and a scheduled continuation whose captured
/// generation no longer matches is a no-op. There is nothing to join on
/// shutdown; stale continuations wake once, compare, and fall through.
pub struct SamplingLoop {
    frames: Arc<dyn FrameSource>,
    lifecycle: Arc<LifecycleManager>,
    store: Arc<EmotionStore>,
    telemetry: Arc<TelemetryThrottle>,
    bus: EventBus,
    sampling: SamplingConfig,
    adaptation: AdaptationConfig,
    /// Latest quiz-performance score, fed in by the host application
    performance: RwLock<Option<f64>>,
    generation: AtomicU64,
    active: AtomicBool,
    in_flight: AtomicBool,
    cycles_completed: AtomicU64,
    samples_published: AtomicU64,
    empty_cycles: AtomicU64,
    frames_not_ready: AtomicU64,
    backend_errors: AtomicU64,
    inference_timeouts: AtomicU64,
    overlaps_skipped: AtomicU64,
}

impl SamplingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sampling: SamplingConfig,
        adaptation: AdaptationConfig,
        frames: Arc<dyn FrameSource>,
        lifecycle: Arc<LifecycleManager>,
        store: Arc<EmotionStore>,
        telemetry: Arc<TelemetryThrottle>,
        bus: EventBus,
    ) -> Self {
        Self {
            frames,
            lifecycle,
            store,
            telemetry,
            bus,
            sampling,
            adaptation,
            performance: RwLock::new(None),
            generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            cycles_completed: AtomicU64::new(0),
            samples_published: AtomicU64::new(0),
            empty_cycles: AtomicU64::new(0),
            frames_not_ready: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            inference_timeouts: AtomicU64::new(0),
            overlaps_skipped: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            samples_published: self.samples_published.load(Ordering::Relaxed),
            empty_cycles: self.empty_cycles.load(Ordering::Relaxed),
            frames_not_ready: self.frames_not_ready.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            inference_timeouts: self.inference_timeouts.load(Ordering::Relaxed),
            overlaps_skipped: self.overlaps_skipped.load(Ordering::Relaxed),
        }
    }

    /// Update the auxiliary performance signal consumed by the adaptation
    /// engine. `None` means no quiz activity to corroborate with.
    pub fn set_performance(&self, score: Option<f64>) {
        *self.performance.write() = score;
    }

    /// Start (or restart) the cycle chain. A restart supersedes the old
    /// chain: its continuations carry a stale generation and drop out.
    pub fn activate(self: &Arc<Self>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.store(false, Ordering::SeqCst);
        if self.active.swap(true, Ordering::SeqCst) {
            info!("Sampling loop restarted (generation {})", generation);
        } else {
            info!("Sampling loop activated (generation {})", generation);
        }

        let chain = Arc::clone(self);
        tokio::spawn(async move {
            chain.run_cycle(generation).await;
        });
        generation
    }

    /// Stop sampling. Continuations already scheduled wake up, see the
    /// bumped generation, and do nothing.
    pub fn deactivate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        info!("Sampling loop deactivated");
    }

    /// Run one cycle under the given generation. Public so hosts and tests
    /// can trigger an immediate cycle; the scheduled chain passes the
    /// generation it was spawned under.
    pub async fn run_cycle(self: Arc<Self>, generation: u64) {
        if generation != self.generation.load(Ordering::SeqCst) {
            trace!("Dropping cycle from superseded generation {}", generation);
            return;
        }
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("Cycle already in flight, dropping trigger");
            self.overlaps_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let delay_ms = self.execute().await;

        self.in_flight.store(false, Ordering::SeqCst);
        self.reschedule(generation, delay_ms);
    }

    /// The body of one cycle. Returns the delay before the next one.
    async fn execute(&self) -> u64 {
        let frame = match self.frames.grab().await {
            Some(frame) => frame,
            None => {
                trace!("No frame available yet");
                self.frames_not_ready.fetch_add(1, Ordering::Relaxed);
                return self.sampling.not_ready_poll_ms;
            }
        };

        if !frame.is_decodable() {
            trace!("Frame {} not decodable yet", frame.id);
            self.frames_not_ready.fetch_add(1, Ordering::Relaxed);
            return self.sampling.not_ready_poll_ms;
        }

        match self.lifecycle.active_backend().await {
            Some(backend) => {
                let budget = Duration::from_millis(self.sampling.inference_timeout_ms);
                match tokio::time::timeout(budget, backend.detect(&frame)).await {
                    Ok(Ok(Some(sample))) => {
                        debug!(
                            "Frame {}: {:?} at {:.2} via {:?}",
                            frame.id, sample.label, sample.confidence, sample.backend
                        );
                        self.samples_published.fetch_add(1, Ordering::Relaxed);
                        self.publish(sample);
                    }
                    Ok(Ok(None)) => {
                        debug!("Frame {}: nothing detected", frame.id);
                        self.empty_cycles.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        self.backend_errors.fetch_add(1, Ordering::Relaxed);
                        match backend.kind() {
                            BackendKind::Primary => {
                                error!("Primary inference failed on frame {}: {}", frame.id, e);
                                self.lifecycle.demote_primary(&e.to_string()).await;
                            }
                            BackendKind::Fallback if e.is_desync() => {
                                // The frame is abandoned; replaying it against a
                                // rebuilt runtime would reuse the stale timestamp.
                                self.lifecycle.handle_desync(&e.to_string()).await;
                            }
                            BackendKind::Fallback => {
                                error!("Fallback inference failed on frame {}: {}", frame.id, e);
                            }
                        }
                    }
                    Err(_) => {
                        warn!("Inference timed out on frame {}, skipping it", frame.id);
                        self.inference_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            None => {
                debug!(
                    "No backend ready (state {}), idling this cycle",
                    self.lifecycle.state()
                );
            }
        }

        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.sampling.interval_ms
    }

    /// The only write point for current-emotion state. Both store slots are
    /// written before any event goes out, so subscribers reading the store
    /// on EmotionUpdated see this cycle's plan, not the previous one.
    fn publish(&self, sample: EmotionSample) {
        self.store.publish_sample(sample.clone());

        let performance = *self.performance.read();
        let plan = adapt(&sample, performance, &self.adaptation);
        let plan_changed = plan != *self.store.current_plan();
        if plan_changed {
            info!("Adaptation plan now: {}", plan.summary());
            self.store.publish_plan(plan.clone());
        }

        let _ = self.bus.publish(AttuneEvent::EmotionUpdated {
            sample: sample.clone(),
        });
        if plan_changed {
            let _ = self.bus.publish(AttuneEvent::AdaptationChanged { plan });
        }

        self.telemetry.maybe_emit(&sample);
    }

    fn reschedule(self: &Arc<Self>, generation: u64, delay_ms: u64) {
        let chain = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            chain.run_cycle(generation).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::AttuneConfig;
    use crate::detector::lifecycle::DetectorState;
    use crate::detector::EmotionLabel;
    use crate::frame::VideoFrame;
    use crate::sim::{
        scripted_locations, Scenario, SimAssetFetcher, SimFrameSource, SimLandmarkEngine,
        SimModelRuntime, SimPhase, SimTelemetrySink,
    };
    use crate::telemetry::TelemetrySink;
    use async_trait::async_trait;
    use tokio::time::{advance, Duration};
    use uuid::Uuid;

    struct World {
        chain: Arc<SamplingLoop>,
        lifecycle: Arc<LifecycleManager>,
        store: Arc<EmotionStore>,
        sink: Arc<SimTelemetrySink>,
        bus: EventBus,
    }

    async fn world(
        scenario: Arc<Scenario>,
        runtime: SimModelRuntime,
        frames: Arc<dyn FrameSource>,
    ) -> World {
        let mut config = AttuneConfig::default();
        scripted_locations(&mut config);

        let bus = EventBus::new(config.system.event_bus_capacity);
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            Arc::new(SimAssetFetcher::new()),
            Arc::new(runtime),
            Arc::new(SimLandmarkEngine::new(scenario)),
            Arc::new(MonotonicClock::new()),
            bus.clone(),
        ));
        lifecycle.activate().await;

        let store = Arc::new(EmotionStore::new());
        let sink = Arc::new(SimTelemetrySink::new());
        let telemetry = Arc::new(TelemetryThrottle::new(
            config.telemetry.clone(),
            Arc::clone(&sink) as Arc<dyn TelemetrySink>,
            bus.clone(),
            Uuid::new_v4(),
        ));
        let chain = Arc::new(SamplingLoop::new(
            config.sampling.clone(),
            config.adaptation.clone(),
            frames,
            Arc::clone(&lifecycle),
            Arc::clone(&store),
            telemetry,
            bus.clone(),
        ));

        World {
            chain,
            lifecycle,
            store,
            sink,
            bus,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    /// A camera that never yields a frame; grabs hang forever.
    struct PendingSource {
        grabs: AtomicU64,
    }

    #[async_trait]
    impl FrameSource for PendingSource {
        async fn grab(&self) -> Option<VideoFrame> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_publishes_sample_plan_and_telemetry() {
        let scenario = Arc::new(Scenario::new("frown", vec![SimPhase::Frown]));
        let runtime = SimModelRuntime::new(Arc::clone(&scenario));
        let frames = Arc::new(SimFrameSource::new(Arc::clone(&scenario)));
        let w = world(scenario, runtime, frames).await;

        w.chain.activate();
        settle().await;

        let sample = w.store.current_sample().unwrap();
        assert_eq!(sample.label, EmotionLabel::Negative);
        assert_eq!(sample.backend, BackendKind::Primary);
        assert!(w.store.current_plan().recommends_assist());
        assert_eq!(w.chain.stats().samples_published, 1);
        assert_eq!(w.sink.len(), 1);

        // Next cycle lands a second sample but the telemetry window has not
        // elapsed, so the sink sees nothing new.
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(w.chain.stats().samples_published, 2);
        assert_eq!(w.sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_frames_poll_without_counting() {
        let scenario = Arc::new(Scenario::new(
            "warmup",
            vec![SimPhase::NotReady, SimPhase::NotReady, SimPhase::Neutral],
        ));
        let runtime = SimModelRuntime::new(Arc::clone(&scenario));
        let frames = Arc::new(SimFrameSource::new(Arc::clone(&scenario)));
        let w = world(scenario, runtime, frames).await;

        w.chain.activate();
        settle().await;
        assert_eq!(w.chain.stats().frames_not_ready, 1);
        assert_eq!(w.chain.stats().cycles_completed, 0);

        // The retry arrives on the short poll delay, not the full interval.
        advance(Duration::from_millis(25)).await;
        settle().await;
        assert_eq!(w.chain.stats().frames_not_ready, 2);

        advance(Duration::from_millis(25)).await;
        settle().await;
        assert_eq!(w.chain.stats().cycles_completed, 1);
        assert_eq!(
            w.store.current_sample().unwrap().label,
            EmotionLabel::Neutral
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_trigger_is_dropped() {
        let scenario = Arc::new(Scenario::new("stuck", vec![SimPhase::Neutral]));
        let runtime = SimModelRuntime::new(Arc::clone(&scenario));
        let frames = Arc::new(PendingSource {
            grabs: AtomicU64::new(0),
        });
        let w = world(scenario, runtime, Arc::clone(&frames) as Arc<dyn FrameSource>).await;

        let generation = w.chain.activate();
        settle().await;
        assert_eq!(frames.grabs.load(Ordering::SeqCst), 1);

        // The first cycle is parked inside grab; a second trigger under the
        // same generation must fall out immediately.
        Arc::clone(&w.chain).run_cycle(generation).await;
        assert_eq!(w.chain.stats().overlaps_skipped, 1);
        assert_eq!(frames.grabs.load(Ordering::SeqCst), 1);
        assert!(w.store.current_sample().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivation_orphans_scheduled_cycles() {
        let scenario = Arc::new(Scenario::new("frown", vec![SimPhase::Frown]));
        let runtime = SimModelRuntime::new(Arc::clone(&scenario));
        let frames = Arc::new(SimFrameSource::new(Arc::clone(&scenario)));
        let w = world(scenario, runtime, frames).await;

        let generation = w.chain.activate();
        settle().await;
        assert_eq!(w.chain.stats().samples_published, 1);

        w.chain.deactivate();

        // The continuation scheduled before deactivation fires and must not
        // publish; neither may a direct trigger with the stale generation.
        advance(Duration::from_millis(1000)).await;
        settle().await;
        Arc::clone(&w.chain).run_cycle(generation).await;

        assert_eq!(w.chain.stats().samples_published, 1);
        assert_eq!(w.chain.stats().cycles_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failure_demotes_without_a_sample() {
        let scenario = Arc::new(Scenario::new("frown", vec![SimPhase::Frown]));
        let runtime = SimModelRuntime::new(Arc::clone(&scenario)).with_session_failure(0);
        let frames = Arc::new(SimFrameSource::new(Arc::clone(&scenario)));
        let w = world(scenario, runtime, frames).await;

        w.chain.activate();
        settle().await;

        assert_eq!(w.lifecycle.state(), DetectorState::ReadyFallback);
        assert_eq!(w.chain.stats().backend_errors, 1);
        assert_eq!(w.chain.stats().samples_published, 0);

        // The next cycle comes out of the heuristic tier.
        advance(Duration::from_millis(1000)).await;
        settle().await;
        let sample = w.store.current_sample().unwrap();
        assert_eq!(sample.backend, BackendKind::Fallback);
        assert_eq!(sample.label, EmotionLabel::Negative);
    }

    #[tokio::test(start_paused = true)]
    async fn test_desync_rebuilds_fallback_and_abandons_the_frame() {
        let scenario = Arc::new(Scenario::new(
            "glitch",
            vec![SimPhase::Neutral, SimPhase::Desync, SimPhase::Frown],
        ));
        let runtime = SimModelRuntime::failing_load(Arc::clone(&scenario));
        let frames = Arc::new(SimFrameSource::new(Arc::clone(&scenario)));
        let w = world(scenario, runtime, frames).await;
        assert_eq!(w.lifecycle.state(), DetectorState::ReadyFallback);

        w.chain.activate();
        settle().await;
        assert_eq!(w.chain.stats().samples_published, 1);

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(w.chain.stats().backend_errors, 1);
        assert_eq!(w.chain.stats().samples_published, 1);
        assert_eq!(w.lifecycle.state(), DetectorState::ReadyFallback);

        advance(Duration::from_millis(1000)).await;
        settle().await;
        let sample = w.store.current_sample().unwrap();
        assert_eq!(sample.label, EmotionLabel::Negative);
        assert_eq!(w.chain.stats().samples_published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_plan_is_not_republished() {
        let scenario = Arc::new(Scenario::new("frown", vec![SimPhase::Frown]));
        let runtime = SimModelRuntime::new(Arc::clone(&scenario));
        let frames = Arc::new(SimFrameSource::new(Arc::clone(&scenario)));
        let w = world(scenario, runtime, frames).await;
        let mut receiver = w.bus.subscribe();

        w.chain.activate();
        settle().await;
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(w.chain.stats().samples_published, 2);

        let mut emotion_events = 0;
        let mut plan_events = 0;
        while let Ok(event) = receiver.try_recv() {
            match event {
                AttuneEvent::EmotionUpdated { .. } => emotion_events += 1,
                AttuneEvent::AdaptationChanged { .. } => plan_events += 1,
                _ => {}
            }
        }
        assert_eq!(emotion_events, 2);
        assert_eq!(plan_events, 1);
    }
}
