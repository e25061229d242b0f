use crate::config::TelemetryConfig;
use crate::detector::{BackendKind, EmotionLabel, EmotionSample};
use crate::error::Result;
use crate::events::{AttuneEvent, EventBus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// One emission to the persistence collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub user_id: Uuid,
    pub material_id: Option<Uuid>,
    pub label: EmotionLabel,
    pub confidence: f64,
    pub backend: BackendKind,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence seam for emotion telemetry. Implementations talk to the
/// learning platform's collector; errors are the caller's to swallow.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn log_emotion(&self, record: TelemetryRecord) -> Result<()>;
}

/// Running emission counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TelemetryStats {
    pub emitted: u64,
    pub suppressed: u64,
    pub failed: u64,
}

/// Rate-limited, fire-and-forget forwarding of emotion samples.
///
/// Two gates: a per-backend confidence floor (the heuristic backend is
/// allowed to log at lower confidence since it is itself a lower-precision
/// signal), and a minimum interval per surface. Sink failures are counted
/// and otherwise swallowed; the detection loop never notices them.
pub struct TelemetryThrottle {
    config: TelemetryConfig,
    sink: Arc<dyn TelemetrySink>,
    bus: EventBus,
    user_id: Uuid,
    material_id: RwLock<Option<Uuid>>,
    last_dispatch: Mutex<Option<Instant>>,
    emitted: Arc<AtomicU64>,
    suppressed: AtomicU64,
    failed: Arc<AtomicU64>,
}

impl TelemetryThrottle {
    pub fn new(
        config: TelemetryConfig,
        sink: Arc<dyn TelemetrySink>,
        bus: EventBus,
        user_id: Uuid,
    ) -> Self {
        Self {
            config,
            sink,
            bus,
            user_id,
            material_id: RwLock::new(None),
            last_dispatch: Mutex::new(None),
            emitted: Arc::new(AtomicU64::new(0)),
            suppressed: AtomicU64::new(0),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Associate subsequent emissions with a learning material.
    pub fn set_material(&self, material_id: Option<Uuid>) {
        *self.material_id.write() = material_id;
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Forward the sample if it clears the confidence floor and the rate
    /// window. Never blocks and never fails.
    pub fn maybe_emit(&self, sample: &EmotionSample) {
        if !self.config.enabled {
            return;
        }

        let floor = match sample.backend {
            BackendKind::Primary => self.config.primary_confidence_floor,
            BackendKind::Fallback => self.config.fallback_confidence_floor,
        };
        if sample.confidence < floor {
            trace!(
                "Telemetry suppressed: confidence {:.2} under {:.2} floor",
                sample.confidence,
                floor
            );
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The window is claimed at dispatch time, not on sink success, so a
        // slow or failing sink cannot raise the emission rate.
        {
            let mut last = self.last_dispatch.lock();
            let window = Duration::from_millis(self.config.min_interval_ms);
            if let Some(at) = *last {
                if at.elapsed() < window {
                    trace!("Telemetry suppressed: rate window not elapsed");
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let record = TelemetryRecord {
            user_id: self.user_id,
            material_id: *self.material_id.read(),
            label: sample.label,
            confidence: sample.confidence,
            backend: sample.backend,
            recorded_at: Utc::now(),
        };

        let sink = Arc::clone(&self.sink);
        let bus = self.bus.clone();
        let emitted = Arc::clone(&self.emitted);
        let failed = Arc::clone(&self.failed);

        tokio::spawn(async move {
            let label = record.label;
            let confidence = record.confidence;
            match sink.log_emotion(record).await {
                Ok(()) => {
                    emitted.fetch_add(1, Ordering::Relaxed);
                    let _ = bus.publish(AttuneEvent::TelemetryEmitted {
                        label: label.as_str().to_string(),
                        confidence,
                    });
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    debug!("Telemetry sink failed (ignored): {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttuneConfig;
    use crate::error::AttuneError;
    use tokio::time::advance;

    struct CaptureSink {
        records: Mutex<Vec<TelemetryRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl TelemetrySink for CaptureSink {
        async fn log_emotion(&self, record: TelemetryRecord) -> Result<()> {
            if self.fail {
                return Err(AttuneError::system("collector offline"));
            }
            self.records.lock().push(record);
            Ok(())
        }
    }

    fn throttle(fail: bool) -> (TelemetryThrottle, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink {
            records: Mutex::new(Vec::new()),
            fail,
        });
        let throttle = TelemetryThrottle::new(
            AttuneConfig::default().telemetry,
            Arc::clone(&sink) as Arc<dyn TelemetrySink>,
            EventBus::new(16),
            Uuid::new_v4(),
        );
        (throttle, sink)
    }

    fn sample(backend: BackendKind, confidence: f64) -> EmotionSample {
        EmotionSample::new(EmotionLabel::Negative, confidence, 50, backend)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_specific_confidence_floors() {
        let (throttle, sink) = throttle(false);

        // 0.30 is under the primary floor but over the fallback floor.
        throttle.maybe_emit(&sample(BackendKind::Primary, 0.30));
        settle().await;
        assert!(sink.records.lock().is_empty());
        assert_eq!(throttle.stats().suppressed, 1);

        throttle.maybe_emit(&sample(BackendKind::Fallback, 0.30));
        settle().await;
        assert_eq!(sink.records.lock().len(), 1);
        assert_eq!(throttle.stats().emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_suppresses_rapid_emissions() {
        let (throttle, sink) = throttle(false);

        throttle.maybe_emit(&sample(BackendKind::Primary, 0.9));
        throttle.maybe_emit(&sample(BackendKind::Primary, 0.9));
        settle().await;
        assert_eq!(sink.records.lock().len(), 1);
        assert_eq!(throttle.stats().suppressed, 1);

        advance(Duration::from_millis(5_001)).await;
        throttle.maybe_emit(&sample(BackendKind::Primary, 0.9));
        settle().await;
        assert_eq!(sink.records.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failures_are_swallowed_and_counted() {
        let (throttle, _sink) = throttle(true);

        throttle.maybe_emit(&sample(BackendKind::Primary, 0.9));
        settle().await;
        assert_eq!(throttle.stats().failed, 1);
        assert_eq!(throttle.stats().emitted, 0);

        // The throttle keeps working after failures.
        advance(Duration::from_millis(5_001)).await;
        throttle.maybe_emit(&sample(BackendKind::Primary, 0.9));
        settle().await;
        assert_eq!(throttle.stats().failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_carries_the_material_binding() {
        let (throttle, sink) = throttle(false);
        let material = Uuid::new_v4();
        throttle.set_material(Some(material));

        throttle.maybe_emit(&sample(BackendKind::Fallback, 0.8));
        settle().await;

        let records = sink.records.lock();
        assert_eq!(records[0].material_id, Some(material));
        assert_eq!(records[0].backend, BackendKind::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_telemetry_emits_nothing() {
        let mut config = AttuneConfig::default().telemetry;
        config.enabled = false;
        let sink = Arc::new(CaptureSink {
            records: Mutex::new(Vec::new()),
            fail: false,
        });
        let throttle = TelemetryThrottle::new(
            config,
            Arc::clone(&sink) as Arc<dyn TelemetrySink>,
            EventBus::new(16),
            Uuid::new_v4(),
        );

        throttle.maybe_emit(&sample(BackendKind::Primary, 0.99));
        settle().await;
        assert!(sink.records.lock().is_empty());
        assert_eq!(throttle.stats().emitted, 0);
    }
}
