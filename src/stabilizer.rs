use crate::config::StabilizerConfig;
use crate::events::{AttuneEvent, EventBus};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Hysteresis controller for one adaptive surface's assistive mode.
///
/// The adaptation engine recomputes its recommendation every cycle, which
/// makes the raw signal far too jumpy to wire to the UI. This controller
/// inserts an activation delay (a brief spike never toggles anything), a
/// minimum hold once enabled, and a deactivation delay on the way out.
/// Manual override bypasses all of it.
pub struct Stabilizer {
    surface_id: Uuid,
    config: StabilizerConfig,
    bus: EventBus,
    enabled: Arc<AtomicBool>,
    enabled_at: Arc<RwLock<Option<Instant>>>,
    manual_override: Arc<RwLock<Option<bool>>>,
    activation_timer: Arc<RwLock<Option<JoinHandle<()>>>>,
    deactivation_timer: Arc<RwLock<Option<JoinHandle<()>>>>,
}

/// Point-in-time view for status surfaces.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StabilizerSnapshot {
    pub enabled: bool,
    pub manual_override: Option<bool>,
    pub activation_pending: bool,
    pub deactivation_pending: bool,
}

impl Stabilizer {
    pub fn new(surface_id: Uuid, config: StabilizerConfig, bus: EventBus) -> Self {
        Self {
            surface_id,
            config,
            bus,
            enabled: Arc::new(AtomicBool::new(false)),
            enabled_at: Arc::new(RwLock::new(None)),
            manual_override: Arc::new(RwLock::new(None)),
            activation_timer: Arc::new(RwLock::new(None)),
            deactivation_timer: Arc::new(RwLock::new(None)),
        }
    }

    pub fn surface_id(&self) -> Uuid {
        self.surface_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> StabilizerSnapshot {
        StabilizerSnapshot {
            enabled: self.is_enabled(),
            manual_override: *self.manual_override.read().await,
            activation_pending: timer_pending(&self.activation_timer).await,
            deactivation_pending: timer_pending(&self.deactivation_timer).await,
        }
    }

    /// Feed one cycle's recommendation into the hysteresis machine.
    pub async fn observe(&self, recommended: bool) {
        if self.manual_override.read().await.is_some() {
            return;
        }

        let enabled = self.is_enabled();
        if recommended {
            // A resumed recommendation rescinds any scheduled shutdown.
            cancel_timer(&self.deactivation_timer).await;

            if !enabled && !timer_pending(&self.activation_timer).await {
                self.start_activation_timer().await;
            }
        } else {
            // A lapsed recommendation rescinds a not-yet-fired activation.
            cancel_timer(&self.activation_timer).await;

            if enabled && !timer_pending(&self.deactivation_timer).await {
                self.start_deactivation_timer().await;
            }
        }
    }

    /// Force the mode on or off (Some), or return to automatic (None).
    pub async fn set_manual_override(&self, value: Option<bool>) {
        *self.manual_override.write().await = value;

        match value {
            Some(forced) => {
                cancel_timer(&self.activation_timer).await;
                cancel_timer(&self.deactivation_timer).await;

                let was = self.enabled.swap(forced, Ordering::Relaxed);
                if forced {
                    *self.enabled_at.write().await = Some(Instant::now());
                }
                if was != forced {
                    let _ = self.bus.publish(AttuneEvent::StabilizerChanged {
                        surface_id: self.surface_id,
                        enabled: forced,
                    });
                }
                info!(
                    "Surface {} assist manually forced {}",
                    self.surface_id,
                    if forced { "on" } else { "off" }
                );
            }
            None => {
                debug!("Surface {} returned to automatic control", self.surface_id);
            }
        }
    }

    /// Cancel all timers and drop held state, for surface unmount or
    /// emotion-source teardown.
    pub async fn clear(&self) {
        cancel_timer(&self.activation_timer).await;
        cancel_timer(&self.deactivation_timer).await;
        self.enabled.store(false, Ordering::Relaxed);
        *self.enabled_at.write().await = None;
        debug!("Surface {} stabilizer cleared", self.surface_id);
    }

    async fn start_activation_timer(&self) {
        let delay = Duration::from_millis(self.config.activation_delay_ms);
        let deadline = Instant::now() + delay;
        let enabled = Arc::clone(&self.enabled);
        let enabled_at = Arc::clone(&self.enabled_at);
        let bus = self.bus.clone();
        let surface_id = self.surface_id;

        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;

            enabled.store(true, Ordering::Relaxed);
            *enabled_at.write().await = Some(Instant::now());
            info!("Surface {} assist enabled", surface_id);
            let _ = bus.publish(AttuneEvent::StabilizerChanged {
                surface_id,
                enabled: true,
            });
        });

        replace_timer(&self.activation_timer, handle).await;
        debug!(
            "Surface {} activation pending in {}ms",
            self.surface_id, self.config.activation_delay_ms
        );
    }

    async fn start_deactivation_timer(&self) {
        let since_enabled = self
            .enabled_at
            .read()
            .await
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);
        let remaining_hold =
            Duration::from_millis(self.config.min_hold_ms).saturating_sub(since_enabled);
        let delay = remaining_hold + Duration::from_millis(self.config.deactivation_delay_ms);
        let deadline = Instant::now() + delay;

        let enabled = Arc::clone(&self.enabled);
        let bus = self.bus.clone();
        let surface_id = self.surface_id;

        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;

            enabled.store(false, Ordering::Relaxed);
            info!("Surface {} assist disabled", surface_id);
            let _ = bus.publish(AttuneEvent::StabilizerChanged {
                surface_id,
                enabled: false,
            });
        });

        replace_timer(&self.deactivation_timer, handle).await;
        debug!(
            "Surface {} deactivation pending in {}ms",
            self.surface_id,
            delay.as_millis()
        );
    }
}

async fn timer_pending(timer: &Arc<RwLock<Option<JoinHandle<()>>>>) -> bool {
    timer
        .read()
        .await
        .as_ref()
        .map(|handle| !handle.is_finished())
        .unwrap_or(false)
}

async fn cancel_timer(timer: &Arc<RwLock<Option<JoinHandle<()>>>>) {
    let mut timer = timer.write().await;
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

async fn replace_timer(timer: &Arc<RwLock<Option<JoinHandle<()>>>>, handle: JoinHandle<()>) {
    let mut timer = timer.write().await;
    if let Some(old) = timer.take() {
        old.abort();
    }
    *timer = Some(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttuneConfig;
    use tokio::time::advance;

    fn stabilizer() -> Stabilizer {
        Stabilizer::new(
            Uuid::new_v4(),
            AttuneConfig::default().stabilizer,
            EventBus::new(16),
        )
    }

    /// Let spawned timer tasks run after the paused clock moved.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_spike_never_enables() {
        let stab = stabilizer();

        stab.observe(true).await;
        advance(Duration::from_millis(2000)).await;
        settle().await;
        stab.observe(false).await;

        advance(Duration::from_millis(120_000)).await;
        settle().await;
        assert!(!stab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_recommendation_enables_after_delay() {
        let stab = stabilizer();

        stab.observe(true).await;
        advance(Duration::from_millis(3_999)).await;
        settle().await;
        assert!(!stab.is_enabled());

        advance(Duration::from_millis(2)).await;
        settle().await;
        assert!(stab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_recommendations_do_not_restart_the_delay() {
        let stab = stabilizer();

        stab.observe(true).await;
        advance(Duration::from_millis(3_000)).await;
        settle().await;
        // Another positive cycle mid-delay must not push the deadline out.
        stab.observe(true).await;
        advance(Duration::from_millis(1_100)).await;
        settle().await;
        assert!(stab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_hold_plus_deactivation_delay() {
        let stab = stabilizer();

        stab.observe(true).await;
        advance(Duration::from_millis(4_001)).await;
        settle().await;
        assert!(stab.is_enabled());

        // Recommendation flips off right after enabling.
        stab.observe(false).await;

        advance(Duration::from_millis(59_000)).await;
        settle().await;
        assert!(stab.is_enabled(), "disabled before the minimum hold");

        advance(Duration::from_millis(8_000)).await;
        settle().await;
        assert!(!stab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_recommendation_cancels_shutdown() {
        let stab = stabilizer();

        stab.observe(true).await;
        advance(Duration::from_millis(4_001)).await;
        settle().await;

        stab.observe(false).await;
        advance(Duration::from_millis(10_000)).await;
        settle().await;
        stab.observe(true).await;

        advance(Duration::from_millis(300_000)).await;
        settle().await;
        assert!(stab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_override_bypasses_timers() {
        let stab = stabilizer();

        stab.set_manual_override(Some(true)).await;
        assert!(stab.is_enabled());

        // Automatic signals are ignored while overridden.
        stab.observe(false).await;
        advance(Duration::from_millis(300_000)).await;
        settle().await;
        assert!(stab.is_enabled());

        stab.set_manual_override(Some(false)).await;
        assert!(!stab.is_enabled());

        // Back to automatic: the machine works again.
        stab.set_manual_override(None).await;
        stab.observe(true).await;
        advance(Duration::from_millis(4_001)).await;
        settle().await;
        assert!(stab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_everything() {
        let stab = stabilizer();

        stab.observe(true).await;
        stab.clear().await;
        advance(Duration::from_millis(120_000)).await;
        settle().await;
        assert!(!stab.is_enabled());

        let snapshot = stab.snapshot().await;
        assert!(!snapshot.activation_pending);
        assert!(!snapshot.deactivation_pending);
    }
}
