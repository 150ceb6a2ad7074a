use crate::connection::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use termpilot_config::IdleConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleSettings {
    pub idle_timeout: Duration,
    pub warning_time: Duration,
}

impl IdleSettings {
    pub fn new(idle_timeout: Duration, warning_time: Duration) -> Self {
        Self {
            idle_timeout,
            warning_time,
        }
    }

    fn warn_at(&self) -> Duration {
        self.idle_timeout.saturating_sub(self.warning_time)
    }
}

impl From<&IdleConfig> for IdleSettings {
    fn from(cfg: &IdleConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.idle_timeout_ms),
            Duration::from_millis(cfg.warning_time_ms),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchdogEvent {
    Warning {
        connection_id: ConnectionId,
        remaining: Duration,
        message: String,
    },
    Timeout {
        connection_id: ConnectionId,
        idle: Duration,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleStatus {
    pub idle_time: Duration,
    pub remaining_time: Duration,
    pub will_timeout_soon: bool,
    pub paused: bool,
    pub idle_timeout: Duration,
    pub warning_time: Duration,
}

struct WatchEntry {
    settings: IdleSettings,
    last_activity: Instant,
    paused: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every rearm; a timer whose generation is stale does nothing.
    generation: u64,
}

impl WatchEntry {
    fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Per-connection idle timers. Warning and timeout notices are delivered on
/// the receiver returned by [`IdleWatchdog::new`].
#[derive(Clone)]
pub struct IdleWatchdog {
    entries: Arc<Mutex<HashMap<ConnectionId, WatchEntry>>>,
    defaults: IdleSettings,
    events: mpsc::UnboundedSender<WatchdogEvent>,
}

impl IdleWatchdog {
    pub fn new(defaults: IdleSettings) -> (Self, mpsc::UnboundedReceiver<WatchdogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watchdog = Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            defaults,
            events: tx,
        };
        (watchdog, rx)
    }

    /// Starts watching `id`, replacing any previous timers for it.
    pub fn init_connection(&self, id: &str, settings: Option<IdleSettings>) {
        let mut entries = self.entries.lock();
        let generation = match entries.remove(id) {
            Some(mut old) => {
                old.stop();
                old.generation + 1
            }
            None => 0,
        };
        let mut entry = WatchEntry {
            settings: settings.unwrap_or(self.defaults),
            last_activity: Instant::now(),
            paused: false,
            timer: None,
            generation,
        };
        self.schedule(id, &mut entry);
        entries.insert(id.to_string(), entry);
        debug!(connection_id = %id, "idle watch started");
    }

    pub fn update_activity(&self, id: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        entry.last_activity = Instant::now();
        if !entry.paused {
            self.schedule(id, entry);
        }
    }

    pub fn pause_connection(&self, id: &str) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.stop();
            entry.paused = true;
            debug!(connection_id = %id, "idle watch paused");
        }
    }

    pub fn resume_connection(&self, id: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        entry.paused = false;
        entry.last_activity = Instant::now();
        self.schedule(id, entry);
        debug!(connection_id = %id, "idle watch resumed");
    }

    pub fn remove_connection(&self, id: &str) {
        if let Some(mut entry) = self.entries.lock().remove(id) {
            entry.stop();
        }
    }

    pub fn connection_status(&self, id: &str) -> Option<IdleStatus> {
        let entries = self.entries.lock();
        let entry = entries.get(id)?;
        let idle_time = entry.last_activity.elapsed();
        let remaining_time = entry.settings.idle_timeout.saturating_sub(idle_time);
        Some(IdleStatus {
            idle_time,
            remaining_time,
            will_timeout_soon: !entry.paused
                && !remaining_time.is_zero()
                && remaining_time <= entry.settings.warning_time,
            paused: entry.paused,
            idle_timeout: entry.settings.idle_timeout,
            warning_time: entry.settings.warning_time,
        })
    }

    pub fn is_watching(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn shutdown(&self) {
        for (_, mut entry) in self.entries.lock().drain() {
            entry.stop();
        }
    }

    fn schedule(&self, id: &str, entry: &mut WatchEntry) {
        entry.stop();
        entry.generation += 1;
        let generation = entry.generation;
        let settings = entry.settings;
        let id = id.to_string();
        let entries = Arc::clone(&self.entries);
        let events = self.events.clone();

        entry.timer = Some(tokio::spawn(async move {
            let warn_at = settings.warn_at();
            if !settings.warning_time.is_zero() && settings.warning_time < settings.idle_timeout {
                tokio::time::sleep(warn_at).await;
                let _ = events.send(WatchdogEvent::Warning {
                    connection_id: id.clone(),
                    remaining: settings.warning_time,
                    message: format!(
                        "No activity detected, disconnecting in {}",
                        human_duration(settings.warning_time)
                    ),
                });
                tokio::time::sleep(settings.warning_time).await;
            } else {
                tokio::time::sleep(settings.idle_timeout).await;
            }

            let idle = {
                let mut entries = entries.lock();
                match entries.get_mut(&id) {
                    Some(entry) if entry.generation == generation => {
                        entry.timer = None;
                        entry.last_activity.elapsed()
                    }
                    _ => return,
                }
            };
            info!(connection_id = %id, idle_ms = idle.as_millis() as u64, "idle timeout");
            let _ = events.send(WatchdogEvent::Timeout {
                connection_id: id,
                idle,
                message: format!(
                    "Disconnected after {} of inactivity",
                    human_duration(settings.idle_timeout)
                ),
            });
        }));
    }
}

fn human_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        return format!("{ms} ms");
    }
    if ms < 60_000 {
        return if ms % 1000 == 0 {
            format!("{} s", ms / 1000)
        } else {
            format!("{:.1} s", ms as f64 / 1000.0)
        };
    }
    let secs = (ms + 500) / 1000;
    match (secs / 60, secs % 60) {
        (m, 0) => format!("{m} min"),
        (m, s) => format!("{m} min {s} s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> IdleSettings {
        IdleSettings::new(Duration::from_millis(1000), Duration::from_millis(300))
    }

    fn assert_near(actual: Duration, expected_ms: u64) {
        let ms = actual.as_millis() as u64;
        assert!(
            (expected_ms..expected_ms + 5).contains(&ms),
            "expected ~{expected_ms} ms, got {ms} ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn warns_then_times_out() {
        let (watchdog, mut rx) = IdleWatchdog::new(settings());
        let start = Instant::now();
        watchdog.init_connection("a", None);

        match rx.recv().await.unwrap() {
            WatchdogEvent::Warning {
                connection_id,
                remaining,
                message,
            } => {
                assert_eq!(connection_id, "a");
                assert_eq!(remaining, Duration::from_millis(300));
                assert_eq!(message, "No activity detected, disconnecting in 300 ms");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_near(start.elapsed(), 700);

        match rx.recv().await.unwrap() {
            WatchdogEvent::Timeout { idle, message, .. } => {
                assert_near(idle, 1000);
                assert_eq!(message, "Disconnected after 1 s of inactivity");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_near(start.elapsed(), 1000);
    }

    #[test]
    fn durations_read_naturally() {
        assert_eq!(human_duration(Duration::from_millis(300)), "300 ms");
        assert_eq!(human_duration(Duration::from_millis(1000)), "1 s");
        assert_eq!(human_duration(Duration::from_millis(1500)), "1.5 s");
        assert_eq!(human_duration(Duration::from_secs(90)), "1 min 30 s");
        assert_eq!(human_duration(Duration::from_secs(600)), "10 min");
    }

    #[tokio::test(start_paused = true)]
    async fn activity_restarts_both_timers() {
        let (watchdog, mut rx) = IdleWatchdog::new(settings());
        let start = Instant::now();
        watchdog.init_connection("a", None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        watchdog.update_activity("a");

        assert!(matches!(rx.recv().await, Some(WatchdogEvent::Warning { .. })));
        assert_near(start.elapsed(), 1200);
        assert!(matches!(rx.recv().await, Some(WatchdogEvent::Timeout { .. })));
        assert_near(start.elapsed(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_connections_never_fire() {
        let (watchdog, mut rx) = IdleWatchdog::new(settings());
        watchdog.init_connection("a", None);
        watchdog.pause_connection("a");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(watchdog.connection_status("a").unwrap().paused);

        let resumed = Instant::now();
        watchdog.resume_connection("a");
        assert!(matches!(rx.recv().await, Some(WatchdogEvent::Warning { .. })));
        assert_near(resumed.elapsed(), 700);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_without_side_effects() {
        let (watchdog, mut rx) = IdleWatchdog::new(settings());
        watchdog.init_connection("a", None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = watchdog.connection_status("a").unwrap();
        assert_near(status.idle_time, 200);
        assert!(status.remaining_time <= Duration::from_millis(800));
        assert!(status.remaining_time > Duration::from_millis(790));
        assert!(!status.will_timeout_soon);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = watchdog.connection_status("a").unwrap();
        assert!(status.will_timeout_soon);
        assert!(matches!(rx.recv().await, Some(WatchdogEvent::Warning { .. })));
        assert!(watchdog.connection_status("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_connections_are_silent() {
        let (watchdog, mut rx) = IdleWatchdog::new(settings());
        watchdog.init_connection("a", None);
        watchdog.remove_connection("a");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert!(!watchdog.is_watching("a"));
    }
}
