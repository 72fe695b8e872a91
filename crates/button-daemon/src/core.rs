/// DaemonCore: the loop every input surface feeds.
///
/// Socket and HTTP handlers turn requests into `DaemonEvent`s.  Presses pass
/// the bounce filter and are then handed to the coordinator on their own
/// task, so a slow remote round-trip on one button never holds up another.
/// The coordinator does its own per-pin serialization.
///
/// After each handled press or stop, `BroadcastMessage::StateUpdated` goes
/// out so connected clients can refresh.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::client::PlaybackClient;
use crate::coordinator::{PressCoordinator, PressOutcome};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// A button edge.  `source` names the surface it came in on.
    Press { pin: u32, source: &'static str },
    StopAll,
    Shutdown,
}

// ── EdgeFilter ────────────────────────────────────────────────────────────────

/// Drops a press that arrives within `window` of the last accepted press on
/// the same pin.  Only the pins given at construction are tracked; any
/// other pin passes straight through.
#[derive(Debug)]
pub struct EdgeFilter {
    window: Duration,
    last_accepted: HashMap<u32, Option<Instant>>,
}

impl EdgeFilter {
    pub fn new(window: Duration, pins: impl IntoIterator<Item = u32>) -> Self {
        Self {
            window,
            last_accepted: pins.into_iter().map(|pin| (pin, None)).collect(),
        }
    }

    pub fn accept(&mut self, pin: u32, now: Instant) -> bool {
        let Some(slot) = self.last_accepted.get_mut(&pin) else {
            return true;
        };
        if let Some(prev) = slot {
            if now.saturating_duration_since(*prev) < self.window {
                return false;
            }
        }
        *slot = Some(now);
        true
    }
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

/// How long shutdown waits for in-flight presses when no request timeout
/// bounds them.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct DaemonCore<C> {
    coordinator: Arc<PressCoordinator<C>>,
    filter: EdgeFilter,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// In-flight press and stop tasks.
    tasks: JoinSet<()>,
    drain_grace: Duration,
}

impl<C: PlaybackClient + 'static> DaemonCore<C> {
    pub fn new(
        coordinator: Arc<PressCoordinator<C>>,
        bounce_window: Duration,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let pins: Vec<u32> = coordinator.registry().buttons().map(|b| b.pin).collect();
        Self {
            coordinator,
            filter: EdgeFilter::new(bounce_window, pins),
            broadcast_tx,
            tasks: JoinSet::new(),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Bound on each shutdown step: waiting for presses, then the final stop.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Run until a `Shutdown` event arrives or every sender is gone, then
    /// let in-flight presses finish and stop playback.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("DaemonCore: event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("DaemonCore: shutdown requested");
                        break;
                    }
                    Some(DaemonEvent::Press { pin, source }) => {
                        self.dispatch_press(pin, source);
                    }
                    Some(DaemonEvent::StopAll) => {
                        self.dispatch_stop_all();
                    }
                },

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("DaemonCore: press task failed: {}", e);
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    fn dispatch_press(&mut self, pin: u32, source: &'static str) {
        if !self.filter.accept(pin, Instant::now()) {
            debug!(pin, source, "press inside bounce window, dropped");
            return;
        }
        debug!(pin, source, "press received");

        let coordinator = Arc::clone(&self.coordinator);
        let broadcast_tx = self.broadcast_tx.clone();
        self.tasks.spawn(async move {
            let outcome = coordinator.handle_press(pin).await;
            debug!(pin, ?outcome, playing = ?coordinator.playing_pins(), "press handled");
            if outcome != PressOutcome::Busy {
                // no receivers is fine
                let _ = broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
        });
    }

    fn dispatch_stop_all(&mut self) {
        let coordinator = Arc::clone(&self.coordinator);
        let broadcast_tx = self.broadcast_tx.clone();
        self.tasks.spawn(async move {
            coordinator.stop_all().await;
            let _ = broadcast_tx.send(BroadcastMessage::StateUpdated);
        });
    }

    async fn cleanup(&mut self) {
        if !self.tasks.is_empty() {
            info!(
                "DaemonCore: waiting for {} in-flight press(es)",
                self.tasks.len()
            );
        }
        if time::timeout(self.drain_grace, drain(&mut self.tasks)).await.is_err() {
            // aborting drops each PinClaim, so the pins are released
            warn!(
                "DaemonCore: {} press(es) still running after {:?}, aborting",
                self.tasks.len(),
                self.drain_grace
            );
            self.tasks.abort_all();
            drain(&mut self.tasks).await;
        }
        if time::timeout(self.drain_grace, self.coordinator.stop_all())
            .await
            .is_err()
        {
            warn!(
                "DaemonCore: final stop did not finish within {:?}",
                self.drain_grace
            );
        }
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Err(e) if !e.is_cancelled() => error!("DaemonCore: press task failed: {}", e),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::{Call, MockClient};
    use crate::registry::ButtonRegistry;
    use button_proto::config::ButtonConfig;

    fn coordinator(client: Arc<MockClient>) -> Arc<PressCoordinator<MockClient>> {
        let registry = ButtonRegistry::from_buttons([
            ButtonConfig {
                pin: 1,
                file: "/midi/a.mid".to_string(),
            },
            ButtonConfig {
                pin: 2,
                file: "/midi/b.mid".to_string(),
            },
        ]);
        Arc::new(PressCoordinator::new(client, registry))
    }

    fn press(pin: u32) -> DaemonEvent {
        DaemonEvent::Press {
            pin,
            source: "test",
        }
    }

    #[test]
    fn test_edge_filter_window() {
        let mut filter = EdgeFilter::new(Duration::from_millis(300), [1, 2]);
        let t0 = Instant::now();
        assert!(filter.accept(1, t0));
        assert!(!filter.accept(1, t0 + Duration::from_millis(100)));
        // other pins are independent
        assert!(filter.accept(2, t0 + Duration::from_millis(100)));
        assert!(filter.accept(1, t0 + Duration::from_millis(300)));
        // rejected presses do not extend the window
        assert!(!filter.accept(1, t0 + Duration::from_millis(450)));
        assert!(filter.accept(1, t0 + Duration::from_millis(650)));
    }

    #[test]
    fn test_edge_filter_zero_window_accepts_all() {
        let mut filter = EdgeFilter::new(Duration::ZERO, [1]);
        let t0 = Instant::now();
        assert!(filter.accept(1, t0));
        assert!(filter.accept(1, t0));
    }

    #[test]
    fn test_edge_filter_ignores_unconfigured_pins() {
        let mut filter = EdgeFilter::new(Duration::from_millis(300), [1]);
        let t0 = Instant::now();
        for pin in [500, 501, u32::MAX, 500] {
            assert!(filter.accept(pin, t0));
        }
        assert_eq!(filter.last_accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_run_dispatches_and_stops_on_shutdown() {
        let client = Arc::new(MockClient::new());
        let coordinator = coordinator(client.clone());
        let (broadcast_tx, mut broadcast_rx) = broadcast::channel(16);
        let core = DaemonCore::new(coordinator.clone(), Duration::from_millis(300), broadcast_tx);

        let (tx, rx) = mpsc::channel(8);
        tx.send(press(1)).await.unwrap();
        // bounce
        tx.send(press(1)).await.unwrap();
        tx.send(DaemonEvent::Shutdown).await.unwrap();

        core.run(rx).await.unwrap();

        assert_eq!(client.count(&Call::Load("/midi/a.mid".into())), 1);
        assert_eq!(client.calls().last(), Some(&Call::Stop));
        assert!(coordinator.playing_pins().is_empty());
        assert!(matches!(
            broadcast_rx.try_recv(),
            Ok(BroadcastMessage::StateUpdated)
        ));
    }

    #[tokio::test]
    async fn test_stop_all_event() {
        let client = Arc::new(MockClient::new());
        let coordinator = coordinator(client.clone());
        coordinator.handle_press(2).await;
        client.clear_calls();

        let (broadcast_tx, _) = broadcast::channel(16);
        let core = DaemonCore::new(coordinator.clone(), Duration::ZERO, broadcast_tx);
        let (tx, rx) = mpsc::channel(8);
        tx.send(DaemonEvent::StopAll).await.unwrap();
        drop(tx);

        core.run(rx).await.unwrap();

        // the shutdown stop_all finds nothing left to stop
        assert_eq!(client.calls(), vec![Call::Stop]);
        assert!(coordinator.playing_pins().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_press_stuck_on_remote() {
        let (client, mut entered) = MockClient::gated();
        let client = Arc::new(client);
        let coordinator = coordinator(client.clone());
        let (broadcast_tx, _) = broadcast::channel(16);
        let core = DaemonCore::new(coordinator.clone(), Duration::ZERO, broadcast_tx)
            .with_drain_grace(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel(8);
        let running = tokio::spawn(core.run(rx));
        tx.send(press(1)).await.unwrap();
        // status() is now parked and is never released
        entered.recv().await.unwrap();
        assert!(coordinator.is_processing(1));
        tx.send(DaemonEvent::Shutdown).await.unwrap();

        let finished = time::timeout(Duration::from_secs(3), running).await;
        assert!(matches!(finished, Ok(Ok(Ok(())))));
        assert!(!coordinator.is_processing(1));
        assert!(coordinator.playing_pins().is_empty());
        assert_eq!(client.calls(), vec![Call::Status]);
    }

    #[tokio::test]
    async fn test_unknown_pin_event_is_harmless() {
        let client = Arc::new(MockClient::new());
        let coordinator = coordinator(client.clone());
        let (broadcast_tx, _) = broadcast::channel(16);
        let core = DaemonCore::new(coordinator.clone(), Duration::ZERO, broadcast_tx);

        let (tx, rx) = mpsc::channel(8);
        tx.send(press(77)).await.unwrap();
        tx.send(DaemonEvent::Shutdown).await.unwrap();
        core.run(rx).await.unwrap();

        assert!(client.calls().is_empty());
        assert!(!coordinator.is_processing(77));
    }
}
