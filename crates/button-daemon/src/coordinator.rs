/// PressCoordinator: turns one "pin pressed" event into one playback action.
///
/// Per press:
///
/// ```text
///   claim pin ──busy──▶ Busy (dropped)
///      │
///   lookup ──none──▶ UnknownPin
///      │
///   remote status
///      ├── pin active && remote playing its file ──▶ pause
///      └── otherwise ──▶ [stop + clear if anything active] → load → play
/// ```
///
/// Presses on different pins run concurrently.  A press on a pin that is
/// still being handled is rejected, not queued.  Remote failures never
/// propagate: they are logged and leave the local view unchanged.
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use button_proto::config::ButtonConfig;
use button_proto::protocol::ControllerState;
use tracing::{debug, error, info, warn};

use crate::client::PlaybackClient;
use crate::registry::ButtonRegistry;

/// What a single `handle_press` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    /// The same pin was already being handled; nothing was sent.
    Busy,
    /// No button is configured on this pin; nothing was sent.
    UnknownPin,
    Played,
    LoadFailed,
    /// Song loaded but the service refused to start it.
    PlayFailed,
    Paused,
    PauseFailed,
}

#[derive(Debug, Default)]
struct PressState {
    /// Pins with a `handle_press` in flight.
    processing: BTreeSet<u32>,
    /// Pins we believe are the song currently playing on the service.
    active: BTreeSet<u32>,
}

/// Membership of one pin in the processing set.  Dropping it releases the
/// pin, so every return path (and a cancelled task) frees the button.
struct PinClaim<'a> {
    state: &'a Mutex<PressState>,
    pin: u32,
}

impl Drop for PinClaim<'_> {
    fn drop(&mut self) {
        lock(self.state).processing.remove(&self.pin);
    }
}

fn lock(state: &Mutex<PressState>) -> MutexGuard<'_, PressState> {
    // Both sets stay consistent across a panic, so a poisoned lock is usable.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PressCoordinator<C> {
    client: Arc<C>,
    registry: ButtonRegistry,
    state: Mutex<PressState>,
}

impl<C: PlaybackClient> PressCoordinator<C> {
    pub fn new(client: Arc<C>, registry: ButtonRegistry) -> Self {
        Self {
            client,
            registry,
            state: Mutex::new(PressState::default()),
        }
    }

    pub fn registry(&self) -> &ButtonRegistry {
        &self.registry
    }

    /// Check-and-insert under one lock acquisition.
    fn try_claim(&self, pin: u32) -> Option<PinClaim<'_>> {
        if !lock(&self.state).processing.insert(pin) {
            return None;
        }
        Some(PinClaim {
            state: &self.state,
            pin,
        })
    }

    pub async fn handle_press(&self, pin: u32) -> PressOutcome {
        let Some(_claim) = self.try_claim(pin) else {
            debug!(pin, "Button is already being processed, ignoring");
            return PressOutcome::Busy;
        };

        let Some(button) = self.registry.lookup(pin) else {
            warn!(pin, "No configuration found for pin");
            return PressOutcome::UnknownPin;
        };

        info!(pin, "Button pressed");

        let status = self.client.status().await;
        let is_active = lock(&self.state).active.contains(&pin);

        if is_active && status.is_playing_file(&button.file) {
            self.pause_song(pin).await
        } else {
            self.play_song(button).await
        }
    }

    async fn play_song(&self, button: &ButtonConfig) -> PressOutcome {
        let pin = button.pin;

        // The service plays one stream; whatever was active goes first.
        let had_active = !lock(&self.state).active.is_empty();
        if had_active {
            if !self.client.stop().await {
                warn!(pin, "Stop before switching songs failed");
            }
            lock(&self.state).active.clear();
        }

        if !self.client.load_song(&button.file).await {
            error!(pin, file = %button.file, "Failed to load song");
            return PressOutcome::LoadFailed;
        }

        if !self.client.play().await {
            error!(pin, file = %button.file, "Failed to start playback");
            return PressOutcome::PlayFailed;
        }

        lock(&self.state).active.insert(pin);
        info!(pin, file = %button.file, "Started playing");
        PressOutcome::Played
    }

    async fn pause_song(&self, pin: u32) -> PressOutcome {
        if self.client.pause().await {
            lock(&self.state).active.remove(&pin);
            info!(pin, "Paused playback");
            PressOutcome::Paused
        } else {
            // service state unknown; keep believing it plays
            error!(pin, "Failed to pause playback");
            PressOutcome::PauseFailed
        }
    }

    /// Stop the service if anything is active, then forget all active pins
    /// whether or not the stop went through.
    pub async fn stop_all(&self) {
        let had_active = !lock(&self.state).active.is_empty();
        if !had_active {
            return;
        }
        if !self.client.stop().await {
            warn!("Stop failed; clearing playing state anyway");
        }
        lock(&self.state).active.clear();
        info!("Stopped all playback");
    }

    /// Owned copy of the active set.
    pub fn playing_pins(&self) -> BTreeSet<u32> {
        lock(&self.state).active.clone()
    }

    #[cfg(test)]
    pub fn is_processing(&self, pin: u32) -> bool {
        lock(&self.state).processing.contains(&pin)
    }

    pub fn snapshot(&self) -> ControllerState {
        let state = lock(&self.state);
        ControllerState {
            buttons: self.registry.buttons().cloned().collect(),
            playing_pins: state.active.iter().copied().collect(),
            processing_pins: state.processing.iter().copied().collect(),
        }
    }
}
