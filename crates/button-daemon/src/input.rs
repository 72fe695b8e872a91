/// Physical input sources.
///
/// An `InputSource` claims hardware at `start` and pushes presses into the
/// DaemonCore channel from whatever thread its driver calls back on.
/// `ActiveInputs` owns the started sources and releases them, last started
/// first, when it is dropped.
use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::DaemonEvent;

pub trait InputSource: Send {
    fn name(&self) -> &'static str;

    /// Claim the inputs and begin delivering presses into `events`.
    fn start(&mut self, events: mpsc::Sender<DaemonEvent>) -> anyhow::Result<()>;

    /// Release everything `start` claimed.
    fn stop(&mut self);
}

/// Queue a press without blocking the caller, which may be a driver's
/// interrupt thread.  A full queue drops the press.
pub fn forward_press(events: &mpsc::Sender<DaemonEvent>, pin: u32, source: &'static str) {
    match events.try_send(DaemonEvent::Press { pin, source }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(pin, source, "Event queue full, press dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

pub struct ActiveInputs {
    sources: Vec<Box<dyn InputSource>>,
}

impl ActiveInputs {
    /// Start every source in order.  If one fails, those already started are
    /// released before the error is returned.
    pub fn start(
        sources: Vec<Box<dyn InputSource>>,
        events: &mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let mut active = Self {
            sources: Vec::with_capacity(sources.len()),
        };
        for mut source in sources {
            source
                .start(events.clone())
                .with_context(|| format!("Failed to start {} input", source.name()))?;
            info!(source = source.name(), "Input source started");
            active.sources.push(source);
        }
        Ok(active)
    }
}

impl Drop for ActiveInputs {
    fn drop(&mut self) {
        while let Some(mut source) = self.sources.pop() {
            source.stop();
            info!(source = source.name(), "Input source released");
        }
    }
}
