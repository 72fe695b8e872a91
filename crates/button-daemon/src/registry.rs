use std::collections::BTreeMap;

use button_proto::config::ButtonConfig;
use tracing::info;

/// Pin → configured song.  Filled once at startup and read-only after that.
#[derive(Debug, Default, Clone)]
pub struct ButtonRegistry {
    buttons: BTreeMap<u32, ButtonConfig>,
}

impl ButtonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buttons<I>(buttons: I) -> Self
    where
        I: IntoIterator<Item = ButtonConfig>,
    {
        let mut registry = Self::new();
        for button in buttons {
            registry.add(button);
        }
        registry
    }

    /// Insert or replace the mapping for `button.pin`.  Pin uniqueness is the
    /// config loader's job; a repeated pin simply overwrites.
    pub fn add(&mut self, button: ButtonConfig) {
        info!(pin = button.pin, file = %button.file, "Added button config");
        self.buttons.insert(button.pin, button);
    }

    pub fn lookup(&self, pin: u32) -> Option<&ButtonConfig> {
        self.buttons.get(&pin)
    }

    /// Buttons in pin order.
    pub fn buttons(&self) -> impl Iterator<Item = &ButtonConfig> {
        self.buttons.values()
    }

    pub fn len(&self) -> usize {
        self.buttons.len()
    }
}
