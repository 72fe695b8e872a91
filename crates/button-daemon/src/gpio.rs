use anyhow::Context;
use button_proto::config::{GpioConfig, PullMode};
use rppal::gpio::{Gpio, InputPin, Trigger};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::DaemonEvent;
use crate::input::{forward_press, InputSource};

/// Buttons wired between a GPIO line and ground (or the supply, with
/// `PUD_DOWN`).  Each falling edge becomes a press on the configured pin
/// number.  Bounce is filtered by DaemonCore, not here.
pub struct GpioInput {
    /// (configured pin, BCM line)
    lines: Vec<(u32, u8)>,
    pull: PullMode,
    claimed: Vec<InputPin>,
}

impl GpioInput {
    pub fn new(gpio: &GpioConfig, pins: impl IntoIterator<Item = u32>) -> anyhow::Result<Self> {
        let lines = pins
            .into_iter()
            .map(|pin| {
                let line = gpio.line_for(pin).with_context(|| {
                    format!("Pin {} is not a GPIO line in {:?} mode", pin, gpio.mode)
                })?;
                Ok::<_, anyhow::Error>((pin, line))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            lines,
            pull: gpio.pull_up_down,
            claimed: Vec::new(),
        })
    }
}

impl InputSource for GpioInput {
    fn name(&self) -> &'static str {
        "gpio"
    }

    fn start(&mut self, events: mpsc::Sender<DaemonEvent>) -> anyhow::Result<()> {
        let gpio = Gpio::new().context("Failed to open the GPIO peripheral")?;

        for &(pin, line) in &self.lines {
            let raw = gpio
                .get(line)
                .with_context(|| format!("Failed to claim GPIO line {}", line))?;
            let mut input = match self.pull {
                PullMode::PudUp => raw.into_input_pullup(),
                PullMode::PudDown => raw.into_input_pulldown(),
                PullMode::PudOff => raw.into_input(),
            };

            let events = events.clone();
            input
                .set_async_interrupt(Trigger::FallingEdge, None, move |_| {
                    forward_press(&events, pin, "gpio")
                })
                .with_context(|| format!("Failed to watch GPIO line {}", line))?;

            info!(pin, line, pull = ?self.pull, "Button configured");
            self.claimed.push(input);
        }
        Ok(())
    }

    fn stop(&mut self) {
        // dropping an InputPin restores the line's previous mode and pull
        for mut input in self.claimed.drain(..) {
            if let Err(e) = input.clear_async_interrupt() {
                warn!(line = input.pin(), "Failed to clear interrupt: {}", e);
            }
        }
        info!("GPIO cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use button_proto::config::{Config, GpioMode};

    fn gpio_config(mode: GpioMode) -> GpioConfig {
        let yaml = r#"
moppy_api:
  base_url: http://localhost:8080
buttons: []
gpio:
  pull_up_down: PUD_UP
  bounce_time: 300
"#;
        let mut gpio = Config::from_yaml_str(yaml).unwrap().gpio;
        gpio.mode = mode;
        gpio
    }

    #[test]
    fn test_board_pins_resolve_to_bcm_lines() {
        let input = GpioInput::new(&gpio_config(GpioMode::Board), [11, 13]).unwrap();
        assert_eq!(input.lines, vec![(11, 17), (13, 27)]);
        assert!(input.claimed.is_empty());
    }

    #[test]
    fn test_non_gpio_pin_is_rejected_before_claiming() {
        let err = GpioInput::new(&gpio_config(GpioMode::Bcm), [17, 40])
            .err()
            .unwrap();
        assert!(err.to_string().contains("Pin 40"));
    }
}
