use std::fmt::Write as _;

use anyhow::Context;
use button_proto::config::{LogStyle, LoggingConfig};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

use crate::BroadcastMessage;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Forwards WARN and ERROR events to connected socket clients as one line:
/// `HH:MM:SS LEVEL [pin N] message key=value...`.
pub struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    pub fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut line = LogLine::default();
        event.record(&mut line);

        let mut message = format!("{} {}", chrono::Local::now().format("%H:%M:%S"), level);
        if let Some(pin) = line.pin {
            let _ = write!(message, " [pin {}]", pin);
        }
        let _ = write!(message, " {}", line.message);
        for (key, value) in &line.fields {
            let _ = write!(message, " {}={}", key, value);
        }

        // no receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

/// Fields of one event, with the button pin pulled out front.
#[derive(Default)]
struct LogLine {
    message: String,
    pin: Option<u64>,
    fields: Vec<(&'static str, String)>,
}

impl Visit for LogLine {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "pin" {
            self.pin = Some(value);
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.fields.push((field.name(), format!("{:?}", value)));
        }
    }
}

fn stderr_layer(style: LogStyle) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match style {
        LogStyle::Full => layer.boxed(),
        LogStyle::Compact => layer.compact().boxed(),
        LogStyle::Pretty => layer.pretty().boxed(),
    }
}

/// Stderr in the configured style, the optional log file, and the socket
/// broadcast.  `RUST_LOG` overrides the configured level.
pub fn init(
    logging: &LoggingConfig,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> anyhow::Result<()> {
    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(logging.style())];

    if logging.log_to_file {
        if let Some(dir) = logging.file.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)
            .with_context(|| format!("Failed to open log file {}", logging.file.display()))?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .boxed(),
        );
    }

    layers.push(BroadcastLayer::new(broadcast_tx).boxed());

    let directive = logging.filter_directive()?;
    tracing_subscriber::registry()
        .with(layers)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();

    if logging.log_to_file {
        info!("Log file: {:?}", logging.file);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{error, warn};

    fn capture(emit: impl FnOnce()) -> Vec<String> {
        let (tx, mut rx) = broadcast::channel(16);
        let subscriber = tracing_subscriber::registry().with(BroadcastLayer::new(tx));
        tracing::subscriber::with_default(subscriber, emit);

        let mut lines = Vec::new();
        while let Ok(BroadcastMessage::Log(line)) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Drops the `HH:MM:SS ` prefix.
    fn without_time(line: &str) -> &str {
        line.split_once(' ').map(|(_, rest)| rest).unwrap_or(line)
    }

    #[test]
    fn test_only_warn_and_error_are_forwarded() {
        let lines = capture(|| {
            info!(pin = 17u32, "Button pressed");
            warn!("Stop failed; clearing playing state anyway");
            error!(pin = 4u32, "Failed to pause playback");
        });
        assert_eq!(lines.len(), 2);
        assert_eq!(
            without_time(&lines[0]),
            "WARN Stop failed; clearing playing state anyway"
        );
        assert_eq!(without_time(&lines[1]), "ERROR [pin 4] Failed to pause playback");
    }

    #[test]
    fn test_pin_leads_and_other_fields_trail() {
        let lines = capture(|| {
            error!(op = "load", pin = 27u32, file = "/midi/b.mid", "remote rejected command");
        });
        assert_eq!(
            without_time(&lines[0]),
            "ERROR [pin 27] remote rejected command op=load file=/midi/b.mid"
        );
    }
}
