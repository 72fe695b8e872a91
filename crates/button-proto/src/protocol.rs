use serde::{Deserialize, Deserializer, Serialize};

use crate::config::ButtonConfig;

/// Current control protocol version.  Bump this when the wire format changes
/// in a breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

// ── remote playback service ───────────────────────────────────────────────────

/// Body of `POST /api/load`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest<'a> {
    pub file_path: &'a str,
}

/// Reply to the load/play/pause/stop commands.  Error bodies carry no
/// `success` field and therefore read as a failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandReply {
    /// Human-readable reason for a failed reply, for logs.
    pub fn reason(&self) -> &str {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("no reason given")
    }
}

/// Snapshot from `GET /api/status`.  Every field is defaulted so a partial
/// or failed read looks like "nothing playing".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteStatus {
    #[serde(deserialize_with = "null_as_empty")]
    pub file_name: String,
    pub is_playing: bool,
    /// UNLOADED, LOADED, PLAYING, PAUSED or ERROR.
    pub state: Option<String>,
    pub progress: Option<f64>,
    pub position: Option<String>,
    pub duration: Option<String>,
}

impl RemoteStatus {
    /// True when the service is playing and its current file name occurs
    /// inside `configured_file`.
    ///
    /// The service reports a bare file name while buttons are configured
    /// with full paths, hence the substring test.  Two configured paths that
    /// share the reported name will both match.
    pub fn is_playing_file(&self, configured_file: &str) -> bool {
        self.is_playing && configured_file.contains(self.file_name.as_str())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reply to `GET /api/health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReply {
    #[serde(default)]
    pub status: String,
}

impl HealthReply {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

// ── local control protocol ────────────────────────────────────────────────────

/// Messages sent from a control client (edge detector, test harness) to the
/// daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Press { pin: u32 },
    StopAll,
    GetState,
}

/// Messages pushed from the daemon to connected control clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect.
    Hello {
        protocol_version: u32,
        state: ControllerState,
    },
    State {
        data: ControllerState,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// What the daemon currently believes, as exposed to control clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub buttons: Vec<ButtonConfig>,
    pub playing_pins: Vec<u32>,
    pub processing_pins: Vec<u32>,
}

/// Largest frame, header included, a control client may send.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// 4-byte big-endian length header followed by the JSON body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Total size of the frame at the start of `data`, header included.
    /// `None` if the header is incomplete or the size does not fit a `usize`.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        usize::try_from(u32::from_be_bytes(header))
            .ok()?
            .checked_add(4)
    }

    /// True once a complete header announces a frame larger than
    /// `MAX_FRAME_LEN`.
    pub fn is_oversized(data: &[u8]) -> bool {
        data.len() >= 4 && !matches!(Self::frame_len(data), Some(len) if len <= MAX_FRAME_LEN)
    }

    /// Returns the message and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if Self::is_oversized(data) {
            anyhow::bail!("Frame exceeds {} bytes", MAX_FRAME_LEN);
        }
        let Some(frame_len) = Self::frame_len(data) else {
            anyhow::bail!("Insufficient data for length header");
        };
        if data.len() < frame_len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..frame_len])?;
        Ok((msg, frame_len))
    }
}
