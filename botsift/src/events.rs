// botsift/src/events.rs
//
// Shared domain types flowing through botsift.
//
//   IngestRecord: what the ingestion boundary hands us (loosely typed JSON)
//   LogEvent    : validated, immutable request observation
//   Key         : (host, address) identity of a traffic source
//   ClassLabel  : externally known or predicted class of a key

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

// ── Key ───────────────────────────────────────────────────────────────────────

/// Identity of a traffic source. Unit of ownership, buffering and statistics.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub host:    String,
    pub address: String,
}

impl Key {
    pub fn new(host: impl Into<String>, address: impl Into<String>) -> Self {
        Self { host: host.into(), address: address.into() }
    }

    /// `host/address`, the composite cache key.
    pub fn composite(&self) -> String {
        format!("{}/{}", self.host, self.address)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.address)
    }
}

// ── LogEvent ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub key:          Key,
    pub hour:         u8,      // 0–23
    pub status_line:  String,
    pub user_agent:   String,
    pub epoch_ms:     i64,
    pub content_type: String,
}

impl LogEvent {
    /// Primary document request (not a sub-resource fetch).
    pub fn is_page(&self) -> bool {
        let mime = self.content_type.split(';').next().unwrap_or("").trim();
        mime.eq_ignore_ascii_case("text/html")
    }

    /// 4xx or 5xx response.
    pub fn is_error(&self) -> bool {
        matches!(self.status_line.trim_start().as_bytes().first(), Some(b'4') | Some(b'5'))
    }

    /// Same observation, ignoring which key it was filed under.
    pub fn same_observation(&self, other: &LogEvent) -> bool {
        self.epoch_ms == other.epoch_ms
            && self.hour == other.hour
            && self.status_line == other.status_line
            && self.user_agent == other.user_agent
            && self.content_type == other.content_type
    }
}

// ── Ingestion boundary record ─────────────────────────────────────────────────

/// One inbound unit from the ingestion boundary. Accepts both the boundary
/// field names and the web server's environment-variable names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestRecord {
    pub hour: Value,
    #[serde(rename = "remoteAddress", alias = "REMOTE_ADDR", alias = "remote_addr")]
    pub remote_address: Option<String>,
    #[serde(rename = "statusLine", alias = "status_line")]
    pub status_line: Option<String>,
    #[serde(rename = "userAgent", alias = "useragent", alias = "user_agent")]
    pub user_agent: Option<String>,
    #[serde(rename = "epochMillis", alias = "epoch", alias = "epoch_ms")]
    pub epoch_millis: Value,
    #[serde(rename = "httpHost", alias = "HTTP_HOST", alias = "http_host")]
    pub http_host: Option<String>,
    #[serde(rename = "contentType", alias = "content_type")]
    pub content_type: Option<String>,
}

impl IngestRecord {
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| EngineError::Malformed(e.to_string()))
    }

    /// Validate and normalise into a LogEvent.
    pub fn into_event(self) -> Result<LogEvent> {
        let host    = required(self.http_host, "httpHost")?;
        let address = required(self.remote_address, "remoteAddress")?;

        // `""` is how the boundary reports an untimed request; absent is malformed
        let hour = match &self.hour {
            Value::Null => return Err(EngineError::Malformed("missing hour".into())),
            Value::String(s) if s.trim().is_empty() => Some(0),
            v => integer(v),
        };
        let hour = match hour {
            Some(h) if (0..=23).contains(&h) => h as u8,
            Some(h) => return Err(EngineError::Malformed(format!("hour out of range: {}", h))),
            None    => return Err(EngineError::Malformed(format!("unparseable hour: {}", self.hour))),
        };
        let epoch_ms = match &self.epoch_millis {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            v => integer(v),
        }
        .ok_or_else(|| {
            EngineError::Malformed(format!("unparseable epochMillis: {}", self.epoch_millis))
        })?;

        Ok(LogEvent {
            key:          Key::new(host, address),
            hour,
            status_line:  self.status_line.unwrap_or_default(),
            user_agent:   self.user_agent.unwrap_or_default(),
            epoch_ms,
            content_type: self.content_type.unwrap_or_default(),
        })
    }
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field.map(|s| s.trim().to_string()) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(EngineError::Malformed(format!("missing {}", name))),
    }
}

/// Numbers or numeric strings.
fn integer(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── Classification ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassLabel {
    Bot,
    Human,
    Unknown,
}

impl ClassLabel {
    /// Sign convention of the scorer: negative = human, non-negative = bot.
    pub fn from_prediction(p: f64) -> Self {
        if p < 0.0 { Self::Human } else { Self::Bot }
    }

    /// Integer label from the user-agent label service (0 human, 1 bot).
    pub fn from_service(v: i64) -> Self {
        match v {
            0 => Self::Human,
            1 => Self::Bot,
            _ => Self::Unknown,
        }
    }

    /// Value stored in the prediction cache.
    pub fn cache_value(self) -> Option<i64> {
        match self {
            Self::Bot     => Some(1),
            Self::Human   => Some(-1),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bot     => "bot",
            Self::Human   => "human",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
