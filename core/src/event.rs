//! The typed recording format: one [`Event`] per non-comment line of a
//! captured session, in file order.

use std::io::BufRead;
use std::path::Path;

use serde::Deserialize;

use crate::error::ShinyError;

/// Fields common to every event: when it was recorded and which physical
/// line of the recording file it came from (1-based, comment lines count).
#[derive(Debug, Clone, Copy)]
pub struct EventMeta {
    pub created: i64,
    pub line_number: usize,
}

/// The tagged union of recording line shapes, per the recording file
/// format. `REQ`, `REQ_HOME`, `REQ_SINF`, and `REQ_TOK` share a shape but
/// get distinct handling (worker-id scraping, token capture).
#[derive(Debug, Clone)]
pub enum EventKind {
    Req {
        url: String,
        method: String,
        status: u16,
    },
    ReqHome {
        url: String,
        method: String,
        status: u16,
    },
    ReqSinf {
        url: String,
        method: String,
        status: u16,
    },
    ReqTok {
        url: String,
        method: String,
        status: u16,
    },
    ReqPostUpload {
        status: u16,
        data_b64: String,
    },
    WsOpen {
        url: String,
    },
    WsRecv {
        message: String,
    },
    WsRecvInit {
        message: String,
    },
    WsRecvBeginUpload {
        message: String,
    },
    WsSend {
        message: String,
    },
    WsClose,
}

impl EventKind {
    /// The name used for the `<NAME>_START`/`<NAME>_END` CSV event pair.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Req { .. } => "REQ",
            EventKind::ReqHome { .. } => "REQ_HOME",
            EventKind::ReqSinf { .. } => "REQ_SINF",
            EventKind::ReqTok { .. } => "REQ_TOK",
            EventKind::ReqPostUpload { .. } => "REQ_POST_UPLOAD",
            EventKind::WsOpen { .. } => "WS_OPEN",
            EventKind::WsRecv { .. } => "WS_RECV",
            EventKind::WsRecvInit { .. } => "WS_RECV_INIT",
            EventKind::WsRecvBeginUpload { .. } => "WS_RECV_BEGIN_UPLOAD",
            EventKind::WsSend { .. } => "WS_SEND",
            EventKind::WsClose => "WS_CLOSE",
        }
    }

    pub fn is_ws_close(&self) -> bool {
        matches!(self, EventKind::WsClose)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub meta: EventMeta,
    pub kind: EventKind,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    ty: String,
    created: String,
    url: Option<String>,
    method: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<u16>,
    data: Option<String>,
    message: Option<String>,
}

fn parse_created(raw: &str) -> Result<i64, ShinyError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ShinyError::Recording(format!("invalid timestamp {raw:?}: {e}")))
}

impl Event {
    fn from_raw(raw: RawEvent, line_number: usize) -> Result<Self, ShinyError> {
        let created = parse_created(&raw.created)?;
        let meta = EventMeta {
            created,
            line_number,
        };

        macro_rules! field {
            ($name:expr, $opt:expr) => {
                $opt.ok_or_else(|| {
                    ShinyError::Recording(format!(
                        "line {line_number}: {} event missing `{}`",
                        raw.ty, $name
                    ))
                })?
            };
        }

        let kind = match raw.ty.as_str() {
            "REQ" => EventKind::Req {
                url: field!("url", raw.url),
                method: field!("method", raw.method),
                status: field!("statusCode", raw.status_code),
            },
            "REQ_HOME" => EventKind::ReqHome {
                url: field!("url", raw.url),
                method: field!("method", raw.method),
                status: field!("statusCode", raw.status_code),
            },
            "REQ_SINF" => EventKind::ReqSinf {
                url: field!("url", raw.url),
                method: field!("method", raw.method),
                status: field!("statusCode", raw.status_code),
            },
            "REQ_TOK" => EventKind::ReqTok {
                url: field!("url", raw.url),
                method: field!("method", raw.method),
                status: field!("statusCode", raw.status_code),
            },
            "REQ_POST_UPLOAD" => EventKind::ReqPostUpload {
                status: field!("statusCode", raw.status_code),
                data_b64: field!("data", raw.data),
            },
            "WS_OPEN" => EventKind::WsOpen {
                url: field!("url", raw.url),
            },
            "WS_RECV" => EventKind::WsRecv {
                message: field!("message", raw.message),
            },
            "WS_RECV_INIT" => EventKind::WsRecvInit {
                message: field!("message", raw.message),
            },
            "WS_RECV_BEGIN_UPLOAD" => EventKind::WsRecvBeginUpload {
                message: field!("message", raw.message),
            },
            "WS_SEND" => EventKind::WsSend {
                message: field!("message", raw.message),
            },
            "WS_CLOSE" => EventKind::WsClose,
            other => {
                return Err(ShinyError::Recording(format!(
                    "line {line_number}: unknown event type {other:?}"
                )))
            }
        };

        Ok(Event { meta, kind })
    }
}

/// A finite, ordered, read-only sequence of events loaded from a recording
/// file. Shared across all workers once loaded.
pub struct Recording {
    pub events: Vec<Event>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self, ShinyError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);

        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line_number = idx + 1;
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let raw: RawEvent = serde_json::from_str(trimmed).map_err(|e| {
                ShinyError::Recording(format!("line {line_number}: invalid JSON: {e}"))
            })?;
            events.push(Event::from_raw(raw, line_number)?);
        }

        let recording = Recording { events };
        recording.validate()?;
        Ok(recording)
    }

    fn validate(&self) -> Result<(), ShinyError> {
        match self.events.last() {
            None => Err(ShinyError::Recording("recording is empty".into())),
            Some(last) if !last.kind.is_ws_close() => Err(ShinyError::Recording(
                "recording's last event must be WS_CLOSE".into(),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Wall-clock span of the recording, used to derive a default
    /// `--start-interval` when the caller doesn't supply one.
    pub fn duration_ms(&self) -> i64 {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => (last.meta.created - first.meta.created).max(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_recording(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn loads_and_skips_comments() {
        let file = write_recording(&[
            "# a comment",
            r#"{"type":"REQ_HOME","created":"2024-01-01T00:00:00.000Z","url":"/","method":"GET","statusCode":200}"#,
            r#"{"type":"WS_OPEN","created":"2024-01-01T00:00:00.100Z","url":"/websocket"}"#,
            r#"{"type":"WS_CLOSE","created":"2024-01-01T00:00:01.000Z"}"#,
        ]);
        let recording = Recording::load(file.path()).unwrap();
        assert_eq!(recording.events.len(), 3);
        assert_eq!(recording.events[0].meta.line_number, 2);
    }

    #[test]
    fn rejects_empty_recording() {
        let file = write_recording(&["# only a comment"]);
        assert!(Recording::load(file.path()).is_err());
    }

    #[test]
    fn rejects_recording_not_ending_in_ws_close() {
        let file = write_recording(&[
            r#"{"type":"WS_OPEN","created":"2024-01-01T00:00:00.000Z","url":"/websocket"}"#,
        ]);
        assert!(Recording::load(file.path()).is_err());
    }
}
