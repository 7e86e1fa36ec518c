//! Per-virtual-user state and the run-loop that drives one iteration of the
//! recorded script from first event to `WS_CLOSE`.
//!
//! A `Session` is exclusively owned by one worker for the lifetime of one
//! iteration: its cookie jar, token dictionary, and WebSocket connection are
//! never touched from any other task. Failures anywhere in the event loop
//! are just `Result::Err` propagated up to `run`, which is the only place
//! that turns them into a `PLAYBACK_FAIL` row and a stats transition — the
//! failure latch falls out of ordinary `?` propagation because nothing
//! else ever mutates a session's state concurrently.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::Rng;
use url::Url;

use core::error::ShinyError;
use core::event::{Event, EventKind};
use core::message;
use core::stats::{SessionState, Stats};
use core::token;

use crate::auth;
use crate::cli::Credentials;
use crate::http::HttpClient;
use crate::output::SessionWriter;
use crate::ws::WsConnection;

static ALLOWED_TOKENS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "WORKER",
        "TOKEN",
        "ROBUST_ID",
        "SOCKJSID",
        "SESSION",
        "UPLOAD_URL",
        "UPLOAD_JOB_ID",
    ]
    .into_iter()
    .collect()
});

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}

/// `wss?://host[:port]` derived from the app's `http(s)://` base, with no
/// path: event `WsOpen.url` is joined onto it at handle time.
fn derive_ws_base(http_url: &Url) -> Result<String, ShinyError> {
    let scheme = match http_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ShinyError::Config(format!(
                "app url has unsupported scheme {other:?}"
            )))
        }
    };
    let host = http_url
        .host_str()
        .ok_or_else(|| ShinyError::Config("app url has no host".into()))?;
    let base = match http_url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };
    Ok(base)
}

/// Concatenates a base origin with a recorded path. Recordings store full
/// absolute paths (`/foo/bar?x=1`), so this is string-joining, not URL
/// resolution: `Url::join` would reinterpret `..`-like segments and query
/// strings in ways the recorded path never intended.
fn join_raw(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// 200 and 304 are interchangeable for GETs (conditional-GET revalidation);
/// every other comparison is exact. This carve-out is intentionally
/// GET-only — `REQ_POST_UPLOAD` checks for an exact match.
fn status_equals_get(actual: u16, expected: u16) -> bool {
    if actual == expected {
        return true;
    }
    matches!((actual, expected), (200, 304) | (304, 200))
}

pub struct Session {
    pub session_id: u64,
    pub worker_id: usize,
    pub iteration_id: u64,

    http_url: Url,
    ws_base: String,

    dict: HashMap<String, String>,

    http: HttpClient,
    ws: Option<WsConnection>,

    last_event_ended: i64,

    credentials: Option<Credentials>,
}

impl Session {
    pub fn new(
        session_id: u64,
        worker_id: usize,
        iteration_id: u64,
        app_url: &str,
        credentials: Option<Credentials>,
        user_agent: &str,
    ) -> Result<Self, ShinyError> {
        let http_url = Url::parse(app_url)
            .map_err(|e| ShinyError::Config(format!("invalid app url {app_url}: {e}")))?;
        let ws_base = derive_ws_base(&http_url)?;

        let mut dict = HashMap::new();
        dict.insert("ROBUST_ID".to_string(), random_hex(18));
        dict.insert("SOCKJSID".to_string(), format!("000/{}", random_hex(8)));

        Ok(Self {
            session_id,
            worker_id,
            iteration_id,
            http_url,
            ws_base,
            dict,
            http: HttpClient::new(user_agent)?,
            ws: None,
            last_event_ended: 0,
            credentials,
        })
    }

    fn substitute(&self, s: &str) -> Result<String, ShinyError> {
        token::substitute(s, &ALLOWED_TOKENS, &self.dict)
    }

    /// `REQ*` events sleep only once a WebSocket is open (before that,
    /// HTTP calls fire back-to-back exactly as the recorder saw them go
    /// out); `WS_SEND`/`WS_CLOSE` always sleep to the recorded gap;
    /// everything else is immediate.
    fn sleep_before(&self, event: &Event) -> i64 {
        let gap = || (event.meta.created - self.last_event_ended).max(0);
        match &event.kind {
            EventKind::Req { .. }
            | EventKind::ReqHome { .. }
            | EventKind::ReqSinf { .. }
            | EventKind::ReqTok { .. }
            | EventKind::ReqPostUpload { .. } => {
                if self.ws.is_none() {
                    0
                } else {
                    gap()
                }
            }
            EventKind::WsSend { .. } | EventKind::WsClose => gap(),
            _ => 0,
        }
    }

    async fn recv_frame(&mut self) -> Result<String, ShinyError> {
        let ws = self
            .ws
            .as_mut()
            .ok_or_else(|| ShinyError::WsProtocol("no open websocket to receive on".into()))?;
        match ws.receiver.recv().await {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(e),
            None => Err(ShinyError::WsProtocol(
                "websocket closed before expected message arrived".into(),
            )),
        }
    }

    async fn handle_get(
        &mut self,
        url: &str,
        expected_status: u16,
    ) -> Result<String, ShinyError> {
        let rendered = self.substitute(url)?;
        let full_url = join_raw(self.http_url.as_str(), &rendered);
        let response = self
            .http
            .get(&full_url)
            .await
            .map_err(|e| ShinyError::WsProtocol(format!("GET {full_url} failed: {e}")))?;
        if !status_equals_get(response.status.as_u16(), expected_status) {
            return Err(ShinyError::HttpStatus {
                url: full_url,
                expected: expected_status,
                actual: response.status.as_u16(),
            });
        }
        Ok(response.body)
    }

    async fn handle(&mut self, event: &Event) -> Result<(), ShinyError> {
        match &event.kind {
            EventKind::Req { url, status, .. } => {
                self.handle_get(url, *status).await?;
                Ok(())
            }
            EventKind::ReqHome { url, status, .. } => {
                let body = self.handle_get(url, *status).await?;
                if let Some(worker) = scrape_worker_id(&body) {
                    self.dict.insert("WORKER".to_string(), worker);
                }
                Ok(())
            }
            EventKind::ReqSinf { url, status, .. } => {
                self.handle_get(url, *status).await?;
                Ok(())
            }
            EventKind::ReqTok { url, status, .. } => {
                let body = self.handle_get(url, *status).await?;
                self.dict.insert("TOKEN".to_string(), body);
                Ok(())
            }
            EventKind::ReqPostUpload { status, data_b64 } => {
                let upload_url = self.dict.get("UPLOAD_URL").cloned().ok_or_else(|| {
                    ShinyError::Token("REQ_POST_UPLOAD requires ${UPLOAD_URL}".into())
                })?;
                let bytes = base64::Engine::decode(
                    &base64::engine::general_purpose::STANDARD,
                    data_b64,
                )
                .map_err(|e| ShinyError::Recording(format!("invalid base64 upload body: {e}")))?;
                let response = self
                    .http
                    .post_bytes(&upload_url, bytes)
                    .await
                    .map_err(|e| ShinyError::WsProtocol(format!("upload POST failed: {e}")))?;
                if response.status.as_u16() != *status {
                    return Err(ShinyError::HttpStatus {
                        url: upload_url,
                        expected: *status,
                        actual: response.status.as_u16(),
                    });
                }
                Ok(())
            }
            EventKind::WsOpen { url } => {
                if self.ws.is_some() {
                    return Err(ShinyError::WsProtocol(
                        "WS_OPEN while a websocket is already open".into(),
                    ));
                }
                let rendered = self.substitute(url)?;
                let full_url = join_raw(&self.ws_base, &rendered);
                let cookie_url = Url::parse(&join_raw(self.http_url.as_str(), &rendered))
                    .unwrap_or_else(|_| self.http_url.clone());
                let cookie_header = self.http.cookie_header(&cookie_url);
                self.ws = Some(WsConnection::open(&full_url, &cookie_header).await?);
                Ok(())
            }
            EventKind::WsRecv { message } => {
                let expected = self.substitute(message)?;
                let received = self.recv_frame().await?;
                match message::parse_message(&expected)? {
                    None => {
                        if expected != received {
                            return Err(ShinyError::WsProtocol(format!(
                                "expected literal frame {expected:?}, got {received:?}"
                            )));
                        }
                    }
                    Some(expected_obj) => {
                        let received_obj = message::parse_message(&received)?.ok_or_else(|| {
                            ShinyError::WsProtocol(format!(
                                "expected a structured frame, got {received:?}"
                            ))
                        })?;
                        require_same_key_set(&expected_obj, &received_obj)?;
                    }
                }
                Ok(())
            }
            EventKind::WsRecvInit { .. } => {
                let received = self.recv_frame().await?;
                let obj = message::parse_message(&received)?.ok_or_else(|| {
                    ShinyError::WsProtocol("WS_RECV_INIT frame was not structured".into())
                })?;
                let session_id = obj
                    .get("config")
                    .and_then(|c| c.get("sessionId"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ShinyError::WsProtocol(
                            "init frame missing config.sessionId".into(),
                        )
                    })?;
                self.dict.insert("SESSION".to_string(), session_id.to_string());
                Ok(())
            }
            EventKind::WsRecvBeginUpload { .. } => {
                let received = self.recv_frame().await?;
                let obj = message::parse_message(&received)?.ok_or_else(|| {
                    ShinyError::WsProtocol("WS_RECV_BEGIN_UPLOAD frame was not structured".into())
                })?;
                let value = obj
                    .get("response")
                    .and_then(|r| r.get("value"))
                    .ok_or_else(|| {
                        ShinyError::WsProtocol("begin-upload frame missing response.value".into())
                    })?;
                let job_id = value
                    .get("jobId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ShinyError::WsProtocol("begin-upload frame missing jobId".into())
                    })?;
                let upload_url = value
                    .get("uploadUrl")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ShinyError::WsProtocol("begin-upload frame missing uploadUrl".into())
                    })?;
                self.dict.insert("UPLOAD_JOB_ID".to_string(), job_id.to_string());
                self.dict.insert("UPLOAD_URL".to_string(), upload_url.to_string());
                Ok(())
            }
            EventKind::WsSend { message } => {
                let rendered = self.substitute(message)?;
                let ws = self
                    .ws
                    .as_mut()
                    .ok_or_else(|| ShinyError::WsProtocol("WS_SEND with no open websocket".into()))?;
                ws.send(&rendered).await
            }
            EventKind::WsClose => {
                if let Some(ws) = self.ws.take() {
                    ws.close().await?;
                }
                Ok(())
            }
        }
    }

    /// Runs one iteration of the recorded script end to end: optional auth,
    /// optional ramp-up delay, then every event in order. `on_warmed_up` is
    /// invoked exactly once, right after the ramp-up delay (if any) and
    /// before the first event — the endurance orchestrator uses it to count
    /// down the worker's warmup latch.
    pub async fn run(
        mut self,
        events: &[Event],
        writer: &mut SessionWriter,
        stats: &Stats,
        start_delay_ms: i64,
        on_warmed_up: impl FnOnce(),
    ) -> Result<(), ShinyError> {
        writer.record("PLAYER_SESSION_CREATE", now_ms(), None, "")?;

        auth::maybe_login(&self.http, self.http_url.as_str(), self.credentials.as_ref()).await?;

        if start_delay_ms > 0 {
            writer.record("PLAYBACK_START_INTERVAL_START", now_ms(), None, "")?;
            tokio::time::sleep(std::time::Duration::from_millis(start_delay_ms as u64)).await;
            writer.record("PLAYBACK_START_INTERVAL_END", now_ms(), None, "")?;
        }
        on_warmed_up();

        stats.start();

        if let Some(first) = events.first() {
            self.last_event_ended = first.meta.created;
        }

        for event in events {
            let sleep_ms = self.sleep_before(event);
            if sleep_ms > 0 {
                writer.record("PLAYBACK_SLEEPBEFORE_START", now_ms(), None, "")?;
                tokio::time::sleep(std::time::Duration::from_millis(sleep_ms as u64)).await;
                writer.record("PLAYBACK_SLEEPBEFORE_END", now_ms(), None, "")?;
            }

            let name = event.kind.name();
            writer.record(&format!("{name}_START"), now_ms(), Some(event.meta.line_number), "")?;
            if let Err(e) = self.handle(event).await {
                writer.record(
                    "PLAYBACK_FAIL",
                    now_ms(),
                    Some(event.meta.line_number),
                    &e.to_string(),
                )?;
                stats.transition(SessionState::Run, SessionState::Fail);
                if let Some(ws) = self.ws.take() {
                    let _ = ws.close().await;
                }
                return Err(e);
            }
            writer.record(&format!("{name}_END"), now_ms(), Some(event.meta.line_number), "")?;

            self.last_event_ended = event.meta.created;
        }

        stats.transition(SessionState::Run, SessionState::Done);
        writer.record("PLAYBACK_DONE", now_ms(), None, "")?;
        Ok(())
    }
}

fn scrape_worker_id(body: &str) -> Option<String> {
    static WORKER_RE: Lazy<regex::Regex> =
        Lazy::new(|| regex::Regex::new(r#"(?s)<base href="_w_([0-9a-z]+)/"#).unwrap());
    WORKER_RE
        .captures(body)
        .map(|caps| caps[1].to_string())
}

fn require_same_key_set(
    expected: &serde_json::Value,
    received: &serde_json::Value,
) -> Result<(), ShinyError> {
    let expected_keys = key_set(expected);
    let received_keys = key_set(received);
    if expected_keys != received_keys {
        return Err(ShinyError::WsProtocol(format!(
            "key set mismatch: expected {expected_keys:?}, got {received_keys:?}"
        )));
    }
    Ok(())
}

fn key_set(value: &serde_json::Value) -> HashSet<String> {
    match value {
        serde_json::Value::Object(map) => map.keys().cloned().collect(),
        _ => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_before_ignores_req_before_websocket_opens() {
        // REQ sleep is 0 before a WebSocket exists, regardless of timing gap.
        let session = bare_session();
        let event = Event {
            meta: core::event::EventMeta {
                created: 5_000,
                line_number: 1,
            },
            kind: EventKind::Req {
                url: "/x".into(),
                method: "GET".into(),
                status: 200,
            },
        };
        assert_eq!(session.sleep_before(&event), 0);
    }

    #[test]
    fn sleep_before_clamps_negative_gaps_to_zero() {
        let mut session = bare_session();
        session.last_event_ended = 10_000;
        session.ws = None;
        let event = Event {
            meta: core::event::EventMeta {
                created: 1_000,
                line_number: 1,
            },
            kind: EventKind::WsClose,
        };
        assert_eq!(session.sleep_before(&event), 0);
    }

    #[test]
    fn sleep_before_ws_send_uses_recorded_gap() {
        let mut session = bare_session();
        session.last_event_ended = 1_000;
        let event = Event {
            meta: core::event::EventMeta {
                created: 1_400,
                line_number: 1,
            },
            kind: EventKind::WsSend {
                message: "{}".into(),
            },
        };
        assert_eq!(session.sleep_before(&event), 400);
    }

    #[test]
    fn scrapes_worker_id_from_base_href() {
        let body = "<html><head><base href=\"_w_deadbeef/\"></head></html>";
        assert_eq!(scrape_worker_id(body), Some("deadbeef".to_string()));
    }

    #[test]
    fn missing_worker_id_is_not_an_error() {
        assert_eq!(scrape_worker_id("<html></html>"), None);
    }

    #[test]
    fn join_raw_handles_absolute_paths() {
        assert_eq!(join_raw("http://host:1234/", "/foo/bar"), "http://host:1234/foo/bar");
    }

    #[test]
    fn status_equals_get_allows_200_304_either_direction() {
        assert!(status_equals_get(200, 304));
        assert!(status_equals_get(304, 200));
        assert!(status_equals_get(404, 404));
        assert!(!status_equals_get(200, 500));
    }

    fn bare_session() -> Session {
        Session::new(1, 0, 0, "http://localhost:1234", None, "shinycannon/test").unwrap()
    }
}
