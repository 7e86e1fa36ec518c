//! End-to-end replay scenarios, driven against a small same-port mock
//! HTTP+WebSocket server instead of a real Shiny deployment.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use core::event::{Event, EventKind, EventMeta};
use core::stats::Stats;

use shinycannon_player::orchestrator::{self, EnduranceConfig};
use shinycannon_player::output::SessionWriter;
use shinycannon_player::session::Session;

/// Wraps a JSON payload as a Shiny `a["0|m|<payload>"]` SockJS data frame,
/// the same framing `core::message`'s tests use.
fn sockjs_frame(payload_json: &str) -> String {
    let escaped = payload_json.replace('\\', "\\\\").replace('"', "\\\"");
    format!(r#"a["0|m|{escaped}"]"#)
}

#[derive(Clone)]
struct MockConfig {
    http_status: u16,
    http_body: String,
    ws_frames: Vec<String>,
}

async fn start_mock(config: MockConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let status = config.http_status;
            let body = config.http_body.clone();
            let frames = config.ws_frames.clone();
            tokio::spawn(handle_connection(stream, status, body, frames));
        }
    });
    addr
}

async fn handle_connection(mut stream: TcpStream, status: u16, body: String, frames: Vec<String>) {
    let mut peek_buf = [0u8; 2048];
    let mut seen = 0;
    for _ in 0..200 {
        match stream.peek(&mut peek_buf).await {
            Ok(n) if n > 0 => {
                seen = n;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    }
    let head = String::from_utf8_lossy(&peek_buf[..seen]).to_ascii_lowercase();

    if head.contains("upgrade: websocket") {
        serve_ws(stream, frames).await;
    } else {
        serve_http(stream, status, &body).await;
    }
}

async fn serve_http(mut stream: TcpStream, status: u16, body: &str) {
    let mut buf = [0u8; 4096];
    let _ = stream.read(&mut buf).await;
    let reason = match status {
        200 => "OK",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/html\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn serve_ws(stream: TcpStream, frames: Vec<String>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(s) => s,
        Err(_) => return,
    };
    let (mut sink, _source) = ws_stream.split();
    for frame in frames {
        if sink
            .send(tokio_tungstenite::tungstenite::Message::Text(frame.into()))
            .await
            .is_err()
        {
            return;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = sink.close().await;
}

fn event(created: i64, line_number: usize, kind: EventKind) -> Event {
    Event {
        meta: EventMeta {
            created,
            line_number,
        },
        kind,
    }
}

async fn run_scenario(
    addr: SocketAddr,
    events: &[Event],
) -> (Result<(), core::error::ShinyError>, String) {
    let app_url = format!("http://{addr}");
    let session = Session::new(1, 0, 0, &app_url, None, "shinycannon/test").unwrap();

    let out_dir = tempfile::tempdir().unwrap();
    let mut writer =
        SessionWriter::create(out_dir.path(), 1, 0, 0, "shinycannon test", "{}").unwrap();
    let stats = Stats::new();

    let result = session
        .run(events, &mut writer, &stats, 0, || {})
        .await;

    let csv_path = out_dir.path().join("sessions/1_0_0.csv");
    let contents = std::fs::read_to_string(csv_path).unwrap();
    (result, contents)
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_dev_server_happy_path() {
    let init_frame = sockjs_frame(r#"{"config":{"sessionId":"abc"}}"#);
    let addr = start_mock(MockConfig {
        http_status: 200,
        http_body: "<html><head></head><body>no base tag here</body></html>".into(),
        ws_frames: vec![init_frame],
    })
    .await;

    let events = vec![
        event(
            0,
            1,
            EventKind::ReqHome {
                url: "/".into(),
                method: "GET".into(),
                status: 200,
            },
        ),
        event(
            50,
            2,
            EventKind::WsOpen {
                url: "/websocket".into(),
            },
        ),
        event(
            60,
            3,
            EventKind::WsRecvInit {
                message: "ignored-by-init-handler".into(),
            },
        ),
        event(
            70,
            4,
            EventKind::WsSend {
                message: r#"{"method":"init","session":"${SESSION}"}"#.into(),
            },
        ),
        event(80, 5, EventKind::WsClose),
    ];

    let (result, csv) = run_scenario(addr, &events).await;
    assert!(result.is_ok(), "session failed: {result:?}\ncsv:\n{csv}");

    for marker in [
        "PLAYER_SESSION_CREATE",
        "REQ_HOME_START",
        "REQ_HOME_END",
        "WS_OPEN_START",
        "WS_OPEN_END",
        "WS_RECV_INIT_START",
        "WS_RECV_INIT_END",
        "WS_SEND_START",
        "WS_SEND_END",
        "WS_CLOSE_START",
        "WS_CLOSE_END",
        "PLAYBACK_DONE",
    ] {
        assert!(csv.contains(marker), "missing {marker} in:\n{csv}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_worker_id_is_scraped_from_base_href() {
    let addr = start_mock(MockConfig {
        http_status: 200,
        http_body: r#"<html><head><base href="_w_deadbeef/"></head></html>"#.into(),
        ws_frames: vec![],
    })
    .await;

    let events = vec![event(
        0,
        1,
        EventKind::ReqHome {
            url: "/".into(),
            method: "GET".into(),
            status: 200,
        },
    )];

    // WORKER isn't itself exercised by WS_CLOSE here; the scraping unit
    // test in session.rs covers the regex directly. This integration test
    // just confirms the full REQ_HOME handler doesn't choke on a body that
    // does carry the base tag.
    let (result, csv) = run_scenario(addr, &events).await;
    assert!(result.is_ok(), "session failed: {result:?}\ncsv:\n{csv}");
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_status_mismatch_fails_the_session_without_an_end_row() {
    let addr = start_mock(MockConfig {
        http_status: 500,
        http_body: "boom".into(),
        ws_frames: vec![],
    })
    .await;

    let events = vec![event(
        0,
        1,
        EventKind::ReqHome {
            url: "/".into(),
            method: "GET".into(),
            status: 200,
        },
    )];

    let (result, csv) = run_scenario(addr, &events).await;
    assert!(matches!(result, Err(core::error::ShinyError::HttpStatus { .. })));
    assert!(csv.contains("REQ_HOME_START"));
    assert!(csv.contains("PLAYBACK_FAIL"));
    assert!(!csv.contains("REQ_HOME_END"));
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_unknown_token_fails_the_session() {
    // No HTTP/WS traffic needed: substitution is checked before any I/O.
    let addr = start_mock(MockConfig {
        http_status: 200,
        http_body: String::new(),
        ws_frames: vec![],
    })
    .await;

    let events = vec![event(
        0,
        1,
        EventKind::WsSend {
            message: "${UNKNOWN}".into(),
        },
    )];

    let (result, csv) = run_scenario(addr, &events).await;
    assert!(matches!(result, Err(core::error::ShinyError::Token(_))));
    assert!(csv.contains("PLAYBACK_FAIL"));
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_ignorable_frames_never_reach_ws_recv() {
    let f1 = sockjs_frame(r#"{"values":{"out":1}}"#);
    let f2 = sockjs_frame(r#"{"values":{"out":2}}"#);
    let progress = sockjs_frame(r#"{"progress":"busy"}"#);

    let addr = start_mock(MockConfig {
        http_status: 200,
        http_body: String::new(),
        ws_frames: vec!["h".into(), r#"a["ACK:42"]"#.into(), f1.clone(), progress, f2.clone()],
    })
    .await;

    let events = vec![
        event(
            0,
            1,
            EventKind::WsOpen {
                url: "/websocket".into(),
            },
        ),
        event(10, 2, EventKind::WsRecv { message: f1 }),
        event(20, 3, EventKind::WsRecv { message: f2 }),
        event(30, 4, EventKind::WsClose),
    ];

    let (result, csv) = run_scenario(addr, &events).await;
    assert!(result.is_ok(), "session failed: {result:?}\ncsv:\n{csv}");
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_endurance_ramp_runs_one_session_per_worker() {
    let addr = start_mock(MockConfig {
        http_status: 200,
        http_body: String::new(),
        ws_frames: vec![],
    })
    .await;

    let events = std::sync::Arc::new(core::event::Recording {
        events: vec![
            event(
                0,
                1,
                EventKind::WsOpen {
                    url: "/websocket".into(),
                },
            ),
            event(10, 2, EventKind::WsClose),
        ],
    });

    let out_dir = tempfile::tempdir().unwrap();
    let config = EnduranceConfig {
        num_workers: 3,
        warmup_interval_ms: 20,
        loaded_duration_minutes: 0.0,
        output_dir: out_dir.path().to_path_buf(),
        app_url: format!("http://{addr}"),
        credentials: None,
        user_agent: "shinycannon/test".into(),
        argv_comment: "shinycannon test".into(),
        args_json_comment: "{}".into(),
    };

    orchestrator::run(config, events).await.unwrap();

    let sessions_dir = out_dir.path().join("sessions");
    let mut csvs = std::fs::read_dir(&sessions_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect::<Vec<_>>();
    csvs.sort();
    assert_eq!(csvs.len(), 3, "expected one session file per worker: {csvs:?}");

    for path in &csvs {
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(
            contents.contains("PLAYBACK_DONE"),
            "{path:?} did not complete:\n{contents}"
        );
        assert!(!contents.contains("PLAYBACK_FAIL"), "{path:?} failed:\n{contents}");
    }
}
