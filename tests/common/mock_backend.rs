// Mock prefill/decode engines - these helpers are shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, web};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use serde_json::Value;

/// Shared, ordered record of what every mock saw. Lets tests assert causal
/// ordering across backends.
pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Debug)]
pub enum Behavior {
    /// Answers with a JSON body after `delay_ms`.
    Prefill { body: Value, delay_ms: u64 },
    /// Streams `chunks`, pausing `gap_ms` between them so each one reaches
    /// the proxy as its own read.
    Decode { chunks: Vec<Bytes>, gap_ms: u64 },
    /// Streams `chunks` like `Decode`, then breaks the connection instead of
    /// finishing the body.
    Abort { chunks: Vec<Bytes>, gap_ms: u64 },
    /// Answers every request with `status` and `body`.
    Fail { status: u16, body: String },
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

struct MockState {
    name: String,
    behavior: Behavior,
    requests: Mutex<Vec<RecordedRequest>>,
    events: EventLog,
    chunks_started: AtomicUsize,
    stream_dropped: AtomicBool,
}

/// Flags the response stream as dropped, whether it finished or the peer
/// went away.
struct StreamDropGuard(web::Data<MockState>);

impl Drop for StreamDropGuard {
    fn drop(&mut self) {
        self.0.stream_dropped.store(true, Ordering::SeqCst);
    }
}

/// A mock engine listening on an ephemeral localhost port.
pub struct MockBackend {
    pub port: u16,
    state: web::Data<MockState>,
    handle: ServerHandle,
}

impl MockBackend {
    pub async fn start(name: &str, behavior: Behavior, events: EventLog) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = web::Data::new(MockState {
            name: name.to_string(),
            behavior,
            requests: Mutex::new(Vec::new()),
            events,
            chunks_started: AtomicUsize::new(0),
            stream_dropped: AtomicBool::new(false),
        });

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .default_service(web::route().to(handle_request))
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        Self {
            port,
            state,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Number of streamed chunks the mock has started to send.
    pub fn chunks_started(&self) -> usize {
        self.state.chunks_started.load(Ordering::SeqCst)
    }

    pub fn stream_dropped(&self) -> bool {
        self.state.stream_dropped.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

pub fn new_event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A port nothing is listening on.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn sse_event(data: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

pub fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Splits an SSE body into its `data:` payloads.
pub fn sse_payloads(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|frame| frame.trim().strip_prefix("data: ").map(str::to_string))
        .collect()
}

async fn handle_request(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<MockState>,
) -> HttpResponse {
    let headers = req
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.requests.lock().unwrap().push(RecordedRequest {
        path: req.path().to_string(),
        headers,
        body,
    });
    state
        .events
        .lock()
        .unwrap()
        .push(format!("{}:received", state.name));

    match &state.behavior {
        Behavior::Prefill { body, delay_ms } => {
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            state
                .events
                .lock()
                .unwrap()
                .push(format!("{}:responded", state.name));
            HttpResponse::Ok().json(body)
        }
        Behavior::Decode { chunks, gap_ms } => HttpResponse::Ok()
            .content_type("text/event-stream")
            .streaming(paced_chunks(&state, chunks, *gap_ms)),
        Behavior::Abort { chunks, gap_ms } => {
            let body = paced_chunks(&state, chunks, *gap_ms).chain(stream::once(async {
                Err(actix_web::error::ErrorInternalServerError(
                    "decode engine crashed",
                ))
            }));
            HttpResponse::Ok()
                .content_type("text/event-stream")
                .streaming(body)
        }
        Behavior::Fail { status, body } => {
            let status = actix_web::http::StatusCode::from_u16(*status).unwrap();
            HttpResponse::build(status)
                .content_type("application/json")
                .body(body.clone())
        }
    }
}

fn paced_chunks(
    state: &web::Data<MockState>,
    chunks: &[Bytes],
    gap_ms: u64,
) -> impl futures::Stream<Item = Result<Bytes, actix_web::Error>> + 'static {
    let gap = Duration::from_millis(gap_ms);
    let guard = StreamDropGuard(state.clone());
    stream::iter(chunks.to_vec().into_iter().enumerate()).then(move |(i, chunk)| {
        guard.0.chunks_started.fetch_add(1, Ordering::SeqCst);
        async move {
            if i > 0 {
                tokio::time::sleep(gap).await;
            }
            Ok(chunk)
        }
    })
}
