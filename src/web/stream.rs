//! SSE endpoints: one subscription to the build cache per request.
//!
//! Each request canonicalizes its parameters into a fingerprint and submits
//! to the cache on the blocking pool. Progress callbacks from the build are
//! bridged into a bounded queue that never blocks the worker (oldest update
//! dropped when full), and a pump task drains the queue into the response
//! as `progress` events until the submission resolves into the single
//! terminal event. A disconnected client is dropped from the broadcaster
//! without cancelling the build; only a request with a different
//! fingerprint does that.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::header,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::broadcast::Listener;
use crate::cache::{SubmitError, Worker};
use crate::engine::{Assembly, BuildRequest, BuildTarget};
use crate::messages::{CancelledPayload, ErrorPayload, ProgressPayload};
use crate::params::ParameterSet;

use super::state::AppState;

type SseItem = Result<Event, Infallible>;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/visualize/{assembly}/stream", get(visualize))
        .route("/getcncoverview/stream", get(cnc_overview))
        .route("/getdimensiontables/stream", get(dimension_tables))
}

async fn visualize(
    State(state): State<AppState>,
    Path(assembly): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    match Assembly::from_path(&assembly) {
        Some(assembly) => stream_build(state, BuildTarget::Visualize(assembly), pairs),
        None => reject(format!("Invalid assembly type: {assembly}")),
    }
}

async fn cnc_overview(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    stream_build(state, BuildTarget::CncOverview, pairs)
}

async fn dimension_tables(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    stream_build(state, BuildTarget::DimensionTables, pairs)
}

fn stream_build(state: AppState, target: BuildTarget, pairs: Vec<(String, String)>) -> Response {
    let params = ParameterSet::from_query(
        pairs.iter().map(|(key, value)| (key.as_str(), value.as_str())),
        &state.allowed_groups,
    );
    let params = match params {
        Ok(params) => params,
        Err(err) => return reject(err.to_string()),
    };

    let request_id = Uuid::new_v4();
    let request = BuildRequest { target, params };

    let (tx, rx) = mpsc::channel::<SseItem>(16);
    tokio::spawn(serve_stream(state, request, request_id, tx));
    sse_response(rx)
}

/// A request that never reaches the cache: one `error` event, then close.
fn reject(message: String) -> Response {
    log::warn!("rejecting stream request: {message}");
    let (tx, rx) = mpsc::channel::<SseItem>(1);
    let _ = tx.try_send(Ok(error_event(&message)));
    sse_response(rx)
}

fn sse_response(rx: mpsc::Receiver<SseItem>) -> Response {
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(ReceiverStream::new(rx)),
    )
        .into_response()
}

async fn serve_stream(
    state: AppState,
    request: BuildRequest,
    request_id: Uuid,
    tx: mpsc::Sender<SseItem>,
) {
    let key = request.fingerprint();
    log::info!(
        "[{request_id}] {} -> {key:?}",
        request.target.canonical_name()
    );

    let queue = Arc::new(ProgressQueue::new(state.queue_capacity));
    let listener: Listener = {
        let queue = queue.clone();
        Arc::new(move |message: &str, percent: u8| queue.push(message, percent))
    };
    let worker: Worker<Value> = {
        let engine = state.engine.clone();
        Box::new(move |report, cancel| engine.build(&request, report, cancel))
    };

    let cache = state.cache.clone();
    let mut submit = tokio::task::spawn_blocking(move || cache.submit(key, worker, Some(listener)));

    let poll_interval = state.poll_interval.max(Duration::from_millis(10));
    let mut poll = tokio::time::interval(poll_interval);

    let outcome = loop {
        for payload in queue.drain() {
            if tx.send(Ok(progress_event(&payload))).await.is_err() {
                log::info!("[{request_id}] client disconnected, dropping subscription");
                queue.close();
                return;
            }
        }

        tokio::select! {
            outcome = &mut submit => break outcome,
            _ = queue.notified() => {}
            _ = poll.tick() => {
                if tx.is_closed() {
                    log::info!("[{request_id}] client disconnected, dropping subscription");
                    queue.close();
                    return;
                }
            }
        }
    };

    // the build is over; progress it reported still precedes the terminal
    queue.close();
    for payload in queue.drain() {
        if tx.send(Ok(progress_event(&payload))).await.is_err() {
            return;
        }
    }

    let terminal = match outcome {
        Ok(Ok(result)) => {
            log::info!("[{request_id}] complete");
            Event::default()
                .event("complete")
                .json_data(&result)
                .expect("result serializes")
        }
        Ok(Err(SubmitError::Cancelled)) => {
            log::info!("[{request_id}] cancelled");
            cancelled_event("Operation was cancelled")
        }
        Ok(Err(SubmitError::Worker(error))) => {
            log::warn!("[{request_id}] build failed: {error:#}");
            error_event(&format!("{error:#}"))
        }
        Err(join_error) => {
            log::error!("[{request_id}] submission task failed: {join_error}");
            error_event("internal error")
        }
    };
    let _ = tx.send(Ok(terminal)).await;
}

fn progress_event(payload: &ProgressPayload) -> Event {
    Event::default()
        .event("progress")
        .json_data(payload)
        .expect("payload serializes")
}

fn cancelled_event(message: &str) -> Event {
    Event::default()
        .event("cancelled")
        .json_data(CancelledPayload {
            message: message.to_owned(),
        })
        .expect("payload serializes")
}

fn error_event(message: &str) -> Event {
    Event::default()
        .event("error")
        .json_data(ErrorPayload {
            error: message.to_owned(),
        })
        .expect("payload serializes")
}

/// Bounded per-observer progress buffer.
///
/// The producer side is called from the build thread and never blocks: when
/// the buffer is full the oldest update is dropped, so the latest wins.
/// Closing the queue makes further pushes fail, which in turn unregisters
/// the broadcaster listener feeding it.
struct ProgressQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    items: VecDeque<ProgressPayload>,
    closed: bool,
}

impl ProgressQueue {
    fn new(capacity: usize) -> Self {
        ProgressQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, message: &str, percent: u8) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(anyhow!("progress queue closed"));
            }
            if inner.items.len() == self.capacity {
                inner.items.pop_front();
            }
            inner.items.push_back(ProgressPayload {
                message: message.to_owned(),
                progress: percent,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    fn drain(&self) -> Vec<ProgressPayload> {
        let mut inner = self.inner.lock().unwrap();
        inner.items.drain(..).collect()
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}
