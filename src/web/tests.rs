use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::create_app;
use crate::RunOptions;
use crate::cache::{BuildFailure, CancelToken};
use crate::config::Settings;
use crate::engine::{BuildEngine, BuildRequest};

/// Scripted engine for driving the gateway: fixed stages, an optional
/// failure after them, and an invocation counter to prove singleflight.
struct TestEngine {
    stages: Vec<(u8, &'static str)>,
    stage_pause: Duration,
    failure: Option<&'static str>,
    builds: AtomicUsize,
}

impl TestEngine {
    fn new(
        stages: Vec<(u8, &'static str)>,
        stage_pause: Duration,
        failure: Option<&'static str>,
    ) -> Arc<Self> {
        Arc::new(TestEngine {
            stages,
            stage_pause,
            failure,
            builds: AtomicUsize::new(0),
        })
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl BuildEngine for TestEngine {
    fn build(
        &self,
        _request: &BuildRequest,
        report: &dyn Fn(&str, u8),
        cancel: &CancelToken,
    ) -> Result<Value, BuildFailure> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        for (percent, message) in &self.stages {
            std::thread::sleep(self.stage_pause);
            if cancel.is_set() {
                return Err(BuildFailure::Cancelled);
            }
            report(message, *percent);
        }
        if let Some(message) = self.failure {
            return Err(BuildFailure::Failed(anyhow!(message)));
        }
        Ok(json!({"objText": "model"}))
    }
}

fn test_app(engine: Arc<dyn BuildEngine>) -> Router {
    let (app, _shutdown_rx) = create_app(&RunOptions::new(Settings::default()), engine);
    app
}

fn stream_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Run one request to completion and split the SSE body into
/// `(event, payload)` records.
async fn collect_events(app: Router, uri: &str) -> Result<Vec<(String, Value)>> {
    let response = app.oneshot(stream_request(uri)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );

    let body = response.into_body().collect().await?.to_bytes();
    Ok(parse_sse(std::str::from_utf8(&body)?))
}

fn parse_sse(text: &str) -> Vec<(String, Value)> {
    text.split("\n\n")
        .filter(|record| !record.trim().is_empty())
        .map(|record| {
            let mut event = String::new();
            let mut data = String::new();
            for line in record.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = rest.to_owned();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data.push_str(rest);
                }
            }
            let payload = serde_json::from_str(&data).unwrap_or(Value::Null);
            (event, payload)
        })
        .collect()
}

fn progress_records(events: &[(String, Value)]) -> Vec<(String, u64)> {
    events
        .iter()
        .filter(|(event, _)| event == "progress")
        .map(|(_, payload)| {
            (
                payload["message"].as_str().unwrap_or_default().to_owned(),
                payload["progress"].as_u64().unwrap_or_default(),
            )
        })
        .collect()
}

fn terminal(events: &[(String, Value)]) -> &(String, Value) {
    events.last().expect("stream produced no events")
}

const T_SHAPE: &str = "/api/visualize/WindTurbine/stream?magnafpm.RotorDiskRadius=150&furling.Offset=125&user.WindTurbineShape=T";
const H_SHAPE: &str = "/api/visualize/WindTurbine/stream?magnafpm.RotorDiskRadius=250&furling.Offset=200&user.WindTurbineShape=H";

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_observers_share_one_build() -> Result<()> {
    let engine = TestEngine::new(
        vec![(25, "load"), (75, "build"), (100, "done")],
        Duration::from_millis(100),
        None,
    );
    let app = test_app(engine.clone());

    let (first, second) = tokio::join!(
        collect_events(app.clone(), T_SHAPE),
        collect_events(app.clone(), T_SHAPE),
    );

    for events in [first?, second?] {
        assert_eq!(
            progress_records(&events),
            vec![
                ("load".to_owned(), 25),
                ("build".to_owned(), 75),
                ("done".to_owned(), 100),
            ]
        );
        let (event, payload) = terminal(&events);
        assert_eq!(event, "complete");
        assert_eq!(payload, &json!({"objText": "model"}));
    }
    assert_eq!(engine.builds(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_request_hits_the_cache() -> Result<()> {
    let engine = TestEngine::new(vec![(50, "build")], Duration::from_millis(10), None);
    let app = test_app(engine.clone());

    let first = collect_events(app.clone(), T_SHAPE).await?;
    assert_eq!(terminal(&first).0, "complete");

    let second = collect_events(app.clone(), T_SHAPE).await?;
    assert_eq!(
        progress_records(&second),
        vec![("Using cached result".to_owned(), 100)]
    );
    assert_eq!(terminal(&second).0, "complete");
    assert_eq!(engine.builds(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn build_error_fans_out_to_every_observer() -> Result<()> {
    let engine = TestEngine::new(
        vec![(30, "load")],
        Duration::from_millis(100),
        Some("spreadsheet error"),
    );
    let app = test_app(engine.clone());

    let (first, second, third) = tokio::join!(
        collect_events(app.clone(), T_SHAPE),
        collect_events(app.clone(), T_SHAPE),
        collect_events(app.clone(), T_SHAPE),
    );

    for events in [first?, second?, third?] {
        assert_eq!(progress_records(&events), vec![("load".to_owned(), 30)]);
        let (event, payload) = terminal(&events);
        assert_eq!(event, "error");
        assert_eq!(payload, &json!({"error": "spreadsheet error"}));
    }

    // a later observer gets the cached error immediately, with no progress
    let late = collect_events(app.clone(), T_SHAPE).await?;
    assert_eq!(
        late,
        vec![("error".to_owned(), json!({"error": "spreadsheet error"}))]
    );
    assert_eq!(engine.builds(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn new_parameters_preempt_the_build_in_flight() -> Result<()> {
    let engine = TestEngine::new(
        vec![(10, "a"), (30, "b"), (50, "c"), (70, "d"), (90, "e")],
        Duration::from_millis(200),
        None,
    );
    let app = test_app(engine.clone());

    let preempted = tokio::spawn(collect_events(app.clone(), T_SHAPE));
    tokio::time::sleep(Duration::from_millis(350)).await;
    let successor = collect_events(app.clone(), H_SHAPE).await?;

    let preempted = preempted.await??;
    let (event, payload) = terminal(&preempted);
    assert_eq!(event, "cancelled");
    assert_eq!(payload, &json!({"message": "Operation was cancelled"}));

    assert_eq!(terminal(&successor).0, "complete");
    assert!(!progress_records(&successor).is_empty());
    assert_eq!(engine.builds(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_does_not_cancel_the_build() -> Result<()> {
    let engine = TestEngine::new(
        vec![(20, "a"), (40, "b"), (60, "c"), (80, "d"), (100, "e")],
        Duration::from_millis(150),
        None,
    );
    let app = test_app(engine.clone());

    // observer 1 connects but never reads its body, then goes away
    let abandoned = app.clone().oneshot(stream_request(T_SHAPE)).await?;
    let watcher = tokio::spawn(collect_events(app.clone(), T_SHAPE));

    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(abandoned);

    let events = watcher.await??;
    let (event, payload) = terminal(&events);
    assert_eq!(event, "complete");
    assert_eq!(payload, &json!({"objText": "model"}));
    assert!(!progress_records(&events).is_empty());
    assert_eq!(engine.builds(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_end_with_a_single_error_event() -> Result<()> {
    let engine = TestEngine::new(vec![], Duration::from_millis(1), None);
    let app = test_app(engine.clone());

    let unknown_group =
        collect_events(app.clone(), "/api/visualize/WindTurbine/stream?bogus.x=1").await?;
    assert_eq!(
        unknown_group,
        vec![(
            "error".to_owned(),
            json!({"error": "unknown parameter group 'bogus'"})
        )]
    );

    let undotted =
        collect_events(app.clone(), "/api/getcncoverview/stream?magnafpm=5").await?;
    assert_eq!(
        undotted,
        vec![(
            "error".to_owned(),
            json!({"error": "parameter 'magnafpm' is not of the form group.name"})
        )]
    );

    let bad_assembly = collect_events(app.clone(), "/api/visualize/Nonsense/stream").await?;
    assert_eq!(
        bad_assembly,
        vec![(
            "error".to_owned(),
            json!({"error": "Invalid assembly type: Nonsense"})
        )]
    );

    assert_eq!(engine.builds(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoints_with_same_parameters_are_distinct_builds() -> Result<()> {
    let engine = TestEngine::new(vec![(50, "build")], Duration::from_millis(10), None);
    let app = test_app(engine.clone());

    let overview = collect_events(
        app.clone(),
        "/api/getcncoverview/stream?magnafpm.RotorDiskRadius=150",
    )
    .await?;
    assert_eq!(terminal(&overview).0, "complete");

    let tables = collect_events(
        app.clone(),
        "/api/getdimensiontables/stream?magnafpm.RotorDiskRadius=150",
    )
    .await?;
    assert_eq!(terminal(&tables).0, "complete");

    // same parameters, different target: the second replaced the first
    assert_eq!(engine.builds(), 2);
    Ok(())
}

fn trigger_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn heartbeat_trigger_responds() -> Result<()> {
    let engine = TestEngine::new(vec![], Duration::from_millis(1), None);
    let app = test_app(engine);

    let response = app.oneshot(trigger_request("/api/trigger/heartbeat")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn begin_shutdown_cancels_the_build_in_flight() -> Result<()> {
    let engine = TestEngine::new(
        vec![(10, "a"), (30, "b"), (50, "c"), (70, "d"), (90, "e")],
        Duration::from_millis(200),
        None,
    );
    let app = test_app(engine.clone());

    let observer = tokio::spawn(collect_events(app.clone(), T_SHAPE));
    tokio::time::sleep(Duration::from_millis(350)).await;

    let response = app
        .clone()
        .oneshot(trigger_request("/api/trigger/begin_shutdown"))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let events = observer.await??;
    let (event, payload) = terminal(&events);
    assert_eq!(event, "cancelled");
    assert_eq!(payload, &json!({"message": "Operation was cancelled"}));
    Ok(())
}
