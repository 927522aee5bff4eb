//! End-to-end runs of the library against in-process axum servers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use loadstorm::capture::CapturedFailure;
use loadstorm::config::{RunConfig, StopCondition, Timeouts};
use loadstorm::controller::{InterruptSource, TerminationController, Trigger};
use loadstorm::template::RequestTemplate;
use loadstorm::LoadTest;

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn run_config(clients: usize, stop: StopCondition) -> RunConfig {
    RunConfig {
        clients,
        stop,
        timeouts: Timeouts::default(),
        capture_dir: None,
    }
}

fn template(url: String) -> RequestTemplate {
    RequestTemplate::builder().target(url).build().unwrap()
}

fn local(stop: StopCondition) -> TerminationController {
    TerminationController::new(stop, InterruptSource::Local)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quota_single_client_all_ok() {
    let url = serve(Router::new().route("/", get(|| async { "ok" }))).await;
    let stop = StopCondition::Requests(10);

    let outcome = LoadTest::new(run_config(1, stop), template(format!("{}/", url)))
        .run(local(stop))
        .await
        .unwrap();

    assert_eq!(outcome.trigger, Trigger::Completed);
    assert_eq!(outcome.summary.requests, 10);
    assert_eq!(outcome.summary.succeeded, 10);
    assert_eq!(outcome.summary.network_failed, 0);
    assert_eq!(outcome.summary.bad_status, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_status_with_capture() {
    let app = Router::new().route(
        "/",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
    );
    let url = serve(app).await;
    let dir = tempfile::TempDir::new().unwrap();
    let stop = StopCondition::Requests(5);

    let mut config = run_config(1, stop);
    config.capture_dir = Some(dir.path().join("captures"));

    let outcome = LoadTest::new(config, template(format!("{}/", url)))
        .run(local(stop))
        .await
        .unwrap();

    assert_eq!(outcome.summary.bad_status, 5);
    assert_eq!(outcome.summary.succeeded, 0);

    let content = std::fs::read_to_string(dir.path().join("captures/responses.json")).unwrap();
    let records: Vec<CapturedFailure> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.status_code == 500));
    assert!(records.iter().all(|r| r.run_id == outcome.run_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_throughput_covers_bodies() {
    const BODY_LEN: usize = 4096;
    let app = Router::new().route("/", get(|| async { vec![b'x'; BODY_LEN] }));
    let url = serve(app).await;
    let stop = StopCondition::Requests(25);

    let outcome = LoadTest::new(run_config(2, stop), template(format!("{}/", url)))
        .run(local(stop))
        .await
        .unwrap();

    assert_eq!(outcome.summary.succeeded, 50);
    assert!(outcome.summary.bytes_read >= (BODY_LEN * 50) as u64);
    assert!(outcome.summary.bytes_written > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_post_body_reaches_server() {
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let app = Router::new().route(
        "/ingest",
        post(move |body: axum::body::Bytes| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(body.len() as u64, Ordering::SeqCst);
                StatusCode::CREATED
            }
        }),
    );
    let url = serve(app).await;
    let stop = StopCondition::Requests(4);

    let template = RequestTemplate::builder()
        .target(format!("{}/ingest", url))
        .method("POST")
        .body(bytes::Bytes::from_static(b"0123456789"))
        .build()
        .unwrap();

    let outcome = LoadTest::new(run_config(1, stop), template)
        .run(local(stop))
        .await
        .unwrap();

    assert_eq!(outcome.summary.succeeded, 4);
    assert_eq!(received.load(Ordering::SeqCst), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_outcomes_sum_to_requests() {
    let hits = Arc::new(AtomicU64::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/",
        get(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) % 3 == 0 {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let url = serve(app).await;
    let stop = StopCondition::Requests(30);

    let outcome = LoadTest::new(run_config(4, stop), template(format!("{}/", url)))
        .run(local(stop))
        .await
        .unwrap();

    let s = &outcome.summary;
    assert_eq!(s.requests, 120);
    assert_eq!(s.requests, s.succeeded + s.network_failed + s.bad_status);
    assert_eq!(s.bad_status, 40);
    for worker in &outcome.workers {
        assert_eq!(worker.requests, 30);
        assert!(worker.is_consistent());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duration_run_stops_at_deadline() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let stop = StopCondition::Duration(Duration::from_secs(1));

    let start = Instant::now();
    let outcome = LoadTest::new(run_config(4, stop), template(format!("http://{}/", addr)))
        .run(local(stop))
        .await
        .unwrap();
    let took = start.elapsed();

    assert_eq!(outcome.trigger, Trigger::Deadline);
    assert!(took >= Duration::from_millis(950));
    assert!(took < Duration::from_secs(4));
    assert_eq!(outcome.summary.succeeded, 0);
    assert!(outcome.summary.requests > 0);
    assert_eq!(outcome.summary.network_failed, outcome.summary.requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupt_reports_partial_counts() {
    let app = Router::new().route(
        "/",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            "slow"
        }),
    );
    let url = serve(app).await;
    // Large enough that the quota cannot finish before the interrupt.
    let stop = StopCondition::Requests(1_000_000);

    let controller = local(stop);
    let handle = controller.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.interrupt();
    });

    let start = Instant::now();
    let outcome = LoadTest::new(run_config(2, stop), template(format!("{}/", url)))
        .run(controller)
        .await
        .unwrap();

    assert_eq!(outcome.trigger, Trigger::Interrupted);
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(outcome.summary.requests > 0);
    assert!(outcome.summary.requests < 2_000_000);
    assert_eq!(outcome.summary.elapsed_secs, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_controller_follows_run_config() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let stop = StopCondition::Requests(3);

    let test = LoadTest::new(run_config(2, stop), template(format!("http://{}/", addr)));
    let controller = test.controller(InterruptSource::Local);
    assert_eq!(controller.stop_condition(), stop);

    let outcome = test.run(controller).await.unwrap();
    assert_eq!(outcome.trigger, Trigger::Completed);
    assert_eq!(outcome.summary.requests, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mismatched_controller_is_rejected() {
    let config = run_config(1, StopCondition::Duration(Duration::from_secs(30)));
    let result = LoadTest::new(config, template("http://127.0.0.1:1/".into()))
        .run(local(StopCondition::Requests(1)))
        .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("configured for"), "{}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unopenable_capture_dir_fails_before_start() {
    let dir = tempfile::TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let stop = StopCondition::Requests(1);

    let mut config = run_config(1, stop);
    config.capture_dir = Some(blocker);

    let result = LoadTest::new(config, template("http://127.0.0.1:1/".into()))
        .run(local(stop))
        .await;
    assert!(result.is_err());
}
