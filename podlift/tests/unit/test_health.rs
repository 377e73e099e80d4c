//! Health prober against a local stub endpoint

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use podlift::docker::health::{HealthProber, HttpProber, ProbeRequest};
use podlift::errors::PodliftError;

/// Serve `/health`, answering 503 for the first `failures` requests
async fn stub(failures: u32) -> (String, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/health",
        get(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < failures {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/health", addr), hits)
}

fn request(url: &str, attempts: u32) -> ProbeRequest {
    ProbeRequest {
        interval: Some(Duration::from_millis(10)),
        timeout: Some(Duration::from_secs(2)),
        attempts: Some(attempts),
        ..ProbeRequest::new(url)
    }
}

#[tokio::test]
async fn test_passes_on_first_accepted_status() {
    let (url, hits) = stub(2).await;
    let prober = HttpProber::new().unwrap();

    let attempt = prober.probe(&request(&url, 5)).await.unwrap();
    assert_eq!(attempt, 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_gives_up_after_configured_attempts() {
    let (url, hits) = stub(u32::MAX).await;
    let prober = HttpProber::new().unwrap();

    match prober.probe(&request(&url, 4)).await {
        Err(PodliftError::HealthCheckFailed { attempts, reason }) => {
            assert_eq!(attempts, 4);
            assert!(reason.contains("503"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_expected_codes_are_respected() {
    let (url, _) = stub(0).await;
    let prober = HttpProber::new().unwrap();

    let mut req = request(&url, 2);
    req.expected = vec![204];
    assert!(prober.probe(&req).await.is_err());

    req.expected = vec![200, 204];
    assert_eq!(prober.probe(&req).await.unwrap(), 1);
}
