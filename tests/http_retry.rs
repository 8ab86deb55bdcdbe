//! HTTP client retry behavior against a local socket, no real network.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use librarium::error::LibrariumError;
use librarium::providers::http::HttpClient;

/// Serve one canned HTTP response per connection, picked by connection
/// index, then close.
async fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let body = *responses.get(n).unwrap_or(responses.last().unwrap());
            tokio::spawn(async move {
                // Drain the request head before replying.
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(body.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}/"), hits)
}

const ERROR_500: &str =
    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\noops";
const OK_200: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"ok\":true}";
const NOT_FOUND_404: &str =
    "HTTP/1.1 404 Not Found\r\nContent-Length: 7\r\nConnection: close\r\n\r\nmissing";

#[tokio::test]
async fn two_500s_then_200_succeeds_on_third_attempt() {
    let (url, hits) = serve(vec![ERROR_500, ERROR_500, OK_200]).await;

    let client = HttpClient::new();
    let response = client
        .request(
            Method::GET,
            &url,
            &[],
            None,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_json().unwrap()["ok"], true);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn persistent_500_is_returned_after_max_retries() {
    let (url, hits) = serve(vec![ERROR_500]).await;

    let client = HttpClient::new();
    let response = client
        .request(
            Method::GET,
            &url,
            &[],
            None,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Terminal 500 comes back as a response for the caller to fold.
    assert_eq!(response.status, 500);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn plain_404_is_not_retried() {
    let (url, hits) = serve(vec![NOT_FOUND_404]).await;

    let client = HttpClient::new();
    let response = client
        .request(
            Method::GET,
            &url,
            &[],
            None,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.status_text, "Not Found");
    assert!(matches!(
        response.body,
        librarium::providers::http::HttpBody::Text(_)
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pre_cancelled_request_aborts_immediately() {
    let (url, _hits) = serve(vec![OK_200]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let client = HttpClient::new();
    let err = client
        .request(Method::GET, &url, &[], None, Duration::from_secs(10), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, LibrariumError::Cancelled));
}
