use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use eduinfo_core::SourceDescriptor;
use eduinfo_storage::{
    sha256_hex, BackoffPolicy, DownloadError, Downloader, FetchError, HttpClientConfig,
    HttpDownloader, HttpFetcher, RemoteProbe,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CSV_BODY: &str = "uai;nom;ips\n0010001A;College A;103,4\n0010002B;College B;98,1\n";

async fn spawn_server() -> String {
    let app = Router::new()
        .route(
            "/ips.csv",
            get(|| async {
                (
                    [
                        (header::LAST_MODIFIED, "Sat, 15 Jun 2024 00:00:00 GMT"),
                        (header::CONTENT_TYPE, "text/csv"),
                    ],
                    CSV_BODY,
                )
            }),
        )
        .route("/no-header.csv", get(|| async { CSV_BODY }))
        .route("/missing.csv", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
        .route(
            "/catalog/datasets/fr-en-ips-colleges",
            get(|| async {
                Json(serde_json::json!({
                    "dataset_id": "fr-en-ips-colleges",
                    "metas": { "default": { "data_processed": "2024-03-01T00:00:00+00:00" } }
                }))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Announces a 100000 byte body, sends one CSV line, then closes or stalls the connection.
async fn spawn_truncating_server(stall: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0u8; 2048];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: 100000\r\n\r\nuai;nom;ips\n",
                    )
                    .await;
                let _ = socket.flush().await;
                if stall {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            });
        }
    });
    format!("http://{addr}/partial.csv")
}

fn fetcher() -> Arc<HttpFetcher> {
    Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::none(),
            ..Default::default()
        })
        .unwrap(),
    )
}

fn source(id: &str, url: String) -> SourceDescriptor {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "url": url,
        "provider": "data.education.gouv.fr",
        "type": "csv",
        "enabled": true
    }))
    .unwrap()
}

#[tokio::test]
async fn head_probe_reads_last_modified() {
    let base = spawn_server().await;
    let fetcher = fetcher();

    let found = fetcher.last_modified(&format!("{base}/ips.csv")).await.unwrap();
    assert_eq!(found.as_deref(), Some("Sat, 15 Jun 2024 00:00:00 GMT"));

    let absent = fetcher
        .last_modified(&format!("{base}/no-header.csv"))
        .await
        .unwrap();
    assert_eq!(absent, None);
}

#[tokio::test]
async fn head_probe_surfaces_error_statuses() {
    let base = spawn_server().await;
    let err = fetcher()
        .last_modified(&format!("{base}/missing.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
}

#[tokio::test]
async fn json_probe_returns_catalog_payload() {
    let base = spawn_server().await;
    let value = fetcher()
        .json(&format!("{base}/catalog/datasets/fr-en-ips-colleges"))
        .await
        .unwrap();
    assert_eq!(
        value["metas"]["default"]["data_processed"],
        "2024-03-01T00:00:00+00:00"
    );
}

#[tokio::test]
async fn download_writes_file_and_reports_metadata() {
    let base = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let downloader = HttpDownloader::new(fetcher(), dir.path().join("downloads"));

    let file = downloader
        .download(&source("ips_colleges", format!("{base}/ips.csv")))
        .await
        .unwrap();

    assert_eq!(file.size, CSV_BODY.len() as u64);
    assert_eq!(file.sha256, sha256_hex(CSV_BODY.as_bytes()));
    assert_eq!(file.last_modified.as_deref(), Some("Sat, 15 Jun 2024 00:00:00 GMT"));
    assert_eq!(std::fs::read_to_string(&file.path).unwrap(), CSV_BODY);
    assert!(file
        .path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("ips_colleges_"));
}

#[tokio::test]
async fn failed_download_leaves_no_files_behind() {
    let base = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let download_dir = dir.path().join("downloads");
    let downloader = HttpDownloader::new(fetcher(), &download_dir);

    let err = downloader
        .download(&source("criminalite", format!("{base}/missing.csv")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::Fetch(FetchError::HttpStatus { status: 404, .. })
    ));
    assert_eq!(std::fs::read_dir(&download_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn truncated_body_removes_the_partial_file() {
    let url = spawn_truncating_server(false).await;
    let dir = tempfile::tempdir().unwrap();
    let download_dir = dir.path().join("downloads");
    let downloader = HttpDownloader::new(fetcher(), &download_dir);

    let err = downloader
        .download(&source("criminalite", url))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Fetch(FetchError::Request { .. })));
    assert_eq!(std::fs::read_dir(&download_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn dropped_download_removes_the_partial_file() {
    let url = spawn_truncating_server(true).await;
    let dir = tempfile::tempdir().unwrap();
    let download_dir = dir.path().join("downloads");
    let downloader = HttpDownloader::new(fetcher(), &download_dir);
    let src = source("criminalite", url);

    let outcome =
        tokio::time::timeout(Duration::from_millis(500), downloader.download(&src)).await;

    assert!(outcome.is_err());
    let left = std::fs::read_dir(&download_dir).map_or(0, |entries| entries.count());
    assert_eq!(left, 0);
}

#[tokio::test]
async fn sample_reads_only_leading_lines() {
    let base = spawn_server().await;
    let sample = fetcher()
        .sample_lines(&format!("{base}/ips.csv"), 2)
        .await
        .unwrap();

    assert_eq!(sample.lines, vec!["uai;nom;ips", "0010001A;College A;103,4"]);
    assert!(!sample.partial);
}
