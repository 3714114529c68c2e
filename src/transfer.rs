// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::TransferError;

/// A streaming response body.
///
/// Transport errors are carried as `std::io::Error` so mock clients can
/// fabricate mid-stream failures.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Streaming response with status and optional content length
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Get a streaming response for a media download
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, std::io::Error>;
}

/// Default HTTP client implementation using reqwest
#[derive(Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, std::io::Error> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(std::io::Error::other)?;
        let status = response.status().as_u16();
        let content_length = response.content_length();

        let body: ByteStream =
            Box::pin(response.bytes_stream().map(|r| r.map_err(std::io::Error::other)));

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}

/// A finished transfer: bytes sitting at a transient location.
///
/// The location is only guaranteed to live until the caller commits or
/// discards it; the orchestrator moves it into the file store synchronously.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub temp_path: PathBuf,
    pub bytes: u64,
}

/// Performs one remote-to-local byte transfer per call, reporting
/// fractional progress through the watch channel and aborting promptly when
/// the token is cancelled
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn fetch(
        &self,
        source: &Url,
        progress: watch::Sender<f32>,
        cancel: CancellationToken,
    ) -> Result<CompletedTransfer, TransferError>;
}

/// Transfer engine streaming over HTTP into `.partial` files in a staging
/// directory. Partial bytes are discarded on failure or cancellation.
pub struct HttpTransferEngine<C> {
    client: C,
    staging_dir: PathBuf,
    next_id: AtomicU64,
}

impl<C: HttpClient> HttpTransferEngine<C> {
    pub fn new(client: C, staging_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(staging_dir)?;
        Ok(Self {
            client,
            staging_dir: staging_dir.to_path_buf(),
            next_id: AtomicU64::new(0),
        })
    }

    fn next_temp_path(&self) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.staging_dir.join(format!("transfer-{id}.partial"))
    }
}

#[async_trait]
impl<C: HttpClient> TransferEngine for HttpTransferEngine<C> {
    async fn fetch(
        &self,
        source: &Url,
        progress: watch::Sender<f32>,
        cancel: CancellationToken,
    ) -> Result<CompletedTransfer, TransferError> {
        let url = source.as_str();
        let temp_path = self.next_temp_path();

        let result = self
            .stream_to_file(url, &temp_path, &progress, &cancel)
            .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }
}

impl<C: HttpClient> HttpTransferEngine<C> {
    async fn stream_to_file(
        &self,
        url: &str,
        temp_path: &Path,
        progress: &watch::Sender<f32>,
        cancel: &CancellationToken,
    ) -> Result<CompletedTransfer, TransferError> {
        // Biased so a cancelled token wins over an already-ready stream
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = self.client.get_stream(url) => {
                response.map_err(|e| TransferError::HttpFailed {
                    url: url.to_string(),
                    source: e,
                })?
            }
        };

        if response.status >= 400 {
            return Err(TransferError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let mut file = File::create(temp_path)
            .await
            .map_err(|e| TransferError::FileCreateFailed {
                path: temp_path.to_path_buf(),
                source: e,
            })?;

        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.body;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                chunk = stream.next() => chunk,
            };

            let Some(chunk_result) = chunk else { break };
            let chunk = chunk_result.map_err(|e| TransferError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::FileWriteFailed {
                    path: temp_path.to_path_buf(),
                    source: e,
                })?;

            bytes_downloaded += chunk.len() as u64;
            if let Some(total) = response.content_length
                && total > 0
            {
                let _ = progress.send(bytes_downloaded as f32 / total as f32);
            }
        }

        file.flush()
            .await
            .map_err(|e| TransferError::FileWriteFailed {
                path: temp_path.to_path_buf(),
                source: e,
            })?;

        let _ = progress.send(1.0);
        debug!(url, bytes = bytes_downloaded, "transfer complete");

        Ok(CompletedTransfer {
            temp_path: temp_path.to_path_buf(),
            bytes: bytes_downloaded,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockHttpClient;
    use super::*;
    use tempfile::tempdir;

    fn source() -> Url {
        Url::parse("https://example.com/ep1.mp3").unwrap()
    }

    #[tokio::test]
    async fn fetch_writes_temp_file_and_reports_progress() {
        let dir = tempdir().unwrap();
        let engine = HttpTransferEngine::new(
            MockHttpClient {
                chunks: vec![b"half one ".to_vec(), b"half two".to_vec()],
                status: 200,
                fail_after_chunks: None,
            },
            dir.path(),
        )
        .unwrap();

        let (progress_tx, progress_rx) = watch::channel(0.0f32);
        let completed = engine
            .fetch(&source(), progress_tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completed.bytes, 17);
        assert!(completed.temp_path.ends_with("transfer-0.partial"));
        assert_eq!(std::fs::read(&completed.temp_path).unwrap(), b"half one half two");
        assert_eq!(*progress_rx.borrow(), 1.0);
    }

    #[tokio::test]
    async fn fetch_fails_on_http_status() {
        let dir = tempdir().unwrap();
        let engine = HttpTransferEngine::new(
            MockHttpClient {
                chunks: vec![b"Not Found".to_vec()],
                status: 404,
                fail_after_chunks: None,
            },
            dir.path(),
        )
        .unwrap();

        let (progress_tx, _) = watch::channel(0.0f32);
        let result = engine
            .fetch(&source(), progress_tx, CancellationToken::new())
            .await;

        match result.unwrap_err() {
            TransferError::HttpStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_discards_partial_bytes() {
        let dir = tempdir().unwrap();
        let engine = HttpTransferEngine::new(
            MockHttpClient {
                chunks: vec![b"first half".to_vec()],
                status: 200,
                fail_after_chunks: Some("transport error".to_string()),
            },
            dir.path(),
        )
        .unwrap();

        let (progress_tx, progress_rx) = watch::channel(0.0f32);
        let result = engine
            .fetch(&source(), progress_tx, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(TransferError::StreamFailed { .. })));
        // Half the advertised content length arrived before the failure
        assert_eq!(*progress_rx.borrow(), 0.5);
        // Partial file was cleaned up
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_bytes() {
        let dir = tempdir().unwrap();
        let engine =
            HttpTransferEngine::new(MockHttpClient::with_body(b"audio"), dir.path()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (progress_tx, _) = watch::channel(0.0f32);
        let result = engine.fetch(&source(), progress_tx, cancel).await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn temp_paths_are_unique_per_transfer() {
        let dir = tempdir().unwrap();
        let engine =
            HttpTransferEngine::new(MockHttpClient::with_body(b"audio"), dir.path()).unwrap();

        let (tx1, _) = watch::channel(0.0f32);
        let (tx2, _) = watch::channel(0.0f32);
        let a = engine
            .fetch(&source(), tx1, CancellationToken::new())
            .await
            .unwrap();
        let b = engine
            .fetch(&source(), tx2, CancellationToken::new())
            .await
            .unwrap();

        assert_ne!(a.temp_path, b.temp_path);
    }
}
