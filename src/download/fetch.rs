use crate::error::{FetchError, PresetError, Result};
use crate::progress::TaskControl;
use crate::registry::FileSpec;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Transfers one remote artifact into a local file
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stream `spec.url` into `dest`, truncating it first.
    /// `progress` receives the bytes written so far; returns the total.
    async fn fetch(
        &self,
        spec: &FileSpec,
        dest: &Path,
        control: &TaskControl,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> std::result::Result<u64, FetchError>;
}

/// Streaming HTTP(S) fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("preset-fetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PresetError::Http(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            read_timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        spec: &FileSpec,
        dest: &Path,
        control: &TaskControl,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> std::result::Result<u64, FetchError> {
        let request = tokio::time::timeout(self.read_timeout, self.client.get(&spec.url).send());
        let response = tokio::select! {
            () = control.cancelled() => return Err(FetchError::Cancelled),
            response = request => match response {
                Ok(response) => response.map_err(FetchError::from_reqwest)?,
                Err(_) => {
                    return Err(FetchError::Timeout(format!(
                        "no response from {} within {}s",
                        spec.url,
                        self.read_timeout.as_secs()
                    )))
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: spec.url.clone(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                () = control.cancelled() => return Err(FetchError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(FetchError::from_reqwest(e)),
                Ok(None) => break,
                Err(_) => {
                    return Err(FetchError::Timeout(format!(
                        "stalled after {written} bytes from {}",
                        spec.url
                    )))
                }
            };

            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written);

            if !control.checkpoint().await {
                return Err(FetchError::Cancelled);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        tracing::debug!("Fetched {written} bytes from {}", spec.url);
        Ok(written)
    }
}
