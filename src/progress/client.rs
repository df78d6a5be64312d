//! Client for the progress endpoints.

use futures::TryStreamExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use super::codec::decode_stream;
use super::event::ProgressEvent;
use crate::error::StreamError;

const CLIENT_BUFFER: usize = 64;

/// Reads progress streams from a knowledge-sync server.
#[derive(Clone)]
pub struct ProgressClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProgressClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Stream events of one run. The channel closes when the server ends the stream.
    pub async fn run_events(
        &self,
        run_id: &str,
        follow: bool,
    ) -> Result<mpsc::Receiver<ProgressEvent>, StreamError> {
        self.open(&format!("{}/runs/{run_id}/events", self.base_url), follow)
            .await
    }

    /// Stream events of every run in a thread.
    pub async fn thread_events(
        &self,
        thread: &str,
        follow: bool,
    ) -> Result<mpsc::Receiver<ProgressEvent>, StreamError> {
        self.open(&format!("{}/threads/{thread}/events", self.base_url), follow)
            .await
    }

    async fn open(
        &self,
        url: &str,
        follow: bool,
    ) -> Result<mpsc::Receiver<ProgressEvent>, StreamError> {
        let response = self
            .http
            .get(url)
            .query(&[("follow", follow)])
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let reader = BufReader::new(StreamReader::new(body));
        Ok(decode_stream(reader, CLIENT_BUFFER))
    }
}
