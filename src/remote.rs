//! Calls to the depth-map / anaglyph backend.
//!
//! Every call is single-shot: no retries, no cancellation. Staleness of late
//! results is the coordinator's job, not the client's.

use std::future::Future;

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::Serialize;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::StageError;
use crate::events::AnaglyphParameters;

/// Acknowledgement returned by `POST /image`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack(pub serde_json::Value);

/// The remote stages as seen by the pipeline.
pub trait RemoteStages: Send + Sync + 'static {
    /// Uploads the session image; the server keeps it for the following calls.
    fn submit_image(&self, payload: Bytes) -> impl Future<Output = Result<Ack, StageError>> + Send;

    /// Only meaningful after a successful `submit_image`.
    fn fetch_depth_map(&self) -> impl Future<Output = Result<Bytes, StageError>> + Send;

    /// Only meaningful after a successful `fetch_depth_map`.
    fn fetch_anaglyph(
        &self,
        parameters: AnaglyphParameters,
    ) -> impl Future<Output = Result<Bytes, StageError>> + Send;

    fn fetch_random_image(&self) -> impl Future<Output = Result<Bytes, StageError>> + Send;
}

#[derive(Debug, Serialize)]
struct AnaglyphQuery {
    pop_out: bool,
    max_disparity_percentage: f32,
    #[serde(rename = "optimised_RR_anaglyph")]
    optimised_rr_anaglyph: bool,
}

impl From<AnaglyphParameters> for AnaglyphQuery {
    fn from(params: AnaglyphParameters) -> Self {
        Self {
            pop_out: params.pop_out,
            max_disparity_percentage: params.strength,
            optimised_rr_anaglyph: params.minimize_rivalry,
        }
    }
}

/// `RemoteStages` over HTTP with a cookie store, so the server-side session
/// created by `/image` carries over to the later calls.
#[derive(Debug, Clone)]
pub struct HttpStageClient {
    http: Client,
    base: Url,
}

impl HttpStageClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base = parse_base_url(&config.base_url)?;
        let http = Client::builder()
            .cookie_store(true)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, StageError> {
        self.base.join(path).map_err(StageError::network)
    }
}

/// Parses the backend URL, making sure relative joins keep its path.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut base = Url::parse(raw).with_context(|| format!("invalid backend url {raw:?}"))?;
    ensure!(
        matches!(base.scheme(), "http" | "https"),
        "backend url must use http or https, got {:?}",
        base.scheme()
    );
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

async fn read_payload(response: Response, stage: &'static str) -> Result<Bytes, StageError> {
    let response = response.error_for_status().map_err(StageError::network)?;
    let body = response.bytes().await.map_err(StageError::network)?;
    if body.is_empty() {
        return Err(StageError::EmptyPayload { stage });
    }
    debug!(stage, bytes = body.len(), "received payload");
    Ok(body)
}

impl RemoteStages for HttpStageClient {
    async fn submit_image(&self, payload: Bytes) -> Result<Ack, StageError> {
        let url = self.endpoint("image")?;
        let part = Part::stream(payload)
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(StageError::network)?;
        let form = Form::new().part("file", part);
        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(StageError::network)?;
        let body = read_payload(response, "upload").await?;
        // A non-JSON acknowledgement is kept verbatim.
        let ack = serde_json::from_slice(&body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()));
        Ok(Ack(ack))
    }

    async fn fetch_depth_map(&self) -> Result<Bytes, StageError> {
        let url = self.endpoint("depth-map")?;
        let response = self.http.get(url).send().await.map_err(StageError::network)?;
        read_payload(response, "depth-map").await
    }

    async fn fetch_anaglyph(&self, parameters: AnaglyphParameters) -> Result<Bytes, StageError> {
        let url = self.endpoint("anaglyph")?;
        let response = self
            .http
            .get(url)
            .query(&AnaglyphQuery::from(parameters))
            .send()
            .await
            .map_err(StageError::network)?;
        read_payload(response, "anaglyph").await
    }

    async fn fetch_random_image(&self) -> Result<Bytes, StageError> {
        let url = self.endpoint("random_image")?;
        let response = self.http.get(url).send().await.map_err(StageError::network)?;
        read_payload(response, "random-image").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() {
        let base = parse_base_url("http://localhost:8000/api").unwrap();
        assert_eq!(base.join("image").unwrap().as_str(), "http://localhost:8000/api/image");
        let base = parse_base_url("http://localhost:8000").unwrap();
        assert_eq!(base.join("depth-map").unwrap().as_str(), "http://localhost:8000/depth-map");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(parse_base_url("ftp://example.com/").is_err());
        assert!(parse_base_url("not a url").is_err());
    }

    #[test]
    fn anaglyph_query_uses_backend_field_names() {
        let params = AnaglyphParameters {
            pop_out: true,
            strength: 3.5,
            minimize_rivalry: false,
        };
        let json = serde_json::to_value(AnaglyphQuery::from(params)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "pop_out": true,
                "max_disparity_percentage": 3.5,
                "optimised_RR_anaglyph": false,
            })
        );
    }
}
