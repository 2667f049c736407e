use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::events::{AnaglyphParameters, MAX_STRENGTH};
use crate::processing::resize::DEFAULT_JPEG_QUALITY;
use crate::remote::parse_base_url;

pub const BACKEND_URL_ENV: &str = "ANAGLYPH_BACKEND_URL";
pub const MAX_DIMENSION_ENV: &str = "ANAGLYPH_MAX_DIMENSION";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "BackendConfig::default_base_url")]
    pub base_url: String,
    /// Upper bound for a whole request, including the depth-map computation.
    #[serde(
        default = "BackendConfig::default_request_timeout",
        with = "humantime_serde"
    )]
    pub request_timeout: Duration,
    #[serde(
        default = "BackendConfig::default_connect_timeout",
        with = "humantime_serde"
    )]
    pub connect_timeout: Duration,
}

impl BackendConfig {
    fn default_base_url() -> String {
        "http://localhost:8000/".to_string()
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(120)
    }

    const fn default_connect_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            request_timeout: Self::default_request_timeout(),
            connect_timeout: Self::default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UploadConfig {
    /// Longest side of the uploaded JPEG; larger images are shrunk client side.
    #[serde(default = "UploadConfig::default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "UploadConfig::default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl UploadConfig {
    const fn default_max_dimension() -> u32 {
        1024
    }

    const fn default_jpeg_quality() -> u8 {
        DEFAULT_JPEG_QUALITY
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_dimension: Self::default_max_dimension(),
            jpeg_quality: Self::default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Configuration {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    /// Parameters used for the first anaglyph of a run.
    #[serde(default)]
    pub anaglyph: AnaglyphParameters,
    /// Where exported artifacts are written.
    #[serde(default = "Configuration::default_output_directory")]
    pub output_directory: PathBuf,
    /// Capacity of the user-action channel feeding the coordinator.
    #[serde(default = "Configuration::default_action_queue_depth")]
    pub action_queue_depth: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            upload: UploadConfig::default(),
            anaglyph: AnaglyphParameters::default(),
            output_directory: Self::default_output_directory(),
            action_queue_depth: Self::default_action_queue_depth(),
        }
    }
}

impl Configuration {
    fn default_output_directory() -> PathBuf {
        PathBuf::from("anaglyph-output")
    }

    const fn default_action_queue_depth() -> usize {
        16
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_yaml::from_str(&s)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Applies `ANAGLYPH_BACKEND_URL` / `ANAGLYPH_MAX_DIMENSION` from the environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(
            std::env::var(BACKEND_URL_ENV).ok(),
            std::env::var(MAX_DIMENSION_ENV).ok(),
        )
    }

    pub fn with_overrides(
        mut self,
        backend_url: Option<String>,
        max_dimension: Option<String>,
    ) -> Result<Self> {
        if let Some(url) = backend_url.filter(|url| !url.trim().is_empty()) {
            self.backend.base_url = url.trim().to_string();
        }
        if let Some(raw) = max_dimension {
            self.upload.max_dimension = raw
                .trim()
                .parse()
                .with_context(|| format!("{MAX_DIMENSION_ENV} must be a positive integer, got {raw:?}"))?;
        }
        Ok(self)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        parse_base_url(&self.backend.base_url).context("invalid backend.base-url")?;
        ensure!(
            !self.backend.request_timeout.is_zero(),
            "backend.request-timeout must be greater than zero"
        );
        ensure!(
            !self.backend.connect_timeout.is_zero(),
            "backend.connect-timeout must be greater than zero"
        );
        ensure!(
            self.upload.max_dimension > 0,
            "upload.max-dimension must be greater than zero"
        );
        ensure!(
            (1..=100).contains(&self.upload.jpeg_quality),
            "upload.jpeg-quality must be between 1 and 100"
        );
        ensure!(
            self.anaglyph.strength.is_finite()
                && (0.0..=MAX_STRENGTH).contains(&self.anaglyph.strength),
            "anaglyph.strength must be between 0 and {MAX_STRENGTH}"
        );
        ensure!(
            self.action_queue_depth > 0,
            "action-queue-depth must be greater than zero"
        );
        Ok(self)
    }
}
