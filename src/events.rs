use std::fmt;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use serde::Deserialize;

use crate::error::StageError;
use crate::processing::layout::{LayoutPlan, plan_layout};

pub const MAX_STRENGTH: f32 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one anaglyph fetch within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageStatus {
    #[default]
    Idle,
    InFlight,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Prepare,
    Upload,
    DepthMap,
    Anaglyph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelinePhase {
    #[default]
    NoImage,
    Uploading,
    DepthMapPending,
    DepthMapReady,
    AnaglyphPending,
    AnaglyphReady,
    Failed(FailedStage),
}

/// Tunable inputs of the remote anaglyph render.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AnaglyphParameters {
    #[serde(default)]
    pub pop_out: bool,
    /// Maximum disparity as a percentage of the image width, in `[0, 6]`.
    #[serde(default = "AnaglyphParameters::default_strength")]
    pub strength: f32,
    #[serde(default)]
    pub minimize_rivalry: bool,
}

impl AnaglyphParameters {
    const fn default_strength() -> f32 {
        2.5
    }

    /// Clamps `strength` into the supported range. Returns `None` for NaN or infinities.
    pub fn clamp_strength(strength: f32) -> Option<f32> {
        strength
            .is_finite()
            .then(|| strength.clamp(0.0, MAX_STRENGTH))
    }

    pub fn with_pop_out(self, pop_out: bool) -> Self {
        Self { pop_out, ..self }
    }

    pub fn with_minimize_rivalry(self, minimize_rivalry: bool) -> Self {
        Self {
            minimize_rivalry,
            ..self
        }
    }

    pub fn with_strength(self, strength: f32) -> Option<Self> {
        Self::clamp_strength(strength).map(|strength| Self { strength, ..self })
    }
}

impl Default for AnaglyphParameters {
    fn default() -> Self {
        Self {
            pop_out: false,
            strength: Self::default_strength(),
            minimize_rivalry: false,
        }
    }
}

/// Display area available to the image pair, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Viewport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.trim().parse().context("invalid viewport width")?;
        let height = h.trim().parse().context("invalid viewport height")?;
        Ok(Self { width, height })
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone)]
pub enum UploadSource {
    /// Raw bytes of a user-selected file.
    File { name: String, bytes: Bytes },
    /// Ask the backend for one of its sample images.
    RandomSample,
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { name, bytes } => f
                .debug_struct("File")
                .field("name", name)
                .field("len", &bytes.len())
                .finish(),
            Self::RandomSample => f.write_str("RandomSample"),
        }
    }
}

/// Everything a front end may ask the pipeline to do.
#[derive(Debug, Clone)]
pub enum UserAction {
    Upload(UploadSource),
    SetPopOut(bool),
    SetMinimizeRivalry(bool),
    /// Commit a new strength immediately.
    SetStrength(f32),
    /// Move the strength slider without committing.
    DragStrength(f32),
    /// Commit the strength last set by `DragStrength`.
    ReleaseStrength,
    SetParameters(AnaglyphParameters),
    ResizeViewport(Viewport),
}

/// Read-only view of the coordinator, published after every handled event.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub session: Option<SessionId>,
    pub phase: PipelinePhase,
    pub upload_status: StageStatus,
    pub anaglyph_status: StageStatus,
    pub upload_allowed: bool,
    pub source_image: Option<Bytes>,
    pub depth_map: Option<Bytes>,
    pub anaglyph: Option<Bytes>,
    pub aspect_ratio: Option<f64>,
    pub parameters: AnaglyphParameters,
    pub strength_preview: Option<f32>,
    /// Parameters that produced the anaglyph currently shown.
    pub anaglyph_parameters: Option<AnaglyphParameters>,
    pub viewport: Option<Viewport>,
    pub last_error: Option<StageError>,
}

/// The state before any session: nothing in flight, so uploads are open.
impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            session: None,
            phase: PipelinePhase::NoImage,
            upload_status: StageStatus::Idle,
            anaglyph_status: StageStatus::Idle,
            upload_allowed: true,
            source_image: None,
            depth_map: None,
            anaglyph: None,
            aspect_ratio: None,
            parameters: AnaglyphParameters::default(),
            strength_preview: None,
            anaglyph_parameters: None,
            viewport: None,
            last_error: None,
        }
    }
}

impl PipelineSnapshot {
    pub fn depth_map_loading(&self) -> bool {
        self.phase == PipelinePhase::DepthMapPending
    }

    pub fn anaglyph_loading(&self) -> bool {
        self.anaglyph_status == StageStatus::InFlight
    }

    /// True once the current session has nothing left in flight and reached a
    /// terminal state for its latest parameters.
    pub fn is_settled(&self) -> bool {
        if self.session.is_none() {
            return false;
        }
        match self.upload_status {
            StageStatus::Failed => true,
            StageStatus::Ready => matches!(
                self.anaglyph_status,
                StageStatus::Ready | StageStatus::Failed
            ),
            StageStatus::Idle | StageStatus::InFlight => false,
        }
    }

    pub fn layout(&self) -> Option<LayoutPlan> {
        let aspect_ratio = self.aspect_ratio?;
        let viewport = self.viewport?;
        Some(plan_layout(aspect_ratio, viewport))
    }
}
