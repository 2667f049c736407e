use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::events::{PipelinePhase, PipelineSnapshot, SessionId};
use crate::processing::layout::PairLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Source,
    DepthMap,
    Anaglyph,
}

impl ArtifactKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::DepthMap => "depth-map",
            Self::Anaglyph => "anaglyph",
        }
    }
}

/// Writes every newly displayed artifact of a snapshot stream to `dir` and
/// logs phase and layout changes. Never feeds anything back to the pipeline.
pub struct ArtifactWriter {
    dir: PathBuf,
    written: HashMap<ArtifactKind, (SessionId, Bytes)>,
    last_phase: Option<(Option<SessionId>, PipelinePhase)>,
    last_layout: Option<PairLayout>,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: HashMap::new(),
            last_phase: None,
            last_layout: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Handles one snapshot; returns the files written for it.
    pub async fn observe(&mut self, snapshot: &PipelineSnapshot) -> Result<Vec<PathBuf>> {
        self.log_changes(snapshot);

        let Some(session) = snapshot.session else {
            return Ok(Vec::new());
        };
        let artifacts = [
            (ArtifactKind::Source, &snapshot.source_image),
            (ArtifactKind::DepthMap, &snapshot.depth_map),
            (ArtifactKind::Anaglyph, &snapshot.anaglyph),
        ];

        let mut paths = Vec::new();
        for (kind, payload) in artifacts {
            let Some(payload) = payload else { continue };
            let unchanged = self
                .written
                .get(&kind)
                .is_some_and(|(s, bytes)| *s == session && bytes == payload);
            if unchanged {
                continue;
            }
            let path = self.dir.join(file_name(session, kind, payload));
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("failed to create {}", self.dir.display()))?;
            tokio::fs::write(&path, payload)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(
                %session,
                artifact = kind.as_str(),
                path = %path.display(),
                bytes = payload.len(),
                "exported artifact"
            );
            self.written.insert(kind, (session, payload.clone()));
            paths.push(path);
        }
        Ok(paths)
    }

    fn log_changes(&mut self, snapshot: &PipelineSnapshot) {
        let phase = (snapshot.session, snapshot.phase);
        if self.last_phase != Some(phase) {
            info!(
                session = ?snapshot.session,
                phase = ?snapshot.phase,
                upload_allowed = snapshot.upload_allowed,
                "pipeline phase"
            );
            if let Some(err) = &snapshot.last_error {
                warn!(error = %err, "last stage error");
            }
            self.last_phase = Some(phase);
        }

        if let Some(plan) = snapshot.layout() {
            if self.last_layout != Some(plan.layout) {
                info!(
                    layout = ?plan.layout,
                    pair_width = plan.pair.width,
                    pair_height = plan.pair.height,
                    "image pair layout"
                );
                self.last_layout = Some(plan.layout);
            }
        }
    }
}

fn file_name(session: SessionId, kind: ArtifactKind, payload: &[u8]) -> String {
    let ext = image::guess_format(payload)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin");
    format!("session-{}-{}.{}", session, kind.as_str(), ext)
}

/// Follows the snapshot stream until the pipeline drops its sender. The last
/// published snapshot is always observed before returning.
pub async fn run(mut snapshots: watch::Receiver<PipelineSnapshot>, dir: PathBuf) -> Result<()> {
    let mut writer = ArtifactWriter::new(dir);
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Err(err) = writer.observe(&snapshot).await {
            warn!("artifact export failed: {err:#}");
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
    debug!(dir = %writer.dir().display(), "exporter finished");
    Ok(())
}
