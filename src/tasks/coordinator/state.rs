use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::events::{
    AnaglyphParameters, FailedStage, PipelinePhase, PipelineSnapshot, RequestId, SessionId,
    StageStatus, UploadSource, UserAction, Viewport,
};
use crate::processing::resize::ResizedImage;
use crate::remote::Ack;

/// Work the coordinator wants done. Each command carries the identity that
/// was current when it was issued.
#[derive(Debug, Clone)]
pub enum Command {
    /// Resize a local file, or fetch and resize a random sample.
    Prepare {
        session: SessionId,
        source: UploadSource,
    },
    Submit {
        session: SessionId,
        payload: Bytes,
    },
    FetchDepthMap {
        session: SessionId,
    },
    FetchAnaglyph {
        session: SessionId,
        request: RequestId,
        parameters: AnaglyphParameters,
    },
}

impl Command {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Prepare { session, .. }
            | Self::Submit { session, .. }
            | Self::FetchDepthMap { session }
            | Self::FetchAnaglyph { session, .. } => *session,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            Self::Prepare { .. } => "prepare",
            Self::Submit { .. } => "upload",
            Self::FetchDepthMap { .. } => "depth-map",
            Self::FetchAnaglyph { .. } => "anaglyph",
        }
    }
}

/// Result of a command, tagged with the identity it was issued under.
#[derive(Debug, Clone)]
pub enum Completion {
    Prepared {
        session: SessionId,
        result: Result<ResizedImage, StageError>,
    },
    Submitted {
        session: SessionId,
        result: Result<Ack, StageError>,
    },
    DepthMap {
        session: SessionId,
        result: Result<Bytes, StageError>,
    },
    Anaglyph {
        session: SessionId,
        request: RequestId,
        result: Result<Bytes, StageError>,
    },
}

impl Completion {
    /// The completion a command would have produced had it failed with `error`.
    pub fn failed(command: &Command, error: StageError) -> Self {
        match *command {
            Command::Prepare { session, .. } => Self::Prepared {
                session,
                result: Err(error),
            },
            Command::Submit { session, .. } => Self::Submitted {
                session,
                result: Err(error),
            },
            Command::FetchDepthMap { session } => Self::DepthMap {
                session,
                result: Err(error),
            },
            Command::FetchAnaglyph {
                session, request, ..
            } => Self::Anaglyph {
                session,
                request,
                result: Err(error),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    NoImage,
    Preparing,
    Submitting,
    FetchingDepthMap,
    DepthMapReady,
    Failed(FailedStage),
}

#[derive(Debug, Clone)]
struct Session {
    id: SessionId,
    source_image: Option<Bytes>,
    aspect_ratio: Option<f64>,
    depth_map: Option<Bytes>,
    anaglyph: Option<Bytes>,
    anaglyph_parameters: Option<AnaglyphParameters>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            source_image: None,
            aspect_ratio: None,
            depth_map: None,
            anaglyph: None,
            anaglyph_parameters: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlightAnaglyph {
    request: RequestId,
    revision: u64,
    parameters: AnaglyphParameters,
}

/// Latest-wins slot for anaglyph parameters. `revision` changes on every
/// mutation so two revisions with equal values are still told apart.
#[derive(Debug, Clone)]
struct AnaglyphSlot {
    parameters: AnaglyphParameters,
    revision: u64,
    strength_preview: Option<f32>,
    in_flight: Option<InFlightAnaglyph>,
    status: StageStatus,
}

/// Owns the session and sequences upload → depth map → anaglyph.
///
/// Pure: it never performs I/O. Callers feed it user actions and stage
/// completions and execute the commands it hands back.
#[derive(Debug)]
pub struct PipelineCoordinator {
    next_session: u64,
    next_request: u64,
    session: Option<Session>,
    chain: ChainState,
    anaglyph: AnaglyphSlot,
    viewport: Option<Viewport>,
    last_error: Option<StageError>,
}

impl PipelineCoordinator {
    pub fn new(parameters: AnaglyphParameters) -> Self {
        Self {
            next_session: 1,
            next_request: 1,
            session: None,
            chain: ChainState::NoImage,
            anaglyph: AnaglyphSlot {
                parameters,
                revision: 0,
                strength_preview: None,
                in_flight: None,
                status: StageStatus::Idle,
            },
            viewport: None,
            last_error: None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn parameters(&self) -> AnaglyphParameters {
        self.anaglyph.parameters
    }

    /// Gate for new uploads: closed while an upload/depth-map chain is in flight.
    pub fn upload_allowed(&self) -> bool {
        !matches!(
            self.chain,
            ChainState::Preparing | ChainState::Submitting | ChainState::FetchingDepthMap
        )
    }

    pub fn upload_status(&self) -> StageStatus {
        match self.chain {
            ChainState::NoImage => StageStatus::Idle,
            ChainState::Preparing | ChainState::Submitting | ChainState::FetchingDepthMap => {
                StageStatus::InFlight
            }
            ChainState::DepthMapReady => StageStatus::Ready,
            ChainState::Failed(_) => StageStatus::Failed,
        }
    }

    pub fn anaglyph_status(&self) -> StageStatus {
        self.anaglyph.status
    }

    pub fn phase(&self) -> PipelinePhase {
        match self.chain {
            ChainState::NoImage => PipelinePhase::NoImage,
            ChainState::Preparing | ChainState::Submitting => PipelinePhase::Uploading,
            ChainState::FetchingDepthMap => PipelinePhase::DepthMapPending,
            ChainState::Failed(stage) => PipelinePhase::Failed(stage),
            ChainState::DepthMapReady => match self.anaglyph.status {
                StageStatus::Idle => PipelinePhase::DepthMapReady,
                StageStatus::InFlight => PipelinePhase::AnaglyphPending,
                StageStatus::Ready => PipelinePhase::AnaglyphReady,
                StageStatus::Failed => PipelinePhase::Failed(FailedStage::Anaglyph),
            },
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        let session = self.session.as_ref();
        PipelineSnapshot {
            session: session.map(|s| s.id),
            phase: self.phase(),
            upload_status: self.upload_status(),
            anaglyph_status: self.anaglyph.status,
            upload_allowed: self.upload_allowed(),
            source_image: session.and_then(|s| s.source_image.clone()),
            depth_map: session.and_then(|s| s.depth_map.clone()),
            anaglyph: session.and_then(|s| s.anaglyph.clone()),
            aspect_ratio: session.and_then(|s| s.aspect_ratio),
            parameters: self.anaglyph.parameters,
            strength_preview: self.anaglyph.strength_preview,
            anaglyph_parameters: session.and_then(|s| s.anaglyph_parameters),
            viewport: self.viewport,
            last_error: self.last_error.clone(),
        }
    }

    pub fn on_action(&mut self, action: UserAction) -> Option<Command> {
        let params = self.anaglyph.parameters;
        match action {
            UserAction::Upload(source) => self.request_upload(source),
            UserAction::SetPopOut(pop_out) => self.set_parameters(params.with_pop_out(pop_out)),
            UserAction::SetMinimizeRivalry(on) => {
                self.set_parameters(params.with_minimize_rivalry(on))
            }
            UserAction::SetStrength(strength) => {
                self.anaglyph.strength_preview = None;
                match params.with_strength(strength) {
                    Some(next) => self.set_parameters(next),
                    None => {
                        warn!(strength, "ignoring non-finite strength");
                        None
                    }
                }
            }
            UserAction::DragStrength(strength) => {
                match AnaglyphParameters::clamp_strength(strength) {
                    Some(preview) => self.anaglyph.strength_preview = Some(preview),
                    None => warn!(strength, "ignoring non-finite strength"),
                }
                None
            }
            UserAction::ReleaseStrength => {
                let preview = self.anaglyph.strength_preview.take()?;
                self.set_parameters(AnaglyphParameters {
                    strength: preview,
                    ..params
                })
            }
            UserAction::SetParameters(next) => match next.with_strength(next.strength) {
                Some(next) => self.set_parameters(next),
                None => {
                    warn!(strength = next.strength, "ignoring non-finite strength");
                    None
                }
            },
            UserAction::ResizeViewport(viewport) => {
                self.viewport = Some(viewport);
                None
            }
        }
    }

    /// Starts a new session unless an upload chain is already in flight.
    pub fn request_upload(&mut self, source: UploadSource) -> Option<Command> {
        if !self.upload_allowed() {
            debug!(?source, "upload rejected while a chain is in flight");
            return None;
        }
        let id = SessionId::new(self.next_session);
        self.next_session += 1;
        if let Some(previous) = self.session.replace(Session::new(id)) {
            debug!(previous = %previous.id, session = %id, "superseding session");
        }
        self.chain = ChainState::Preparing;
        self.anaglyph.in_flight = None;
        self.anaglyph.status = StageStatus::Idle;
        self.last_error = None;
        info!(session = %id, ?source, "upload started");
        Some(Command::Prepare { session: id, source })
    }

    /// Records a parameter change; fetches a new anaglyph when the depth map is
    /// ready and nothing is in flight. Values equal to the current ones are ignored.
    pub fn set_parameters(&mut self, next: AnaglyphParameters) -> Option<Command> {
        if next == self.anaglyph.parameters {
            return None;
        }
        self.anaglyph.parameters = next;
        self.anaglyph.revision += 1;
        debug!(revision = self.anaglyph.revision, ?next, "anaglyph parameters changed");
        if self.chain != ChainState::DepthMapReady {
            return None;
        }
        self.anaglyph.status = StageStatus::InFlight;
        self.issue_anaglyph()
    }

    pub fn on_completion(&mut self, completion: Completion) -> Option<Command> {
        let applied = match completion {
            Completion::Prepared { session, result } => self.on_prepared(session, result),
            Completion::Submitted { session, result } => self.on_submitted(session, result),
            Completion::DepthMap { session, result } => self.on_depth_map(session, result),
            Completion::Anaglyph {
                session,
                request,
                result,
            } => self.on_anaglyph(session, request, result),
        };
        match applied {
            Ok(next) => next,
            Err(stale) => {
                debug!(%stale, "discarding result");
                None
            }
        }
    }

    fn ensure_current(
        &self,
        session: SessionId,
        expected: ChainState,
        request: Option<RequestId>,
    ) -> Result<(), StageError> {
        if self.session_id() == Some(session) && self.chain == expected {
            Ok(())
        } else {
            Err(StageError::Stale { session, request })
        }
    }

    fn current_session(&mut self, session: SessionId) -> Result<&mut Session, StageError> {
        self.session
            .as_mut()
            .filter(|current| current.id == session)
            .ok_or(StageError::Stale {
                session,
                request: None,
            })
    }

    fn on_prepared(
        &mut self,
        session: SessionId,
        result: Result<ResizedImage, StageError>,
    ) -> Result<Option<Command>, StageError> {
        self.ensure_current(session, ChainState::Preparing, None)?;
        match result {
            Ok(image) => {
                let current = self.current_session(session)?;
                current.source_image = Some(image.payload.clone());
                current.aspect_ratio = Some(image.aspect_ratio);
                self.chain = ChainState::Submitting;
                Ok(Some(Command::Submit {
                    session,
                    payload: image.payload,
                }))
            }
            Err(err) => {
                self.fail(FailedStage::Prepare, err);
                Ok(None)
            }
        }
    }

    fn on_submitted(
        &mut self,
        session: SessionId,
        result: Result<Ack, StageError>,
    ) -> Result<Option<Command>, StageError> {
        self.ensure_current(session, ChainState::Submitting, None)?;
        match result {
            Ok(Ack(ack)) => {
                debug!(%session, %ack, "image accepted");
                self.chain = ChainState::FetchingDepthMap;
                Ok(Some(Command::FetchDepthMap { session }))
            }
            Err(err) => {
                self.fail(FailedStage::Upload, err);
                Ok(None)
            }
        }
    }

    fn on_depth_map(
        &mut self,
        session: SessionId,
        result: Result<Bytes, StageError>,
    ) -> Result<Option<Command>, StageError> {
        self.ensure_current(session, ChainState::FetchingDepthMap, None)?;
        match non_empty(result, "depth-map") {
            Ok(depth_map) => {
                self.current_session(session)?.depth_map = Some(depth_map);
                self.chain = ChainState::DepthMapReady;
                self.anaglyph.status = StageStatus::InFlight;
                self.last_error = None;
                info!(%session, "depth map ready");
                Ok(self.issue_anaglyph())
            }
            Err(err) => {
                self.fail(FailedStage::DepthMap, err);
                Ok(None)
            }
        }
    }

    fn on_anaglyph(
        &mut self,
        session: SessionId,
        request: RequestId,
        result: Result<Bytes, StageError>,
    ) -> Result<Option<Command>, StageError> {
        self.ensure_current(session, ChainState::DepthMapReady, Some(request))?;
        let in_flight = match self.anaglyph.in_flight {
            Some(in_flight) if in_flight.request == request => in_flight,
            _ => {
                return Err(StageError::Stale {
                    session,
                    request: Some(request),
                });
            }
        };
        self.anaglyph.in_flight = None;

        if in_flight.revision != self.anaglyph.revision {
            debug!(
                %request,
                fetched = in_flight.revision,
                latest = self.anaglyph.revision,
                "parameters changed while fetching; requesting latest"
            );
            return Ok(self.issue_anaglyph());
        }

        match non_empty(result, "anaglyph") {
            Ok(anaglyph) => {
                let current = self.current_session(session)?;
                current.anaglyph = Some(anaglyph);
                current.anaglyph_parameters = Some(in_flight.parameters);
                self.anaglyph.status = StageStatus::Ready;
                self.last_error = None;
                info!(%session, %request, parameters = ?in_flight.parameters, "anaglyph ready");
            }
            Err(err) => {
                // The previous anaglyph, if any, stays on display.
                warn!(%session, %request, error = %err, "anaglyph fetch failed");
                self.anaglyph.status = StageStatus::Failed;
                self.last_error = Some(err);
            }
        }
        Ok(None)
    }

    fn issue_anaglyph(&mut self) -> Option<Command> {
        if self.chain != ChainState::DepthMapReady || self.anaglyph.in_flight.is_some() {
            return None;
        }
        let session = self.session_id()?;
        let request = RequestId::new(self.next_request);
        self.next_request += 1;
        let parameters = self.anaglyph.parameters;
        self.anaglyph.in_flight = Some(InFlightAnaglyph {
            request,
            revision: self.anaglyph.revision,
            parameters,
        });
        self.anaglyph.status = StageStatus::InFlight;
        Some(Command::FetchAnaglyph {
            session,
            request,
            parameters,
        })
    }

    fn fail(&mut self, stage: FailedStage, err: StageError) {
        warn!(session = ?self.session_id(), ?stage, error = %err, "stage failed");
        self.chain = ChainState::Failed(stage);
        self.last_error = Some(err);
    }
}

fn non_empty(result: Result<Bytes, StageError>, stage: &'static str) -> Result<Bytes, StageError> {
    match result {
        Ok(bytes) if bytes.is_empty() => Err(StageError::EmptyPayload { stage }),
        other => other,
    }
}
