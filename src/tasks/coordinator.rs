pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::select;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::UploadConfig;
use crate::error::StageError;
use crate::events::{AnaglyphParameters, PipelineSnapshot, UploadSource, UserAction};
use crate::processing::resize::{ResizedImage, resize};
use crate::remote::RemoteStages;

pub use state::{Command, Completion, PipelineCoordinator};

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl From<&UploadConfig> for PipelineOptions {
    fn from(cfg: &UploadConfig) -> Self {
        Self {
            max_dimension: cfg.max_dimension,
            jpeg_quality: cfg.jpeg_quality,
        }
    }
}

/// Owns the `PipelineCoordinator` and runs its commands.
///
/// Rules:
/// - User actions and stage completions are applied one at a time, in this task.
/// - Stage work runs in a `JoinSet`; results come back tagged with the identity
///   they were issued under, so the coordinator can drop superseded ones.
/// - A stage task that dies without a result is reported as a failure of that
///   stage, which reopens the upload gate.
/// - A fresh snapshot is published after every handled event.
pub async fn run<R: RemoteStages>(
    mut actions: Receiver<UserAction>,
    snapshots: watch::Sender<PipelineSnapshot>,
    remote: Arc<R>,
    options: PipelineOptions,
    parameters: AnaglyphParameters,
    cancel: CancellationToken,
) -> Result<()> {
    let mut coordinator = PipelineCoordinator::new(parameters);
    let mut stages: JoinSet<Completion> = JoinSet::new();
    let mut dispatched: HashMap<task::Id, Command> = HashMap::new();
    let mut actions_open = true;

    snapshots.send_replace(coordinator.snapshot());

    loop {
        let next = select! {
            _ = cancel.cancelled() => break,

            maybe_action = actions.recv(), if actions_open => {
                match maybe_action {
                    Some(action) => coordinator.on_action(action),
                    None => {
                        debug!("action channel closed");
                        actions_open = false;
                        None
                    }
                }
            }

            Some(joined) = stages.join_next_with_id() => {
                match joined {
                    Ok((id, completion)) => {
                        dispatched.remove(&id);
                        coordinator.on_completion(completion)
                    }
                    Err(err) => match dispatched.remove(&err.id()) {
                        Some(command) => {
                            error!(stage = command.stage_name(), session = %command.session(), "stage task failed: {err}");
                            let failure = StageError::Internal(err.to_string());
                            coordinator.on_completion(Completion::failed(&command, failure))
                        }
                        None => {
                            error!("untracked stage task failed: {err}");
                            None
                        }
                    },
                }
            }

            // No more actions and nothing in flight.
            else => break,
        };

        if let Some(command) = next {
            dispatch(&mut stages, &mut dispatched, &remote, options, command);
        }
        snapshots.send_replace(coordinator.snapshot());
    }

    Ok(())
}

fn dispatch<R: RemoteStages>(
    stages: &mut JoinSet<Completion>,
    dispatched: &mut HashMap<task::Id, Command>,
    remote: &Arc<R>,
    options: PipelineOptions,
    command: Command,
) {
    debug!(
        stage = command.stage_name(),
        session = %command.session(),
        "dispatching stage"
    );
    let handle = stages.spawn(execute(Arc::clone(remote), options, command.clone()));
    dispatched.insert(handle.id(), command);
}

async fn execute<R: RemoteStages>(
    remote: Arc<R>,
    options: PipelineOptions,
    command: Command,
) -> Completion {
    match command {
        Command::Prepare { session, source } => Completion::Prepared {
            session,
            result: prepare(remote.as_ref(), options, source).await,
        },
        Command::Submit { session, payload } => Completion::Submitted {
            session,
            result: remote.submit_image(payload).await,
        },
        Command::FetchDepthMap { session } => Completion::DepthMap {
            session,
            result: remote.fetch_depth_map().await,
        },
        Command::FetchAnaglyph {
            session,
            request,
            parameters,
        } => Completion::Anaglyph {
            session,
            request,
            result: remote.fetch_anaglyph(parameters).await,
        },
    }
}

async fn prepare<R: RemoteStages>(
    remote: &R,
    options: PipelineOptions,
    source: UploadSource,
) -> Result<ResizedImage, StageError> {
    let raw = match source {
        UploadSource::File { bytes, .. } => bytes,
        UploadSource::RandomSample => remote.fetch_random_image().await?,
    };
    task::spawn_blocking(move || resize(&raw, options.max_dimension, options.jpeg_quality))
        .await
        .map_err(|err| StageError::Internal(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FailedStage, PipelinePhase};
    use crate::remote::Ack;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Answers every call immediately; the depth-map call panics on demand.
    struct InstantRemote {
        panic_on_depth_map: bool,
    }

    impl RemoteStages for InstantRemote {
        async fn submit_image(&self, _payload: Bytes) -> Result<Ack, StageError> {
            Ok(Ack(serde_json::json!({"status": "ok"})))
        }

        async fn fetch_depth_map(&self) -> Result<Bytes, StageError> {
            if self.panic_on_depth_map {
                panic!("depth model crashed");
            }
            Ok(Bytes::from_static(b"depth"))
        }

        async fn fetch_anaglyph(
            &self,
            parameters: AnaglyphParameters,
        ) -> Result<Bytes, StageError> {
            Ok(Bytes::from(format!("anaglyph pop_out={}", parameters.pop_out)))
        }

        async fn fetch_random_image(&self) -> Result<Bytes, StageError> {
            Ok(Bytes::from(png(64, 32)))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            max_dimension: 32,
            jpeg_quality: 80,
        }
    }

    async fn settle(rx: &mut watch::Receiver<PipelineSnapshot>) -> PipelineSnapshot {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_settled()))
            .await
            .expect("timeout waiting for pipeline to settle")
            .expect("pipeline stopped")
            .clone()
    }

    #[tokio::test]
    async fn random_sample_runs_to_anaglyph() {
        let (action_tx, action_rx) = mpsc::channel(4);
        let (snap_tx, mut snap_rx) = watch::channel(PipelineSnapshot::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            action_rx,
            snap_tx,
            Arc::new(InstantRemote {
                panic_on_depth_map: false,
            }),
            options(),
            AnaglyphParameters::default(),
            cancel.clone(),
        ));

        action_tx
            .send(UserAction::Upload(UploadSource::RandomSample))
            .await
            .unwrap();
        let snap = settle(&mut snap_rx).await;
        assert_eq!(snap.phase, PipelinePhase::AnaglyphReady);
        assert_eq!(snap.aspect_ratio, Some(2.0));
        assert_eq!(snap.anaglyph.as_deref(), Some(&b"anaglyph pop_out=false"[..]));
        assert!(snap.upload_allowed);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_stage_reopens_the_gate() {
        let (action_tx, action_rx) = mpsc::channel(4);
        let (snap_tx, mut snap_rx) = watch::channel(PipelineSnapshot::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            action_rx,
            snap_tx,
            Arc::new(InstantRemote {
                panic_on_depth_map: true,
            }),
            options(),
            AnaglyphParameters::default(),
            cancel.clone(),
        ));

        action_tx
            .send(UserAction::Upload(UploadSource::File {
                name: "a.png".into(),
                bytes: Bytes::from(png(8, 8)),
            }))
            .await
            .unwrap();
        let snap = settle(&mut snap_rx).await;
        assert_eq!(snap.phase, PipelinePhase::Failed(FailedStage::DepthMap));
        assert!(snap.upload_allowed);
        assert!(snap.source_image.is_some());
        assert!(matches!(snap.last_error, Some(StageError::Internal(_))));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exits_when_actions_close_and_nothing_is_in_flight() {
        let (action_tx, action_rx) = mpsc::channel::<UserAction>(1);
        let (snap_tx, _snap_rx) = watch::channel(PipelineSnapshot::default());
        drop(action_tx);
        let res = tokio::time::timeout(
            Duration::from_secs(2),
            run(
                action_rx,
                snap_tx,
                Arc::new(InstantRemote {
                    panic_on_depth_map: false,
                }),
                options(),
                AnaglyphParameters::default(),
                CancellationToken::new(),
            ),
        )
        .await;
        assert!(res.expect("driver should stop on its own").is_ok());
    }
}
