use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{PipelineSnapshot, UploadSource, UserAction, Viewport};

pub const HELP: &str = "\
commands:
  upload <path>        start a session from a local image
  random               start a session from a backend sample
  pop-out on|off       toggle pop-out
  rivalry on|off       toggle minimal retinal rivalry
  strength <0-6>       set strength and render
  drag <0-6>           move the strength slider without rendering
  release              commit the dragged strength
  viewport <w>x<h>     set the display area
  status               print the pipeline state
  quit                 exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Upload(PathBuf),
    Random,
    PopOut(bool),
    Rivalry(bool),
    Strength(f32),
    Drag(f32),
    Release,
    Viewport(Viewport),
    Status,
    Help,
    Quit,
}

fn parse_switch(arg: Option<&str>) -> Result<bool> {
    match arg {
        Some("on" | "true" | "yes" | "1") => Ok(true),
        Some("off" | "false" | "no" | "0") => Ok(false),
        Some(other) => bail!("expected on/off, got {other:?}"),
        None => bail!("expected on/off"),
    }
}

fn parse_strength(arg: Option<&str>) -> Result<f32> {
    let raw = arg.ok_or_else(|| anyhow!("expected a strength value"))?;
    raw.parse()
        .with_context(|| format!("invalid strength {raw:?}"))
}

/// Parses one console line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (line, None),
    };
    let cmd = match word.to_ascii_lowercase().as_str() {
        "upload" => ConsoleCommand::Upload(PathBuf::from(
            rest.ok_or_else(|| anyhow!("upload needs a path"))?,
        )),
        "random" => ConsoleCommand::Random,
        "pop-out" | "popout" => ConsoleCommand::PopOut(parse_switch(rest)?),
        "rivalry" => ConsoleCommand::Rivalry(parse_switch(rest)?),
        "strength" => ConsoleCommand::Strength(parse_strength(rest)?),
        "drag" => ConsoleCommand::Drag(parse_strength(rest)?),
        "release" => ConsoleCommand::Release,
        "viewport" => ConsoleCommand::Viewport(
            rest.ok_or_else(|| anyhow!("viewport needs WIDTHxHEIGHT"))?
                .parse()?,
        ),
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command {other:?} (try `help`)"),
    };
    Ok(Some(cmd))
}

pub fn describe(snapshot: &PipelineSnapshot) -> String {
    let mut out = format!(
        "session: {}\nphase: {:?}\nupload allowed: {}\nparameters: pop-out={} strength={:.2} rivalry={}",
        snapshot
            .session
            .map_or_else(|| "none".to_string(), |s| s.to_string()),
        snapshot.phase,
        snapshot.upload_allowed,
        snapshot.parameters.pop_out,
        snapshot.parameters.strength,
        snapshot.parameters.minimize_rivalry,
    );
    if let Some(preview) = snapshot.strength_preview {
        out.push_str(&format!("\nslider: {preview:.2} (not committed)"));
    }
    if let Some(plan) = snapshot.layout() {
        out.push_str(&format!(
            "\nlayout: {:?} {:.0}x{:.0}",
            plan.layout, plan.pair.width, plan.pair.height
        ));
    }
    if let Some(err) = &snapshot.last_error {
        out.push_str(&format!("\nlast error: {err}"));
    }
    out
}

/// Reads console commands from stdin until `quit` or end of input.
pub async fn run(
    actions: Sender<UserAction>,
    snapshots: watch::Receiver<PipelineSnapshot>,
    cancel: CancellationToken,
) -> Result<()> {
    run_with_reader(BufReader::new(tokio::io::stdin()), actions, snapshots, cancel).await
}

pub async fn run_with_reader<R: AsyncBufRead + Unpin>(
    reader: R,
    actions: Sender<UserAction>,
    snapshots: watch::Receiver<PipelineSnapshot>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut lines = reader.lines();
    loop {
        let line = select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("failed to read console input")?,
        };
        let Some(line) = line else {
            info!("console input closed; initiating shutdown");
            break;
        };
        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("error: {err:#}");
                continue;
            }
        };
        let action = match cmd {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => {
                println!("{HELP}");
                continue;
            }
            ConsoleCommand::Status => {
                println!("{}", describe(&snapshots.borrow()));
                continue;
            }
            ConsoleCommand::Upload(_) | ConsoleCommand::Random
                if !snapshots.borrow().upload_allowed =>
            {
                println!("upload in progress; wait for the depth map");
                continue;
            }
            ConsoleCommand::Upload(path) => match tokio::fs::read(&path).await {
                Ok(bytes) => UserAction::Upload(UploadSource::File {
                    name: path.display().to_string(),
                    bytes: Bytes::from(bytes),
                }),
                Err(err) => {
                    warn!(path = %path.display(), "failed to read image: {err}");
                    eprintln!("error: cannot read {}: {err}", path.display());
                    continue;
                }
            },
            ConsoleCommand::Random => UserAction::Upload(UploadSource::RandomSample),
            ConsoleCommand::PopOut(on) => UserAction::SetPopOut(on),
            ConsoleCommand::Rivalry(on) => UserAction::SetMinimizeRivalry(on),
            ConsoleCommand::Strength(value) => UserAction::SetStrength(value),
            ConsoleCommand::Drag(value) => UserAction::DragStrength(value),
            ConsoleCommand::Release => UserAction::ReleaseStrength,
            ConsoleCommand::Viewport(viewport) => UserAction::ResizeViewport(viewport),
        };
        if actions.send(action).await.is_err() {
            warn!("pipeline closed; stopping console");
            break;
        }
    }
    cancel.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("# note").unwrap(), None);
        assert_eq!(
            parse_command("upload /tmp/a b.jpg").unwrap(),
            Some(ConsoleCommand::Upload(PathBuf::from("/tmp/a b.jpg")))
        );
        assert_eq!(
            parse_command("pop-out on").unwrap(),
            Some(ConsoleCommand::PopOut(true))
        );
        assert_eq!(
            parse_command("RIVALRY off").unwrap(),
            Some(ConsoleCommand::Rivalry(false))
        );
        assert_eq!(
            parse_command("strength 3.5").unwrap(),
            Some(ConsoleCommand::Strength(3.5))
        );
        assert_eq!(
            parse_command("viewport 800x600").unwrap(),
            Some(ConsoleCommand::Viewport(Viewport {
                width: 800,
                height: 600
            }))
        );
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("upload").is_err());
        assert!(parse_command("pop-out maybe").is_err());
        assert!(parse_command("strength lots").is_err());
        assert!(parse_command("teleport").is_err());
    }

    #[tokio::test]
    async fn forwards_actions_and_cancels_on_quit() {
        let input: &[u8] = b"pop-out on\ndrag 4\nrelease\nbogus\nquit\nstrength 1\n";
        let (tx, mut rx) = mpsc::channel(8);
        let (_snap_tx, snap_rx) = watch::channel(PipelineSnapshot::default());
        let cancel = CancellationToken::new();

        run_with_reader(input, tx, snap_rx, cancel.clone())
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(UserAction::SetPopOut(true))));
        assert!(matches!(rx.recv().await, Some(UserAction::DragStrength(v)) if v == 4.0));
        assert!(matches!(rx.recv().await, Some(UserAction::ReleaseStrength)));
        assert!(rx.recv().await.is_none());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn upload_before_first_pipeline_update_is_sent() {
        let input: &[u8] = b"random\n";
        let (tx, mut rx) = mpsc::channel(8);
        let (_snap_tx, snap_rx) = watch::channel(PipelineSnapshot::default());
        run_with_reader(input, tx, snap_rx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(UserAction::Upload(UploadSource::RandomSample))
        ));
    }

    #[tokio::test]
    async fn gated_upload_is_not_sent() {
        let input: &[u8] = b"random\n";
        let (tx, mut rx) = mpsc::channel(8);
        let (_snap_tx, snap_rx) = watch::channel(PipelineSnapshot {
            upload_allowed: false,
            ..PipelineSnapshot::default()
        });
        run_with_reader(input, tx, snap_rx, CancellationToken::new())
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
