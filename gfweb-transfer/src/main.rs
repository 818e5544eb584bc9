use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use gfweb_core::{ArchiveCommand, ArchiveRequest, GfwebClient};
use gfweb_transfer::conflict::ConflictChoice;
use gfweb_transfer::item::collect_local_items;
use gfweb_transfer::{RegistryEvent, TaskOutcome, TransferConfig, TransferOrchestrator};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage:
  gfweb upload <local>... <remote-dir>
  gfweb download <remote>... <local-dir>
  gfweb copy <source> <destination>
  gfweb archive create <outdir> <basedir> <member>...
  gfweb archive extract <archive> <outdir> [<member>...]
  gfweb archive list <archive>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Upload { sources: Vec<PathBuf>, remote_dir: String },
    Download { remotes: Vec<String>, target: PathBuf },
    Copy { source: String, destination: String },
    Archive(ArchiveRequest),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        return Ok(CliMode::Help);
    };
    match command.as_str() {
        "--help" | "-h" | "help" => Ok(CliMode::Help),
        "upload" => {
            let (remote_dir, sources) = split_last(rest, "upload")?;
            Ok(CliMode::Upload {
                sources: sources.iter().map(PathBuf::from).collect(),
                remote_dir: remote_dir.clone(),
            })
        }
        "download" => {
            let (target, remotes) = split_last(rest, "download")?;
            Ok(CliMode::Download {
                remotes: remotes.to_vec(),
                target: PathBuf::from(target),
            })
        }
        "copy" => match rest {
            [source, destination] => Ok(CliMode::Copy {
                source: source.clone(),
                destination: destination.clone(),
            }),
            _ => anyhow::bail!("copy expects <source> <destination>"),
        },
        "archive" => parse_archive(rest).map(CliMode::Archive),
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

fn split_last<'a>(args: &'a [String], command: &str) -> anyhow::Result<(&'a String, &'a [String])> {
    match args.split_last() {
        Some((last, rest)) if !rest.is_empty() => Ok((last, rest)),
        _ => anyhow::bail!("{command} expects at least one source and a target"),
    }
}

fn parse_archive(args: &[String]) -> anyhow::Result<ArchiveRequest> {
    match args {
        [sub, outdir, basedir, members @ ..] if sub == "create" && !members.is_empty() => Ok(
            archive_request(ArchiveCommand::Create, basedir, members, outdir),
        ),
        [sub, archive, outdir, members @ ..] if sub == "extract" => Ok(archive_request(
            ArchiveCommand::Extract,
            archive,
            members,
            outdir,
        )),
        [sub, archive] if sub == "list" => {
            Ok(archive_request(ArchiveCommand::List, archive, &[], ""))
        }
        _ => anyhow::bail!("invalid archive arguments\n{USAGE}"),
    }
}

fn archive_request(
    command: ArchiveCommand,
    basedir: &str,
    source: &[String],
    outdir: &str,
) -> ArchiveRequest {
    ArchiveRequest {
        command,
        basedir: basedir.to_string(),
        source: source.to_vec(),
        outdir: outdir.to_string(),
        options: Vec::new(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }
    init_tracing();

    let config = TransferConfig::from_env();
    let client = GfwebClient::with_session(&config.api_base, config.session_cookie.as_deref())
        .with_context(|| format!("invalid API base {}", config.api_base))?;
    let orchestrator = Arc::new(TransferOrchestrator::new(client, config));
    spawn_progress_logger(&orchestrator);
    spawn_interrupt_handler(&orchestrator);

    let failures = match mode {
        CliMode::Upload {
            sources,
            remote_dir,
        } => {
            let mut items = Vec::new();
            for source in &sources {
                let collected = collect_local_items(source)
                    .await
                    .with_context(|| format!("cannot read {}", source.display()))?;
                items.extend(collected);
            }
            let plan = orchestrator.prepare_upload(&remote_dir, items).await?;
            let items = if plan.has_conflict {
                for entry in plan.conflicts() {
                    warn!(name = %entry.name, "name exists, keeping both copies");
                }
                plan.resolve_all(ConflictChoice::KeepBoth)
            } else {
                plan.items
            };
            let report = orchestrator.upload(&remote_dir, items).await;
            report.failed
        }
        CliMode::Download { remotes, target } => {
            failed(orchestrator.download(&remotes, &target).await)
        }
        CliMode::Copy {
            source,
            destination,
        } => failed(orchestrator.copy(&source, &destination).await),
        CliMode::Archive(request) => {
            let report = orchestrator.archive(request).await;
            for member in report.listing.iter().flatten() {
                println!("{:?} {}", member.kind, member.path);
            }
            failed(report.outcome)
        }
        CliMode::Help => 0,
    };

    if failures > 0 {
        anyhow::bail!("{failures} transfer(s) failed");
    }
    Ok(())
}

fn failed(outcome: TaskOutcome) -> usize {
    usize::from(matches!(outcome, TaskOutcome::Failed(_)))
}

fn spawn_progress_logger(orchestrator: &TransferOrchestrator) {
    let mut events = orchestrator.registry().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::Updated(task)) => info!(
                    task = %task.id,
                    kind = task.kind.label(),
                    name = %task.name,
                    destination = %task.kind.destination(),
                    status = %task.status,
                    message = %task.message,
                    "task updated"
                ),
                Ok(RegistryEvent::Refresh { dir }) => info!(dir = %dir, "listing changed"),
                Ok(RegistryEvent::Removed(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_interrupt_handler(orchestrator: &Arc<TransferOrchestrator>) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = orchestrator.registry().cancel_all();
            warn!(cancelled, "interrupted, cancelling live transfers");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("gfweb")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_supports_upload() {
        let mode = parse_cli_mode(args(&["upload", "a.txt", "dir", "/remote"])).unwrap();
        assert_eq!(
            mode,
            CliMode::Upload {
                sources: vec![PathBuf::from("a.txt"), PathBuf::from("dir")],
                remote_dir: "/remote".into(),
            }
        );
        assert!(parse_cli_mode(args(&["upload", "/remote"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_download_and_copy() {
        let mode = parse_cli_mode(args(&["download", "/a", "/b", "."])).unwrap();
        assert_eq!(
            mode,
            CliMode::Download {
                remotes: vec!["/a".into(), "/b".into()],
                target: PathBuf::from("."),
            }
        );
        let mode = parse_cli_mode(args(&["copy", "/a", "/b"])).unwrap();
        assert_eq!(
            mode,
            CliMode::Copy {
                source: "/a".into(),
                destination: "/b".into(),
            }
        );
        assert!(parse_cli_mode(args(&["copy", "/a"])).is_err());
    }

    #[test]
    fn parse_cli_mode_maps_archive_commands() {
        let CliMode::Archive(create) =
            parse_cli_mode(args(&["archive", "create", "/out/set1", "/home", "a", "b"])).unwrap()
        else {
            panic!("expected archive mode");
        };
        assert_eq!(create.command, ArchiveCommand::Create);
        assert_eq!(create.basedir, "/home");
        assert_eq!(create.source, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(create.outdir, "/out/set1");

        let CliMode::Archive(list) = parse_cli_mode(args(&["archive", "list", "/out/set1"])).unwrap()
        else {
            panic!("expected archive mode");
        };
        assert_eq!(list.command, ArchiveCommand::List);
        assert_eq!(list.basedir, "/out/set1");
        assert!(list.source.is_empty());

        assert!(parse_cli_mode(args(&["archive", "create", "/out", "/home"])).is_err());
        assert!(parse_cli_mode(args(&["archive", "shred", "/x"])).is_err());
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_command() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
