//! Command dispatch.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use vaultpush_protocol::MIB;
use vaultpush_transfer::{
    PartPlan, PartReader, ProgressReporter, ProgressStats, tree_hash_reader,
};
use vaultpush_upload::{
    ArchiveOutcome, LocalVault, ResumeTarget, UploadOrchestrator, UploadRequest, abort_session,
};

use crate::cli::{Cli, Command, ResumeArgs, TransferOptions, UploadArgs};
use crate::config::Config;

/// Runs one command to completion.
pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let root = cli
        .vault_root
        .clone()
        .unwrap_or_else(|| config.vault_root_path());
    let vault = LocalVault::new(root);

    match cli.command {
        Command::Upload(args) => upload(&vault, &config, args, cli.json).await,
        Command::Resume(args) => resume(&vault, &config, args, cli.json).await,
        Command::Abort {
            upload_id,
            vault: name,
            strict,
        } => {
            let name = name.unwrap_or_else(|| config.default_vault.clone());
            abort_session(&vault, &name, &upload_id, strict).await?;
            if cli.json {
                println!("{}", json!({ "vaultName": name, "uploadId": upload_id, "aborted": true }));
            } else {
                println!("aborted upload {upload_id} in vault {name}");
            }
            Ok(())
        }
        Command::TreeHash { file } => tree_hash(file, cli.json).await,
        Command::Plan {
            file,
            size,
            part_size_mib,
        } => plan(&config, file, size, part_size_mib, cli.json),
    }
}

async fn upload(
    vault: &LocalVault,
    config: &Config,
    args: UploadArgs,
    json: bool,
) -> anyhow::Result<()> {
    let request = UploadRequest {
        vault_name: vault_name(config, &args.transfer),
        description: args
            .description
            .unwrap_or_else(|| config.description.clone()),
        part_size: args.part_size_mib.map(mib_to_bytes).transpose()?,
        resume: None,
    };
    transfer(vault, config, &args.file, &args.transfer, request, json).await
}

async fn resume(
    vault: &LocalVault,
    config: &Config,
    args: ResumeArgs,
    json: bool,
) -> anyhow::Result<()> {
    let vault_name = vault_name(config, &args.transfer);
    let info = vault
        .upload_info(&vault_name, &args.upload_id)
        .await
        .with_context(|| format!("upload {} not found", args.upload_id))?;
    let from_part = match args.from_part {
        Some(part) => part,
        None => {
            let archive_size = tokio::fs::metadata(&args.file)
                .await
                .with_context(|| format!("cannot stat {}", args.file.display()))?
                .len();
            let plan = PartPlan::new(archive_size, info.part_size)?;
            let accepted = vault.list_parts(&vault_name, &args.upload_id).await?;
            let part = resume_point(&accepted, plan.total_parts());
            tracing::info!(upload_id = %args.upload_id, from_part = part, "resume point from vault");
            part
        }
    };

    let request = UploadRequest {
        vault_name,
        description: info.description,
        part_size: None,
        resume: Some(ResumeTarget {
            upload_id: args.upload_id,
            part_size: info.part_size,
            from_part,
        }),
    };
    transfer(vault, config, &args.file, &args.transfer, request, json).await
}

async fn transfer(
    vault: &LocalVault,
    config: &Config,
    file: &Path,
    options: &TransferOptions,
    request: UploadRequest,
    json: bool,
) -> anyhow::Result<()> {
    let source = tokio::task::spawn_blocking({
        let path = file.to_path_buf();
        move || PartReader::open(&path)
    })
    .await
    .context("task join error")?
    .with_context(|| format!("cannot open {}", file.display()))?;

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping upload");
                cancel.cancel();
            }
        }
    });

    let reporter = ProgressReporter::new(None);
    if !options.quiet && !json {
        reporter.on_stats(Box::new(print_progress));
    }

    let orchestrator = UploadOrchestrator::new(vault)
        .with_retry(config.retry(options.retries))
        .with_cancel_token(cancel)
        .with_observer(&reporter);
    let outcome = orchestrator
        .upload_archive(&config.planner()?, &request, source)
        .await;
    ctrl_c.abort();
    if !options.quiet && !json {
        eprintln!();
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(result) = e.run_result()
                && !json
            {
                eprintln!(
                    "upload {} stopped after {} of {} parts",
                    result.upload_id, result.transferred_parts, result.total_parts
                );
            }
            return Err(e.into());
        }
    };
    report_outcome(&outcome, file, json)?;
    match outcome {
        ArchiveOutcome::Failed { result } => {
            anyhow::bail!("upload {} failed: {}", result.upload_id, result.error)
        }
        _ => Ok(()),
    }
}

fn report_outcome(outcome: &ArchiveOutcome, file: &Path, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let result = outcome.result();
    match outcome {
        ArchiveOutcome::Completed {
            archive_id,
            checksum,
            ..
        } => {
            println!("archive id: {archive_id}");
            println!("tree hash:  {checksum}");
            println!(
                "sent {} of {} parts ({} bytes)",
                result.transferred_parts, result.total_parts, result.transferred_bytes
            );
        }
        ArchiveOutcome::Cancelled { .. } | ArchiveOutcome::Failed { .. } => {
            println!(
                "upload {} stopped after {} of {} parts",
                result.upload_id, result.transferred_parts, result.total_parts
            );
            if let Some(next) = result.next_part {
                println!(
                    "resume with: vaultpush resume {} {} --vault {} --from-part {next}",
                    file.display(),
                    result.upload_id,
                    result.vault_name
                );
            }
        }
    }
    Ok(())
}

fn print_progress(stats: &ProgressStats) {
    let event = &stats.event;
    let eta = stats
        .eta
        .map(|d| format!(" eta {}s", d.as_secs()))
        .unwrap_or_default();
    let mut stderr = std::io::stderr();
    let _ = write!(
        stderr,
        "\rpart {}/{} attempt {}  {:5.1}%  {:.2} MiB/s{eta}   ",
        event.part_number,
        event.total_parts,
        event.attempt,
        event.percentage(),
        stats.instant_bps / MIB as f64,
    );
    let _ = stderr.flush();
}

async fn tree_hash(file: PathBuf, json: bool) -> anyhow::Result<()> {
    let (hash, size) = tokio::task::spawn_blocking({
        let path = file.clone();
        move || -> anyhow::Result<_> {
            let f = std::fs::File::open(&path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            Ok(tree_hash_reader(std::io::BufReader::new(f))?)
        }
    })
    .await
    .context("task join error")??;

    if json {
        println!(
            "{}",
            json!({ "file": file.display().to_string(), "size": size, "treeHash": hash })
        );
    } else {
        println!("{hash}  {}", file.display());
    }
    Ok(())
}

fn plan(
    config: &Config,
    file: Option<PathBuf>,
    size: Option<u64>,
    part_size_mib: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let archive_size = match (size, file) {
        (Some(size), _) => size,
        (None, Some(file)) => std::fs::metadata(&file)
            .with_context(|| format!("cannot stat {}", file.display()))?
            .len(),
        (None, None) => anyhow::bail!("either a file or --size is required"),
    };
    let part_size = part_size_mib.map(mib_to_bytes).transpose()?;
    let plan = config.planner()?.plan(archive_size, part_size)?;

    if json {
        println!(
            "{}",
            json!({
                "archiveSize": plan.archive_size(),
                "partSize": plan.part_size(),
                "totalParts": plan.total_parts(),
                "lastPartSize": plan.last_part_size(),
            })
        );
    } else {
        println!("archive size:   {} bytes", plan.archive_size());
        println!("part size:      {} MiB", plan.part_size() / MIB);
        println!("parts:          {}", plan.total_parts());
        println!("last part size: {} bytes", plan.last_part_size());
    }
    Ok(())
}

fn vault_name(config: &Config, options: &TransferOptions) -> String {
    options
        .vault
        .clone()
        .unwrap_or_else(|| config.default_vault.clone())
}

fn mib_to_bytes(mib: u64) -> anyhow::Result<u64> {
    mib.checked_mul(MIB)
        .ok_or_else(|| anyhow::anyhow!("part size of {mib} MiB is too large"))
}

/// Part to resume from: the first one the vault lacks. When every part
/// is already there the last one is sent again so the run can complete.
fn resume_point(accepted: &[u32], total_parts: u64) -> u32 {
    let last = u32::try_from(total_parts).unwrap_or(u32::MAX).max(1);
    first_missing_part(accepted).min(last)
}

/// First part number missing from an ascending list of accepted parts.
fn first_missing_part(accepted: &[u32]) -> u32 {
    let mut next = 1;
    for &part in accepted {
        if part == next {
            next += 1;
        } else if part > next {
            break;
        }
    }
    next
}
