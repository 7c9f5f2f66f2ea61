use std::collections::HashSet;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

mod backup;
mod batch;
mod cli;
mod config;
mod errorlog;
mod errors;
mod index;
mod lock;
mod manifest;
mod provider;
mod records;
mod scanner;
mod search;
mod semantic;
mod service;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use batch::EmbedOptions;
use cli::{ProviderAction, ProviderArgs, ProviderKind, SecretArgs};
use provider::ProviderConfig;
use scanner::ScanOptions;
use search::SearchRequest;
use service::{IndexService, ProviderUpdate};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wayfinder=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();
    let service = Arc::new(IndexService::new());

    match args.command {
        cli::Command::Scan {
            root,
            extensions,
            all,
            storage_dir,
        } => {
            let options = ScanOptions {
                extensions,
                allow_all: all,
                storage_dir,
            };
            let report = service
                .scan(&root, &options)
                .with_context(|| format!("Failed to scan {}", root.display()))?;
            print_json(&report)
        }

        cli::Command::Embed {
            index,
            max_files,
            batch_size,
            detach,
        } => {
            let options = EmbedOptions {
                max_files,
                batch_size,
            };
            if detach {
                return spawn_detached(&index, &options);
            }
            run_embed(&service, &index, &options)
        }

        cli::Command::Progress { index } => match service.progress(&index)? {
            Some(progress) => print_json(&progress),
            None => {
                println!("No embedding run recorded for {}", index.display());
                Ok(())
            }
        },

        cli::Command::Cancel { index } => {
            let cancelled = service.cancel_embedding(&index)?;
            print_json(&json!({ "cancelled": cancelled }))
        }

        cli::Command::Cluster { index, k } => print_json(&service.cluster(&index, k)?),

        cli::Command::Clusters { index } => match service.clusters(&index)? {
            Some(outcome) => print_json(&outcome),
            None => {
                println!("No clustering result yet; run `wayfinder cluster` first");
                Ok(())
            }
        },

        cli::Command::Search {
            index,
            query,
            top_k,
            weight,
        } => {
            let request = SearchRequest {
                query,
                top_k,
                semantic_weight: weight,
            };
            print_json(&service.search(&index, &request)?)
        }

        cli::Command::Similar {
            index,
            threshold,
            pinned,
            archive_dir,
        } => {
            let pinned: HashSet<String> = pinned.into_iter().collect();
            let groups = service.similarity_groups(&index, threshold, &pinned)?;
            match archive_dir {
                Some(dir) => {
                    let moves = semantic::similarity::propose_moves(&groups, &dir);
                    print_json(&json!({ "groups": groups, "moves": moves }))
                }
                None => print_json(&groups),
            }
        }

        cli::Command::Stats { index } => print_json(&service.get_stats(&index)?),

        cli::Command::Timeline { index, days } => print_json(&service.timeline(&index, days)?),

        cli::Command::Check { index } => print_json(&service.check_index(&index)?),

        cli::Command::Errors {
            index,
            limit,
            clear,
        } => {
            if clear {
                service.clear_error_log(&index)?;
                println!("Error log cleared");
                return Ok(());
            }
            print_json(&service.error_log(&index, limit)?)
        }

        cli::Command::Provider { action } => match action {
            ProviderAction::Show { index } => print_json(&service.provider_config(&index)?),
            ProviderAction::Set {
                index,
                provider,
                secrets,
            } => {
                let update = ProviderUpdate {
                    config: provider_from_args(&provider)?,
                    secrets: secrets_from_args(secrets),
                };
                print_json(&service.save_provider_config(&index, &update)?)
            }
            ProviderAction::Validate { index } => {
                let reports = service.validate_provider(&index)?;
                let failed = reports.iter().filter(|r| !r.success).count();
                print_json(&reports)?;
                if failed > 0 {
                    bail!("{failed} provider(s) failed validation");
                }
                Ok(())
            }
        },

        cli::Command::Export { index, output } => export(&service, &index, output),

        cli::Command::Import {
            archive,
            storage_dir,
            yes,
        } => import(&service, archive, &storage_dir, yes),

        cli::Command::Serve { addr } => web::start_daemon(service, &addr),
    }
}

/// Foreground run with a progress bar. Ctrl-C cancels after the current batch.
fn run_embed(service: &Arc<IndexService>, index: &Path, options: &EmbedOptions) -> anyhow::Result<()> {
    let dir = service.open(index)?.dir().to_path_buf();
    let started = service.start_embedding(index, options)?;

    {
        let service = service.clone();
        let index = index.to_path_buf();
        ctrlc::set_handler(move || {
            log::info!("Received shutdown signal, stopping after the current batch");
            if let Err(e) = service.cancel_embedding(&index) {
                log::error!("failed to cancel embedding: {e}");
            }
        })
        .context("Failed to set Ctrl+C handler")?;
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {prefix:.bold}▕{bar:.blue}▏{pos}/{len} {msg}",
        )
        .context("invalid progress template")?
        .progress_chars("█▓▒░  "),
    );
    bar.set_prefix(format!("{}/{}", started.provider, started.model));

    loop {
        std::thread::sleep(POLL_INTERVAL);
        if let Some(progress) = service.progress(index)? {
            bar.set_length(progress.total_files as u64);
            bar.set_position(progress.processed_files as u64);
            bar.set_message(progress.message.clone().unwrap_or_default());
            if progress.status.is_terminal() {
                break;
            }
        }
        if !service.runs().is_active(&dir) {
            break;
        }
    }

    let finished = service.wait_for_embedding(index)?;
    bar.finish_and_clear();
    match finished {
        Some(progress) => print_json(&progress),
        None => bail!("embedding run left no progress record"),
    }
}

/// Re-run `embed` in a child process that outlives this one.
fn spawn_detached(index: &Path, options: &EmbedOptions) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the wayfinder executable")?;
    let mut command = std::process::Command::new(exe);
    command.arg("embed").arg(index);
    if let Some(max_files) = options.max_files {
        command.arg("--max-files").arg(max_files.to_string());
    }
    if let Some(batch_size) = options.batch_size {
        command.arg("--batch-size").arg(batch_size.to_string());
    }

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to start background embedding")?;

    print_json(&json!({
        "detached": true,
        "pid": child.id(),
        "index": index,
        "hint": "poll with `wayfinder progress`",
    }))
}

fn provider_from_args(args: &ProviderArgs) -> anyhow::Result<ProviderConfig> {
    if let Some(path) = &args.file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return serde_yml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()));
    }

    let kind = match args.kind {
        Some(ProviderKind::Local) => "local",
        Some(ProviderKind::Hashing) => "hashing",
        Some(ProviderKind::Azure) => "azure",
        Some(ProviderKind::Vertex) => "vertex",
        Some(ProviderKind::Openai) => "openai",
        None => bail!("either --file or --kind is required"),
    };

    // let serde fill the per-kind defaults
    let mut doc = serde_json::Map::new();
    doc.insert("kind".into(), kind.into());
    let fields = [
        ("model", &args.model),
        ("endpoint", &args.endpoint),
        ("deployment", &args.deployment),
        ("api_version", &args.api_version),
        ("project_id", &args.project_id),
        ("location", &args.location),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            doc.insert(key.into(), value.clone().into());
        }
    }
    if let Some(dimensions) = args.dimensions {
        doc.insert("dimensions".into(), dimensions.into());
    }

    serde_json::from_value(serde_json::Value::Object(doc))
        .with_context(|| format!("Incomplete settings for provider `{kind}`"))
}

fn secrets_from_args(args: SecretArgs) -> std::collections::BTreeMap<String, String> {
    [
        ("azure", args.azure_key),
        ("vertex", args.vertex_token),
        ("openai", args.openai_key),
    ]
    .into_iter()
    .filter_map(|(kind, secret)| secret.map(|s| (kind.to_string(), s)))
    .collect()
}

/// Print progress to stdout normally, or stderr when stdout carries the archive.
fn log_progress(piped: bool, msg: &str) {
    if piped {
        eprintln!("{msg}");
    } else {
        println!("{msg}");
    }
}

fn export(service: &IndexService, index: &Path, output: Option<PathBuf>) -> anyhow::Result<()> {
    let piped = output.is_none() && !io::stdout().is_terminal();

    let (entries, written_to) = if piped {
        let dir = service.open(index)?.dir().to_path_buf();
        (backup::export_index(&dir, io::stdout().lock())?, None)
    } else {
        let path = output.unwrap_or_else(|| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
            PathBuf::from(format!("wayfinder-export-{timestamp}.tar.gz"))
        });
        (service.export_index(index, &path)?, Some(path))
    };

    for entry in &entries {
        log_progress(piped, &format!("  + {entry}"));
    }
    if let Some(path) = written_to {
        let size_kb = std::fs::metadata(&path)?.len() / 1024;
        log_progress(piped, &format!("\nExport created: {} ({} KB)", path.display(), size_kb));
    }
    Ok(())
}

fn import(
    service: &IndexService,
    archive: Option<PathBuf>,
    storage_dir: &Path,
    yes: bool,
) -> anyhow::Result<()> {
    let _temp_file: Option<tempfile::NamedTempFile>;
    let archive = match archive {
        Some(path) => path,
        None if !io::stdin().is_terminal() => {
            let mut tmp =
                tempfile::NamedTempFile::new().context("Failed to create temp file for stdin")?;
            io::copy(&mut io::stdin().lock(), &mut tmp).context("Failed to read archive from stdin")?;
            let path = tmp.path().to_path_buf();
            _temp_file = Some(tmp);
            path
        }
        None => bail!("No archive path provided. Pipe an archive to stdin or pass a path."),
    };

    let entries = backup::inspect_archive(&archive)?;
    println!("Found {} entries to import:", entries.len());
    for entry in &entries {
        println!("  {entry}");
    }
    println!("\nDestination: {}", storage_dir.display());

    if !yes {
        match inquire::prompt_confirmation("This will overwrite existing index files. Continue?") {
            InquireResult::Ok(true) => {}
            InquireResult::Ok(false) => {
                println!("Import cancelled.");
                return Ok(());
            }
            InquireResult::Err(err) => bail!("An error occurred: {}", err),
        }
    }

    let imported = service.import_index(&archive, storage_dir)?;
    println!("\nImported {} entries to {}", imported.len(), storage_dir.display());
    Ok(())
}
