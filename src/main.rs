use anyhow::{Context, Result, bail};
use backup_transfer::{
    config::{AppConfig, Command},
    models::entry::{EntryRole, TransferEntry, TransferPlan},
    services::{
        clock::{Clock, SystemClock},
        local_storage::LocalStorage,
        persistence::SqliteStore,
        rate_limiter::RateLimiter,
        remote_storage::RemoteStorage,
        runner::{RunnerConfig, TickOutcome, TransferRunner},
        storage::StorageAdapter,
        transfer_client::{TransferClient, ensure_archive_name},
    },
};
use std::{path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Ticks `--run` will spend before giving up on a job.
const MAX_RUN_TICKS: u32 = 10_000;

// One tick is one strictly sequential pass; nothing here needs more than
// one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, args) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting backup-transfer with config: {:?}", cfg);

    // --- Initialize job store ---
    let store = SqliteStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;
    store.migrate().await?;

    // --- Handle migration mode ---
    if args.migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let Some(command) = args.command else {
        bail!("no command given, see --help");
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let runner_cfg = RunnerConfig {
        chunk_size: cfg.chunk_size,
        budget: cfg.budget,
        max_failures: cfg.max_failures,
    };

    match &cfg.local_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            let storage = LocalStorage::new(dir, cfg.chunk_size, clock.clone());
            let runner = TransferRunner::new(storage, store, clock, runner_cfg);
            run(command, &runner, false).await
        }
        None => {
            let token = cfg
                .token
                .as_deref()
                .context("BACKUP_TRANSFER_TOKEN (or --token) is required for the remote backend")?;
            let limiter = Arc::new(RateLimiter::new(clock.clone()));
            let client = TransferClient::new(&cfg.api_url, token, cfg.http_timeout, limiter)?;

            match &command {
                Command::Verify => {
                    let quota = client.verify_storage().await?;
                    println!("{}", serde_json::to_string_pretty(&quota)?);
                    return Ok(());
                }
                Command::List => {
                    let backups = client.list_backups().await?;
                    println!("{}", serde_json::to_string_pretty(&backups)?);
                    return Ok(());
                }
                Command::Delete { names } if names.len() > 1 => {
                    client.delete_backups(names).await?;
                    return Ok(());
                }
                _ => {}
            }

            let storage = RemoteStorage::new(client, clock.clone(), cfg.chunk_size, cfg.max_backups);
            let runner = TransferRunner::new(storage, store, clock, runner_cfg);
            run(command, &runner, true).await
        }
    }
}

/// Execute `command` against any backend.
async fn run<S: StorageAdapter>(
    command: Command,
    runner: &TransferRunner<S, SqliteStore>,
    remote: bool,
) -> Result<()> {
    match command {
        Command::Upload {
            archive,
            installer,
            name,
            destination,
            description,
            run,
        } => {
            let name = match name {
                Some(name) => name,
                None => file_name(&archive)?,
            };
            if remote {
                ensure_archive_name(&name)?;
            }

            let mut entries = Vec::new();
            if let Some(installer) = installer {
                let remote_name = file_name(&installer)?;
                entries.push(TransferEntry::file(installer, remote_name, EntryRole::SideChannel));
            }
            entries.push(TransferEntry::file(archive, name, EntryRole::Archive));

            let job = runner
                .submit(&destination, TransferPlan::upload(entries), description)
                .await?;
            println!("{}", job.id);
            if run {
                report(runner.run_to_end(job.id, MAX_RUN_TICKS).await?)?;
            }
        }
        Command::Download {
            name,
            target_dir,
            destination,
            run,
        } => {
            let plan = TransferPlan::download(vec![TransferEntry::file(
                target_dir.join(&name),
                name,
                EntryRole::Archive,
            )]);
            let job = runner.submit(&destination, plan, None).await?;
            println!("{}", job.id);
            if run {
                report(runner.run_to_end(job.id, MAX_RUN_TICKS).await?)?;
            }
        }
        Command::Tick { job_id } => report(runner.tick(job_id).await?)?,
        Command::Cancel { job_id } => {
            if !runner.cancel(job_id).await? {
                println!("job {job_id} had already finished");
            }
        }
        Command::Status { job_id } => print_status(runner, job_id).await?,
        Command::List => {
            let storage = runner.storage();
            for name in storage.scan_dir("").await? {
                let size = storage.file_size(&name).await?.unwrap_or(0);
                println!("{name}\t{size}");
            }
        }
        Command::Delete { names } => {
            for name in &names {
                runner.storage().delete(name).await?;
            }
        }
        Command::Verify => {
            runner.storage().prepare_upload(0).await?;
            println!("storage ok");
        }
    }
    Ok(())
}

async fn print_status<S: StorageAdapter>(
    runner: &TransferRunner<S, SqliteStore>,
    job_id: Option<Uuid>,
) -> Result<()> {
    match job_id {
        Some(id) => {
            let job = runner.status(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        None => {
            for job in runner.store().list_jobs().await? {
                println!(
                    "{}\t{}\t{}\t{:.1}%",
                    job.id, job.destination, job.status, job.progress_percent
                );
            }
        }
    }
    Ok(())
}

/// Print a tick's outcome. A failed job makes the process exit non-zero.
fn report(outcome: TickOutcome) -> Result<()> {
    match outcome {
        TickOutcome::Progressed {
            bytes_moved,
            progress_percent,
        } => println!("progressed {bytes_moved} bytes, {progress_percent:.1}% done"),
        TickOutcome::Succeeded => println!("succeeded"),
        TickOutcome::Deferred { retry_after } => {
            println!("rate limited, retry in {}s", retry_after.as_secs())
        }
        TickOutcome::Retry {
            failure_count,
            error,
        } => println!("chunk failed ({failure_count} so far): {error}"),
        TickOutcome::Halted(status) => println!("job is {status}"),
        TickOutcome::Failed { error } => bail!("job failed: {error}"),
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}
