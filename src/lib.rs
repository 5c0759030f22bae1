// 库文件，导出模块
pub mod cli;
pub mod config;
pub mod remote;
pub mod ssh;
pub mod threadpool;
pub mod transfer;
pub mod utils;

pub use config::{AuthMethod, ConnectionTarget, EngineConfig, TrustPolicy};
pub use remote::RemoteEntry;
pub use ssh::{AsyncSession, SessionManager, SessionState};
pub use transfer::{TransferEvent, TransferHandle, TransferStatus, TransferTask};
pub use utils::error::{ConnectionError, ExecError, ListError, OpError, TransferError};

use anyhow::{anyhow, bail, Context, Result};
use cli::{Cli, Commands, TrustCommand};
use config::Config;
use dialoguer::Confirm;
use remote::exec::{parse_md5sum, shell_quote};
use ssh::HostTrustStore;
use std::path::Path;
use transfer::progress::{follow, ProgressTracker};
use utils::file::calculate_md5;

/// Runs one CLI command end to end.
pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Trust { action } = &cli.command {
        return run_trust(&EngineConfig::from_cli(&cli), action);
    }

    let config = Config::from_cli(&cli)?;
    println!(
        "Target: {}@{}:{}",
        config.target.username, config.target.host, config.target.port
    );

    let session = AsyncSession::new(SessionManager::new(config.engine.clone())?);
    connect_interactive(&session, &config.target).await?;

    let result = run_command(&session, cli.command).await;
    session.disconnect().await;
    result
}

fn run_trust(engine: &EngineConfig, action: &TrustCommand) -> Result<()> {
    let mut store = HostTrustStore::open(&engine.known_hosts_path)?;
    match action {
        TrustCommand::List => {
            let hosts = store.trusted_hosts();
            if hosts.is_empty() {
                println!("No trusted hosts in {}", store.path().display());
            }
            for (host, fingerprint) in hosts {
                println!("{}  {}", host, fingerprint);
            }
        }
        TrustCommand::Reset => {
            store.reset()?;
            println!("✅ Cleared {}", store.path().display());
        }
    }
    Ok(())
}

async fn connect_interactive(session: &AsyncSession, target: &ConnectionTarget) -> Result<()> {
    match session.connect(target.clone()).await {
        Ok(()) => Ok(()),
        Err(ConnectionError::UntrustedHostKey {
            host,
            fingerprint,
            changed: false,
        }) => {
            println!("The authenticity of host '{}' can't be established.", host);
            println!("Key fingerprint is {}.", fingerprint);
            let accept = Confirm::new()
                .with_prompt("Are you sure you want to continue connecting?")
                .default(false)
                .interact()?;
            if !accept {
                bail!("Host key verification failed for {}", host);
            }

            session
                .blocking()
                .with_trust_store(|store| store.accept(&host))?;
            session
                .connect(target.clone())
                .await
                .context("Failed to connect after accepting the host key")
        }
        Err(e @ ConnectionError::UntrustedHostKey { changed: true, .. }) => Err(anyhow!(e)).context(
            "REMOTE HOST IDENTIFICATION HAS CHANGED; run `trust reset` only if you expected this",
        ),
        Err(e) => Err(e).context("Failed to connect"),
    }
}

async fn run_command(session: &AsyncSession, command: Commands) -> Result<()> {
    match command {
        Commands::Ls { path } => {
            let dir = match path {
                Some(path) => path,
                None => session.blocking().current_directory()?,
            };
            for entry in session.list_directory(&dir).await? {
                let suffix = if entry.is_directory { "/" } else { "" };
                println!(
                    "{} {:>10} {}{}",
                    entry.permissions_string(),
                    entry.formatted_size(),
                    entry.name,
                    suffix
                );
            }
        }
        Commands::Upload {
            local_path,
            remote_path,
            verify,
        } => {
            let handle = session.start_upload(local_path.clone(), &remote_path)?;
            let task = wait_with_progress(handle, format!("Uploading {}", local_path.display())).await?;
            println!("✅ Uploaded to {}", task.destination);
            if verify {
                verify_checksum(session, &local_path, &task.destination).await?;
            }
        }
        Commands::Download {
            remote_path,
            local_path,
            verify,
        } => {
            let handle = session.start_download(&remote_path, local_path, None)?;
            let task = wait_with_progress(handle, format!("Downloading {}", remote_path)).await?;
            println!("✅ Downloaded to {}", task.destination);
            if verify {
                verify_checksum(session, Path::new(&task.destination), &task.source).await?;
            }
        }
        Commands::Mkdir { path } => {
            session.create_directory(&path).await?;
            println!("✅ Created {}", path);
        }
        Commands::Rm { path } => {
            session.delete_file(&path).await?;
            println!("✅ Deleted {}", path);
        }
        Commands::Rmdir { path } => {
            session.delete_directory(&path).await?;
            println!("✅ Deleted {}", path);
        }
        Commands::Exec { command } => {
            let output = session.exec(&command.join(" ")).await?;
            print!("{}", output);
        }
        Commands::Trust { .. } => bail!("trust commands run without a session"),
    }
    Ok(())
}

/// 进度条在阻塞线程上跟随事件，直到任务结束
async fn wait_with_progress(handle: TransferHandle, description: String) -> Result<TransferTask> {
    let task = tokio::task::spawn_blocking(move || {
        let events = handle.subscribe();
        let mut tracker = ProgressTracker::new(handle.snapshot().total_size(), &description);
        let status = follow(&events, &mut tracker);
        let task = handle.snapshot();
        match status {
            Some(TransferStatus::Completed) => tracker.finish(),
            Some(TransferStatus::Cancelled) => tracker.finish_cancelled(),
            _ => tracker.finish_with_error(
                &task
                    .error()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
        }
        task
    })
    .await
    .context("Transfer worker panicked")?;

    match task.status() {
        TransferStatus::Completed => Ok(task),
        _ => Err(match task.error() {
            Some(err) => anyhow!(err.clone()),
            None => anyhow!("Transfer ended in state {}", task.status()),
        }),
    }
}

async fn verify_checksum(session: &AsyncSession, local: &Path, remote: &str) -> Result<()> {
    let local_md5 = calculate_md5(local)?;
    let output = session
        .exec(&format!("md5sum {}", shell_quote(remote)))
        .await
        .context("Failed to compute the remote checksum")?;
    let remote_md5 = parse_md5sum(&output)
        .ok_or_else(|| anyhow!("Unexpected md5sum output: {}", output.trim()))?;

    if local_md5 != remote_md5 {
        bail!("Checksum mismatch: local {} remote {}", local_md5, remote_md5);
    }
    println!("✅ Checksum verified: {}", local_md5);
    Ok(())
}
