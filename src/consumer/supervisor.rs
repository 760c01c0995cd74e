use anyhow::{bail, Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{error, info};

/// How to start one worker process of this binary.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub program: PathBuf,
    pub config_path: String,
    /// Flags placed before the subcommand, e.g. logging switches.
    pub global_args: Vec<String>,
}

impl WorkerLaunch {
    pub fn current_exe(config_path: impl Into<String>, global_args: Vec<String>) -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("cannot locate the running executable")?,
            config_path: config_path.into(),
            global_args,
        })
    }

    pub fn command(&self, id: usize) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.global_args)
            .arg("--config")
            .arg(&self.config_path)
            .arg("worker")
            .arg("--id")
            .arg(id.to_string())
            .kill_on_drop(true);
        command
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Start `workers` independent worker processes and wait for them. Returns
/// an error if any worker exits unsuccessfully; on `shutdown` the remaining
/// workers are killed.
pub async fn supervise<F>(launch: &WorkerLaunch, workers: usize, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut running: JoinSet<(usize, std::io::Result<ExitStatus>)> = JoinSet::new();

    for id in 0..workers {
        let mut child = launch
            .command(id)
            .spawn()
            .with_context(|| format!("failed to spawn worker {} from {}", id, launch.program().display()))?;
        info!("Started worker {} (pid {:?})", id, child.id());
        running.spawn(async move { (id, child.wait().await) });
    }

    tokio::pin!(shutdown);
    let mut failed = 0usize;

    loop {
        tokio::select! {
            joined = running.join_next() => match joined {
                Some(Ok((id, Ok(status)))) if status.success() => info!("Worker {} exited", id),
                Some(Ok((id, Ok(status)))) => {
                    failed += 1;
                    error!("Worker {} exited with {}", id, status);
                }
                Some(Ok((id, Err(e)))) => {
                    failed += 1;
                    error!("Lost track of worker {}: {}", id, e);
                }
                Some(Err(e)) => {
                    failed += 1;
                    error!("Worker wait task failed: {}", e);
                }
                None => break,
            },
            _ = &mut shutdown => {
                info!("Stopping {} workers", running.len());
                // aborting drops each Child, which kills it
                running.shutdown().await;
                return Ok(());
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} workers exited abnormally", failed, workers);
    }
    Ok(())
}
