use crate::config::DatabaseConfig;
use crate::error::Outcome;
use crate::process::{CommandRunner, ExternalCommand};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PG_DUMP: &str = "pg_dump";
const PG_RESTORE: &str = "pg_restore";

/// Runs `pg_dump` / `pg_restore` against the configured database.
pub struct DatabaseTool {
    runner: Arc<dyn CommandRunner>,
    config: DatabaseConfig,
    timeout: Duration,
}

impl DatabaseTool {
    pub fn new(runner: Arc<dyn CommandRunner>, config: DatabaseConfig, timeout: Duration) -> Self {
        Self {
            runner,
            config,
            timeout,
        }
    }

    /// Custom-format dump of the whole database into `output`.
    pub async fn dump(&self, output: &Path) -> Outcome {
        let cmd = ExternalCommand::new(PG_DUMP)
            .arg(format!("--dbname={}", self.config.connection_uri()))
            .args(["--format=custom", "--file"])
            .arg(output.to_string_lossy())
            .timeout(self.timeout);

        info!("Dumping database to {}", output.display());
        match self.execute(cmd).await {
            Ok(()) => Outcome::Done(output.to_path_buf()),
            Err(reason) => {
                std::fs::remove_file(output).ok();
                Outcome::Failed(reason)
            }
        }
    }

    /// Applies `dump` with `--clean`, dropping objects before recreating them.
    pub async fn restore(&self, dump: &Path) -> Outcome {
        let cmd = ExternalCommand::new(PG_RESTORE)
            .arg("--clean")
            .arg(format!("--dbname={}", self.config.connection_uri()))
            .arg(dump.to_string_lossy())
            .timeout(self.timeout);

        info!("Restoring database from {}", dump.display());
        match self.execute(cmd).await {
            Ok(()) => Outcome::Done(dump.to_path_buf()),
            Err(reason) => Outcome::Failed(reason),
        }
    }

    async fn execute(&self, cmd: ExternalCommand) -> Result<(), String> {
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                let reason = output.failure_summary();
                warn!("{} failed: {}", cmd.program, reason);
                Err(reason)
            }
            Err(e) => {
                warn!("{} failed: {}", cmd.program, e);
                Err(e.to_string())
            }
        }
    }
}
