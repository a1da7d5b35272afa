//! Engine lifecycle management: init and shutdown.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::sync_queue::BacklogEntry;

use super::{EngineState, ShutdownReport, StateEngine, BACKLOG_FILE, MAX_REQUESTS};

impl StateEngine {
    /// Bring the engine to `Running`.
    ///
    /// Startup flow:
    /// 1. Create the data directory if needed
    /// 2. Remove temp files orphaned by a crash mid-write
    /// 3. Re-enqueue the replication backlog left by the last shutdown
    /// 4. Start the sync workers
    ///
    /// Calling `init()` on a running engine is a no-op. A stopped engine can
    /// be initialized again.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        match self.state() {
            EngineState::Created | EngineState::Stopped => {}
            EngineState::Running => {
                warn!("init() called on a running engine");
                return Ok(());
            }
            other => return Err(EngineError::NotRunning(other.to_string())),
        }

        let start = Instant::now();
        info!(data_dir = %self.config.data_dir.display(), "Starting state engine...");
        self.set_state(EngineState::Starting);

        if let Err(e) = self.prepare_data_dir().await {
            self.set_state(EngineState::Stopped);
            return Err(e);
        }

        self.queues.start();
        self.set_state(EngineState::Running);
        crate::metrics::record_lifecycle_phase("init", start.elapsed());
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "State engine running");
        Ok(())
    }

    async fn prepare_data_dir(&self) -> Result<()> {
        let data_dir = &self.config.data_dir;
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| EngineError::io(data_dir, e))?;

        let swept = self.files.sweep_temp_files().await?;
        if swept > 0 {
            warn!(count = swept, "Swept orphaned temp files from an interrupted write");
        }

        let backlog_path = Path::new(BACKLOG_FILE);
        if let Some(backlog) = self.files.read_or_quarantine::<Vec<BacklogEntry>>(backlog_path).await? {
            let restored = self.queues.restore(backlog);
            self.files.remove(backlog_path).await?;
            info!(entries = restored, "Restored replication backlog from previous run");
        }
        Ok(())
    }

    /// Drain replication within `shutdown_grace_ms` and stop.
    ///
    /// New requests are refused as soon as this starts; requests already
    /// admitted are waited for so their writes are replicated too. Whatever
    /// could not be replicated in time (including permanently failed
    /// entries, which stay parked) is written to the backlog file and picked
    /// up by the next `init()`. The whole sequence is bounded by the grace
    /// period plus the backlog write.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        if self.state() != EngineState::Running {
            info!(state = %self.state(), "shutdown() called on an engine that is not running");
            return Ok(ShutdownReport::default());
        }

        let start = Instant::now();
        info!(grace_ms = self.config.shutdown_grace_ms, "Shutting down state engine...");
        self.set_state(EngineState::ShuttingDown);

        let grace = self.config.shutdown_grace();
        self.wait_for_requests(grace).await;
        let backlog = self.queues.shutdown(grace.saturating_sub(start.elapsed())).await;
        crate::metrics::record_lifecycle_phase("drain", start.elapsed());

        let report = ShutdownReport {
            persisted_backlog: backlog.len(),
        };
        let persisted = if backlog.is_empty() {
            Ok(())
        } else {
            self.files.write(Path::new(BACKLOG_FILE), &backlog).await
        };

        self.set_state(EngineState::Stopped);
        crate::metrics::record_lifecycle_phase("shutdown", start.elapsed());

        match persisted {
            Ok(()) => {
                if report.fully_drained() {
                    info!(elapsed_ms = start.elapsed().as_millis() as u64, "State engine stopped");
                } else {
                    warn!(entries = report.persisted_backlog, "State engine stopped with replication backlog persisted");
                }
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, entries = report.persisted_backlog, "Failed to persist replication backlog");
                Err(e)
            }
        }
    }

    /// Wait up to `grace` for admitted calls to finish.
    async fn wait_for_requests(&self, grace: Duration) {
        let active = self.active_requests();
        if active == 0 {
            return;
        }
        info!(active, "Waiting for in-flight requests");
        // Permits are released right away: the state already refuses new calls
        if tokio::time::timeout(grace, self.requests.acquire_many(MAX_REQUESTS)).await.is_err() {
            warn!(active, "Requests still running at the grace deadline, their replication may be lost");
        }
    }
}
