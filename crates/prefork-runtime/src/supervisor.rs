//! Pool supervisor
//!
//! Spawns the initial pool, then blocks in wait. Each reaped worker is
//! removed from the alive set and replaced by as many workers as it
//! reported. On shutdown the pool is drained: SIGTERM first, SIGKILL for
//! whatever is left once the grace period runs out.
//!
//! The supervisor is generic over [`Spawn`] and [`Reap`] so the pool logic
//! can be exercised without real processes.

use std::time::{Duration, Instant};

use prefork_core::{resolve_replacements, PoolStats, ProcessId, WorkerSet};

use crate::error::SupervisorError;
use crate::reap::{ExitEvent, Reap, ReapOutcome, WaitMode};
use crate::signal::Shutdown;
use crate::spawn::Spawn;

/// Sleep between non-blocking waits while draining.
const DRAIN_POLL: Duration = Duration::from_millis(20);

pub struct Supervisor<S, R> {
    spawner: S,
    reaper: R,
    workers: WorkerSet,
    shutdown_timeout: Duration,
}

impl<S: Spawn, R: Reap> Supervisor<S, R> {
    pub fn new(spawner: S, reaper: R, num_children: usize, shutdown_timeout: Duration) -> Self {
        Self {
            spawner,
            reaper,
            workers: WorkerSet::new(num_children),
            shutdown_timeout,
        }
    }

    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    /// Direct access to the reaper, for driving single waits.
    pub fn reaper_mut(&mut self) -> &mut R {
        &mut self.reaper
    }

    /// Spawn up to `count` workers. Failures are logged and leave the pool
    /// short. Returns how many started.
    pub fn spawn_workers(&mut self, count: u32) -> u32 {
        let mut started = 0;
        for _ in 0..count {
            match self.spawner.spawn() {
                Ok(pid) => {
                    let serial = self.workers.insert(pid).serial;
                    started += 1;
                    tracing::info!(pid, worker = serial, alive = self.workers.len(), "Spawned worker");
                }
                Err(e) => {
                    self.workers.note_spawn_failure();
                    tracing::error!(error = %e, alive = self.workers.len(), "Cannot spawn worker");
                }
            }
        }
        started
    }

    /// Fill the pool to its target size.
    pub fn spawn_initial(&mut self) -> u32 {
        let deficit = self.workers.deficit() as u32;
        self.spawn_workers(deficit)
    }

    /// Account for one reaped child and spawn its replacements.
    ///
    /// Returns the number of workers spawned. Unknown pids are ignored.
    pub fn handle_exit(&mut self, event: ExitEvent) -> u32 {
        if !self.retire(&event) {
            return 0;
        }
        let replacements = resolve_replacements(event.report, &event.termination);
        self.spawn_workers(replacements)
    }

    /// Remove `event.pid` from the alive set. `false` if it was not ours.
    fn retire(&mut self, event: &ExitEvent) -> bool {
        match self.workers.remove(event.pid) {
            Some(record) => {
                if event.termination.is_clean() {
                    tracing::info!(
                        pid = event.pid,
                        worker = record.serial,
                        termination = %event.termination,
                        replacements = ?event.report,
                        uptime_ms = record.uptime().as_millis() as u64,
                        "Worker exited"
                    );
                } else {
                    tracing::warn!(
                        pid = event.pid,
                        worker = record.serial,
                        termination = %event.termination,
                        replacements = ?event.report,
                        uptime_ms = record.uptime().as_millis() as u64,
                        "Worker exited abnormally"
                    );
                }
                true
            }
            None => {
                tracing::warn!(pid = event.pid, termination = %event.termination, "Ignoring exit of unknown child");
                false
            }
        }
    }

    /// Run until `shutdown` is requested, then drain the pool.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<PoolStats, SupervisorError> {
        if !shutdown.is_requested() {
            self.spawn_initial();
        }

        while !shutdown.is_requested() {
            match self.reaper.wait_any(WaitMode::Block)? {
                ReapOutcome::Exited(event) => {
                    if shutdown.is_requested() {
                        self.retire(&event);
                        break;
                    }
                    self.handle_exit(event);
                }
                ReapOutcome::Interrupted | ReapOutcome::Pending => continue,
                ReapOutcome::NoChildren => {
                    tracing::error!(stats = ?self.workers.stats(), "Worker pool exhausted");
                    return Err(SupervisorError::PoolExhausted);
                }
            }
        }

        self.drain(shutdown);
        Ok(self.workers.stats())
    }

    /// Stop every worker: SIGTERM, wait up to the grace period, SIGKILL.
    fn drain(&mut self, shutdown: &Shutdown) {
        tracing::info!(
            alive = self.workers.len(),
            signal = ?shutdown.signal(),
            "Shutting down worker pool"
        );
        self.signal_all(false);

        let deadline = Instant::now() + self.shutdown_timeout;
        while !self.workers.is_empty() && Instant::now() < deadline {
            if !self.reap_one(WaitMode::Poll) {
                std::thread::sleep(DRAIN_POLL);
            }
        }

        if !self.workers.is_empty() {
            tracing::warn!(alive = self.workers.len(), "Grace period over; killing workers");
            self.signal_all(true);
            while !self.workers.is_empty() {
                self.reap_one(WaitMode::Block);
            }
        }
        tracing::info!("Worker pool stopped");
    }

    /// One wait during drain. `false` if nothing was reaped.
    fn reap_one(&mut self, mode: WaitMode) -> bool {
        match self.reaper.wait_any(mode) {
            Ok(ReapOutcome::Exited(event)) => {
                self.retire(&event);
                true
            }
            Ok(ReapOutcome::NoChildren) => {
                // Nothing left to wait for; whatever we still track is gone.
                for pid in self.workers.pids() {
                    self.workers.remove(pid);
                }
                false
            }
            Ok(ReapOutcome::Interrupted) | Ok(ReapOutcome::Pending) => false,
            Err(e) => {
                tracing::error!(error = %e, "Wait failed during shutdown");
                for pid in self.workers.pids() {
                    self.workers.remove(pid);
                }
                false
            }
        }
    }

    fn signal_all(&mut self, force: bool) {
        let pids: Vec<ProcessId> = self.workers.pids();
        for pid in pids {
            if let Err(e) = self.spawner.signal(pid, force) {
                tracing::debug!(pid, error = %e, "Cannot signal worker");
            }
        }
    }
}
