//! Change-driven, bounded-concurrency task controller.
//!
//! Owns the pending queue's consumer side and the in-flight worker table.
//! Every cycle runs reap → preempt → admit, then sleeps on a tick interval.
//! The loop never blocks on an empty queue — completion polling and
//! preemption checks must keep running even when no changes are pending.

pub mod queue;
pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::report::Reporter;
use queue::SharedPendingQueue;
use worker::{WorkerHandle, WorkerStatus};

pub struct Controller {
    command: String,
    repo_dir: PathBuf,
    max_concurrent: usize,
    tick_interval: Duration,
    kill_grace: Duration,
    queue: SharedPendingQueue,
    reporter: Reporter,
    /// At most one worker per file. Size ≤ `max_concurrent` after every
    /// admission pass; may exceed it only inside the replace-on-preemption
    /// step, never across cycles.
    running: HashMap<String, WorkerHandle>,
    /// Terminated workers whose processes have not been observed dead yet.
    /// Swept by the reap pass; they produce no further reports.
    retiring: Vec<WorkerHandle>,
}

impl Controller {
    pub fn new(config: &DaemonConfig, queue: SharedPendingQueue, reporter: Reporter) -> Self {
        Self {
            command: config.validation_command.clone(),
            repo_dir: config.repo_dir.clone(),
            max_concurrent: config.max_concurrent,
            tick_interval: config.tick_interval,
            kill_grace: config.kill_grace,
            queue,
            reporter,
            running: HashMap::new(),
            retiring: Vec::new(),
        }
    }

    /// Number of in-flight workers.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Whether a worker is currently in flight for `file`.
    pub fn is_running(&self, file: &str) -> bool {
        self.running.contains_key(file)
    }

    /// Run until `shutdown` flips, then terminate every in-flight worker.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_cycle().await,
                _ = shutdown.changed() => break,
            }
        }
        self.shutdown().await;
    }

    /// One reap → preempt → admit pass. The three phases run sequentially,
    /// so they never race against each other within one controller.
    pub async fn run_cycle(&mut self) {
        self.reap().await;
        self.preempt().await;
        self.admit().await;
    }

    /// Observe exited workers, emit their terminal report, and sweep the
    /// retiring set.
    async fn reap(&mut self) {
        let exited: Vec<(String, i32)> = self
            .running
            .iter_mut()
            .filter_map(|(file, handle)| match handle.poll() {
                WorkerStatus::Exited(code) => Some((file.clone(), code)),
                WorkerStatus::Running => None,
            })
            .collect();

        for (file, code) in exited {
            if let Some(handle) = self.running.remove(&file) {
                let output = handle.into_output().await;
                if code == 0 {
                    self.reporter.success(&file, &output);
                } else {
                    self.reporter.failure(&file, code, &output);
                }
            }
        }

        self.sweep_retiring().await;
    }

    /// Cancel workers whose file has a newer pending change, consuming that
    /// change and relaunching into the freed slot. One atomic replace — the
    /// slot never counts twice against capacity.
    async fn preempt(&mut self) {
        let files: Vec<String> = self.running.keys().cloned().collect();
        for file in files {
            if !self.queue.take_first(&file).await {
                continue;
            }
            self.supersede(&file);
            self.launch(&file);
        }
    }

    /// Fill free slots from the queue, oldest change first. A dequeued file
    /// that still has a running worker raced past the preemption pass and is
    /// handled identically: supersede the old, install the new.
    async fn admit(&mut self) {
        while self.running.len() < self.max_concurrent {
            let Some(file) = self.queue.try_dequeue().await else {
                break;
            };
            self.supersede(&file);
            self.launch(&file);
        }
    }

    /// Terminate the running worker for `file`, if any, and park it in the
    /// retiring set. Emits the worker's single terminal report: `superseded`.
    fn supersede(&mut self, file: &str) {
        if let Some(mut old) = self.running.remove(file) {
            self.reporter.superseded(file);
            old.terminate();
            self.retiring.push(old);
        }
    }

    fn launch(&mut self, file: &str) {
        match WorkerHandle::launch(&self.command, file, &self.repo_dir) {
            Ok(handle) => {
                self.reporter.started(file);
                self.running.insert(file.to_string(), handle);
            }
            Err(err) => {
                warn!(file = %file, err = %err, "failed to launch validation");
                self.reporter
                    .failure(file, -1, &format!("failed to launch validation: {err}"));
            }
        }
    }

    /// Poll retiring workers; drop the dead ones, escalate to SIGKILL once
    /// the grace period runs out.
    async fn sweep_retiring(&mut self) {
        let mut still_dying = Vec::new();
        for mut handle in std::mem::take(&mut self.retiring) {
            match handle.poll() {
                WorkerStatus::Exited(_) => {
                    debug!(file = %handle.file, "superseded worker exited");
                    let _ = handle.into_output().await;
                }
                WorkerStatus::Running => {
                    if handle.termination_overdue(self.kill_grace) {
                        warn!(file = %handle.file, "superseded worker ignored SIGTERM — killing");
                        handle.force_kill();
                    }
                    still_dying.push(handle);
                }
            }
        }
        self.retiring = still_dying;
    }

    /// Terminate every in-flight worker exactly once and wait (bounded by the
    /// grace period) for them to die. Already-exited workers are skipped
    /// without error; nothing is relaunched.
    pub async fn shutdown(&mut self) {
        info!(in_flight = self.running.len(), "terminating in-flight validations");
        for (_, mut handle) in self.running.drain() {
            if handle.poll() == WorkerStatus::Running {
                handle.terminate();
            }
            self.retiring.push(handle);
        }

        let deadline = Instant::now() + self.kill_grace;
        while !self.retiring.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.sweep_retiring().await;
        }
        for mut handle in std::mem::take(&mut self.retiring) {
            handle.force_kill();
            let _ = handle.into_output().await;
        }
    }
}
