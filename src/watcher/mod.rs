//! Git branch watcher — the change source feeding the pending queue.
//!
//! Polls the tracked branch on a fixed cadence: fetch the remote, compare the
//! previously observed tip with `refs/remotes/origin/<branch>`, diff the two
//! commit trees, enqueue every changed path, and fast-forward the local
//! checkout so validations run against the new revision.
//!
//! The network fetch shells out to the `git` binary (so an SSH identity works
//! via `GIT_SSH_COMMAND`); everything else uses libgit2. git2 is sync, so
//! repository access runs inside `spawn_blocking` — the watcher never holds a
//! `Repository` across an await point.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use git2::{BranchType, Oid, Repository};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::queue::SharedPendingQueue;
use crate::report::Reporter;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),
    #[error("branch '{0}' does not exist in the repository")]
    BranchNotFound(String),
    #[error("remote 'origin' is not configured")]
    NoOrigin,
    /// The upstream could not be reached (network/auth). Transient — the
    /// watcher logs it and keeps polling; it never reaches the controller.
    #[error("git fetch failed: {0}")]
    FetchFailed(String),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("repository task panicked: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One observed branch movement.
#[derive(Debug)]
pub struct BranchUpdate {
    pub old: Oid,
    pub new: Oid,
    pub files: Vec<String>,
}

#[derive(Debug)]
pub struct GitWatcher {
    repo_dir: PathBuf,
    branch: String,
    ssh_key: Option<PathBuf>,
    queue: SharedPendingQueue,
    reporter: Reporter,
    last_tip: Oid,
}

impl GitWatcher {
    /// Open the repository and validate it up front: it must be a git repo
    /// with the tracked branch and an `origin` remote. Fail-fast — a broken
    /// setup should stop the daemon before it starts polling.
    pub fn open(
        repo_dir: &Path,
        branch: &str,
        ssh_key: Option<&Path>,
        queue: SharedPendingQueue,
        reporter: Reporter,
    ) -> Result<Self, WatcherError> {
        let repo = Repository::open(repo_dir)
            .map_err(|_| WatcherError::NotARepository(repo_dir.to_path_buf()))?;
        repo.find_remote("origin").map_err(|_| WatcherError::NoOrigin)?;
        let last_tip = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| WatcherError::BranchNotFound(branch.to_string()))?
            .get()
            .peel_to_commit()?
            .id();

        info!(repo = %repo_dir.display(), branch = %branch, tip = %last_tip, "watching branch");
        Ok(Self {
            repo_dir: repo_dir.to_path_buf(),
            branch: branch.to_string(),
            ssh_key: ssh_key.map(Path::to_path_buf),
            queue,
            reporter,
            last_tip,
        })
    }

    /// Fetch, diff, enqueue. Returns the observed update, or `None` when the
    /// branch has not moved.
    pub async fn poll_once(&mut self) -> Result<Option<BranchUpdate>, WatcherError> {
        self.fetch().await?;

        let repo_dir = self.repo_dir.clone();
        let branch = self.branch.clone();
        let last_tip = self.last_tip;
        let update =
            tokio::task::spawn_blocking(move || advance_branch(&repo_dir, &branch, last_tip))
                .await??;

        let Some(update) = update else {
            debug!(branch = %self.branch, "branch unchanged");
            return Ok(None);
        };

        self.last_tip = update.new;
        self.reporter.changes(
            &self.branch,
            &update.old.to_string(),
            &update.new.to_string(),
            &update.files,
        );
        for file in &update.files {
            self.queue.enqueue(file.clone()).await;
        }
        Ok(Some(update))
    }

    /// Spawn the background polling loop.
    /// Returns the `JoinHandle` — drop or abort to stop.
    pub fn spawn(mut self, poll_interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                // Errors here are transient (network, auth): log and retry on
                // the next tick. Silence from the source is not an error.
                if let Err(err) = self.poll_once().await {
                    warn!(err = %err, "branch poll failed — will retry");
                }
            }
        })
    }

    async fn fetch(&self) -> Result<(), WatcherError> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("fetch")
            .arg("origin")
            .arg(&self.branch)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(key) = &self.ssh_key {
            cmd.env("GIT_SSH_COMMAND", format!("ssh -i {}", key.display()));
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(WatcherError::FetchFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Compare `last_tip` with the fetched remote tip; on movement, collect the
/// changed paths and fast-forward the local branch and working tree.
fn advance_branch(
    repo_dir: &Path,
    branch: &str,
    last_tip: Oid,
) -> Result<Option<BranchUpdate>, git2::Error> {
    let repo = Repository::open(repo_dir)?;

    let remote_ref = format!("refs/remotes/origin/{branch}");
    let new_tip = repo.find_reference(&remote_ref)?.peel_to_commit()?.id();
    if new_tip == last_tip {
        return Ok(None);
    }

    let old_tree = repo.find_commit(last_tip)?.tree()?;
    let new_tree = repo.find_commit(new_tip)?.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        // Deletions carry no new-file path; validate against the old one.
        if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
            files.push(path.to_string_lossy().to_string());
        }
    }

    // Fast-forward the local checkout so validation commands see the new
    // revision on disk.
    let local_ref = format!("refs/heads/{branch}");
    repo.find_reference(&local_ref)?
        .set_target(new_tip, "vigild: fast-forward")?;
    repo.set_head(&local_ref)?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))?;

    Ok(Some(BranchUpdate {
        old: last_tip,
        new: new_tip,
        files,
    }))
}
