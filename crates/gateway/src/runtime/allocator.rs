//! The allocator — process-wide coordinator for sprite allocations and
//! repo locks.
//!
//! One actor task owns all mutable state; public operations are message
//! sends on [`AllocatorHandle`]. Setup work (sprite creation, git
//! provisioning) runs in spawned tasks that report back with a
//! `SetupDone` message, so the actor never blocks on the network.
//!
//! Prewarm pipeline: `prewarm` starts setup asynchronously at task
//! creation. A later synchronous `allocate` either consumes the cached
//! result, joins the in-flight setup as a waiter, or runs setup fresh.
//! Prewarm results are delivered at most once to each waiter, and a
//! consumed result never lingers in the cache.
//!
//! Every setup runs as a numbered round per task; releasing the task
//! bumps the round so an abandoned setup's completion is recognized as
//! stale and discarded rather than clobbering a successor round's lock
//! or cache entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use sd_domain::config::Config;
use sd_domain::error::{Error, Result};
use sd_domain::model::Repo;
use sd_sprites::{Cmd as SpriteCmd, ExecOpts, SpriteClient};
use sd_store::Database;

use super::sh_quote;
use super::token::TokenManager;

/// Result of a successful allocation: where the agent should run.
#[derive(Debug, Clone)]
pub struct SpriteSetup {
    pub sprite_name: String,
    pub working_dir: String,
}

#[derive(Debug, Clone)]
struct Allocation {
    #[allow(dead_code)]
    sprite_name: String,
    repo_id: Option<i64>,
    #[allow(dead_code)]
    allocated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SetupOutcome {
    setup: SpriteSetup,
    repo_id: Option<i64>,
}

enum AllocatorCmd {
    Allocate {
        task_id: i64,
        reply: oneshot::Sender<Result<SpriteSetup>>,
    },
    Prewarm {
        task_id: i64,
    },
    Release {
        task_id: i64,
        reply: oneshot::Sender<()>,
    },
    RepoLocked {
        repo_id: i64,
        reply: oneshot::Sender<Result<Option<i64>>>,
    },
    SetupDone {
        task_id: i64,
        /// The setup round that produced this outcome; stale rounds
        /// (superseded by a release or a newer setup) are discarded.
        generation: u64,
        outcome: Result<SetupOutcome>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cheap-to-clone handle to the allocator actor.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<AllocatorCmd>,
}

impl AllocatorHandle {
    /// Synchronous allocation: resolves once the sprite and working
    /// directory are ready (or setup failed). Callers wrap this in their
    /// own outer timeout and must `release` on abandonment.
    pub async fn allocate(&self, task_id: i64) -> Result<SpriteSetup> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AllocatorCmd::Allocate { task_id, reply })
            .await
            .map_err(|_| Error::Other("allocator is gone".into()))?;
        rx.await
            .map_err(|_| Error::Other("allocator dropped the request".into()))?
    }

    /// Kick off asynchronous setup for a task; returns immediately.
    pub async fn prewarm(&self, task_id: i64) {
        let _ = self.tx.send(AllocatorCmd::Prewarm { task_id }).await;
    }

    /// Drop the allocation and release the repo lock if held. Waits for
    /// the actor to acknowledge so callers can rely on the lock being
    /// free afterwards.
    pub async fn release(&self, task_id: i64) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AllocatorCmd::Release { task_id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Which task holds the lock on a repo, if any.
    pub async fn repo_locked(&self, repo_id: i64) -> Result<Option<i64>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AllocatorCmd::RepoLocked { repo_id, reply })
            .await
            .map_err(|_| Error::Other("allocator is gone".into()))?;
        rx.await
            .map_err(|_| Error::Other("allocator dropped the request".into()))?
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dependencies the setup pipeline needs; cloned into spawned tasks.
#[derive(Clone)]
pub struct AllocatorDeps {
    pub store: Arc<Database>,
    pub sprites: Arc<SpriteClient>,
    pub tokens: Arc<TokenManager>,
    pub config: Arc<Config>,
    pub github_token: Option<String>,
}

struct Allocator {
    deps: AllocatorDeps,
    self_tx: mpsc::Sender<AllocatorCmd>,
    allocations: HashMap<i64, Allocation>,
    prewarm_cache: HashMap<i64, SetupOutcome>,
    /// task_id → generation of the setup round currently in flight.
    prewarming: HashMap<i64, u64>,
    /// Monotonic per-task setup round counter. Bumped on every fresh
    /// setup and on release, so a `SetupDone` from an abandoned round
    /// can never be mistaken for the current one. Entries are kept for
    /// the process lifetime; reusing a number after removal could let a
    /// stale round collide with a new one.
    generations: HashMap<i64, u64>,
    waiters: HashMap<i64, Vec<oneshot::Sender<Result<SpriteSetup>>>>,
}

/// Spawn the allocator actor and return its handle.
pub fn spawn(deps: AllocatorDeps) -> AllocatorHandle {
    let (tx, mut rx) = mpsc::channel(64);
    let mut actor = Allocator {
        deps,
        self_tx: tx.clone(),
        allocations: HashMap::new(),
        prewarm_cache: HashMap::new(),
        prewarming: HashMap::new(),
        generations: HashMap::new(),
        waiters: HashMap::new(),
    };

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            actor.handle(cmd);
        }
        tracing::debug!("allocator actor stopped");
    });

    AllocatorHandle { tx }
}

impl Allocator {
    fn handle(&mut self, cmd: AllocatorCmd) {
        match cmd {
            AllocatorCmd::Allocate { task_id, reply } => self.on_allocate(task_id, reply),
            AllocatorCmd::Prewarm { task_id } => self.on_prewarm(task_id),
            AllocatorCmd::Release { task_id, reply } => {
                self.on_release(task_id);
                let _ = reply.send(());
            }
            AllocatorCmd::RepoLocked { repo_id, reply } => {
                let _ = reply.send(self.deps.store.locked_by(repo_id));
            }
            AllocatorCmd::SetupDone {
                task_id,
                generation,
                outcome,
            } => self.on_setup_done(task_id, generation, outcome),
        }
    }

    fn on_allocate(&mut self, task_id: i64, reply: oneshot::Sender<Result<SpriteSetup>>) {
        // 1. A completed prewarm is waiting: consume it.
        if let Some(outcome) = self.prewarm_cache.remove(&task_id) {
            self.record_allocation(task_id, &outcome);
            let _ = reply.send(Ok(outcome.setup));
            return;
        }

        // 2. Prewarm in flight: suspend the reply until it lands.
        if self.prewarming.contains_key(&task_id) {
            self.waiters.entry(task_id).or_default().push(reply);
            return;
        }

        // 3. Fresh setup, with the caller queued as its only waiter.
        let generation = self.bump_generation(task_id);
        self.prewarming.insert(task_id, generation);
        self.waiters.entry(task_id).or_default().push(reply);
        self.spawn_setup(task_id, generation);
    }

    fn on_prewarm(&mut self, task_id: i64) {
        if self.allocations.contains_key(&task_id)
            || self.prewarm_cache.contains_key(&task_id)
            || self.prewarming.contains_key(&task_id)
        {
            return;
        }
        tracing::debug!(task_id, "prewarm started");
        let generation = self.bump_generation(task_id);
        self.prewarming.insert(task_id, generation);
        self.spawn_setup(task_id, generation);
    }

    fn on_release(&mut self, task_id: i64) {
        // Cancel any in-flight setup round; bumping the generation makes
        // its eventual SetupDone stale no matter what starts afterwards.
        self.bump_generation(task_id);
        self.prewarming.remove(&task_id);
        self.waiters.remove(&task_id);

        if let Some(alloc) = self.allocations.remove(&task_id) {
            self.unlock(task_id, alloc.repo_id);
        }
        if let Some(outcome) = self.prewarm_cache.remove(&task_id) {
            self.unlock(task_id, outcome.repo_id);
        }
    }

    fn on_setup_done(&mut self, task_id: i64, generation: u64, outcome: Result<SetupOutcome>) {
        // Only the round currently in flight counts; anything else was
        // abandoned by a release (possibly followed by a fresh round).
        let expected = self.prewarming.get(&task_id).copied() == Some(generation);

        if !expected {
            if let Ok(outcome) = outcome {
                // Roll the lock back only when no newer round owns it —
                // the lock is reentrant per task, so a stale unlock
                // would also release a successor round's hold.
                let superseded = self.prewarming.contains_key(&task_id)
                    || self.allocations.contains_key(&task_id)
                    || self.prewarm_cache.contains_key(&task_id);
                if superseded {
                    tracing::debug!(task_id, generation, "discarding superseded setup round");
                } else {
                    tracing::debug!(task_id, generation, "rolling back setup for released task");
                    self.unlock(task_id, outcome.repo_id);
                }
            }
            return;
        }

        self.prewarming.remove(&task_id);
        let waiters = self.waiters.remove(&task_id).unwrap_or_default();

        match outcome {
            Ok(outcome) => {
                if waiters.is_empty() {
                    // Nobody asked yet: cache for the next allocate.
                    self.prewarm_cache.insert(task_id, outcome);
                    return;
                }
                let mut delivered = false;
                for waiter in waiters {
                    if waiter.send(Ok(outcome.setup.clone())).is_ok() {
                        delivered = true;
                    }
                }
                if delivered {
                    self.record_allocation(task_id, &outcome);
                } else {
                    // Every caller gave up (outer timeout): the lock must
                    // not stay held.
                    tracing::warn!(task_id, "allocation completed after all callers left");
                    self.unlock(task_id, outcome.repo_id);
                }
            }
            Err(e) => {
                // Setup released the lock on its own failure path.
                if waiters.is_empty() {
                    tracing::warn!(task_id, error = %e, "prewarm failed with no waiters");
                } else {
                    for waiter in waiters {
                        let _ = waiter.send(Err(clone_err(&e)));
                    }
                }
            }
        }
    }

    fn record_allocation(&mut self, task_id: i64, outcome: &SetupOutcome) {
        self.allocations.insert(
            task_id,
            Allocation {
                sprite_name: outcome.setup.sprite_name.clone(),
                repo_id: outcome.repo_id,
                allocated_at: Utc::now(),
            },
        );
        tracing::info!(
            task_id,
            sprite = %outcome.setup.sprite_name,
            working_dir = %outcome.setup.working_dir,
            "sprite allocated"
        );
    }

    fn unlock(&self, task_id: i64, repo_id: Option<i64>) {
        if let Some(repo_id) = repo_id {
            if let Err(e) = self.deps.store.unlock_repo(repo_id, task_id) {
                tracing::warn!(task_id, repo_id, error = %e, "repo unlock failed");
            }
        }
    }

    fn bump_generation(&mut self, task_id: i64) -> u64 {
        let generation = self.generations.entry(task_id).or_insert(0);
        *generation += 1;
        *generation
    }

    fn spawn_setup(&self, task_id: i64, generation: u64) {
        let deps = self.deps.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let outcome = setup_sprite_for_task(&deps, task_id).await;
            let _ = tx
                .send(AllocatorCmd::SetupDone {
                    task_id,
                    generation,
                    outcome,
                })
                .await;
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Setup pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn setup_sprite_for_task(deps: &AllocatorDeps, task_id: i64) -> Result<SetupOutcome> {
    let task = deps
        .store
        .get_task(task_id)?
        .ok_or_else(|| Error::Other(format!("task {task_id} not found")))?;

    let repo = match task.repo_id {
        Some(repo_id) => Some(
            deps.store
                .get_repo(repo_id)?
                .ok_or_else(|| Error::RepoNotFound(format!("repo id {repo_id}")))?,
        ),
        None => None,
    };

    // The lock is taken before any sprite work and released on every
    // failure path below.
    if let Some(repo) = &repo {
        deps.store.try_lock_repo(repo.id, task_id)?;
    }

    let result = provision(deps, repo.as_ref()).await;
    if result.is_err() {
        if let Some(repo) = &repo {
            if let Err(e) = deps.store.unlock_repo(repo.id, task_id) {
                tracing::warn!(task_id, repo_id = repo.id, error = %e, "unlock after failed setup");
            }
        }
    }

    result.map(|setup| SetupOutcome {
        setup,
        repo_id: task.repo_id,
    })
}

async fn provision(deps: &AllocatorDeps, repo: Option<&Repo>) -> Result<SpriteSetup> {
    let sprite_name = deps.config.sprites.default_sprite.clone();

    // Creation is idempotent: an existing sprite is reused (and woken if
    // hibernated).
    deps.sprites
        .create(&sprite_name, false)
        .await
        .map_err(|e| Error::SpriteCreationFailed(e.to_string()))?;

    ensure_git_credentials(deps, &sprite_name).await?;

    let working_dir = match repo {
        None => "/home/sprite".to_owned(),
        Some(repo) => {
            let wd = working_dir_for(&repo.display_name);
            prepare_checkout(deps, &sprite_name, repo, &wd).await?;
            deps.store.touch_repo_used(repo.id)?;
            wd
        }
    };

    Ok(SpriteSetup {
        sprite_name,
        working_dir,
    })
}

/// The working directory is deterministic from the repo display name.
fn working_dir_for(display_name: &str) -> String {
    format!("/home/sprite/repos/{display_name}")
}

/// One-time global git credential configuration inside the sprite.
/// Probed before every write; a `.gitconfig` lock collision is resolved
/// by sleeping 500 ms and re-probing.
async fn ensure_git_credentials(deps: &AllocatorDeps, sprite: &str) -> Result<()> {
    let git_timeout = std::time::Duration::from_secs(deps.config.sprites.git_config_timeout_secs);

    let probe = deps
        .sprites
        .exec(
            sprite,
            SpriteCmd::Argv(vec![
                "git".into(),
                "config".into(),
                "--global".into(),
                "--get".into(),
                "credential.helper".into(),
            ]),
            ExecOpts {
                timeout: git_timeout,
                env: Vec::new(),
            },
        )
        .await?;
    if probe.success() && !probe.stdout.trim().is_empty() {
        return Ok(());
    }

    let token = match &deps.github_token {
        Some(tok) => tok.clone(),
        None => deps.tokens.get_access_token().await?,
    };
    let script = format!(
        "git config --global credential.helper store && \
         printf 'https://x-access-token:%s@github.com\\n' {} > /home/sprite/.git-credentials",
        sh_quote(&token)
    );
    let out = deps
        .sprites
        .exec(
            sprite,
            SpriteCmd::Shell(script),
            ExecOpts {
                timeout: git_timeout,
                env: Vec::new(),
            },
        )
        .await?;
    if out.success() {
        return Ok(());
    }

    if out.combined().contains("could not lock config file") {
        // Another task's setup is writing the same global config; give it
        // a moment and accept its result.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let reprobe = deps
            .sprites
            .exec(
                sprite,
                SpriteCmd::Argv(vec![
                    "git".into(),
                    "config".into(),
                    "--global".into(),
                    "--get".into(),
                    "credential.helper".into(),
                ]),
                ExecOpts {
                    timeout: git_timeout,
                    env: Vec::new(),
                },
            )
            .await?;
        if reprobe.success() && !reprobe.stdout.trim().is_empty() {
            return Ok(());
        }
    }

    Err(Error::GitConfigFailed(out.combined()))
}

/// Make `working_dir` a checkout of the task's repo: reuse a matching
/// existing clone (pulling is best-effort), replace a mismatched one,
/// or clone fresh.
async fn prepare_checkout(
    deps: &AllocatorDeps,
    sprite: &str,
    repo: &Repo,
    working_dir: &str,
) -> Result<()> {
    let exec_timeout = std::time::Duration::from_secs(deps.config.sprites.exec_timeout_secs);
    let opts = || ExecOpts {
        timeout: exec_timeout,
        env: Vec::new(),
    };

    let has_git = deps
        .sprites
        .exec(
            sprite,
            SpriteCmd::Argv(vec!["test".into(), "-d".into(), format!("{working_dir}/.git")]),
            opts(),
        )
        .await?
        .success();

    if has_git {
        let remote = deps
            .sprites
            .exec(
                sprite,
                SpriteCmd::Argv(vec![
                    "git".into(),
                    "-C".into(),
                    working_dir.into(),
                    "remote".into(),
                    "get-url".into(),
                    "origin".into(),
                ]),
                opts(),
            )
            .await?;

        if remote.success()
            && normalize_remote_url(remote.stdout.trim()) == normalize_remote_url(&repo.remote_url)
        {
            let pull = deps
                .sprites
                .exec(
                    sprite,
                    SpriteCmd::Argv(vec![
                        "git".into(),
                        "-C".into(),
                        working_dir.into(),
                        "pull".into(),
                    ]),
                    ExecOpts {
                        timeout: std::time::Duration::from_secs(
                            deps.config.sprites.pull_timeout_secs,
                        ),
                        env: Vec::new(),
                    },
                )
                .await?;
            if !pull.success() {
                // Stale but usable checkout beats a failed session.
                tracing::warn!(
                    repo = %repo.display_name,
                    output = %pull.combined(),
                    "git pull failed; continuing with existing checkout"
                );
            }
            return Ok(());
        }
        tracing::info!(
            repo = %repo.display_name,
            "existing checkout points at a different remote; recloning"
        );
    }

    let parent = working_dir
        .rsplit_once('/')
        .map(|(p, _)| p.to_owned())
        .unwrap_or_else(|| "/".to_owned());
    deps.sprites
        .exec(
            sprite,
            SpriteCmd::Argv(vec!["mkdir".into(), "-p".into(), parent]),
            opts(),
        )
        .await?;
    deps.sprites
        .exec(
            sprite,
            SpriteCmd::Argv(vec!["rm".into(), "-rf".into(), working_dir.into()]),
            opts(),
        )
        .await?;

    let clone = deps
        .sprites
        .exec(
            sprite,
            SpriteCmd::Argv(vec![
                "git".into(),
                "clone".into(),
                repo.remote_url.clone(),
                working_dir.into(),
            ]),
            ExecOpts {
                timeout: std::time::Duration::from_secs(deps.config.sprites.clone_timeout_secs),
                env: Vec::new(),
            },
        )
        .await?;
    if !clone.success() {
        let output = clone.combined();
        if output.to_lowercase().contains("not found") {
            return Err(Error::RepoNotFound(repo.remote_url.clone()));
        }
        return Err(Error::CloneFailed(output));
    }
    Ok(())
}

/// Compare remote URLs the way git users think of them: trailing slash
/// and `.git` suffix dropped, case-insensitive.
fn normalize_remote_url(url: &str) -> String {
    url.trim()
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_lowercase()
}

/// Errors cross a oneshot per waiter, so fan-out needs a structural copy.
/// Typed variants the supervisor matches on survive; the rest degrade to
/// their display form.
fn clone_err(e: &Error) -> Error {
    match e {
        Error::RepoLocked { repo_id, holder } => Error::RepoLocked {
            repo_id: *repo_id,
            holder: *holder,
        },
        Error::RepoNotFound(s) => Error::RepoNotFound(s.clone()),
        Error::CloneFailed(s) => Error::CloneFailed(s.clone()),
        Error::GitConfigFailed(s) => Error::GitConfigFailed(s.clone()),
        Error::SpriteCreationFailed(s) => Error::SpriteCreationFailed(s.clone()),
        Error::NoTokenConfigured => Error::NoTokenConfigured,
        Error::RefreshFailed(s) => Error::RefreshFailed(s.clone()),
        Error::Timeout(s) => Error::Timeout(s.clone()),
        other => Error::PrewarmFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_dir_nests_owner_and_repo() {
        assert_eq!(
            working_dir_for("acme/widget"),
            "/home/sprite/repos/acme/widget"
        );
    }

    #[test]
    fn remote_url_normalization() {
        assert_eq!(
            normalize_remote_url("https://github.com/Acme/Widget.git"),
            "https://github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widget/"),
            "https://github.com/acme/widget"
        );
        assert_eq!(
            normalize_remote_url("  https://github.com/acme/widget \n"),
            "https://github.com/acme/widget"
        );
    }

    #[test]
    fn clone_err_preserves_typed_variants() {
        let e = clone_err(&Error::RepoLocked {
            repo_id: 1,
            holder: 2,
        });
        assert!(matches!(e, Error::RepoLocked { repo_id: 1, holder: 2 }));

        let e = clone_err(&Error::Db("oops".into()));
        assert!(matches!(e, Error::PrewarmFailed(_)));
    }
}
