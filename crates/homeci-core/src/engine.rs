//! Engine: turns configuration snapshots into running branch watch loops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cursor_state::CursorKey;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{
    BranchPipelineConfig, BuildSettings, ConfigSnapshot, Credential, GitConfig, RetrySettings,
};
use crate::manager::{Collaborators, Manager, ManagerError};
use crate::pipeline::{BranchPipelineRunner, BranchWatch, PipelineError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("branch discovery failed for {repository}: {source}")]
    Discovery {
        repository: String,
        #[source]
        source: PipelineError,
    },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is closed")]
    Closed,
}

/// What a loop was started with. A loop is restarted when this changes.
#[derive(Debug, Clone, PartialEq)]
struct WatchSpec {
    pipeline: BranchPipelineConfig,
    buffer_root: PathBuf,
    services: ServiceSettings,
}

/// Snapshot fields baked into a runner's services when it is built.
#[derive(Debug, Clone, PartialEq)]
struct ServiceSettings {
    git: GitConfig,
    credentials: Option<Credential>,
    retry: RetrySettings,
    poll_interval_secs: u64,
    max_concurrent_downloads: usize,
    build: BuildSettings,
}

impl ServiceSettings {
    fn of(snapshot: &ConfigSnapshot) -> Self {
        Self {
            git: snapshot.git.clone(),
            credentials: snapshot.credentials.clone(),
            retry: snapshot.retry,
            poll_interval_secs: snapshot.poll_interval_secs,
            max_concurrent_downloads: snapshot.max_concurrent_downloads,
            build: snapshot.build.clone(),
        }
    }
}

struct PlannedWatch {
    key: CursorKey,
    spec: WatchSpec,
    runner: Arc<BranchPipelineRunner>,
    watch: BranchWatch,
}

struct RunningLoop {
    spec: WatchSpec,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct EngineState {
    manager: Option<Manager>,
    loops: HashMap<CursorKey, RunningLoop>,
    closed: bool,
}

/// Loop changes applied by [`Engine::reload`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: usize,
    pub stopped: usize,
    pub kept: usize,
}

/// Owns the set of branch watch loops.
pub struct Engine {
    collaborators: Collaborators,
    root: CancellationToken,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            root: CancellationToken::new(),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Verify, discover and start a loop per matched branch. Returns once the
    /// loops are spawned; the number of loops is returned.
    pub async fn run(&self, snapshot: Arc<ConfigSnapshot>) -> Result<usize, EngineError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(EngineError::Closed);
        }
        if state.manager.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let (manager, planned) = self.plan(snapshot).await?;
        for watch in planned {
            self.start(&mut state, watch);
        }
        state.manager = Some(manager);

        let count = state.loops.len();
        info!(loops = count, "Engine started");
        Ok(count)
    }

    /// Apply a new snapshot. On failure the running loops are left untouched.
    pub async fn reload(
        &self,
        snapshot: Arc<ConfigSnapshot>,
    ) -> Result<ReloadSummary, EngineError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(EngineError::Closed);
        }

        let (manager, planned) = match self.plan(snapshot).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Reload failed, keeping current watches");
                return Err(e);
            }
        };

        let mut summary = ReloadSummary::default();
        let wanted: HashMap<&CursorKey, &WatchSpec> =
            planned.iter().map(|p| (&p.key, &p.spec)).collect();

        let stale: Vec<CursorKey> = state
            .loops
            .iter()
            .filter(|(key, running)| {
                wanted
                    .get(key)
                    .map_or(true, |spec| **spec != running.spec)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let mut stopping = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(running) = state.loops.remove(&key) {
                info!(key = %key, "Stopping watch");
                running.token.cancel();
                stopping.push(running.handle);
            }
        }
        summary.stopped = stopping.len();
        for handle in stopping {
            let _ = handle.await;
        }

        for watch in planned {
            if state.loops.contains_key(&watch.key) {
                summary.kept += 1;
            } else {
                self.start(&mut state, watch);
                summary.started += 1;
            }
        }
        state.manager = Some(manager);

        info!(
            started = summary.started,
            stopped = summary.stopped,
            kept = summary.kept,
            "Configuration reloaded"
        );
        Ok(summary)
    }

    /// Cancel every loop and wait for each to finish its current iteration.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        self.root.cancel();

        let loops: Vec<_> = state.loops.drain().collect();
        for (key, running) in loops {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                warn!(key = %key, error = %e, "Watch task ended abnormally");
            }
        }
        state.manager = None;
        info!("Engine closed");
    }

    /// Keys of the running loops, sorted.
    pub async fn watched(&self) -> Vec<CursorKey> {
        let state = self.state.lock().await;
        let mut keys: Vec<_> = state.loops.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn plan(
        &self,
        snapshot: Arc<ConfigSnapshot>,
    ) -> Result<(Manager, Vec<PlannedWatch>), EngineError> {
        let services = ServiceSettings::of(&snapshot);
        let mut manager = Manager::new(snapshot, &self.collaborators)?;
        manager.verify(&self.root).await?;

        let mut planned: Vec<PlannedWatch> = Vec::new();
        for runner in manager.runners()? {
            let watches = runner
                .discover_branches(&self.root)
                .await
                .map_err(|source| EngineError::Discovery {
                    repository: runner.repository().full_name(),
                    source,
                })?;

            for watch in watches {
                let key = runner.cursor_key(&watch.branch);
                if planned.iter().any(|p| p.key == key) {
                    warn!(key = %key, "Branch already watched by an earlier entry");
                    continue;
                }
                planned.push(PlannedWatch {
                    key,
                    spec: WatchSpec {
                        pipeline: watch.pipeline.clone(),
                        buffer_root: runner.buffer_root().to_path_buf(),
                        services: services.clone(),
                    },
                    runner: Arc::clone(&runner),
                    watch,
                });
            }
        }
        Ok((manager, planned))
    }

    fn start(&self, state: &mut EngineState, planned: PlannedWatch) {
        let token = self.root.child_token();
        let PlannedWatch {
            key,
            spec,
            runner,
            watch,
        } = planned;

        let loop_token = token.clone();
        let handle = tokio::spawn(async move { runner.watch_branch(watch, loop_token).await });
        state.loops.insert(key, RunningLoop { spec, token, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeProvider, RecordingBuilder};
    use crate::naming::SequentialNames;
    use crate::provider::Branch;
    use cursor_state::fakes::MemoryCursorStore;

    const CONFIG: &str = r#"
bufferDirectory: BUFFER
pollIntervalSecs: 3600
retry:
  attempts: 2
  initialTimeoutMs: 100
  backoffFactor: 1.0
repositories:
  - type: github
    owner: acme
    repo: widgets
    branchPipelines:
      - template: main
        dockerFilePath: DOCKERFILE
      - template: "feature/*"
        dockerFilePath: DOCKERFILE
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: String,
        provider: Arc<FakeProvider>,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();
        let config = CONFIG
            .replace("BUFFER", &dir.path().join("buffers").display().to_string())
            .replace("DOCKERFILE", &dockerfile.display().to_string());

        let provider = Arc::new(FakeProvider::new());
        provider.add_repository("acme", "widgets");
        provider.set_branch("acme", "widgets", Branch::new("main", "c1"));
        provider.set_branch("acme", "widgets", Branch::new("feature/login", "c2"));
        provider.set_branch("acme", "widgets", Branch::new("docs", "c3"));

        let collaborators = Collaborators::production(Arc::new(MemoryCursorStore::new()))
            .with_provider(provider.clone())
            .with_builder(Arc::new(RecordingBuilder::new()))
            .with_names(Arc::new(SequentialNames::new()));

        Fixture {
            _dir: dir,
            config,
            provider,
            engine: Engine::new(collaborators),
        }
    }

    fn snapshot(yaml: &str) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot::from_yaml_str(yaml).unwrap())
    }

    #[tokio::test]
    async fn run_starts_one_loop_per_matched_branch() {
        let fx = fixture();
        let count = fx.engine.run(snapshot(&fx.config)).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            fx.engine.watched().await,
            vec![
                CursorKey::new("acme", "widgets", "feature/login"),
                CursorKey::new("acme", "widgets", "main"),
            ]
        );
        assert!(matches!(
            fx.engine.run(snapshot(&fx.config)).await,
            Err(EngineError::AlreadyRunning)
        ));
        fx.engine.close().await;
        assert!(fx.engine.watched().await.is_empty());
    }

    #[tokio::test]
    async fn reload_diffs_watch_sets() {
        let fx = fixture();
        fx.engine.run(snapshot(&fx.config)).await.unwrap();

        // Same config, one new branch, one removed branch.
        fx.provider
            .set_branch("acme", "widgets", Branch::new("feature/signup", "c4"));
        fx.provider.remove_branch("acme", "widgets", "feature/login");
        let summary = fx.engine.reload(snapshot(&fx.config)).await.unwrap();
        assert_eq!(
            summary,
            ReloadSummary {
                started: 1,
                stopped: 1,
                kept: 1
            }
        );

        // Changing the main pipeline restarts only its loop.
        let changed = fx.config.replacen("template: main", "template: \"ma*\"", 1);
        let summary = fx.engine.reload(snapshot(&changed)).await.unwrap();
        assert_eq!(
            summary,
            ReloadSummary {
                started: 1,
                stopped: 1,
                kept: 1
            }
        );

        fx.engine.close().await;
    }

    #[tokio::test]
    async fn reload_restarts_loops_when_service_settings_change() {
        let fx = fixture();
        fx.engine.run(snapshot(&fx.config)).await.unwrap();

        let rotated = format!("git:\n  github:\n    token: rotated\n{}", fx.config);
        let summary = fx.engine.reload(snapshot(&rotated)).await.unwrap();
        assert_eq!(
            summary,
            ReloadSummary {
                started: 2,
                stopped: 2,
                kept: 0
            }
        );

        let slower = rotated.replace("pollIntervalSecs: 3600", "pollIntervalSecs: 7200");
        let summary = fx.engine.reload(snapshot(&slower)).await.unwrap();
        assert_eq!(summary.stopped, 2);

        let unchanged = fx.engine.reload(snapshot(&slower)).await.unwrap();
        assert_eq!(unchanged.kept, 2);
        assert_eq!(unchanged.started + unchanged.stopped, 0);

        fx.engine.close().await;
    }

    #[tokio::test]
    async fn failed_reload_keeps_running_loops() {
        let fx = fixture();
        fx.engine.run(snapshot(&fx.config)).await.unwrap();

        let unreachable = fx.config.replace("repo: widgets", "repo: missing");
        let err = fx.engine.reload(snapshot(&unreachable)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Manager(ManagerError::Unreachable(_))
        ));
        assert_eq!(fx.engine.watched().await.len(), 2);

        fx.engine.close().await;
    }

    #[tokio::test]
    async fn malformed_template_fails_startup() {
        let fx = fixture();
        let broken = fx.config.replace("\"feature/*\"", "\"feature/[\"");
        let err = fx.engine.run(snapshot(&broken)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Discovery {
                source: PipelineError::InvalidTemplate { .. },
                ..
            }
        ));
        assert!(fx.engine.watched().await.is_empty());
    }

    #[tokio::test]
    async fn closed_engine_rejects_reload() {
        let fx = fixture();
        fx.engine.close().await;
        assert!(matches!(
            fx.engine.reload(snapshot(&fx.config)).await,
            Err(EngineError::Closed)
        ));
    }
}
