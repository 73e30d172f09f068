//! Multi-environment runs through the async runner.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opticon_core::{
    CatalogStore, ChangeKind, EnvironmentSettings, Settings, YamlCatalog,
};
use opticon_runner::{run, EnvironmentFactory, Outcome, RunnerError};
use opticon_sync::{
    CommitAuthor, DirectorySource, Manifest, MetadataSource, RawRecord, ReconcileContext,
    SourceError, SyncError, VersionControlAdapter,
};
use tempfile::TempDir;

const T0: &str = "2024-03-01T10:00:00Z";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn timestamp(s: &str) -> DateTime<Utc> {
    s.parse().expect("timestamp")
}

/// Lay out a directory mirror with one ApexClass per `(id, name)`.
fn mirror(root: &Path, classes: &[(&str, &str)]) {
    let rows: Vec<RawRecord> = classes
        .iter()
        .map(|(id, name)| RawRecord {
            id: Some(id.to_string()),
            full_name: Some(name.to_string()),
            file_name: Some(format!("classes/{name}.cls")),
            object_type: Some("ApexClass".to_string()),
            last_modified_by_name: Some("Ada Lovelace".to_string()),
            last_modified_date: Some(timestamp(T0)),
            ..RawRecord::default()
        })
        .collect();
    let source = DirectorySource::new(root);
    let listing = source.listing_path("ApexClass");
    fs::create_dir_all(listing.parent().expect("parent")).expect("listings dir");
    fs::write(&listing, serde_json::to_string(&rows).expect("json")).expect("listing");
    for (_, name) in classes {
        let body = source.content_root().join(format!("classes/{name}.cls"));
        fs::create_dir_all(body.parent().expect("parent")).expect("src dir");
        fs::write(body, format!("class {name} {{}}")).expect("body");
    }
}

struct Workspace {
    home: TempDir,
    trees: TempDir,
    mirrors: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            home: TempDir::new().expect("home"),
            trees: TempDir::new().expect("trees"),
            mirrors: TempDir::new().expect("mirrors"),
        }
    }

    fn mirror_path(&self, env: &str) -> PathBuf {
        self.mirrors.path().join(env)
    }

    fn settings(&self, envs: &[&str]) -> Settings {
        Settings {
            metadata_types: vec!["ApexClass".to_string()],
            local_path: Some(self.trees.path().to_path_buf()),
            retrieve_timeout_secs: 5,
            retrieve_attempts: 3,
            environments: envs
                .iter()
                .map(|name| {
                    let mut env = EnvironmentSettings::new(*name);
                    env.source_path = Some(self.mirror_path(name));
                    env
                })
                .collect(),
            ..Settings::default()
        }
    }

    fn catalog_len(&self, env: &str) -> usize {
        YamlCatalog::open_at(self.home.path(), env.into())
            .expect("catalog")
            .list_by_environment()
            .expect("list")
            .len()
    }
}

// ---------------------------------------------------------------------------
// Test factory
// ---------------------------------------------------------------------------

/// Working tree on disk; commits and pushes are only counted.
struct CountingVcs {
    root: PathBuf,
    commits: Arc<AtomicUsize>,
    pushes: Arc<AtomicUsize>,
}

impl VersionControlAdapter for CountingVcs {
    fn working_tree_path(&self) -> &Path {
        &self.root
    }

    fn stage_all(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    fn commit(&mut self, _message: &str, _author: &CommitAuthor) -> Result<String, SyncError> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(format!("c{n:03}"))
    }

    fn push(&mut self) -> Result<(), SyncError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wraps the directory mirror with injectable failures.
struct FlakySource {
    inner: DirectorySource,
    unreachable: bool,
    failing_retrieves: Arc<AtomicUsize>,
    listing_delay: Option<Duration>,
}

impl MetadataSource for FlakySource {
    fn check_connection(&self) -> Result<(), SourceError> {
        if self.unreachable {
            return Err(SourceError::Connection("login refused".to_string()));
        }
        self.inner.check_connection()
    }

    fn list_type(&self, object_type: &str) -> Result<Vec<RawRecord>, SourceError> {
        if let Some(delay) = self.listing_delay {
            std::thread::sleep(delay);
        }
        self.inner.list_type(object_type)
    }

    fn retrieve(&self, manifest: &Manifest, extract_to: &Path) -> Result<(), SourceError> {
        let remaining = self.failing_retrieves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_retrieves.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Retrieve("503 Service Unavailable".to_string()));
        }
        self.inner.retrieve(manifest, extract_to)
    }
}

#[derive(Default)]
struct TestFactory {
    commits: Arc<AtomicUsize>,
    pushes: Arc<AtomicUsize>,
    failing_retrieves: Arc<AtomicUsize>,
    unreachable: bool,
    listing_delay: Option<Duration>,
}

impl EnvironmentFactory for TestFactory {
    fn source(&self, ctx: &ReconcileContext) -> Result<Box<dyn MetadataSource>, RunnerError> {
        let root = ctx
            .environment
            .source_path
            .clone()
            .ok_or_else(|| RunnerError::MissingSource {
                environment: ctx.name().clone(),
            })?;
        Ok(Box::new(FlakySource {
            inner: DirectorySource::new(root),
            unreachable: self.unreachable,
            failing_retrieves: Arc::clone(&self.failing_retrieves),
            listing_delay: self.listing_delay,
        }))
    }

    fn vcs(&self, ctx: &ReconcileContext) -> Result<Box<dyn VersionControlAdapter>, RunnerError> {
        Ok(Box::new(CountingVcs {
            root: ctx.working_tree_path(),
            commits: Arc::clone(&self.commits),
            pushes: Arc::clone(&self.pushes),
        }))
    }

    fn catalog(&self, ctx: &ReconcileContext) -> Result<Box<dyn CatalogStore>, RunnerError> {
        Ok(Box::new(YamlCatalog::open_at(&ctx.home, ctx.name().clone())?))
    }
}

fn not_cancelled() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn environments_run_concurrently_and_report_in_settings_order() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("production"), &[("1", "A"), ("2", "B")]);
    mirror(&ws.mirror_path("uat"), &[("7", "Z")]);
    let settings = Arc::new(ws.settings(&["production", "uat"]));
    let factory = Arc::new(TestFactory::default());

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::clone(&settings),
        factory.clone(),
        not_cancelled(),
    )
    .await
    .expect("run");

    let names: Vec<_> = summaries.iter().map(|s| s.environment.0.as_str()).collect();
    assert_eq!(names, ["production", "uat"]);
    assert!(summaries.iter().all(|s| s.outcome == Outcome::Applied));
    assert_eq!(summaries[0].counts.get(&ChangeKind::Addition), Some(&2));
    assert_eq!(summaries[1].applied, 1);
    assert!(summaries.iter().all(|s| s.pushed && s.attempts == 1));
    assert_eq!(factory.commits.load(Ordering::SeqCst), 3);
    assert_eq!(factory.pushes.load(Ordering::SeqCst), 2);

    assert!(ws.trees.path().join("production/classes/A.cls").exists());
    assert!(ws.trees.path().join("uat/classes/Z.cls").exists());
    assert_eq!(ws.catalog_len("production"), 2);
    assert_eq!(ws.catalog_len("uat"), 1);

    let again = run(ws.home.path().to_path_buf(), settings, factory.clone(), not_cancelled())
        .await
        .expect("second run");
    assert!(again.iter().all(|s| s.outcome == Outcome::NoDrift));
    assert_eq!(factory.commits.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_retrieve_failure_is_retried() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("production"), &[("1", "A")]);
    let factory = Arc::new(TestFactory::default());
    factory.failing_retrieves.store(1, Ordering::SeqCst);

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::new(ws.settings(&["production"])),
        factory.clone(),
        not_cancelled(),
    )
    .await
    .expect("run");

    let summary = &summaries[0];
    assert_eq!(summary.outcome, Outcome::Applied);
    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.applied, 1);
    assert_eq!(factory.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_fail_only_that_environment() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("production"), &[("1", "A")]);
    let mut settings = ws.settings(&["production"]);
    settings.retrieve_attempts = 2;
    let factory = Arc::new(TestFactory::default());
    factory.failing_retrieves.store(5, Ordering::SeqCst);

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::new(settings),
        factory.clone(),
        not_cancelled(),
    )
    .await
    .expect("run");

    let summary = &summaries[0];
    assert_eq!(summary.outcome, Outcome::Failed);
    assert_eq!(summary.attempts, 2);
    assert!(summary.error.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(factory.commits.load(Ordering::SeqCst), 0);
    assert_eq!(ws.catalog_len("production"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_failure_is_not_retried() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("production"), &[("1", "A")]);
    let factory = Arc::new(TestFactory {
        unreachable: true,
        ..TestFactory::default()
    });

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::new(ws.settings(&["production"])),
        factory,
        not_cancelled(),
    )
    .await
    .expect("run");

    let summary = &summaries[0];
    assert_eq!(summary.outcome, Outcome::Failed);
    assert_eq!(summary.attempts, 0);
    assert!(summary
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("login refused"));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_source_path_fails_without_touching_others() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("uat"), &[("7", "Z")]);
    let mut settings = ws.settings(&["production", "uat"]);
    settings.environments[0].source_path = None;

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::new(settings),
        Arc::new(TestFactory::default()),
        not_cancelled(),
    )
    .await
    .expect("run");

    assert_eq!(summaries[0].outcome, Outcome::Failed);
    assert_eq!(summaries[1].outcome, Outcome::Applied);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_before_replay_commits_nothing() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("production"), &[("1", "A")]);
    let factory = Arc::new(TestFactory::default());

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::new(ws.settings(&["production"])),
        factory.clone(),
        Arc::new(AtomicBool::new(true)),
    )
    .await
    .expect("run");

    let summary = &summaries[0];
    assert_eq!(summary.outcome, Outcome::Cancelled);
    assert_eq!(summary.applied, 0);
    assert!(!summary.pushed);
    assert_eq!(factory.commits.load(Ordering::SeqCst), 0);
    assert_eq!(ws.catalog_len("production"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_listing_times_out() {
    let ws = Workspace::new();
    mirror(&ws.mirror_path("production"), &[("1", "A")]);
    let mut settings = ws.settings(&["production"]);
    settings.retrieve_timeout_secs = 1;
    settings.retrieve_attempts = 1;
    let factory = Arc::new(TestFactory {
        listing_delay: Some(Duration::from_millis(1500)),
        ..TestFactory::default()
    });

    let summaries = run(
        ws.home.path().to_path_buf(),
        Arc::new(settings),
        factory.clone(),
        not_cancelled(),
    )
    .await
    .expect("run");

    let summary = &summaries[0];
    assert_eq!(summary.outcome, Outcome::Failed);
    assert_eq!(summary.attempts, 1);
    assert!(summary.error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(factory.commits.load(Ordering::SeqCst), 0);
}
