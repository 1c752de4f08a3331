//! Synchronization controller
//!
//! Exactly one cycle or administrative operation mutates the graph at a
//! time; both take the cycle lock. Per repository, the last synchronized
//! revision is stored on a repository node in the graph. Any failure while
//! synchronizing a repository replaces it with [`UNKNOWN_REVISION`], which
//! forces a full delta on the next cycle.

use super::state::{Backoff, SyncState};
use crate::derived::{DerivedManager, DerivedValue, DirtyDerivedTracker, EvaluatorRegistry, RecomputeReport};
use crate::error::{self, IndexError};
use crate::events::{ChangeListener, CompositeListener, GraphChange, SyncEvent};
use crate::graph::backend::{GraphBackend, GraphBackendExt};
use crate::graph::model::{edges, indexes, labels, props, Direction, NodeId, Properties};
use crate::index::{IndexEntity, IndexQuery};
use crate::instance::{InstanceRecord, RepositoryConfig};
use crate::model::{DerivedAttributeSpec, ElementTree, Metamodel, MetamodelRegistry};
use crate::parser::ParserRegistry;
use crate::repository::{ChangeItem, ChangeType, RepositoryManager};
use crate::updater::GraphUpdater;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Stored in place of a revision when a repository must be re-synchronized
/// from scratch.
pub const UNKNOWN_REVISION: &str = "_unknown";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Run each cycle inside one batch window instead of one transaction
    /// per artifact.
    pub batch_mode: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_mode: true,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(512_000),
        }
    }
}

/// What one cycle did to one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryReport {
    pub location: String,
    /// The repository reported a revision other than the stored one.
    pub changed: bool,
    /// The current revision was stored.
    pub synced: bool,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Artifacts whose metamodel is not registered.
    pub skipped: usize,
    /// Why the repository could not be synchronized at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub repositories: Vec<RepositoryReport>,
    pub proxies_resolved: usize,
    pub derived: RecomputeReport,
    /// Delay before the next scheduled cycle.
    pub next_delay: Duration,
}

impl CycleReport {
    /// Whether any repository changed or failed; either resets the backoff.
    pub fn changed(&self) -> bool {
        self.repositories.iter().any(|r| r.changed || !r.synced)
    }

    pub fn repository(&self, location: &str) -> Option<&RepositoryReport> {
        self.repositories.iter().find(|r| r.location == location)
    }

    pub fn failures(&self) -> usize {
        self.repositories
            .iter()
            .map(|r| r.failed + usize::from(r.error.is_some()))
            .sum()
    }
}

enum Fetched {
    Parsed(ElementTree),
    Unparsable(String),
    Unavailable(String),
}

struct Runner {
    stop: mpsc::Sender<()>,
    trigger: mpsc::Sender<()>,
}

pub struct SyncControllerBuilder {
    backend: Arc<dyn GraphBackend>,
    parsers: ParserRegistry,
    evaluators: EvaluatorRegistry,
    settings: SyncSettings,
    listeners: Vec<Arc<dyn ChangeListener>>,
    repositories: Vec<Arc<dyn RepositoryManager>>,
    instance_path: Option<PathBuf>,
}

impl SyncControllerBuilder {
    pub fn parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Listeners run after the dirty tracker, in the order added.
    pub fn listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn RepositoryManager>) -> Self {
        self.repositories.push(repository);
        self
    }

    /// Where to keep the instance record; without one nothing is persisted.
    pub fn instance_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.instance_path = Some(path.into());
        self
    }

    pub fn build(self) -> Arc<SyncController> {
        let listeners = Arc::new(CompositeListener::new());
        let tracker = Arc::new(DirtyDerivedTracker::new());
        listeners.add(tracker.clone());
        for listener in self.listeners {
            listeners.add(listener);
        }
        let (state, _) = watch::channel(SyncState::Stopped);

        Arc::new(SyncController {
            registry: MetamodelRegistry::new(self.backend.clone()),
            updater: GraphUpdater::new(self.backend.clone(), listeners.clone()),
            derived: DerivedManager::new(
                self.backend.clone(),
                listeners.clone(),
                tracker,
                self.evaluators,
            ),
            backend: self.backend,
            parsers: self.parsers,
            listeners,
            repositories: RwLock::new(self.repositories),
            backoff: parking_lot::Mutex::new(Backoff::new(
                self.settings.min_delay,
                self.settings.max_delay,
            )),
            settings: self.settings,
            state,
            cycle: Mutex::new(()),
            runner: parking_lot::Mutex::new(None),
            instance_path: self.instance_path,
        })
    }
}

pub struct SyncController {
    backend: Arc<dyn GraphBackend>,
    registry: MetamodelRegistry,
    updater: GraphUpdater,
    derived: DerivedManager,
    parsers: ParserRegistry,
    listeners: Arc<CompositeListener>,
    repositories: RwLock<Vec<Arc<dyn RepositoryManager>>>,
    settings: SyncSettings,
    backoff: parking_lot::Mutex<Backoff>,
    state: watch::Sender<SyncState>,
    cycle: Mutex<()>,
    runner: parking_lot::Mutex<Option<Runner>>,
    instance_path: Option<PathBuf>,
}

impl SyncController {
    pub fn builder(backend: Arc<dyn GraphBackend>) -> SyncControllerBuilder {
        SyncControllerBuilder {
            backend,
            parsers: ParserRegistry::with_defaults(),
            evaluators: EvaluatorRegistry::default(),
            settings: SyncSettings::default(),
            listeners: Vec::new(),
            repositories: Vec::new(),
            instance_path: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    pub fn updater(&self) -> &GraphUpdater {
        &self.updater
    }

    pub fn registry(&self) -> &MetamodelRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn current_state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Delay the scheduler waits before the next cycle.
    pub fn poll_delay(&self) -> Duration {
        self.backoff.lock().current()
    }

    fn set_state(&self, to: SyncState) {
        let from = self.state.send_replace(to);
        if from != to {
            self.listeners
                .sync_event(&SyncEvent::StateChanged { from, to });
        }
    }

    /// Block until the controller reaches `state`. Returns `false` on
    /// timeout.
    pub async fn wait_for(&self, state: SyncState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        );
        reached
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Spawn the polling loop. The first cycle runs right away. Returns
    /// `false` if the loop is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        {
            let mut runner = self.runner.lock();
            if runner.is_some() {
                return false;
            }
            let _ = trigger_tx.try_send(());
            *runner = Some(Runner {
                stop: stop_tx,
                trigger: trigger_tx,
            });
        }
        self.set_state(SyncState::Running);

        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = controller.poll_delay();
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                    Some(()) = trigger_rx.recv() => debug!("Immediate synchronization requested"),
                }
                if let Err(e) = controller.run_cycle().await {
                    error!("Synchronization cycle failed: {:#}", e);
                }
            }
            controller.set_state(SyncState::Stopped);
            info!("Synchronization controller stopped");
        });
        info!(
            min_delay_ms = self.settings.min_delay.as_millis() as u64,
            max_delay_ms = self.settings.max_delay.as_millis() as u64,
            "Synchronization controller started"
        );
        true
    }

    /// Ask the polling loop to stop after the current cycle.
    pub async fn stop(&self) -> bool {
        let runner = self.runner.lock().take();
        match runner {
            Some(runner) => {
                let _ = runner.stop.send(()).await;
                true
            }
            None => false,
        }
    }

    /// Queue a cycle without waiting for the poll delay. A cycle already
    /// queued absorbs the request. Returns `false` when the loop is not
    /// running.
    pub fn request_immediate_sync(&self) -> bool {
        let trigger = self.runner.lock().as_ref().map(|r| r.trigger.clone());
        match trigger {
            Some(trigger) => !matches!(
                trigger.try_send(()),
                Err(mpsc::error::TrySendError::Closed(_))
            ),
            None => false,
        }
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Run one synchronization cycle over every repository.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;
        let resume = match self.current_state() {
            SyncState::Stopped => SyncState::Stopped,
            _ => SyncState::Running,
        };
        self.set_state(SyncState::Updating);
        self.listeners.sync_event(&SyncEvent::SyncStart);

        let result = self.synchronize().await;

        self.listeners.sync_event(&SyncEvent::SyncEnd);
        self.set_state(resume);
        result
    }

    async fn synchronize(&self) -> Result<CycleReport> {
        self.updater.clear_type_cache();
        let batch = self.settings.batch_mode;
        if batch {
            self.backend
                .enter_batch_mode()
                .await
                .context("Failed to enter batch mode")?;
        }

        let repositories = self.repositories.read().await.clone();
        let mut report = CycleReport::default();
        let mut staged: Vec<(&dyn RepositoryManager, String)> = Vec::new();
        for repository in &repositories {
            let (repository_report, revision) = self.sync_repository(repository.as_ref(), batch).await;
            if let Some(revision) = revision {
                staged.push((repository.as_ref(), revision));
            }
            report.repositories.push(repository_report);
        }

        let finished = self.in_write_context(batch, self.finish(&staged)).await;
        if let Err(e) = &finished {
            warn!("Cycle finalization failed: {:#}", e);
            for (repository, _) in &staged {
                self.unsync(*repository, batch).await;
            }
        }
        let exited = if batch {
            self.backend
                .exit_batch_mode()
                .await
                .context("Failed to exit batch mode")
        } else {
            Ok(())
        };
        let flushed = self.backend.flush().await;

        report.next_delay = {
            let mut backoff = self.backoff.lock();
            if report.changed() || finished.is_err() {
                backoff.on_change()
            } else {
                backoff.on_no_change()
            }
        };
        let (resolved, derived) = finished?;
        exited?;
        flushed?;
        report.proxies_resolved = resolved;
        report.derived = derived;
        debug!(
            repositories = report.repositories.len(),
            failures = report.failures(),
            next_delay_ms = report.next_delay.as_millis() as u64,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Resolve proxies, recompute derived values, then record the revisions
    /// of the repositories that synchronized cleanly.
    async fn finish(&self, staged: &[(&dyn RepositoryManager, String)]) -> Result<(usize, RecomputeReport)> {
        let resolved = self.updater.resolve_proxies().await?;
        let derived = self.derived.run().await?;
        for (repository, revision) in staged {
            self.store_revision(*repository, revision).await?;
        }
        Ok((resolved, derived))
    }

    /// Reset a repository to [`UNKNOWN_REVISION`] so its next sync starts
    /// from a full delta.
    async fn unsync(&self, repository: &dyn RepositoryManager, batch: bool) {
        if let Err(e) = self
            .in_write_context(batch, self.store_revision(repository, UNKNOWN_REVISION))
            .await
        {
            error!(repository = %repository.location(), "Failed to reset revision: {:#}", e);
        }
    }

    /// Synchronize one repository. Returns its report and, when every
    /// artifact went through, the revision to record once the cycle's
    /// proxy resolution and recompute succeed.
    async fn sync_repository(
        &self,
        repository: &dyn RepositoryManager,
        batch: bool,
    ) -> (RepositoryReport, Option<String>) {
        let location = repository.location().to_string();
        let mut report = RepositoryReport {
            location: location.clone(),
            ..Default::default()
        };
        match self.sync_repository_inner(repository, batch, &mut report).await {
            Ok(revision) => (report, revision),
            Err(e) => {
                warn!(repository = %location, "Repository synchronization failed: {:#}", e);
                report.error = Some(format!("{:#}", e));
                report.synced = false;
                self.unsync(repository, batch).await;
                (report, None)
            }
        }
    }

    async fn sync_repository_inner(
        &self,
        repository: &dyn RepositoryManager,
        batch: bool,
        report: &mut RepositoryReport,
    ) -> Result<Option<String>> {
        let location = repository.location();
        let unreachable = |e: anyhow::Error| IndexError::RepositoryUnreachable {
            location: location.to_string(),
            reason: format!("{:#}", e),
        };

        let stored = self.stored_revision(location).await?;
        let current = repository.current_revision().await.map_err(unreachable)?;
        if stored.as_deref() == Some(current.as_str()) {
            report.synced = true;
            return Ok(None);
        }
        report.changed = true;

        let delta = repository
            .delta(stored.as_deref())
            .await
            .map_err(unreachable)?;
        let mut deletions = Vec::new();
        let mut upserts: Vec<ChangeItem> = Vec::new();
        for item in delta.items {
            if !self.parsers.can_parse(&item.path) {
                continue;
            }
            match item.change {
                ChangeType::Deleted => deletions.push(item.path),
                ChangeType::Added | ChangeType::Updated => upserts.push(item),
            }
        }

        if delta.full {
            let listed: HashMap<String, String> = upserts
                .iter()
                .map(|i| (i.path.clone(), i.revision.clone()))
                .collect();
            let mut unchanged = HashSet::new();
            for (path, file) in self.updater.indexed_files(location).await? {
                match listed.get(&path) {
                    None => deletions.push(path),
                    Some(revision) => {
                        if self.updater.file_revision(file).await?.as_ref() == Some(revision) {
                            unchanged.insert(path);
                        }
                    }
                }
            }
            upserts.retain(|i| !unchanged.contains(&i.path));
        }

        self.listeners.sync_event(&SyncEvent::Progress {
            message: format!(
                "{}: {} artifacts to update, {} to delete",
                location,
                upserts.len(),
                deletions.len()
            ),
        });

        for path in &deletions {
            self.change_start(location, path);
            match self
                .in_write_context(batch, self.updater.delete_path(location, path))
                .await
            {
                Ok(removed) => {
                    report.deleted += usize::from(removed);
                    self.change_success(location, path);
                }
                Err(e) => {
                    report.failed += 1;
                    self.change_failure(location, path, format!("{:#}", e));
                }
            }
        }

        let fetched = futures::future::join_all(
            upserts
                .iter()
                .map(|item| self.fetch(repository, &current, &item.path)),
        )
        .await;

        for (item, fetched) in upserts.iter().zip(fetched) {
            let path = item.path.as_str();
            self.change_start(location, path);
            match fetched {
                Fetched::Parsed(tree) => {
                    let outcome = self
                        .in_write_context(
                            batch,
                            self.updater
                                .update_file(location, path, &item.revision, Some(&tree)),
                        )
                        .await;
                    match outcome {
                        Ok(_) => {
                            report.updated += 1;
                            self.change_success(location, path);
                        }
                        Err(e) => {
                            let classified = error::classify(&e);
                            let fatal = classified.is_some_and(IndexError::is_fatal_for_artifact);
                            let broken = matches!(classified, Some(IndexError::ParseFailure { .. }));
                            self.change_failure(location, path, format!("{:#}", e));
                            if fatal {
                                report.skipped += 1;
                                continue;
                            }
                            report.failed += 1;
                            if batch || broken {
                                self.discard(location, path, batch).await;
                            }
                        }
                    }
                }
                Fetched::Unparsable(reason) => {
                    report.failed += 1;
                    self.change_failure(location, path, reason);
                    self.discard(location, path, batch).await;
                }
                Fetched::Unavailable(reason) => {
                    report.failed += 1;
                    self.change_failure(location, path, reason);
                }
            }
        }

        report.synced = report.failed == 0;
        let staged = if report.synced {
            Some(current)
        } else {
            self.in_write_context(batch, self.store_revision(repository, UNKNOWN_REVISION))
                .await?;
            None
        };
        info!(
            repository = %location,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            skipped = report.skipped,
            "Repository synchronized"
        );
        Ok(staged)
    }

    async fn fetch(&self, repository: &dyn RepositoryManager, revision: &str, path: &str) -> Fetched {
        let artifact = match repository.import_file(revision, path).await {
            Ok(artifact) => artifact,
            Err(e) => return Fetched::Unavailable(format!("{:#}", e)),
        };
        let Some(parser) = self.parsers.parser_for(path) else {
            return Fetched::Unavailable(format!("no parser claims {}", path));
        };
        match tokio::task::spawn_blocking(move || parser.parse(&artifact)).await {
            Ok(Ok(tree)) => Fetched::Parsed(tree),
            Ok(Err(e)) => Fetched::Unparsable(format!("{:#}", e)),
            Err(e) => Fetched::Unparsable(format!("parser task failed: {}", e)),
        }
    }

    /// Remove what is left of a failed artifact.
    async fn discard(&self, location: &str, path: &str, batch: bool) {
        if let Err(e) = self
            .in_write_context(batch, self.updater.update_file(location, path, "", None))
            .await
        {
            warn!(repository = %location, path = %path, "Failed to discard artifact: {:#}", e);
        }
    }

    fn change_start(&self, repository: &str, path: &str) {
        self.listeners.sync_event(&SyncEvent::ChangeStart {
            repository: repository.to_string(),
            path: path.to_string(),
        });
    }

    fn change_success(&self, repository: &str, path: &str) {
        self.listeners.sync_event(&SyncEvent::ChangeSuccess {
            repository: repository.to_string(),
            path: path.to_string(),
        });
    }

    fn change_failure(&self, repository: &str, path: &str, reason: String) {
        self.listeners.sync_event(&SyncEvent::ChangeFailure {
            repository: repository.to_string(),
            path: path.to_string(),
            reason,
        });
    }

    /// Run `work` in the cycle's batch window, or in a transaction of its
    /// own.
    async fn in_write_context<T>(&self, batch: bool, work: impl Future<Output = Result<T>>) -> Result<T> {
        if batch {
            work.await
        } else {
            self.transactional(work).await
        }
    }

    async fn transactional<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        self.backend.begin_transaction().await?;
        match work.await {
            Ok(value) => {
                self.backend.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.backend.rollback().await {
                    error!("Rollback failed: {:#}", rollback);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Stored revisions
    // ========================================================================

    async fn repository_node(&self, location: &str) -> Result<Option<NodeId>> {
        self.backend
            .index_lookup(indexes::REPOSITORIES, indexes::LOCATION_FIELD, location)
            .await
    }

    /// Revision stored for a repository, [`UNKNOWN_REVISION`] included.
    pub async fn repository_revision(&self, location: &str) -> Result<Option<String>> {
        match self.repository_node(location).await? {
            Some(node) => self.backend.string_property(node, props::REVISION).await,
            None => Ok(None),
        }
    }

    async fn stored_revision(&self, location: &str) -> Result<Option<String>> {
        Ok(self
            .repository_revision(location)
            .await?
            .filter(|r| r != UNKNOWN_REVISION))
    }

    async fn store_revision(&self, repository: &dyn RepositoryManager, revision: &str) -> Result<()> {
        let location = repository.location();
        let node = match self.repository_node(location).await? {
            Some(node) => node,
            None => {
                let mut properties = Properties::new();
                properties.insert(props::LOCATION.into(), location.into());
                properties.insert(props::KIND.into(), repository.kind().into());
                let node = self
                    .backend
                    .create_node(labels::REPOSITORY, properties)
                    .await?;
                self.backend
                    .index_add(
                        indexes::REPOSITORIES,
                        node.into(),
                        indexes::LOCATION_FIELD,
                        location.into(),
                    )
                    .await?;
                node
            }
        };
        self.backend
            .set_property(node, props::REVISION, revision.into())
            .await
    }

    /// Force a full delta for every repository on the next cycle.
    async fn forget_revisions(&self) -> Result<()> {
        for node in self
            .backend
            .index_nodes(indexes::REPOSITORIES, indexes::LOCATION_FIELD, &IndexQuery::all())
            .await?
        {
            self.backend
                .set_property(node, props::REVISION, UNKNOWN_REVISION.into())
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Repositories
    // ========================================================================

    pub async fn repositories(&self) -> Vec<Arc<dyn RepositoryManager>> {
        self.repositories.read().await.clone()
    }

    /// Start monitoring a repository. Returns `false` if its location is
    /// already monitored.
    pub async fn add_repository(&self, repository: Arc<dyn RepositoryManager>) -> Result<bool> {
        {
            let mut repositories = self.repositories.write().await;
            if repositories
                .iter()
                .any(|r| r.location() == repository.location())
            {
                return Ok(false);
            }
            info!(repository = %repository.location(), kind = repository.kind(), "Repository added");
            repositories.push(repository);
        }
        self.persist_instance().await?;
        self.request_immediate_sync();
        Ok(true)
    }

    /// Stop monitoring a repository and delete everything indexed from it.
    pub async fn remove_repository(&self, location: &str) -> Result<bool> {
        let _cycle = self.cycle.lock().await;
        if !self
            .repositories
            .read()
            .await
            .iter()
            .any(|r| r.location() == location)
        {
            return Ok(false);
        }
        self.transactional(self.purge_repository(location)).await?;
        self.repositories
            .write()
            .await
            .retain(|r| r.location() != location);
        self.persist_instance().await?;
        info!(repository = %location, "Repository removed");
        Ok(true)
    }

    async fn purge_repository(&self, location: &str) -> Result<()> {
        for (_, file) in self.updater.indexed_files(location).await? {
            self.updater.delete_file(file).await?;
        }
        if let Some(node) = self.repository_node(location).await? {
            if !self.backend.delete_node(node).await? {
                bail!(IndexError::StorageInconsistency(format!(
                    "repository node for {} still has edges",
                    location
                )));
            }
        }
        Ok(())
    }

    /// Snapshot of what the instance record should hold.
    pub async fn instance_record(&self) -> InstanceRecord {
        InstanceRecord {
            backend: self.backend.backend_type().to_string(),
            repositories: self
                .repositories
                .read()
                .await
                .iter()
                .map(|r| RepositoryConfig {
                    location: r.location().to_string(),
                    kind: r.kind().to_string(),
                })
                .collect(),
            min_delay_ms: self.settings.min_delay.as_millis() as u64,
            max_delay_ms: self.settings.max_delay.as_millis() as u64,
        }
    }

    async fn persist_instance(&self) -> Result<()> {
        let Some(path) = &self.instance_path else {
            return Ok(());
        };
        self.instance_record().await.save(path)
    }

    // ========================================================================
    // Type system
    // ========================================================================

    /// Register metamodels. Artifacts skipped for lack of a metamodel are
    /// retried on the next cycle. Returns the URIs added.
    pub async fn register_metamodels(&self, metamodels: &[Metamodel]) -> Result<Vec<String>> {
        let _cycle = self.cycle.lock().await;
        let added = self.transactional(self.register_inner(metamodels)).await?;
        self.updater.clear_type_cache();
        if !added.is_empty() {
            self.request_immediate_sync();
        }
        Ok(added)
    }

    async fn register_inner(&self, metamodels: &[Metamodel]) -> Result<Vec<String>> {
        let added = self.registry.register(metamodels).await?;
        for uri in &added {
            self.listeners
                .notify(&GraphChange::MetamodelAdded { uri: uri.clone() })?;
        }
        if !added.is_empty() {
            self.forget_revisions().await?;
        }
        Ok(added)
    }

    /// Unregister metamodels together with every metamodel depending on
    /// them. Artifacts holding their instances are deleted. Returns the URIs
    /// removed.
    pub async fn unregister_metamodels(&self, uris: &[String]) -> Result<Vec<String>> {
        let _cycle = self.cycle.lock().await;
        let removed = self.transactional(self.unregister_inner(uris)).await?;
        self.updater.clear_type_cache();
        Ok(removed)
    }

    async fn unregister_inner(&self, uris: &[String]) -> Result<Vec<String>> {
        let closure = self.registry.dependents_closure(uris).await?;
        let mut files = BTreeSet::new();
        for uri in &closure {
            for type_node in self.registry.type_nodes(uri).await? {
                for element in self.registry.instances(type_node).await? {
                    for edge in self
                        .backend
                        .edges(element, Direction::Outgoing, Some(edges::FILE))
                        .await?
                    {
                        files.insert(edge.end);
                    }
                }
            }
        }
        for file in files {
            self.updater.delete_file(file).await?;
        }
        for uri in &closure {
            self.registry.remove(uri).await?;
            self.listeners
                .notify(&GraphChange::MetamodelRemoved { uri: uri.clone() })?;
        }
        if !closure.is_empty() {
            self.forget_revisions().await?;
        }
        Ok(closure)
    }

    async fn resolve_types(&self, metamodel: &str, type_name: &str) -> Result<Vec<NodeId>> {
        if self.registry.type_node(metamodel, type_name).await?.is_none() {
            if !self.registry.is_registered(metamodel).await? {
                bail!(IndexError::MetamodelNotRegistered {
                    uri: metamodel.to_string()
                });
            }
            bail!(IndexError::StorageInconsistency(format!(
                "type {} not found in {}",
                type_name, metamodel
            )));
        }
        self.registry.with_subtypes(metamodel, type_name).await
    }

    /// Maintain a per-type index of `attribute` on the type and its
    /// subtypes, filled from existing instances. Returns the number of
    /// values indexed.
    pub async fn add_indexed_attribute(
        &self,
        metamodel: &str,
        type_name: &str,
        attribute: &str,
    ) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let indexed = self
            .transactional(self.index_attribute(metamodel, type_name, attribute))
            .await?;
        self.updater.clear_type_cache();
        Ok(indexed)
    }

    async fn index_attribute(&self, metamodel: &str, type_name: &str, attribute: &str) -> Result<usize> {
        let mut indexed = 0;
        for type_node in self.resolve_types(metamodel, type_name).await? {
            let mut attributes = self.registry.indexed_attributes(type_node).await?;
            if !attributes.insert(attribute.to_string()) {
                continue;
            }
            self.registry
                .set_indexed_attributes(type_node, &attributes)
                .await?;
            let name = self
                .backend
                .string_property(type_node, props::NAME)
                .await?
                .unwrap_or_default();
            let index = indexes::attribute_index(metamodel, &name, attribute);
            for element in self.registry.instances(type_node).await? {
                if let Some(value) = self.backend.get_property(element, attribute).await? {
                    self.backend
                        .index_add(&index, element.into(), attribute, value)
                        .await?;
                    indexed += 1;
                }
            }
        }
        Ok(indexed)
    }

    /// Drop the per-type indexes of `attribute`. Returns whether any type
    /// had it indexed.
    pub async fn remove_indexed_attribute(
        &self,
        metamodel: &str,
        type_name: &str,
        attribute: &str,
    ) -> Result<bool> {
        let _cycle = self.cycle.lock().await;
        let removed = self
            .transactional(self.unindex_attribute(metamodel, type_name, attribute))
            .await?;
        self.updater.clear_type_cache();
        Ok(removed)
    }

    async fn unindex_attribute(&self, metamodel: &str, type_name: &str, attribute: &str) -> Result<bool> {
        let mut removed = false;
        for type_node in self.resolve_types(metamodel, type_name).await? {
            let mut attributes = self.registry.indexed_attributes(type_node).await?;
            if !attributes.remove(attribute) {
                continue;
            }
            self.registry
                .set_indexed_attributes(type_node, &attributes)
                .await?;
            let name = self
                .backend
                .string_property(type_node, props::NAME)
                .await?
                .unwrap_or_default();
            self.backend
                .drop_index(&indexes::attribute_index(metamodel, &name, attribute))
                .await?;
            removed = true;
        }
        Ok(removed)
    }

    /// Declare a derived attribute and compute it for existing instances.
    /// Returns the number of instances it was attached to.
    pub async fn add_derived_attribute(&self, spec: &DerivedAttributeSpec) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let attached = self.transactional(self.attach_derived(spec)).await?;
        self.updater.clear_type_cache();
        Ok(attached)
    }

    async fn attach_derived(&self, spec: &DerivedAttributeSpec) -> Result<usize> {
        let attached = self.derived.add_derived_attribute(spec).await?;
        self.derived.recompute(BTreeSet::new()).await?;
        Ok(attached)
    }

    pub async fn remove_derived_attribute(&self, spec: &DerivedAttributeSpec) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let removed = self
            .transactional(self.derived.remove_derived_attribute(spec))
            .await?;
        self.updater.clear_type_cache();
        Ok(removed)
    }

    pub async fn derived_value(&self, element: NodeId, attribute: &str) -> Result<Option<DerivedValue>> {
        self.derived.value(element, attribute).await
    }

    // ========================================================================
    // Queries and listeners
    // ========================================================================

    pub async fn query(&self, index: &str, key: &str, query: &IndexQuery) -> Result<Vec<IndexEntity>> {
        self.backend.index_query(index, key, query).await
    }

    pub async fn query_nodes(&self, index: &str, key: &str, query: &IndexQuery) -> Result<Vec<NodeId>> {
        self.backend.index_nodes(index, key, query).await
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> Uuid {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: Uuid) -> bool {
        self.listeners.remove(id)
    }
}
