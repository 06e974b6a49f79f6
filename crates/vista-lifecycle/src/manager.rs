//! The lifecycle manager.
//!
//! One explicit service instance per process, constructed with its storage,
//! query executor and configuration. It resolves cache keys to artifacts,
//! applies the staleness policy, runs single-flight builds in background
//! tasks and answers reads through the query coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vista_build::{BuildMode, BuildRequest, Dispatcher};
use vista_core::clock::{Clock, SystemClock};
use vista_core::config::VistaConfig;
use vista_core::definition::{ArtifactDefinition, Consumer};
use vista_core::executor::QueryExecutor;
use vista_core::fingerprint::Fingerprint;
use vista_core::generation::GenerationManifest;
use vista_core::id::ArtifactId;
use vista_core::lock::{DistributedLock, LockGuard};
use vista_core::observability::lifecycle_span;
use vista_core::paths::ArtifactPaths;
use vista_core::plan::QueryPlan;
use vista_core::signal::{ClusterEvent, ClusterSignal, NoopSignal};
use vista_core::storage::StorageBackend;
use vista_query::{QueryCoordinator, QueryError, QueryResult};

use crate::cache::DefinitionCache;
use crate::definition_store::{DefinitionStore, StorageDefinitionStore};
use crate::error::{LifecycleError, Result};
use crate::freshness::{CallMode, Freshness, FreshnessPolicy, ServeAction};
use crate::identity::{BuildKey, CacheKey, MatchRank, Requestor};
use crate::pending::{Admission, BuildHandle, BuildStatus, PendingRegistry};
use crate::registry::Registry;
use crate::sharing::{ShareStep, final_survivor, plan_shares};

/// A resolved artifact.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    /// Resolved artifact.
    pub artifact: ArtifactId,
    /// Key it was resolved for.
    pub key: CacheKey,
    /// Registration that matched.
    pub registration: Consumer,
    /// How the registration matched the requestor.
    pub rank: MatchRank,
    /// Definition at resolve time.
    pub definition: Arc<ArtifactDefinition>,
}

/// Per-request context, passed explicitly with every call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Identity the request runs as.
    pub requestor: Requestor,
    /// Whether a first build is awaited.
    pub mode: CallMode,
    /// Serve an expired generation while it is rebuilt.
    pub allow_interim: bool,
    /// Cancels the read (not the builds it triggers).
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// A blocking request without interim answers.
    #[must_use]
    pub fn new(requestor: Requestor) -> Self {
        Self {
            requestor,
            mode: CallMode::Blocking,
            allow_interim: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns a building signal instead of waiting for a first build.
    #[must_use]
    pub fn non_blocking(mut self) -> Self {
        self.mode = CallMode::NonBlocking;
        self
    }

    /// Allows answers from an expired generation.
    #[must_use]
    pub fn with_interim(mut self) -> Self {
        self.allow_interim = true;
        self
    }

    /// Uses `cancel` for the read.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Answer to [`LifecycleManager::serve`].
#[derive(Debug)]
pub enum ServeOutcome {
    /// The read was answered.
    Answered {
        /// Query result.
        result: QueryResult,
        /// Age class of the generation that answered.
        freshness: Freshness,
        /// Background refresh started for a stale or expired artifact.
        refresh: Option<BuildHandle>,
        /// The answer came from an expired generation.
        interim: bool,
    },
    /// No generation exists yet; a build is running.
    Building(BuildHandle),
}

/// Result of registering a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Artifact the consumer is bound to.
    pub artifact: ArtifactId,
    /// The candidate definition was stored as a new artifact.
    pub created: bool,
    /// Artifacts the new artifact absorbed.
    pub absorbed: Vec<ArtifactId>,
    /// Existing artifact the candidate was shared into.
    pub shared_into: Option<ArtifactId>,
}

/// Resolves, builds, shares and serves artifacts.
#[derive(Clone)]
pub struct LifecycleManager {
    storage: Arc<dyn StorageBackend>,
    store: Arc<dyn DefinitionStore>,
    registry: Arc<Registry>,
    cache: Arc<DefinitionCache>,
    pending: Arc<PendingRegistry>,
    dispatcher: Dispatcher,
    coordinator: QueryCoordinator,
    signal: Arc<dyn ClusterSignal>,
    clock: Arc<dyn Clock>,
    policy: FreshnessPolicy,
    lock_ttl: Duration,
    lock_attempts: u32,
    registrations: Arc<Mutex<()>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("pending", &self.pending)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager storing definitions next to the artifacts in
    /// `storage`. Call [`LifecycleManager::load`] to pick up artifacts that
    /// already exist.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        executor: Arc<dyn QueryExecutor>,
        config: &VistaConfig,
    ) -> Self {
        let cache = DefinitionCache::new(config.lifecycle.definition_cache_capacity)
            .with_eviction_listener(Arc::new(|artifact| {
                vista_core::metrics::record_definition_evicted();
                tracing::trace!(%artifact, "definition reloads on next access");
            }));
        let dispatcher = Dispatcher::new(Arc::clone(&storage), executor, config);
        let coordinator = QueryCoordinator::new(Arc::clone(&storage), &config.query)
            .with_codec(dispatcher.codec());
        Self {
            store: Arc::new(StorageDefinitionStore::new(Arc::clone(&storage))),
            storage,
            registry: Arc::new(Registry::new()),
            cache: Arc::new(cache),
            pending: Arc::new(PendingRegistry::new()),
            dispatcher,
            coordinator,
            signal: Arc::new(NoopSignal),
            clock: Arc::new(SystemClock),
            policy: FreshnessPolicy::from_config(&config.lifecycle),
            lock_ttl: config.build.lock_ttl(),
            lock_attempts: config.build.lock_max_retries,
            registrations: Arc::new(Mutex::new(())),
        }
    }

    /// Reads and writes definitions through `store`.
    #[must_use]
    pub fn with_definition_store(mut self, store: Arc<dyn DefinitionStore>) -> Self {
        self.store = store;
        self
    }

    /// Announces publishes and deletions through `signal`.
    #[must_use]
    pub fn with_signal(mut self, signal: Arc<dyn ClusterSignal>) -> Self {
        self.dispatcher = self.dispatcher.with_signal(Arc::clone(&signal));
        self.signal = signal;
        self
    }

    /// Reads time from `clock`, for staleness and builds.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.dispatcher = self.dispatcher.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Uses `policy` instead of the configured thresholds.
    #[must_use]
    pub fn with_policy(mut self, policy: FreshnessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Registers every stored artifact. Returns how many were loaded.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn load(&self) -> Result<usize> {
        let mut loaded = 0;
        for artifact in self.store.list().await? {
            if let Some(definition) = self.cache.get(self.store.as_ref(), artifact).await? {
                self.registry.upsert(&definition)?;
                loaded += 1;
            }
        }
        tracing::info!(loaded, "artifact registry loaded");
        Ok(loaded)
    }

    /// Number of builds in flight.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the pending registry lock is poisoned.
    pub fn pending_builds(&self) -> Result<usize> {
        Ok(self.pending.len()?)
    }

    /// Resolves `key` for `requestor` to the artifact serving it.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn resolve(
        &self,
        key: &CacheKey,
        requestor: &Requestor,
    ) -> Result<Option<ArtifactHandle>> {
        loop {
            let Some(found) = self.registry.resolve(key, requestor)? else {
                return Ok(None);
            };
            match self.cache.get(self.store.as_ref(), found.artifact).await? {
                None => {
                    tracing::debug!(artifact = %found.artifact, "registered artifact is gone");
                    self.registry.remove(found.artifact)?;
                }
                Some(definition) if definition.consumers().contains(&found.registration) => {
                    return Ok(Some(ArtifactHandle {
                        artifact: found.artifact,
                        key: key.clone(),
                        registration: found.registration,
                        rank: found.rank,
                        definition,
                    }));
                }
                // registrations moved on another node
                Some(definition) => self.registry.upsert(&definition)?,
            }
        }
    }

    /// Starts a build of the artifact serving `key`, or joins the one already
    /// running for this artifact and requestor.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] if nothing is registered for
    /// `key`.
    pub async fn build_now(&self, key: &CacheKey, requestor: &Requestor) -> Result<BuildHandle> {
        let handle = self
            .resolve(key, requestor)
            .await?
            .ok_or_else(|| not_found(key))?;
        self.start_build(&handle, requestor)
    }

    /// Requests cancellation of a build. The build stops at its next
    /// checkpoint and the published generation stays unchanged.
    pub fn cancel(&self, build: &BuildHandle) {
        tracing::info!(key = %build.key(), "build cancellation requested");
        build.cancel();
    }

    /// Reads the current generation of a resolved artifact.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NeedsRebuild`] when the published generation
    /// lacks a column the stored definition declares,
    /// [`LifecycleError::UndeclaredColumn`] when the definition does not
    /// declare it either, and query errors otherwise.
    pub async fn query(
        &self,
        handle: &ArtifactHandle,
        plan: QueryPlan,
        cancel: CancellationToken,
    ) -> Result<QueryResult> {
        let generation = match GenerationManifest::load(self.storage.as_ref(), handle.artifact)
            .await?
        {
            Some(generation) => generation,
            None => GenerationManifest::empty(
                handle.definition.as_ref().clone(),
                self.dispatcher.codec().name(),
            ),
        };
        self.coordinator
            .execute(&generation, plan, cancel)
            .await
            .map_err(|e| match e {
                // Only a stored definition that declares the column can be
                // rebuilt into a generation that has it.
                QueryError::ColumnMissing { artifact, column }
                    if handle.definition.column(&column).is_some() =>
                {
                    LifecycleError::NeedsRebuild { artifact, column }
                }
                QueryError::ColumnMissing { artifact, column } => {
                    LifecycleError::UndeclaredColumn { artifact, column }
                }
                other => other.into(),
            })
    }

    /// Registers `consumer` for `definition`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed definition, and store or lock
    /// errors.
    pub async fn register(
        &self,
        definition: ArtifactDefinition,
        consumer: Consumer,
    ) -> Result<RegisterOutcome> {
        let mut outcomes = self.register_batch(vec![(definition, consumer)]).await?;
        outcomes
            .pop()
            .ok_or_else(|| vista_core::Error::internal("registration produced no outcome").into())
    }

    /// Registers several candidates in one sharing pass. Candidates are
    /// compared with each other and with registered artifacts; outcomes are
    /// returned in input order.
    ///
    /// # Errors
    ///
    /// See [`LifecycleManager::register`].
    pub async fn register_batch(
        &self,
        candidates: Vec<(ArtifactDefinition, Consumer)>,
    ) -> Result<Vec<RegisterOutcome>> {
        let (consumer, principal) = candidates
            .first()
            .map(|(_, c)| (c.name.clone(), c.principal.to_string()))
            .unwrap_or_default();
        let span = lifecycle_span("register", &consumer, &principal);
        async move {
            let _serial = self.registrations.lock().await;

            let mut order = Vec::with_capacity(candidates.len());
            let mut existing = Vec::new();
            let mut groups: Vec<((String, Fingerprint), Vec<ArtifactDefinition>)> = Vec::new();
            for (mut definition, consumer) in candidates {
                validate(&definition)?;
                order.push(definition.id);
                if self.registry.contains(definition.id)? {
                    existing.push((definition.id, consumer));
                    continue;
                }
                definition.register(consumer);
                let group_key = (
                    definition.sharing.scope.clone(),
                    definition.sharing.fingerprint.clone(),
                );
                match groups.iter_mut().find(|(k, _)| *k == group_key) {
                    Some((_, group)) => group.push(definition),
                    None => groups.push((group_key, vec![definition])),
                }
            }

            for (artifact, consumer) in existing {
                self.add_registrations(artifact, vec![consumer]).await?;
            }
            let mut steps = Vec::new();
            let mut created = Vec::new();
            for ((scope, fingerprint), group) in groups {
                created.extend(group.iter().map(|d| d.id));
                steps.extend(self.share_pass(&scope, &fingerprint, group).await?);
            }

            Ok(order
                .into_iter()
                .map(|id| {
                    let artifact = final_survivor(&steps, id);
                    let is_new = created.contains(&id) && artifact == id;
                    RegisterOutcome {
                        artifact,
                        created: is_new,
                        absorbed: steps
                            .iter()
                            .filter(|s| is_new && s.survivor == id)
                            .map(|s| s.superseded)
                            .collect(),
                        shared_into: (artifact != id).then_some(artifact),
                    }
                })
                .collect())
        }
        .instrument(span)
        .await
    }

    /// Removes `consumer` from `artifact`. The artifact is deleted once no
    /// registration remains.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownArtifact`] if the artifact does not
    /// exist, and store or lock errors.
    pub async fn unregister(&self, artifact: ArtifactId, consumer: &Consumer) -> Result<()> {
        let span = lifecycle_span("unregister", &consumer.name, &consumer.principal.to_string());
        async move {
            tracing::Span::current().record("artifact", tracing::field::display(artifact));
            let _serial = self.registrations.lock().await;
            let guard = self.lock(artifact, "unregister").await?;
            let result = self.unregister_locked(artifact, consumer).await;
            release(artifact, guard).await;
            result
        }
        .instrument(span)
        .await
    }

    /// The consumer-facing read: resolve, apply the staleness policy, build
    /// or refresh as needed, then query.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when nothing is registered,
    /// [`LifecycleError::NeedsRebuild`] (after starting the rebuild) when the
    /// generation lags behind the stored definition's columns,
    /// [`LifecycleError::UndeclaredColumn`] (without building) for a column
    /// the artifact does not declare, and the build's failure or
    /// cancellation when the caller waited for it.
    pub async fn serve(
        &self,
        key: &CacheKey,
        ctx: &RequestContext,
        plan: QueryPlan,
    ) -> Result<ServeOutcome> {
        let span = lifecycle_span("serve", &key.consumer, &ctx.requestor.user);
        async move {
            let handle = self
                .resolve(key, &ctx.requestor)
                .await?
                .ok_or_else(|| not_found(key))?;
            tracing::Span::current().record("artifact", tracing::field::display(handle.artifact));

            let freshness = self
                .policy
                .classify_definition(&handle.definition, self.clock.now());
            let action = FreshnessPolicy::decide(
                freshness,
                handle.definition.success,
                ctx.allow_interim,
                ctx.mode,
            );
            tracing::debug!(?freshness, ?action, "serving");

            match action {
                ServeAction::Serve => {
                    let result = self.answer(&handle, ctx, plan).await?;
                    Ok(answered(result, freshness, None, false))
                }
                ServeAction::ServeAndRefresh | ServeAction::ServeInterim => {
                    let refresh = self.start_build(&handle, &ctx.requestor)?;
                    let result = self.answer(&handle, ctx, plan).await?;
                    let interim = action == ServeAction::ServeInterim;
                    Ok(answered(result, freshness, Some(refresh), interim))
                }
                ServeAction::ReportBuilding => Ok(ServeOutcome::Building(
                    self.start_build(&handle, &ctx.requestor)?,
                )),
                ServeAction::BuildThenServe => {
                    let build = self.start_build(&handle, &ctx.requestor)?;
                    let status = tokio::select! {
                        biased;
                        () = ctx.cancel.cancelled() => {
                            return Err(LifecycleError::Query(QueryError::Cancelled));
                        }
                        status = build.wait() => status?,
                    };
                    match status {
                        BuildStatus::Published { .. } => {
                            let handle = self
                                .resolve(key, &ctx.requestor)
                                .await?
                                .ok_or_else(|| not_found(key))?;
                            let freshness = self
                                .policy
                                .classify_definition(&handle.definition, self.clock.now());
                            let result = self.answer(&handle, ctx, plan).await?;
                            Ok(answered(result, freshness, None, false))
                        }
                        BuildStatus::Cancelled => Err(LifecycleError::BuildCancelled {
                            artifact: handle.artifact,
                        }),
                        BuildStatus::Failed { message } => Err(LifecycleError::BuildFailed {
                            artifact: handle.artifact,
                            message,
                        }),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Applies a cluster event announced by another node.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn apply_event(&self, event: &ClusterEvent) -> Result<()> {
        match event {
            ClusterEvent::PublishStarting { .. } => Ok(()),
            ClusterEvent::GenerationPublished { artifact, .. } => {
                match self.cache.get(self.store.as_ref(), *artifact).await? {
                    Some(definition) => self.registry.upsert(&definition)?,
                    None => {
                        self.registry.remove(*artifact)?;
                    }
                }
                Ok(())
            }
            ClusterEvent::ArtifactDeleted { artifact } => {
                self.registry.remove(*artifact)?;
                self.cache.invalidate(*artifact)?;
                Ok(())
            }
        }
    }

    async fn answer(
        &self,
        handle: &ArtifactHandle,
        ctx: &RequestContext,
        plan: QueryPlan,
    ) -> Result<QueryResult> {
        match self.query(handle, plan, ctx.cancel.clone()).await {
            Err(e) if e.needs_rebuild() => {
                tracing::info!(artifact = %handle.artifact, error = %e, "triggering rebuild");
                self.start_build(handle, &ctx.requestor)?;
                Err(e)
            }
            other => other,
        }
    }

    fn start_build(&self, handle: &ArtifactHandle, requestor: &Requestor) -> Result<BuildHandle> {
        let key = BuildKey {
            artifact: handle.artifact,
            requestor: requestor.principal(),
        };
        match self.pending.admit(key)? {
            Admission::Joined(build) => Ok(build),
            Admission::Started { handle: build, reporter } => {
                tracing::info!(key = %build.key(), "starting background build");
                let manager = self.clone();
                let definition = handle.definition.as_ref().clone();
                let consumer = handle.registration.to_string();
                let cancel = build.cancellation_token();
                tokio::spawn(
                    async move {
                        let status = manager.run_build(definition, consumer, cancel).await;
                        reporter.finish(status);
                    }
                    .in_current_span(),
                );
                Ok(build)
            }
        }
    }

    async fn run_build(
        &self,
        definition: ArtifactDefinition,
        consumer: String,
        cancel: CancellationToken,
    ) -> BuildStatus {
        let artifact = definition.id;
        let request = BuildRequest::new(definition, consumer).with_mode(BuildMode::Full);
        match self.dispatcher.build(request, cancel).await {
            Ok(outcome) => {
                if let Err(e) = self.after_build(artifact).await {
                    tracing::warn!(%artifact, error = %e, "post-build refresh failed");
                }
                BuildStatus::Published {
                    sequence: outcome.generation.sequence,
                    rows: outcome.rows,
                }
            }
            Err(e) if e.is_cancelled() => BuildStatus::Cancelled,
            Err(e) => BuildStatus::Failed {
                message: e.to_string(),
            },
        }
    }

    async fn after_build(&self, artifact: ArtifactId) -> Result<()> {
        if !self.registry.contains(artifact)? {
            // Unregistered or shared away while building; the publish
            // recreated its objects.
            tracing::info!(%artifact, "artifact removed during build, purging its output");
            let guard = self.lock(artifact, "purge").await?;
            let result = self.purge(artifact).await;
            release(artifact, guard).await;
            return result;
        }
        let Some(definition) = self.cache.get(self.store.as_ref(), artifact).await? else {
            return Ok(());
        };
        self.registry.upsert(&definition)?;

        // Having data may let this artifact absorb registered peers.
        let _serial = self.registrations.lock().await;
        self.share_pass(
            &definition.sharing.scope,
            &definition.sharing.fingerprint,
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    /// Runs the sharing pass over every registered artifact in `scope` with
    /// `fingerprint` followed by `candidates`, then applies the shares.
    async fn share_pass(
        &self,
        scope: &str,
        fingerprint: &Fingerprint,
        candidates: Vec<ArtifactDefinition>,
    ) -> Result<Vec<ShareStep>> {
        let candidate_ids: Vec<ArtifactId> = candidates.iter().map(|d| d.id).collect();
        let mut definitions = Vec::new();
        for artifact in self.registry.with_fingerprint(scope, fingerprint)? {
            if let Some(definition) = self.cache.get(self.store.as_ref(), artifact).await? {
                definitions.push(definition.as_ref().clone());
            }
        }
        definitions.extend(candidates);

        let steps = plan_shares(&definitions);
        self.apply_shares(&definitions, &candidate_ids, &steps).await?;
        Ok(steps)
    }

    async fn apply_shares(
        &self,
        definitions: &[ArtifactDefinition],
        candidates: &[ArtifactId],
        steps: &[ShareStep],
    ) -> Result<()> {
        let by_id: HashMap<ArtifactId, &ArtifactDefinition> =
            definitions.iter().map(|d| (d.id, d)).collect();
        let mut moved: HashMap<ArtifactId, Vec<Consumer>> = HashMap::new();
        for step in steps {
            let mut consumers: Vec<Consumer> = by_id
                .get(&step.superseded)
                .map(|d| d.consumers().to_vec())
                .unwrap_or_default();
            consumers.extend(moved.remove(&step.superseded).unwrap_or_default());
            moved.entry(step.survivor).or_default().extend(consumers);
        }

        // Survivors first, so no registration is ever without an artifact.
        for definition in definitions {
            if steps.iter().any(|s| s.superseded == definition.id) {
                continue;
            }
            let gained = moved.remove(&definition.id).unwrap_or_default();
            if candidates.contains(&definition.id) {
                let mut definition = definition.clone();
                for consumer in gained {
                    definition.register(consumer);
                }
                self.persist(definition).await?;
            } else if !gained.is_empty() {
                self.add_registrations(definition.id, gained).await?;
            }
        }

        for step in steps {
            vista_core::metrics::record_share_applied();
            tracing::info!(survivor = %step.survivor, superseded = %step.superseded, "artifacts shared");
            if candidates.contains(&step.superseded) {
                continue;
            }
            let guard = self.lock(step.superseded, "share").await?;
            let result = self.purge(step.superseded).await;
            release(step.superseded, guard).await;
            result?;
        }
        Ok(())
    }

    async fn persist(&self, definition: ArtifactDefinition) -> Result<()> {
        let revision = self.store.put(&definition).await?;
        self.registry.upsert(&definition)?;
        tracing::info!(artifact = %definition.id, "artifact registered");
        self.cache.insert(definition.id, Arc::new(definition), revision)?;
        Ok(())
    }

    async fn add_registrations(&self, artifact: ArtifactId, consumers: Vec<Consumer>) -> Result<()> {
        let guard = self.lock(artifact, "register").await?;
        let result = async {
            let mut definition = self
                .store
                .get(artifact)
                .await?
                .ok_or(LifecycleError::UnknownArtifact(artifact))?
                .definition;
            let mut changed = false;
            for consumer in consumers {
                changed |= definition.register(consumer);
            }
            if changed {
                self.persist(definition).await?;
            }
            Ok(())
        }
        .await;
        release(artifact, guard).await;
        result
    }

    async fn unregister_locked(&self, artifact: ArtifactId, consumer: &Consumer) -> Result<()> {
        let Some(stored) = self.store.get(artifact).await? else {
            self.registry.remove(artifact)?;
            return Err(LifecycleError::UnknownArtifact(artifact));
        };
        let mut definition = stored.definition;
        if !definition.unregister(consumer) {
            return Ok(());
        }
        if definition.consumers().is_empty() {
            return self.purge(artifact).await;
        }
        self.persist(definition).await
    }

    /// Deletes everything stored for `artifact`. The caller holds its lock.
    async fn purge(&self, artifact: ArtifactId) -> Result<()> {
        self.registry.remove(artifact)?;
        self.cache.invalidate(artifact)?;
        for build in self.pending.for_artifact(artifact)? {
            build.cancel();
        }

        self.store.remove(artifact).await?;
        self.storage
            .delete(&ArtifactPaths::generation(artifact))
            .await?;
        for object in self.storage.list(&ArtifactPaths::prefix(artifact)).await? {
            self.storage.delete(&object.path).await?;
        }

        if let Err(e) = self
            .signal
            .notify(ClusterEvent::ArtifactDeleted { artifact })
            .await
        {
            tracing::warn!(%artifact, error = %e, "failed to announce artifact deletion");
        }
        tracing::info!(%artifact, "artifact deleted");
        Ok(())
    }

    async fn lock(&self, artifact: ArtifactId, operation: &str) -> Result<LockGuard> {
        Ok(DistributedLock::for_artifact(Arc::clone(&self.storage), artifact)
            .acquire_for(self.lock_ttl, self.lock_attempts, Some(operation.to_string()))
            .await?)
    }
}

async fn release(artifact: ArtifactId, guard: LockGuard) {
    if let Err(e) = guard.release().await {
        tracing::warn!(%artifact, error = %e, "failed to release artifact lock");
    }
}

fn answered(
    result: QueryResult,
    freshness: Freshness,
    refresh: Option<BuildHandle>,
    interim: bool,
) -> ServeOutcome {
    ServeOutcome::Answered {
        result,
        freshness,
        refresh,
        interim,
    }
}

fn not_found(key: &CacheKey) -> LifecycleError {
    LifecycleError::NotFound {
        consumer: key.consumer.clone(),
        table: key.table.clone(),
    }
}

fn validate(definition: &ArtifactDefinition) -> vista_core::Result<()> {
    if definition.columns.is_empty() {
        return Err(vista_core::Error::InvalidInput(format!(
            "artifact {} declares no columns",
            definition.id
        )));
    }
    if let Some(column) = &definition.break_column {
        if definition.column(column).is_none() {
            return Err(vista_core::Error::InvalidInput(format!(
                "break column {column} is not a column of artifact {}",
                definition.id
            )));
        }
    }
    Ok(())
}
