//! Lifecycle manager scenarios against in-memory storage and executor.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use vista_core::config::{BuildConfig, LifecycleConfig, VistaConfig};
use vista_core::definition::{ArtifactDefinition, Consumer, Principal};
use vista_core::paths::ArtifactPaths;
use vista_core::plan::QueryPlan;
use vista_core::signal::{BroadcastSignal, ClusterEvent};
use vista_lifecycle::{
    BuildStatus, CacheKey, DefinitionStore, Freshness, LifecycleError, LifecycleManager,
    RequestContext, Requestor, ServeOutcome, StorageDefinitionStore,
};
use vista_test_utils::{
    InMemoryExecutor, SALES_TABLE, TestContext, TracingMemoryBackend, init_test_logging,
    sales_columns, sales_definition, sales_source, sales_table,
};

fn config() -> VistaConfig {
    VistaConfig {
        build: BuildConfig {
            parallelism: 1,
            block_rows: 16,
            ..BuildConfig::default()
        },
        lifecycle: LifecycleConfig {
            freshness_secs: 60,
            max_age_secs: 600,
            ..LifecycleConfig::default()
        },
        ..VistaConfig::default()
    }
}

fn manager(ctx: &TestContext) -> LifecycleManager {
    LifecycleManager::new(ctx.storage.clone(), ctx.executor.clone(), &config())
        .with_clock(ctx.clock.clone())
}

fn dash() -> CacheKey {
    CacheKey::new(SALES_TABLE, "dash")
}

fn ann() -> Requestor {
    Requestor::user("ann")
}

fn plan() -> QueryPlan {
    QueryPlan::select(["region", "amount"])
}

async fn build(manager: &LifecycleManager, key: &CacheKey, requestor: &Requestor) -> BuildStatus {
    manager
        .build_now(key, requestor)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap()
}

async fn answered(outcome: ServeOutcome) -> (usize, Freshness, bool, bool) {
    match outcome {
        ServeOutcome::Answered {
            result,
            freshness,
            refresh,
            interim,
        } => {
            let rows = result.into_batch().await.unwrap().rows.len();
            (rows, freshness, refresh.is_some(), interim)
        }
        ServeOutcome::Building(_) => panic!("expected an answer"),
    }
}

#[tokio::test]
async fn concurrent_build_requests_share_one_build() {
    init_test_logging();
    let executor = InMemoryExecutor::with_latency(Duration::from_millis(50));
    executor.insert_table(SALES_TABLE, sales_table(40));
    let storage = Arc::new(TracingMemoryBackend::new());
    let manager = LifecycleManager::new(storage, Arc::new(executor.clone()), &config());
    manager
        .register(sales_definition("scope"), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();

    let key = dash();
    let requestor = ann();
    let handles: Vec<_> = join_all((0..8).map(|_| manager.build_now(&key, &requestor)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let ticket = handles[0].ticket();
    assert!(handles.iter().all(|h| h.ticket() == ticket));
    for handle in &handles {
        assert!(matches!(
            handle.wait().await.unwrap(),
            BuildStatus::Published { sequence: 1, .. }
        ));
    }
    assert_eq!(executor.executions(), 1);
    assert_eq!(manager.pending_builds().unwrap(), 0);

    let next = manager.build_now(&key, &requestor).await.unwrap();
    assert_ne!(next.ticket(), ticket);
    assert!(matches!(next.wait().await.unwrap(), BuildStatus::Published { sequence: 2, .. }));
}

#[tokio::test]
async fn later_registration_shares_a_built_artifact() {
    let ctx = TestContext::with_sales(40);
    let manager = manager(&ctx);

    let def1 = sales_definition("scope");
    let first = manager
        .register(def1.clone(), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();
    assert!(first.created);
    assert!(matches!(build(&manager, &dash(), &ann()).await, BuildStatus::Published { .. }));

    let def2 = sales_definition("scope");
    let second = manager
        .register(def2.clone(), Consumer::new("report", Principal::user("bo")))
        .await
        .unwrap();
    assert_eq!(second.shared_into, Some(def1.id));
    assert!(!second.created);

    let report = manager
        .resolve(&CacheKey::new(SALES_TABLE, "report"), &Requestor::user("bo"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.artifact, def1.id);
    assert!(ctx.storage.paths_under(&ArtifactPaths::prefix(def2.id)).is_empty());
}

#[tokio::test]
async fn built_artifact_absorbs_narrower_peers() {
    let ctx = TestContext::with_sales(40);
    let manager = manager(&ctx);
    let report = CacheKey::new(SALES_TABLE, "report");
    let bo = Requestor::user("bo");

    let narrow =
        ArtifactDefinition::new("narrow", "scope", sales_source(), sales_columns()[1..].to_vec())
            .unwrap();
    manager
        .register(narrow.clone(), Consumer::new("report", Principal::user("bo")))
        .await
        .unwrap();
    build(&manager, &report, &bo).await;
    assert!(!ctx.storage.paths_under(&ArtifactPaths::prefix(narrow.id)).is_empty());

    // The wide artifact has no data yet, so it cannot replace the built one.
    let wide = sales_definition("scope");
    let registered = manager
        .register(wide.clone(), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();
    assert!(registered.created);
    assert!(registered.absorbed.is_empty());

    build(&manager, &dash(), &ann()).await;

    let resolved = manager.resolve(&report, &bo).await.unwrap().unwrap();
    assert_eq!(resolved.artifact, wide.id);
    assert!(ctx.storage.paths_under(&ArtifactPaths::prefix(narrow.id)).is_empty());
}

#[tokio::test]
async fn batch_registration_shares_among_candidates() {
    let ctx = TestContext::with_sales(10);
    let manager = manager(&ctx);
    let narrow =
        ArtifactDefinition::new("narrow", "scope", sales_source(), sales_columns()[1..].to_vec())
            .unwrap();
    let wide = sales_definition("scope");
    let elsewhere = sales_definition("other-scope");

    let outcomes = manager
        .register_batch(vec![
            (narrow.clone(), Consumer::new("report", Principal::user("bo"))),
            (wide.clone(), Consumer::new("dash", Principal::user("ann"))),
            (elsewhere.clone(), Consumer::new("dash", Principal::user("cy"))),
        ])
        .await
        .unwrap();

    assert_eq!(outcomes[0].shared_into, Some(wide.id));
    assert_eq!(outcomes[1].absorbed, vec![narrow.id]);
    assert!(outcomes[2].created);
    assert!(ctx.storage.paths_under(&ArtifactPaths::prefix(narrow.id)).is_empty());

    let bo = manager
        .resolve(&CacheKey::new(SALES_TABLE, "report"), &Requestor::user("bo"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bo.artifact, wide.id);
}

#[tokio::test]
async fn staleness_drives_refresh_and_interim_answers() {
    let ctx = TestContext::with_sales(40);
    let manager = manager(&ctx);
    manager
        .register(sales_definition("scope"), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();
    let ctx_blocking = RequestContext::new(ann());

    // Missing: the caller waits for the first build.
    let (rows, freshness, refresh, _) =
        answered(manager.serve(&dash(), &ctx_blocking, plan()).await.unwrap()).await;
    assert!(rows > 0);
    assert_eq!((freshness, refresh), (Freshness::Fresh, false));
    assert_eq!(ctx.executor.executions(), 1);

    // Fresh: answered without building.
    let (_, freshness, refresh, _) =
        answered(manager.serve(&dash(), &ctx_blocking, plan()).await.unwrap()).await;
    assert_eq!((freshness, refresh), (Freshness::Fresh, false));
    assert_eq!(ctx.executor.executions(), 1);

    // Stale: answered now, refreshed in the background.
    ctx.clock.advance_secs(120);
    let outcome = manager.serve(&dash(), &ctx_blocking, plan()).await.unwrap();
    let ServeOutcome::Answered {
        freshness,
        refresh: Some(refresh),
        interim: false,
        ..
    } = outcome
    else {
        panic!("expected a refreshing answer");
    };
    assert_eq!(freshness, Freshness::Stale);
    assert!(matches!(refresh.wait().await.unwrap(), BuildStatus::Published { sequence: 2, .. }));

    // Expired with interim answers allowed: the old generation answers.
    ctx.clock.advance_secs(1_000);
    let interim_ctx = RequestContext::new(ann()).with_interim();
    let outcome = manager.serve(&dash(), &interim_ctx, plan()).await.unwrap();
    let ServeOutcome::Answered {
        result,
        freshness,
        refresh: Some(refresh),
        interim: true,
    } = outcome
    else {
        panic!("expected an interim answer");
    };
    assert_eq!(freshness, Freshness::Expired);
    assert!(!result.into_batch().await.unwrap().rows.is_empty());
    refresh.wait().await.unwrap();

    // Expired without interim, non-blocking: report the running build.
    ctx.clock.advance_secs(1_000);
    let outcome = manager
        .serve(&dash(), &RequestContext::new(ann()).non_blocking(), plan())
        .await
        .unwrap();
    let ServeOutcome::Building(build) = outcome else {
        panic!("expected a building signal");
    };
    assert!(matches!(build.wait().await.unwrap(), BuildStatus::Published { .. }));
}

#[tokio::test]
async fn first_non_blocking_read_reports_building() {
    let ctx = TestContext::with_sales(20);
    let manager = manager(&ctx);
    manager
        .register(sales_definition("scope"), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();

    let non_blocking = RequestContext::new(ann()).non_blocking();
    let ServeOutcome::Building(build) = manager.serve(&dash(), &non_blocking, plan()).await.unwrap()
    else {
        panic!("expected a building signal");
    };
    build.wait().await.unwrap();

    let (rows, freshness, _, _) =
        answered(manager.serve(&dash(), &non_blocking, plan()).await.unwrap()).await;
    assert!(rows > 0);
    assert_eq!(freshness, Freshness::Fresh);
}

#[tokio::test]
async fn undeclared_column_is_rejected_without_building() {
    let ctx = TestContext::with_sales(20);
    let manager = manager(&ctx);
    manager
        .register(sales_definition("scope"), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();
    build(&manager, &dash(), &ann()).await;
    let before = ctx.executor.executions();

    for _ in 0..3 {
        let err = manager
            .serve(&dash(), &RequestContext::new(ann()), QueryPlan::select(["discount"]))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, LifecycleError::UndeclaredColumn { column, .. } if column == "discount"),
            "{err}"
        );
    }
    assert_eq!(ctx.executor.executions(), before);
    assert_eq!(manager.pending_builds().unwrap(), 0);
}

#[tokio::test]
async fn generation_behind_its_definition_is_rebuilt() {
    let ctx = TestContext::with_sales(20);
    let manager = manager(&ctx);
    let columns = sales_columns()
        .into_iter()
        .filter(|c| c.name != "order_date")
        .collect();
    let narrow = ArtifactDefinition::new("sales", "scope", sales_source(), columns).unwrap();
    let artifact = narrow.id;
    manager
        .register(narrow, Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();
    build(&manager, &dash(), &ann()).await;

    // Another node widened the stored definition; the published generation
    // still has the old columns.
    let store = StorageDefinitionStore::new(ctx.storage.clone());
    let mut stored = store.get(artifact).await.unwrap().unwrap().definition;
    stored.columns = sales_columns();
    store.put(&stored).await.unwrap();

    let dated = || QueryPlan::select(["order_date", "amount"]);
    let err = manager
        .serve(&dash(), &RequestContext::new(ann()), dated())
        .await
        .unwrap_err();
    assert!(err.needs_rebuild(), "{err}");

    let status = build(&manager, &dash(), &ann()).await;
    assert!(matches!(status, BuildStatus::Published { .. }), "{status:?}");
    let (rows, _, _, _) =
        answered(manager.serve(&dash(), &RequestContext::new(ann()), dated()).await.unwrap()).await;
    assert_eq!(rows, 20);
}

#[tokio::test]
async fn failed_build_surfaces_and_releases_the_key() {
    let ctx = TestContext::with_sales(20);
    let manager = manager(&ctx);
    manager
        .register(sales_definition("scope"), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();
    ctx.executor.fail_table(SALES_TABLE);

    let err = manager
        .serve(&dash(), &RequestContext::new(ann()), plan())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::BuildFailed { .. }), "{err}");
    assert_eq!(manager.pending_builds().unwrap(), 0);

    ctx.executor.clear_faults();
    let (rows, _, _, _) =
        answered(manager.serve(&dash(), &RequestContext::new(ann()), plan()).await.unwrap()).await;
    assert!(rows > 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_build_publishes_nothing() {
    let executor = InMemoryExecutor::with_latency(Duration::from_millis(100));
    executor.insert_table(SALES_TABLE, sales_table(20));
    let storage = Arc::new(TracingMemoryBackend::new());
    let manager = LifecycleManager::new(storage.clone(), Arc::new(executor), &config());
    let def = sales_definition("scope");
    manager
        .register(def.clone(), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();

    let handle = manager.build_now(&dash(), &ann()).await.unwrap();
    manager.cancel(&handle);
    assert_eq!(handle.wait().await.unwrap(), BuildStatus::Cancelled);
    assert!(storage.paths_under(&ArtifactPaths::generation(def.id)).is_empty());
    assert_eq!(manager.pending_builds().unwrap(), 0);
}

#[tokio::test]
async fn exact_registration_wins_over_group() {
    let ctx = TestContext::with_sales(10);
    let manager = manager(&ctx);
    let for_group = sales_definition("team");
    let for_user = sales_definition("personal");
    manager
        .register(for_group.clone(), Consumer::new("dash", Principal::group("analysts")))
        .await
        .unwrap();
    manager
        .register(for_user.clone(), Consumer::new("dash", Principal::user("ann")))
        .await
        .unwrap();

    let ann = Requestor::user("ann").with_groups(["analysts"]);
    let bo = Requestor::user("bo").with_groups(["analysts"]);
    assert_eq!(manager.resolve(&dash(), &ann).await.unwrap().unwrap().artifact, for_user.id);
    assert_eq!(manager.resolve(&dash(), &bo).await.unwrap().unwrap().artifact, for_group.id);
    assert!(manager.resolve(&dash(), &Requestor::user("cy")).await.unwrap().is_none());

    let err = manager.build_now(&dash(), &Requestor::user("cy")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn last_unregister_deletes_the_artifact() {
    let ctx = TestContext::with_sales(20);
    let manager = manager(&ctx);
    let def = sales_definition("scope");
    let ann_dash = Consumer::new("dash", Principal::user("ann"));
    let bo_report = Consumer::new("report", Principal::user("bo"));
    manager.register(def.clone(), ann_dash.clone()).await.unwrap();
    let again = manager.register(def.clone(), bo_report.clone()).await.unwrap();
    assert_eq!((again.artifact, again.created), (def.id, false));
    build(&manager, &dash(), &ann()).await;

    manager.unregister(def.id, &ann_dash).await.unwrap();
    assert!(manager.resolve(&dash(), &ann()).await.unwrap().is_none());
    assert!(!ctx.storage.paths_under(&ArtifactPaths::prefix(def.id)).is_empty());

    manager.unregister(def.id, &bo_report).await.unwrap();
    assert!(ctx.storage.paths_under(&ArtifactPaths::prefix(def.id)).is_empty());
    let err = manager.unregister(def.id, &bo_report).await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownArtifact(id) if id == def.id));
}

#[tokio::test]
async fn deletions_reach_other_nodes() {
    let ctx = TestContext::with_sales(10);
    let signal = Arc::new(BroadcastSignal::new(16));
    let mut events = signal.subscribe();
    let node_a = manager(&ctx).with_signal(signal.clone());
    let node_b = manager(&ctx);

    let def = sales_definition("scope");
    let consumer = Consumer::new("dash", Principal::user("ann"));
    node_a.register(def.clone(), consumer.clone()).await.unwrap();
    assert_eq!(node_b.load().await.unwrap(), 1);
    assert!(node_b.resolve(&dash(), &ann()).await.unwrap().is_some());

    node_a.unregister(def.id, &consumer).await.unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event, ClusterEvent::ArtifactDeleted { artifact: def.id });
    node_b.apply_event(&event).await.unwrap();
    assert!(node_b.resolve(&dash(), &ann()).await.unwrap().is_none());
}
