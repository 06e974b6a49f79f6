//! Persisted-format contracts for definitions, manifests and locks.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vista_core::definition::{ArtifactDefinition, Consumer, Principal};
use vista_core::error::Error;
use vista_core::fingerprint::Fingerprint;
use vista_core::generation::GenerationManifest;
use vista_core::lock::{DistributedLock, FencingToken};
use vista_core::paths::ArtifactPaths;
use vista_core::plan::SourceQuery;
use vista_core::schema::{Column, ColumnType};
use vista_core::storage::{MemoryBackend, StorageBackend, read_json, write_json};

fn definition() -> ArtifactDefinition {
    ArtifactDefinition::new(
        "revenue",
        "project-a",
        SourceQuery::new("sales", json!({"groupBy": ["region"], "caption": "Revenue"})),
        vec![
            Column::dimension("region", ColumnType::String),
            Column::measure("amount", ColumnType::Int64),
        ],
    )
    .unwrap()
    .with_break_column("region")
}

#[test]
fn definitions_serialize_with_camel_case_keys() {
    let mut def = definition();
    def.register(Consumer::new("dash", Principal::group("analysts")));
    let value = serde_json::to_value(&def).unwrap();

    assert_eq!(value["breakColumn"], "region");
    assert_eq!(value["sharing"]["fullData"], true);
    assert_eq!(value["sharing"]["hasData"], false);
    assert_eq!(value["sharing"]["consumers"][0]["principal"]["kind"], "group");
    assert!(value.get("lastBuild").is_none());

    let back: ArtifactDefinition = serde_json::from_value(value).unwrap();
    assert_eq!(back, def);
}

#[test]
fn fingerprints_ignore_naming_and_key_order() {
    let a = SourceQuery::new("sales", json!({"groupBy": ["region"], "filter": {"a": 1, "b": 2}}));
    let b = SourceQuery::new(
        "sales",
        json!({"filter": {"b": 2, "a": 1}, "caption": "Renamed", "groupBy": ["region"]}),
    );
    let c = SourceQuery::new("sales", json!({"groupBy": ["country"]}));

    assert_eq!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    assert_ne!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&c).unwrap());
    assert!(Fingerprint::of(&a).unwrap().as_str().starts_with("sha256:"));
}

#[tokio::test]
async fn generation_is_absent_until_written() {
    let storage = MemoryBackend::new();
    let def = definition();
    assert!(GenerationManifest::load(&storage, def.id).await.unwrap().is_none());

    let generation = GenerationManifest::empty(def.clone(), "json");
    write_json(&storage, &ArtifactPaths::generation(def.id), &generation)
        .await
        .unwrap();

    let loaded = GenerationManifest::load(&storage, def.id).await.unwrap().unwrap();
    assert_eq!(loaded.artifact, def.id);
    assert!(loaded.is_empty());
    let stored: Option<serde_json::Value> =
        read_json(&storage, &ArtifactPaths::definition(def.id)).await.unwrap();
    assert!(stored.is_none());
}

#[tokio::test]
async fn artifact_lock_is_exclusive_until_released() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let artifact = definition().id;
    let ttl = Duration::from_secs(30);

    let first = DistributedLock::for_artifact(Arc::clone(&storage), artifact)
        .acquire(ttl, 1)
        .await
        .unwrap();
    let contender = DistributedLock::for_artifact(Arc::clone(&storage), artifact);
    let err = contender.acquire(ttl, 1).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed { .. }));

    first.release().await.unwrap();
    let second = contender.acquire(ttl, 1).await.unwrap();
    assert!(second.is_held().await.unwrap());
    assert!(second.fencing_token() > FencingToken::new(1));
    assert!(storage.head(&ArtifactPaths::lock(artifact)).await.unwrap().is_some());
}
