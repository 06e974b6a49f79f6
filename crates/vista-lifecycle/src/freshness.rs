//! Staleness and expiration policy.
//!
//! An artifact is stale once its age exceeds the freshness threshold and
//! expired once it exceeds the larger max-age threshold. Stale artifacts are
//! served while a refresh runs in the background; expired or never-built
//! artifacts make the caller wait for a build unless an interim answer is
//! allowed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use vista_core::config::LifecycleConfig;
use vista_core::definition::ArtifactDefinition;

/// Age class of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than the freshness threshold.
    Fresh,
    /// Older than the freshness threshold.
    Stale,
    /// Older than the max-age threshold.
    Expired,
    /// Never built successfully.
    Missing,
}

/// Whether the caller waits for a first build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallMode {
    /// Wait for the build and answer from it.
    #[default]
    Blocking,
    /// Return a building signal immediately.
    NonBlocking,
}

/// What serving a request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeAction {
    /// Answer from the current generation.
    Serve,
    /// Answer from the current generation and refresh in the background.
    ServeAndRefresh,
    /// Answer from the previous generation while a rebuild runs.
    ServeInterim,
    /// Build first, then answer.
    BuildThenServe,
    /// Start a build and report that it is running.
    ReportBuilding,
}

/// Freshness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    freshness: Duration,
    max_age: Duration,
}

impl FreshnessPolicy {
    /// Creates a policy. `max_age` is raised to `freshness` if smaller.
    #[must_use]
    pub fn new(freshness: Duration, max_age: Duration) -> Self {
        Self {
            freshness,
            max_age: max_age.max(freshness),
        }
    }

    /// Policy from configuration.
    #[must_use]
    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(
            Duration::from_secs(config.freshness_secs),
            Duration::from_secs(config.max_age_secs),
        )
    }

    /// Classifies an artifact last built at `last_build`.
    #[must_use]
    pub fn classify(&self, last_build: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
        let Some(built) = last_build else {
            return Freshness::Missing;
        };
        // A build stamped in the future (clock skew) counts as fresh.
        let age = (now - built).to_std().unwrap_or(Duration::ZERO);
        if age > self.max_age {
            Freshness::Expired
        } else if age > self.freshness {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Classifies `definition`.
    #[must_use]
    pub fn classify_definition(
        &self,
        definition: &ArtifactDefinition,
        now: DateTime<Utc>,
    ) -> Freshness {
        let last_build = definition.last_build.filter(|_| definition.success);
        self.classify(last_build, now)
    }

    /// Decides how to serve an artifact of `freshness`.
    ///
    /// `has_generation` says whether any generation was published;
    /// `allow_interim` lets an expired artifact answer from it while the
    /// rebuild runs.
    #[must_use]
    pub fn decide(
        freshness: Freshness,
        has_generation: bool,
        allow_interim: bool,
        mode: CallMode,
    ) -> ServeAction {
        match freshness {
            Freshness::Fresh => ServeAction::Serve,
            Freshness::Stale => ServeAction::ServeAndRefresh,
            Freshness::Expired if has_generation && allow_interim => ServeAction::ServeInterim,
            Freshness::Expired | Freshness::Missing => match mode {
                CallMode::Blocking => ServeAction::BuildThenServe,
                CallMode::NonBlocking => ServeAction::ReportBuilding,
            },
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::from_config(&LifecycleConfig::default())
    }
}
