//! Cache keys and requesting identities.
//!
//! A consumer asks for an artifact by [`CacheKey`] (source table plus
//! consumer name) while acting as a [`Requestor`]. Registrations are made
//! under a single [`Principal`]; the requestor matches one exactly (its own
//! user), through one of its groups, or through one of its roles.

use std::fmt;

use serde::{Deserialize, Serialize};
use vista_core::definition::{Principal, PrincipalKind};
use vista_core::id::ArtifactId;

/// Identifies what a consumer asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Source table identity.
    pub table: String,
    /// Consumer name (dashboard, report, client).
    pub consumer: String,
}

impl CacheKey {
    /// Creates a key.
    #[must_use]
    pub fn new(table: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            consumer: consumer.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.consumer)
    }
}

/// How a registration principal matched the requestor. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchRank {
    /// The registration was made for the requestor itself.
    Exact,
    /// The registration was made for one of the requestor's groups.
    Group,
    /// The registration was made for one of the requestor's roles.
    Role,
}

/// The identity a request runs as, with its memberships.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requestor {
    /// User name.
    pub user: String,
    /// Groups the user belongs to.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Roles granted to the user.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Requestor {
    /// A requestor without memberships.
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            groups: Vec::new(),
            roles: Vec::new(),
        }
    }

    /// Adds group memberships.
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Adds role memberships.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// The requestor's own user principal.
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal::user(self.user.clone())
    }

    /// How `principal` matches this requestor, if at all.
    #[must_use]
    pub fn match_rank(&self, principal: &Principal) -> Option<MatchRank> {
        match principal.kind {
            PrincipalKind::User if principal.name == self.user => Some(MatchRank::Exact),
            PrincipalKind::Group if self.groups.contains(&principal.name) => Some(MatchRank::Group),
            PrincipalKind::Role if self.roles.contains(&principal.name) => Some(MatchRank::Role),
            _ => None,
        }
    }
}

impl fmt::Display for Requestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)
    }
}

/// Single-flight key: one build per artifact and requesting identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    /// Artifact being built.
    pub artifact: ArtifactId,
    /// Identity the build runs for.
    pub requestor: Principal,
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.artifact, self.requestor)
    }
}
