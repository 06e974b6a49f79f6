//! Artifact definitions and consumer registrations.
//!
//! An [`ArtifactDefinition`] is the persisted description of one materialized
//! view: what it is computed from, which columns it holds, how it is refreshed
//! incrementally, and who is registered to use it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::id::ArtifactId;
use crate::plan::SourceQuery;
use crate::schema::{Column, ColumnRange};

/// Kind of identity a registration is made under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    /// A single user.
    User,
    /// A group of users.
    Group,
    /// A role granted to users.
    Role,
}

/// An identity that artifacts are registered to and builds run as.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// User, group or role.
    pub kind: PrincipalKind,
    /// Name within its kind.
    pub name: String,
}

impl Principal {
    /// A user principal.
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::User,
            name: name.into(),
        }
    }

    /// A group principal.
    #[must_use]
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Group,
            name: name.into(),
        }
    }

    /// A role principal.
    #[must_use]
    pub fn role(name: impl Into<String>) -> Self {
        Self {
            kind: PrincipalKind::Role,
            name: name.into(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
            PrincipalKind::Role => "role",
        };
        write!(f, "{kind}:{}", self.name)
    }
}

/// One registration of an artifact: a named consumer (dashboard, report,
/// API client) acting under a principal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Consumer {
    /// Consumer name; together with the source table it forms the cache key.
    pub name: String,
    /// Identity the registration was made under.
    pub principal: Principal,
}

impl Consumer {
    /// Creates a registration.
    #[must_use]
    pub fn new(name: impl Into<String>, principal: Principal) -> Self {
        Self {
            name: name.into(),
            principal,
        }
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.principal)
    }
}

/// Facts used to decide whether two artifacts can be shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingMetadata {
    /// Sharing scope (project, tenant, artifact type); only artifacts in the
    /// same scope are ever shared.
    pub scope: String,
    /// Structural fingerprint of the source query.
    pub fingerprint: Fingerprint,
    /// Registrations, in registration order.
    #[serde(default)]
    pub consumers: Vec<Consumer>,
    /// A non-empty generation has been published.
    #[serde(default)]
    pub has_data: bool,
    /// The artifact holds every row of its source (no restricting pre-condition).
    #[serde(default = "default_true")]
    pub full_data: bool,
}

const fn default_true() -> bool {
    true
}

/// Persisted description of one materialized artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDefinition {
    /// Artifact identity.
    pub id: ArtifactId,
    /// Human-readable name.
    pub name: String,
    /// Query the artifact materializes.
    pub source: SourceQuery,
    /// Columns, in declaration order.
    pub columns: Vec<Column>,
    /// Column blocks are broken (partitioned) on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_column: Option<String>,
    /// Condition selecting the rows an incremental build adds.
    #[serde(default)]
    pub update_condition: Condition,
    /// Persisted restriction applied to every build.
    #[serde(default)]
    pub pre_condition: Condition,
    /// The last build completed successfully.
    #[serde(default)]
    pub success: bool,
    /// When the last successful build finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build: Option<DateTime<Utc>>,
    /// Sharing metadata.
    pub sharing: SharingMetadata,
}

impl ArtifactDefinition {
    /// Creates a definition with a fresh id and a computed fingerprint.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the source cannot be fingerprinted.
    pub fn new(
        name: impl Into<String>,
        scope: impl Into<String>,
        source: SourceQuery,
        columns: Vec<Column>,
    ) -> Result<Self> {
        let fingerprint = Fingerprint::of(&source)?;
        Ok(Self {
            id: ArtifactId::generate(),
            name: name.into(),
            source,
            columns,
            break_column: None,
            update_condition: Condition::empty(),
            pre_condition: Condition::empty(),
            success: false,
            last_build: None,
            sharing: SharingMetadata {
                scope: scope.into(),
                fingerprint,
                consumers: Vec::new(),
                has_data: false,
                full_data: true,
            },
        })
    }

    /// Sets the break column.
    #[must_use]
    pub fn with_break_column(mut self, column: impl Into<String>) -> Self {
        self.break_column = Some(column.into());
        self
    }

    /// Sets the incremental update condition.
    #[must_use]
    pub fn with_update_condition(mut self, condition: Condition) -> Self {
        self.update_condition = condition;
        self
    }

    /// Sets the persisted pre-condition. A non-empty pre-condition means the
    /// artifact no longer holds the full data of its source.
    #[must_use]
    pub fn with_pre_condition(mut self, condition: Condition) -> Self {
        self.sharing.full_data = condition.is_empty();
        self.pre_condition = condition;
        self
    }

    /// Source table identity.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.source.table
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// First of `required` that this artifact lacks.
    #[must_use]
    pub fn missing_column<'a>(&self, required: &'a [String]) -> Option<&'a str> {
        required
            .iter()
            .find(|name| self.column(name).is_none())
            .map(String::as_str)
    }

    /// Recomputes the fingerprint after the source changed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the source cannot be fingerprinted.
    pub fn refresh_fingerprint(&mut self) -> Result<()> {
        self.sharing.fingerprint = Fingerprint::of(&self.source)?;
        Ok(())
    }

    /// Registrations.
    #[must_use]
    pub fn consumers(&self) -> &[Consumer] {
        &self.sharing.consumers
    }

    /// Adds a registration. Returns false if it already existed.
    pub fn register(&mut self, consumer: Consumer) -> bool {
        if self.sharing.consumers.contains(&consumer) {
            return false;
        }
        self.sharing.consumers.push(consumer);
        true
    }

    /// Removes a registration. Returns true if it existed.
    pub fn unregister(&mut self, consumer: &Consumer) -> bool {
        let before = self.sharing.consumers.len();
        self.sharing.consumers.retain(|c| c != consumer);
        before != self.sharing.consumers.len()
    }

    /// Registrations made for `consumer_name`, under any principal.
    pub fn registrations_for<'a>(
        &'a self,
        consumer_name: &'a str,
    ) -> impl Iterator<Item = &'a Consumer> + 'a {
        self.sharing
            .consumers
            .iter()
            .filter(move |c| c.name == consumer_name)
    }

    /// Widens column ranges with the statistics of newly built data.
    ///
    /// Ranges are never narrowed; statistics for unknown columns are ignored.
    pub fn widen_ranges(&mut self, stats: &BTreeMap<String, ColumnRange>) {
        for column in &mut self.columns {
            if let Some(range) = stats.get(&column.name) {
                column.range = column.range.widen(range);
            }
        }
    }

    /// Records a successful build.
    pub fn mark_built(&mut self, at: DateTime<Utc>, has_data: bool) {
        self.success = true;
        self.last_build = Some(at);
        self.sharing.has_data = self.sharing.has_data || has_data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;
    use serde_json::json;

    fn definition() -> ArtifactDefinition {
        ArtifactDefinition::new(
            "sales by region",
            "project-a",
            SourceQuery::new("sales", json!({"groupBy": ["region"]})),
            vec![
                Column::dimension("region", ColumnType::String),
                Column::measure("amount", ColumnType::Float64),
            ],
        )
        .unwrap()
    }

    #[test]
    fn registration_is_deduplicated() {
        let mut def = definition();
        let c = Consumer::new("dash", Principal::user("ann"));
        assert!(def.register(c.clone()));
        assert!(!def.register(c.clone()));
        assert_eq!(def.consumers().len(), 1);
        assert!(def.unregister(&c));
        assert!(!def.unregister(&c));
    }

    #[test]
    fn missing_column_is_reported() {
        let def = definition();
        let required = vec!["region".to_string(), "year".to_string()];
        assert_eq!(def.missing_column(&required), Some("year"));
        assert_eq!(def.missing_column(&required[..1]), None);
    }

    #[test]
    fn widening_never_narrows() {
        let mut def = definition();
        let mut stats = BTreeMap::new();
        stats.insert("amount".to_string(), ColumnRange::new(0.0, 10.0));
        def.widen_ranges(&stats);
        stats.insert("amount".to_string(), ColumnRange::new(2.0, 5.0));
        def.widen_ranges(&stats);
        assert_eq!(def.column("amount").unwrap().range, ColumnRange::new(0.0, 10.0));
    }

    #[test]
    fn pre_condition_clears_full_data() {
        let def = definition().with_pre_condition(Condition::all(vec![
            crate::condition::Term::is_null("region"),
        ]));
        assert!(!def.sharing.full_data);
    }

    #[test]
    fn definition_roundtrips_through_json() {
        let mut def = definition().with_break_column("region");
        def.register(Consumer::new("dash", Principal::group("analysts")));
        def.mark_built(Utc::now(), true);
        let json = serde_json::to_string(&def).unwrap();
        let back: ArtifactDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
