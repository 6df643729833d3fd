use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a safety source, unique within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        SourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        SourceId::new(value)
    }
}

/// OS-level user or profile id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primary user plus its secondary profiles.
///
/// Equality is by primary and the set of secondaries; iteration order is
/// the primary first, then secondaries ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileGroup {
    primary: UserId,
    secondaries: BTreeSet<UserId>,
}

impl ProfileGroup {
    pub fn new(primary: UserId, secondaries: impl IntoIterator<Item = UserId>) -> Self {
        let secondaries = secondaries
            .into_iter()
            .filter(|user| *user != primary)
            .collect();
        ProfileGroup {
            primary,
            secondaries,
        }
    }

    pub fn single(primary: UserId) -> Self {
        ProfileGroup::new(primary, std::iter::empty())
    }

    pub fn primary(&self) -> UserId {
        self.primary
    }

    pub fn secondaries(&self) -> impl Iterator<Item = UserId> + '_ {
        self.secondaries.iter().copied()
    }

    pub fn members(&self) -> impl Iterator<Item = UserId> + '_ {
        std::iter::once(self.primary).chain(self.secondaries.iter().copied())
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.primary == user || self.secondaries.contains(&user)
    }
}

/// Severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    #[default]
    Unknown,
    Ok,
    Recommendation,
    CriticalWarning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySourceStatus {
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySourceIssue {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub severity: SeverityLevel,
}

/// Payload reported by a source. The hub only looks at severities.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafetySourceData {
    pub status: Option<SafetySourceStatus>,
    #[serde(default)]
    pub issues: Vec<SafetySourceIssue>,
}

impl SafetySourceData {
    pub fn with_status(title: &str, summary: &str, severity: SeverityLevel) -> Self {
        SafetySourceData {
            status: Some(SafetySourceStatus {
                title: title.to_string(),
                summary: summary.to_string(),
                severity,
                enabled: true,
            }),
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, issue: SafetySourceIssue) -> Self {
        self.issues.push(issue);
        self
    }

    /// Highest severity among the status and all issues.
    pub fn severity(&self) -> SeverityLevel {
        let status = self
            .status
            .as_ref()
            .map(|status| status.severity)
            .unwrap_or_default();
        self.issues
            .iter()
            .map(|issue| issue.severity)
            .fold(status, SeverityLevel::max)
    }
}
