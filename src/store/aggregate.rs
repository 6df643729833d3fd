use serde::{Deserialize, Serialize};

use crate::registry::SourceGroup;
use crate::types::{ProfileGroup, SafetySourceData, SafetySourceIssue, SeverityLevel, SourceId, UserId};

/// What the hub knows about one (source, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum EntryState {
    /// Nothing reported yet.
    Unknown,
    /// The source last reported a failure.
    Error,
    Data(SafetySourceData),
}

impl EntryState {
    pub fn severity(&self) -> SeverityLevel {
        match self {
            EntryState::Data(data) => data.severity(),
            EntryState::Unknown | EntryState::Error => SeverityLevel::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub source_id: SourceId,
    pub user_id: UserId,
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateGroup {
    pub id: String,
    pub title: Option<String>,
    pub entries: Vec<AggregateEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    pub source_id: SourceId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateIssue {
    pub source_id: SourceId,
    pub user_id: UserId,
    pub issue: SafetySourceIssue,
}

/// Merged read model for one profile group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateView {
    pub profile_group: ProfileGroup,
    pub overall_severity: SeverityLevel,
    pub groups: Vec<AggregateGroup>,
    /// Most severe first; entry order breaks ties.
    pub issues: Vec<AggregateIssue>,
    pub most_severe: Option<EntryRef>,
}

impl AggregateView {
    pub fn entries(&self) -> impl Iterator<Item = &AggregateEntry> {
        self.groups.iter().flat_map(|group| group.entries.iter())
    }

    pub fn entry(&self, source_id: &SourceId, user_id: UserId) -> Option<&AggregateEntry> {
        self.entries()
            .find(|entry| &entry.source_id == source_id && entry.user_id == user_id)
    }

    pub fn is_all_unknown(&self) -> bool {
        self.entries()
            .all(|entry| entry.state == EntryState::Unknown)
    }
}

/// Builds the view for `profile_group` by walking registry groups, then
/// sources, then member users, asking `lookup` for each pair.
pub(crate) fn compute<F>(
    source_groups: &[SourceGroup],
    profile_group: &ProfileGroup,
    mut lookup: F,
) -> AggregateView
where
    F: FnMut(&SourceId, UserId) -> EntryState,
{
    let mut groups = Vec::with_capacity(source_groups.len());
    let mut overall_severity = SeverityLevel::Unknown;
    let mut most_severe: Option<EntryRef> = None;
    let mut issues = Vec::new();

    for source_group in source_groups {
        let mut entries = Vec::new();
        for source in &source_group.sources {
            for user_id in profile_group.members() {
                let state = lookup(&source.id, user_id);
                let severity = state.severity();
                if severity > overall_severity {
                    overall_severity = severity;
                    most_severe = Some(EntryRef {
                        source_id: source.id.clone(),
                        user_id,
                    });
                }
                if let EntryState::Data(data) = &state {
                    issues.extend(data.issues.iter().map(|issue| AggregateIssue {
                        source_id: source.id.clone(),
                        user_id,
                        issue: issue.clone(),
                    }));
                }
                entries.push(AggregateEntry {
                    source_id: source.id.clone(),
                    user_id,
                    state,
                });
            }
        }
        groups.push(AggregateGroup {
            id: source_group.id.clone(),
            title: source_group.title.clone(),
            entries,
        });
    }

    // stable: equal severities keep entry order
    issues.sort_by(|a, b| b.issue.severity.cmp(&a.issue.severity));

    AggregateView {
        profile_group: profile_group.clone(),
        overall_severity,
        groups,
        issues,
        most_severe,
    }
}
