//! Source registry: which safety sources exist, how they are grouped and
//! whether they can be refreshed.


use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{HubError, Result};
use crate::refresh::RefreshReason;
use crate::types::SourceId;

/// Where refresh requests for a dynamic source are sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastTarget {
    pub package: String,
    pub receiver: String,
}

impl BroadcastTarget {
    pub fn new(package: &str, receiver: &str) -> Self {
        BroadcastTarget {
            package: package.to_string(),
            receiver: receiver.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// Fixed entry; never asked to refresh.
    Static,
    Dynamic {
        target: BroadcastTarget,
        /// Page-open refreshes only reach sources that opt in.
        #[serde(default)]
        refresh_on_page_open: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: SourceId,
    pub kind: SourceKind,
}

impl SourceDescriptor {
    pub fn new_static(id: &str) -> Self {
        SourceDescriptor {
            id: SourceId::new(id),
            kind: SourceKind::Static,
        }
    }

    pub fn new_dynamic(id: &str, target: BroadcastTarget) -> Self {
        SourceDescriptor {
            id: SourceId::new(id),
            kind: SourceKind::Dynamic {
                target,
                refresh_on_page_open: false,
            },
        }
    }

    pub fn refreshed_on_page_open(mut self) -> Self {
        if let SourceKind::Dynamic {
            refresh_on_page_open,
            ..
        } = &mut self.kind
        {
            *refresh_on_page_open = true;
        }
        self
    }

    /// Broadcast target to use for `reason`, or `None` if this source is
    /// not refreshed for it.
    pub fn refresh_target(&self, reason: RefreshReason) -> Option<&BroadcastTarget> {
        match &self.kind {
            SourceKind::Static => None,
            SourceKind::Dynamic {
                target,
                refresh_on_page_open,
            } => {
                if reason == RefreshReason::PageOpen && !refresh_on_page_open {
                    None
                } else {
                    Some(target)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub sources: Vec<SourceDescriptor>,
}

impl SourceGroup {
    pub fn new(id: &str, sources: Vec<SourceDescriptor>) -> Self {
        SourceGroup {
            id: id.to_string(),
            title: None,
            sources,
        }
    }
}

/// Read access to the configured sources.
pub trait SourceRegistry: Send + Sync {
    /// All groups, in display order.
    fn groups(&self) -> Vec<SourceGroup>;

    fn descriptor(&self, id: &SourceId) -> Option<SourceDescriptor>;

    fn contains(&self, id: &SourceId) -> bool {
        self.descriptor(id).is_some()
    }
}

/// Registry backed by a fixed list of groups.
#[derive(Debug, Clone, Default)]
pub struct StaticSourceRegistry {
    groups: Vec<SourceGroup>,
    index: HashMap<SourceId, (usize, usize)>,
}

impl StaticSourceRegistry {
    pub fn new(groups: Vec<SourceGroup>) -> Result<Self> {
        let mut index = HashMap::new();
        for (group_pos, group) in groups.iter().enumerate() {
            for (source_pos, source) in group.sources.iter().enumerate() {
                if index
                    .insert(source.id.clone(), (group_pos, source_pos))
                    .is_some()
                {
                    return Err(HubError::DuplicateSource(source.id.clone()));
                }
            }
        }
        Ok(StaticSourceRegistry { groups, index })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl SourceRegistry for StaticSourceRegistry {
    fn groups(&self) -> Vec<SourceGroup> {
        self.groups.clone()
    }

    fn descriptor(&self, id: &SourceId) -> Option<SourceDescriptor> {
        self.index
            .get(id)
            .map(|&(group, source)| self.groups[group].sources[source].clone())
    }
}
