//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use crate::error::DeliveryError;
use crate::listeners::DataChangedListener;
use crate::registry::{BroadcastTarget, SourceDescriptor, SourceGroup, StaticSourceRegistry};
use crate::store::AggregateView;
use crate::types::{ProfileGroup, SafetySourceData, SeverityLevel, UserId};

pub const PKG: &str = "com.example.settings";

#[derive(Default)]
pub struct RecordingListener {
    views: Mutex<Vec<AggregateView>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<AggregateView> {
        self.views.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.views.lock().unwrap().len()
    }
}

impl DataChangedListener for RecordingListener {
    fn on_data_changed(&self, view: &AggregateView) -> Result<(), DeliveryError> {
        self.views.lock().unwrap().push(view.clone());
        Ok(())
    }
}

pub struct DeadListener;

impl DataChangedListener for DeadListener {
    fn on_data_changed(&self, _view: &AggregateView) -> Result<(), DeliveryError> {
        Err(DeliveryError("endpoint is gone".into()))
    }
}

/// `A` dynamic (page-open), `B` static, `C` dynamic.
pub fn sample_registry() -> StaticSourceRegistry {
    StaticSourceRegistry::new(vec![
        SourceGroup::new(
            "device",
            vec![
                SourceDescriptor::new_dynamic("A", BroadcastTarget::new(PKG, ".AReceiver"))
                    .refreshed_on_page_open(),
                SourceDescriptor::new_static("B"),
            ],
        ),
        SourceGroup::new(
            "apps",
            vec![SourceDescriptor::new_dynamic(
                "C",
                BroadcastTarget::new("com.example.scanner", ".CReceiver"),
            )],
        ),
    ])
    .unwrap()
}

pub fn ok_data(title: &str) -> SafetySourceData {
    SafetySourceData::with_status(title, "all good", SeverityLevel::Ok)
}

pub fn empty_view(group: &ProfileGroup) -> AggregateView {
    AggregateView {
        profile_group: group.clone(),
        overall_severity: SeverityLevel::Unknown,
        groups: Vec::new(),
        issues: Vec::new(),
        most_severe: None,
    }
}

pub fn group_of(primary: u32, secondaries: &[u32]) -> ProfileGroup {
    ProfileGroup::new(UserId(primary), secondaries.iter().copied().map(UserId))
}
