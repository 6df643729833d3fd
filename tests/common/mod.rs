#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use safety_hub::{
    AggregateView, BroadcastTarget, DataChangedListener, DeliveryError, DispatchError, HubConfig,
    InMemoryTopology, RefreshDispatcher, RefreshRequest, SafetyHub, SafetySourceData, SeverityLevel,
    SourceDescriptor, SourceGroup, UserId,
};

pub const PKG: &str = "com.example.settings";
pub const SCANNER_PKG: &str = "com.example.scanner";

#[derive(Default)]
pub struct RecordingListener {
    views: Mutex<Vec<AggregateView>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<AggregateView> {
        self.views.lock().expect("views").clone()
    }

    pub fn count(&self) -> usize {
        self.views.lock().expect("views").len()
    }

    pub fn last(&self) -> Option<AggregateView> {
        self.views.lock().expect("views").last().cloned()
    }
}

impl DataChangedListener for RecordingListener {
    fn on_data_changed(&self, view: &AggregateView) -> Result<(), DeliveryError> {
        self.views.lock().expect("views").push(view.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<RefreshRequest>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<RefreshRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl RefreshDispatcher for RecordingDispatcher {
    fn send_refresh_request(&self, request: &RefreshRequest) -> Result<(), DispatchError> {
        self.requests.lock().expect("requests").push(request.clone());
        Ok(())
    }
}

/// `A` dynamic, `B` static, `C` dynamic owned by the scanner package.
pub fn sample_groups() -> Vec<SourceGroup> {
    vec![
        SourceGroup::new(
            "device",
            vec![
                SourceDescriptor::new_dynamic("A", BroadcastTarget::new(PKG, ".AReceiver")),
                SourceDescriptor::new_static("B"),
            ],
        ),
        SourceGroup::new(
            "apps",
            vec![SourceDescriptor::new_dynamic(
                "C",
                BroadcastTarget::new(SCANNER_PKG, ".CReceiver"),
            )],
        ),
    ]
}

pub struct HubFixture {
    pub hub: Arc<SafetyHub>,
    pub topology: Arc<InMemoryTopology>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

impl HubFixture {
    /// Users 0 and 5 exist; 10 is a secondary profile of 0.
    pub fn new(config: HubConfig) -> Self {
        let topology = Arc::new(InMemoryTopology::new());
        topology.add_user(UserId(0));
        topology.add_user(UserId(5));
        topology.add_profile(UserId(0), UserId(10));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let hub = SafetyHub::from_config(&config, topology.clone(), dispatcher.clone())
            .expect("hub should start");
        HubFixture {
            hub,
            topology,
            dispatcher,
        }
    }

    pub fn with_sample_sources() -> Self {
        Self::new(HubConfig::with_groups(sample_groups()))
    }
}

pub fn payload(title: &str, severity: SeverityLevel) -> SafetySourceData {
    SafetySourceData::with_status(title, "summary", severity)
}

/// Polls `check` until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
