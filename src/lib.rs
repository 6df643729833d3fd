mod config;
mod error;
mod hub;
mod listeners;
mod profiles;
mod refresh;
mod registry;
mod store;
mod telemetry;
mod types;

#[cfg(test)]
mod test_support;

pub use config::{HubConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG, REFRESH_TIMEOUT_ENV};
pub use error::{DeliveryError, DispatchError, HubError, Result};
pub use hub::{HubDump, SafetyHub};
pub use listeners::{DataChangedListener, ListenerHandle, ListenerKey};
pub use profiles::{InMemoryTopology, ProfileTopology, UserProfileResolver};
pub use refresh::{
    OperationId, RefreshDispatcher, RefreshOutcome, RefreshPhase, RefreshReason, RefreshRequest,
    RefreshStatus, RefreshTicket,
};
pub use registry::{
    BroadcastTarget, SourceDescriptor, SourceGroup, SourceKind, SourceRegistry, StaticSourceRegistry,
};
pub use store::{
    AggregateEntry, AggregateGroup, AggregateIssue, AggregateView, EntryRef, EntryState, SourceSnapshot,
};
pub use telemetry::TelemetrySnapshot;
pub use types::{
    ProfileGroup, SafetySourceData, SafetySourceIssue, SafetySourceStatus, SeverityLevel, SourceId, UserId,
};
