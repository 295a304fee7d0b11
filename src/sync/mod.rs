//! Offline support: connectivity tracking and the replay queue for mutating calls.
pub mod network;
pub mod queue;

pub use network::{ConnectivityChange, NetworkMonitor, SubscriptionId};
pub use queue::{
    ActionKind, FlushReport, OfflineActionQueue, PendingAction, QueueError, QueueResult,
    QueueStatus, SendMessagePayload, SkipReason,
};
