//! NTP-based clock synchronization and a relay serving the synced clock.

pub mod clock;
pub mod ntp;
pub mod relay;
pub mod service;

pub use clock::SyncedClock;
pub use relay::{RelayAddrs, TimeRelay, TimeRelayConfig};
pub use service::{
    TimeSyncConfig, TimeSyncError, TimeSyncEvent, TimeSyncService, TimeSyncTransport,
};
