//! Station-wide status shared by the tasks.
//!
//! These are the flags the tasks coordinate through besides the dispatcher:
//! connection state, time state, the sticky storage error and a few counters
//! reported by the `status` RPC.

use crate::clock::TimeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub time_provider: TimeProvider,
    /// Wall-clock second of the last network time sync.
    pub last_sync: Option<u32>,
    /// A network time sync is due.
    pub do_ntp_sync: bool,
    pub is_client_connected: bool,
    pub is_client_udp_socket_open: bool,
    /// The next sample instant has been computed from the current clock.
    pub is_time_for_sensors_reading_updated: bool,
    /// Set on any log store failure, cleared once the store reports ready or
    /// on an explicit `storage_recover` request.
    pub storage_error: bool,
    pub readings_saved: u32,
    pub readings_missing: u32,
    pub records_published: u32,
    pub publish_failures: u32,
    pub rpc_requests: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub const fn new() -> Self {
        Self {
            time_provider: TimeProvider::Unset,
            last_sync: None,
            do_ntp_sync: true,
            is_client_connected: false,
            is_client_udp_socket_open: false,
            is_time_for_sensors_reading_updated: false,
            storage_error: false,
            readings_saved: 0,
            readings_missing: 0,
            records_published: 0,
            publish_failures: 0,
            rpc_requests: 0,
        }
    }
}
