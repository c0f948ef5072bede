//! Registrar configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::AddressScope;

/// Default number of unreachability reports before an element is removed
pub const DEFAULT_MAX_BAD_PE_REPORTS: u32 = 3;

/// Default interval between keepalives sent to registered elements
pub const DEFAULT_ENDPOINT_KEEP_ALIVE_TRANSMISSION_MILLIS: u64 = 5_000;

/// Default time to wait for a keepalive acknowledgement
pub const DEFAULT_ENDPOINT_KEEP_ALIVE_TIMEOUT_MILLIS: u64 = 5_000;

/// Default number of elements returned by a handle resolution
pub const DEFAULT_MAX_HANDLE_RESOLUTION_ITEMS: usize = 3;

/// Default maximum number of elements in one handle table response
pub const DEFAULT_MAX_ELEMENTS_PER_HANDLE_TABLE_REQUEST: usize = 128;

/// Default interval between peer presence messages
pub const DEFAULT_PEER_HEARTBEAT_CYCLE_MICROS: u64 = 2_444_444;

/// Default time after which a silent peer is probed
pub const DEFAULT_PEER_MAX_TIME_LAST_HEARD_MILLIS: u64 = 5_000;

/// Default time to wait for a probed peer to respond
pub const DEFAULT_PEER_MAX_TIME_NO_RESPONSE_MILLIS: u64 = 5_000;

/// Default lifetime of a takeover process
pub const DEFAULT_TAKEOVER_EXPIRY_MILLIS: u64 = 5_000;

/// Default granularity for measured distances
pub const DEFAULT_DISTANCE_STEP: u32 = 50;

/// Configuration for a registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Own registrar identifier, `0` picks a random non-zero one at startup
    pub registrar_identifier: u32,
    /// Unreachability reports needed to remove an element
    pub max_bad_pe_reports: u32,
    /// Interval between keepalives to owned elements
    pub endpoint_keep_alive_transmission_interval: Duration,
    /// Time to wait for a keepalive acknowledgement before dropping an element
    pub endpoint_keep_alive_timeout_interval: Duration,
    /// Maximum policy state updates per selection, `0` uses the policy's default
    pub max_increment: usize,
    /// Elements returned by handle resolution when the request does not ask for a count
    pub max_handle_resolution_items: usize,
    /// Maximum number of elements in one handle table response
    pub max_elements_per_handle_table_request: usize,
    /// Interval between peer presence messages
    pub peer_heartbeat_cycle: Duration,
    /// Time after which a silent peer is probed
    pub peer_max_time_last_heard: Duration,
    /// Time to wait for a probed peer before taking over its elements
    pub peer_max_time_no_response: Duration,
    /// Lifetime of a takeover process
    pub takeover_expiry_interval: Duration,
    /// Granularity measured distances are rounded to
    pub distance_step: u32,
    /// Narrowest address scope accepted in element transports
    pub min_endpoint_address_scope: AddressScope,
    /// Seed for randomized policies and identifier generation, `None` seeds from the OS
    pub selection_seed: Option<u64>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            registrar_identifier: 0,
            max_bad_pe_reports: DEFAULT_MAX_BAD_PE_REPORTS,
            endpoint_keep_alive_transmission_interval: Duration::from_millis(
                DEFAULT_ENDPOINT_KEEP_ALIVE_TRANSMISSION_MILLIS,
            ),
            endpoint_keep_alive_timeout_interval: Duration::from_millis(
                DEFAULT_ENDPOINT_KEEP_ALIVE_TIMEOUT_MILLIS,
            ),
            max_increment: 0,
            max_handle_resolution_items: DEFAULT_MAX_HANDLE_RESOLUTION_ITEMS,
            max_elements_per_handle_table_request: DEFAULT_MAX_ELEMENTS_PER_HANDLE_TABLE_REQUEST,
            peer_heartbeat_cycle: Duration::from_micros(DEFAULT_PEER_HEARTBEAT_CYCLE_MICROS),
            peer_max_time_last_heard: Duration::from_millis(
                DEFAULT_PEER_MAX_TIME_LAST_HEARD_MILLIS,
            ),
            peer_max_time_no_response: Duration::from_millis(
                DEFAULT_PEER_MAX_TIME_NO_RESPONSE_MILLIS,
            ),
            takeover_expiry_interval: Duration::from_millis(DEFAULT_TAKEOVER_EXPIRY_MILLIS),
            distance_step: DEFAULT_DISTANCE_STEP,
            min_endpoint_address_scope: AddressScope::Loopback,
            selection_seed: None,
        }
    }
}

impl RegistrarConfig {
    /// Creates a default configuration with the given own identifier.
    pub fn with_identifier(registrar_identifier: u32) -> Self {
        RegistrarConfig {
            registrar_identifier,
            ..Default::default()
        }
    }

    /// Rounds a measured distance to the configured step.
    pub fn round_distance(&self, distance: u32) -> u32 {
        if self.distance_step == 0 {
            return distance;
        }
        let step = f64::from(self.distance_step);
        let rounded = (f64::from(distance) / step).round_ties_even() * step;
        rounded.min(f64::from(u32::MAX)) as u32
    }
}

/// Converts a duration to the microsecond timestamps used by the handlespace.
pub(crate) fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
