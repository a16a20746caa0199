//! Advertiser abstraction shared by the legacy and extended HCI advertising
//! command sets (§4.9).
pub mod extended;
pub mod handle_map;
pub mod legacy;

pub use extended::ExtendedAdvertiser;
pub use handle_map::{AdvertisingHandle, AdvertisingHandleMap, MAX_ADVERTISING_HANDLE};
pub use legacy::LegacyAdvertiser;

use crate::address::DeviceAddress;
use crate::error::Result;
use crate::handle::ConnectionHandle;

#[derive(Debug, Clone)]
pub struct AdvertisingParameters {
    pub interval_min: u16,
    pub interval_max: u16,
    pub own_address: DeviceAddress,
    pub data: Vec<u8>,
    pub scan_response: Option<Vec<u8>>,
}

/// Common surface both advertiser variants expose to upper layers (§4.9).
/// `async_trait`-free on purpose: the underlying command round trips are
/// exposed as a single `Result`-returning async fn per operation, matching
/// how `CommandChannel::send` already composes.
#[allow(async_fn_in_trait)]
pub trait Advertiser {
    /// Starts advertising. On any failure partway through the controller
    /// command sequence, already-issued steps are rolled back so the
    /// controller is left as if advertising was never requested (§4.9).
    async fn start_advertising(&mut self, params: AdvertisingParameters) -> Result<()>;

    async fn stop_advertising(&mut self, address: DeviceAddress) -> Result<()>;

    /// Called when the controller reports a new connection that resulted
    /// from one of our advertisements (§4.9).
    fn on_incoming_connection(&mut self, address: DeviceAddress, handle: ConnectionHandle);
}
