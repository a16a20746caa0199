//! Resolves which local address a procedure (advertising, scanning,
//! connecting) should use, and whether private-address generation needs to
//! run first (§4.9, §4.10).
use crate::address::DeviceAddress;
use crate::error::Result;

/// Implemented by the upper layer that owns private-address rotation policy.
/// The HCI core never generates addresses itself; it only asks for one
/// before starting a procedure that needs it (§4.9).
#[allow(async_fn_in_trait)]
pub trait LocalAddressDelegate: Send + Sync {
    /// Returns the address to use for a procedure that requires public
    /// identity (no rotation).
    async fn identity_address(&self) -> Result<DeviceAddress>;

    /// Returns the address to use for a procedure that should use a private
    /// (possibly freshly rotated) address.
    async fn ensure_local_address(&self) -> Result<DeviceAddress>;
}

/// A delegate that always returns the same fixed address; useful for tests
/// and for controllers that do not support LE privacy.
pub struct StaticAddressDelegate {
    address: DeviceAddress,
}

impl StaticAddressDelegate {
    pub fn new(address: DeviceAddress) -> Self {
        StaticAddressDelegate { address }
    }
}

impl LocalAddressDelegate for StaticAddressDelegate {
    async fn identity_address(&self) -> Result<DeviceAddress> {
        Ok(self.address)
    }

    async fn ensure_local_address(&self) -> Result<DeviceAddress> {
        Ok(self.address)
    }
}
