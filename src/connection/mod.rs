//! Connection lifecycle and encryption state machine shared by all link
//! types (§4.5-§4.8).
pub mod bredr;
pub mod le;
pub mod sco;

use crate::address::DeviceAddress;
use crate::acl_data_channel::AclDataChannel;
use crate::error::{HciError, Result};
use crate::handle::{ConnectionHandle, LinkType};

pub use bredr::{BrEdrConnection, LinkKey, LinkKeyType};
pub use le::{LeConnectionParameters, LowEnergyConnection};
pub use sco::ScoConnection;

/// Link encryption only ever moves `Off -> Pending -> On`, or back to `Off`
/// on failure/disconnect; there is no direct `Off -> On` transition (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    Off,
    Pending,
    On,
}

impl EncryptionState {
    pub fn begin(&mut self) -> Result<()> {
        match self {
            EncryptionState::Off => {
                *self = EncryptionState::Pending;
                Ok(())
            }
            _ => Err(HciError::invalid("encryption already pending or established")),
        }
    }

    pub fn complete(&mut self, success: bool) {
        *self = match (success, *self) {
            (true, EncryptionState::Pending) => EncryptionState::On,
            _ => EncryptionState::Off,
        };
    }

    pub fn reset(&mut self) {
        *self = EncryptionState::Off;
    }
}

/// Common trait every connection variant implements, regardless of whether
/// it carries ACL data (BR/EDR, LE) or not (SCO) (§4.5).
pub trait Connection: Send {
    fn handle(&self) -> ConnectionHandle;
    fn link_type(&self) -> LinkType;
    fn peer_address(&self) -> DeviceAddress;
    fn encryption_state(&self) -> EncryptionState;
}

/// Fields shared by the two ACL-bearing connection kinds: the handle, the
/// peer address, a reference to the data channel for tearing the link down,
/// and the encryption state machine (§4.5).
pub struct AclShared {
    pub(crate) handle: ConnectionHandle,
    pub(crate) peer_address: DeviceAddress,
    pub(crate) acl_channel: AclDataChannel,
    pub(crate) encryption: EncryptionState,
}

impl AclShared {
    pub fn new(handle: ConnectionHandle, peer_address: DeviceAddress, acl_channel: AclDataChannel) -> Self {
        AclShared {
            handle,
            peer_address,
            acl_channel,
            encryption: EncryptionState::Off,
        }
    }
}

impl Drop for AclShared {
    fn drop(&mut self) {
        self.acl_channel.unregister_link(self.handle);
    }
}
