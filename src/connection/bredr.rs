//! BR/EDR ACL connection: link key storage and encryption key-size
//! enforcement (§4.6).
use crate::address::DeviceAddress;
use crate::error::{HciError, Result};
use crate::handle::{ConnectionHandle, LinkType};

use super::{AclShared, Connection, EncryptionState};

/// Minimum negotiated encryption key size, in bytes, the core will accept
/// (§4.6, §7): smaller keys are rejected rather than silently used, closing
/// off the classic BR/EDR key-size downgrade attack.
pub const MIN_ENCRYPTION_KEY_SIZE: u8 = 7;
const LINK_KEY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKey(pub [u8; LINK_KEY_SIZE]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKeyType {
    Combination,
    LocalUnit,
    RemoteUnit,
    DebugCombination,
    UnauthenticatedCombinationP192,
    AuthenticatedCombinationP192,
    ChangedCombination,
    UnauthenticatedCombinationP256,
    AuthenticatedCombinationP256,
}

pub struct BrEdrConnection {
    shared: AclShared,
    link_key: Option<(LinkKey, LinkKeyType)>,
    negotiated_key_size: Option<u8>,
}

impl BrEdrConnection {
    pub fn new(handle: ConnectionHandle, peer_address: DeviceAddress, acl_channel: crate::acl_data_channel::AclDataChannel) -> Self {
        BrEdrConnection {
            shared: AclShared::new(handle, peer_address, acl_channel),
            link_key: None,
            negotiated_key_size: None,
        }
    }

    pub fn set_link_key(&mut self, key: LinkKey, kind: LinkKeyType) {
        self.link_key = Some((key, kind));
    }

    pub fn link_key(&self) -> Option<(LinkKey, LinkKeyType)> {
        self.link_key
    }

    /// Called when the controller reports the negotiated encryption key size
    /// (`Read Encryption Key Size Complete`). Keys smaller than
    /// [`MIN_ENCRYPTION_KEY_SIZE`] fail the connection into
    /// `InsufficientSecurity` rather than being accepted (§4.6).
    pub fn validate_encryption_key_size(&mut self, size: u8) -> Result<()> {
        if size < MIN_ENCRYPTION_KEY_SIZE {
            self.shared.encryption.reset();
            return Err(HciError::InsufficientSecurity);
        }
        self.negotiated_key_size = Some(size);
        Ok(())
    }

    pub fn negotiated_key_size(&self) -> Option<u8> {
        self.negotiated_key_size
    }

    pub fn begin_encryption(&mut self) -> Result<()> {
        self.shared.encryption.begin()
    }

    pub fn complete_encryption(&mut self, success: bool) {
        self.shared.encryption.complete(success);
    }
}

impl Connection for BrEdrConnection {
    fn handle(&self) -> ConnectionHandle {
        self.shared.handle
    }

    fn link_type(&self) -> LinkType {
        LinkType::BrEdr
    }

    fn peer_address(&self) -> DeviceAddress {
        self.shared.peer_address
    }

    fn encryption_state(&self) -> EncryptionState {
        self.shared.encryption
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl_data_channel::{AclDataChannel, DataBufferInfo};
    use crate::address::AddressType;

    fn connection() -> BrEdrConnection {
        let (writer, _reader) = tokio::io::duplex(64);
        let acl = AclDataChannel::new(writer, DataBufferInfo { max_data_length: 64, max_num_packets: 4 }, DataBufferInfo::EMPTY);
        let handle = ConnectionHandle::new(1);
        acl.register_link(handle, LinkType::BrEdr).unwrap();
        BrEdrConnection::new(handle, DeviceAddress::new(AddressType::BrEdr, [1; 6]), acl)
    }

    #[tokio::test]
    async fn rejects_key_size_below_minimum() {
        let mut conn = connection();
        assert!(matches!(conn.validate_encryption_key_size(4), Err(HciError::InsufficientSecurity)));
        assert_eq!(conn.encryption_state(), EncryptionState::Off);
    }

    #[tokio::test]
    async fn accepts_key_size_at_minimum() {
        let mut conn = connection();
        assert!(conn.validate_encryption_key_size(MIN_ENCRYPTION_KEY_SIZE).is_ok());
        assert_eq!(conn.negotiated_key_size(), Some(MIN_ENCRYPTION_KEY_SIZE));
    }

    #[tokio::test]
    async fn encryption_state_machine_rejects_double_begin() {
        let mut conn = connection();
        conn.begin_encryption().unwrap();
        assert!(conn.begin_encryption().is_err());
        conn.complete_encryption(true);
        assert_eq!(conn.encryption_state(), EncryptionState::On);
    }
}
