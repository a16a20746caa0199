//! LE ACL connection: connection parameters and Long Term Key request
//! handling (§4.7).
use crate::acl_data_channel::AclDataChannel;
use crate::address::DeviceAddress;
use crate::error::{HciError, Result};
use crate::handle::{ConnectionHandle, LinkType};

use super::{AclShared, Connection, EncryptionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnectionParameters {
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

pub struct LowEnergyConnection {
    shared: AclShared,
    parameters: LeConnectionParameters,
    ltk: Option<[u8; 16]>,
    awaiting_ltk_request: bool,
}

impl LowEnergyConnection {
    pub fn new(handle: ConnectionHandle, peer_address: DeviceAddress, acl_channel: AclDataChannel, parameters: LeConnectionParameters) -> Self {
        LowEnergyConnection {
            shared: AclShared::new(handle, peer_address, acl_channel),
            parameters,
            ltk: None,
            awaiting_ltk_request: false,
        }
    }

    pub fn parameters(&self) -> LeConnectionParameters {
        self.parameters
    }

    pub fn update_parameters(&mut self, parameters: LeConnectionParameters) {
        self.parameters = parameters;
    }

    pub fn set_ltk(&mut self, ltk: [u8; 16]) {
        self.ltk = Some(ltk);
    }

    /// Starts encryption with the stored LTK (§4.7). Fails if no LTK has been
    /// bonded for this peer yet.
    pub fn begin_encryption(&mut self) -> Result<()> {
        if self.ltk.is_none() {
            return Err(HciError::invalid("no LTK bonded for this peer"));
        }
        self.shared.encryption.begin()
    }

    /// Records that the controller issued a `LE Long Term Key Request`
    /// subevent for this connection, awaiting the host's reply (§4.7).
    pub fn on_ltk_request(&mut self) -> Option<[u8; 16]> {
        self.awaiting_ltk_request = true;
        self.ltk
    }

    pub fn is_awaiting_ltk_request(&self) -> bool {
        self.awaiting_ltk_request
    }

    pub fn complete_encryption(&mut self, success: bool) {
        self.awaiting_ltk_request = false;
        self.shared.encryption.complete(success);
    }
}

impl Connection for LowEnergyConnection {
    fn handle(&self) -> ConnectionHandle {
        self.shared.handle
    }

    fn link_type(&self) -> LinkType {
        LinkType::LowEnergy
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
    use crate::acl_data_channel::DataBufferInfo;
    use crate::address::AddressType;

    fn connection() -> LowEnergyConnection {
        let (writer, _reader) = tokio::io::duplex(64);
        let acl = AclDataChannel::new(writer, DataBufferInfo::EMPTY, DataBufferInfo { max_data_length: 64, max_num_packets: 4 });
        let handle = ConnectionHandle::new(7);
        acl.register_link(handle, LinkType::LowEnergy).unwrap();
        let params = LeConnectionParameters {
            interval: 24,
            latency: 0,
            supervision_timeout: 200,
        };
        LowEnergyConnection::new(handle, DeviceAddress::new(AddressType::LeRandom, [2; 6]), acl, params)
    }

    #[tokio::test]
    async fn begin_encryption_without_ltk_fails() {
        let mut conn = connection();
        assert!(conn.begin_encryption().is_err());
    }

    #[tokio::test]
    async fn ltk_request_returns_bonded_key() {
        let mut conn = connection();
        conn.set_ltk([7; 16]);
        conn.begin_encryption().unwrap();
        let ltk = conn.on_ltk_request();
        assert_eq!(ltk, Some([7; 16]));
        assert!(conn.is_awaiting_ltk_request());
        conn.complete_encryption(true);
        assert_eq!(conn.encryption_state(), EncryptionState::On);
        assert!(!conn.is_awaiting_ltk_request());
    }
}
