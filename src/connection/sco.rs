//! SCO connection: no ACL data, no encryption, but the controller's packet
//! count for the link must still be cleared when it goes away (§4.8, §9).
use crate::address::DeviceAddress;
use crate::handle::{ConnectionHandle, LinkType};

use super::{Connection, EncryptionState};

/// A voice link. Unlike `BrEdrConnection`/`LowEnergyConnection` it never
/// carries ACL data and never encrypts, so it has no `AclShared`.
///
/// Resolved open question (§9): the destructor clears the controller's
/// packet count for the handle, the same as an explicit disconnect would,
/// so a dropped handle never leaves stale credit accounting behind.
pub struct ScoConnection {
    handle: ConnectionHandle,
    peer_address: DeviceAddress,
    on_drop: Option<Box<dyn FnOnce(ConnectionHandle) + Send>>,
}

impl ScoConnection {
    pub fn new<F>(handle: ConnectionHandle, peer_address: DeviceAddress, clear_packet_count: F) -> Self
    where
        F: FnOnce(ConnectionHandle) + Send + 'static,
    {
        ScoConnection {
            handle,
            peer_address,
            on_drop: Some(Box::new(clear_packet_count)),
        }
    }
}

impl Connection for ScoConnection {
    fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    fn link_type(&self) -> LinkType {
        LinkType::Sco
    }

    fn peer_address(&self) -> DeviceAddress {
        self.peer_address
    }

    fn encryption_state(&self) -> EncryptionState {
        EncryptionState::Off
    }
}

impl Drop for ScoConnection {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn drop_clears_packet_count() {
        let cleared = Arc::new(AtomicBool::new(false));
        let cleared2 = cleared.clone();
        let handle = ConnectionHandle::new(9);
        {
            let _conn = ScoConnection::new(handle, DeviceAddress::new(AddressType::BrEdr, [3; 6]), move |h| {
                assert_eq!(h, handle);
                cleared2.store(true, Ordering::SeqCst);
            });
            assert!(!cleared.load(Ordering::SeqCst));
        }
        assert!(cleared.load(Ordering::SeqCst));
    }

    #[test]
    fn never_encrypts() {
        let conn = ScoConnection::new(ConnectionHandle::new(1), DeviceAddress::new(AddressType::BrEdr, [0; 6]), |_| {});
        assert_eq!(conn.encryption_state(), EncryptionState::Off);
    }
}
