//! Bijective `DeviceAddress <-> AdvertisingHandle` allocator (§3, §4.9).
use std::collections::HashMap;

use crate::address::DeviceAddress;

pub const MAX_ADVERTISING_HANDLE: u8 = 0xef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisingHandle(pub u8);

pub struct AdvertisingHandleMap {
    addr_to_handle: HashMap<DeviceAddress, AdvertisingHandle>,
    handle_to_addr: HashMap<AdvertisingHandle, DeviceAddress>,
    capacity: usize,
    last_handle: u8,
}

impl AdvertisingHandleMap {
    /// `capacity` must be `<= MAX_ADVERTISING_HANDLE + 1` (§4.9); larger
    /// requests are clamped since the handle is a single byte on the wire.
    pub fn new(capacity: usize) -> Self {
        AdvertisingHandleMap {
            addr_to_handle: HashMap::new(),
            handle_to_addr: HashMap::new(),
            capacity: capacity.min(MAX_ADVERTISING_HANDLE as usize + 1),
            last_handle: MAX_ADVERTISING_HANDLE,
        }
    }

    pub fn size(&self) -> usize {
        self.addr_to_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addr_to_handle.is_empty()
    }

    pub fn get_handle(&self, addr: &DeviceAddress) -> Option<AdvertisingHandle> {
        self.addr_to_handle.get(addr).copied()
    }

    pub fn get_address(&self, handle: AdvertisingHandle) -> Option<DeviceAddress> {
        self.handle_to_addr.get(&handle).copied()
    }

    /// Scans from `last_handle + 1 mod capacity` for the first free slot,
    /// without mutating state (§4.9: O(capacity) worst case, allocation-only).
    pub fn peek_next_handle(&self) -> Option<AdvertisingHandle> {
        if self.addr_to_handle.len() >= self.capacity || self.capacity == 0 {
            return None;
        }
        for i in 0..self.capacity {
            let candidate = (self.last_handle as usize + 1 + i) % self.capacity;
            let candidate = AdvertisingHandle(candidate as u8);
            if !self.handle_to_addr.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Inserts `addr` if absent (allocating a fresh handle), otherwise returns
    /// its existing handle -- `map_handle` is idempotent for a given address
    /// until it is removed (§3, §4.9). Fails with `None` only when the map is
    /// full and `addr` was not already present.
    pub fn map_handle(&mut self, addr: DeviceAddress) -> Option<AdvertisingHandle> {
        if let Some(existing) = self.addr_to_handle.get(&addr) {
            return Some(*existing);
        }
        let handle = self.peek_next_handle()?;
        self.addr_to_handle.insert(addr, handle);
        self.handle_to_addr.insert(handle, addr);
        self.last_handle = handle.0;
        Some(handle)
    }

    pub fn remove_handle(&mut self, handle: AdvertisingHandle) {
        if let Some(addr) = self.handle_to_addr.remove(&handle) {
            self.addr_to_handle.remove(&addr);
        }
    }

    pub fn remove_address(&mut self, addr: &DeviceAddress) {
        if let Some(handle) = self.addr_to_handle.remove(addr) {
            self.handle_to_addr.remove(&handle);
        }
    }

    pub fn clear(&mut self) {
        self.addr_to_handle.clear();
        self.handle_to_addr.clear();
    }

    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        self.addr_to_handle.len() == self.handle_to_addr.len()
            && self.addr_to_handle.iter().all(|(addr, handle)| self.handle_to_addr.get(handle) == Some(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressType;

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new(AddressType::LePublic, [0, 0, 0, 0, 0, last])
    }

    #[test]
    fn bounded_capacity_rejects_overflow() {
        let mut map = AdvertisingHandleMap::new(2);
        assert!(map.map_handle(addr(0)).is_some());
        assert!(map.map_handle(addr(1)).is_some());
        assert!(map.map_handle(addr(2)).is_none());
        assert_eq!(map.size(), 2);
        assert!(map.invariant_holds());
    }

    #[test]
    fn handle_reuse_after_removal() {
        let mut map = AdvertisingHandleMap::new(2);
        let h0 = map.map_handle(addr(0)).unwrap();
        let h1 = map.map_handle(addr(1)).unwrap();
        assert_ne!(h0, h1);
        map.remove_handle(h0);
        let reused = map.map_handle(addr(2)).unwrap();
        assert_eq!(reused, h0);
        assert!(map.invariant_holds());
    }

    #[test]
    fn map_handle_is_idempotent() {
        let mut map = AdvertisingHandleMap::new(4);
        let a = addr(9);
        let h1 = map.map_handle(a).unwrap();
        let h2 = map.map_handle(a).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn get_address_round_trips_map_handle() {
        let mut map = AdvertisingHandleMap::new(4);
        let a = addr(3);
        let h = map.map_handle(a).unwrap();
        assert_eq!(map.get_address(h), Some(a));
    }

    #[test]
    fn remove_address_frees_the_handle() {
        let mut map = AdvertisingHandleMap::new(1);
        let a = addr(1);
        map.map_handle(a).unwrap();
        map.remove_address(&a);
        assert!(map.is_empty());
        assert!(map.map_handle(addr(2)).is_some());
    }

    #[test]
    fn clear_empties_both_directions() {
        let mut map = AdvertisingHandleMap::new(4);
        map.map_handle(addr(1)).unwrap();
        map.map_handle(addr(2)).unwrap();
        map.clear();
        assert!(map.is_empty());
        assert!(map.invariant_holds());
    }
}
