//! Extended advertising: one advertising set per allocated handle, tracked
//! through an `AdvertisingHandleMap` (§4.9).
use crate::address::DeviceAddress;
use crate::command_channel::CommandChannel;
use crate::error::{HciError, Result};
use crate::handle::ConnectionHandle;
use crate::opcode::OpCode;
use crate::packet::{CommandPacket, EventCode};

use super::{Advertiser, AdvertisingHandle, AdvertisingHandleMap, AdvertisingParameters};

const OGF_LE: u8 = 0x08;
const OCF_SET_EXT_ADV_PARAMS: u16 = 0x0036;
const OCF_SET_EXT_ADV_DATA: u16 = 0x0037;
const OCF_SET_EXT_SCAN_RESPONSE_DATA: u16 = 0x0038;
const OCF_SET_EXT_ADV_ENABLE: u16 = 0x0039;
const OCF_REMOVE_ADV_SET: u16 = 0x003c;

pub struct ExtendedAdvertiser {
    channel: CommandChannel,
    handles: AdvertisingHandleMap,
    active: std::collections::HashSet<AdvertisingHandle>,
}

impl ExtendedAdvertiser {
    pub fn new(channel: CommandChannel, capacity: usize) -> Self {
        ExtendedAdvertiser {
            channel,
            handles: AdvertisingHandleMap::new(capacity),
            active: std::collections::HashSet::new(),
        }
    }

    async fn run(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut packet = CommandPacket::new(opcode, payload.len())?;
        packet.payload_mut().copy_from_slice(payload);
        let (_id, fut) = self.channel.send(packet, EventCode::CommandComplete);
        fut.await?;
        Ok(())
    }

    async fn enable(&self, handle: AdvertisingHandle, enable: bool) -> Result<()> {
        // num_sets(1) + [handle(1) duration(2) max_events(1)] * num_sets
        self.run(OpCode::new(OGF_LE, OCF_SET_EXT_ADV_ENABLE), &[enable as u8, 0x01, handle.0, 0x00, 0x00, 0x00]).await
    }

    async fn remove_set(&self, handle: AdvertisingHandle) -> Result<()> {
        self.run(OpCode::new(OGF_LE, OCF_REMOVE_ADV_SET), &[handle.0]).await
    }

    pub fn is_advertising(&self, address: &DeviceAddress) -> bool {
        self.handles.get_handle(address).map(|h| self.active.contains(&h)).unwrap_or(false)
    }
}

impl Advertiser for ExtendedAdvertiser {
    /// Allocates (or reuses) a handle for `params.own_address`, then runs the
    /// parameters/data/scan-response/enable sequence. Any failure after the
    /// handle was freshly allocated frees it again so a failed start leaves
    /// no trace in the handle map (§4.9).
    async fn start_advertising(&mut self, params: AdvertisingParameters) -> Result<()> {
        let already_mapped = self.handles.get_handle(&params.own_address).is_some();
        if let Some(handle) = self.handles.get_handle(&params.own_address) {
            if self.active.contains(&handle) {
                return Err(HciError::invalid("cannot change advertised address while advertising"));
            }
        }

        let handle = self
            .handles
            .map_handle(params.own_address)
            .ok_or_else(|| HciError::invalid("advertising handle map is full"))?;

        let rollback = |this: &mut Self| {
            if !already_mapped {
                this.handles.remove_handle(handle);
            }
        };

        let mut param_bytes = vec![0u8; 13];
        param_bytes[0] = handle.0;
        param_bytes[1..3].copy_from_slice(&params.interval_min.to_le_bytes());
        param_bytes[3..5].copy_from_slice(&params.interval_max.to_le_bytes());
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_EXT_ADV_PARAMS), &param_bytes).await {
            rollback(self);
            return Err(e);
        }

        let mut data = vec![0u8; 3 + params.data.len().min(251)];
        data[0] = handle.0;
        data[1] = 0x03; // operation: complete extended advertising data, unfragmented
        let n = params.data.len().min(251);
        data[2] = n as u8;
        data[3..3 + n].copy_from_slice(&params.data[..n]);
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_EXT_ADV_DATA), &data).await {
            rollback(self);
            return Err(e);
        }

        if let Some(scan_response) = &params.scan_response {
            let n = scan_response.len().min(251);
            let mut sr = vec![0u8; 3 + n];
            sr[0] = handle.0;
            sr[1] = 0x03;
            sr[2] = n as u8;
            sr[3..3 + n].copy_from_slice(&scan_response[..n]);
            if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_EXT_SCAN_RESPONSE_DATA), &sr).await {
                rollback(self);
                return Err(e);
            }
        }

        if let Err(e) = self.enable(handle, true).await {
            rollback(self);
            return Err(e);
        }

        self.active.insert(handle);
        Ok(())
    }

    async fn stop_advertising(&mut self, address: DeviceAddress) -> Result<()> {
        let handle = self.handles.get_handle(&address).ok_or_else(|| HciError::invalid("address has no advertising set"))?;
        self.enable(handle, false).await?;
        self.remove_set(handle).await?;
        self.active.remove(&handle);
        self.handles.remove_handle(handle);
        Ok(())
    }

    fn on_incoming_connection(&mut self, address: DeviceAddress, _handle: ConnectionHandle) {
        if let Some(h) = self.handles.get_handle(&address) {
            self.active.remove(&h);
        }
    }
}
