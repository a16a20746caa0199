//! Legacy advertising: one global advertising state shared by the whole
//! controller, no handle map (§4.9).
use crate::address::DeviceAddress;
use crate::command_channel::CommandChannel;
use crate::error::{HciError, Result};
use crate::handle::ConnectionHandle;
use crate::opcode::OpCode;
use crate::packet::{CommandPacket, EventCode};

use super::{Advertiser, AdvertisingParameters};

const OGF_LE: u8 = 0x08;
const OCF_SET_ADV_PARAMS: u16 = 0x0006;
const OCF_SET_ADV_DATA: u16 = 0x0008;
const OCF_SET_SCAN_RESPONSE_DATA: u16 = 0x0009;
const OCF_SET_ADV_ENABLE: u16 = 0x000a;

pub struct LegacyAdvertiser {
    channel: CommandChannel,
    active_address: Option<DeviceAddress>,
}

impl LegacyAdvertiser {
    pub fn new(channel: CommandChannel) -> Self {
        LegacyAdvertiser {
            channel,
            active_address: None,
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.active_address.is_some()
    }

    async fn run(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        let mut packet = CommandPacket::new(opcode, payload.len())?;
        packet.payload_mut().copy_from_slice(payload);
        let (_id, fut) = self.channel.send(packet, EventCode::CommandComplete);
        fut.await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.run(OpCode::new(OGF_LE, OCF_SET_ADV_ENABLE), &[0x00]).await
    }
}

impl Advertiser for LegacyAdvertiser {
    /// Rejects changing the random address of an already-active
    /// advertisement; the caller must stop advertising first (§4.9, §9).
    async fn start_advertising(&mut self, params: AdvertisingParameters) -> Result<()> {
        if let Some(active) = self.active_address {
            if active != params.own_address {
                return Err(HciError::invalid("cannot change advertised address while advertising"));
            }
        }

        let mut param_bytes = vec![0u8; 15];
        param_bytes[0..2].copy_from_slice(&params.interval_min.to_le_bytes());
        param_bytes[2..4].copy_from_slice(&params.interval_max.to_le_bytes());
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_ADV_PARAMS), &param_bytes).await {
            return Err(e);
        }

        let mut data = vec![0u8; 32];
        let n = params.data.len().min(31);
        data[0] = n as u8;
        data[1..1 + n].copy_from_slice(&params.data[..n]);
        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_ADV_DATA), &data).await {
            return Err(e);
        }

        if let Some(scan_response) = &params.scan_response {
            let mut sr = vec![0u8; 32];
            let n = scan_response.len().min(31);
            sr[0] = n as u8;
            sr[1..1 + n].copy_from_slice(&scan_response[..n]);
            if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_SCAN_RESPONSE_DATA), &sr).await {
                return Err(e);
            }
        }

        if let Err(e) = self.run(OpCode::new(OGF_LE, OCF_SET_ADV_ENABLE), &[0x01]).await {
            // Nothing was actually broadcasting yet; no explicit disable needed,
            // but leave state untouched so the caller can retry cleanly.
            return Err(e);
        }

        self.active_address = Some(params.own_address);
        Ok(())
    }

    async fn stop_advertising(&mut self, address: DeviceAddress) -> Result<()> {
        if self.active_address != Some(address) {
            return Err(HciError::invalid("address is not currently advertising"));
        }
        self.disable().await?;
        self.active_address = None;
        Ok(())
    }

    fn on_incoming_connection(&mut self, _address: DeviceAddress, _handle: ConnectionHandle) {
        // Legacy advertising auto-disables on a successful connection (§4.9).
        self.active_address = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressType;
    use std::time::Duration;
    use tokio::io::duplex;

    fn addr() -> DeviceAddress {
        DeviceAddress::new(AddressType::LeRandom, [1, 2, 3, 4, 5, 6])
    }

    async fn respond_ok_n_times(reader: &mut tokio::io::DuplexStream, channel: &CommandChannel, n: usize) {
        for _ in 0..n {
            let mut header = [0u8; 3];
            tokio::io::AsyncReadExt::read_exact(reader, &mut header).await.unwrap();
            let len = header[2] as usize;
            let mut payload = vec![0u8; len];
            if len > 0 {
                tokio::io::AsyncReadExt::read_exact(reader, &mut payload).await.unwrap();
            }
            let op = [header[0], header[1]];
            channel.handle_event(crate::packet::EventPacket::parse(&[0x0e, 4, 1, op[0], op[1], 0x00]).unwrap());
        }
    }

    #[tokio::test]
    async fn start_then_stop_round_trips() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, Duration::from_secs(5));
        let mut adv = LegacyAdvertiser::new(channel.clone());

        let params = AdvertisingParameters {
            interval_min: 0x20,
            interval_max: 0x30,
            own_address: addr(),
            data: b"hi".to_vec(),
            scan_response: None,
        };

        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 3).await;
                reader_task
            }
        });
        adv.start_advertising(params).await.unwrap();
        reader = run.await.unwrap();
        assert!(adv.is_advertising());

        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 1).await;
            }
        });
        adv.stop_advertising(addr()).await.unwrap();
        run.await.unwrap();
        assert!(!adv.is_advertising());
    }

    #[tokio::test]
    async fn rejects_address_change_while_advertising() {
        let (writer, mut reader) = duplex(4096);
        let channel = CommandChannel::new(writer, Duration::from_secs(5));
        let mut adv = LegacyAdvertiser::new(channel.clone());

        let params = AdvertisingParameters {
            interval_min: 0x20,
            interval_max: 0x30,
            own_address: addr(),
            data: vec![],
            scan_response: None,
        };
        let run = tokio::spawn({
            let channel = channel.clone();
            let mut reader_task = reader;
            async move {
                respond_ok_n_times(&mut reader_task, &channel, 3).await;
                reader_task
            }
        });
        adv.start_advertising(params).await.unwrap();
        reader = run.await.unwrap();
        let _ = reader;

        let other = AdvertisingParameters {
            interval_min: 0x20,
            interval_max: 0x30,
            own_address: DeviceAddress::new(AddressType::LeRandom, [9; 6]),
            data: vec![],
            scan_response: None,
        };
        assert!(adv.start_advertising(other).await.is_err());
    }
}
