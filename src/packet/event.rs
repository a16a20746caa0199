//! Event packet header view and the well-known event-code table needed by the
//! flow-control engine (§3, §4.1). Full per-field event decoding is out of
//! scope (§1) -- upper layers and CommandChannel only need the code, the raw
//! parameter bytes, and (for command completions) the embedded status byte.
use crate::error::{HciError, Result, Status};
use crate::opcode::OpCode;
use crate::packet::pool::{PooledBuffer, GLOBAL_PACKET_POOL};

/// Event codes the core itself must recognize to route flow control and
/// connection/advertising/scanning lifecycle. Any other code is still valid
/// HCI -- it is simply dispatched opaquely to registered handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    InquiryComplete,
    ConnectionComplete,
    ConnectionRequest,
    DisconnectionComplete,
    AuthenticationComplete,
    EncryptionChange,
    ChangeConnectionLinkKeyComplete,
    LinkKeyTypeChanged,
    ReadRemoteSupportedFeaturesComplete,
    CommandComplete,
    CommandStatus,
    HardwareError,
    RoleChange,
    NumberOfCompletedPackets,
    PinCodeRequest,
    LinkKeyRequest,
    LinkKeyNotification,
    EncryptionKeyRefreshComplete,
    LeMeta,
    Other(u8),
}

impl EventCode {
    pub fn from_raw(code: u8) -> Self {
        match code {
            0x01 => EventCode::InquiryComplete,
            0x03 => EventCode::ConnectionComplete,
            0x04 => EventCode::ConnectionRequest,
            0x05 => EventCode::DisconnectionComplete,
            0x06 => EventCode::AuthenticationComplete,
            0x08 => EventCode::EncryptionChange,
            0x09 => EventCode::ChangeConnectionLinkKeyComplete,
            0x0a => EventCode::LinkKeyTypeChanged,
            0x0b => EventCode::ReadRemoteSupportedFeaturesComplete,
            0x0e => EventCode::CommandComplete,
            0x0f => EventCode::CommandStatus,
            0x10 => EventCode::HardwareError,
            0x12 => EventCode::RoleChange,
            0x13 => EventCode::NumberOfCompletedPackets,
            0x16 => EventCode::PinCodeRequest,
            0x17 => EventCode::LinkKeyRequest,
            0x18 => EventCode::LinkKeyNotification,
            0x30 => EventCode::EncryptionKeyRefreshComplete,
            0x3e => EventCode::LeMeta,
            other => EventCode::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            EventCode::InquiryComplete => 0x01,
            EventCode::ConnectionComplete => 0x03,
            EventCode::ConnectionRequest => 0x04,
            EventCode::DisconnectionComplete => 0x05,
            EventCode::AuthenticationComplete => 0x06,
            EventCode::EncryptionChange => 0x08,
            EventCode::ChangeConnectionLinkKeyComplete => 0x09,
            EventCode::LinkKeyTypeChanged => 0x0a,
            EventCode::ReadRemoteSupportedFeaturesComplete => 0x0b,
            EventCode::CommandComplete => 0x0e,
            EventCode::CommandStatus => 0x0f,
            EventCode::HardwareError => 0x10,
            EventCode::RoleChange => 0x12,
            EventCode::NumberOfCompletedPackets => 0x13,
            EventCode::PinCodeRequest => 0x16,
            EventCode::LinkKeyRequest => 0x17,
            EventCode::LinkKeyNotification => 0x18,
            EventCode::EncryptionKeyRefreshComplete => 0x30,
            EventCode::LeMeta => 0x3e,
            EventCode::Other(raw) => raw,
        }
    }

    fn carries_status_as_first_byte(self) -> bool {
        !matches!(self, EventCode::CommandComplete | EventCode::LeMeta)
    }
}

/// LE subevent codes carried in the first byte of a `LeMeta` event's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeSubeventCode(pub u8);

impl LeSubeventCode {
    pub const CONNECTION_COMPLETE: LeSubeventCode = LeSubeventCode(0x01);
    pub const ADVERTISING_REPORT: LeSubeventCode = LeSubeventCode(0x02);
    pub const LONG_TERM_KEY_REQUEST: LeSubeventCode = LeSubeventCode(0x05);
    pub const ADVERTISING_SET_TERMINATED: LeSubeventCode = LeSubeventCode(0x12);
}

/// Owned view over a received HCI event packet: `[code][length][params...]`.
pub struct EventPacket {
    buffer: PooledBuffer,
    payload_len: usize,
}

impl EventPacket {
    /// Parses an inbound event from raw wire bytes (`[code][length][params..]`).
    /// Rejects with `PacketMalformed` if the declared length disagrees with the
    /// number of bytes actually supplied.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(HciError::PacketMalformed);
        }
        let code = raw[0];
        let length = raw[1] as usize;
        let params = &raw[2..];
        if params.len() != length {
            return Err(HciError::PacketMalformed);
        }
        let mut buffer = GLOBAL_PACKET_POOL.alloc(2 + length);
        buffer.as_mut()[0] = code;
        buffer.as_mut()[1] = length as u8;
        buffer.as_mut()[2..2 + length].copy_from_slice(params);
        Ok(EventPacket {
            buffer,
            payload_len: length,
        })
    }

    pub fn code(&self) -> EventCode {
        EventCode::from_raw(self.buffer.as_ref()[0])
    }

    pub fn parameters(&self) -> &[u8] {
        &self.buffer.as_ref()[2..2 + self.payload_len]
    }

    /// Subevent code for a `LeMeta` event; `None` for any other event code.
    pub fn le_subevent(&self) -> Option<LeSubeventCode> {
        if self.code() == EventCode::LeMeta && !self.parameters().is_empty() {
            Some(LeSubeventCode(self.parameters()[0]))
        } else {
            None
        }
    }

    /// For `CommandComplete`/`CommandStatus`, the opcode of the command this
    /// event completes. `None` for any other event.
    pub fn command_opcode(&self) -> Option<OpCode> {
        match self.code() {
            EventCode::CommandComplete => {
                // num_hci_command_packets(1) + opcode(2) + return_params...
                let p = self.parameters();
                if p.len() >= 3 {
                    Some(OpCode(u16::from_le_bytes([p[1], p[2]])))
                } else {
                    None
                }
            }
            EventCode::CommandStatus => {
                // status(1) + num_hci_command_packets(1) + opcode(2)
                let p = self.parameters();
                if p.len() >= 4 {
                    Some(OpCode(u16::from_le_bytes([p[2], p[3]])))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// `Num_HCI_Command_Packets` credit field, present on both completion events.
    pub fn command_credits(&self) -> Option<u8> {
        match self.code() {
            EventCode::CommandComplete => self.parameters().first().copied(),
            EventCode::CommandStatus => self.parameters().get(1).copied(),
            _ => None,
        }
    }

    /// Decodes the embedded controller status for events that carry one.
    /// `CommandComplete` reads the first byte of *return* parameters (which,
    /// by convention, is the command's own status byte); LE-Meta reads the
    /// first byte *after* the subevent code; everything else in the
    /// recognized table reads the first parameter byte. Unrecognized codes
    /// are a protocol error rather than a silent success (§4.1).
    pub fn to_status(&self) -> Result<Status> {
        match self.code() {
            EventCode::CommandComplete => {
                let p = self.parameters();
                p.get(3).copied().map(Status).ok_or(HciError::PacketMalformed)
            }
            EventCode::LeMeta => {
                let p = self.parameters();
                p.get(1).copied().map(Status).ok_or(HciError::PacketMalformed)
            }
            EventCode::Other(_) => Err(HciError::PacketMalformed),
            code if code.carries_status_as_first_byte() => {
                self.parameters().first().copied().map(Status).ok_or(HciError::PacketMalformed)
            }
            _ => Err(HciError::PacketMalformed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_complete_bytes(credits: u8, opcode: OpCode, status: u8) -> Vec<u8> {
        let op = opcode.0.to_le_bytes();
        vec![0x0e, 4, credits, op[0], op[1], status]
    }

    #[test]
    fn to_status_round_trips_for_command_complete() {
        let raw = command_complete_bytes(1, OpCode::new(0x08, 1), 0x00);
        let event = EventPacket::parse(&raw).unwrap();
        assert_eq!(event.to_status().unwrap(), Status::SUCCESS);
        assert_eq!(event.command_opcode(), Some(OpCode::new(0x08, 1)));
        assert_eq!(event.command_credits(), Some(1));
    }

    #[test]
    fn to_status_round_trips_for_disconnection_complete() {
        let raw = vec![0x05, 4, 0x00, 0x01, 0x00, 0x13];
        let event = EventPacket::parse(&raw).unwrap();
        assert_eq!(event.to_status().unwrap(), Status::SUCCESS);
    }

    #[test]
    fn unknown_event_code_is_protocol_error_not_panic() {
        let raw = vec![0xf0, 1, 0x00];
        let event = EventPacket::parse(&raw).unwrap();
        assert!(event.to_status().is_err());
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let raw = vec![0x05, 10, 0x00];
        assert!(matches!(EventPacket::parse(&raw), Err(HciError::PacketMalformed)));
    }
}
