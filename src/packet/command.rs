//! Command packet header view (§3, §4.1): `[opcode lo][opcode hi][length][params...]`.
use crate::error::{HciError, Result};
use crate::opcode::OpCode;
use crate::packet::pool::{PooledBuffer, GLOBAL_PACKET_POOL};

pub const HEADER_SIZE: usize = 3;
pub const MAX_PAYLOAD: usize = 255;

pub struct CommandPacket {
    buffer: PooledBuffer,
    payload_size: usize,
}

impl CommandPacket {
    /// Allocates a command packet and writes its header. `opcode == 0` or a
    /// payload over 255 bytes (the field is a single length byte) is rejected
    /// synchronously (§4.3).
    pub fn new(opcode: OpCode, payload_size: usize) -> Result<Self> {
        if opcode.is_nop() {
            return Err(HciError::invalid("opcode must not be 0x0000"));
        }
        if payload_size > MAX_PAYLOAD {
            return Err(HciError::invalid("command payload exceeds 255 bytes"));
        }
        let mut buffer = GLOBAL_PACKET_POOL.alloc(HEADER_SIZE + payload_size);
        let op = opcode.0.to_le_bytes();
        let view = buffer.as_mut();
        view[0] = op[0];
        view[1] = op[1];
        view[2] = payload_size as u8;
        Ok(CommandPacket {
            buffer,
            payload_size,
        })
    }

    pub fn opcode(&self) -> OpCode {
        let b = self.buffer.as_ref();
        OpCode(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[HEADER_SIZE..HEADER_SIZE + self.payload_size]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[HEADER_SIZE..HEADER_SIZE + self.payload_size]
    }

    /// Serializes the header + payload to the wire representation, little-endian.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        self.buffer.as_ref()[..HEADER_SIZE + self.payload_size].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nop_opcode() {
        assert!(matches!(
            CommandPacket::new(OpCode::NOP, 0),
            Err(HciError::InvalidParameters(_))
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        assert!(matches!(
            CommandPacket::new(OpCode::new(1, 1), 256),
            Err(HciError::InvalidParameters(_))
        ));
    }

    #[test]
    fn header_round_trips() {
        let op = OpCode::new(0x08, 0x0001);
        let mut pkt = CommandPacket::new(op, 4).unwrap();
        pkt.payload_mut().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(pkt.opcode(), op);
        let wire = pkt.to_wire_bytes();
        assert_eq!(wire.len(), HEADER_SIZE + 4);
        assert_eq!(wire[2], 4);
    }
}
