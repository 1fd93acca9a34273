// Frame decoding for the byte stream.
//
// TCP hands us an unbroken stream of bytes, so the decoder has to find where each message ends.
// Once the opcode is known the end of a message is found with one of these rules:
//
// - RRQ, WRQ, LOGRQ, DELRQ and unknown opcodes end with a zero byte.
// - DIRQ and DISC are exactly the 2 opcode bytes.
// - ACK is exactly 4 bytes.
// - DATA is length-driven: 6 header bytes plus the payload size from bytes 2..4. Payloads are
//   binary and may contain zero bytes, so a zero never ends a DATA message.
// - ERROR and BCAST end with a zero byte, but only after their fixed fields: the error code
//   (bytes 2..4) or the added/deleted flag (byte 2) may legitimately be zero.
//
// A stream that ends partway through a message never produces it.

use crate::tftp::{self, OpCode, Packet, TftpResult};
use std::io::{self, BufReader, Read, Write};

/// Turns bytes, one at a time, into packets.
#[derive(Debug, Default)]
pub struct Decoder {
    bytes: Vec<u8>,

    /// Known once the first two bytes are in.
    opcode: Option<OpCode>,

    /// For DATA: how many block-number and payload bytes are still outstanding.
    data_remaining: Option<usize>,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            bytes: Vec::with_capacity(tftp::MAX_PACKET_SIZE),
            opcode: None,
            data_remaining: None,
        }
    }

    /// Feeds the next byte of the stream. Returns a packet when this byte completes one.
    pub fn feed(&mut self, byte: u8) -> Option<Packet> {
        self.bytes.push(byte);
        let len = self.bytes.len();
        if len < 2 {
            return None;
        }

        let opcode = match self.opcode {
            Some(op) => op,
            None => {
                let op = OpCode::from(u16::from_be_bytes([self.bytes[0], self.bytes[1]]));
                self.opcode = Some(op);
                op
            }
        };

        let complete = match opcode {
            OpCode::Dirq | OpCode::Disc => true,
            OpCode::Ack => len == 4,
            OpCode::Data => self.advance_data(len),
            OpCode::Error => len > 4 && byte == 0x00,
            OpCode::Bcast => len > 3 && byte == 0x00,
            OpCode::Rrq | OpCode::Wrq | OpCode::Logrq | OpCode::Delrq | OpCode::Unknown(_) => {
                len > 2 && byte == 0x00
            }
        };

        if complete {
            self.finish()
        } else {
            None
        }
    }

    fn advance_data(&mut self, len: usize) -> bool {
        match self.data_remaining {
            None if len == 4 => {
                let size = usize::from(u16::from_be_bytes([self.bytes[2], self.bytes[3]]));
                // The block number still has to arrive ahead of the payload.
                self.data_remaining = Some(size + 2);
                false
            }
            None => false,
            Some(remaining) => {
                let remaining = remaining - 1;
                self.data_remaining = Some(remaining);
                remaining == 0
            }
        }
    }

    fn finish(&mut self) -> Option<Packet> {
        let frame = std::mem::replace(&mut self.bytes, Vec::with_capacity(tftp::MAX_PACKET_SIZE));
        self.opcode = None;
        self.data_remaining = None;

        match Packet::parse_from_buf(&frame) {
            Ok(packet) => Some(packet),
            Err(e) => {
                log::warn!("Dropping malformed frame of {} bytes: {}", frame.len(), e);
                None
            }
        }
    }
}

/// Pulls whole packets off a byte source.
pub struct PacketReader<R: Read> {
    bytes: io::Bytes<BufReader<R>>,
    decoder: Decoder,
}

impl<R: Read> PacketReader<R> {
    pub fn new(inner: R) -> PacketReader<R> {
        PacketReader {
            bytes: BufReader::new(inner).bytes(),
            decoder: Decoder::new(),
        }
    }

    /// Blocks until the next packet arrives. Returns `None` once the stream is closed.
    pub fn read_packet(&mut self) -> TftpResult<Option<Packet>> {
        for byte in &mut self.bytes {
            if let Some(packet) = self.decoder.feed(byte?) {
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }
}

/// Writes one fully-framed packet and flushes it.
pub fn write_packet<W: Write>(w: &mut W, packet: &Packet) -> io::Result<()> {
    w.write_all(&packet.to_bytes())?;
    w.flush()
}
