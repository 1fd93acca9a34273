// Wire format for the session-oriented TFTP variant spoken over TCP.
//
// Every message starts with a 2-byte big-endian opcode. The rest of the message depends on the
// opcode:
//
// opcode   operation   layout after the opcode
// 1        RRQ         filename | 0x00
// 2        WRQ         filename | 0x00
// 3        DATA        size (2 bytes) | block # (2 bytes) | size bytes of data
// 4        ACK         block # (2 bytes)
// 5        ERROR       error code (2 bytes) | message | 0x00
// 6        DIRQ        (nothing)
// 7        LOGRQ       username | 0x00
// 8        DELRQ       filename | 0x00
// 9        BCAST       added/deleted flag (1 byte) | filename | 0x00
// 10       DISC        (nothing)
//
// Unlike RFC 1350 there is no mode string, and DATA carries its own payload length because the
// transport is a byte stream rather than datagrams. A DATA payload shorter than 512 bytes ends a
// transfer.
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    File already exists
// 6    User not logged in
// 7    User already logged in

use std::error;
use std::fmt;
use std::io;

/// The largest payload a single DATA packet may carry.
pub const DATA_BUFFER_SIZE: usize = 512;

/// op(2) + size(2) + block(2)
pub const DATA_HEADER_SIZE: usize = 6;

/// The largest message that can appear on the wire.
pub const MAX_PACKET_SIZE: usize = DATA_HEADER_SIZE + DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error produced while reading or interpreting packets.
#[derive(Debug)]
pub enum PacketError {
    IO(io::Error),
    PacketParse(String),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::IO(e) => write!(f, "Stream IO error: {:#?}", e),
            PacketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
        }
    }
}

impl From<io::Error> for PacketError {
    fn from(e: io::Error) -> Self {
        PacketError::IO(e)
    }
}

pub type TftpResult<T> = Result<T, PacketError>;

/// The 16-bit code at the front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    Dirq,
    Logrq,
    Delrq,
    Bcast,
    Disc,
    Unknown(u16),
}

impl From<u16> for OpCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => OpCode::Rrq,
            2 => OpCode::Wrq,
            3 => OpCode::Data,
            4 => OpCode::Ack,
            5 => OpCode::Error,
            6 => OpCode::Dirq,
            7 => OpCode::Logrq,
            8 => OpCode::Delrq,
            9 => OpCode::Bcast,
            10 => OpCode::Disc,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for u16 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::Dirq => 6,
            OpCode::Logrq => 7,
            OpCode::Delrq => 8,
            OpCode::Bcast => 9,
            OpCode::Disc => 10,
            OpCode::Unknown(raw) => raw,
        }
    }
}

/// Represents an error code surfaced by an ERROR packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOp,
    FileExists,
    NotLoggedIn,
    AlreadyLoggedIn,
}

impl ErrorCode {
    /// The human-readable text sent alongside this code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOp => "Illegal TFTP operation",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NotLoggedIn => "User not logged in",
            ErrorCode::AlreadyLoggedIn => "User already logged in",
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOp,
            5 => ErrorCode::FileExists,
            6 => ErrorCode::NotLoggedIn,
            7 => ErrorCode::AlreadyLoggedIn,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOp => 4,
            ErrorCode::FileExists => 5,
            ErrorCode::NotLoggedIn => 6,
            ErrorCode::AlreadyLoggedIn => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                ErrorCode::AccessViolation
            }
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// Whether a BCAST announces a file appearing in or leaving the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastAction {
    Deleted,
    Added,
}

impl fmt::Display for BroadcastAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BroadcastAction::Added => write!(f, "add"),
            BroadcastAction::Deleted => write!(f, "del"),
        }
    }
}

/// An enum representing a message and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read (download) request
    ReadReq {
        /// The file the client wants to read.
        path: String,
    },

    /// A write (upload) request
    WriteReq { path: String },

    /// A data packet
    Data {
        /// The 1-based block number for this data packet.
        block: u16,

        /// The contents of the data itself, at most 512 bytes.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged. Zero acknowledges a request.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },

    /// A directory listing request
    DirReq,

    /// A login request
    LoginReq { username: String },

    /// A delete request
    DeleteReq { path: String },

    /// A server-initiated notice that the storage root changed.
    Broadcast { action: BroadcastAction, path: String },

    /// A disconnect request
    Disconnect,

    /// Anything carrying an opcode we don't recognise, or a BCAST with a flag other than 0 or 1.
    Unknown { opcode: u16, payload: Vec<u8> },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
fn string_from_buffer(buf: &[u8]) -> String {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < DATA_HEADER_SIZE {
        return Err(PacketError::PacketParse("Data packet is missing its header".to_string()));
    }
    let size = usize::from(u16_from_buffer(&buf[2..4]));
    if size > DATA_BUFFER_SIZE {
        return Err(PacketError::PacketParse(format!(
            "Data packet declares {size} bytes, blocks hold at most {DATA_BUFFER_SIZE}"
        )));
    }
    let block = u16_from_buffer(&buf[4..6]);
    let data = &buf[DATA_HEADER_SIZE..];
    if data.len() != size {
        return Err(PacketError::PacketParse(format!(
            "Data packet declares {size} bytes but carries {}",
            data.len()
        )));
    }
    Ok(Packet::Data { block, data: data.to_vec() })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() != 4 {
        return Err(PacketError::PacketParse(format!("Ack packet must be 4 bytes, got {}", buf.len())));
    }
    Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 4 {
        return Err(PacketError::PacketParse("Error packet is missing its code".to_string()));
    }
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let message = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

fn parse_broadcast(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() < 3 {
        return Err(PacketError::PacketParse("Broadcast packet is missing its flag".to_string()));
    }
    let action = match buf[2] {
        0 => BroadcastAction::Deleted,
        1 => BroadcastAction::Added,
        // Unrecognised flags surface as an unknown packet.
        _ => {
            let payload = buf[2..].strip_suffix(&[0x00]).unwrap_or(&buf[2..]);
            return Ok(Packet::Unknown { opcode: OpCode::Bcast.into(), payload: payload.to_vec() });
        }
    };
    Ok(Packet::Broadcast { action, path: string_from_buffer(&buf[3..]) })
}

fn parse_bare(buf: &[u8], packet: Packet) -> TftpResult<Packet> {
    if buf.len() != 2 {
        return Err(PacketError::PacketParse(format!(
            "{:?} carries no payload, but got {} bytes",
            packet,
            buf.len()
        )));
    }
    Ok(packet)
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::DirReq => OpCode::Dirq,
            Packet::LoginReq { .. } => OpCode::Logrq,
            Packet::DeleteReq { .. } => OpCode::Delrq,
            Packet::Broadcast { .. } => OpCode::Bcast,
            Packet::Disconnect => OpCode::Disc,
            Packet::Unknown { opcode, .. } => OpCode::Unknown(*opcode),
        }
    }

    /// Builds an ERROR packet carrying the standard text for `code`.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.message().to_string() }
    }

    /// Parses one complete frame. The frame must already be delimited, see `decoder::Decoder`.
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(PacketError::PacketParse("Packet too short!".to_string()));
        }

        match OpCode::from(u16_from_buffer(&buf[..2])) {
            OpCode::Rrq => Ok(Packet::ReadReq { path: string_from_buffer(&buf[2..]) }),
            OpCode::Wrq => Ok(Packet::WriteReq { path: string_from_buffer(&buf[2..]) }),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
            OpCode::Dirq => parse_bare(buf, Packet::DirReq),
            OpCode::Logrq => Ok(Packet::LoginReq { username: string_from_buffer(&buf[2..]) }),
            OpCode::Delrq => Ok(Packet::DeleteReq { path: string_from_buffer(&buf[2..]) }),
            OpCode::Bcast => parse_broadcast(buf),
            OpCode::Disc => parse_bare(buf, Packet::Disconnect),
            OpCode::Unknown(opcode) => {
                let payload = buf[2..].strip_suffix(&[0x00]).unwrap_or(&buf[2..]);
                Ok(Packet::Unknown { opcode, payload: payload.to_vec() })
            }
        }
    }

    /// Serializes the packet into a fully-framed message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&u16::from(self.opcode()).to_be_bytes());
        match self {
            Packet::ReadReq { path } | Packet::WriteReq { path } | Packet::DeleteReq { path } => {
                push_string(&mut buf, path)
            }
            Packet::LoginReq { username } => push_string(&mut buf, username),
            Packet::Data { block, data } => {
                // Payloads are bounded by DATA_BUFFER_SIZE, so the length always fits.
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                push_string(&mut buf, message);
            }
            Packet::Broadcast { action, path } => {
                buf.push(match action {
                    BroadcastAction::Deleted => 0,
                    BroadcastAction::Added => 1,
                });
                push_string(&mut buf, path);
            }
            Packet::DirReq | Packet::Disconnect => {}
            Packet::Unknown { payload, .. } => {
                buf.extend_from_slice(payload);
                buf.push(0x00);
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: data.txt with terminating nullchar
            0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::ReadReq { path: "data.txt".to_string() });
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // size
            0x00, 0x04,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0x00, 0xEF];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0x00, 0xEF] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal! with terminating nullchar
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert!(packet.is_ok());
        assert_eq!(
            packet.unwrap(),
            Packet::Error { code: ErrorCode::IllegalOp, message: "Illegal!".to_string() }
        );
    }

    #[test]
    fn test_packet_parses_broadcast() {
        let buf = vec![0x00, 0x09, 0x00, 0x61, 0x2E, 0x62, 0x00];
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Broadcast { action: BroadcastAction::Deleted, path: "a.b".to_string() }
        );
    }

    #[test]
    fn test_packet_parses_unknown() {
        let buf = vec![0x00, 0x2A, 0x68, 0x69, 0x00];
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Unknown { opcode: 42, payload: vec![0x68, 0x69] }
        );
    }

    #[test]
    fn test_encode_matches_wire_layout() {
        assert_eq!(Packet::Ack { block: 2 }.to_bytes(), vec![0x00, 0x04, 0x00, 0x02]);
        assert_eq!(Packet::DirReq.to_bytes(), vec![0x00, 0x06]);
        assert_eq!(Packet::Disconnect.to_bytes(), vec![0x00, 0x0A]);
        assert_eq!(
            Packet::LoginReq { username: "bob".to_string() }.to_bytes(),
            vec![0x00, 0x07, 0x62, 0x6F, 0x62, 0x00]
        );
        assert_eq!(
            Packet::Data { block: 1, data: vec![0xFF; 3] }.to_bytes(),
            vec![0x00, 0x03, 0x00, 0x03, 0x00, 0x01, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            Packet::Broadcast { action: BroadcastAction::Added, path: "x".to_string() }.to_bytes(),
            vec![0x00, 0x09, 0x01, 0x78, 0x00]
        );
        assert_eq!(
            Packet::error(ErrorCode::NotDefined).to_bytes()[..4],
            [0x00, 0x05, 0x00, 0x00]
        );
    }

    #[test]
    fn test_io_error_kinds_map_to_codes() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(io::ErrorKind::Interrupted), ErrorCode::NotDefined);
    }

    #[test]
    fn test_packet_parse_failures() {
        assert!(!Packet::parse_from_buf(&vec![0x10]).is_ok());
        // Ack too short
        assert!(!Packet::parse_from_buf(&vec![0x00, 0x04, 0x01]).is_ok());
        // Data size disagrees with payload
        assert!(!Packet::parse_from_buf(&vec![0x00, 0x03, 0x00, 0x02, 0x00, 0x01, 0xAA]).is_ok());
        // Disc with trailing bytes
        assert!(!Packet::parse_from_buf(&vec![0x00, 0x0A, 0x00]).is_ok());
        // Data larger than a block
        let mut oversized = vec![0x00, 0x03, 0x02, 0x01, 0x00, 0x01];
        oversized.extend(vec![0x00; 513]);
        assert!(!Packet::parse_from_buf(&oversized).is_ok());
    }

    #[test]
    fn test_packet_bad_broadcast_flag_is_unknown() {
        let buf = vec![0x00, 0x09, 0x07, 0x61, 0x00];
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Unknown { opcode: 9, payload: vec![0x07, 0x61] }
        );
    }
}
