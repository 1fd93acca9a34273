// Server-side protocol state, one instance per connection.
//
// Every request except LOGRQ needs a logged-in connection. A connection runs at most one transfer
// at a time and that transfer is always stop-and-wait: one DATA block is outstanding until the
// matching ACK comes back. Downloads and directory listings send blocks and wait for ACKs; uploads
// wait for blocks and send ACKs. Responses go out through the registry, which also carries the
// BCAST fanout when an upload completes or a file is deleted.

use crate::registry::{ConnectionId, Connections};
use crate::srv_conn::ServerConnectionError;
use crate::storage::Storage;
use crate::tftp::{self, BroadcastAction, ErrorCode, Packet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// What a connection is in the middle of transferring.
#[derive(Debug)]
enum Transfer {
    Idle,

    /// Sending a stored file to the client.
    Downloading {
        file: File,
        /// The block that was just sent and needs acknowledging.
        expected_block: u16,
        /// Set once the short final block has gone out.
        awaiting_final_ack: bool,
    },

    /// Receiving a file from the client.
    Uploading {
        file: File,
        path: String,
        expected_block: u16,
    },

    /// Sending the zero-separated list of stored file names.
    Listing {
        remaining: Vec<u8>,
        expected_block: u16,
        awaiting_final_ack: bool,
    },
}

pub struct ServerProtocol {
    id: ConnectionId,
    connections: Arc<Connections>,
    storage: Arc<Storage>,
    transfer: Transfer,
    should_terminate: bool,
}

fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = Vec::with_capacity(tftp::DATA_BUFFER_SIZE);
    // A single read() may come back short of a full block, take() keeps going until the block is
    // full or the file ends.
    Read::by_ref(f)
        .take(tftp::DATA_BUFFER_SIZE as u64)
        .read_to_end(&mut buf)?;
    Ok(buf)
}

fn next_listing_block(remaining: &mut Vec<u8>) -> Vec<u8> {
    let len = remaining.len().min(tftp::DATA_BUFFER_SIZE);
    remaining.drain(..len).collect()
}

impl ServerProtocol {
    pub fn start(
        id: ConnectionId,
        connections: Arc<Connections>,
        storage: Arc<Storage>,
    ) -> ServerProtocol {
        ServerProtocol {
            id,
            connections,
            storage,
            transfer: Transfer::Idle,
            should_terminate: false,
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate
    }

    /// Handles one inbound packet. An error means the connection can't continue.
    pub fn process(&mut self, packet: Packet) -> Result<(), ServerConnectionError> {
        if !matches!(packet, Packet::LoginReq { .. }) && !self.connections.is_logged_in(self.id) {
            log::debug!("Connection {} sent {:?} before logging in", self.id, packet.opcode());
            self.reply_error(ErrorCode::NotLoggedIn);
            return Ok(());
        }

        match packet {
            Packet::LoginReq { username } => self.login(&username),
            Packet::ReadReq { path } => self.start_download(&path)?,
            Packet::WriteReq { path } => self.start_upload(&path),
            Packet::Data { block, data } => self.receive_block(block, &data)?,
            Packet::Ack { block } => self.acknowledge(block)?,
            Packet::DirReq => self.start_listing(),
            Packet::DeleteReq { path } => self.delete(&path),
            Packet::Disconnect => self.disconnect(),
            Packet::Error { .. } | Packet::Broadcast { .. } | Packet::Unknown { .. } => {
                log::warn!("Connection {} sent illegal {:?}", self.id, packet.opcode());
                self.reply_error(ErrorCode::IllegalOp);
            }
        }
        Ok(())
    }

    fn reply(&self, packet: Packet) {
        self.connections.send(self.id, &packet);
    }

    fn reply_error(&self, code: ErrorCode) {
        self.reply(Packet::error(code));
    }

    /// Gives up on the current transfer after a storage failure. The peer gets an ERROR as a
    /// courtesy and the failure is handed back to end the connection.
    fn abort(&mut self, e: io::Error, action: &str) -> ServerConnectionError {
        log::error!("Connection {}: failed to {action}: {e}", self.id);
        self.transfer = Transfer::Idle;
        self.reply(Packet::Error {
            code: e.kind().into(),
            message: format!("Failed to {action}"),
        });
        ServerConnectionError::File(e)
    }

    fn replace_transfer(&mut self, transfer: Transfer) {
        if !matches!(self.transfer, Transfer::Idle) {
            log::debug!("Connection {} abandons its previous transfer", self.id);
        }
        self.transfer = transfer;
    }

    fn login(&mut self, username: &str) {
        if username.is_empty() {
            self.reply(Packet::Error {
                code: ErrorCode::NotDefined,
                message: "Username must not be empty".to_string(),
            });
        } else if self.connections.is_logged_in(self.id) || !self.connections.login(self.id, username) {
            self.reply_error(ErrorCode::AlreadyLoggedIn);
        } else {
            log::info!("Connection {} logged in as {username}", self.id);
            self.reply(Packet::Ack { block: 0 });
        }
    }

    fn start_download(&mut self, path: &str) -> Result<(), ServerConnectionError> {
        let mut file = match self.storage.open_read(path) {
            Ok(f) => f,
            Err(e) => {
                log::info!("Connection {}: can't read '{path}': {e}", self.id);
                self.reply_error(e.kind().into());
                return Ok(());
            }
        };

        log::info!("Connection {} downloading '{path}'", self.id);
        let data = match read_block_from_file(&mut file) {
            Ok(data) => data,
            Err(e) => return Err(self.abort(e, "read from file")),
        };
        let awaiting_final_ack = data.len() < tftp::DATA_BUFFER_SIZE;
        self.replace_transfer(Transfer::Downloading { file, expected_block: 1, awaiting_final_ack });
        self.reply(Packet::Data { block: 1, data });
        Ok(())
    }

    fn start_upload(&mut self, path: &str) {
        match self.storage.create_new(path) {
            Ok(file) => {
                log::info!("Connection {} uploading '{path}'", self.id);
                self.replace_transfer(Transfer::Uploading {
                    file,
                    path: path.to_string(),
                    expected_block: 1,
                });
                self.reply(Packet::Ack { block: 0 });
            }
            Err(e) => {
                log::info!("Connection {}: can't create '{path}': {e}", self.id);
                self.reply_error(e.kind().into());
            }
        }
    }

    fn start_listing(&mut self) {
        let names = match self.storage.list() {
            Ok(names) => names,
            Err(e) => {
                log::warn!("Connection {}: can't list storage: {e}", self.id);
                self.reply_error(e.kind().into());
                return;
            }
        };

        let mut remaining = names.join("\0").into_bytes();
        let data = next_listing_block(&mut remaining);
        let awaiting_final_ack = data.len() < tftp::DATA_BUFFER_SIZE;
        self.replace_transfer(Transfer::Listing { remaining, expected_block: 1, awaiting_final_ack });
        self.reply(Packet::Data { block: 1, data });
    }

    fn receive_block(&mut self, block: u16, data: &[u8]) -> Result<(), ServerConnectionError> {
        let (mut file, path, expected_block) =
            match std::mem::replace(&mut self.transfer, Transfer::Idle) {
                Transfer::Uploading { file, path, expected_block } => (file, path, expected_block),
                other => {
                    log::debug!("Connection {} ignoring stray DATA {block}", self.id);
                    self.transfer = other;
                    return Ok(());
                }
            };

        if block != expected_block {
            log::debug!(
                "Connection {} ignoring DATA {block}, expected {expected_block}",
                self.id
            );
            self.transfer = Transfer::Uploading { file, path, expected_block };
            return Ok(());
        }

        if let Err(e) = file.write_all(data) {
            return Err(self.abort(e, "write to file"));
        }

        if data.len() < tftp::DATA_BUFFER_SIZE {
            if let Err(e) = file.flush() {
                return Err(self.abort(e, "write to file"));
            }
            drop(file);
            log::info!("Connection {} finished uploading '{path}'", self.id);
            self.reply(Packet::Ack { block });
            self.connections
                .send_all(&Packet::Broadcast { action: BroadcastAction::Added, path });
        } else {
            self.transfer = Transfer::Uploading {
                file,
                path,
                expected_block: expected_block.wrapping_add(1),
            };
            self.reply(Packet::Ack { block });
        }
        Ok(())
    }

    fn acknowledge(&mut self, block: u16) -> Result<(), ServerConnectionError> {
        match std::mem::replace(&mut self.transfer, Transfer::Idle) {
            Transfer::Downloading { mut file, expected_block, awaiting_final_ack }
                if block == expected_block =>
            {
                if awaiting_final_ack {
                    log::info!("Connection {} finished downloading", self.id);
                    return Ok(());
                }
                let data = match read_block_from_file(&mut file) {
                    Ok(data) => data,
                    Err(e) => return Err(self.abort(e, "read from file")),
                };
                let block = expected_block.wrapping_add(1);
                self.transfer = Transfer::Downloading {
                    file,
                    expected_block: block,
                    awaiting_final_ack: data.len() < tftp::DATA_BUFFER_SIZE,
                };
                self.reply(Packet::Data { block, data });
            }
            Transfer::Listing { mut remaining, expected_block, awaiting_final_ack }
                if block == expected_block =>
            {
                if awaiting_final_ack {
                    return Ok(());
                }
                let data = next_listing_block(&mut remaining);
                let block = expected_block.wrapping_add(1);
                self.transfer = Transfer::Listing {
                    remaining,
                    expected_block: block,
                    awaiting_final_ack: data.len() < tftp::DATA_BUFFER_SIZE,
                };
                self.reply(Packet::Data { block, data });
            }
            other => {
                // Mismatched block numbers, and ACKs with nothing outstanding, change nothing.
                log::debug!("Connection {} ignoring ACK {block}", self.id);
                self.transfer = other;
            }
        }
        Ok(())
    }

    fn delete(&mut self, path: &str) {
        match self.storage.delete(path) {
            Ok(()) => {
                log::info!("Connection {} deleted '{path}'", self.id);
                self.reply(Packet::Ack { block: 0 });
                self.connections.send_all(&Packet::Broadcast {
                    action: BroadcastAction::Deleted,
                    path: path.to_string(),
                });
            }
            Err(e) => {
                log::info!("Connection {}: can't delete '{path}': {e}", self.id);
                self.reply_error(e.kind().into());
            }
        }
    }

    fn disconnect(&mut self) {
        self.transfer = Transfer::Idle;
        self.reply(Packet::Ack { block: 0 });
        self.should_terminate = true;
        self.connections.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::RecordingHandler;
    use std::fs;
    use tempdir::TempDir;

    struct Fixture {
        tmpdir: TempDir,
        connections: Arc<Connections>,
        storage: Arc<Storage>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tmpdir = TempDir::new("scratch").unwrap();
            let storage = Arc::new(Storage::new(tmpdir.path()).unwrap());
            Fixture { tmpdir, connections: Arc::new(Connections::new()), storage }
        }

        fn session(&self) -> (ServerProtocol, Arc<RecordingHandler>) {
            let id = self.connections.new_connection_id();
            let handler = Arc::new(RecordingHandler::default());
            assert!(self.connections.connect(id, handler.clone()));
            let protocol =
                ServerProtocol::start(id, Arc::clone(&self.connections), Arc::clone(&self.storage));
            (protocol, handler)
        }

        fn logged_in(&self, username: &str) -> (ServerProtocol, Arc<RecordingHandler>) {
            let (mut protocol, handler) = self.session();
            protocol
                .process(Packet::LoginReq { username: username.to_string() })
                .unwrap();
            assert_eq!(handler.take(), vec![Packet::Ack { block: 0 }]);
            (protocol, handler)
        }

        fn write_file(&self, name: &str, contents: &[u8]) {
            fs::write(self.tmpdir.path().join(name), contents).unwrap();
        }
    }

    #[test]
    fn test_requests_require_login() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.session();

        for packet in [
            Packet::ReadReq { path: "a".to_string() },
            Packet::DirReq,
            Packet::Ack { block: 1 },
            Packet::Disconnect,
            Packet::Unknown { opcode: 77, payload: vec![] },
        ] {
            protocol.process(packet).unwrap();
            assert_eq!(handler.take(), vec![Packet::error(ErrorCode::NotLoggedIn)]);
        }
        assert!(!protocol.should_terminate());
    }

    #[test]
    fn test_login_is_exclusive() {
        let fixture = Fixture::new();
        let (mut first, first_handler) = fixture.logged_in("alice");
        let (mut second, second_handler) = fixture.session();

        second
            .process(Packet::LoginReq { username: "alice".to_string() })
            .unwrap();
        assert_eq!(second_handler.take(), vec![Packet::error(ErrorCode::AlreadyLoggedIn)]);

        first
            .process(Packet::LoginReq { username: "someone-else".to_string() })
            .unwrap();
        assert_eq!(first_handler.take(), vec![Packet::error(ErrorCode::AlreadyLoggedIn)]);
    }

    #[test]
    fn test_read_missing_file() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::ReadReq { path: "nope.txt".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::FileNotFound)]);

        protocol.process(Packet::ReadReq { path: "../escape".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::AccessViolation)]);
    }

    #[test]
    fn test_read_directory_keeps_connection() {
        let fixture = Fixture::new();
        fs::create_dir(fixture.tmpdir.path().join("sub")).unwrap();
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::ReadReq { path: "sub".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::FileNotFound)]);
        assert!(!protocol.should_terminate());

        protocol.process(Packet::DirReq).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 1, data: vec![] }]);
    }

    #[test]
    fn test_read_multiple_blocks() {
        let fixture = Fixture::new();
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        fixture.write_file("test.txt", &contents);
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::ReadReq { path: "test.txt".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 1, data: vec![0x78; 512] }]);

        protocol.process(Packet::Ack { block: 1 }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 2, data: vec![0x78; 512] }]);

        // A repeated or premature ACK doesn't move the transfer along.
        protocol.process(Packet::Ack { block: 1 }).unwrap();
        protocol.process(Packet::Ack { block: 3 }).unwrap();
        assert!(handler.take().is_empty());

        protocol.process(Packet::Ack { block: 2 }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 3, data: b"testing".to_vec() }]);

        protocol.process(Packet::Ack { block: 3 }).unwrap();
        protocol.process(Packet::Ack { block: 3 }).unwrap();
        assert!(handler.take().is_empty());
    }

    #[test]
    fn test_read_exact_multiple_sends_empty_final_block() {
        let fixture = Fixture::new();
        fixture.write_file("even.bin", &[0x00; 512]);
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::ReadReq { path: "even.bin".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 1, data: vec![0x00; 512] }]);
        protocol.process(Packet::Ack { block: 1 }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 2, data: vec![] }]);
        protocol.process(Packet::Ack { block: 2 }).unwrap();
        assert!(handler.take().is_empty());
    }

    #[test]
    fn test_write_existing_file() {
        let fixture = Fixture::new();
        fixture.write_file("taken.txt", b"x");
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::WriteReq { path: "taken.txt".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::FileExists)]);

        // No upload is open, so DATA is dropped without an ACK.
        protocol.process(Packet::Data { block: 1, data: vec![1] }).unwrap();
        assert!(handler.take().is_empty());
    }

    #[test]
    fn test_write_multiple_blocks_and_broadcast() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.logged_in("alice");
        let (_watcher, watcher_handler) = fixture.logged_in("bob");
        let (_anon, anon_handler) = fixture.session();

        protocol.process(Packet::WriteReq { path: "x.txt".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Ack { block: 0 }]);

        protocol.process(Packet::Data { block: 1, data: vec![0x41; 512] }).unwrap();
        assert_eq!(handler.take(), vec![Packet::Ack { block: 1 }]);

        protocol.process(Packet::Data { block: 5, data: vec![0x42] }).unwrap();
        assert!(handler.take().is_empty());

        protocol.process(Packet::Data { block: 2, data: vec![0x42; 488] }).unwrap();
        let added = Packet::Broadcast { action: BroadcastAction::Added, path: "x.txt".to_string() };
        assert_eq!(handler.take(), vec![Packet::Ack { block: 2 }, added.clone()]);
        assert_eq!(watcher_handler.take(), vec![added]);
        assert!(anon_handler.take().is_empty());

        let written = fs::read(fixture.tmpdir.path().join("x.txt")).unwrap();
        assert_eq!(written.len(), 1000);
        assert!(written[..512].iter().all(|&b| b == 0x41));
        assert!(written[512..].iter().all(|&b| b == 0x42));
    }

    #[test]
    fn test_write_empty_file() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::WriteReq { path: "empty".to_string() }).unwrap();
        protocol.process(Packet::Data { block: 1, data: vec![] }).unwrap();
        assert_eq!(
            handler.take(),
            vec![
                Packet::Ack { block: 0 },
                Packet::Ack { block: 1 },
                Packet::Broadcast { action: BroadcastAction::Added, path: "empty".to_string() },
            ]
        );
        assert_eq!(fs::read(fixture.tmpdir.path().join("empty")).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_directory_listing() {
        let fixture = Fixture::new();
        fixture.write_file("b.txt", b"");
        fixture.write_file("a.txt", b"");
        fs::create_dir(fixture.tmpdir.path().join("dir")).unwrap();
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::DirReq).unwrap();
        assert_eq!(handler.take(), vec![Packet::Data { block: 1, data: b"a.txt\0b.txt".to_vec() }]);
        protocol.process(Packet::Ack { block: 1 }).unwrap();
        assert!(handler.take().is_empty());
    }

    #[test]
    fn test_directory_listing_spans_blocks() {
        let fixture = Fixture::new();
        let names: Vec<String> = (0..60).map(|i| format!("file-number-{i:03}")).collect();
        for name in &names {
            fixture.write_file(name, b"");
        }
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::DirReq).unwrap();
        let mut listing = Vec::new();
        let mut block = 1;
        loop {
            match handler.take().as_slice() {
                [Packet::Data { block: b, data }] => {
                    assert_eq!(*b, block);
                    listing.extend_from_slice(data);
                    if data.len() < tftp::DATA_BUFFER_SIZE {
                        break;
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
            protocol.process(Packet::Ack { block }).unwrap();
            block += 1;
        }
        assert!(block > 1);
        assert_eq!(listing, names.join("\0").into_bytes());
    }

    #[test]
    fn test_delete_broadcasts_to_logged_in() {
        let fixture = Fixture::new();
        fixture.write_file("old.log", b"bye");
        let (mut protocol, handler) = fixture.logged_in("alice");
        let (_watcher, watcher_handler) = fixture.logged_in("bob");
        let (_anon, anon_handler) = fixture.session();

        protocol.process(Packet::DeleteReq { path: "missing".to_string() }).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::FileNotFound)]);

        protocol.process(Packet::DeleteReq { path: "old.log".to_string() }).unwrap();
        let deleted =
            Packet::Broadcast { action: BroadcastAction::Deleted, path: "old.log".to_string() };
        assert_eq!(handler.take(), vec![Packet::Ack { block: 0 }, deleted.clone()]);
        assert_eq!(watcher_handler.take(), vec![deleted]);
        assert!(anon_handler.take().is_empty());
        assert!(!fixture.tmpdir.path().join("old.log").exists());
    }

    #[test]
    fn test_inbound_error_and_broadcast_are_illegal() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::error(ErrorCode::NotDefined)).unwrap();
        protocol
            .process(Packet::Broadcast { action: BroadcastAction::Added, path: "f".to_string() })
            .unwrap();
        protocol.process(Packet::Unknown { opcode: 11, payload: vec![] }).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::IllegalOp); 3]);
    }

    #[test]
    fn test_broadcast_with_bad_flag_is_illegal() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.logged_in("alice");

        let packet = Packet::parse_from_buf(&[0x00, 0x09, 0x02, 0x61, 0x00]).unwrap();
        protocol.process(packet).unwrap();
        assert_eq!(handler.take(), vec![Packet::error(ErrorCode::IllegalOp)]);
        assert!(!protocol.should_terminate());
    }

    #[test]
    fn test_disconnect_releases_username() {
        let fixture = Fixture::new();
        let (mut protocol, handler) = fixture.logged_in("alice");

        protocol.process(Packet::Disconnect).unwrap();
        assert_eq!(handler.take(), vec![Packet::Ack { block: 0 }]);
        assert!(protocol.should_terminate());

        let (_again, _) = fixture.logged_in("alice");
    }
}
