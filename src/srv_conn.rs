// This module contains the server-side connection handling.
//
// The server accepts TCP connections and gives each one its own thread. That thread owns the read
// half of the socket: it pulls bytes through the frame decoder and hands each complete packet to
// the connection's ServerProtocol, so packets from one peer are processed strictly in arrival
// order. The write half is shared through the registry, because other connections' threads need
// to reach this peer for broadcasts.
//
// A connection ends when the peer disconnects (DISC), when the socket closes or fails, or when a
// storage failure breaks a transfer midway. Either way the registry entry is cleared and no other
// connection is affected.

use crate::decoder::{self, PacketReader};
use crate::processor::ServerProtocol;
use crate::registry::{ConnectionHandler, ConnectionId, Connections};
use crate::storage::Storage;
use crate::tftp::{self, Packet};
use std::error;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;

/// The write half of an accepted socket.
pub struct TcpConnection {
    stream: Mutex<TcpStream>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> TcpConnection {
        TcpConnection { stream: Mutex::new(stream) }
    }

    /// Shuts the socket down in both directions, which also wakes a blocked reader.
    pub fn close(&self) {
        if let Ok(stream) = self.stream.lock() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl ConnectionHandler for TcpConnection {
    fn send(&self, packet: &Packet) -> io::Result<()> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection writer poisoned"))?;
        decoder::write_packet(&mut *stream, packet)
    }
}

/// Accepts connections and serves each one on a dedicated thread.
pub struct Server {
    listener: TcpListener,
    connections: Arc<Connections>,
    storage: Arc<Storage>,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(addr: A, storage: Storage) -> io::Result<Server> {
        Ok(Server {
            listener: TcpListener::bind(addr)?,
            connections: Arc::new(Connections::new()),
            storage: Arc::new(storage),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> Arc<Connections> {
        Arc::clone(&self.connections)
    }

    /// Runs the accept loop. Only returns if spawning a connection thread fails.
    pub fn serve(self) -> io::Result<()> {
        log::info!(
            "Serving {} on {}",
            self.storage.root().display(),
            self.listener.local_addr()?
        );

        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    continue;
                }
            };

            let id = self.connections.new_connection_id();
            let connections = Arc::clone(&self.connections);
            let storage = Arc::clone(&self.storage);
            thread::Builder::new()
                .name(format!("conn-{id}"))
                .spawn(move || {
                    if let Err(e) = handle_connection(id, stream, connections, storage) {
                        log::warn!("Connection {id} closed with error: {e}");
                    }
                })?;
        }
        Ok(())
    }
}

fn handle_connection(
    id: ConnectionId,
    stream: TcpStream,
    connections: Arc<Connections>,
    storage: Arc<Storage>,
) -> Result<(), ServerConnectionError> {
    let peer = stream.peer_addr()?;
    let handler = Arc::new(TcpConnection::new(stream.try_clone()?));
    if !connections.connect(id, handler.clone()) {
        return Err(ServerConnectionError::Internal(format!("connection id {id} reused")));
    }
    log::info!("Connection {id} accepted from {peer}");

    let mut protocol = ServerProtocol::start(id, Arc::clone(&connections), storage);
    let result = serve_packets(&mut protocol, PacketReader::new(stream));

    connections.disconnect(id);
    handler.close();
    log::info!("Connection {id} from {peer} closed");
    result
}

fn serve_packets(
    protocol: &mut ServerProtocol,
    mut reader: PacketReader<TcpStream>,
) -> Result<(), ServerConnectionError> {
    while !protocol.should_terminate() {
        match reader.read_packet()? {
            Some(packet) => protocol.process(packet)?,
            None => break,
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum ServerConnectionError {
    Socket(io::Error),
    File(io::Error),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "Socket IO error: {}", e),
            Self::File(e) => write!(f, "File IO error: {}", e),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}

impl From<tftp::PacketError> for ServerConnectionError {
    fn from(e: tftp::PacketError) -> ServerConnectionError {
        match e {
            tftp::PacketError::IO(e) => ServerConnectionError::Socket(e),
            tftp::PacketError::PacketParse(msg) => ServerConnectionError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::ErrorCode;
    use tempdir::TempDir;

    fn start_server() -> (TempDir, SocketAddr, Arc<Connections>) {
        let tmpdir = TempDir::new("scratch").unwrap();
        let server = Server::bind("127.0.0.1:0", Storage::new(tmpdir.path()).unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let connections = server.connections();
        thread::spawn(move || server.serve());
        (tmpdir, addr, connections)
    }

    #[test]
    fn test_connection_lifecycle() {
        let (_tmpdir, addr, connections) = start_server();
        let stream = TcpStream::connect(addr).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = PacketReader::new(stream);

        decoder::write_packet(&mut writer, &Packet::DirReq).unwrap();
        assert_eq!(
            reader.read_packet().unwrap(),
            Some(Packet::error(ErrorCode::NotLoggedIn))
        );

        decoder::write_packet(&mut writer, &Packet::LoginReq { username: "dora".to_string() })
            .unwrap();
        assert_eq!(reader.read_packet().unwrap(), Some(Packet::Ack { block: 0 }));

        decoder::write_packet(&mut writer, &Packet::Disconnect).unwrap();
        assert_eq!(reader.read_packet().unwrap(), Some(Packet::Ack { block: 0 }));
        assert_eq!(reader.read_packet().unwrap(), None);

        // The name is free again once the connection is gone.
        let probe = connections.new_connection_id();
        assert!(connections.connect(probe, Arc::new(crate::registry::testing::RecordingHandler::default())));
        assert!(connections.login(probe, "dora"));
    }
}
