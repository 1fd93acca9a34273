// Client side of the protocol.
//
// The client is fed from two directions at once: commands typed by the user and packets arriving
// from the server. Each source gets its own thread and both share one ClientProtocol behind a
// mutex. The input thread turns a command into a request and sends it; the network thread turns
// server packets into replies (ACKs, upload blocks) and notices for the user.
//
// DISC is the one command that waits for the server. After sending it the input thread blocks on
// a oneshot channel until the network thread sees the server's answer, so it doesn't go back to
// reading the keyboard for a session that has already ended.

use crate::decoder::{self, PacketReader};
use crate::tftp::{self, BroadcastAction, ErrorCode, OpCode, Packet};
use std::error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tokio::sync::oneshot;

/// A command typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Read(String),
    Write(String),
    Delete(String),
    Login(String),
    Dir,
    Disconnect,
}

#[derive(Debug, PartialEq)]
pub enum CommandError {
    Unknown(String),
    MissingArgument(&'static str),
    InvalidArgument(&'static str),
    UnexpectedArgument(&'static str),
    LocalFileExists(String),
    LocalFileMissing(String),
    Busy,
}

impl error::Error for CommandError {}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unknown(keyword) => write!(f, "Unknown command '{}'", keyword),
            Self::MissingArgument(keyword) => write!(f, "{} needs an argument", keyword),
            Self::InvalidArgument(keyword) => write!(f, "Invalid argument for {}", keyword),
            Self::UnexpectedArgument(keyword) => write!(f, "{} takes no argument", keyword),
            Self::LocalFileExists(name) => write!(f, "File '{}' already exists", name),
            Self::LocalFileMissing(name) => write!(f, "File '{}' does not exist", name),
            Self::Busy => write!(f, "Still waiting for the server to answer the last request"),
        }
    }
}

fn argument(keyword: &'static str, arg: &str) -> Result<String, CommandError> {
    if arg.is_empty() {
        Err(CommandError::MissingArgument(keyword))
    } else if arg.contains('\0') {
        Err(CommandError::InvalidArgument(keyword))
    } else {
        Ok(arg.to_string())
    }
}

fn no_argument(keyword: &'static str, arg: &str, command: Command) -> Result<Command, CommandError> {
    if arg.is_empty() {
        Ok(command)
    } else {
        Err(CommandError::UnexpectedArgument(keyword))
    }
}

impl FromStr for Command {
    type Err = CommandError;

    /// Everything after the first space is the argument, so names may contain spaces.
    fn from_str(line: &str) -> Result<Command, CommandError> {
        let (keyword, arg) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "RRQ" => argument("RRQ", arg).map(Command::Read),
            "WRQ" => argument("WRQ", arg).map(Command::Write),
            "DELRQ" => argument("DELRQ", arg).map(Command::Delete),
            "LOGRQ" => argument("LOGRQ", arg).map(Command::Login),
            "DIRQ" => no_argument("DIRQ", arg, Command::Dir),
            "DISC" => no_argument("DISC", arg, Command::Disconnect),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Something the user should be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Ack(u16),
    Error { code: ErrorCode, message: String },
    Broadcast { action: BroadcastAction, path: String },
    /// One name from a directory listing.
    Listed(String),
    Complete { request: OpCode, name: String },
    LocalFailure(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Notice::Ack(block) => write!(f, "ACK {}", block),
            Notice::Error { code, message } => write!(f, "Error {} ({})", u16::from(*code), message),
            Notice::Broadcast { action, path } => write!(f, "BCAST {} {}", action, path),
            Notice::Listed(name) => write!(f, "{}", name),
            Notice::Complete { request, name } => {
                let request = if *request == OpCode::Rrq { "RRQ" } else { "WRQ" };
                write!(f, "{} {} complete", request, name)
            }
            Notice::LocalFailure(msg) => write!(f, "Local file error: {}", msg),
        }
    }
}

/// What the client should do after processing a server packet.
#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    pub reply: Option<Packet>,
    pub notices: Vec<Notice>,
}

impl Reaction {
    fn none() -> Reaction {
        Reaction::default()
    }

    fn notice(notice: Notice) -> Reaction {
        Reaction { reply: None, notices: vec![notice] }
    }
}

#[derive(Debug)]
enum State {
    Idle,

    /// LOGRQ or DELRQ sent, waiting for ACK 0.
    Requested(OpCode),

    /// DISC sent, waiting for ACK 0.
    Disconnecting,

    Downloading {
        path: PathBuf,
        name: String,
        /// Created when the first block arrives.
        file: Option<File>,
        expected_block: u16,
    },

    /// WRQ sent, waiting for ACK 0 before the first block goes out.
    WriteRequested { path: PathBuf, name: String },

    Uploading {
        file: File,
        name: String,
        in_flight: u16,
        final_sent: bool,
    },

    Listing { fragment: Vec<u8>, expected_block: u16 },
}

pub struct ClientProtocol {
    /// Local directory holding download targets and upload sources.
    dir: PathBuf,
    state: State,
    should_terminate: bool,
    disconnect_waiter: Option<oneshot::Sender<bool>>,
}

/// Reads upload block `block` from the file. A block shorter than 512 bytes (possibly empty) is
/// the last one.
fn next_block(file: &mut File, block: u16) -> io::Result<(Vec<u8>, bool)> {
    let mut data = Vec::with_capacity(tftp::DATA_BUFFER_SIZE);
    Read::by_ref(file)
        .take(tftp::DATA_BUFFER_SIZE as u64)
        .read_to_end(&mut data)?;
    log::debug!("Sending block {block} ({} bytes)", data.len());
    let final_block = data.len() < tftp::DATA_BUFFER_SIZE;
    Ok((data, final_block))
}

impl ClientProtocol {
    pub fn new(dir: impl Into<PathBuf>) -> ClientProtocol {
        ClientProtocol {
            dir: dir.into(),
            state: State::Idle,
            should_terminate: false,
            disconnect_waiter: None,
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate
    }

    /// True when no request or transfer is waiting on the server.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Validates a command against local state and turns it into the request to send.
    pub fn submit(&mut self, command: Command) -> Result<Packet, CommandError> {
        if !self.is_idle() && command != Command::Disconnect {
            return Err(CommandError::Busy);
        }

        let (state, packet) = match command {
            Command::Read(name) => {
                let path = self.dir.join(&name);
                if path.exists() {
                    return Err(CommandError::LocalFileExists(name));
                }
                let packet = Packet::ReadReq { path: name.clone() };
                (State::Downloading { path, name, file: None, expected_block: 1 }, packet)
            }
            Command::Write(name) => {
                let path = self.dir.join(&name);
                if !path.is_file() {
                    return Err(CommandError::LocalFileMissing(name));
                }
                let packet = Packet::WriteReq { path: name.clone() };
                (State::WriteRequested { path, name }, packet)
            }
            Command::Delete(path) => (State::Requested(OpCode::Delrq), Packet::DeleteReq { path }),
            Command::Login(username) => {
                (State::Requested(OpCode::Logrq), Packet::LoginReq { username })
            }
            Command::Dir => (
                State::Listing { fragment: Vec::new(), expected_block: 1 },
                Packet::DirReq,
            ),
            Command::Disconnect => (State::Disconnecting, Packet::Disconnect),
        };

        self.state = state;
        Ok(packet)
    }

    /// Arms the rendezvous the input thread waits on after sending DISC. The receiver yields
    /// true once the session is over, false if the server refused the disconnect.
    pub fn await_disconnect(&mut self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.disconnect_waiter = Some(tx);
        rx
    }

    fn release_input(&mut self, terminated: bool) {
        if let Some(tx) = self.disconnect_waiter.take() {
            let _ = tx.send(terminated);
        }
    }

    /// The server went away; nothing more will arrive.
    pub fn connection_closed(&mut self) {
        self.state = State::Idle;
        self.should_terminate = true;
        self.release_input(true);
    }

    pub fn process(&mut self, packet: Packet) -> Reaction {
        match packet {
            Packet::Data { block, data } => self.receive_block(block, data),
            Packet::Ack { block } => self.acknowledge(block),
            Packet::Error { code, message } => {
                let previous = std::mem::replace(&mut self.state, State::Idle);
                if matches!(previous, State::Disconnecting) {
                    self.release_input(false);
                }
                Reaction::notice(Notice::Error { code, message })
            }
            Packet::Broadcast { action, path } => Reaction::notice(Notice::Broadcast { action, path }),
            other => {
                log::warn!("Ignoring unexpected {:?} from the server", other.opcode());
                Reaction::none()
            }
        }
    }

    fn abandon(&mut self, e: io::Error) -> Reaction {
        log::error!("Abandoning transfer: {e}");
        self.state = State::Idle;
        Reaction::notice(Notice::LocalFailure(e.to_string()))
    }

    fn receive_block(&mut self, block: u16, data: Vec<u8>) -> Reaction {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Downloading { path, name, file, expected_block } if block == expected_block => {
                let mut file = match file {
                    Some(f) => f,
                    None => match OpenOptions::new().write(true).create_new(true).open(&path) {
                        Ok(f) => f,
                        Err(e) => return self.abandon(e),
                    },
                };
                if let Err(e) = file.write_all(&data) {
                    return self.abandon(e);
                }

                let mut reaction = Reaction { reply: Some(Packet::Ack { block }), notices: vec![] };
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    reaction.notices.push(Notice::Complete { request: OpCode::Rrq, name });
                } else {
                    self.state = State::Downloading {
                        path,
                        name,
                        file: Some(file),
                        expected_block: expected_block.wrapping_add(1),
                    };
                }
                reaction
            }
            State::Listing { mut fragment, expected_block } if block == expected_block => {
                let mut notices = Vec::new();
                for byte in &data {
                    if *byte == 0x00 {
                        notices.push(Notice::Listed(String::from_utf8_lossy(&fragment).into_owned()));
                        fragment.clear();
                    } else {
                        fragment.push(*byte);
                    }
                }

                if data.len() < tftp::DATA_BUFFER_SIZE {
                    if !fragment.is_empty() {
                        notices.push(Notice::Listed(String::from_utf8_lossy(&fragment).into_owned()));
                    }
                } else {
                    self.state = State::Listing {
                        fragment,
                        expected_block: expected_block.wrapping_add(1),
                    };
                }
                Reaction { reply: Some(Packet::Ack { block }), notices }
            }
            other => {
                log::debug!("Ignoring DATA {block}");
                self.state = other;
                Reaction::none()
            }
        }
    }

    fn acknowledge(&mut self, block: u16) -> Reaction {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Requested(request) if block == 0 => {
                log::debug!("{:?} acknowledged", request);
                Reaction::notice(Notice::Ack(0))
            }
            State::Disconnecting if block == 0 => {
                self.should_terminate = true;
                self.release_input(true);
                Reaction::notice(Notice::Ack(0))
            }
            State::WriteRequested { path, name } if block == 0 => {
                let mut file = match File::open(&path) {
                    Ok(f) => f,
                    Err(e) => return self.abandon(e),
                };
                match next_block(&mut file, 1) {
                    Ok((data, final_sent)) => {
                        self.state = State::Uploading { file, name, in_flight: 1, final_sent };
                        Reaction {
                            reply: Some(Packet::Data { block: 1, data }),
                            notices: vec![Notice::Ack(0)],
                        }
                    }
                    Err(e) => self.abandon(e),
                }
            }
            State::Uploading { mut file, name, in_flight, final_sent } if block == in_flight => {
                if final_sent {
                    return Reaction {
                        reply: None,
                        notices: vec![
                            Notice::Ack(block),
                            Notice::Complete { request: OpCode::Wrq, name },
                        ],
                    };
                }
                let next = in_flight.wrapping_add(1);
                match next_block(&mut file, next) {
                    Ok((data, final_sent)) => {
                        self.state = State::Uploading { file, name, in_flight: next, final_sent };
                        Reaction {
                            reply: Some(Packet::Data { block: next, data }),
                            notices: vec![Notice::Ack(block)],
                        }
                    }
                    Err(e) => self.abandon(e),
                }
            }
            other => {
                log::debug!("Ignoring ACK {block}");
                self.state = other;
                Reaction::none()
            }
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs an interactive session over `stream` until the user disconnects or input ends. Commands
/// come from `lines`; everything meant for the user is written to `output`.
pub fn run_client<L, W>(stream: TcpStream, dir: PathBuf, lines: L, output: W) -> io::Result<()>
where
    L: IntoIterator<Item = io::Result<String>>,
    W: Write + Send + 'static,
{
    let protocol = Arc::new(Mutex::new(ClientProtocol::new(dir)));
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let output = Arc::new(Mutex::new(output));

    let network = {
        let protocol = Arc::clone(&protocol);
        let writer = Arc::clone(&writer);
        let output = Arc::clone(&output);
        thread::Builder::new()
            .name("server-listener".to_string())
            .spawn(move || listen(stream, protocol, writer, output))?
    };

    let result = read_commands(lines, &protocol, &writer, &output);

    let _ = lock(&writer).shutdown(Shutdown::Both);
    network
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "server listener panicked"))?;
    result
}

fn read_commands<L, W>(
    lines: L,
    protocol: &Mutex<ClientProtocol>,
    writer: &Mutex<TcpStream>,
    output: &Mutex<W>,
) -> io::Result<()>
where
    L: IntoIterator<Item = io::Result<String>>,
    W: Write,
{
    for line in lines {
        let line = line?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }

        let rendezvous = {
            let mut protocol = lock(protocol);
            if protocol.should_terminate() {
                break;
            }
            let packet = match line.parse::<Command>().and_then(|c| protocol.submit(c)) {
                Ok(packet) => packet,
                Err(e) => {
                    writeln!(lock(output), "{e}")?;
                    continue;
                }
            };
            let rendezvous = (packet == Packet::Disconnect).then(|| protocol.await_disconnect());
            decoder::write_packet(&mut *lock(writer), &packet)?;
            rendezvous
        };

        if let Some(rx) = rendezvous {
            match rx.blocking_recv() {
                Ok(false) => continue,
                Ok(true) | Err(_) => break,
            }
        }
    }
    Ok(())
}

fn listen<W: Write>(
    stream: TcpStream,
    protocol: Arc<Mutex<ClientProtocol>>,
    writer: Arc<Mutex<TcpStream>>,
    output: Arc<Mutex<W>>,
) {
    let mut reader = PacketReader::new(stream);
    loop {
        let packet = match reader.read_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Lost the server: {e}");
                break;
            }
        };

        let mut protocol = lock(&protocol);
        let reaction = protocol.process(packet);
        {
            let mut output = lock(&output);
            for notice in &reaction.notices {
                if writeln!(output, "{notice}").is_err() {
                    log::warn!("Unable to print {:?}", notice);
                }
            }
            let _ = output.flush();
        }
        if let Some(reply) = reaction.reply {
            if let Err(e) = decoder::write_packet(&mut *lock(&writer), &reply) {
                log::warn!("Unable to reply to the server: {e}");
                break;
            }
        }
        if protocol.should_terminate() {
            break;
        }
    }
    lock(&protocol).connection_closed();
}
