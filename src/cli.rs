use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a storage directory to logged-in clients.
    Server(ServerArgs),
    /// Connect to a server and issue commands typed on stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// TCP port to listen on.
    #[arg(default_value_t = 7777)]
    pub port: u16,

    /// Directory holding the served files. Created if missing.
    #[arg(long, default_value = "Files")]
    pub root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server host name or address.
    #[arg(default_value = "localhost")]
    pub host: String,

    /// Server port.
    #[arg(default_value_t = 7777)]
    pub port: u16,

    /// Local directory that downloads land in and uploads are read from.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}
