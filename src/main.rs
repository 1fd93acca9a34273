use std::io;
use std::net::{Ipv4Addr, TcpStream};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;

use tftp_tcp::cli::{Cli, ClientArgs, Command, ServerArgs};
use tftp_tcp::client;
use tftp_tcp::srv_conn::Server;
use tftp_tcp::storage::Storage;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server(args) => {
            env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
            run_server(args)
        }
        Command::Client(args) => {
            // Keep log lines from interleaving with interactive output.
            env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
            run_client(args)
        }
    }
}

fn run_server(args: ServerArgs) -> Result<()> {
    let storage = Storage::new(&args.root)
        .with_context(|| format!("failed to open storage root {}", args.root.display()))?;
    let server = Server::bind((Ipv4Addr::UNSPECIFIED, args.port), storage)
        .with_context(|| format!("failed to bind port {}", args.port))?;
    server.serve().context("server stopped")
}

fn run_client(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    client::run_client(stream, args.dir, io::stdin().lines(), io::stdout())
        .context("client session failed")
}
