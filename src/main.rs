use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use tftpx::client::{self, TransferOptions};
use tftpx::server::Server;
use tftpx::tftp::FileMode;

/// File transfer over UDP with optional gzip compression and netascii text
/// mode.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve files out of a local directory.
    Server {
        /// Address to listen on.
        #[arg(short = 'a', long = "address", default_value = "127.0.0.1:69")]
        address: SocketAddr,
        /// Directory served to clients and written to by them.
        #[arg(short = 'd', long = "dir", default_value = ".")]
        dir: PathBuf,
    },
    /// Fetch a file from a server, or send one to it.
    Client {
        /// Server address.
        #[arg(short = 's', long = "server", default_value = "127.0.0.1:69")]
        server: SocketAddr,
        /// Filename to fetch or send.
        #[arg(short = 'p', long = "path")]
        path: String,
        /// Transfer mode: octet or netascii.
        #[arg(short = 'm', long = "mode", default_value = "octet")]
        mode: FileMode,
        /// Compress the payload in flight.
        #[arg(short = 'c', long = "compress")]
        compress: bool,
        /// Send the file instead of fetching it.
        #[arg(short = 'u', long = "upload")]
        upload: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::init();

    match Cli::parse().mode {
        Mode::Server { address, dir } => {
            let server = Server {
                root: dir,
                ..Server::default()
            };
            server.listen_and_serve(address).await?;
        }
        Mode::Client {
            server,
            path,
            mode,
            compress,
            upload,
        } => {
            let mut opts = TransferOptions::new(server);
            opts.mode = mode;
            opts.compress = compress;

            let result = if upload {
                client::store(&opts, Path::new(&path)).await
            } else {
                client::fetch(&opts, &path).await.map(|_| ())
            };

            match result {
                Ok(()) => println!("Transfer successful"),
                Err(e) => {
                    println!("{}", e);
                    process::exit(1);
                }
            }
        }
    }

    Ok(())
}
