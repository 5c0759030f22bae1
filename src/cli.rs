// 命令行参数解析
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scp-client")]
#[command(about = "Browse, transfer files and run commands on a remote host over SSH/SFTP")]
#[command(version = "0.1.0")]
pub struct Cli {
    /// SSH server hostname or IP address
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// SSH server port
    #[arg(short, long, default_value = "22")]
    pub port: u16,

    /// SSH username
    #[arg(short, long)]
    pub username: Option<String>,

    /// SSH password (if not provided, will prompt for input)
    #[arg(short = 'P', long)]
    pub password: Option<String>,

    /// SSH private key file path
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,

    /// Passphrase for the private key
    #[arg(long)]
    pub passphrase: Option<String>,

    /// Name of a saved connection profile
    #[arg(long)]
    pub profile: Option<String>,

    /// Connection profiles file (JSON)
    #[arg(long)]
    pub profiles: Option<PathBuf>,

    /// known_hosts file used as the trust ledger
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Accept unknown host keys after a successful login (trust on first use)
    #[arg(long)]
    pub accept_new: bool,

    /// Number of transfers allowed to stream in parallel
    #[arg(short, long, default_value = "4")]
    pub threads: usize,

    /// Chunk size in bytes
    #[arg(short, long, default_value = "32768")]
    pub chunk_size: usize,

    /// TCP connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Remote command timeout in seconds
    #[arg(long)]
    pub command_timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List a remote directory
    Ls {
        /// Remote directory (defaults to the login directory)
        path: Option<String>,
    },
    /// Upload a file to the remote server
    Upload {
        /// Local file path
        local_path: PathBuf,
        /// Remote destination path or directory
        remote_path: String,
        /// Compare MD5 checksums after the transfer
        #[arg(long)]
        verify: bool,
    },
    /// Download a file from the remote server
    Download {
        /// Remote file path
        remote_path: String,
        /// Local destination path or directory
        local_path: PathBuf,
        /// Compare MD5 checksums after the transfer
        #[arg(long)]
        verify: bool,
    },
    /// Create a remote directory
    Mkdir { path: String },
    /// Delete a remote file
    Rm { path: String },
    /// Delete an empty remote directory
    Rmdir { path: String },
    /// Run a command on the remote host
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Manage accepted host keys
    Trust {
        #[command(subcommand)]
        action: TrustCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum TrustCommand {
    /// Show hosts in the known_hosts ledger
    List,
    /// Forget every accepted host key
    Reset,
}
