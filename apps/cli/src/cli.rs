//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resumable multipart archive uploads to a vault.
#[derive(Parser, Debug)]
#[command(name = "vaultpush", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config path)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding local vaults (overrides the config file)
    #[arg(long, global = true)]
    pub vault_root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a file as a new archive
    Upload(UploadArgs),

    /// Continue an interrupted upload
    Resume(ResumeArgs),

    /// Discard an open upload and its parts
    Abort {
        /// Upload id to discard
        upload_id: String,

        /// Vault name (defaults to the configured vault)
        #[arg(long)]
        vault: Option<String>,

        /// Fail if the upload does not exist
        #[arg(long)]
        strict: bool,
    },

    /// Print the tree hash of a file
    TreeHash {
        /// File to hash
        file: PathBuf,
    },

    /// Show the part layout for a file or size
    Plan {
        /// File to measure
        #[arg(required_unless_present = "size", conflicts_with = "size")]
        file: Option<PathBuf>,

        /// Archive size in bytes
        #[arg(long)]
        size: Option<u64>,

        /// Part size in MiB instead of the planned one
        #[arg(long)]
        part_size_mib: Option<u64>,
    },
}

/// Options shared by `upload` and `resume`.
#[derive(Args, Debug, Clone, Default)]
pub struct TransferOptions {
    /// Vault name (defaults to the configured vault)
    #[arg(long)]
    pub vault: Option<String>,

    /// Attempts per part, including the first
    #[arg(long)]
    pub retries: Option<u32>,

    /// Do not print progress
    #[arg(long, short)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,

    /// Archive description
    #[arg(long)]
    pub description: Option<String>,

    /// Part size in MiB instead of the planned one
    #[arg(long)]
    pub part_size_mib: Option<u64>,

    #[command(flatten)]
    pub transfer: TransferOptions,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// File being uploaded
    pub file: PathBuf,

    /// Upload id printed by the interrupted run
    pub upload_id: String,

    /// First part to send (defaults to the first part the vault lacks)
    #[arg(long)]
    pub from_part: Option<u32>,

    #[command(flatten)]
    pub transfer: TransferOptions,
}
