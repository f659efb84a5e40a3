//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigSource;
use crate::content::CatalogFormat;

/// Command-line client for the MediaServer API
#[derive(Debug, Parser)]
#[command(name = "msc")]
#[command(about = "Upload, download and back up media on a MediaServer", long_about = None)]
pub struct CliArgs {
    /// JSON configuration file, or `unix:<user>` to use a local instance
    #[arg(short, long, value_name = "SOURCE", global = true)]
    pub conf: Option<ConfigSource>,

    /// Server URL, overrides the configuration file
    #[arg(long, value_name = "URL", global = true)]
    pub server_url: Option<String>,

    /// API key, overrides the configuration file
    #[arg(long, value_name = "KEY", global = true)]
    pub api_key: Option<String>,

    /// Number of retries after a retryable failure
    #[arg(long, value_name = "N", global = true)]
    pub max_retry: Option<u32>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check the server answers and print its version
    Ping,

    /// Call an API endpoint and print the JSON answer
    Api {
        /// Endpoint, relative to `/api/v2/`
        uri: String,
        /// HTTP method
        #[arg(short, long, default_value = "get")]
        method: String,
        /// Request parameter, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Upload a file and create a media with it
    Upload {
        file: PathBuf,
        /// Title of the new media
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Upload an HLS playlist and its fragments
    UploadHls {
        m3u8: PathBuf,
        /// Remote directory name (10 to 50 characters)
        #[arg(long)]
        remote_dir: Option<String>,
    },

    /// Download the metadata archive of a media
    DownloadMetadata { oid: String, dir: PathBuf },

    /// Download the best resource file of a media
    DownloadResource {
        oid: String,
        dir: PathBuf,
        /// Only accept the variant used by the player
        #[arg(long)]
        playable: bool,
    },

    /// Create or refresh the backup archive of a media
    Backup {
        oid: String,
        dir: PathBuf,
        /// Nest the archive under its channel directories
        #[arg(long)]
        replicate_tree: bool,
        #[arg(long)]
        playable: bool,
    },

    /// Export the whole catalog
    Catalog {
        /// flat, tree or csv
        #[arg(short, long, default_value = "flat")]
        format: CatalogFormat,
        /// Write to this file instead of the standard output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Create the users listed in a `;`-separated file
    ImportUsers { csv: PathBuf },

    /// Delete every channel and all their content
    RemoveAllContent {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn parse_key_value(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got \"{}\"", value)),
    }
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Log level forced by `--verbose` or `--quiet`, if any
    pub fn log_level(&self) -> Option<tracing::Level> {
        if self.verbose {
            Some(tracing::Level::DEBUG)
        } else if self.quiet {
            Some(tracing::Level::ERROR)
        } else {
            None
        }
    }
}
