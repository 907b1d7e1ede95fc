//! Command-line interface definition for Visitstream
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the pipeline, publish a single visit, and
//! query the local visit store.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Visitstream - visit event pipeline
///
/// Records visits on a Kafka topic, persists them through consumer
/// groups, and answers filtered queries over the stored history.
#[derive(Parser, Debug, Clone)]
#[command(name = "visitstream")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/visitstream.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Visitstream
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP API, the insert workers and the report loop
    Serve {
        /// Override the HTTP listen address (e.g. 127.0.0.1:8080)
        #[arg(short, long)]
        listen: Option<String>,

        /// Use an in-process broker instead of Kafka
        #[arg(long)]
        in_memory: bool,
    },

    /// Publish one visit and wait for the broker to confirm it
    Publish {
        /// Origin key of the visit (usually an IP address)
        #[arg(short, long)]
        origin: String,
    },

    /// Query the visit store and print the result as JSON
    Visits {
        /// Only return visits of this origin key
        #[arg(short, long)]
        key: Option<String>,

        /// Lower bound, inclusive (YYYY, YYYY-MM or YYYY-MM-DD)
        #[arg(long)]
        gt: Option<String>,

        /// Upper bound, inclusive (YYYY, YYYY-MM or YYYY-MM-DD)
        #[arg(long)]
        lt: Option<String>,

        /// Weekday name (e.g. Monday)
        #[arg(long)]
        day: Option<String>,

        /// Override the database path
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse CLI arguments from environment
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/visitstream.yaml".to_string()),
            verbose: false,
            command: Commands::Serve {
                listen: None,
                in_memory: false,
            },
        }
    }
}
