use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

/// Log level options for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    Off,
    /// Error messages only
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages (default)
    Info,
    /// Debug messages, including per-frame traffic
    Debug,
    /// Trace-level messages (most verbose)
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "chainrpc")]
#[command(about = "chainrpc - issue JSON-RPC calls and follow subscriptions on a node")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set log level (off, error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Enable verbose logging (shortcut for --log-level=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path (TOML or JSON)
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Node endpoint: unix:/path, tcp://host:port, ws://... or wss://...
    /// (overrides config file and CHAINRPC_ENDPOINT)
    #[arg(short, long, global = true)]
    pub endpoint: Option<String>,
}

impl Cli {
    pub fn level(&self) -> LevelFilter {
        match (self.log_level, self.verbose) {
            (Some(level), _) => level.into(),
            (None, true) => LevelFilter::DEBUG,
            (None, false) => LevelFilter::INFO,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Issue one call and print its result
    Call {
        /// Method name, e.g. chain_getHeader
        method: String,

        /// Parameters as a JSON array or object
        params: Option<String>,
    },

    /// Subscribe and print each push
    Subscribe {
        /// Subscribe method, e.g. chain_subscribeNewHeads
        method: String,

        /// Parameters as a JSON array or object
        params: Option<String>,

        /// Method used to unsubscribe on exit, e.g. chain_unsubscribeNewHeads
        #[arg(short, long)]
        unsubscribe: Option<String>,

        /// Stop after this many pushes
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}
