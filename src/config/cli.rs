use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the querysync binary.
#[derive(Debug, Parser)]
#[command(
    name = "querysync",
    version,
    about = "Inspect and manage persisted querysync client state"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "QUERYSYNC_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Rehydrate the persisted auth record and print the resulting session.
    Session(SessionArgs),
    /// Delete the persisted auth record.
    Purge(PurgeArgs),
}

impl Default for Command {
    fn default() -> Self {
        Self::Session(SessionArgs::default())
    }
}

impl Command {
    pub fn overrides(&self) -> &Overrides {
        match self {
            Self::Session(args) => &args.overrides,
            Self::Purge(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct SessionArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Pretty-print the JSON output.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory holding persisted records.
    #[arg(
        long = "persistence-directory",
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    pub persistence_directory: Option<PathBuf>,

    /// Override the persisted record key (stored as `persist:<key>`).
    #[arg(long = "persistence-key", value_name = "KEY")]
    pub persistence_key: Option<String>,

    /// Override the persisted record version this build expects.
    #[arg(long = "persistence-version", value_name = "VERSION")]
    pub persistence_version: Option<u32>,
}
