use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelhouse")]
#[command(author, version, about = "Media library indexer and range-streaming server")]
pub struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch the library and serve it over HTTP
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Walk and index every library root once, then print entry counts
    Scan,

    /// Run the extractor chain on one file
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored entries
    List {
        /// indexed, pending, stale, removed or all
        #[arg(long, default_value = "all")]
        state: String,
    },

    /// Validate configuration file
    Validate,

    /// Display version information
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["reelhouse", "start", "--port", "9000", "-vv", "-c", "a.json"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("a.json")));
        match cli.command {
            Commands::Start { host, port } => {
                assert_eq!(host, None);
                assert_eq!(port, Some(9000));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn list_defaults_to_all() {
        let cli = Cli::try_parse_from(["reelhouse", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::List { ref state } if state == "all"));
    }

    #[test]
    fn probe_requires_file() {
        assert!(Cli::try_parse_from(["reelhouse", "probe"]).is_err());
    }
}
