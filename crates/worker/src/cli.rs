//! Command-line surface.
//!
//! Everything except the subcommand and its arguments comes from
//! `NEWSRELAY_*` environment variables (see `newsrelay_infra::config`).

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

use newsrelay_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "newsrelay-worker")]
#[command(version, about = "Article collection and CDC relay workers")]
pub struct Cli {
    /// Log output format (json, pretty); overrides NEWSRELAY_LOG_FORMAT
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Collect one day of articles from the listing API into Postgres
    Collect {
        /// Publication date (YYYY-MM-DD); defaults to today in UTC
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Run CDC relay workers until interrupted
    Relay {
        #[arg(long, value_enum, default_value_t = Pipeline::All)]
        pipeline: Pipeline,
    },
}

/// Which relay workers to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Pipeline {
    Article,
    Analysis,
    All,
}

impl Pipeline {
    pub fn includes_article(self) -> bool {
        matches!(self, Self::Article | Self::All)
    }

    pub fn includes_analysis(self) -> bool {
        matches!(self, Self::Analysis | Self::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_parses_an_explicit_date() {
        let cli = Cli::try_parse_from(["newsrelay-worker", "collect", "--date", "2024-05-01"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Collect {
                date: NaiveDate::from_ymd_opt(2024, 5, 1)
            }
        );
        assert_eq!(cli.log_format, None);
    }

    #[test]
    fn collect_rejects_a_malformed_date() {
        assert!(Cli::try_parse_from(["newsrelay-worker", "collect", "--date", "May 1st"]).is_err());
    }

    #[test]
    fn relay_defaults_to_every_pipeline() {
        let cli = Cli::try_parse_from(["newsrelay-worker", "relay"]).unwrap();
        assert_eq!(cli.command, Command::Relay { pipeline: Pipeline::All });
        assert!(Pipeline::All.includes_article());
        assert!(Pipeline::All.includes_analysis());
    }

    #[test]
    fn relay_can_be_limited_to_one_pipeline() {
        let cli = Cli::try_parse_from(["newsrelay-worker", "relay", "--pipeline", "analysis"]).unwrap();
        assert_eq!(cli.command, Command::Relay { pipeline: Pipeline::Analysis });
        assert!(!Pipeline::Analysis.includes_article());
    }

    #[test]
    fn log_format_flag_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from(["newsrelay-worker", "relay", "--log-format", "pretty"]).unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Pretty));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["newsrelay-worker"]).is_err());
    }
}
