//! CLI definitions for the cronhook binary.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cronhook")]
#[command(about = "Durable cron-style HTTP callback scheduler")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (falls back to $CRONHOOK_CONFIG, then ~/.cronhook/cronhook.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler loop and worker pool in the foreground
    Run,

    /// Define a new job
    Add(AddArgs),

    /// List all jobs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete a job (by id or name)
    Remove { job: String },

    /// Enable a job; occurrences missed while disabled are skipped
    Enable { job: String },

    /// Disable a job; in-flight runs still finish
    Disable { job: String },

    /// Show recent runs of a job
    History {
        job: String,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
pub(crate) struct AddArgs {
    /// Unique job name
    #[arg(long)]
    pub name: String,

    /// Five-field cron expression
    #[arg(long, conflicts_with = "at", required_unless_present = "at")]
    pub cron: Option<String>,

    /// One-shot instant (RFC 3339)
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// IANA time zone for --cron (default UTC)
    #[arg(long, requires = "cron")]
    pub timezone: Option<String>,

    /// Callback URL
    #[arg(long)]
    pub url: String,

    #[arg(long, default_value = "POST")]
    pub method: String,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Body template; supports {{job_id}}, {{job_name}}, {{run_id}}, {{attempt}}, {{scheduled_for}}
    #[arg(long)]
    pub body: Option<String>,

    /// Total attempts per occurrence
    #[arg(long, default_value_t = cronhook_scheduler::handle::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Base retry back-off in milliseconds
    #[arg(long, default_value_t = cronhook_scheduler::handle::DEFAULT_RETRY_BACKOFF_MS)]
    pub backoff_ms: u64,

    /// Create the job disabled
    #[arg(long)]
    pub disabled: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{raw}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_header("Authorization: Bearer x:y").unwrap(),
            ("Authorization".to_string(), "Bearer x:y".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": v").is_err());
    }

    #[test]
    fn add_requires_exactly_one_schedule() {
        let base = ["cronhook", "add", "--name", "n", "--url", "https://x.io"];
        assert!(Cli::try_parse_from(base).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["--cron", "* * * * *"])).is_ok());
        assert!(Cli::try_parse_from(base.iter().chain(&["--at", "2030-01-01T00:00:00Z"])).is_ok());
        assert!(Cli::try_parse_from(
            base.iter()
                .chain(&["--cron", "* * * * *", "--at", "2030-01-01T00:00:00Z"])
        )
        .is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
