// src/config.rs

use std::fmt;
use std::time::Duration;

use chrono::Datelike;
use clap::{ArgAction, Parser, ValueEnum};
use thiserror::Error;

use crate::fetch::{Month, SourceLocator};
use crate::results::server::DEFAULT_PORT;

/// Earliest year accepted by `--years`.
pub const MIN_YEAR: i32 = 1970;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CommandKind {
    /// Chunk census records onto the compute topic
    Read,
    /// Turn batches from the compute topic into result records
    Compute,
    /// Aggregate result records and serve them over HTTP
    Results,
    /// List topics with their partitions and leaders
    Topiclist,
    /// Show first/last/committed offsets per partition of --topic
    Offsets,
    /// Delete the topics named by --topic
    Rmtopics,
    /// Run read, compute and results in one process over an in-memory log
    Pipeline,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(v) => f.write_str(v.get_name()),
            None => write!(f, "{:?}", self),
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Chunks CPS census files through Kafka and tallies housing unit types"
)]
pub struct Cli {
    #[arg(value_enum)]
    pub command: CommandKind,

    /// Kafka bootstrap brokers, e.g. 10.0.0.4:9092,10.0.0.5:9092
    #[arg(long, env = "KAFKA_BROKERS")]
    pub kafka: Option<String>,

    /// Comma-separated years, e.g. 2019,2020
    #[arg(long)]
    pub years: Option<String>,

    /// Comma-separated month abbreviations (jan,feb,...) or '*' for all
    #[arg(long)]
    pub months: Option<String>,

    /// Read one census file (path or http URL) instead of the census site
    #[arg(long)]
    pub from_file: Option<String>,

    /// Stop after this many batches; -1 reads everything
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub chunks: i64,

    /// Echo output to stdout instead of writing to Kafka
    #[arg(long)]
    pub stdout: bool,

    /// Write output to Kafka; false discards it
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub write_kafka: bool,

    /// Partitions for topics this run creates
    #[arg(long, default_value_t = 1)]
    pub partitions: i32,

    #[arg(long, default_value_t = 1)]
    pub replication_factor: i32,

    /// Topic for `offsets`, comma-separated topics for `rmtopics`
    #[arg(long)]
    pub topic: Option<String>,

    /// Port for the results HTTP server
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Per-message delay in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    #[arg(long)]
    pub verbose: bool,

    /// Print the interpreted settings and exit
    #[arg(long)]
    pub dry_run: bool,
}

/// Where a producing stage sends its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTo {
    Kafka,
    Stdout,
    Discard,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{0}' needs Kafka broker URL(s): pass --kafka or set KAFKA_BROKERS")]
    MissingBrokers(CommandKind),
    #[error("'read' needs --years and --months, or --from-file with --years")]
    MissingSources,
    #[error("'{0}' with --from-file needs exactly one --years value, the year of the file")]
    FromFileYear(CommandKind),
    #[error("'pipeline' needs --from-file")]
    PipelineSource,
    #[error("can't parse years {0:?}: each must be an integer between 1970 and {1}")]
    Years(String, i32),
    #[error("can't parse months {0:?}: use abbreviations like jan,feb,mar or '*'")]
    Months(String),
    #[error("'{0}' needs --topic")]
    MissingTopic(CommandKind),
    #[error("--chunks must be -1 or a non-negative count, got {0}")]
    Chunks(i64),
    #[error("--{0} must be at least 1")]
    NonPositive(&'static str),
}

/// Validated run configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub command: CommandKind,
    pub brokers: Option<String>,
    pub years: Vec<i32>,
    pub months: Vec<Month>,
    pub from_file: Option<SourceLocator>,
    /// Batch ceiling for the run; `None` reads everything.
    pub ceiling: Option<usize>,
    pub write_to: WriteTo,
    pub partitions: i32,
    pub replication: i32,
    pub topics: Vec<String>,
    pub port: u16,
    pub delay: Duration,
    pub verbose: bool,
    pub dry_run: bool,
}

fn parse_years(raw: &str) -> Result<Vec<i32>, ConfigError> {
    let max = chrono::Utc::now().year();
    raw.split(',')
        .map(|s| match s.trim().parse::<i32>() {
            Ok(y) if (MIN_YEAR..=max).contains(&y) => Ok(y),
            _ => Err(ConfigError::Years(raw.to_string(), max)),
        })
        .collect()
}

fn parse_months(raw: &str) -> Result<Vec<Month>, ConfigError> {
    if raw.trim() == "*" {
        return Ok(Month::ALL.to_vec());
    }
    raw.split(',')
        .map(|s| s.parse().map_err(|_| ConfigError::Months(raw.to_string())))
        .collect()
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|r| {
        r.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        use CommandKind::*;

        let command = cli.command;
        let write_to = if cli.stdout {
            WriteTo::Stdout
        } else if cli.write_kafka {
            WriteTo::Kafka
        } else {
            WriteTo::Discard
        };
        let brokers = cli
            .kafka
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());

        let needs_brokers = matches!(command, Compute | Results | Topiclist | Offsets | Rmtopics)
            || (command == Read && write_to == WriteTo::Kafka);
        if needs_brokers && brokers.is_none() {
            return Err(ConfigError::MissingBrokers(command));
        }

        let from_file = cli.from_file.as_deref().map(SourceLocator::parse);
        match command {
            Read if from_file.is_none() && (cli.years.is_none() || cli.months.is_none()) => {
                return Err(ConfigError::MissingSources)
            }
            Pipeline if from_file.is_none() => return Err(ConfigError::PipelineSource),
            _ => {}
        }

        let years = cli.years.as_deref().map(parse_years).transpose()?.unwrap_or_default();
        let months = cli.months.as_deref().map(parse_months).transpose()?.unwrap_or_default();
        if matches!(command, Read | Pipeline) && from_file.is_some() && years.len() != 1 {
            return Err(ConfigError::FromFileYear(command));
        }

        let topics = split_list(cli.topic.as_deref());
        if matches!(command, Offsets | Rmtopics) && topics.is_empty() {
            return Err(ConfigError::MissingTopic(command));
        }

        let ceiling = match cli.chunks {
            -1 => None,
            n if n >= 0 => Some(n as usize),
            n => return Err(ConfigError::Chunks(n)),
        };
        if cli.partitions < 1 {
            return Err(ConfigError::NonPositive("partitions"));
        }
        if cli.replication_factor < 1 {
            return Err(ConfigError::NonPositive("replication-factor"));
        }

        Ok(Self {
            command,
            brokers,
            years,
            months,
            from_file,
            ceiling,
            write_to,
            partitions: cli.partitions,
            replication: cli.replication_factor,
            topics,
            port: cli.port,
            delay: Duration::from_millis(cli.delay),
            verbose: cli.verbose,
            dry_run: cli.dry_run,
        })
    }

    /// Human-readable account of how the run would proceed.
    pub fn describe(&self) -> String {
        use CommandKind::*;

        let mut lines = vec![format!("Command: {}", self.command)];
        if matches!(self.command, Read | Pipeline) {
            let years: Vec<String> = self.years.iter().map(i32::to_string).collect();
            let months: Vec<&str> = self.months.iter().map(|m| m.abbrev()).collect();
            lines.push(format!("Years: {}", years.join(",")));
            lines.push(format!("Months: {}", months.join(",")));
            if let Some(f) = &self.from_file {
                lines.push(format!("From file: {}", f));
            }
            lines.push(match self.ceiling {
                Some(n) => format!("Chunk count: {}", n),
                None => "Chunk count: all".to_string(),
            });
        }
        if matches!(self.command, Read | Compute) {
            lines.push(match self.write_to {
                WriteTo::Kafka => format!(
                    "Kafka brokers: {}\nPartitions: {}\nReplication factor: {}",
                    self.brokers.as_deref().unwrap_or_default(),
                    self.partitions,
                    self.replication
                ),
                WriteTo::Stdout => "Write to stdout rather than Kafka".to_string(),
                WriteTo::Discard => "Discard output (neither Kafka nor stdout)".to_string(),
            });
        }
        if matches!(self.command, Results | Pipeline) {
            if let Some(b) = &self.brokers {
                lines.push(format!("Kafka brokers: {}", b));
            }
            lines.push(format!("Results port: {}", self.port));
        }
        if matches!(self.command, Topiclist | Offsets | Rmtopics) {
            lines.push(format!("Topic: {}", self.topics.join(",")));
        }
        if !self.delay.is_zero() {
            lines.push(format!("Delay: {}ms", self.delay.as_millis()));
        }
        lines.join("\n")
    }
}
