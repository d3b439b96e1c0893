//! CLI for round-robin databases through rrdio.
//!
//! Provides commands for creating, updating, inspecting and reading
//! databases, and for flushing a caching daemon.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand, ValueEnum};
use rrdio::args::{epoch_secs, from_epoch_secs};
use rrdio::{Client, DatabaseConfig, Engine, Param};
use tracing_subscriber::EnvFilter;

/// rrdio: create, update and read round-robin databases.
#[derive(Parser)]
#[command(name = "rrdio", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create a database from a JSON definition file.
    Create {
        /// Path to the definition file.
        definition: PathBuf,

        /// Replace the database if it already exists.
        #[arg(long)]
        overwrite: bool,
    },

    /// Submit one or more samples (e.g., "N:1.5:U" or "1700000400:42").
    Update {
        /// Database to update.
        target: String,

        /// Samples, each a timestamp followed by colon-separated values.
        #[arg(required = true)]
        samples: Vec<String>,

        /// Colon-separated data source names the values map to.
        #[arg(long)]
        template: Option<String>,

        /// Caching daemon address.
        #[arg(long, env = "RRDCACHED_ADDRESS")]
        daemon: Option<String>,

        /// Write directly to the database even if a daemon is configured.
        #[arg(long)]
        no_daemon: bool,
    },

    /// Print database metadata as JSON.
    Info {
        /// Database to inspect.
        target: String,

        /// Caching daemon to flush before reading.
        #[arg(long, env = "RRDCACHED_ADDRESS")]
        daemon: Option<String>,
    },

    /// Read consolidated values from a database.
    Fetch {
        /// Database to read.
        target: String,

        /// Consolidation function (AVERAGE, MIN, MAX, LAST).
        cf: String,

        /// Range start: epoch seconds, "now" or "now-<duration>" (e.g., "now-1d").
        #[arg(long, default_value = "now-1d")]
        start: String,

        /// Range end, in the same forms as --start.
        #[arg(long, default_value = "now")]
        end: String,

        /// Requested resolution (e.g., "300", "5m"). Zero lets the engine pick.
        #[arg(long, default_value = "0")]
        step: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,

        /// Caching daemon to flush before reading.
        #[arg(long, env = "RRDCACHED_ADDRESS")]
        daemon: Option<String>,
    },

    /// Ask a caching daemon to write what it holds for a database.
    Flush {
        /// Database to flush.
        target: String,

        /// Caching daemon address.
        #[arg(long, env = "RRDCACHED_ADDRESS", required = true)]
        daemon: String,
    },
}

/// Output format for fetch results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document with one object per row.
    Json,
}

#[cfg(feature = "librrd")]
fn engine() -> rrdio::LibRrd {
    rrdio::LibRrd::new()
}

#[cfg(not(feature = "librrd"))]
fn engine() -> rrdio::MemoryEngine {
    rrdio::MemoryEngine::file_backed()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = Client::new(engine());

    let result = match cli.command {
        Commands::Create {
            definition,
            overwrite,
        } => cmd_create(&client, &definition, overwrite),
        Commands::Update {
            target,
            samples,
            template,
            daemon,
            no_daemon,
        } => cmd_update(
            &client,
            &target,
            &samples,
            template.as_deref(),
            daemon.as_deref(),
            no_daemon,
        ),
        Commands::Info { target, daemon } => cmd_info(&client, &target, daemon.as_deref()),
        Commands::Fetch {
            target,
            cf,
            start,
            end,
            step,
            format,
            daemon,
        } => cmd_fetch(
            &client,
            &target,
            &cf,
            &Range {
                start: &start,
                end: &end,
                step: &step,
            },
            &format,
            daemon.as_deref(),
        ),
        Commands::Flush { target, daemon } => cmd_flush(&client, &target, &daemon),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `rrdio create <definition>`.
fn cmd_create<E: Engine>(
    client: &Client<E>,
    definition: &Path,
    overwrite: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = DatabaseConfig::load(definition)?;
    tracing::debug!(definition = %definition.display(), database = %config.target, overwrite, "create");
    config.creator(client).create(overwrite)?;

    println!(
        "Created {} (step={}s, data sources={}, archives={})",
        config.target,
        config.step,
        config.data_sources.len(),
        config.archives.len()
    );
    Ok(())
}

/// Implements `rrdio update <target> <sample>...`.
fn cmd_update<E: Engine>(
    client: &Client<E>,
    target: &str,
    samples: &[String],
    template: Option<&str>,
    daemon: Option<&str>,
    no_daemon: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut updater = match daemon {
        Some(daemon) if !no_daemon => client.daemon_updater(target, daemon),
        _ => client.updater(target),
    };
    if let Some(template) = template {
        let names: Vec<&str> = template.split(':').collect();
        updater.set_template(&names);
    }

    tracing::debug!(
        database = target,
        samples = samples.len(),
        daemon = daemon.unwrap_or("-"),
        no_daemon,
        "update"
    );
    for sample in samples {
        let fields: Vec<Param> = sample.split(':').map(Param::from).collect();
        updater.cache(&fields);
    }

    if no_daemon {
        updater.update_no_daemon(&[])?;
    } else {
        updater.update(&[])?;
    }
    Ok(())
}

/// Implements `rrdio info <target>`.
fn cmd_info<E: Engine>(
    client: &Client<E>,
    target: &str,
    daemon: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let tree = match daemon {
        Some(daemon) => client.daemon_info(target, daemon)?,
        None => client.info(target)?,
    };
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

/// Unparsed time range arguments of `rrdio fetch`.
struct Range<'a> {
    start: &'a str,
    end: &'a str,
    step: &'a str,
}

/// Implements `rrdio fetch <target> <cf>`.
fn cmd_fetch<E: Engine>(
    client: &Client<E>,
    target: &str,
    cf: &str,
    range: &Range<'_>,
    format: &OutputFormat,
    daemon: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = epoch_secs(SystemTime::now());
    let start = from_epoch_secs(parse_time(range.start, now)?);
    let end = from_epoch_secs(parse_time(range.end, now)?);
    let step = Duration::from_secs(parse_duration(range.step)?);
    tracing::debug!(
        database = target,
        cf,
        start = epoch_secs(start),
        end = epoch_secs(end),
        step = step.as_secs(),
        "fetch range"
    );

    let mut grid = match daemon {
        Some(daemon) => client.daemon_fetch(target, cf, start, end, step, daemon)?,
        None => client.fetch(target, cf, start, end, step)?,
    };

    let step_secs = grid.step().as_secs();
    let names = grid.series_names().to_vec();
    let mut rows = Vec::with_capacity(grid.rows());
    for row in 0..grid.rows() {
        let timestamp = epoch_secs(grid.timestamp(row)?);
        let values = (0..grid.columns())
            .map(|column| grid.at(row, column))
            .collect::<Result<Vec<f64>, _>>()?;
        rows.push((timestamp, values));
    }
    let (first, last) = (grid.start_epoch(), grid.end_epoch());
    grid.release()?;

    match format {
        OutputFormat::Csv => {
            println!(
                "# target={target}, cf={cf}, start={first}, end={last}, step={step_secs}, rows={}",
                rows.len()
            );
            println!("timestamp,{}", names.join(","));
            for (timestamp, values) in &rows {
                let cells: Vec<String> = values.iter().map(|v| format_value(*v)).collect();
                println!("{timestamp},{}", cells.join(","));
            }
        }
        OutputFormat::Json => {
            let json_rows: Vec<serde_json::Value> = rows
                .iter()
                .map(|(timestamp, values)| {
                    serde_json::json!({
                        "timestamp": timestamp,
                        "values": values,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "target": target,
                "cf": cf,
                "start": first,
                "end": last,
                "step": step_secs,
                "series": names,
                "rows": json_rows,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `rrdio flush <target> --daemon <addr>`.
fn cmd_flush<E: Engine>(
    client: &Client<E>,
    target: &str,
    daemon: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    client.flush(daemon, target)?;
    Ok(())
}

/// Formats one fetched value; unknown values print as `nan`.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value}")
    }
}

/// Parses a point in time: epoch seconds, `now`, or `now-<duration>`.
fn parse_time(s: &str, now: i64) -> Result<i64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s == "now" {
        return Ok(now);
    }
    if let Some(offset) = s.strip_prefix("now-") {
        let secs = i64::try_from(parse_duration(offset)?)?;
        return now
            .checked_sub(secs)
            .ok_or_else(|| format!("Time '{s}' is out of range").into());
    }
    s.parse::<i64>()
        .map_err(|_| format!("Invalid time '{s}'. Use epoch seconds, now, or now-<duration>.").into())
}

/// Parses a duration in seconds, with an optional unit (e.g., "300", "5m", "1d").
fn parse_duration(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }

    let Some((split, unit)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };
    let num: u64 = s[..split].parse()?;

    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    num.checked_mul(scale)
        .ok_or_else(|| format!("Duration '{s}' is too large").into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("300").unwrap(), 300);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
        assert_eq!(parse_duration("1d").unwrap(), 86400);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3w").is_err());
        assert!(parse_duration("5µ").is_err());
        assert!(parse_duration("µ").is_err());
        assert!(parse_duration("999999999999999999d").is_err());
    }

    #[test]
    fn test_parse_time_forms() {
        let now = 1_700_000_000;
        assert_eq!(parse_time("now", now).unwrap(), now);
        assert_eq!(parse_time("now-1h", now).unwrap(), now - 3600);
        assert_eq!(parse_time("1699990000", now).unwrap(), 1_699_990_000);
        assert!(parse_time("yesterday", now).is_err());
        assert!(parse_time("now-999999999999999999d", now).is_err());
    }

    #[test]
    fn test_format_value_marks_unknown() {
        assert_eq!(format_value(f64::NAN), "nan");
        assert_eq!(format_value(42.0), "42");
    }

    #[test]
    fn test_cli_parses_update_with_template() {
        let cli = Cli::try_parse_from([
            "rrdio",
            "update",
            "x.rrd",
            "N:1:2",
            "1700000400:3:4",
            "--template",
            "a:b",
        ])
        .unwrap();
        match cli.command {
            Commands::Update {
                target,
                samples,
                template,
                ..
            } => {
                assert_eq!(target, "x.rrd");
                assert_eq!(samples, ["N:1:2", "1700000400:3:4"]);
                assert_eq!(template.as_deref(), Some("a:b"));
            }
            _ => panic!("expected update command"),
        }
    }

    #[test]
    fn test_update_and_fetch_through_client() {
        let client = Client::new(rrdio::MemoryEngine::new());
        client
            .creator("cli.rrd", from_epoch_secs(1_700_000_100), 300)
            .ds("v", "GAUGE", &rrdio::params![600, "U", "U"])
            .rra("AVERAGE", &rrdio::params![0.5, 1, 10])
            .create(true)
            .unwrap();

        cmd_update(
            &client,
            "cli.rrd",
            &["1700000400:42".to_string()],
            Some("v"),
            None,
            false,
        )
        .unwrap();
        assert_eq!(client.engine().last_update("cli.rrd"), Some(1_700_000_400));

        let range = Range {
            start: "1700000100",
            end: "1700000700",
            step: "5m",
        };
        cmd_fetch(&client, "cli.rrd", "AVERAGE", &range, &OutputFormat::Json, None).unwrap();
        assert_eq!(client.engine().outstanding_buffers(), 0);
    }
}
