//! reaction CLI
//!
//! Runs the daemon and talks to it over its control socket.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand, ValueEnum};
use reaction_core::protocol::send_request;
use reaction_core::{ProcessRunner, Request, Response, StatusTree, TimeManager, Timestamp};
use reaction_engine::{Daemon, DaemonConfig, DEFAULT_SOCKET};
use reaction_schema::{Pattern, Scope};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "reaction")]
#[command(about = "Scan program outputs for repeated patterns, and take action", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Configuration file (.yml, .yaml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        loglevel: String,

        /// Control socket
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,
    },

    /// Show current matches and pending actions
    Show {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Format::Yaml)]
        format: Format,

        /// Only show STREAM or STREAM.FILTER
        #[arg(short, long)]
        limit: Option<Scope>,

        /// Only show matches with a value matching this regex
        #[arg(short, long)]
        pattern: Option<String>,

        /// Only show matches whose NAME pattern captured a value entirely
        /// matching REGEX; repeat to require several
        #[arg(short, long = "kvpattern", value_name = "NAME=REGEX", value_parser = parse_kvpattern)]
        kvpattern: Vec<(String, String)>,
    },

    /// Remove a target from reaction, running its pending actions now
    Flush {
        /// Captured values, in pattern name order
        #[arg(required = true)]
        target: Vec<String>,

        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Format::Yaml)]
        format: Format,

        /// Only flush STREAM or STREAM.FILTER
        #[arg(short, long)]
        limit: Option<Scope>,
    },

    /// Test a regex against a line, or against each line of stdin
    TestRegex {
        /// Configuration file providing the <pattern> placeholders
        #[arg(short, long)]
        config: Option<PathBuf>,

        regex: String,

        line: Option<String>,
    },

    /// Print an example configuration
    ExampleConf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            loglevel,
            socket,
        } => {
            setup_logging(&loglevel)?;
            run_daemon(&config, socket).await
        }
        Commands::Show {
            socket,
            format,
            limit,
            pattern,
            kvpattern,
        } => {
            setup_logging("warn")?;
            let request = Request::Show {
                scope: limit,
                pattern,
                patterns: kvpattern.into_iter().collect(),
            };
            client(&socket, request, format).await
        }
        Commands::Flush {
            target,
            socket,
            format,
            limit,
        } => {
            setup_logging("warn")?;
            let request = Request::Flush {
                target,
                scope: limit,
            };
            client(&socket, request, format).await
        }
        Commands::TestRegex {
            config,
            regex,
            line,
        } => {
            setup_logging("info")?;
            test_regex(config.as_deref(), &regex, line.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::ExampleConf => {
            print!("{}", reaction_rules::EXAMPLE_CONFIG);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn parse_kvpattern(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, regex)) if !name.is_empty() => Ok((name.to_string(), regex.to_string())),
        _ => Err(format!("expected NAME=REGEX, got {arg:?}")),
    }
}

fn setup_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

async fn run_daemon(config: &Path, socket: PathBuf) -> Result<ExitCode> {
    let registry = reaction_rules::load_config(config)
        .with_context(|| format!("invalid configuration {}", config.display()))?;
    let registry = Arc::new(registry);
    let runner = Arc::new(ProcessRunner::new(registry.concurrency));

    let daemon = Daemon::new(registry, DaemonConfig { socket }, runner, TimeManager::real());
    let exit = daemon.run(shutdown_signal()).await?;
    if exit.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn client(socket: &Path, request: Request, format: Format) -> Result<ExitCode> {
    match send_request(socket, &request).await? {
        Response::Status { tree } => {
            print_tree(&tree, format)?;
            Ok(ExitCode::SUCCESS)
        }
        Response::Error { message } => bail!("daemon answered: {message}"),
    }
}

/// Status with fire times as local date-times
#[derive(Serialize)]
struct DisplayStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    matches: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    actions: BTreeMap<String, Vec<String>>,
}

type DisplayTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, DisplayStatus>>>;

fn display_tree(tree: &StatusTree) -> DisplayTree {
    tree.iter()
        .map(|(stream, filters)| {
            let filters = filters
                .iter()
                .map(|(filter, matches)| {
                    let matches = matches
                        .iter()
                        .map(|(m, status)| {
                            let actions = status
                                .actions
                                .iter()
                                .map(|(name, times)| (name.clone(), times.iter().map(|&t| format_time(t)).collect()))
                                .collect();
                            let status = DisplayStatus {
                                matches: (status.matches > 0).then_some(status.matches),
                                actions,
                            };
                            (m.clone(), status)
                        })
                        .collect();
                    (filter.clone(), matches)
                })
                .collect();
            (stream.clone(), filters)
        })
        .collect()
}

fn format_time(ts: Timestamp) -> String {
    let utc = DateTime::from_timestamp_nanos(ts.min(i64::MAX as u64) as i64);
    utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_tree(tree: &StatusTree, format: Format) -> Result<()> {
    let tree = display_tree(tree);
    let text = match format {
        Format::Yaml => serde_yaml::to_string(&tree)?,
        Format::Json => serde_json::to_string_pretty(&tree)? + "\n",
    };
    print!("{text}");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Matching(Vec<String>),
    Ignored(Vec<String>),
    NoMatch,
}

fn check_line(regex: &Regex, patterns: &[Arc<Pattern>], line: &str) -> Verdict {
    let Some(caps) = regex.captures(line) else {
        return Verdict::NoMatch;
    };
    let values: Vec<String> = patterns
        .iter()
        .map(|p| caps.name(&p.name).map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect();
    if patterns.iter().zip(&values).any(|(p, v)| p.is_ignored(v)) {
        Verdict::Ignored(values)
    } else {
        Verdict::Matching(values)
    }
}

fn test_regex(config: Option<&Path>, regex: &str, line: Option<&str>) -> Result<()> {
    let (expanded, patterns) = match config {
        Some(path) => {
            let registry = reaction_rules::load_config(path)
                .with_context(|| format!("invalid configuration {}", path.display()))?;
            reaction_rules::expand_placeholders(regex, &registry.patterns)
        }
        None => (regex.to_string(), Vec::new()),
    };
    let compiled = Regex::new(&expanded).with_context(|| format!("invalid regex {expanded:?}"))?;

    let report = |line: &str| match check_line(&compiled, &patterns, line) {
        Verdict::Matching(values) => println!("\x1b[32mmatching\x1b[0m {values:?}: {line}"),
        Verdict::Ignored(values) => println!("\x1b[33mignore matching\x1b[0m {values:?}: {line}"),
        Verdict::NoMatch => println!("\x1b[31mno match\x1b[0m: {line}"),
    };

    match line {
        Some(line) => report(line),
        None => {
            info!("No line given, reading from stdin");
            for line in std::io::stdin().lock().lines() {
                report(&line?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reaction_core::PatternStatus;

    #[test]
    fn test_example_conf_loads() {
        let registry =
            reaction_rules::parse_config(reaction_rules::EXAMPLE_CONFIG, reaction_rules::ConfigFormat::Yaml);
        assert!(registry.is_ok());
    }

    #[test]
    fn test_check_line_verdicts() {
        let ip = Arc::new(Pattern::new("ip", "[0-9.]+", vec!["127.0.0.1".into()], &[]).unwrap());
        let regex = Regex::new(r"from (?P<ip>[0-9.]+)").unwrap();
        let patterns = [ip];

        assert_eq!(
            check_line(&regex, &patterns, "failed from 1.2.3.4"),
            Verdict::Matching(vec!["1.2.3.4".into()])
        );
        assert_eq!(
            check_line(&regex, &patterns, "failed from 127.0.0.1"),
            Verdict::Ignored(vec!["127.0.0.1".into()])
        );
        assert_eq!(check_line(&regex, &patterns, "accepted"), Verdict::NoMatch);
    }

    #[test]
    fn test_display_tree_omits_zero_matches() {
        let mut tree = StatusTree::new();
        let mut status = PatternStatus::default();
        status.actions.insert("unban".into(), vec![0]);
        tree.entry("ssh".into())
            .or_default()
            .entry("failed".into())
            .or_default()
            .insert("1.2.3.4".into(), status);

        let shown = display_tree(&tree);
        let status = &shown["ssh"]["failed"]["1.2.3.4"];
        assert!(status.matches.is_none());
        assert_eq!(status.actions["unban"].len(), 1);
    }

    #[test]
    fn test_cli_parses_kvpatterns() {
        let cli = Cli::try_parse_from(["reaction", "show", "-k", "ip=10\\..*", "-k", "user=root"]).unwrap();
        let Commands::Show { kvpattern, .. } = cli.command else {
            panic!("expected show");
        };
        assert_eq!(kvpattern[0], ("ip".to_string(), r"10\..*".to_string()));
        assert_eq!(kvpattern[1].1, "root");

        assert!(Cli::try_parse_from(["reaction", "show", "-k", "=x"]).is_err());
        assert!(Cli::try_parse_from(["reaction", "show", "-k", "noequal"]).is_err());
    }

    #[test]
    fn test_cli_parses_flush() {
        let cli = Cli::try_parse_from(["reaction", "flush", "1.2.3.4", "-l", "ssh.failed"]).unwrap();
        let Commands::Flush { target, limit, .. } = cli.command else {
            panic!("expected flush");
        };
        assert_eq!(target, ["1.2.3.4"]);
        assert_eq!(limit.unwrap().filter.as_deref(), Some("failed"));
    }
}
