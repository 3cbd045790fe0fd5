//! reaction configuration
//!
//! Loads a YAML or JSON configuration file, validates it and compiles it into
//! the immutable [`Registry`].

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use reaction_schema::{
    Action, CaptureSpec, Filter, Pattern, Registry, RetryPolicy, SchemaError, Stream,
    DEFAULT_ROTATE_EVERY,
};

pub mod duration;
pub use duration::parse_duration;

/// Configuration shipped with the binary, printed by `reaction example-conf`
pub const EXAMPLE_CONFIG: &str = include_str!("../example.yml");

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error accessing {0:?}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("unsupported configuration format: {0:?} (expected .yml, .yaml or .json)")]
    InvalidFormat(PathBuf),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("{object}: invalid regex {regex:?}: {source}")]
    InvalidRegex {
        object: String,
        regex: String,
        source: regex::Error,
    },

    #[error("{object}: invalid duration: {reason}")]
    InvalidDuration { object: String, reason: String },

    #[error("{0}: all regexes of a filter must use the same patterns")]
    MixedPatterns(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Serialization format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(ConfigError::InvalidFormat(path.to_path_buf())),
        }
    }
}

/// Top-level file layout
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub patterns: BTreeMap<String, PatternConfig>,
    pub streams: BTreeMap<String, StreamConfig>,
    #[serde(default)]
    pub start: Vec<Vec<String>>,
    #[serde(default)]
    pub stop: Vec<Vec<String>>,
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default)]
    pub state_directory: Option<PathBuf>,
    #[serde(default)]
    pub rotate_every: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternConfig {
    pub regex: String,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub ignoreregex: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub regex: Vec<String>,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub retryperiod: Option<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub onexit: bool,
}

/// Load and compile a configuration file, format chosen by extension
pub fn load_config(path: &Path) -> Result<Registry, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;

    let registry = parse_config(&content, format)?;
    info!(
        path = %path.display(),
        streams = registry.streams.len(),
        filters = registry.filters().count(),
        "Configuration loaded"
    );
    Ok(registry)
}

/// Parse and compile configuration text
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<Registry, ConfigError> {
    let file: ConfigFile = match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        }
        ConfigFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        }
    };
    compile(file)
}

/// Compile the raw file into a validated registry
pub fn compile(file: ConfigFile) -> Result<Registry, ConfigError> {
    let mut patterns = BTreeMap::new();
    for (name, p) in file.patterns {
        let pattern = Pattern::new(name.clone(), p.regex, p.ignore, &p.ignoreregex)?;
        Regex::new(&pattern.regex).map_err(|source| ConfigError::InvalidRegex {
            object: format!("pattern {name}"),
            regex: pattern.regex.clone(),
            source,
        })?;
        patterns.insert(name, Arc::new(pattern));
    }

    let mut streams = Vec::with_capacity(file.streams.len());
    for (stream_name, s) in file.streams {
        let mut filters = Vec::with_capacity(s.filters.len());
        for (filter_name, f) in s.filters {
            filters.push(Arc::new(compile_filter(&patterns, &stream_name, &filter_name, f)?));
        }
        streams.push(Arc::new(Stream::new(stream_name, s.cmd, filters)?));
    }

    let mut registry = Registry::new(patterns, streams)?;
    for (i, cmd) in file.start.iter().chain(file.stop.iter()).enumerate() {
        if cmd.is_empty() || cmd[0].is_empty() {
            return Err(SchemaError::EmptyCommand(format!("start/stop command #{i}")).into());
        }
    }
    registry.start = file.start;
    registry.stop = file.stop;
    registry.concurrency = file.concurrency;
    if let Some(dir) = file.state_directory {
        registry.state_dir = dir;
    }
    registry.rotate_every = file.rotate_every.unwrap_or(DEFAULT_ROTATE_EVERY).max(1);
    Ok(registry)
}

fn compile_filter(
    patterns: &BTreeMap<String, Arc<Pattern>>,
    stream: &str,
    name: &str,
    f: FilterConfig,
) -> Result<Filter, ConfigError> {
    let qualified = format!("{stream}.{name}");

    let mut regexes = Vec::with_capacity(f.regex.len());
    let mut used: Option<Vec<Arc<Pattern>>> = None;
    for raw in &f.regex {
        let (expanded, found) = expand_placeholders(raw, patterns);
        match &used {
            None => used = Some(found),
            Some(first) => {
                let same = first.len() == found.len()
                    && first.iter().zip(&found).all(|(a, b)| a.name == b.name);
                if !same {
                    return Err(ConfigError::MixedPatterns(qualified));
                }
            }
        }
        let regex = Regex::new(&expanded).map_err(|source| ConfigError::InvalidRegex {
            object: qualified.clone(),
            regex: raw.clone(),
            source,
        })?;
        regexes.push(regex);
    }

    let capture = match used {
        Some(found) if !found.is_empty() => CaptureSpec::Patterns(found),
        _ => CaptureSpec::None,
    };

    let retry_period = f
        .retryperiod
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|reason| ConfigError::InvalidDuration {
            object: qualified.clone(),
            reason,
        })?;

    let mut actions = Vec::with_capacity(f.actions.len());
    for (action_name, a) in f.actions {
        let delay = a
            .after
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map_err(|reason| ConfigError::InvalidDuration {
                object: format!("{qualified}.{action_name}"),
                reason,
            })?;
        let action = Action::new(
            stream,
            name,
            action_name,
            a.cmd,
            delay,
            a.onexit,
            capture.clone(),
        )?;
        actions.push(Arc::new(action));
    }

    debug!(filter = %qualified, regexes = regexes.len(), actions = actions.len(), "Filter compiled");

    Ok(Filter::new(
        stream,
        name,
        regexes,
        capture,
        RetryPolicy {
            retry: f.retry,
            retry_period,
        },
        actions,
    )?)
}

/// Replace the first `<name>` of each known pattern with its named group.
///
/// Returns the expanded regex and the patterns it uses, sorted by name.
pub fn expand_placeholders(
    regex: &str,
    patterns: &BTreeMap<String, Arc<Pattern>>,
) -> (String, Vec<Arc<Pattern>>) {
    let mut expanded = regex.to_string();
    let mut used = Vec::new();
    for pattern in patterns.values() {
        let placeholder = pattern.placeholder();
        if expanded.contains(&placeholder) {
            let group = format!("(?P<{}>{})", pattern.name, pattern.regex);
            expanded = expanded.replacen(&placeholder, &group, 1);
            used.push(pattern.clone());
        }
    }
    (expanded, used)
}
