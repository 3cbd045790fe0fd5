//! reaction registry
//!
//! Immutable descriptors built once from the configuration: patterns, streams,
//! filters and actions. Every other component holds `Arc` handles to them and
//! never mutates them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Separator used in qualified names (`stream.filter.action`)
pub const NAME_SEPARATOR: char = '.';

/// Default number of appended records between two log rotations
pub const DEFAULT_ROTATE_EVERY: u64 = 500_000;

/// Registry construction errors
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("pattern {0:?}: name must be a non-empty identifier")]
    InvalidPatternName(String),

    #[error("pattern {pattern}: invalid ignore regex {regex:?}: {source}")]
    InvalidIgnoreRegex {
        pattern: String,
        regex: String,
        source: regex::Error,
    },

    #[error("{0}: name must not be empty or contain '.'")]
    InvalidName(String),

    #[error("{0}: command must not be empty")]
    EmptyCommand(String),

    #[error("{0}: at least one regex is required")]
    NoRegex(String),

    #[error("{0}: at least one action is required")]
    NoAction(String),

    #[error("{0}: at least one filter is required")]
    NoFilter(String),

    #[error("{0}: retry > 1 requires a retry period")]
    MissingRetryPeriod(String),

    #[error("{0}: onexit requires a non-zero delay")]
    OnExitWithoutDelay(String),

    #[error("{0}: declared twice")]
    Duplicate(String),

    #[error("no stream configured")]
    NoStream,
}

/// A named capture shared by filters and action templates
#[derive(Debug)]
pub struct Pattern {
    pub name: String,
    /// Raw regex, inserted as `(?P<name>regex)` in filter regexes
    pub regex: String,
    /// Literal values that never become a match
    pub ignore: Vec<String>,
    ignore_regex: Vec<Regex>,
}

impl Pattern {
    /// Build a pattern; ignore regexes are anchored to the whole value
    pub fn new(
        name: impl Into<String>,
        regex: impl Into<String>,
        ignore: Vec<String>,
        ignore_regex: &[String],
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(SchemaError::InvalidPatternName(name));
        }

        let ignore_regex = ignore_regex
            .iter()
            .map(|r| {
                Regex::new(&format!("^(?:{r})$")).map_err(|source| SchemaError::InvalidIgnoreRegex {
                    pattern: name.clone(),
                    regex: r.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            regex: regex.into(),
            ignore,
            ignore_regex,
        })
    }

    /// The `<name>` token substituted in filter regexes and commands
    pub fn placeholder(&self) -> String {
        format!("<{}>", self.name)
    }

    /// Whether a captured value is ignore-listed
    pub fn is_ignored(&self, value: &str) -> bool {
        self.ignore.iter().any(|i| i == value) || self.ignore_regex.iter().any(|r| r.is_match(value))
    }
}

/// Captured values of one matched line, one per pattern of the filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Match(Vec<String>);

impl Match {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for Match {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, ".");
        }
        write!(f, "{}", self.0.join(" "))
    }
}

/// What a filter captures from a line
#[derive(Debug, Clone, Default)]
pub enum CaptureSpec {
    /// The filter only detects lines; every match is the empty tuple
    #[default]
    None,
    /// Ordered patterns, sorted by name
    Patterns(Vec<Arc<Pattern>>),
}

impl CaptureSpec {
    pub fn patterns(&self) -> &[Arc<Pattern>] {
        match self {
            CaptureSpec::None => &[],
            CaptureSpec::Patterns(patterns) => patterns,
        }
    }
}

/// A command run when a filter triggers, optionally after a delay
#[derive(Debug)]
pub struct Action {
    pub name: String,
    pub stream: String,
    pub filter: String,
    /// Command template; pattern placeholders are substituted per argument
    pub cmd: Vec<String>,
    pub delay: Option<Duration>,
    /// Run during graceful shutdown instead of being discarded
    pub on_exit: bool,
    pub capture: CaptureSpec,
}

impl Action {
    pub fn new(
        stream: &str,
        filter: &str,
        name: impl Into<String>,
        cmd: Vec<String>,
        delay: Option<Duration>,
        on_exit: bool,
        capture: CaptureSpec,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let qualified = format!("{stream}.{filter}.{name}");
        if name.is_empty() {
            return Err(SchemaError::InvalidName(qualified));
        }
        if cmd.is_empty() || cmd[0].is_empty() {
            return Err(SchemaError::EmptyCommand(qualified));
        }
        let delay = delay.filter(|d| !d.is_zero());
        if on_exit && delay.is_none() {
            return Err(SchemaError::OnExitWithoutDelay(qualified));
        }

        Ok(Self {
            name,
            stream: stream.to_string(),
            filter: filter.to_string(),
            cmd,
            delay,
            on_exit,
            capture,
        })
    }

    pub fn delay(&self) -> Duration {
        self.delay.unwrap_or_default()
    }

    /// Command line with the match values substituted
    pub fn render(&self, m: &Match) -> Vec<String> {
        let patterns = self.capture.patterns();
        self.cmd
            .iter()
            .map(|arg| {
                patterns
                    .iter()
                    .zip(m.values())
                    .fold(arg.clone(), |acc, (p, v)| acc.replace(&p.placeholder(), v))
            })
            .collect()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stream, self.filter, self.name)
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream && self.filter == other.filter && self.name == other.name
    }
}

impl Eq for Action {}

impl Hash for Action {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stream.hash(state);
        self.filter.hash(state);
        self.name.hash(state);
    }
}

/// Settings of a filter besides its regexes and actions
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Matches needed inside the window to trigger; 0 and 1 trigger at once
    pub retry: u32,
    pub retry_period: Option<Duration>,
}

/// Matches lines of a stream and counts captured values
#[derive(Debug)]
pub struct Filter {
    pub name: String,
    pub stream: String,
    pub regexes: Vec<Regex>,
    pub capture: CaptureSpec,
    pub retry: u32,
    pub retry_period: Option<Duration>,
    pub actions: Vec<Arc<Action>>,
}

impl Filter {
    pub fn new(
        stream: &str,
        name: impl Into<String>,
        regexes: Vec<Regex>,
        capture: CaptureSpec,
        policy: RetryPolicy,
        actions: Vec<Arc<Action>>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let qualified = format!("{stream}.{name}");
        if !valid_name(&name) {
            return Err(SchemaError::InvalidName(qualified));
        }
        if regexes.is_empty() {
            return Err(SchemaError::NoRegex(qualified));
        }
        if actions.is_empty() {
            return Err(SchemaError::NoAction(qualified));
        }
        let retry_period = policy.retry_period.filter(|d| !d.is_zero());
        if policy.retry > 1 && retry_period.is_none() {
            return Err(SchemaError::MissingRetryPeriod(qualified));
        }
        for (i, action) in actions.iter().enumerate() {
            if actions[..i].iter().any(|a| a.name == action.name) {
                return Err(SchemaError::Duplicate(action.to_string()));
            }
        }

        Ok(Self {
            name,
            stream: stream.to_string(),
            regexes,
            capture,
            retry: policy.retry,
            retry_period,
            actions,
        })
    }

    /// Whether a single match triggers immediately
    pub fn triggers_at_once(&self) -> bool {
        self.retry <= 1
    }

    pub fn retry_window(&self) -> Duration {
        self.retry_period.unwrap_or_default()
    }

    /// Largest delay among the filter's actions
    pub fn longest_delay(&self) -> Duration {
        self.actions.iter().map(|a| a.delay()).max().unwrap_or_default()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stream, self.name)
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.stream == other.stream && self.name == other.name
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stream.hash(state);
        self.name.hash(state);
    }
}

/// A monitored command and the filters applied to its output
#[derive(Debug)]
pub struct Stream {
    pub name: String,
    pub cmd: Vec<String>,
    pub filters: Vec<Arc<Filter>>,
}

impl Stream {
    pub fn new(
        name: impl Into<String>,
        cmd: Vec<String>,
        filters: Vec<Arc<Filter>>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if !valid_name(&name) {
            return Err(SchemaError::InvalidName(name));
        }
        if cmd.is_empty() || cmd[0].is_empty() {
            return Err(SchemaError::EmptyCommand(name));
        }
        if filters.is_empty() {
            return Err(SchemaError::NoFilter(name));
        }
        for (i, filter) in filters.iter().enumerate() {
            if filters[..i].iter().any(|f| f.name == filter.name) {
                return Err(SchemaError::Duplicate(filter.to_string()));
            }
        }
        Ok(Self { name, cmd, filters })
    }

    pub fn filter(&self, name: &str) -> Option<&Arc<Filter>> {
        self.filters.iter().find(|f| f.name == name)
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(NAME_SEPARATOR)
}

/// Restriction of a request to a stream or one of its filters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub stream: String,
    pub filter: Option<String>,
}

impl Scope {
    pub fn contains(&self, stream: &str, filter: &str) -> bool {
        self.stream == stream && self.filter.as_deref().is_none_or(|f| f == filter)
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, NAME_SEPARATOR);
        let stream = parts.next().unwrap_or_default();
        let filter = parts.next();
        if stream.is_empty() || filter.is_some_and(|f| !valid_name(f)) {
            return Err(format!("expected STREAM or STREAM.FILTER, got {s:?}"));
        }
        Ok(Self {
            stream: stream.to_string(),
            filter: filter.map(str::to_string),
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}.{}", self.stream, filter),
            None => write!(f, "{}", self.stream),
        }
    }
}

/// Everything loaded from the configuration
#[derive(Debug)]
pub struct Registry {
    pub patterns: BTreeMap<String, Arc<Pattern>>,
    pub streams: Vec<Arc<Stream>>,
    /// Commands run once before any stream starts
    pub start: Vec<Vec<String>>,
    /// Commands run once after every action completed at shutdown
    pub stop: Vec<Vec<String>>,
    /// Maximum simultaneous action executions, 0 for unbounded
    pub concurrency: usize,
    pub state_dir: PathBuf,
    pub rotate_every: u64,
}

impl Registry {
    pub fn new(
        patterns: BTreeMap<String, Arc<Pattern>>,
        streams: Vec<Arc<Stream>>,
    ) -> Result<Self, SchemaError> {
        if streams.is_empty() {
            return Err(SchemaError::NoStream);
        }
        for (i, stream) in streams.iter().enumerate() {
            if streams[..i].iter().any(|s| s.name == stream.name) {
                return Err(SchemaError::Duplicate(stream.name.clone()));
            }
        }
        Ok(Self {
            patterns,
            streams,
            start: Vec::new(),
            stop: Vec::new(),
            concurrency: 0,
            state_dir: PathBuf::from("."),
            rotate_every: DEFAULT_ROTATE_EVERY,
        })
    }

    pub fn stream(&self, name: &str) -> Option<&Arc<Stream>> {
        self.streams.iter().find(|s| s.name == name)
    }

    pub fn filter(&self, stream: &str, filter: &str) -> Option<&Arc<Filter>> {
        self.stream(stream).and_then(|s| s.filter(filter))
    }

    /// All filters, in stream then filter order
    pub fn filters(&self) -> impl Iterator<Item = &Arc<Filter>> {
        self.streams.iter().flat_map(|s| s.filters.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> Arc<Pattern> {
        Arc::new(
            Pattern::new(
                "ip",
                r"[0-9.]+",
                vec!["127.0.0.1".into()],
                &["192\\.168\\..*".into()],
            )
            .unwrap(),
        )
    }

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pattern_ignore() {
        let p = ip();
        assert!(p.is_ignored("127.0.0.1"));
        assert!(p.is_ignored("192.168.1.4"));
        assert!(!p.is_ignored("1.2.3.4"));
        // ignore regexes must match the whole value
        assert!(!p.is_ignored("10.192.168.1"));
    }

    #[test]
    fn test_pattern_name_must_be_identifier() {
        assert!(matches!(
            Pattern::new("bad name", ".*", vec![], &[]),
            Err(SchemaError::InvalidPatternName(_))
        ));
        assert!(Pattern::new("", ".*", vec![], &[]).is_err());
    }

    #[test]
    fn test_action_render() {
        let capture = CaptureSpec::Patterns(vec![ip()]);
        let action = Action::new(
            "ssh",
            "failedlogin",
            "ban",
            cmd(&["iptables", "-I", "reaction", "-s", "<ip>", "-j", "DROP"]),
            None,
            false,
            capture,
        )
        .unwrap();

        let m = Match::new(vec!["1.2.3.4".into()]);
        assert_eq!(action.render(&m)[4], "1.2.3.4");
        assert_eq!(action.to_string(), "ssh.failedlogin.ban");
    }

    #[test]
    fn test_action_on_exit_requires_delay() {
        let err = Action::new("s", "f", "unban", cmd(&["true"]), None, true, CaptureSpec::None);
        assert!(matches!(err, Err(SchemaError::OnExitWithoutDelay(name)) if name == "s.f.unban"));

        let zero = Action::new(
            "s",
            "f",
            "unban",
            cmd(&["true"]),
            Some(Duration::ZERO),
            true,
            CaptureSpec::None,
        );
        assert!(zero.is_err());
    }

    #[test]
    fn test_filter_retry_requires_period() {
        let action = Arc::new(
            Action::new("s", "f", "a", cmd(&["true"]), None, false, CaptureSpec::None).unwrap(),
        );
        let err = Filter::new(
            "s",
            "f",
            vec![Regex::new("x").unwrap()],
            CaptureSpec::None,
            RetryPolicy {
                retry: 3,
                retry_period: None,
            },
            vec![action],
        );
        assert!(matches!(err, Err(SchemaError::MissingRetryPeriod(_))));
    }

    #[test]
    fn test_filter_longest_delay() {
        let ban = Arc::new(
            Action::new("s", "f", "ban", cmd(&["true"]), None, false, CaptureSpec::None).unwrap(),
        );
        let unban = Arc::new(
            Action::new(
                "s",
                "f",
                "unban",
                cmd(&["true"]),
                Some(Duration::from_secs(3600)),
                false,
                CaptureSpec::None,
            )
            .unwrap(),
        );
        let filter = Filter::new(
            "s",
            "f",
            vec![Regex::new("x").unwrap()],
            CaptureSpec::None,
            RetryPolicy::default(),
            vec![ban, unban],
        )
        .unwrap();
        assert_eq!(filter.longest_delay(), Duration::from_secs(3600));
        assert!(filter.triggers_at_once());
    }

    #[test]
    fn test_names_reject_separator() {
        assert!(matches!(
            Stream::new("a.b", cmd(&["tail"]), vec![]),
            Err(SchemaError::InvalidName(_))
        ));
    }

    #[test]
    fn test_scope_parse() {
        let scope: Scope = "ssh.failedlogin".parse().unwrap();
        assert!(scope.contains("ssh", "failedlogin"));
        assert!(!scope.contains("ssh", "other"));

        let scope: Scope = "ssh".parse().unwrap();
        assert!(scope.contains("ssh", "anything"));
        assert_eq!(scope.to_string(), "ssh");

        assert!("".parse::<Scope>().is_err());
        assert!("a.b.c".parse::<Scope>().is_err());
    }

    #[test]
    fn test_match_is_a_tuple() {
        // values containing spaces or NULs never collide
        let a = Match::new(vec!["a b".into(), "c".into()]);
        let b = Match::new(vec!["a".into(), "b c".into()]);
        assert_ne!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), r#"["a b","c"]"#);
        assert_eq!(Match::default().to_string(), ".");
    }
}
