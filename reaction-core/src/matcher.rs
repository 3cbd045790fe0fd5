//! Line matching
//!
//! Pure function from a filter and a line to the captured [`Match`].

use reaction_schema::{CaptureSpec, Filter, Match};

/// Try the filter's regexes in order; the first one matching wins.
///
/// Returns `None` when no regex matches or when a captured value is
/// ignore-listed by its pattern.
pub fn match_line(filter: &Filter, line: &str) -> Option<Match> {
    for regex in &filter.regexes {
        let Some(caps) = regex.captures(line) else {
            continue;
        };

        return match &filter.capture {
            CaptureSpec::None => Some(Match::default()),
            CaptureSpec::Patterns(patterns) => {
                let mut values = Vec::with_capacity(patterns.len());
                for pattern in patterns {
                    let value = caps.name(&pattern.name).map(|m| m.as_str()).unwrap_or_default();
                    if pattern.is_ignored(value) {
                        return None;
                    }
                    values.push(value.to_string());
                }
                Some(Match::new(values))
            }
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reaction_rules::{parse_config, ConfigFormat};

    const CONF: &str = r#"
patterns:
  ip:
    regex: '[0-9]+(\.[0-9]+){3}'
    ignore: ['127.0.0.1']
  user:
    regex: '\w+'
streams:
  ssh:
    cmd: ['true']
    filters:
      failed:
        regex:
          - 'Failed password for <user> from <ip>'
          - 'Invalid user <user> from <ip>'
        actions:
          ban: { cmd: ['true'] }
      restart:
        regex: ['sshd restarted']
        actions:
          log: { cmd: ['true'] }
"#;

    #[test]
    fn test_capture_in_pattern_order() {
        let registry = parse_config(CONF, ConfigFormat::Yaml).unwrap();
        let filter = registry.filter("ssh", "failed").unwrap();

        let m = match_line(filter, "Invalid user bob from 1.2.3.4 port 22").unwrap();
        // patterns are sorted by name: ip, user
        assert_eq!(m.values(), ["1.2.3.4", "bob"]);

        assert!(match_line(filter, "Accepted password for bob").is_none());
    }

    #[test]
    fn test_ignored_value_drops_match() {
        let registry = parse_config(CONF, ConfigFormat::Yaml).unwrap();
        let filter = registry.filter("ssh", "failed").unwrap();
        assert!(match_line(filter, "Failed password for root from 127.0.0.1").is_none());
    }

    #[test]
    fn test_filter_without_patterns() {
        let registry = parse_config(CONF, ConfigFormat::Yaml).unwrap();
        let filter = registry.filter("ssh", "restart").unwrap();
        let m = match_line(filter, "Oct 17 sshd restarted").unwrap();
        assert!(m.is_empty());
    }
}
