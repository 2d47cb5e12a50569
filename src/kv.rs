//! The `key = value` text format shared by the agent's own config file
//! (spec §6) and per-container `logflow.io/conf[_<cname>]` pod annotations
//! (spec §4.3). One parser, two callers — the original's `readConf` is
//! reused the same way from both `annotation.go` and the top-level config
//! loader.

use std::collections::BTreeMap;

/// Parses `#`-commented, blank-line-tolerant `key = value` text into an
/// ordered map. Unknown-key filtering is the caller's job.
pub fn parse(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        out.insert(key.trim().to_string(), value.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let m = parse("a = 1\nb=2\n# comment\n\nc =3");
        assert_eq!(m.get("a").map(String::as_str), Some("1"));
        assert_eq!(m.get("b").map(String::as_str), Some("2"));
        assert_eq!(m.get("c").map(String::as_str), Some("3"));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn value_may_contain_equals_signs() {
        let m = parse("format = /^(?P<time>\\S+) (?P<msg>.*)=x$/");
        assert_eq!(m.get("format").unwrap(), "/^(?P<time>\\S+) (?P<msg>.*)=x$/");
    }
}
