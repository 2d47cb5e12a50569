//! Annotation Engine (spec §4.3): turns a raw `{"time":..., "log":...}`
//! JSON-file log line into a record document, optionally re-parsing the
//! `log` field as JSON or against a named-capture-group regex, and
//! optionally merging consecutive lines into one record until a
//! `multiline_start` pattern matches again.
//!
//! Grounded on `original_source/annotation.go` (`annotation.parse`,
//! `annotation.unmarshal`, `compileRegex`). Field names follow the current
//! naming (`@message`/`@timestamp`, `timestamp_key`/`timestamp_layout`/
//! `message_key`) rather than the original's `@msg`/`@time`/`time_key`/
//! `time_layout`/`msg_key` — a rename, not a behavior change.

use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use serde_json::{Map, Value};

use crate::kv;

#[derive(Debug, Clone)]
pub enum Format {
    /// No configured format: best-effort — if `log` looks like a JSON
    /// object, merge its fields; otherwise pass the raw string through.
    None,
    /// `log` is always a JSON object.
    Json,
    /// `log` is matched against a regex with named capture groups.
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct AnnotationConfig {
    pub format: Format,
    pub timestamp_key: Option<String>,
    pub timestamp_layout: Option<String>,
    pub message_key: Option<String>,
    pub multiline_start: Option<Regex>,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        AnnotationConfig { format: Format::None, timestamp_key: None, timestamp_layout: None, message_key: None, multiline_start: None }
    }
}

impl AnnotationConfig {
    /// Parses the `logflow.io/conf[_<cname>]` annotation body (spec §4.3's
    /// `key = value` table). An empty or absent annotation yields the
    /// default (`Format::None`, no multiline merge).
    pub fn parse(text: &str) -> Result<Self, String> {
        let m = kv::parse(text);
        let mut cfg = AnnotationConfig::default();

        if let Some(re) = m.get("multiline_start") {
            cfg.multiline_start = Some(compile_delimited_regex(re)?);
        }

        let Some(format) = m.get("format") else {
            return Ok(cfg);
        };

        cfg.timestamp_key = non_empty(m.get("timestamp_key"));
        cfg.timestamp_layout = non_empty(m.get("timestamp_layout"));
        if cfg.timestamp_key.is_some() && cfg.timestamp_layout.is_none() {
            return Err("timestamp_layout missing".into());
        }
        cfg.message_key = non_empty(m.get("message_key"));
        let Some(message_key) = cfg.message_key.clone() else {
            return Err("message_key missing".into());
        };

        if format == "json" {
            cfg.format = Format::Json;
            // Multiline merge only makes sense for raw-text regex framing;
            // JSON log lines are already whole records.
            cfg.multiline_start = None;
        } else {
            let re = compile_delimited_regex(format)?;
            let names: Vec<&str> = re.capture_names().flatten().collect();
            if !names.contains(&message_key.as_str()) {
                return Err("message_key missing in regex".into());
            }
            if let Some(ts_key) = &cfg.timestamp_key {
                if !names.contains(&ts_key.as_str()) {
                    return Err("timestamp_key missing in regex".into());
                }
            }
            cfg.format = Format::Regex(re);
        }
        Ok(cfg)
    }

    /// Parses one raw `(time, log)` pair from the JSON-file driver into a
    /// record document. Always returns a document, falling back to the raw
    /// `log`/`time` values unchanged whenever the configured format fails
    /// to apply (unparsable JSON, non-matching regex): spec §4.3's
    /// tolerant degrade-to-raw behavior.
    pub fn parse_line(&self, raw_time: &str, raw_log: &str) -> Map<String, Value> {
        let mut rec = Map::new();
        let mut message = raw_log.to_string();
        let mut timestamp = raw_time.to_string();

        match &self.format {
            Format::None => {
                if looks_like_json_object(raw_log) {
                    if let Ok(Value::Object(m)) = serde_json::from_str::<Value>(raw_log) {
                        for (k, v) in m {
                            if k == "msg" || k == "message" {
                                message = stringify(&v);
                            } else if (k == "time" || k == "timestamp" || k == "ts") && is_rfc3339(&stringify(&v)) {
                                timestamp = stringify(&v);
                            } else {
                                insert_typed(&mut rec, &k, v);
                            }
                        }
                    }
                }
            }
            Format::Json => {
                if let Ok(Value::Object(m)) = serde_json::from_str::<Value>(raw_log) {
                    let message_key = self.message_key.as_deref().unwrap_or_default();
                    for (k, v) in m {
                        if k == message_key {
                            message = stringify(&v);
                        } else if Some(&k) == self.timestamp_key.as_ref() {
                            match parse_with_layout(&stringify(&v), self.timestamp_layout.as_deref().unwrap_or("")) {
                                Some(rfc3339) => timestamp = rfc3339,
                                None => insert_typed(&mut rec, &k, v),
                            }
                        } else {
                            insert_typed(&mut rec, &k, v);
                        }
                    }
                }
            }
            Format::Regex(re) => {
                if let Some(caps) = re.captures(raw_log) {
                    let message_key = self.message_key.as_deref().unwrap_or_default();
                    for name in re.capture_names().flatten() {
                        let Some(m) = caps.name(name) else { continue };
                        let captured = m.as_str().to_string();
                        if name == message_key {
                            message = captured;
                        } else if Some(name) == self.timestamp_key.as_deref() {
                            match parse_with_layout(&captured, self.timestamp_layout.as_deref().unwrap_or("")) {
                                Some(rfc3339) => timestamp = rfc3339,
                                None => {
                                    rec.insert(name.to_string(), Value::String(captured));
                                }
                            }
                        } else {
                            rec.insert(name.to_string(), Value::String(captured));
                        }
                    }
                }
            }
        }

        rec.insert("@message".to_string(), Value::String(message));
        rec.insert("@timestamp".to_string(), Value::String(timestamp));
        rec
    }
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.filter(|s| !s.is_empty()).cloned()
}

fn looks_like_json_object(s: &str) -> bool {
    let s = s.as_bytes();
    s.len() >= 2 && s[0] == b'{' && s[s.len() - 1] == b'}'
}

fn is_rfc3339(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
}

fn parse_with_layout(s: &str, layout: &str) -> Option<String> {
    if layout.is_empty() {
        return None;
    }
    DateTime::parse_from_str(s, layout).ok().map(|dt| dt.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Type-suffixes a field so non-string JSON values are disambiguated at
/// the record-document level ($num/$bool/$obj/$arr); strings and null keep
/// their bare key.
pub fn insert_typed(rec: &mut Map<String, Value>, key: &str, value: Value) {
    let suffixed = match &value {
        Value::String(_) | Value::Null => key.to_string(),
        Value::Number(_) => format!("{key}$num"),
        Value::Bool(_) => format!("{key}$bool"),
        Value::Object(_) => format!("{key}$obj"),
        Value::Array(_) => format!("{key}$arr"),
    };
    rec.insert(suffixed, value);
}

/// `/regex/`-delimited config value, matching the original's
/// `compileRegex`.
fn compile_delimited_regex(s: &str) -> Result<Regex, String> {
    let s = s.trim();
    if s.len() < 2 || !s.starts_with('/') || !s.ends_with('/') {
        return Err("regex must be enclosed with '/'".into());
    }
    Regex::new(&s[1..s.len() - 1]).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passes_message_and_timestamp_through() {
        let cfg = AnnotationConfig::default();
        let rec = cfg.parse_line("2024-01-01T00:00:00.000000000Z", "plain text");
        assert_eq!(rec["@message"], Value::String("plain text".into()));
        assert_eq!(rec["@timestamp"], Value::String("2024-01-01T00:00:00.000000000Z".into()));
    }

    #[test]
    fn none_format_merges_embedded_json_object() {
        let cfg = AnnotationConfig::default();
        let rec = cfg.parse_line("2024-01-01T00:00:00Z", r#"{"msg":"hi","level":"info","count":3}"#);
        assert_eq!(rec["@message"], Value::String("hi".into()));
        assert_eq!(rec["level"], Value::String("info".into()));
        assert_eq!(rec["count$num"], Value::Number(3.into()));
    }

    #[test]
    fn explicit_json_format_extracts_configured_keys() {
        let cfg = AnnotationConfig::parse("format = json\nmessage_key = msg\ntimestamp_key = ts\ntimestamp_layout = %Y-%m-%dT%H:%M:%S%.fZ").unwrap();
        let rec = cfg.parse_line("ignored", r#"{"msg":"hello","ts":"2024-03-04T05:06:07.5Z","extra":true}"#);
        assert_eq!(rec["@message"], Value::String("hello".into()));
        assert!(rec["@timestamp"].as_str().unwrap().starts_with("2024-03-04T05:06:07.5"));
        assert_eq!(rec["extra$bool"], Value::Bool(true));
    }

    #[test]
    fn regex_format_uses_named_groups() {
        let cfg = AnnotationConfig::parse(r#"format = /^(?P<level>\w+): (?P<msg>.*)$/
message_key = msg"#).unwrap();
        let rec = cfg.parse_line("t", "WARN: disk low");
        assert_eq!(rec["@message"], Value::String("disk low".into()));
        assert_eq!(rec["level"], Value::String("WARN".into()));
    }

    #[test]
    fn non_matching_regex_falls_back_to_raw() {
        let cfg = AnnotationConfig::parse(r#"format = /^(?P<level>\w+): (?P<msg>.*)$/
message_key = msg"#).unwrap();
        let rec = cfg.parse_line("t", "not in that shape");
        assert_eq!(rec["@message"], Value::String("not in that shape".into()));
    }

    #[test]
    fn json_format_requires_message_key() {
        assert!(AnnotationConfig::parse("format = json").is_err());
    }

    #[test]
    fn json_format_clears_multiline() {
        let cfg = AnnotationConfig::parse("multiline_start = /^\\s/\nformat = json\nmessage_key = msg").unwrap();
        assert!(cfg.multiline_start.is_none());
    }
}
