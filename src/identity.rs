//! Container log filename parsing — `identity::parse_log_name` in spec §6.
//!
//! Pure string splitting, grounded on the original's `parseLogName`
//! (`original_source/logdir.go`): split on the first `_` (pod), the next `_`
//! (namespace), then the *last* `-` (container name / container id). Not a
//! regex in the original, and not one here either.

/// Identity extracted from a JSON-file log filename of the form
/// `<pod>_<namespace>_<container_name>-<container_id>.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub pod: String,
    pub namespace: String,
    pub container_name: String,
    pub container_id: String,
}

/// `name` is the log file's base name, with or without the trailing
/// `.log` extension (the caller may strip it first; we strip it too if
/// present so either form works).
pub fn parse_log_name(name: &str) -> Option<ContainerIdentity> {
    let name = name.strip_suffix(".log").unwrap_or(name);

    let (pod, rest) = split_once_byte(name, b'_')?;
    let (namespace, rest) = split_once_byte(rest, b'_')?;
    let dash = rest.rfind('-')?;
    let (container_name, container_id) = (&rest[..dash], &rest[dash + 1..]);

    Some(ContainerIdentity {
        pod: pod.to_string(),
        namespace: namespace.to_string(),
        container_name: container_name.to_string(),
        container_id: container_id.to_string(),
    })
}

fn split_once_byte(s: &str, b: u8) -> Option<(&str, &str)> {
    let i = s.as_bytes().iter().position(|&c| c == b)?;
    Some((&s[..i], &s[i + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_name() {
        let id = parse_log_name("nginx-7f8d_default_nginx-abcd1234ef567890abcd1234ef567890abcd1234ef567890abcd1234ef567890.log").unwrap();
        assert_eq!(id.pod, "nginx-7f8d");
        assert_eq!(id.namespace, "default");
        assert_eq!(id.container_name, "nginx");
        assert!(id.container_id.starts_with("abcd1234"));
    }

    #[test]
    fn container_name_may_contain_dashes() {
        let id = parse_log_name("pod_ns_my-sidecar-container-deadbeef.log").unwrap();
        assert_eq!(id.container_name, "my-sidecar-container");
        assert_eq!(id.container_id, "deadbeef");
    }

    #[test]
    fn missing_separators_return_none() {
        assert!(parse_log_name("no-underscores-here.log").is_none());
        assert!(parse_log_name("pod_ns_nodash.log").is_none());
    }
}
