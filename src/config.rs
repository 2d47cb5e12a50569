//! Agent configuration (spec §6): the `key = value` file format is part of
//! the external contract, so it is parsed by hand rather than handed to a
//! TOML/YAML loader — `clap` only owns the handful of process-entry flags
//! in `main.rs`. Recognized keys and their spellings follow spec §6's
//! table verbatim (`json-file.max-file`, `maxFiles`, `elasticsearch.*`,
//! ...), not the renamed/snake_cased forms a from-scratch config would
//! otherwise pick, since this wire format is part of the agent's external
//! contract.
//!
//! Grounded on `original_source/containers.go`'s `maxDockerFiles`/
//! `maxFiles` option vars and `logdir.go`'s `dotAlt`; unknown keys are
//! warned about and ignored, matching the original's tolerant parsing.

use std::path::{Path, PathBuf};

use bytesize::ByteSize;

use crate::kv;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    pub containers_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub max_docker_files: usize,
    pub max_files: usize,
    pub bulk_size: u64,
    pub elasticsearch_url: String,
    pub elasticsearch_cacert: Option<PathBuf>,
    pub elasticsearch_clientcert: Option<PathBuf>,
    pub elasticsearch_clientkey: Option<PathBuf>,
    pub elasticsearch_basic_auth: Option<String>,
    pub index_prefix: String,
    /// Fallback `logflow.io/conf`-style annotation body applied to
    /// containers that carry no pod annotation of their own (spec §6's
    /// `annotation` key).
    pub default_annotation: Option<String>,
    pub dot_replacer: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            containers_dir: PathBuf::from("/var/log/containers/"),
            spool_dir: PathBuf::from("/var/log/containers/logflow/"),
            max_docker_files: 3,
            max_files: 10,
            bulk_size: ByteSize::mib(5).as_u64(),
            elasticsearch_url: String::new(),
            elasticsearch_cacert: None,
            elasticsearch_clientcert: None,
            elasticsearch_clientkey: None,
            elasticsearch_basic_auth: None,
            index_prefix: "logs-".to_string(),
            default_annotation: None,
            dot_replacer: "_".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let m = kv::parse(text);
        let mut cfg = Config::default();

        for (key, value) in &m {
            match key.as_str() {
                "json-file.max-file" => set_parsed(&mut cfg.max_docker_files, key, value),
                "maxFiles" => set_parsed(&mut cfg.max_files, key, value),
                "annotation" => cfg.default_annotation = Some(value.clone()),
                "dot_replacer" => cfg.dot_replacer = value.clone(),
                "elasticsearch.url" => cfg.elasticsearch_url = value.clone(),
                "elasticsearch.cacert" => cfg.elasticsearch_cacert = Some(PathBuf::from(value)),
                "elasticsearch.clientcert" => cfg.elasticsearch_clientcert = Some(PathBuf::from(value)),
                "elasticsearch.clientkey" => cfg.elasticsearch_clientkey = Some(PathBuf::from(value)),
                "elasticsearch.basicAuth" => cfg.elasticsearch_basic_auth = Some(value.clone()),
                "elasticsearch.index_name.prefix" => cfg.index_prefix = value.clone(),
                "elasticsearch.bulk_size" => match value.parse::<ByteSize>() {
                    Ok(bs) => cfg.bulk_size = bs.as_u64(),
                    Err(e) => tracing::warn!(%key, %value, error = %e, "ignoring malformed config value"),
                },
                other => tracing::warn!(key = other, "ignoring unknown config key"),
            }
        }
        cfg
    }
}

fn set_parsed(field: &mut usize, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *field = v,
        Err(e) => tracing::warn!(%key, %value, error = %e, "ignoring malformed config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let cfg = Config::parse("");
        assert_eq!(cfg.max_docker_files, 3);
        assert_eq!(cfg.max_files, 10);
        assert_eq!(cfg.bulk_size, ByteSize::mib(5).as_u64());
    }

    #[test]
    fn overrides_apply() {
        let cfg = Config::parse(
            "json-file.max-file = 5\nelasticsearch.bulk_size = 2MiB\nelasticsearch.url = http://es:9200\n# comment\nbogus_key = 1",
        );
        assert_eq!(cfg.max_docker_files, 5);
        assert_eq!(cfg.bulk_size, ByteSize::mib(2).as_u64());
        assert_eq!(cfg.elasticsearch_url, "http://es:9200");
    }

    #[test]
    fn tls_and_auth_keys_are_recognized() {
        let cfg = Config::parse(
            "elasticsearch.cacert = /etc/ca.pem\nelasticsearch.clientcert = /etc/cert.pem\nelasticsearch.clientkey = /etc/key.pem\nelasticsearch.basicAuth = user:pass\nelasticsearch.index_name.prefix = myindex-",
        );
        assert_eq!(cfg.elasticsearch_cacert, Some(PathBuf::from("/etc/ca.pem")));
        assert_eq!(cfg.elasticsearch_clientcert, Some(PathBuf::from("/etc/cert.pem")));
        assert_eq!(cfg.elasticsearch_clientkey, Some(PathBuf::from("/etc/key.pem")));
        assert_eq!(cfg.elasticsearch_basic_auth.as_deref(), Some("user:pass"));
        assert_eq!(cfg.index_prefix, "myindex-");
    }

    #[test]
    fn maxfiles_key_is_recognized() {
        let cfg = Config::parse("maxFiles = 20");
        assert_eq!(cfg.max_files, 20);
    }
}
