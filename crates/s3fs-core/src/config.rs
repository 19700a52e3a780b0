//! Configuration: a `key = value` file (not TOML/JSON, matching the
//! conventions of the tool this crate replaces) plus environment-variable
//! overrides for credentials.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected `key = value`, got {content:?}")]
    Malformed { line: usize, content: String },
    #[error("missing required option {0}")]
    MissingRequired(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Aws,
    Gs,
    /// A generic S3-compatible endpoint (`url_prefix` required).
    Fvs,
}

impl Service {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "aws" => Some(Service::Aws),
            "gs" => Some(Service::Gs),
            "fvs" => Some(Service::Fvs),
            _ => None,
        }
    }
}

/// Fully resolved mount configuration.
///
/// Built from a config file via [`Config::load`] plus whatever the CLI
/// overrides; every field has a sensible default so a minimal config file
/// (just bucket and credentials) is enough to mount.
#[derive(Debug, Clone)]
pub struct Config {
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub service: Service,
    pub url_prefix: Option<String>,

    pub default_uid: u32,
    pub default_gid: u32,
    pub default_mode: u32,

    pub cache_directories: bool,
    pub max_objects_in_cache: usize,

    pub download_chunk_size: u64,
    pub upload_chunk_size: u64,
    pub transfer_timeout_in_s: u64,
    pub transfer_retries: u32,
    pub max_inconsistent_state_retries: u32,

    pub use_encryption: bool,
    pub encrypt_new_files: bool,
    pub volume_key_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            service: Service::Aws,
            url_prefix: None,
            default_uid: 0,
            default_gid: 0,
            default_mode: 0o755,
            cache_directories: true,
            max_objects_in_cache: 10_000,
            download_chunk_size: 10 * 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            transfer_timeout_in_s: 30,
            transfer_retries: 3,
            max_inconsistent_state_retries: 5,
            use_encryption: false,
            encrypt_new_files: false,
            volume_key_file: None,
        }
    }
}

impl Config {
    /// Parses the `key = value` config file at `path`, then layers
    /// environment-variable credential overrides on top (env wins, matching
    /// the usual `clap` `env` feature precedence used elsewhere in this
    /// codebase's CLI crates).
    pub fn load(path: &Path, bucket_name: String) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self {
            bucket_name,
            ..Self::default()
        };
        config.apply_lines(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_lines(&mut self, contents: &str) -> Result<(), ConfigError> {
        let mut values = HashMap::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
                line: idx + 1,
                content: raw_line.to_string(),
            })?;
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        self.apply_values(&values)
    }

    fn apply_values(&mut self, values: &HashMap<String, String>) -> Result<(), ConfigError> {
        macro_rules! parse_numeric {
            ($key:literal, $field:expr, $ty:ty) => {
                if let Some(v) = values.get($key) {
                    $field = v.parse::<$ty>().map_err(|_| ConfigError::InvalidValue {
                        key: $key,
                        value: v.clone(),
                    })?;
                }
            };
        }
        macro_rules! parse_bool {
            ($key:literal, $field:expr) => {
                if let Some(v) = values.get($key) {
                    $field = parse_bool_value(v).ok_or_else(|| ConfigError::InvalidValue {
                        key: $key,
                        value: v.clone(),
                    })?;
                }
            };
        }

        if let Some(v) = values.get("access_key_id") {
            self.access_key_id = v.clone();
        }
        if let Some(v) = values.get("secret_access_key") {
            self.secret_access_key = v.clone();
        }
        if let Some(v) = values.get("service") {
            self.service = Service::parse(v).ok_or_else(|| ConfigError::InvalidValue {
                key: "service",
                value: v.clone(),
            })?;
        }
        if let Some(v) = values.get("url_prefix") {
            self.url_prefix = Some(v.clone());
        }
        if let Some(v) = values.get("volume_key_file") {
            self.volume_key_file = Some(v.clone());
        }

        parse_numeric!("default_uid", self.default_uid, u32);
        parse_numeric!("default_gid", self.default_gid, u32);
        parse_numeric!("max_objects_in_cache", self.max_objects_in_cache, usize);
        parse_numeric!("download_chunk_size", self.download_chunk_size, u64);
        parse_numeric!("upload_chunk_size", self.upload_chunk_size, u64);
        parse_numeric!("transfer_timeout_in_s", self.transfer_timeout_in_s, u64);
        parse_numeric!("transfer_retries", self.transfer_retries, u32);
        parse_numeric!(
            "max_inconsistent_state_retries",
            self.max_inconsistent_state_retries,
            u32
        );
        parse_bool!("cache_directories", self.cache_directories);
        parse_bool!("use_encryption", self.use_encryption);
        parse_bool!("encrypt_new_files", self.encrypt_new_files);

        if let Some(v) = values.get("default_mode") {
            self.default_mode = u32::from_str_radix(v.trim_start_matches("0o"), 8).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "default_mode",
                    value: v.clone(),
                }
            })?;
        }

        if self.access_key_id.is_empty() {
            return Err(ConfigError::MissingRequired("access_key_id"));
        }
        if self.secret_access_key.is_empty() {
            return Err(ConfigError::MissingRequired("secret_access_key"));
        }

        Ok(())
    }

    /// `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY` (or the `GS_` equivalents
    /// for Google Storage) take precedence over whatever the config file set.
    fn apply_env_overrides(&mut self) {
        let (key_var, secret_var) = match self.service {
            Service::Gs => ("GS_ACCESS_KEY_ID", "GS_SECRET_ACCESS_KEY"),
            Service::Aws | Service::Fvs => ("AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"),
        };
        if let Ok(v) = std::env::var(key_var) {
            self.access_key_id = v;
        }
        if let Ok(v) = std::env::var(secret_var) {
            self.secret_access_key = v;
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_in_s)
    }
}

fn parse_bool_value(v: &str) -> Option<bool> {
    match v {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_minimal_config() {
        let file = write_temp("access_key_id = AKID\nsecret_access_key = SECRET\n");
        let config = Config::load(file.path(), "my-bucket".to_string()).unwrap();
        assert_eq!(config.access_key_id, "AKID");
        assert_eq!(config.secret_access_key, "SECRET");
        assert_eq!(config.service, Service::Aws);
        assert_eq!(config.bucket_name, "my-bucket");
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let file = write_temp(
            "# a comment\n\naccess_key_id = AKID\nsecret_access_key = SECRET\n# trailing\n",
        );
        let config = Config::load(file.path(), "b".to_string()).unwrap();
        assert_eq!(config.access_key_id, "AKID");
    }

    #[test]
    fn rejects_malformed_lines() {
        let file = write_temp("access_key_id = AKID\nsecret_access_key = SECRET\nnot-a-pair\n");
        let err = Config::load(file.path(), "b".to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 3, .. }));
    }

    #[test]
    fn requires_credentials() {
        let file = write_temp("service = aws\n");
        let err = Config::load(file.path(), "b".to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("access_key_id")));
    }

    #[test]
    fn parses_service_and_numeric_overrides() {
        let file = write_temp(
            "access_key_id = AKID\nsecret_access_key = SECRET\nservice = gs\nupload_chunk_size = 1048576\nuse_encryption = true\n",
        );
        let config = Config::load(file.path(), "b".to_string()).unwrap();
        assert_eq!(config.service, Service::Gs);
        assert_eq!(config.upload_chunk_size, 1_048_576);
        assert!(config.use_encryption);
    }
}
