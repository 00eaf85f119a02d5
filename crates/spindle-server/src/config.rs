//! Load balancer configuration.
//!
//! The configuration mirrors the wire schema described in the project
//! docs: oneof-style groups (`backend`, `cert`, `probe`) are structs of
//! mutually-exclusive optional fields, checked by [`Config::validate`].
//! Four input formats are supported; the format of a config file is
//! inferred from its extension, the format of an inline config string is
//! chosen by the `--config_format` flag.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::textformat;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown config format {0}")]
    UnknownFormat(String),

    #[error("unknown extension format {extension} for {path}, please add an extension")]
    UnknownExtension { extension: String, path: String },

    #[error("invalid {format} config: {message}")]
    Parse {
        format: ConfigFormat,
        message: String,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The serialisation format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    TextProto,
    Json,
    Yaml,
    Xml,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TextProto => "TEXT_PROTO",
            Self::Json => "JSON",
            Self::Yaml => "YAML",
            Self::Xml => "XML",
        };
        f.write_str(name)
    }
}

impl FromStr for ConfigFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT_PROTO" => Ok(Self::TextProto),
            "JSON" => Ok(Self::Json),
            "YAML" => Ok(Self::Yaml),
            "XML" => Ok(Self::Xml),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

/// Which selection algorithm the balancer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Policy {
    #[default]
    RoundRobin,
    LeastConnections,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub name: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub policy: Policy,
    pub backend: Option<BackendConfig>,
    pub cert: Option<CertConfig>,
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(rename = "static")]
    pub static_backends: Option<StaticBackends>,
    pub dynamic: Option<DynamicBackends>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticBackends {
    #[serde(default, deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicBackends {
    pub register_path: Option<String>,
    pub deregister_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertConfig {
    pub local: Option<LocalCert>,
    pub acme: Option<AcmeCert>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalCert {
    pub cert_path: Option<String>,
    pub private_key_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeCert {
    pub domain: Option<String>,
    pub server_dir: Option<String>,
    pub cache_directory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    pub probe: Option<HealthProbe>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub initial_delay: Option<Duration>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub period: Option<Duration>,
    pub disconnect_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthProbe {
    pub http_get: Option<HttpGet>,
    pub command: Option<CommandProbe>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpGet {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandProbe {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Parses a configuration document in the given format. Syntactic only;
/// call [`Config::validate`] before acting on the result.
pub fn parse(input: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse { format, message };
    match format {
        ConfigFormat::Json => serde_json::from_str(input).map_err(|e| parse_err(e.to_string())),
        ConfigFormat::Yaml => serde_yaml::from_str(input).map_err(|e| parse_err(e.to_string())),
        ConfigFormat::Xml => quick_xml::de::from_str(input).map_err(|e| parse_err(e.to_string())),
        ConfigFormat::TextProto => {
            let value = textformat::to_value(input).map_err(|e| parse_err(e.to_string()))?;
            serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))
        }
    }
}

/// Parses a configuration file, inferring the format from its extension.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let format = file_format(path)?;
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse(&content, format)
}

fn file_format(path: &Path) -> Result<ConfigFormat, ConfigError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match extension {
        "textpb" | "textproto" | "pb" => Ok(ConfigFormat::TextProto),
        "json" => Ok(ConfigFormat::Json),
        "yaml" | "yml" => Ok(ConfigFormat::Yaml),
        "xml" => Ok(ConfigFormat::Xml),
        other => Err(ConfigError::UnknownExtension {
            extension: format!(".{other}"),
            path: path.display().to_string(),
        }),
    }
}

impl Config {
    /// Semantic validation, run once at startup after any flag overrides
    /// have been applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.is_none() {
            return Err(ConfigError::Invalid("a listening port must be set".into()));
        }

        let Some(backend) = &self.backend else {
            return Err(ConfigError::Invalid(
                "a backend section (static or dynamic) must be set".into(),
            ));
        };
        match (&backend.static_backends, &backend.dynamic) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "backend must be either static or dynamic, not both".into(),
                ));
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "backend must specify static urls or dynamic paths".into(),
                ));
            }
            (None, Some(dynamic)) => {
                for (field, value) in [
                    ("register_path", &dynamic.register_path),
                    ("deregister_path", &dynamic.deregister_path),
                ] {
                    match value {
                        None => {
                            return Err(ConfigError::Invalid(format!(
                                "dynamic backends require {field}"
                            )));
                        }
                        Some(path) if !path.starts_with('/') => {
                            return Err(ConfigError::Invalid(format!(
                                "{field} must start with '/'"
                            )));
                        }
                        Some(_) => {}
                    }
                }
            }
            (Some(_), None) => {}
        }

        if self.protocol == Protocol::Https && self.cert.is_none() {
            return Err(ConfigError::Invalid(
                "the HTTPS protocol requires a cert section".into(),
            ));
        }
        if let Some(cert) = &self.cert {
            match (&cert.local, &cert.acme) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(
                        "cert must be either local or acme, not both".into(),
                    ));
                }
                (None, None) => {
                    return Err(ConfigError::Invalid(
                        "cert must specify local files or an acme directory".into(),
                    ));
                }
                (Some(local), None) => {
                    if local.cert_path.as_deref().unwrap_or_default().is_empty()
                        || local
                            .private_key_path
                            .as_deref()
                            .unwrap_or_default()
                            .is_empty()
                    {
                        return Err(ConfigError::Invalid(
                            "local cert setup must specify the certificate and key path".into(),
                        ));
                    }
                }
                (None, Some(acme)) => {
                    if acme.domain.as_deref().unwrap_or_default().is_empty()
                        || acme.server_dir.as_deref().unwrap_or_default().is_empty()
                    {
                        return Err(ConfigError::Invalid(
                            "automatic certificate management requires the domain and the server directory".into(),
                        ));
                    }
                }
            }
        }

        if let Some(health) = &self.health_check {
            let Some(probe) = &health.probe else {
                return Err(ConfigError::Invalid("health_check requires a probe".into()));
            };
            if probe.command.is_some() {
                return Err(ConfigError::Invalid(
                    "custom command health probes are not supported".into(),
                ));
            }
            let path = probe
                .http_get
                .as_ref()
                .and_then(|g| g.path.as_deref())
                .unwrap_or_default();
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(
                    "health_check probe requires an http_get path starting with '/'".into(),
                ));
            }
            if health.period.is_none() {
                return Err(ConfigError::Invalid("health_check requires a period".into()));
            }
            if health.disconnect_threshold == Some(0) {
                return Err(ConfigError::Invalid(
                    "disconnect_threshold must be at least 1".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Accepts `urls: "http://a"` (text proto repeats collapse to a scalar
/// when there is a single entry) as well as a proper list.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OneOrMany;

    impl<'de> Visitor<'de> for OneOrMany {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(vec![value.to_string()])
        }

        fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut values = Vec::new();
            while let Some(value) = seq.next_element::<String>()? {
                values.push(value);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(OneOrMany)
}

/// Durations come in two shapes: the humantime string form (`"5s"`,
/// `"250ms"`) used by JSON and YAML configs, and the proto-message form
/// (`{ seconds: 5, nanos: 0 }`) used by text-proto configs.
fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationRepr;

    impl<'de> Visitor<'de> for DurationRepr {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration string or a {seconds, nanos} object")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
            d.deserialize_any(DurationRepr)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            humantime::parse_duration(value)
                .map(Some)
                .map_err(|e| E::custom(format!("invalid duration {value:?}: {e}")))
        }

        fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut seconds: u64 = 0;
            let mut nanos: u32 = 0;
            while let Some(key) = map.next_key::<String>()? {
                match key.as_str() {
                    "seconds" => seconds = map.next_value()?,
                    "nanos" => nanos = map.next_value()?,
                    other => {
                        return Err(de::Error::custom(format!(
                            "unknown duration field {other}"
                        )));
                    }
                }
            }
            Ok(Some(Duration::new(seconds, nanos)))
        }
    }

    deserializer.deserialize_option(DurationRepr)
}
