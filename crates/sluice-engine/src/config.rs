//! Stream configuration, validation, and error types.
//!
//! [`StreamConfig`] is the input for opening a writer or reader.
//! [`validate()`](StreamConfig::validate) checks it before any
//! communication happens; [`from_params`](StreamConfig::from_params)
//! builds one from the string parameter map applications usually pass
//! through from their own configuration layer.

use indexmap::IndexMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ── EngineKind ─────────────────────────────────────────────────────

/// Which protocol variant a stream runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Full protocol: metadata exchange on layout changes, locked
    /// fast path otherwise.
    #[default]
    Generic,
    /// Metadata exchange and one-sided pulls on every step. Never takes
    /// the fast path.
    Naive,
}

impl EngineKind {
    /// Whether this kind may push data over the locked fast path.
    pub fn allows_fast_path(self) -> bool {
        matches!(self, Self::Generic)
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "generic" => Ok(Self::Generic),
            "naive" => Ok(Self::Naive),
            _ => Err(ConfigError::InvalidParameter {
                key: "EngineMode".into(),
                value: s.into(),
            }),
        }
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while building or validating a [`StreamConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The stream name is empty.
    EmptyName,
    /// A timeout of zero would fail every transfer.
    ZeroTimeout,
    /// A parameter value could not be parsed.
    InvalidParameter {
        /// Parameter key as supplied.
        key: String,
        /// Offending value.
        value: String,
    },
    /// The process group and the transport disagree on group size.
    GroupSizeMismatch {
        /// Ranks in the process group.
        group: usize,
        /// Ranks the transport was built for.
        transport: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "stream name must not be empty"),
            Self::ZeroTimeout => write!(f, "transfer_timeout must be positive"),
            Self::InvalidParameter { key, value } => {
                write!(f, "invalid value '{value}' for parameter '{key}'")
            }
            Self::GroupSizeMismatch { group, transport } => write!(
                f,
                "process group has {group} ranks but transport expects {transport}"
            ),
        }
    }
}

impl Error for ConfigError {}

// ── StreamConfig ───────────────────────────────────────────────────

/// Configuration shared by the writer and reader side of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream name, used in log output.
    pub name: String,
    /// Protocol variant. Default: [`EngineKind::Generic`].
    pub kind: EngineKind,
    /// Run the writer's end-of-step finalize on a background thread.
    /// Default: `false`.
    pub threading: bool,
    /// Bound on waits for peer data and step notices. `None` waits
    /// forever. Default: 60 seconds.
    pub transfer_timeout: Option<Duration>,
}

impl StreamConfig {
    /// Configuration with defaults for a stream called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EngineKind::default(),
            threading: false,
            transfer_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Set the protocol variant.
    pub fn with_kind(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }

    /// Enable or disable the background finalize thread.
    pub fn with_threading(mut self, threading: bool) -> Self {
        self.threading = threading;
        self
    }

    /// Set the transfer timeout.
    pub fn with_transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.transfer_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Build a configuration from string parameters.
    ///
    /// Keys are case-insensitive:
    ///
    /// | Key | Values |
    /// |-----|--------|
    /// | `EngineMode` | `generic`, `naive` |
    /// | `Threading` | `true`/`false`, `on`/`off`, `yes`/`no`, `1`/`0` |
    /// | `TransferTimeoutSecs` | seconds (fractional allowed), or `inf` |
    ///
    /// Unrecognised keys are ignored with a warning. The result is
    /// validated.
    pub fn from_params(
        name: impl Into<String>,
        params: &IndexMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(name);
        for (key, value) in params {
            let invalid = || ConfigError::InvalidParameter {
                key: key.clone(),
                value: value.clone(),
            };
            match key.to_ascii_lowercase().as_str() {
                "enginemode" => {
                    config.kind = value.parse().map_err(|_| invalid())?;
                }
                "threading" => {
                    config.threading = parse_bool(value).ok_or_else(invalid)?;
                }
                "transfertimeoutsecs" => {
                    config.transfer_timeout = parse_timeout(value).ok_or_else(invalid)?;
                }
                _ => tracing::warn!(stream = %config.name, %key, "ignoring unknown parameter"),
            }
        }
        config.validate()?;
        Ok(config)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new("stream")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timeout(value: &str) -> Option<Option<Duration>> {
    if value.eq_ignore_ascii_case("inf") || value.eq_ignore_ascii_case("none") {
        return Some(None);
    }
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Some(Duration::from_secs_f64(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let c = StreamConfig::new("s");
        assert_eq!(c.kind, EngineKind::Generic);
        assert!(!c.threading);
        assert_eq!(c.transfer_timeout, Some(Duration::from_secs(60)));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn empty_name_rejected() {
        assert_eq!(StreamConfig::new("").validate(), Err(ConfigError::EmptyName));
    }

    #[test]
    fn zero_timeout_rejected() {
        let c = StreamConfig::new("s").with_transfer_timeout(Some(Duration::ZERO));
        assert_eq!(c.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn params_are_case_insensitive() {
        let c = StreamConfig::from_params(
            "s",
            &params(&[
                ("engineMode", "Naive"),
                ("THREADING", "on"),
                ("TransferTimeoutSecs", "2.5"),
                ("Verbose", "5"),
            ]),
        )
        .unwrap();
        assert_eq!(c.kind, EngineKind::Naive);
        assert!(c.threading);
        assert_eq!(c.transfer_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn infinite_timeout() {
        let c =
            StreamConfig::from_params("s", &params(&[("TransferTimeoutSecs", "inf")])).unwrap();
        assert_eq!(c.transfer_timeout, None);
    }

    #[test]
    fn bad_values_are_reported_with_key() {
        match StreamConfig::from_params("s", &params(&[("Threading", "maybe")])) {
            Err(ConfigError::InvalidParameter { key, value }) => {
                assert_eq!(key, "Threading");
                assert_eq!(value, "maybe");
            }
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
        assert!(StreamConfig::from_params("s", &params(&[("EngineMode", "ssc")])).is_err());
        assert!(StreamConfig::from_params("s", &params(&[("TransferTimeoutSecs", "-1")])).is_err());
        assert_eq!(
            StreamConfig::from_params("s", &params(&[("TransferTimeoutSecs", "0")])),
            Err(ConfigError::ZeroTimeout)
        );
    }

    #[test]
    fn naive_never_takes_fast_path() {
        assert!(EngineKind::Generic.allows_fast_path());
        assert!(!EngineKind::Naive.allows_fast_path());
    }
}
