//! Construction-time configuration.
//!
//! [`ApplicationOptions`] is resolved once, handed to
//! [`Application::new`](crate::Application::new), and never touched again.
//! It deserializes from any serde format with every field optional:
//!
//! ```rust
//! use portico::ApplicationOptions;
//!
//! let opts: ApplicationOptions = serde_json::from_str(r#"{
//!     "idle_timeout_ms": 5000,
//!     "allowed_origins": "https://a.example, https://b.example"
//! }"#).unwrap();
//! assert_eq!(opts.max_payload_bytes, 2048);
//! ```

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_HEADERS: usize = 50;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 2048;
/// Twenty days.
pub const DEFAULT_PREFLIGHT_MAX_AGE_SECS: u64 = 1_728_000;

/// Which origins may make cross-origin requests.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum AllowedOrigins {
    #[default]
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Parses a comma-separated list. `*` anywhere in it means any origin.
    pub fn parse(list: &str) -> Self {
        Self::from_items(list.split(','))
    }

    fn from_items<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        let mut list = Vec::new();
        for item in items {
            let item = item.trim();
            if item == "*" {
                return Self::Any;
            }
            if !item.is_empty() {
                list.push(item.to_owned());
            }
        }
        Self::List(list)
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::List(list) => list.iter().any(|o| o == origin),
        }
    }
}

impl<'de> Deserialize<'de> for AllowedOrigins {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }
        Ok(match Raw::deserialize(d)? {
            Raw::One(s) => Self::parse(&s),
            Raw::Many(v) => Self::from_items(v.iter().map(String::as_str)),
        })
    }
}

/// Immutable configuration for an [`Application`](crate::Application).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ApplicationOptions {
    /// Sent back as `api-version` on every response when set.
    pub api_version: Option<String>,
    pub idle_timeout_ms: u64,
    pub max_headers: usize,
    pub max_payload_bytes: usize,
    pub allowed_origins: AllowedOrigins,
    pub preflight_max_age_secs: u64,
}

impl Default for ApplicationOptions {
    fn default() -> Self {
        Self {
            api_version: None,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            max_headers: DEFAULT_MAX_HEADERS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            allowed_origins: AllowedOrigins::Any,
            preflight_max_age_secs: DEFAULT_PREFLIGHT_MAX_AGE_SECS,
        }
    }
}

impl ApplicationOptions {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder { opts: Self::default() }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Fluent builder for [`ApplicationOptions`]. Obtain via
/// [`ApplicationOptions::builder()`].
pub struct OptionsBuilder {
    opts: ApplicationOptions,
}

impl OptionsBuilder {
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.opts.api_version = Some(version.into());
        self
    }

    /// Reads the API version from environment variable `var`, once, now.
    /// Leaves any explicitly set version in place when `var` is unset.
    pub fn api_version_from_env(mut self, var: &str) -> Self {
        if let Ok(v) = std::env::var(var) {
            if !v.trim().is_empty() {
                self.opts.api_version = Some(v.trim().to_owned());
            }
        }
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.opts.idle_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_headers(mut self, n: usize) -> Self {
        self.opts.max_headers = n;
        self
    }

    pub fn max_payload_bytes(mut self, n: usize) -> Self {
        self.opts.max_payload_bytes = n;
        self
    }

    /// Comma-separated origin list, or `*`.
    pub fn allowed_origins(mut self, origins: &str) -> Self {
        self.opts.allowed_origins = AllowedOrigins::parse(origins);
        self
    }

    pub fn allowed_origin_list<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let items: Vec<S> = origins.into_iter().collect();
        self.opts.allowed_origins = AllowedOrigins::from_items(items.iter().map(AsRef::as_ref));
        self
    }

    pub fn preflight_max_age(mut self, secs: u64) -> Self {
        self.opts.preflight_max_age_secs = secs;
        self
    }

    pub fn build(self) -> ApplicationOptions {
        self.opts
    }
}
