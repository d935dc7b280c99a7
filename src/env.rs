//! Runtime environment detection.
//!
//! Single source of truth for the runtime environment, read from the
//! `PFCAM_ENV` environment variable:
//!
//! - `test` - test mode (config and session files under the repo's `tmp/`)
//! - `development` or `dev` - development mode (verbose default logging)
//! - anything else or unset - production mode

/// Runtime environment for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment - keeps all files inside the repository.
    Test,
}

impl Environment {
    /// Detect current environment from `PFCAM_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("PFCAM_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` if this is the test environment.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }

    /// Returns `true` if this is the development environment.
    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }

    /// Default `env_logger` filter when `RUST_LOG` is unset.
    #[must_use]
    pub fn default_log_filter(self) -> &'static str {
        match self {
            Self::Development => "pfcam_realtime=debug,info",
            Self::Test => "pfcam_realtime=trace,warn",
            Self::Production => "info",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience function to check if running in test mode.
///
/// Equivalent to `Environment::current().is_test()`.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}
