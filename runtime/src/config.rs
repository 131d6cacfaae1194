//! Dispatcher configuration.

use http::StatusCode;
use serde::Deserialize;

const DEFAULT_NOT_FOUND_STATUS: u16 = 404;
const DEFAULT_FALLBACK_STATUS: u16 = 500;

/// Configuration for [`Dispatcher`](crate::Dispatcher) instances.
///
/// # Example
///
/// ```
/// use relay_runtime::DispatcherConfig;
///
/// let config = DispatcherConfig::default()
///     .with_debug(true)
///     .with_not_found_status(410);
///
/// assert_eq!(config.not_found_status_code().as_u16(), 410);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Log stage progress at `info` and include error text in error responses
    pub debug: bool,
    /// Include error text in responses produced by error recovery
    pub expose_error_details: bool,
    /// Status of the default response when every candidate rejects
    pub not_found_status: u16,
    /// Status written directly when error recovery itself fails
    pub fallback_status: u16,
}

impl DispatcherConfig {
    /// Create a configuration with custom values
    #[must_use]
    pub const fn new(
        debug: bool,
        expose_error_details: bool,
        not_found_status: u16,
        fallback_status: u16,
    ) -> Self {
        Self {
            debug,
            expose_error_details,
            not_found_status,
            fallback_status,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Reads `RELAY_DEBUG`, `RELAY_ERROR_DETAILS`, `RELAY_NOT_FOUND_STATUS`,
    /// and `RELAY_FALLBACK_STATUS`. Missing or unparsable values keep their
    /// defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let debug = std::env::var("RELAY_DEBUG")
            .ok()
            .and_then(|s| parse_flag(&s))
            .unwrap_or(defaults.debug);

        let expose_error_details = std::env::var("RELAY_ERROR_DETAILS")
            .ok()
            .and_then(|s| parse_flag(&s))
            .unwrap_or(defaults.expose_error_details);

        let not_found_status = std::env::var("RELAY_NOT_FOUND_STATUS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.not_found_status);

        let fallback_status = std::env::var("RELAY_FALLBACK_STATUS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.fallback_status);

        Self {
            debug,
            expose_error_details,
            not_found_status,
            fallback_status,
        }
    }

    /// Enable or disable debug mode
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Include error text in error responses
    #[must_use]
    pub const fn with_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }

    /// Set the status of the default no-match response
    #[must_use]
    pub const fn with_not_found_status(mut self, status: u16) -> Self {
        self.not_found_status = status;
        self
    }

    /// Set the status of the last-resort fallback response
    #[must_use]
    pub const fn with_fallback_status(mut self, status: u16) -> Self {
        self.fallback_status = status;
        self
    }

    /// Whether error text may be written to response bodies
    #[must_use]
    pub const fn shows_error_details(&self) -> bool {
        self.debug || self.expose_error_details
    }

    /// Validated no-match status; invalid values fall back to 404
    #[must_use]
    pub fn not_found_status_code(&self) -> StatusCode {
        status_or(self.not_found_status, DEFAULT_NOT_FOUND_STATUS, "not_found_status")
    }

    /// Validated fallback status; invalid values fall back to 500
    #[must_use]
    pub fn fallback_status_code(&self) -> StatusCode {
        status_or(self.fallback_status, DEFAULT_FALLBACK_STATUS, "fallback_status")
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debug: false,
            expose_error_details: false,
            not_found_status: DEFAULT_NOT_FOUND_STATUS,
            fallback_status: DEFAULT_FALLBACK_STATUS,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn status_or(code: u16, default: u16, field: &'static str) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or_else(|_| {
        tracing::warn!(field, code, default, "Invalid status code in configuration, using default");
        StatusCode::from_u16(default).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert!(!config.debug);
        assert!(!config.shows_error_details());
        assert_eq!(config.not_found_status_code(), StatusCode::NOT_FOUND);
        assert_eq!(config.fallback_status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_builder_chain() {
        let config = DispatcherConfig::default()
            .with_error_details(true)
            .with_fallback_status(503);

        assert!(config.shows_error_details());
        assert_eq!(config.fallback_status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_debug_implies_error_details() {
        let config = DispatcherConfig::default().with_debug(true);
        assert!(config.shows_error_details());
    }

    #[test]
    fn test_invalid_status_falls_back() {
        let config = DispatcherConfig::new(false, false, 42, 1000);
        assert_eq!(config.not_found_status_code(), StatusCode::NOT_FOUND);
        assert_eq!(config.fallback_status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_deserialize_partial() -> Result<(), serde_json::Error> {
        let config: DispatcherConfig = serde_json::from_str(r#"{ "debug": true, "not_found_status": 410 }"#)?;
        assert_eq!(config, DispatcherConfig::default().with_debug(true).with_not_found_status(410));
        Ok(())
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 0 "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
