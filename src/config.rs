//! Configuration management for the RAX FTP runtime
//!
//! Values come from built-in defaults, then an optional `config.toml`, then
//! `RAX_FTP_*` environment variables. Everything is read once at startup.

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_PATHS: [&str; 2] = [
    "rax-ftp-runtime/config", // container layout: /app/rax-ftp-runtime/config.toml
    "config",                 // local development: ./config.toml
];

/// Startup configuration for the runtime and its control-port server
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// IP address the control port binds to
    /// Environment: RAX_FTP_BIND_ADDRESS
    pub bind_address: String,

    /// Control port
    /// Environment: RAX_FTP_CONTROL_PORT
    pub control_port: u16,

    /// Fixed delay between reactor ticks
    pub tick_delay_ms: u64,

    /// Descriptors handed to a single readiness syscall
    pub poll_batch_size: usize,

    /// Sessions silent for this long are closed
    pub idle_timeout_ms: u64,

    /// Text of the 220 greeting
    pub banner: String,

    /// PEM certificate chain; with `tls_key_path`, enables implicit TLS
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl RuntimeConfig {
    /// Load configuration from the first `config.toml` found, with
    /// environment overrides. A missing file is not an error.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut builder = Self::defaults()?;
        for path in CONFIG_PATHS {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        Self::finish(builder)
    }

    /// Load from an explicit file (extension optional), with environment
    /// overrides.
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        Self::finish(Self::defaults()?.add_source(File::with_name(path)))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        Config::builder()
            .set_default("bind_address", "127.0.0.1")?
            .set_default("control_port", 2121)?
            .set_default("tick_delay_ms", 10)?
            .set_default("poll_batch_size", 64)?
            .set_default("idle_timeout_ms", 300_000)?
            .set_default("banner", "RAX FTP runtime ready")
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, config::ConfigError> {
        let settings = builder
            .add_source(Environment::with_prefix("RAX_FTP").try_parsing(true))
            .build()?;
        let config: RuntimeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.control_port == 0 {
            return Err(config::ConfigError::Message(
                "Control port cannot be 0".into(),
            ));
        }

        if self.tick_delay_ms == 0 {
            return Err(config::ConfigError::Message(
                "tick_delay_ms must be greater than 0".into(),
            ));
        }

        if self.poll_batch_size == 0 {
            return Err(config::ConfigError::Message(
                "poll_batch_size must be greater than 0".into(),
            ));
        }

        if self.idle_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "idle_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(config::ConfigError::Message(
                "tls_cert_path and tls_key_path must be set together".into(),
            ));
        }

        Ok(())
    }

    /// Bind address and control port as a socket address string
    pub fn control_socket(&self) -> String {
        format!("{}:{}", self.bind_address, self.control_port)
    }

    pub fn tick_delay(&self) -> Duration {
        Duration::from_millis(self.tick_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Certificate and key paths when implicit TLS is configured
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use pretty_assertions::assert_eq;

    fn parse(toml: &str) -> Result<RuntimeConfig, config::ConfigError> {
        let settings = RuntimeConfig::defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        let config: RuntimeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse("").unwrap();
        assert_eq!(config.control_socket(), "127.0.0.1:2121");
        assert_eq!(config.tick_delay(), Duration::from_millis(10));
        assert_eq!(config.poll_batch_size, 64);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.tls_paths(), None);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let config = parse(
            r#"
            control_port = 2200
            banner = "hello"
            tls_cert_path = "cert.pem"
            tls_key_path = "key.pem"
            "#,
        )
        .unwrap();
        assert_eq!(config.control_port, 2200);
        assert_eq!(config.banner, "hello");
        assert_eq!(
            config.tls_paths(),
            Some((PathBuf::from("cert.pem"), PathBuf::from("key.pem")))
        );
    }

    #[test]
    fn test_load_from_explicit_file() {
        let path = std::env::temp_dir().join(format!("rax-ftp-runtime-{}.toml", std::process::id()));
        std::fs::write(&path, "control_port = 2300\nidle_timeout_ms = 5000\n").unwrap();
        let loaded = RuntimeConfig::load_from(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.control_port, 2300);
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.banner, "RAX FTP runtime ready");
        assert!(RuntimeConfig::load_from("/nonexistent/rax-ftp-runtime").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for toml in [
            "control_port = 0",
            "tick_delay_ms = 0",
            "poll_batch_size = 0",
            "idle_timeout_ms = 0",
            "tls_cert_path = \"cert.pem\"",
        ] {
            assert!(parse(toml).is_err(), "accepted: {}", toml);
        }
    }
}
