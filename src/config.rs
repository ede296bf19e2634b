//! Service configuration

use std::env;

use config_crate::{Config as RawConfig, ConfigError, Environment, File};

/// Basic settings - hosting and database
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: Server,
}

/// Server settings
#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    pub host: String,
    pub port: String,
    pub database: String,
    pub thread_count: usize,
}

impl Config {
    /// Creates config from base.toml, which can be overridden by
    /// an environment-specific file picked by `RUN_MODE` and by
    /// `COUPONS`-prefixed environment variables
    pub fn new() -> Result<Self, ConfigError> {
        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut s = RawConfig::new();
        s.merge(File::with_name("config/base"))?;
        s.merge(File::with_name(&format!("config/{}", env)).required(false))?;
        s.merge(Environment::with_prefix("COUPONS"))?;

        s.try_into()
    }
}
