use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub sandbox_url: String,
    pub sandbox_timeout_ms: u64,
    pub grace_period_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub disconnect_abandon_hours: i64,
    pub student_rps: u32,
    pub admin_rps: u32,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env("DATABASE_URL")?,
            jwt_secret: get_env("JWT_SECRET")?,
            sandbox_url: get_env("SANDBOX_URL")?,
            sandbox_timeout_ms: get_env_parse("SANDBOX_TIMEOUT_MS")?,
            grace_period_seconds: get_env_parse("GRACE_PERIOD_SECONDS")?,
            sweep_interval_seconds: get_env_parse("SWEEP_INTERVAL_SECONDS")?,
            disconnect_abandon_hours: get_env_parse("DISCONNECT_ABANDON_HOURS")?,
            student_rps: get_env_parse("STUDENT_RPS")?,
            admin_rps: get_env_parse("ADMIN_RPS")?,
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_parse<T>(name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(name)?;
    raw.parse()
        .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e)))
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
