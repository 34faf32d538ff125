use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::model::functions::Runtime;

#[derive(Deserialize, Debug)]
pub struct ApplicationSettings {
    pub port: u16,
    pub host: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    File,
    Postgres,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RegistrySettings {
    pub backend: StoreBackend,
    pub data_dir: PathBuf,

    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
}

fn default_max_code_bytes() -> usize {
    1024 * 1024
}

#[derive(Deserialize, Debug, Clone)]
pub struct VmmSettings {
    pub data_dir: PathBuf,
    pub hypervisor_binary: PathBuf,
    pub kernel_image: PathBuf,
    pub base_rootfs: PathBuf,

    #[serde(default = "default_boot_args")]
    pub boot_args: String,

    /// Hard cap on a single guest invocation, regardless of the
    /// function's own timeout.
    #[serde(default = "default_max_invoke_secs")]
    pub max_invoke_secs: u64,

    /// How long a freshly booted VM gets for its guest agent to answer
    /// health checks before the create is abandoned.
    #[serde(default = "default_guest_boot_timeout_secs")]
    pub guest_boot_timeout_secs: u64,
}

fn default_guest_boot_timeout_secs() -> u64 {
    10
}

fn default_boot_args() -> String {
    "console=ttyS0 reboot=k panic=1 pci=off".to_string()
}

fn default_max_invoke_secs() -> u64 {
    900
}

#[derive(Deserialize, Debug, Clone)]
pub struct PoolSettings {
    #[serde(default = "default_pool_size")]
    pub size: usize,

    #[serde(default = "default_refill_interval_secs")]
    pub refill_interval_secs: u64,

    /// Runtimes that get a warm pool. Unset means all known runtimes.
    pub runtimes: Option<Vec<Runtime>>,
}

fn default_pool_size() -> usize {
    2
}

fn default_refill_interval_secs() -> u64 {
    10
}

#[derive(Deserialize, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub registry: RegistrySettings,
    pub database: DatabaseSettings,
    pub vmm: VmmSettings,
    pub pool: PoolSettings,
}

#[derive(Deserialize, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    pub port: u16,
    pub host: String,

    #[serde(rename = "database_name")]
    pub name: String,

    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn with_db(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .database(&self.name)
            .ssl_mode(PgSslMode::Prefer)
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.name
        )
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    // Configuration lives one level up from the crate, next to the workspace root
    let base_path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.."));
    let configuration_directory = base_path.join("configuration");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT.");
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        // Override database settings from environment variables if set
        .set_override_option("database.host", std::env::var("DATABASE_HOST").ok())?
        .set_override_option("database.port", std::env::var("DATABASE_PORT").ok())?
        .set_override_option("database.username", std::env::var("DATABASE_USERNAME").ok())?
        .set_override_option("database.password", std::env::var("DATABASE_PASSWORD").ok())?
        .set_override_option(
            "database.database_name",
            std::env::var("DATABASE_NAME").ok(),
        )?
        // Override guest image paths if set and non-empty (empty string
        // means "not set" and falls back to the yaml values)
        .set_override_option(
            "vmm.hypervisor_binary",
            std::env::var("KILN_HYPERVISOR")
                .ok()
                .filter(|s| !s.is_empty()),
        )?
        .set_override_option(
            "vmm.kernel_image",
            std::env::var("KILN_KERNEL").ok().filter(|s| !s.is_empty()),
        )?
        .set_override_option(
            "vmm.base_rootfs",
            std::env::var("KILN_ROOTFS").ok().filter(|s| !s.is_empty()),
        )?
        .build()?;
    settings.try_deserialize::<Settings>()
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_names() {
        assert!(matches!(
            Environment::try_from("local".to_string()),
            Ok(Environment::Local)
        ));
        assert!(matches!(
            Environment::try_from("PRODUCTION".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }
}
