use anyhow::{Context, Result};
use ec_einv_core::models::Environment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const APP_NAME: &str = "ec-einvoice";
const KEYCHAIN_SERVICE: &str = "ec.einvoice.credentials";

/// Keychain entry holding the PKCS#12 passphrase.
pub const P12_PASSPHRASE_KEY: &str = "p12_passphrase";
/// Environment variable that overrides the keychain passphrase.
pub const P12_PASSPHRASE_ENV: &str = "EC_EINV_P12_PASSPHRASE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: Environment,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            provider: ProviderConfig::default(),
            issuer: IssuerConfig::default(),
            signing: SigningConfig::default(),
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

fn default_environment() -> Environment {
    Environment::Test
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String, // "mock" | "sri"
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Replaces `https://celcer.sri.gob.ec` for the test environment.
    pub test_base_url: Option<String>,
    /// Replaces `https://cel.sri.gob.ec` for production.
    pub production_base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            timeout_secs: default_timeout_secs(),
            test_base_url: None,
            production_base_url: None,
        }
    }
}

fn default_provider_kind() -> String {
    "mock".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

/// Defaults for the sequence identity when a command does not give one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerConfig {
    pub tax_id: Option<String>,
    #[serde(default = "default_code")]
    pub establishment: String,
    #[serde(default = "default_code")]
    pub emission_point: String,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            tax_id: None,
            establishment: default_code(),
            emission_point: default_code(),
        }
    }
}

fn default_code() -> String {
    "001".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SigningConfig {
    pub certificate_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            audit_log: default_audit_log(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".einv_pipelines")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("audit.jsonl")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub window_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            window_secs: 30,
        }
    }
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

pub fn config_path() -> Result<PathBuf> {
    confy::get_configuration_file_path(APP_NAME, None).context("Failed to locate app config")
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

/// Delete a secret from the OS keychain
pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}

/// PKCS#12 passphrase from the environment, falling back to the keychain.
pub fn p12_passphrase() -> Result<String> {
    if let Ok(value) = std::env::var(P12_PASSPHRASE_ENV) {
        return Ok(value);
    }
    get_secret(P12_PASSPHRASE_KEY)
        .with_context(|| {
            format!("PKCS#12 passphrase not found in {P12_PASSPHRASE_ENV} or keychain")
        })
}
