use crate::credentials::{validate_key, Envelope, Provider};
use crate::oauth::provider::{
    ProviderConfig, GOOGLE_AUTH_URL, GOOGLE_MEET_SCOPES, GOOGLE_REVOKE_URL, GOOGLE_TOKEN_URL,
};
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Prefix shared by every environment override.
const ENV_PREFIX: &str = "LESSONLINK_";

/// Complete Lessonlink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LessonlinkConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite file holding encrypted credentials
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "credentials.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Encryption keys. Key material only ever comes from the environment.
#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_active_key_version")]
    pub active_key_version: u32,
    /// Base64 keys by version
    #[serde(skip)]
    pub keys: HashMap<u32, String>,
}

fn default_active_key_version() -> u32 {
    1
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            active_key_version: default_active_key_version(),
            keys: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut versions: Vec<&u32> = self.keys.keys().collect();
        versions.sort();
        f.debug_struct("EncryptionConfig")
            .field("active_key_version", &self.active_key_version)
            .field("key_versions", &versions)
            .finish()
    }
}

/// OAuth flow timing
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSettings {
    /// How long an authorization state token stays valid
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
    /// Refresh this long before the provider's expiry
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_seconds: i64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
    /// Used when a token response has no `expires_in`
    #[serde(default = "default_token_lifetime")]
    pub default_token_lifetime_seconds: i64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

fn default_refresh_skew() -> i64 {
    60
}

fn default_http_timeout() -> u64 {
    10
}

fn default_token_lifetime() -> i64 {
    3600
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
            refresh_skew_seconds: default_refresh_skew(),
            http_timeout_seconds: default_http_timeout(),
            default_token_lifetime_seconds: default_token_lifetime(),
        }
    }
}

/// One `[providers.<name>]` table.
#[derive(Clone, Deserialize)]
pub struct ProviderSettings {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("scopes", &self.scopes)
            .field("redirect_uri", &self.redirect_uri)
            .field("client_id", &self.client_id)
            .field("has_client_secret", &self.client_secret.is_some())
            .finish()
    }
}

fn default_providers() -> BTreeMap<String, ProviderSettings> {
    BTreeMap::from([(
        "google_meet".to_string(),
        ProviderSettings {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
            scopes: GOOGLE_MEET_SCOPES.iter().map(|s| s.to_string()).collect(),
            redirect_uri: "http://localhost:3000/api/integrations/oauth/callback".to_string(),
            client_id: None,
            client_secret: None,
        },
    )])
}

impl Default for LessonlinkConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            encryption: EncryptionConfig::default(),
            oauth: OAuthSettings::default(),
            providers: default_providers(),
        }
    }
}

impl LessonlinkConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_vars(std::env::vars())
    }

    /// Apply `LESSONLINK_*` overrides from `vars`. Unrelated names are ignored.
    pub fn apply_env_vars<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match key {
                "BIND_ADDR" => self.server.bind_addr = value,
                "DATABASE_PATH" => self.storage.database_path = value,
                "ENCRYPTION_KEY" => {
                    self.encryption
                        .keys
                        .insert(self.encryption.active_key_version, value);
                }
                _ => {
                    if let Some(version) = key.strip_prefix("ENCRYPTION_KEY_V") {
                        let version: u32 = version
                            .parse()
                            .with_context(|| format!("Invalid key version in {}", name))?;
                        self.encryption.keys.insert(version, value);
                    } else if let Some(rest) = key.strip_prefix("OAUTH_") {
                        self.apply_provider_credential(rest, value);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_provider_credential(&mut self, rest: &str, value: String) {
        for (name, settings) in self.providers.iter_mut() {
            let Ok(provider) = Provider::new(name.as_str()) else {
                continue;
            };
            match rest.strip_prefix(provider.env_prefix().as_str()) {
                Some("_CLIENT_ID") => settings.client_id = Some(value),
                Some("_CLIENT_SECRET") => settings.client_secret = Some(value),
                _ => continue,
            }
            return;
        }
    }

    /// Build the envelope from the configured keys.
    ///
    /// Fails if any key is malformed or the active version has no key.
    pub fn build_envelope(&self) -> anyhow::Result<Envelope> {
        let mut keys = HashMap::with_capacity(self.encryption.keys.len());
        for (version, key) in &self.encryption.keys {
            let bytes =
                validate_key(key).with_context(|| format!("Invalid encryption key v{}", version))?;
            keys.insert(*version, bytes);
        }
        Envelope::new(self.encryption.active_key_version, keys)
    }

    /// Providers ready for use. Those without client credentials are skipped.
    pub fn provider_configs(&self) -> anyhow::Result<Vec<ProviderConfig>> {
        let mut configs = Vec::with_capacity(self.providers.len());
        for (name, settings) in &self.providers {
            let provider = Provider::new(name.as_str())
                .map_err(|e| anyhow!("Invalid provider name '{}': {}", name, e))?;

            let (Some(client_id), Some(client_secret)) =
                (&settings.client_id, &settings.client_secret)
            else {
                warn!(
                    provider = %provider,
                    "Provider has no client credentials configured, skipping"
                );
                continue;
            };

            configs.push(ProviderConfig {
                provider,
                auth_url: settings.auth_url.clone(),
                token_url: settings.token_url.clone(),
                revoke_url: settings.revoke_url.clone(),
                scopes: settings.scopes.clone(),
                redirect_uri: settings.redirect_uri.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            });
        }
        Ok(configs)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<LessonlinkConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: LessonlinkConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
