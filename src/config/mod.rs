use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppserviceConfig {
    /// This multiplexer's own AS-registration id, used to rewrite the
    /// `_bridge_manager__<anything>` path segment in bridge pings.
    pub id: String,
    /// Username prefix applied to every bridge-owned Matrix user id, e.g.
    /// `_bridge_manager__`.
    pub namespace: String,
    /// Token this multiplexer presents to the homeserver on bridge->homeserver calls.
    pub as_token: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_outbound_timeout_seconds")]
    pub outbound_timeout_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_outbound_timeout_seconds() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: u32,
}

fn default_max_open_conns() -> u32 {
    20
}

fn default_max_idle_conns() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token gating `/admin/*`; bridge listing and soft-delete.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_min_level")]
    pub min_level: String,
}

fn default_min_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub appservice: AppserviceConfig,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        min_level: default_min_level(),
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let resolved_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| path.to_string());
        let content = std::fs::read_to_string(&resolved_path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut config: Config = serde_yaml::from_slice(bytes)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.appservice.namespace.is_empty() {
            anyhow::bail!("appservice.namespace must not be empty");
        }
        if !self.appservice.namespace.ends_with('_') {
            anyhow::bail!("appservice.namespace should end with an underscore separator, e.g. '_bridge_manager__'");
        }
        validate_not_placeholder("appservice.as_token", &self.appservice.as_token)?;
        validate_not_placeholder("admin.token", &self.admin.token)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        override_from_env(&mut self.appservice.id, "APPSERVICE_ID");
        override_from_env(&mut self.appservice.namespace, "NAMESPACE");
        override_from_env(&mut self.appservice.as_token, "AS_TOKEN");
        override_from_env(&mut self.appservice.host, "HOST");
        override_from_env(&mut self.database.uri, "DATABASE_URI");
        override_from_env(&mut self.admin.token, "ADMIN_TOKEN");

        if let Ok(value) = env_var("PORT") {
            if let Ok(port) = value.parse::<u16>() {
                self.appservice.port = port;
            }
        }
    }
}

fn env_var(suffix: &str) -> Result<String, std::env::VarError> {
    let key = format!("BRIDGE_MANAGER_{}", suffix);
    std::env::var(key)
}

fn override_from_env(target: &mut String, suffix: &str) {
    if let Ok(value) = env_var(suffix) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn validate_not_placeholder(field: &str, value: &str) -> Result<()> {
    let lowered = value.trim().to_ascii_lowercase();
    let is_placeholder = lowered.is_empty()
        || lowered.contains("your_")
        || lowered.contains("changeme")
        || lowered.contains("replace_me")
        || lowered.contains("example")
        || lowered.ends_with("_here");
    if is_placeholder {
        anyhow::bail!(
            "configuration field '{}' still uses placeholder value: '{}'",
            field,
            value
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
appservice:
  id: bridge_manager_1
  namespace: "_bridge_manager__"
  as_token: "s3cr3t-as-token"
database:
  uri: "sqlite://data/bridge_manager.db"
admin:
  token: "s3cr3t-admin-token"
"#;

    #[test]
    fn loads_minimal_config() {
        let config = Config::load_from_bytes(SAMPLE.as_bytes()).unwrap();
        assert_eq!(config.appservice.port, 8008);
        assert_eq!(config.appservice.namespace, "_bridge_manager__");
    }

    #[test]
    fn rejects_placeholder_token() {
        let bad = SAMPLE.replace("s3cr3t-as-token", "changeme");
        let err = Config::load_from_bytes(bad.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }
}
