use serde::Deserialize;

use crate::credentials::KdfParams;

/// Complete Calbridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CalbridgeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub kdf: KdfConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "calbridge.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Password KDF cost parameters
#[derive(Debug, Clone, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_log_n")]
    pub log_n: u8,
    #[serde(default = "default_r")]
    pub r: u32,
    #[serde(default = "default_p")]
    pub p: u32,
}

fn default_log_n() -> u8 {
    KdfParams::default().log_n
}

fn default_r() -> u32 {
    KdfParams::default().r
}

fn default_p() -> u32 {
    KdfParams::default().p
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            log_n: default_log_n(),
            r: default_r(),
            p: default_p(),
        }
    }
}

impl KdfConfig {
    pub fn params(&self) -> KdfParams {
        KdfParams {
            log_n: self.log_n,
            r: self.r,
            p: self.p,
        }
    }
}

/// Calendar provider endpoints and OAuth client
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// OAuth client id; falls back to CALBRIDGE_CLIENT_ID.
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth client secret; falls back to CALBRIDGE_CLIENT_SECRET.
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn default_api_base_url() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            token_url: default_token_url(),
            client_id: None,
            client_secret: None,
        }
    }
}

impl CalendarConfig {
    pub fn resolved_client_id(&self) -> Option<String> {
        self.client_id
            .clone()
            .or_else(|| std::env::var("CALBRIDGE_CLIENT_ID").ok())
    }

    pub fn resolved_client_secret(&self) -> Option<String> {
        self.client_secret
            .clone()
            .or_else(|| std::env::var("CALBRIDGE_CLIENT_SECRET").ok())
    }
}

impl Default for CalbridgeConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            kdf: KdfConfig::default(),
            calendar: CalendarConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<CalbridgeConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: CalbridgeConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CalbridgeConfig::default();
        assert_eq!(config.database.path, "calbridge.db");
        assert_eq!(config.kdf.log_n, 14);
        assert_eq!(config.kdf.r, 8);
        assert_eq!(config.kdf.p, 1);
        assert!(config.calendar.api_base_url.contains("googleapis.com"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [database]
            path = "/var/lib/calbridge/store.db"

            [kdf]
            log_n = 15
            r = 8
            p = 2

            [calendar]
            api_base_url = "https://calendar.example.com/v3"
            token_url = "https://auth.example.com/token"
            client_id = "cid"
            client_secret = "csecret"
        "#;

        let config: CalbridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database.path, "/var/lib/calbridge/store.db");
        assert_eq!(config.kdf.params().log_n, 15);
        assert_eq!(config.kdf.params().p, 2);
        assert_eq!(config.calendar.token_url, "https://auth.example.com/token");
        assert_eq!(config.calendar.client_id.as_deref(), Some("cid"));
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [database]
            path = "test.db"
        "#;

        let config: CalbridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database.path, "test.db");
        assert_eq!(config.kdf.log_n, 14); // Default
        assert!(config.calendar.token_url.contains("oauth2")); // Default
    }
}
