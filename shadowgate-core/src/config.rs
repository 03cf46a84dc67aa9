use crate::cipher::CipherSuite;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::config("No servers configured"));
        }
        let mut tags = HashSet::new();
        for server in &self.servers {
            if !tags.insert(server.tag.as_str()) {
                return Err(Error::config(format!("Duplicate server tag: {}", server.tag)));
            }
            let suite = CipherSuite::parse(&server.method)?;
            server.decode_key(suite)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
        }
    }
}

/// One Shadowsocks 2022 listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tag: String,
    #[serde(default = "default_bind_address")]
    pub listen: String,
    pub port: u16,
    #[serde(default = "default_method")]
    pub method: String,
    /// Base64-encoded pre-shared key. Must decode to exactly the cipher
    /// suite's key length.
    pub key: String,
}

impl ServerConfig {
    pub fn decode_key(&self, suite: CipherSuite) -> Result<Vec<u8>> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let psk = STANDARD
            .decode(&self.key)
            .map_err(|e| Error::config(format!("Invalid key (must be base64): {}", e)))?;
        if psk.len() != suite.key_len() {
            return Err(Error::config(format!(
                "Invalid key length for {}: expected {}, got {}",
                self.method,
                suite.key_len(),
                psk.len()
            )));
        }
        Ok(psk)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Silent,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_method() -> String {
    "aead_aes_256_gcm".to_string()
}
