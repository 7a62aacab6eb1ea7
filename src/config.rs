use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    /// Base DNs this server claims to serve; published in the root DSE.
    #[serde(default)]
    pub naming_contexts: Vec<String>,
    #[serde(default)]
    pub limits: Limits,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Largest LDAPMessage accepted from a client, in bytes.
    pub max_message_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
    /// Require and verify a client certificate against ca_file.
    #[serde(default)]
    pub require_client_cert: bool,
}

/// Data served by the bundled in-memory directory handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// DN accepted for an authenticated simple bind.
    pub root_dn: Option<String>,
    pub root_password: Option<String>,
    #[serde(default)]
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub dn: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.listen.url.starts_with("ldap://") && !self.listen.url.starts_with("ldaps://") {
            anyhow::bail!("listen.url must use the ldap:// or ldaps:// scheme");
        }
        if self.listen.url.starts_with("ldaps://") && self.tls.is_none() {
            anyhow::bail!("ldaps:// listener requires a tls section");
        }
        if self.directory.root_dn.is_some() != self.directory.root_password.is_some() {
            anyhow::bail!("directory.root_dn and directory.root_password must be set together");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:1389".to_string(),
            },
            naming_contexts: vec![],
            limits: Limits::default(),
            tls: None,
            directory: DirectoryConfig::default(),
        }
    }
}
