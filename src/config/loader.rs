use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, ProviderConfig, UserConfig};
use crate::address::{AddressMapper, PhoneNumber};
use crate::provider::ProviderRegistry;

impl Config {
    /// Load configuration from a YAML file or a configuration directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.is_dir() {
            return Self::from_directory(path);
        }

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.xmpp.server.is_empty() {
            anyhow::bail!("xmpp.server must be set");
        }
        if self.xmpp.domain.is_empty() {
            anyhow::bail!("xmpp.domain must be set");
        }
        if self.xmpp.secret.is_empty() {
            anyhow::bail!("xmpp.secret must be set");
        }
        if self.gateway.receipt_capacity == 0 {
            anyhow::bail!("gateway.receipt_capacity must be at least 1");
        }

        if let Some(prefix) = &self.gateway.default_prefix {
            let digits = prefix.strip_prefix('+').unwrap_or("");
            if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit())
            {
                anyhow::bail!(
                    "gateway.default_prefix must look like +<country code>, got '{}'",
                    prefix
                );
            }
        }

        if self.providers.is_empty() {
            anyhow::bail!("at least one provider must be defined");
        }

        // Provider names are webhook path segments
        let registry = ProviderRegistry::with_builtin();
        let known = registry.kinds();
        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() || provider.name.contains('/') {
                anyhow::bail!("invalid provider name: '{}'", provider.name);
            }
            if !provider_names.insert(provider.name.as_str()) {
                anyhow::bail!("duplicate provider name: {}", provider.name);
            }
            if !known.iter().any(|kind| *kind == provider.kind) {
                anyhow::bail!(
                    "provider '{}' has unknown type '{}' (expected one of: {})",
                    provider.name,
                    provider.kind,
                    known.join(", ")
                );
            }
        }

        let mut user_jids = HashSet::new();
        for user in &self.users {
            if !user_jids.insert(user.jid.bare()) {
                anyhow::bail!("duplicate user: {}", user.jid);
            }
            self.user_phone(user)?;
            if self.provider_for(user).is_none() {
                match &user.provider {
                    Some(name) => {
                        anyhow::bail!("user '{}' references unknown provider: {}", user.jid, name)
                    }
                    None => anyhow::bail!(
                        "user '{}' must name a provider when more than one is defined",
                        user.jid
                    ),
                }
            }
        }

        for phone in &self.phones {
            PhoneNumber::parse_with_prefix(&phone.phone, self.gateway.default_prefix.as_deref())
                .with_context(|| format!("invalid phone mapping for {}", phone.jid))?;
        }

        for user in &self.rosters {
            if !user_jids.contains(&user.bare()) {
                anyhow::bail!("roster user '{}' is not a configured user", user);
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }

    /// The provider that carries `user`'s messages.
    pub fn provider_for(&self, user: &UserConfig) -> Option<&ProviderConfig> {
        match &user.provider {
            Some(name) => self.providers.iter().find(|p| &p.name == name),
            None if self.providers.len() == 1 => self.providers.first(),
            None => None,
        }
    }

    fn user_phone(&self, user: &UserConfig) -> Result<PhoneNumber> {
        PhoneNumber::parse_with_prefix(&user.phone, self.gateway.default_prefix.as_deref())
            .with_context(|| format!("invalid phone number for user {}", user.jid))
    }

    /// Build the address mapper from the user and phone tables.
    pub fn mapper(&self) -> Result<AddressMapper> {
        let prefix = self.gateway.default_prefix.as_deref();
        let mut mapper = AddressMapper::new(&self.xmpp.domain)
            .with_default_prefix(self.gateway.default_prefix.clone())
            .with_policy(self.gateway.unmapped);

        for user in &self.users {
            mapper = mapper.with_user(user.jid.clone(), self.user_phone(user)?);
        }
        for phone in &self.phones {
            let number = PhoneNumber::parse_with_prefix(&phone.phone, prefix)
                .with_context(|| format!("invalid phone mapping for {}", phone.jid))?;
            mapper = mapper.with_phone(number, phone.jid.clone());
        }

        Ok(mapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Jid, Resolved, UnmappedPolicy};
    use std::time::Duration;

    const MINIMAL: &str = r#"
xmpp:
  server: "localhost:5347"
  domain: sms.example.com
  secret: s3cret

providers:
  - name: carrier
    type: mock
"#;

    #[test]
    fn test_minimal_config() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.xmpp.domain, "sms.example.com");
        assert_eq!(config.xmpp.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.xmpp.send_timeout, Duration::from_secs(5));
        assert_eq!(config.http.address.port(), 9677);
        assert_eq!(config.admin.address.port(), 9090);
        assert_eq!(config.gateway.receipt_capacity, 10);
        assert_eq!(config.gateway.unmapped, UnmappedPolicy::Ignore);
        assert_eq!(config.settings.supervisor.initial_backoff, Duration::from_secs(1));
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
xmpp:
  server: "xmpp.example.com:5347"
  domain: sms.example.com
  secret: s3cret
  reconnect_delay: 2s
  send_timeout: 500ms

http:
  address: "0.0.0.0:8080"
  public_url: "https://sms.example.com/hooks"

gateway:
  default_prefix: "+1"
  unmapped: reject
  receipt_capacity: 50

users:
  - jid: alice@example.com
    phone: "(555) 999-8888"
    provider: twilio

phones:
  - phone: "+15550001111"
    jid: carol@example.com

providers:
  - name: twilio
    type: twilio
    params:
      account_sid: AC123
      key_sid: SK123
      key_secret: secret
  - name: backup
    type: mock

rosters:
  - alice@example.com

telemetry:
  log_level: debug
  json_logs: true
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.xmpp.send_timeout, Duration::from_millis(500));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].params["account_sid"], "AC123");
        assert_eq!(config.provider_for(&config.users[0]).unwrap().name, "twilio");
        assert!(config.telemetry.json_logs);

        let mapper = config.mapper().unwrap();
        assert_eq!(mapper.policy(), UnmappedPolicy::Reject);
        let alice = Jid::parse("alice@example.com").unwrap();
        assert_eq!(
            mapper.address_to_phone(&alice).unwrap(),
            Resolved::Mapped(PhoneNumber::parse("+15559998888").unwrap())
        );
    }

    #[test]
    fn test_single_provider_is_implicit() {
        let yaml = format!(
            "{}\nusers:\n  - jid: alice@example.com\n    phone: \"+15559998888\"\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.provider_for(&config.users[0]).unwrap().name, "carrier");
    }

    #[test]
    fn test_unknown_user_provider() {
        let yaml = format!(
            "{}\nusers:\n  - jid: alice@example.com\n    phone: \"+15559998888\"\n    provider: nope\n",
            MINIMAL
        );
        let result = Config::from_yaml(&yaml);
        assert!(result.unwrap_err().to_string().contains("unknown provider"));
    }

    #[test]
    fn test_unknown_provider_type() {
        let yaml = r#"
xmpp:
  server: "localhost:5347"
  domain: sms.example.com
  secret: s3cret
providers:
  - name: carrier
    type: carrier-pigeon
"#;
        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("unknown type"));
    }

    #[test]
    fn test_duplicate_provider_name() {
        let yaml = format!("{}  - name: carrier\n    type: mock\n", MINIMAL);
        let result = Config::from_yaml(&yaml);
        assert!(result.unwrap_err().to_string().contains("duplicate provider"));
    }

    #[test]
    fn test_bad_default_prefix() {
        let yaml = format!("{}\ngateway:\n  default_prefix: \"1\"\n", MINIMAL);
        let result = Config::from_yaml(&yaml);
        assert!(result.unwrap_err().to_string().contains("default_prefix"));
    }

    #[test]
    fn test_bad_user_phone() {
        let yaml = format!(
            "{}\nusers:\n  - jid: alice@example.com\n    phone: \"call me\"\n",
            MINIMAL
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_no_providers() {
        let yaml = r#"
xmpp:
  server: "localhost:5347"
  domain: sms.example.com
  secret: s3cret
"#;
        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("at least one provider"));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smsd.yaml");
        fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.providers[0].name, "carrier");
    }
}
