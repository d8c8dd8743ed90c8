//! Directory-of-files configuration.
//!
//! ```text
//! <dir>/config            xmpp_server, xmpp_domain, xmpp_secret, public_url, ...
//! <dir>/users             <jid> <provider>:<phone>
//! <dir>/providers/<name>  type <type>, then one line per parameter
//! <dir>/rosters           <jid> <address book url>   (optional)
//! ```
//!
//! Every file holds whitespace-separated key/value lines; blank lines and
//! lines starting with `#` are skipped.

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

use super::types::Config;

/// Keys of the `config` file and where they land in the YAML layout.
const CONFIG_KEYS: &[(&str, &[&str])] = &[
    ("xmpp_server", &["xmpp", "server"]),
    ("xmpp_domain", &["xmpp", "domain"]),
    ("xmpp_secret", &["xmpp", "secret"]),
    ("reconnect_delay", &["xmpp", "reconnect_delay"]),
    ("send_timeout", &["xmpp", "send_timeout"]),
    ("public_url", &["http", "public_url"]),
    ("http_address", &["http", "address"]),
    ("admin_address", &["admin", "address"]),
    ("default_prefix", &["gateway", "default_prefix"]),
    ("unmapped", &["gateway", "unmapped"]),
    ("receipt_capacity", &["gateway", "receipt_capacity"]),
    ("log_level", &["telemetry", "log_level"]),
    ("otlp_endpoint", &["telemetry", "otlp_endpoint"]),
];

/// Read `key value` lines, keeping their order.
fn parse_pairs(path: &Path, contents: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            anyhow::bail!(
                "{}:{}: expected '<key> <value>', got '{}'",
                path.display(),
                n + 1,
                line
            );
        }
        pairs.push((fields[0].to_string(), fields[1].to_string()));
    }
    Ok(pairs)
}

fn read_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_pairs(path, &contents)
}

fn read_optional_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    match fs::read_to_string(path) {
        Ok(contents) => parse_pairs(path, &contents),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Scalar for a `config` value; counts are the only non-string fields.
fn scalar(field: &str, value: String) -> Value {
    match field {
        "receipt_capacity" => value
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(value)),
        _ => Value::from(value),
    }
}

fn users(path: &Path) -> Result<Value> {
    let mut users = Vec::new();
    for (jid, entry) in read_pairs(path)? {
        let Some((provider, phone)) = entry.split_once(':') else {
            anyhow::bail!(
                "user {} in {} has malformed configuration (should look like provider:phonenumber)",
                jid,
                path.display()
            );
        };
        let mut user = Mapping::new();
        user.insert("jid".into(), jid.into());
        user.insert("phone".into(), phone.into());
        user.insert("provider".into(), provider.into());
        users.push(Value::Mapping(user));
    }
    Ok(Value::Sequence(users))
}

fn providers(dir: &Path) -> Result<Value> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read providers directory {}", dir.display()))?;

    // Sorted so the provider order does not depend on the filesystem.
    let mut files = BTreeMap::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        files.insert(name, entry.path());
    }

    let mut providers = Vec::new();
    for (name, path) in files {
        let mut params = Mapping::new();
        let mut kind = None;
        for (key, value) in read_pairs(&path)? {
            if key == "type" {
                kind = Some(value);
            } else {
                params.insert(key.into(), value.into());
            }
        }
        let kind = kind.with_context(|| format!("{} lacks type parameter", path.display()))?;

        let mut provider = Mapping::new();
        provider.insert("name".into(), name.into());
        provider.insert("type".into(), kind.into());
        provider.insert("params".into(), Value::Mapping(params));
        providers.push(Value::Mapping(provider));
    }
    Ok(Value::Sequence(providers))
}

impl Config {
    /// Load the directory-of-files layout and validate it.
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(path = %dir.display(), "loading configuration directory");

        let mut sections: BTreeMap<&str, Mapping> = BTreeMap::new();
        for (key, value) in read_pairs(&dir.join("config"))? {
            match CONFIG_KEYS.iter().find(|(name, _)| *name == key) {
                Some((_, [group, field])) => {
                    sections
                        .entry(*group)
                        .or_default()
                        .insert((*field).into(), scalar(field, value));
                }
                _ => debug!(key = %key, "ignoring unknown config key"),
            }
        }

        let mut root = Mapping::new();
        for (group, fields) in sections {
            root.insert(group.into(), Value::Mapping(fields));
        }
        root.insert("users".into(), users(&dir.join("users"))?);
        root.insert("providers".into(), providers(&dir.join("providers"))?);

        let rosters: Vec<Value> = read_optional_pairs(&dir.join("rosters"))?
            .into_iter()
            .map(|(jid, _url)| jid.into())
            .collect();
        root.insert("rosters".into(), Value::Sequence(rosters));

        let config: Config = serde_yaml::from_value(Value::Mapping(root))
            .with_context(|| format!("invalid configuration in {}", dir.display()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Jid;
    use std::path::PathBuf;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn sample_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "config",
            "# component\nxmpp_server localhost:5347\nxmpp_domain sms.example.com\n\
             xmpp_secret s3cret\npublic_url https://sms.example.com\n",
        );
        write(dir.path(), "users", "alice@example.com twilio:+15559998888\n");
        write(
            dir.path(),
            "providers/twilio",
            "type twilio\naccount_sid AC123\nkey_sid SK123\nkey_secret secret\n",
        );
        write(dir.path(), "providers/.swp", "garbage");
        dir
    }

    #[test]
    fn test_from_directory() {
        let dir = sample_dir();
        write(
            dir.path(),
            "rosters",
            "alice@example.com https://dav.example.com/alice/\n",
        );

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.xmpp.server, "localhost:5347");
        assert_eq!(config.http.public_url.as_deref(), Some("https://sms.example.com"));
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].provider.as_deref(), Some("twilio"));
        assert_eq!(config.users[0].phone, "+15559998888");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].kind, "twilio");
        assert_eq!(config.providers[0].params["key_sid"], "SK123");
        assert!(!config.providers[0].params.contains_key("type"));
        assert_eq!(config.rosters, vec![Jid::parse("alice@example.com").unwrap()]);
    }

    #[test]
    fn test_rosters_file_is_optional() {
        let dir = sample_dir();
        let config = Config::from_directory(dir.path()).unwrap();
        assert!(config.rosters.is_empty());
    }

    #[test]
    fn test_malformed_user() {
        let dir = sample_dir();
        write(dir.path(), "users", "alice@example.com +15559998888\n");
        let err = Config::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("provider:phonenumber"));
    }

    #[test]
    fn test_provider_without_type() {
        let dir = sample_dir();
        write(dir.path(), "providers/twilio", "account_sid AC123\n");
        let err = Config::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("lacks type"));
    }

    #[test]
    fn test_bad_line() {
        let dir = sample_dir();
        write(dir.path(), "config", "xmpp_server\n");
        let err = Config::from_directory(dir.path()).unwrap_err();
        assert!(err.to_string().contains("expected '<key> <value>'"));
    }
}
