//! Process configuration and the per-VM BMC configuration store.
//!
//! Each managed VM owns one directory `<config_dir>/<vm_name>` holding an
//! INI-shaped `config` file under a `[VirtualBMC]` section. The directory
//! exists iff the BMC exists; the supervisor treats directories whose
//! config fails to parse as "not a VM".

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::{Error, Result};

/// Default UDP port for a new virtual BMC.
pub const DEFAULT_PORT: u16 = 6230;
/// Default bind address (IPv4 and IPv6).
pub const DEFAULT_ADDRESS: &str = "::";
/// Default IPMI credentials for a new virtual BMC.
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "password";

const SECTION: &str = "VirtualBMC";
const CONFIG_FILE: &str = "config";

// ---------------------------------------------------------------------------
// Process configuration
// ---------------------------------------------------------------------------

/// Daemon-wide settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Root of the per-VM configuration directories.
    pub config_dir: PathBuf,
    /// Local TCP port the supervisor serves RPC on.
    pub server_port: u16,
    /// Client-side timeout for one RPC exchange.
    pub server_response_timeout: Duration,
    /// IPMI session inactivity timeout.
    pub session_timeout: Duration,
    /// Whether `show` returns passwords unredacted.
    pub show_passwords: bool,
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        ProcessConfig {
            config_dir: default_config_dir(),
            server_port: env_parse("VSBMC_SERVER_PORT", 50891),
            server_response_timeout: Duration::from_millis(env_parse(
                "VSBMC_SERVER_RESPONSE_TIMEOUT_MS",
                5000,
            )),
            session_timeout: Duration::from_secs(env_parse("VSBMC_SESSION_TIMEOUT_SECS", 30)),
            show_passwords: std::env::var("VSBMC_SHOW_PASSWORDS")
                .map(|v| parse_bool("VSBMC_SHOW_PASSWORDS", &v))
                .unwrap_or(false),
        }
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VSBMC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".vsbmc");
    }

    PathBuf::from("/tmp/vsbmc")
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring unparseable {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// BmcConfig
// ---------------------------------------------------------------------------

/// Configuration of one virtual BMC, persisted as
/// `<config_dir>/<vm_name>/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmcConfig {
    /// Name of the managed virtual machine; equals the directory name.
    pub vm_name: String,
    /// Preferred hypervisor lookup key when present.
    pub vm_uuid: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// UDP bind address.
    pub address: String,
    /// UDP bind port.
    pub port: u16,
    /// MAC address reported to vCenter in LAN-configuration replies.
    pub fakemac: String,
    pub viserver: Option<String>,
    pub viserver_username: Option<String>,
    pub viserver_password: Option<String>,
    /// Desired state: whether a listener should be running.
    pub active: bool,
}

impl BmcConfig {
    /// Load the config for `vm_name`, deriving the fake MAC when the file
    /// does not carry one. Missing file maps to [`Error::VmNotFound`].
    pub fn load(config_dir: &Path, vm_name: &str) -> Result<Self> {
        let path = config_dir.join(vm_name).join(CONFIG_FILE);
        if !path.exists() {
            return Err(Error::VmNotFound(vm_name.to_string()));
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed reading {}: {}", path.display(), e)))?;
        Self::parse(vm_name, &text)
    }

    /// Write the config file. The VM directory must already exist.
    pub fn store(&self, config_dir: &Path) -> Result<()> {
        let path = config_dir.join(&self.vm_name).join(CONFIG_FILE);
        fs::write(&path, self.to_ini())
            .map_err(|e| Error::Config(format!("failed writing {}: {}", path.display(), e)))
    }

    fn parse(vm_name: &str, text: &str) -> Result<Self> {
        let mut in_section = false;
        let mut cfg = BmcConfig {
            vm_name: vm_name.to_string(),
            vm_uuid: None,
            username: None,
            password: None,
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            fakemac: String::new(),
            viserver: None,
            viserver_username: None,
            viserver_password: None,
            active: false,
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = name == SECTION;
                continue;
            }
            if !in_section {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "malformed line in config for {}: {:?}",
                    vm_name, line
                )));
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "vm_name" => cfg.vm_name = value.to_string(),
                "vm_uuid" => cfg.vm_uuid = Some(value.to_string()),
                "username" => cfg.username = Some(value.to_string()),
                "password" => cfg.password = Some(value.to_string()),
                "address" => cfg.address = value.to_string(),
                "port" => {
                    cfg.port = value.parse().map_err(|_| {
                        Error::Config(format!("invalid port {:?} for {}", value, vm_name))
                    })?
                }
                "fakemac" => cfg.fakemac = value.to_string(),
                "viserver" => cfg.viserver = Some(value.to_string()),
                "viserver_username" => cfg.viserver_username = Some(value.to_string()),
                "viserver_password" => cfg.viserver_password = Some(value.to_string()),
                "active" => cfg.active = parse_bool("active", value),
                _ => {} // unknown keys ignored
            }
        }

        if cfg.fakemac.is_empty() {
            cfg.fakemac = generate_fakemac(vm_name);
        }

        Ok(cfg)
    }

    fn to_ini(&self) -> String {
        let mut out = format!("[{}]\n", SECTION);
        let mut push = |key: &str, value: &str| {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        };
        push("vm_name", &self.vm_name);
        if let Some(v) = &self.vm_uuid {
            push("vm_uuid", v);
        }
        if let Some(v) = &self.username {
            push("username", v);
        }
        if let Some(v) = &self.password {
            push("password", v);
        }
        push("address", &self.address);
        push("port", &self.port.to_string());
        push("fakemac", &self.fakemac);
        if let Some(v) = &self.viserver {
            push("viserver", v);
        }
        if let Some(v) = &self.viserver_username {
            push("viserver_username", v);
        }
        if let Some(v) = &self.viserver_password {
            push("viserver_password", v);
        }
        push("active", if self.active { "true" } else { "false" });
        out
    }

    /// Key/value rows for `show`, redacting any key containing
    /// `"password"` unless `show_passwords` is set. Rows are sorted by
    /// key.
    pub fn show_rows(&self, show_passwords: bool) -> Vec<(String, String)> {
        let mut rows: Vec<(String, String)> = vec![
            ("vm_name".into(), self.vm_name.clone()),
            ("address".into(), self.address.clone()),
            ("port".into(), self.port.to_string()),
            ("fakemac".into(), self.fakemac.clone()),
            ("active".into(), self.active.to_string()),
        ];
        for (key, value) in [
            ("vm_uuid", &self.vm_uuid),
            ("username", &self.username),
            ("password", &self.password),
            ("viserver", &self.viserver),
            ("viserver_username", &self.viserver_username),
            ("viserver_password", &self.viserver_password),
        ] {
            if let Some(value) = value {
                rows.push((key.into(), value.clone()));
            }
        }
        if !show_passwords {
            for (key, value) in rows.iter_mut() {
                if key.contains("password") {
                    *value = "***".to_string();
                }
            }
        }
        rows.sort();
        rows
    }
}

/// Case-insensitive `"true"`/`"false"`; anything else is false with a
/// warning.
pub fn parse_bool(key: &str, value: &str) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        other => {
            warn!("value {:?} for {} is not a boolean, assuming false", other, key);
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Fake MAC
// ---------------------------------------------------------------------------

/// Derive the fake MAC for a VM name: `02:00:00` (locally administered)
/// followed by the first three bytes of `MD5(vm_name)`.
pub fn generate_fakemac(vm_name: &str) -> String {
    let digest = md5::compute(vm_name.as_bytes());
    format!(
        "02:00:00:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}

/// Parse a MAC string into bytes, accepting `:` or `-` separators.
pub fn fakemac_bytes(mac: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut count = 0;
    for part in mac.split([':', '-']) {
        if count == 6 {
            return Err(Error::Config(format!("invalid MAC address {:?}", mac)));
        }
        out[count] = u8::from_str_radix(part, 16)
            .map_err(|_| Error::Config(format!("invalid MAC address {:?}", mac)))?;
        count += 1;
    }
    if count != 6 {
        return Err(Error::Config(format!("invalid MAC address {:?}", mac)));
    }
    Ok(out)
}

/// Canonical form: lowercase hex with `:` separators.
pub fn canonical_fakemac(mac: &str) -> Result<String> {
    let bytes = fakemac_bytes(mac)?;
    Ok(bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> BmcConfig {
        BmcConfig {
            vm_name: "node-01".into(),
            vm_uuid: Some("4207b7a1-0000-0000-0000-000000000001".into()),
            username: Some("admin".into()),
            password: Some("password".into()),
            address: "::".into(),
            port: 6230,
            fakemac: generate_fakemac("node-01"),
            viserver: Some("vcenter.example.com".into()),
            viserver_username: Some("administrator@vsphere.local".into()),
            viserver_password: Some("secret".into()),
            active: true,
        }
    }

    #[test]
    fn fakemac_is_derived_from_md5() {
        assert_eq!(generate_fakemac("node-01"), "02:00:00:a7:ac:40");

        // Pure function: same input, same output.
        assert_eq!(generate_fakemac("node-01"), generate_fakemac("node-01"));

        let bytes = fakemac_bytes(&generate_fakemac("node-02")).unwrap();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(bytes[2], 0x00);
    }

    #[test]
    fn fakemac_accepts_both_separators() {
        assert_eq!(
            fakemac_bytes("02:00:00:a7:ac:40").unwrap(),
            [0x02, 0x00, 0x00, 0xA7, 0xAC, 0x40]
        );
        assert_eq!(
            fakemac_bytes("02-00-00-A7-AC-40").unwrap(),
            [0x02, 0x00, 0x00, 0xA7, 0xAC, 0x40]
        );
        assert_eq!(
            canonical_fakemac("02-00-00-A7-AC-40").unwrap(),
            "02:00:00:a7:ac:40"
        );
        assert!(fakemac_bytes("02:00:00").is_err());
        assert!(fakemac_bytes("02:00:00:a7:ac:40:ff").is_err());
        assert!(fakemac_bytes("zz:00:00:a7:ac:40").is_err());
    }

    #[test]
    fn ini_round_trip_preserves_every_field() {
        let cfg = sample_config();
        let decoded = BmcConfig::parse("node-01", &cfg.to_ini()).unwrap();
        assert_eq!(decoded, cfg);
    }

    #[test]
    fn parse_applies_defaults() {
        let cfg = BmcConfig::parse("vm0", "[VirtualBMC]\nvm_name = vm0\n").unwrap();
        assert_eq!(cfg.address, "::");
        assert_eq!(cfg.port, 6230);
        assert_eq!(cfg.fakemac, generate_fakemac("vm0"));
        assert!(!cfg.active);
        assert!(cfg.username.is_none());
    }

    #[test]
    fn parse_ignores_unknown_keys_and_other_sections() {
        let text = "[other]\nport = 9999\n[VirtualBMC]\nport = 6231\nwhatever = 1\n";
        let cfg = BmcConfig::parse("vm0", text).unwrap();
        assert_eq!(cfg.port, 6231);
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(BmcConfig::parse("vm0", "[VirtualBMC]\nport = banana\n").is_err());
    }

    #[test]
    fn bool_parsing_is_case_insensitive() {
        assert!(parse_bool("active", "True"));
        assert!(parse_bool("active", "true"));
        assert!(!parse_bool("active", "False"));
        assert!(!parse_bool("active", "yes"));
    }

    #[test]
    fn show_rows_redact_passwords() {
        let cfg = sample_config();
        let rows = cfg.show_rows(false);
        for (key, value) in &rows {
            if key.contains("password") {
                assert_eq!(value, "***");
            }
        }

        let rows = cfg.show_rows(true);
        assert!(rows
            .iter()
            .any(|(k, v)| k == "viserver_password" && v == "secret"));

        // Total order on keys.
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
