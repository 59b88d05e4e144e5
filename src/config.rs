use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;
use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Highest manifest version this build understands.
pub const MANIFEST_VERSION: u64 = 1;

/// The exact pre-manifest config shape that is still accepted. Anything else
/// without a `manifest` field is rejected.
const LEGACY_CONFIG: &str =
    r#"{"arch":"x86_64","arguments":{"m":"500M","drive":"file=hdd.qcow2,format=qcow2"}}"#;

/// Guest architectures a container may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Aarch64,
    /// 32-bit little-endian MIPS.
    Mipsel,
}

impl Arch {
    /// All supported architectures.
    pub const ALL: &'static [Arch] = &[Arch::X86_64, Arch::Aarch64, Arch::Mipsel];

    /// The architecture's name as it appears in configs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Mipsel => "mipsel",
        }
    }

    /// Name of the matching system emulator binary.
    pub fn qemu_binary(&self) -> String {
        format!("qemu-system-{}", self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arch::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debian releases the image builder knows how to bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Debian 10.
    Buster,
    /// Debian 11.
    Bullseye,
    /// Debian 12.
    Bookworm,
}

impl Release {
    /// All supported releases.
    pub const ALL: &'static [Release] = &[Release::Buster, Release::Bullseye, Release::Bookworm];

    /// The release codename as it appears in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Release::Buster => "buster",
            Release::Bullseye => "bullseye",
            Release::Bookworm => "bookworm",
        }
    }
}

impl FromStr for Release {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Release::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or(())
    }
}

/// Errors produced while reading or validating a config or manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One message per field that failed validation.
    #[error("invalid config:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
    /// One message per manifest field that failed validation.
    #[error("invalid manifest:\n{}", .0.join("\n"))]
    InvalidManifest(Vec<String>),
    /// An unversioned config that is not the recognized historical shape.
    #[error("unsupported legacy config")]
    UnsupportedLegacy,
    /// Config file could not be read or written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Config file is not JSON at all.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Validated, runtime-sufficient description of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Guest architecture.
    pub arch: Arch,
    /// Number of guest CPUs.
    pub smp: u64,
    /// Guest memory in MiB.
    pub memory: u64,
    /// Upper bound on the disk image, in GiB.
    pub hddmaxsize: u64,
    /// Guest hostname, also the login-prompt anchor.
    pub hostname: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// `(guest_port, host_port)` forwards besides the implicit SSH pair.
    pub portfwd: Vec<(u16, u16)>,
    /// Pre-manifest era container without a shipped kernel/initrd.
    pub legacy: bool,
}

/// Is `name` acceptable as a container name?
pub fn valid_container_name(name: &str) -> bool {
    // The pattern is a literal so compilation cannot fail
    let re = Regex::new(r"^[A-Za-z0-9_]+$").unwrap();
    re.is_match(name)
}

fn valid_hostname(name: &str) -> bool {
    let re = Regex::new(r"^[A-Za-z][A-Za-z0-9]{2,}$").unwrap();
    re.is_match(name)
}

/// Validate `portfwd`, appending one message per problem found.
fn check_portfwd(value: &Value, errors: &mut Vec<String>) -> Vec<(u16, u16)> {
    let list = match value.as_array() {
        Some(l) => l,
        None => {
            errors.push("'portfwd' must be an array".to_string());
            return Vec::new();
        }
    };

    let mut pairs = Vec::new();
    let mut vtaken = vec![22u16];
    let mut htaken = vec![22u16];
    for entry in list {
        let pair = entry.as_array().filter(|p| p.len() == 2).and_then(|p| {
            let v = p[0].as_u64()?;
            let h = p[1].as_u64()?;
            Some((v, h))
        });
        let (vport, hport) = match pair {
            Some(p) => p,
            None => {
                errors.push("the 'portfwd' argument is malformed".to_string());
                continue;
            }
        };

        let mut ok = true;
        for (port, taken, what) in [
            (vport, &mut vtaken, "guest"),
            (hport, &mut htaken, "host"),
        ] {
            if port == 0 || port > u64::from(u16::MAX) || port == 22 {
                errors.push(format!("invalid {what} port '{port}'"));
                ok = false;
            } else if taken.contains(&(port as u16)) {
                errors.push(format!("{what} port {port} used more than once"));
                ok = false;
            } else {
                taken.push(port as u16);
            }
        }
        if ok {
            pairs.push((vport as u16, hport as u16));
        }
    }
    pairs
}

fn get_size(map: &Map<String, Value>, key: &str, errors: &mut Vec<String>) -> Option<u64> {
    match map.get(key) {
        None => {
            errors.push(format!("'{key}' is not an optional field"));
            None
        }
        Some(v) => match v.as_u64().filter(|&n| n > 0) {
            Some(n) => Some(n),
            None => {
                errors.push(format!("'{key}' must be a positive integer"));
                None
            }
        },
    }
}

impl ContainerConfig {
    /// Parse and validate a config, accumulating every error before failing.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let upgraded;
        let map = match value.get("manifest") {
            None => {
                upgraded = convert_legacy(value)?;
                upgraded.as_object().unwrap()
            }
            Some(version) => {
                match version.as_u64() {
                    Some(v) if v <= MANIFEST_VERSION => (),
                    _ => {
                        return Err(ConfigError::Invalid(vec![format!(
                            "unknown manifest version {version}"
                        )]))
                    }
                }
                value
                    .as_object()
                    .ok_or_else(|| ConfigError::Invalid(vec!["config must be an object".into()]))?
            }
        };

        let mut errors = Vec::new();

        let arch = match map.get("arch").and_then(Value::as_str) {
            None => {
                errors.push("'arch' is not an optional field".to_string());
                None
            }
            Some(s) => match s.parse::<Arch>() {
                Ok(a) => Some(a),
                Err(()) => {
                    errors.push(format!("'{s}' is not a valid architecture"));
                    None
                }
            },
        };

        let smp = match map.get("smp") {
            None => 4,
            Some(v) => match v.as_u64().filter(|&n| n > 0) {
                Some(n) => n,
                None => {
                    errors.push("'smp' must be a positive integer".to_string());
                    4
                }
            },
        };

        let hostname = match map.get("hostname") {
            None => "debian".to_string(),
            Some(v) => match v.as_str() {
                Some(s) if valid_hostname(s) => s.to_string(),
                Some(s) => {
                    errors.push(format!("invalid hostname '{s}'"));
                    String::new()
                }
                None => {
                    errors.push("'hostname' must be a string".to_string());
                    String::new()
                }
            },
        };

        let memory = get_size(map, "memory", &mut errors);
        let hddmaxsize = get_size(map, "hddmaxsize", &mut errors);

        let portfwd = match map.get("portfwd") {
            None => Vec::new(),
            Some(v) => check_portfwd(v, &mut errors),
        };

        let username = match map.get("username") {
            None => "root".to_string(),
            Some(v) => match v.as_str() {
                Some(s) => s.to_string(),
                None => {
                    errors.push("'username' must be a string".to_string());
                    String::new()
                }
            },
        };

        let password = match map.get("password").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => {
                errors.push("'password' is not an optional field".to_string());
                String::new()
            }
        };

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(Self {
            arch: arch.unwrap(),
            smp,
            memory: memory.unwrap(),
            hddmaxsize: hddmaxsize.unwrap(),
            hostname,
            username,
            password,
            portfwd,
            legacy: map.get("legacy").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)?;
        Self::from_value(&value)
    }

    /// The JSON shape written to `config.json`.
    ///
    /// `to_value` then [`ContainerConfig::from_value`] round-trips exactly.
    pub fn to_value(&self) -> Value {
        json!({
            "manifest": MANIFEST_VERSION,
            "arch": self.arch.as_str(),
            "smp": self.smp,
            "memory": self.memory,
            "hddmaxsize": self.hddmaxsize,
            "hostname": self.hostname,
            "portfwd": self.portfwd.iter().map(|&(v, h)| json!([v, h])).collect::<Vec<_>>(),
            "username": self.username,
            "password": self.password,
            "legacy": self.legacy,
        })
    }

    /// Write the config to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(&self.to_value())?;
        fs::write(path, raw)?;
        Ok(())
    }
}

/// Upgrade the one recognized pre-manifest config to its fixed modern shape.
fn convert_legacy(value: &Value) -> Result<Value, ConfigError> {
    let legacy: Value = serde_json::from_str(LEGACY_CONFIG).unwrap();
    if *value != legacy {
        return Err(ConfigError::UnsupportedLegacy);
    }
    Ok(json!({
        "manifest": 0,
        "arch": "x86_64",
        "smp": 4,
        "memory": 500,
        "hddmaxsize": 25,
        "hostname": "debian",
        "portfwd": [],
        "username": "root",
        "password": "root",
        "legacy": true,
    }))
}

/// A build-time manifest: the runtime config plus the fields only the image
/// builder reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerManifest {
    /// The runtime subset.
    pub config: ContainerConfig,
    /// Extra apt packages installed into the image.
    pub aptpkgs: Vec<String>,
    /// Provisioning scripts, in execution order.
    pub scriptorder: Vec<String>,
    /// Debian release the image is bootstrapped from.
    pub release: Release,
}

impl ContainerManifest {
    /// Parse and validate a manifest, accumulating every error.
    ///
    /// A manifest without a password gets a random one so freshly built
    /// images never ship a well-known credential.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let mut patched = value.clone();
        if value.get("password").is_none() {
            if let Some(map) = patched.as_object_mut() {
                map.insert("password".to_string(), json!(random_password()));
            }
        }

        let mut errors = Vec::new();
        let config = match ContainerConfig::from_value(&patched) {
            Ok(c) => Some(c),
            Err(ConfigError::Invalid(mut msgs)) => {
                errors.append(&mut msgs);
                None
            }
            Err(other) => return Err(other),
        };

        let aptpkgs = match value.get("aptpkgs") {
            None => Vec::new(),
            // A bare string is a single package; a list is taken as-is.
            Some(Value::String(s)) if valid_package_name(s) => vec![s.clone()],
            Some(Value::String(s)) => {
                errors.push(format!("invalid package name '{s}'"));
                Vec::new()
            }
            Some(Value::Array(list)) => {
                let mut pkgs = Vec::new();
                for entry in list {
                    match entry.as_str().filter(|s| valid_package_name(s)) {
                        Some(s) => pkgs.push(s.to_string()),
                        None => errors.push(format!("invalid package name '{entry}'")),
                    }
                }
                pkgs
            }
            Some(_) => {
                errors.push("'aptpkgs' must be a string or a list".to_string());
                Vec::new()
            }
        };

        let scriptorder = match value.get("scriptorder") {
            None => Vec::new(),
            Some(Value::Array(list)) => {
                let mut order = Vec::new();
                for entry in list {
                    match entry.as_str() {
                        Some(s) => order.push(s.to_string()),
                        None => errors.push(format!("invalid file name '{entry}'")),
                    }
                }
                order
            }
            Some(_) => {
                errors.push("'scriptorder' must be an array".to_string());
                Vec::new()
            }
        };

        let release = match value.get("release") {
            None => Release::Bullseye,
            Some(v) => match v.as_str().and_then(|s| s.parse::<Release>().ok()) {
                Some(r) => r,
                None => {
                    errors.push(format!("'{v}' is not a supported release"));
                    Release::Bullseye
                }
            },
        };

        if !errors.is_empty() {
            return Err(ConfigError::InvalidManifest(errors));
        }

        Ok(Self {
            config: config.unwrap(),
            aptpkgs,
            scriptorder,
            release,
        })
    }

    /// The JSON shape of the manifest.
    pub fn to_value(&self) -> Value {
        let mut value = self.config.to_value();
        let map = value.as_object_mut().unwrap();
        map.insert("aptpkgs".to_string(), json!(self.aptpkgs));
        map.insert("scriptorder".to_string(), json!(self.scriptorder));
        map.insert("release".to_string(), json!(self.release.as_str()));
        value
    }
}

fn valid_package_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9+.\-]*$").unwrap();
    re.is_match(name)
}

fn random_password() -> String {
    let mut rng = rand::thread_rng();
    (0..30).map(|_| rng.gen_range('A'..='Z')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn demo_config() -> Value {
        json!({
            "manifest": 1,
            "arch": "x86_64",
            "memory": 1024,
            "hddmaxsize": 25,
            "password": "hunter2",
        })
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = ContainerConfig::from_value(&demo_config()).unwrap();
        assert_eq!(config.arch, Arch::X86_64);
        assert_eq!(config.smp, 4);
        assert_eq!(config.hostname, "debian");
        assert_eq!(config.username, "root");
        assert!(config.portfwd.is_empty());
        assert!(!config.legacy);
    }

    #[test]
    fn test_to_value_round_trip_is_fixed_point() {
        let mut value = demo_config();
        value["portfwd"] = json!([[8080, 18080], [443, 10443]]);
        value["smp"] = json!(2);
        let config = ContainerConfig::from_value(&value).unwrap();
        let emitted = config.to_value();
        let reparsed = ContainerConfig::from_value(&emitted).unwrap();
        assert_eq!(config, reparsed);
        assert_eq!(emitted, reparsed.to_value());
    }

    #[test]
    fn test_errors_accumulate() {
        let value = json!({
            "manifest": 1,
            "arch": "sparc",
            "hostname": "x",
            "portfwd": [[22, 8080]],
        });
        let err = ContainerConfig::from_value(&value).unwrap_err();
        match err {
            ConfigError::Invalid(msgs) => {
                // arch, hostname, port 22, memory, hddmaxsize, password
                assert!(msgs.len() >= 5, "got: {msgs:?}");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[rstest]
    #[case(json!([[22, 8080]]))]
    #[case(json!([[8080, 22]]))]
    #[case(json!([[0, 8080]]))]
    #[case(json!([[8080, 70000]]))]
    #[case(json!([[8080, 9090], [8080, 9091]]))]
    #[case(json!([[8080, 9090], [8081, 9090]]))]
    #[case(json!([8080]))]
    fn test_rejected_portfwd(#[case] portfwd: Value) {
        let mut value = demo_config();
        value["portfwd"] = portfwd;
        assert!(ContainerConfig::from_value(&value).is_err());
    }

    #[test]
    fn test_accepted_portfwd_keeps_order() {
        let mut value = demo_config();
        value["portfwd"] = json!([[8080, 18080], [21, 10021]]);
        let config = ContainerConfig::from_value(&value).unwrap();
        assert_eq!(config.portfwd, vec![(8080, 18080), (21, 10021)]);
    }

    #[test]
    fn test_legacy_literal_upgrades() {
        let value: Value = serde_json::from_str(LEGACY_CONFIG).unwrap();
        let config = ContainerConfig::from_value(&value).unwrap();
        assert!(config.legacy);
        assert_eq!(config.memory, 500);
        assert_eq!(config.hddmaxsize, 25);
        assert_eq!(config.password, "root");
    }

    #[test]
    fn test_other_unversioned_config_rejected() {
        let value = json!({
            "arch": "x86_64",
            "arguments": {"m": "512M", "drive": "file=hdd.qcow2,format=qcow2"},
        });
        match ContainerConfig::from_value(&value) {
            Err(ConfigError::UnsupportedLegacy) => (),
            other => panic!("expected UnsupportedLegacy, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_manifest_version_rejected() {
        let mut value = demo_config();
        value["manifest"] = json!(99);
        assert!(ContainerConfig::from_value(&value).is_err());
    }

    #[test]
    fn test_manifest_fills_random_password() {
        let value = json!({
            "manifest": 1,
            "arch": "x86_64",
            "memory": 512,
            "hddmaxsize": 10,
            "release": "bookworm",
            "aptpkgs": "gcc",
        });
        let manifest = ContainerManifest::from_value(&value).unwrap();
        assert_eq!(manifest.config.password.len(), 30);
        assert_eq!(manifest.aptpkgs, vec!["gcc".to_string()]);
        assert_eq!(manifest.release, Release::Bookworm);
    }

    #[test]
    fn test_manifest_rejects_bad_packages() {
        let value = json!({
            "manifest": 1,
            "arch": "x86_64",
            "memory": 512,
            "hddmaxsize": 10,
            "aptpkgs": ["ok-pkg", "not ok"],
        });
        assert!(ContainerManifest::from_value(&value).is_err());
    }

    #[rstest]
    #[case("demo", true)]
    #[case("demo_2", true)]
    #[case("", false)]
    #[case("de mo", false)]
    #[case("de/mo", false)]
    #[case("..", false)]
    fn test_container_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(valid_container_name(name), ok);
    }
}
