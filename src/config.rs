use std::collections::HashSet;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VmError;
use crate::paths;
use crate::util::{parse_memory_mib, parse_size};

/// On-disk VM definition, one flat `key = value` file per VM.
///
/// Every field is optional at the parser level; a field missing from the
/// file takes its type default, and `VmRecord::from_config` decides which
/// of them are required.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct VmConfig {
    pub name: String,
    pub os_type: String,
    pub codename: String,
    pub image_url: String,
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub disk_size: String,
    pub memory: String,
    pub cpus: u32,
    pub ssh_port: u32,
    pub gui_mode: bool,
    /// `host:guest` pairs separated by commas, e.g. `"8080:80,9000:9090"`.
    pub port_forwards: String,
    pub img_file: String,
    pub seed_file: String,
    pub created: String,
}

/// One extra host-to-guest TCP forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

// ── VmRecord ──────────────────────────────────────────────

/// Validated, immutable VM record threaded through provisioning and launch.
#[derive(Debug, Clone)]
pub struct VmRecord {
    /// Storage key, equal to the config file stem.
    pub name: String,
    /// Path of the file the record was loaded from.
    pub conf_path: PathBuf,
    /// Raw parsed config.
    pub config: VmConfig,
    pub ssh_port: u16,
    /// Parsed `port_forwards`, in file order.
    pub port_forwards: Vec<PortForward>,
    /// Backing disk, resolved against the VM directory.
    pub img_file: PathBuf,
    /// Seed image, resolved against the VM directory.
    pub seed_file: PathBuf,
}

impl VmRecord {
    /// Validate a parsed config and resolve it into a record stored under `name` in `vm_dir`.
    pub fn from_config(config: VmConfig, name: &str, vm_dir: &Path) -> Result<Self, VmError> {
        validate_name(name)?;
        if !config.name.is_empty() && config.name != name {
            return Err(VmError::Validation {
                message: format!(
                    "name '{}' does not match its file name '{name}.{}'",
                    config.name,
                    paths::CONF_EXT
                ),
            });
        }

        validate_username(&config.username)?;
        if !config.hostname.is_empty() {
            validate_hostname(&config.hostname)?;
        }
        if config.password.is_empty() {
            return Err(VmError::Validation {
                message: "password must not be empty".into(),
            });
        }
        if config.cpus < 1 {
            return Err(VmError::Validation {
                message: "cpus must be at least 1".into(),
            });
        }
        if config.memory.trim().is_empty() {
            return Err(VmError::Validation {
                message: "memory is required".into(),
            });
        }
        parse_memory_mib(&config.memory).map_err(|e| VmError::Validation {
            message: format!("memory: {e}"),
        })?;
        if !config.disk_size.is_empty() {
            parse_size(&config.disk_size).map_err(|e| VmError::Validation {
                message: format!("disk_size: {e}"),
            })?;
        }

        let ssh_port = match u16::try_from(config.ssh_port) {
            Ok(port) if port >= 23 => port,
            _ => {
                return Err(VmError::Validation {
                    message: format!("ssh_port must be in 23..=65535 (got {})", config.ssh_port),
                });
            }
        };

        let port_forwards = parse_port_forwards(&config.port_forwards)?;
        let mut host_ports = HashSet::from([ssh_port]);
        for fwd in &port_forwards {
            if !host_ports.insert(fwd.host) {
                return Err(VmError::Validation {
                    message: format!("host port {} is forwarded more than once", fwd.host),
                });
            }
        }

        let img_file = resolve_artifact(&config.img_file, "img_file", vm_dir)?;
        let seed_file = resolve_artifact(&config.seed_file, "seed_file", vm_dir)?;
        if img_file == seed_file {
            return Err(VmError::Validation {
                message: "img_file and seed_file must be different files".into(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            conf_path: paths::conf_path(vm_dir, name),
            config,
            ssh_port,
            port_forwards,
            img_file,
            seed_file,
        })
    }

    /// Guest hostname, falling back to the VM name.
    pub fn hostname(&self) -> &str {
        if self.config.hostname.is_empty() {
            &self.name
        } else {
            &self.config.hostname
        }
    }

    /// Records without an `image_url` expect their disk image to be provisioned out-of-band.
    pub fn is_direct_launch(&self) -> bool {
        self.config.image_url.trim().is_empty()
    }
}

// ── ConfigStore ───────────────────────────────────────────

/// Directory of `<name>.conf` files.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of all stored configurations, sorted. A missing directory holds none.
    pub fn list(&self) -> Result<Vec<String>, VmError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(VmError::Io {
                    context: format!("reading VM directory {}", self.dir.display()),
                    source: e,
                });
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| p.extension().is_some_and(|ext| ext == paths::CONF_EXT))
            .filter_map(|p| p.file_stem()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Load and validate the record stored under `name`.
    pub fn load(&self, name: &str) -> Result<VmRecord, VmError> {
        validate_name(name)?;
        let path = paths::conf_path(&self.dir, name);
        if !path.is_file() {
            return Err(VmError::ConfigNotFound {
                name: name.to_string(),
                dir: self.dir.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| VmError::ConfigLoad {
            path: path.display().to_string(),
            source,
        })?;

        let config: VmConfig = facet_toml::from_str(&contents).map_err(|e| VmError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let record = VmRecord::from_config(config, name, &self.dir)?;
        tracing::debug!(name, path = %path.display(), "loaded VM config");
        Ok(record)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_name(name: &str) -> Result<(), VmError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(VmError::Validation {
            message: format!("VM name must match [A-Za-z0-9_-]+ (got '{name}')"),
        });
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), VmError> {
    let mut chars = username.chars();
    let valid = username.len() <= 32
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
        });
    if !valid {
        return Err(VmError::Validation {
            message: format!(
                "username must match [a-z_][a-z0-9_-]{{0,31}} (got '{username}')"
            ),
        });
    }
    Ok(())
}

/// RFC 1123 hostname: dot-separated labels of letters, digits and inner hyphens.
fn validate_hostname(hostname: &str) -> Result<(), VmError> {
    let label_ok = |label: &str| {
        (1..=63).contains(&label.len())
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    if hostname.len() > 253 || !hostname.split('.').all(label_ok) {
        return Err(VmError::Validation {
            message: format!(
                "hostname '{}' is not a valid RFC 1123 host name",
                hostname.escape_debug()
            ),
        });
    }
    Ok(())
}

fn resolve_artifact(value: &str, field: &str, vm_dir: &Path) -> Result<PathBuf, VmError> {
    if value.trim().is_empty() {
        return Err(VmError::Validation {
            message: format!("{field} is required"),
        });
    }
    let p = Path::new(value);
    Ok(if p.is_absolute() {
        p.to_path_buf()
    } else {
        vm_dir.join(p)
    })
}

/// Parse `"8080:80,9000:9090"` into ordered forwards. An empty string means none.
pub fn parse_port_forwards(s: &str) -> Result<Vec<PortForward>, VmError> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }

    s.split(',')
        .map(|entry| {
            let parts: Vec<&str> = entry.trim().split(':').collect();
            let [host, guest] = parts.as_slice() else {
                return Err(VmError::Validation {
                    message: format!("port_forwards entry '{entry}' must be host:guest"),
                });
            };
            Ok(PortForward {
                host: parse_port(host, entry)?,
                guest: parse_port(guest, entry)?,
            })
        })
        .collect()
}

fn parse_port(s: &str, entry: &str) -> Result<u16, VmError> {
    match s.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(VmError::Validation {
            message: format!("port_forwards entry '{entry}': invalid port '{s}'"),
        }),
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn web01_config() -> VmConfig {
        VmConfig {
            name: "web01".into(),
            os_type: "ubuntu".into(),
            codename: "noble".into(),
            image_url: String::new(),
            hostname: "web01".into(),
            username: "admin".into(),
            password: "hunter2".into(),
            disk_size: "20G".into(),
            memory: "2G".into(),
            cpus: 2,
            ssh_port: 2222,
            gui_mode: false,
            port_forwards: "8080:80,9000:9090".into(),
            img_file: "/srv/vms/web01.img".into(),
            seed_file: "/srv/vms/web01-seed.img".into(),
            created: "2024-05-01T12:00:00Z".into(),
        }
    }

    /// The `web01` record used across module tests.
    pub fn web01_record() -> VmRecord {
        VmRecord::from_config(web01_config(), "web01", Path::new("/srv/vms")).unwrap()
    }

    const WEB01_CONF: &str = r#"
name = "web01"
os_type = "ubuntu"
codename = "noble"
hostname = "web01"
username = "admin"
password = "hunter2"
disk_size = "20G"
memory = "2G"
cpus = 2
ssh_port = 2222
gui_mode = true
port_forwards = "8080:80,9000:9090"
img_file = "web01.img"
seed_file = "web01-seed.img"
created = "2024-05-01T12:00:00Z"
"#;

    const DB01_CONF: &str = r#"
username = "dba"
password = "s3cret"
memory = "4096M"
cpus = 4
ssh_port = 2223
img_file = "/data/db01.qcow2"
seed_file = "/data/db01-seed.img"
"#;

    fn store_with(files: &[(&str, &str)]) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }
        let store = ConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn parse_flat_record() {
        let config: VmConfig = facet_toml::from_str(WEB01_CONF).unwrap();
        assert_eq!(config.name, "web01");
        assert_eq!(config.cpus, 2);
        assert_eq!(config.ssh_port, 2222);
        assert!(config.gui_mode);
        assert_eq!(config.port_forwards, "8080:80,9000:9090");
        assert!(config.image_url.is_empty());
    }

    #[test]
    fn load_resolves_relative_artifacts_against_vm_dir() {
        let (dir, store) = store_with(&[("web01.conf", WEB01_CONF)]);
        let record = store.load("web01").unwrap();
        assert_eq!(record.img_file, dir.path().join("web01.img"));
        assert_eq!(record.seed_file, dir.path().join("web01-seed.img"));
        assert_eq!(record.conf_path, dir.path().join("web01.conf"));
        assert_eq!(
            record.port_forwards,
            vec![
                PortForward {
                    host: 8080,
                    guest: 80,
                },
                PortForward {
                    host: 9000,
                    guest: 9090,
                },
            ]
        );
    }

    #[test]
    fn loading_second_record_does_not_inherit_fields() {
        let (_dir, store) = store_with(&[("web01.conf", WEB01_CONF), ("db01.conf", DB01_CONF)]);

        let a = store.load("web01").unwrap();
        assert!(a.config.gui_mode);
        assert_eq!(a.port_forwards.len(), 2);

        let b = store.load("db01").unwrap();
        assert_eq!(b.name, "db01");
        assert!(!b.config.gui_mode);
        assert!(b.port_forwards.is_empty());
        assert!(b.config.codename.is_empty());
        assert!(b.config.disk_size.is_empty());
        assert_eq!(b.hostname(), "db01");
    }

    #[test]
    fn list_is_sorted_and_ignores_other_files() {
        let (dir, store) = store_with(&[
            ("web01.conf", WEB01_CONF),
            ("db01.conf", DB01_CONF),
            ("web01.lock", ""),
            ("notes.txt", "hello"),
        ]);
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["db01", "web01"]);
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let store = ConfigStore::new("/nonexistent/solovm/vms");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn load_missing_is_not_found() {
        let (_dir, store) = store_with(&[("web01.conf", WEB01_CONF)]);
        assert!(matches!(
            store.load("web02"),
            Err(VmError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn load_rejects_path_like_names() {
        let (_dir, store) = store_with(&[]);
        assert!(matches!(
            store.load("../etc/passwd"),
            Err(VmError::Validation { .. })
        ));
    }

    #[test]
    fn name_must_match_file_stem() {
        let (_dir, store) = store_with(&[("web02.conf", WEB01_CONF)]);
        assert!(matches!(
            store.load("web02"),
            Err(VmError::Validation { .. })
        ));
    }

    #[test]
    fn unparsable_file_is_parse_error() {
        let (_dir, store) = store_with(&[("web01.conf", "cpus = = 2\n")]);
        assert!(matches!(
            store.load("web01"),
            Err(VmError::ConfigParse { .. })
        ));
    }

    #[test]
    fn ssh_port_bounds() {
        for (port, ok) in [(22, false), (23, true), (65535, true), (65536, false), (0, false)] {
            let config = VmConfig {
                ssh_port: port,
                ..web01_config()
            };
            let result = VmRecord::from_config(config, "web01", Path::new("/srv/vms"));
            assert_eq!(result.is_ok(), ok, "ssh_port {port}");
        }
    }

    #[test]
    fn duplicate_host_ports_rejected() {
        let config = VmConfig {
            port_forwards: "2222:80".into(),
            ..web01_config()
        };
        assert!(
            VmRecord::from_config(config, "web01", Path::new("/srv/vms")).is_err()
        );

        let config = VmConfig {
            port_forwards: "8080:80,8080:81".into(),
            ..web01_config()
        };
        assert!(
            VmRecord::from_config(config, "web01", Path::new("/srv/vms")).is_err()
        );
    }

    #[test]
    fn required_fields_rejected_when_missing() {
        let cases = [
            VmConfig {
                username: String::new(),
                ..web01_config()
            },
            VmConfig {
                username: "Admin".into(),
                ..web01_config()
            },
            VmConfig {
                password: String::new(),
                ..web01_config()
            },
            VmConfig {
                cpus: 0,
                ..web01_config()
            },
            VmConfig {
                memory: String::new(),
                ..web01_config()
            },
            VmConfig {
                memory: "lots".into(),
                ..web01_config()
            },
            VmConfig {
                memory: "2GB".into(),
                ..web01_config()
            },
            VmConfig {
                disk_size: "20X".into(),
                ..web01_config()
            },
            VmConfig {
                img_file: String::new(),
                ..web01_config()
            },
            VmConfig {
                seed_file: "/srv/vms/web01.img".into(),
                ..web01_config()
            },
        ];
        for config in cases {
            assert!(
                VmRecord::from_config(config.clone(), "web01", Path::new("/srv/vms")).is_err(),
                "expected rejection of {config:?}"
            );
        }
    }

    #[test]
    fn port_forwards_parse_in_order() {
        assert_eq!(
            parse_port_forwards(" 8080:80 , 9000:9090").unwrap(),
            vec![
                PortForward {
                    host: 8080,
                    guest: 80,
                },
                PortForward {
                    host: 9000,
                    guest: 9090,
                },
            ]
        );
        assert!(parse_port_forwards("").unwrap().is_empty());
    }

    #[test]
    fn malformed_port_forwards_rejected() {
        for bad in ["8080", "8080:80:1", "8080:80,", "a:80", "8080:0", "70000:80"] {
            assert!(
                parse_port_forwards(bad).is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn valid_and_invalid_names() {
        for name in ["web01", "db_primary", "a-b-c", "VM1"] {
            validate_name(name).unwrap();
        }
        for name in ["", "web.01", "a/b", "hello world", "../x"] {
            assert!(
                validate_name(name).is_err(),
                "expected '{name}' to be rejected"
            );
        }
    }

    #[test]
    fn hostnames_follow_rfc1123() {
        for hostname in ["web01", "web-01.example.com", "a", "X1"] {
            let config = VmConfig {
                hostname: hostname.into(),
                ..web01_config()
            };
            VmRecord::from_config(config, "web01", Path::new("/srv/vms")).unwrap();
        }
        let long_label = "a".repeat(64);
        for hostname in [
            "web 01: evil\ninstance-id: x",
            "web#01",
            "-web01",
            "web01-",
            "web..01",
            "web_01",
            long_label.as_str(),
        ] {
            let config = VmConfig {
                hostname: hostname.into(),
                ..web01_config()
            };
            let err = VmRecord::from_config(config, "web01", Path::new("/srv/vms")).unwrap_err();
            assert!(
                matches!(err, VmError::Validation { .. }),
                "accepted {hostname:?}"
            );
        }
    }

    #[test]
    fn hostname_from_file_is_validated() {
        let conf = WEB01_CONF.replace("hostname = \"web01\"", "hostname = \"web01: evil\"");
        let (_dir, store) = store_with(&[("web01.conf", conf.as_str())]);
        assert!(matches!(
            store.load("web01"),
            Err(VmError::Validation { .. })
        ));
    }

    #[test]
    fn hostname_falls_back_to_name() {
        let config = VmConfig {
            hostname: String::new(),
            ..web01_config()
        };
        let record = VmRecord::from_config(config, "web01", Path::new("/srv/vms")).unwrap();
        assert_eq!(record.hostname(), "web01");
    }

    #[test]
    fn direct_launch_when_no_image_url() {
        assert!(web01_record().is_direct_launch());
        let config = VmConfig {
            image_url: "https://example.com/noble.img".into(),
            ..web01_config()
        };
        let record = VmRecord::from_config(config, "web01", Path::new("/srv/vms")).unwrap();
        assert!(!record.is_direct_launch());
    }
}
