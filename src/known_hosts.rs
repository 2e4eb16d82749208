//! Backend host key acceptance
//!
//! `HostKeyPolicy` travels inside `ClientParams`; the downstream handshake calls
//! `check` when the backend presents its key. `KnownHostsStore` reads and appends
//! OpenSSH `known_hosts` files.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::SshError;

/// Outcome of a known_hosts lookup
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    /// No key of this type recorded for the host
    Unknown { fingerprint: String },
    /// Recorded key differs (possible MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// How the relay decides whether to trust a backend's host key
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Trust any key. Only for backends on a trusted network.
    AcceptAny,
    /// Trust keys whose SHA256 fingerprint is listed (with or without the `SHA256:` prefix)
    Fingerprints(Vec<String>),
    /// Check against a known_hosts store.
    /// Unknown hosts are rejected when `strict`, otherwise recorded and accepted.
    KnownHosts {
        store: Arc<KnownHostsStore>,
        strict: bool,
    },
}

impl HostKeyPolicy {
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        match self {
            HostKeyPolicy::AcceptAny => {
                debug!("Accepting host key for {}:{} without verification", host, port);
                Ok(())
            }
            HostKeyPolicy::Fingerprints(allowed) => {
                let actual = KnownHostsStore::fingerprint(key);
                let bare = actual.trim_start_matches("SHA256:");
                if allowed
                    .iter()
                    .any(|fp| fp.trim_start_matches("SHA256:") == bare)
                {
                    Ok(())
                } else {
                    warn!("Host key for {}:{} not in allow list ({})", host, port, actual);
                    Err(SshError::HostKeyRejected(format!(
                        "{}:{} presented {}, which is not allowed",
                        host, port, actual
                    )))
                }
            }
            HostKeyPolicy::KnownHosts { store, strict } => {
                match store.verify(host, port, key) {
                    HostKeyVerification::Verified => Ok(()),
                    HostKeyVerification::Unknown { fingerprint } if *strict => {
                        warn!(
                            "Unknown host key for {}:{} ({}), strict mode",
                            host, port, fingerprint
                        );
                        Err(SshError::HostKeyRejected(format!(
                            "unknown host {}:{} with fingerprint {}",
                            host, port, fingerprint
                        )))
                    }
                    HostKeyVerification::Unknown { fingerprint } => {
                        info!(
                            "New backend {}:{}, recording host key {}",
                            host, port, fingerprint
                        );
                        if let Err(e) = store.add_host(host, port, key) {
                            warn!("Failed to save host key: {}", e);
                        }
                        Ok(())
                    }
                    HostKeyVerification::Changed {
                        expected_fingerprint,
                        actual_fingerprint,
                    } => {
                        warn!(
                            "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                            host, port, expected_fingerprint, actual_fingerprint
                        );
                        Err(SshError::HostKeyRejected(format!(
                            "key for {}:{} changed: expected {}, got {}",
                            host, port, expected_fingerprint, actual_fingerprint
                        )))
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a known_hosts file, appended to as hosts are learned
#[derive(Debug)]
pub struct KnownHostsStore {
    /// lookup key -> keys (one host may carry several key types)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Store backed by `~/.ssh/known_hosts`
    pub fn user_default() -> Result<Self, SshError> {
        let home = dirs::home_dir()
            .ok_or_else(|| SshError::Config("cannot locate home directory".to_string()))?;
        Self::open(home.join(".ssh").join("known_hosts"))
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let path = path.into();
        let hosts = if path.exists() {
            Self::parse_file(&path)?
        } else {
            debug!("known_hosts {} does not exist yet", path.display());
            HashMap::new()
        };

        Ok(Self {
            hosts: RwLock::new(hosts),
            path,
        })
    }

    fn parse_file(path: &Path) -> Result<HashMap<String, Vec<HostKeyEntry>>, SshError> {
        let reader = BufReader::new(fs::File::open(path)?);
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();
        let mut count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostnames keytype base64key [comment]
            let mut fields = line.split_whitespace();
            let (Some(names), Some(key_type), Some(key_data)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            let entry = HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            };
            // Hashed names (|1|salt|hash) cannot be matched by lookup key
            for name in names.split(',').filter(|n| !n.starts_with('|')) {
                hosts
                    .entry(Self::normalize_hostname(name))
                    .or_default()
                    .push(entry.clone());
                count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} hosts) from {}",
            count,
            hosts.len(),
            path.display()
        );
        Ok(hosts)
    }

    /// `[Host]:2222` -> `[host]:2222`, `Host` / `[Host]:22` -> `host`
    fn normalize_hostname(name: &str) -> String {
        if let Some(rest) = name.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::make_key(host, port);
                }
            }
            return rest.trim_end_matches(']').to_lowercase();
        }
        name.to_lowercase()
    }

    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// OpenSSH-style `SHA256:<unpadded base64>` fingerprint
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(blob: &[u8]) -> String {
        let hash = Sha256::digest(blob);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries.iter().filter(|e| e.key_type == actual_type) {
            if entry.key_data == actual_b64 {
                debug!("Host key verified for {} ({})", lookup_key, actual_type);
                return HostKeyVerification::Verified;
            }
        }

        // Same type, different key
        if let Some(entry) = entries.iter().find(|e| e.key_type == actual_type) {
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|blob| Self::fingerprint_bytes(&blob))
                .unwrap_or_else(|_| "unknown".to_string());
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        debug!(
            "Host {} known but no {} key stored, treating as new",
            lookup_key, actual_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Record a key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let entry = HostKeyEntry {
            key_type: key.algorithm().as_str().to_string(),
            key_data: BASE64.encode(key.public_key_bytes()),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, entry.key_type, entry.key_data)?;

        info!("Added host key for {} ({})", lookup_key, entry.key_type);
        self.hosts.write().entry(lookup_key).or_default().push(entry);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GITHUB_ED25519: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    fn github_key() -> PublicKey {
        PublicKey::from_openssh(GITHUB_ED25519).unwrap()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(KnownHostsStore::normalize_hostname("GitHub.com"), "github.com");
        assert_eq!(KnownHostsStore::normalize_hostname("[github.com]:22"), "github.com");
        assert_eq!(
            KnownHostsStore::normalize_hostname("[backend.example.com]:2222"),
            "[backend.example.com]:2222"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(KnownHostsStore::make_key("Server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = KnownHostsStore::fingerprint(&github_key());
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_verify_known_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            format!("# comment\n\ngithub.com,|1|abc|def {} github\n", GITHUB_ED25519),
        )
        .unwrap();

        let store = KnownHostsStore::open(&path).unwrap();
        assert_eq!(
            store.verify("github.com", 22, &github_key()),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("github.com", 2222, &github_key()),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_verify_changed_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let other = BASE64.encode(b"some other key blob");
        std::fs::write(&path, format!("[bastion]:2022 ssh-ed25519 {}\n", other)).unwrap();

        let store = KnownHostsStore::open(&path).unwrap();
        match store.verify("bastion", 2022, &github_key()) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_ne!(expected_fingerprint, actual_fingerprint);
                assert_eq!(actual_fingerprint, KnownHostsStore::fingerprint(&github_key()));
            }
            other => panic!("expected Changed, got {:?}", other),
        }

        let policy = HostKeyPolicy::KnownHosts {
            store: Arc::new(store),
            strict: false,
        };
        assert!(matches!(
            policy.check("bastion", 2022, &github_key()),
            Err(SshError::HostKeyRejected(_))
        ));
    }

    #[test]
    fn test_add_host_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");

        let store = KnownHostsStore::open(&path).unwrap();
        store.add_host("backend", 2200, &github_key()).unwrap();
        assert_eq!(
            store.verify("backend", 2200, &github_key()),
            HostKeyVerification::Verified
        );

        let reloaded = KnownHostsStore::open(&path).unwrap();
        assert_eq!(
            reloaded.verify("backend", 2200, &github_key()),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_policy_strict_rejects_unknown() {
        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::open(dir.path().join("known_hosts")).unwrap());

        let strict = HostKeyPolicy::KnownHosts {
            store: store.clone(),
            strict: true,
        };
        assert!(strict.check("backend", 22, &github_key()).is_err());

        let lenient = HostKeyPolicy::KnownHosts {
            store: store.clone(),
            strict: false,
        };
        assert!(lenient.check("backend", 22, &github_key()).is_ok());
        // Recorded by the lenient check
        assert!(strict.check("backend", 22, &github_key()).is_ok());
    }

    #[test]
    fn test_policy_fingerprints() {
        let fp = KnownHostsStore::fingerprint(&github_key());
        let bare = fp.trim_start_matches("SHA256:").to_string();

        assert!(HostKeyPolicy::Fingerprints(vec![fp])
            .check("github.com", 22, &github_key())
            .is_ok());
        assert!(HostKeyPolicy::Fingerprints(vec![bare])
            .check("github.com", 22, &github_key())
            .is_ok());
        assert!(HostKeyPolicy::Fingerprints(vec!["SHA256:nope".to_string()])
            .check("github.com", 22, &github_key())
            .is_err());
        assert!(HostKeyPolicy::AcceptAny.check("github.com", 22, &github_key()).is_ok());
    }
}
