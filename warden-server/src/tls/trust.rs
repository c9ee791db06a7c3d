//! Trust-store installation for the development root CA
//!
//! Copies the root into the OS anchor directory (or the macOS System keychain)
//! and rebuilds the system bundle, escalating with `sudo` only when the process
//! is unprivileged. NSS databases used by Firefox and Chromium are updated on a
//! best-effort basis.

use super::ca::{CaError, RootCa};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use x509_parser::pem::Pem;

const MACOS_SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Automatic trust installation is not supported on {0}")]
    Unsupported(&'static str),

    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error(transparent)]
    Ca(#[from] CaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    AlreadyTrusted,
    Installed,
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    fn failure_summary(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if !stderr.is_empty() {
            return stderr;
        }
        let stdout = String::from_utf8_lossy(&self.stdout).trim().to_string();
        if !stdout.is_empty() {
            return stdout;
        }
        "non-zero exit status".to_string()
    }
}

/// Runs external commands. Swapped out in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands with `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = std::process::Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Where the operating system keeps its trust anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemTrust {
    /// Linux: an anchor directory, the bundle it is compiled into and the
    /// command that rebuilds the bundle.
    Anchors {
        anchor_dir: PathBuf,
        bundle: PathBuf,
        refresh: Vec<String>,
    },
    /// macOS System keychain.
    Keychain,
    Unsupported,
}

struct LinuxLayout {
    anchor_dir: &'static str,
    bundle: &'static str,
    refresh: &'static [&'static str],
}

// Order matters: Arch ships /usr/local/share/ca-certificates too.
const LINUX_LAYOUTS: &[LinuxLayout] = &[
    LinuxLayout {
        anchor_dir: "etc/pki/ca-trust/source/anchors",
        bundle: "etc/pki/tls/certs/ca-bundle.crt",
        refresh: &["update-ca-trust", "extract"],
    },
    LinuxLayout {
        anchor_dir: "etc/ca-certificates/trust-source/anchors",
        bundle: "etc/ssl/certs/ca-certificates.crt",
        refresh: &["trust", "extract-compat"],
    },
    LinuxLayout {
        anchor_dir: "usr/share/pki/trust/anchors",
        bundle: "var/lib/ca-certificates/ca-bundle.pem",
        refresh: &["update-ca-certificates"],
    },
    LinuxLayout {
        anchor_dir: "usr/local/share/ca-certificates",
        bundle: "etc/ssl/certs/ca-certificates.crt",
        refresh: &["update-ca-certificates"],
    },
];

impl SystemTrust {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            return Self::Keychain;
        }
        if cfg!(target_os = "linux") {
            return Self::detect_in(Path::new("/"));
        }
        Self::Unsupported
    }

    /// Pick the first Linux layout whose anchor directory exists under `root`.
    pub fn detect_in(root: &Path) -> Self {
        LINUX_LAYOUTS
            .iter()
            .find(|layout| root.join(layout.anchor_dir).is_dir())
            .map(|layout| Self::Anchors {
                anchor_dir: root.join(layout.anchor_dir),
                bundle: root.join(layout.bundle),
                refresh: layout.refresh.iter().map(|s| s.to_string()).collect(),
            })
            .unwrap_or(Self::Unsupported)
    }
}

/// Installs the root CA into the system trust store and NSS databases.
pub struct TrustInstaller {
    system: SystemTrust,
    runner: Arc<dyn CommandRunner>,
    escalate: bool,
    nss_dbs: Vec<PathBuf>,
}

impl TrustInstaller {
    pub fn new(
        system: SystemTrust,
        runner: Arc<dyn CommandRunner>,
        escalate: bool,
        nss_dbs: Vec<PathBuf>,
    ) -> Self {
        Self {
            system,
            runner,
            escalate,
            nss_dbs,
        }
    }

    /// Installer for the running host.
    pub fn for_host() -> Self {
        let nss_dbs = dirs::home_dir()
            .map(|home| nss_databases(&home))
            .unwrap_or_default();
        Self::new(
            SystemTrust::detect(),
            Arc::new(SystemRunner),
            !is_root(),
            nss_dbs,
        )
    }

    /// Make sure `root` is trusted. A no-op when it already is.
    pub fn ensure_installed(&self, root: &RootCa) -> Result<TrustOutcome, TrustError> {
        let der = root.cert_der()?;
        let name = anchor_name(&der);

        if self.is_installed(root, &der, &name) {
            tracing::debug!(path = %root.cert_path.display(), "Root CA already trusted");
            return Ok(TrustOutcome::AlreadyTrusted);
        }

        let cert_path = root.cert_path.display().to_string();
        match &self.system {
            SystemTrust::Anchors {
                anchor_dir,
                refresh,
                ..
            } => {
                let dest = anchor_dir.join(format!("{name}.crt"));
                self.privileged("cp", &[cert_path.clone(), dest.display().to_string()])?;
                if let Some((program, args)) = refresh.split_first() {
                    self.privileged(program, args)?;
                }
                tracing::info!(anchor = %dest.display(), "Installed root CA into system trust store");
            }
            SystemTrust::Keychain => {
                self.privileged(
                    "security",
                    &[
                        "add-trusted-cert".to_string(),
                        "-d".to_string(),
                        "-r".to_string(),
                        "trustRoot".to_string(),
                        "-k".to_string(),
                        MACOS_SYSTEM_KEYCHAIN.to_string(),
                        cert_path.clone(),
                    ],
                )?;
                tracing::info!("Installed root CA into System keychain");
            }
            SystemTrust::Unsupported => {
                return Err(TrustError::Unsupported(std::env::consts::OS));
            }
        }

        self.install_nss(&cert_path, &name);
        Ok(TrustOutcome::Installed)
    }

    fn is_installed(&self, root: &RootCa, der: &[u8], name: &str) -> bool {
        match &self.system {
            SystemTrust::Anchors {
                anchor_dir, bundle, ..
            } => {
                let anchor = anchor_dir.join(format!("{name}.crt"));
                let anchored = std::fs::read(&anchor)
                    .is_ok_and(|contents| contents == root.cert_pem.as_bytes());
                anchored && bundle_contains(bundle, der)
            }
            SystemTrust::Keychain => self
                .runner
                .run(
                    "security",
                    &[
                        "verify-cert".to_string(),
                        "-c".to_string(),
                        root.cert_path.display().to_string(),
                    ],
                )
                .is_ok_and(|out| out.success),
            SystemTrust::Unsupported => false,
        }
    }

    fn privileged(&self, program: &str, args: &[String]) -> Result<CommandOutput, TrustError> {
        let (program, args) = if self.escalate {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(program.to_string());
            full.extend_from_slice(args);
            ("sudo", full)
        } else {
            (program, args.to_vec())
        };

        let command = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let output = self
            .runner
            .run(program, &args)
            .map_err(|source| TrustError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.success {
            return Err(TrustError::CommandFailed {
                detail: output.failure_summary(),
                command,
            });
        }
        Ok(output)
    }

    fn install_nss(&self, cert_path: &str, nickname: &str) {
        for db in &self.nss_dbs {
            let spec = nss_db_spec(db);

            // Drop any stale entry under the same nickname; absence is fine.
            let delete = self.runner.run(
                "certutil",
                &[
                    "-D".to_string(),
                    "-d".to_string(),
                    spec.clone(),
                    "-n".to_string(),
                    nickname.to_string(),
                ],
            );
            if let Err(e) = &delete
                && e.kind() == std::io::ErrorKind::NotFound
            {
                tracing::warn!("certutil not found, skipping NSS trust installation");
                return;
            }

            let add = self.runner.run(
                "certutil",
                &[
                    "-A".to_string(),
                    "-d".to_string(),
                    spec.clone(),
                    "-t".to_string(),
                    "C,,".to_string(),
                    "-n".to_string(),
                    nickname.to_string(),
                    "-i".to_string(),
                    cert_path.to_string(),
                ],
            );
            match add {
                Ok(out) if out.success => {
                    tracing::info!(db = %spec, "Installed root CA into NSS database");
                }
                Ok(out) => {
                    tracing::warn!(db = %spec, error = %out.failure_summary(), "Failed to add root CA to NSS database");
                }
                Err(e) => {
                    tracing::warn!(db = %spec, error = %e, "Failed to run certutil");
                }
            }
        }
    }
}

/// File stem and NSS nickname for a root, stable per certificate.
pub fn anchor_name(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    format!("warden_development_CA_{}", hex::encode(&digest[..8]))
}

fn bundle_contains(bundle: &Path, der: &[u8]) -> bool {
    let Ok(data) = std::fs::read(bundle) else {
        return false;
    };
    Pem::iter_from_buffer(&data)
        .flatten()
        .any(|pem| pem.label == "CERTIFICATE" && pem.contents == der)
}

/// NSS databases under a home directory: the shared Chromium/system db and
/// every Firefox profile.
pub fn nss_databases(home: &Path) -> Vec<PathBuf> {
    let mut dbs = Vec::new();

    let shared = home.join(".pki").join("nssdb");
    if is_nss_db(&shared) {
        dbs.push(shared);
    }

    let profile_roots = [
        home.join(".mozilla").join("firefox"),
        home.join("snap/firefox/common/.mozilla/firefox"),
        home.join("Library/Application Support/Firefox/Profiles"),
    ];
    for root in profile_roots {
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        let mut profiles: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_nss_db(path))
            .collect();
        profiles.sort();
        dbs.extend(profiles);
    }

    dbs
}

fn is_nss_db(dir: &Path) -> bool {
    dir.join("cert9.db").exists() || dir.join("cert8.db").exists()
}

fn nss_db_spec(dir: &Path) -> String {
    if dir.join("cert9.db").exists() {
        format!("sql:{}", dir.display())
    } else {
        format!("dbm:{}", dir.display())
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
