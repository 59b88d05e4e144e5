use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolves every on-disk location the daemon and CLI care about.
///
/// All consumers take a `Paths` value instead of recomputing locations from
/// the environment, so tests can point the whole stack at a tempdir.
#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    /// Construct from `$HOME`.
    pub fn new() -> Result<Self> {
        let home = env::var_os("HOME").context("HOME is not set")?;
        Ok(Self { home: home.into() })
    }

    /// Construct rooted at an explicit home directory.
    pub fn with_home<P: AsRef<Path>>(home: P) -> Self {
        Self {
            home: home.as_ref().to_owned(),
        }
    }

    /// The home directory everything is resolved under.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Directory holding every container's subdirectory.
    pub fn container_home(&self) -> PathBuf {
        self.home.join(".containers")
    }

    /// Per-container directory.
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.container_home().join(name)
    }

    /// Per-container `config.json`.
    pub fn container_config(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("config.json")
    }

    /// Per-container disk image.
    pub fn container_disk(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("hdd.qcow2")
    }

    /// Guest kernel, present unless the container predates manifests.
    pub fn container_kernel(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("vmlinuz")
    }

    /// Guest initrd, paired with [`Paths::container_kernel`].
    pub fn container_initrd(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("initrd.img")
    }

    /// Private half of the per-container key pair.
    pub fn container_id_rsa(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("id_rsa")
    }

    /// Public half of the per-container key pair.
    pub fn container_id_rsa_pub(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("id_rsa.pub")
    }

    /// Boot transcript, appended to across boot attempts.
    pub fn container_boot_log(&self, name: &str) -> PathBuf {
        self.container_dir(name).join("boot.log")
    }

    /// Index of downloadable archives, maintained by the repository client.
    pub fn repo_index_file(&self) -> PathBuf {
        self.container_home().join("repo.json")
    }

    /// Discovery record for the running daemon.
    pub fn daemon_info_file(&self) -> PathBuf {
        self.container_home().join("server.json")
    }

    /// Append-mode log file the daemon writes to.
    pub fn daemon_log_file(&self) -> PathBuf {
        self.container_home().join("server.log")
    }
}

/// Directory the `qemu-system-*` binaries live in.
pub fn qemu_bin() -> PathBuf {
    PathBuf::from("/usr/bin")
}

/// Whether this process runs from an installed bundle rather than a source
/// tree. Bundles ship a `scripts/` directory beside the executable.
pub fn frozen() -> bool {
    scripts_beside_exe().is_some()
}

/// Location of the helper scripts, bundle layout first.
pub fn scripts_dir() -> PathBuf {
    match scripts_beside_exe() {
        Some(dir) => dir,
        None => Path::new(env!("CARGO_MANIFEST_DIR")).join("scripts"),
    }
}

fn scripts_beside_exe() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let dir = exe.parent()?.join("scripts");
    dir.is_dir().then_some(dir)
}
