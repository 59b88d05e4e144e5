use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, info, warn};
use sysinfo::System;
use thiserror::Error;

use crate::config::{Arch, ConfigError, ContainerConfig};
use crate::console::{classify, Console};
use crate::paths::{self, Paths};
use crate::ports::{self, NoPortAvailable};
use crate::ssh::{Exec, SshError, SshSession, TransferError};

pub use crate::console::BootFailure;

/// How long one boot attempt may take to reach the login prompt.
const BOOT_TIMEOUT: Duration = Duration::from_secs(360);
/// How long each later step of the login conversation may take.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Boot attempts before a port collision is treated as fatal.
const MAX_BOOT_RETRIES: u32 = 25;

/// Per-arch pieces of the QEMU command line.
struct ArchTemplate {
    machine: &'static [&'static str],
    console: &'static str,
    root: &'static str,
}

const X86_64_TEMPLATE: ArchTemplate = ArchTemplate {
    machine: &[],
    console: "ttyS0",
    root: "/dev/sda1",
};
const AARCH64_TEMPLATE: ArchTemplate = ArchTemplate {
    machine: &["-machine", "virt", "-cpu", "cortex-a72"],
    console: "ttyAMA0",
    root: "/dev/vda1",
};
const MIPSEL_TEMPLATE: ArchTemplate = ArchTemplate {
    machine: &["-machine", "malta"],
    console: "ttyS0",
    root: "/dev/sda1",
};

fn template(arch: Arch) -> &'static ArchTemplate {
    match arch {
        Arch::X86_64 => &X86_64_TEMPLATE,
        Arch::Aarch64 => &AARCH64_TEMPLATE,
        Arch::Mipsel => &MIPSEL_TEMPLATE,
    }
}

/// Anything that can go wrong while operating one container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container has no directory or config on disk.
    #[error("container '{0}' is not installed")]
    NotInstalled(String),
    /// The boot never reached a usable login.
    #[error(transparent)]
    Boot(#[from] BootFailure),
    /// The on-disk config did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The SSH layer failed.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// No host port could be allocated for forwarding.
    #[error(transparent)]
    Ports(#[from] NoPortAvailable),
    /// Host-side I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One live QEMU-backed container owned by the daemon.
pub struct Container {
    name: String,
    config: ContainerConfig,
    ssh_port: u16,
    qemu: Mutex<Child>,
    ssh: SshSession,
}

impl Container {
    /// Boot the named container from cold to authenticated-and-ready.
    ///
    /// Drives the whole handshake: port allocation, QEMU spawn, login
    /// conversation on the serial console, SSH session, host-key rotation.
    /// Host-port collisions retry with a fresh port up to the budget.
    pub fn start(name: &str, paths: &Paths) -> Result<Self, ContainerError> {
        let dir = paths.container_dir(name);
        let config_path = paths.container_config(name);
        if !dir.is_dir() || !config_path.is_file() {
            return Err(ContainerError::NotInstalled(name.to_string()));
        }
        let config = ContainerConfig::load(&config_path)?;
        let (mem_cap, smp_cap) = host_caps();
        let boot_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.container_boot_log(name))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let ssh_port = ports::allocate_container_port()?;
            let log = boot_log.try_clone()?;

            let mut cmd = qemu_command(&config, &dir, ssh_port, mem_cap, smp_cap);
            debug!(
                "qemu invocation: {} {}",
                cmd.get_program().to_string_lossy(),
                cmd.get_args().map(|a| a.to_string_lossy()).join(" ")
            );

            let mut child = cmd.spawn()?;
            let mut console = Console::attach(&mut child, log)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

            match login(&mut console, &config) {
                Ok(()) => {
                    info!("container '{name}' reached its shell prompt");
                    match open_session(name, &config, ssh_port, paths) {
                        Ok(ssh) => {
                            console.into_logger();
                            return Ok(Self {
                                name: name.to_string(),
                                config,
                                ssh_port,
                                qemu: Mutex::new(child),
                                ssh,
                            });
                        }
                        Err(e) => {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(e);
                        }
                    }
                }
                Err(expect_err) => {
                    debug!("boot attempt {attempt} for '{name}' failed: {expect_err}");
                    let _ = child.kill();
                    let _ = child.wait();
                    console.drain();
                    match classify(console.transcript()) {
                        BootFailure::PortCollision if attempt < MAX_BOOT_RETRIES => {
                            info!("port {ssh_port} was taken, retrying boot of '{name}'");
                            continue;
                        }
                        BootFailure::PortCollision => {
                            return Err(BootFailure::AddressInUse.into());
                        }
                        other => return Err(other.into()),
                    }
                }
            }
        }
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host port forwarded to the guest's sshd.
    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    /// Login user.
    pub fn username(&self) -> &str {
        &self.config.username
    }

    /// Login password.
    pub fn password(&self) -> &str {
        &self.config.password
    }

    /// The authenticated session driving this guest.
    pub fn session(&self) -> &SshSession {
        &self.ssh
    }

    /// Start `argv` in the guest; the caller owns the returned channel.
    pub fn run(&self, argv: &[String]) -> Result<Exec, SshError> {
        self.ssh.exec(argv)
    }

    /// Copy a host file into the guest.
    pub fn put(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        self.ssh.put(local, remote)
    }

    /// Copy a guest file onto the host.
    pub fn get(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        self.ssh.get(remote, local)
    }

    /// Graceful shutdown via guest `poweroff`.
    ///
    /// Any failure here leaves the QEMU process behind; the caller is
    /// expected to escalate to [`Container::kill`].
    pub fn stop(&self) -> Result<(), ContainerError> {
        let mut qemu = self.qemu.lock().unwrap();
        self.ssh.poweroff(&mut qemu)?;
        Ok(())
    }

    /// Hard-terminate the QEMU process.
    pub fn kill(&self) {
        let mut qemu = self.qemu.lock().unwrap();
        if let Err(e) = qemu.kill() {
            debug!("kill of '{}' returned {e}", self.name);
        }
        let _ = qemu.wait();
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        // Never leave a QEMU process behind, whatever path dropped us.
        if let Ok(mut qemu) = self.qemu.lock() {
            if matches!(qemu.try_wait(), Ok(None)) {
                warn!("container '{}' dropped while running, killing", self.name);
                let _ = qemu.kill();
                let _ = qemu.wait();
            }
        }
    }
}

/// Drive the serial console from power-on to an authenticated shell prompt.
fn login<W: io::Write>(
    console: &mut Console<W>,
    config: &ContainerConfig,
) -> Result<(), crate::console::ExpectError> {
    let eof = |pattern: &str| crate::console::ExpectError::Eof {
        pattern: pattern.to_string(),
    };
    console.expect(&format!("{} login:", config.hostname), BOOT_TIMEOUT)?;
    console
        .send_line(&config.username)
        .map_err(|_| eof("login"))?;
    console.expect("Password:", LOGIN_TIMEOUT)?;
    console
        .send_line(&config.password)
        .map_err(|_| eof("Password:"))?;
    console.expect(&format!("{}:~#", config.hostname), LOGIN_TIMEOUT)?;
    Ok(())
}

fn open_session(
    name: &str,
    config: &ContainerConfig,
    ssh_port: u16,
    paths: &Paths,
) -> Result<SshSession, ContainerError> {
    let ssh = SshSession::connect(ssh_port, &config.username, &config.password)?;
    ssh.rotate_host_key(
        &paths.container_id_rsa(name),
        &paths.container_id_rsa_pub(name),
    )?;
    Ok(ssh)
}

/// Host totals QEMU sizing is capped against: 75% of memory (MiB) and CPUs.
fn host_caps() -> (u64, u64) {
    let sys = System::new_all();
    let total_mib = sys.total_memory() / (1024 * 1024);
    let cpus = sys.cpus().len() as u64;
    ((total_mib * 3 / 4).max(128), (cpus * 3 / 4).max(1))
}

/// The `-net user` argument carrying every host forward, SSH pair first.
fn netdev_arg(ssh_port: u16, portfwd: &[(u16, u16)]) -> String {
    let mut arg = format!("user,hostfwd=tcp::{ssh_port}-:22");
    for (guest, host) in portfwd {
        arg.push_str(&format!(",hostfwd=tcp::{host}-:{guest}"));
    }
    arg
}

/// Materialize the full QEMU invocation for one boot attempt.
fn qemu_command(
    config: &ContainerConfig,
    dir: &Path,
    ssh_port: u16,
    mem_cap: u64,
    smp_cap: u64,
) -> Command {
    let template = template(config.arch);
    let mut cmd = Command::new(qemu_program(config.arch));
    cmd.current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .args(["-monitor", "null", "-serial", "stdio", "-nographic"])
        .args(template.machine)
        .arg("-m")
        .arg(format!("{}M", config.memory.min(mem_cap)))
        .arg("-smp")
        .arg(config.smp.min(smp_cap).to_string())
        .args(["-drive", "file=hdd.qcow2,format=qcow2"])
        .args(["-net", "nic"])
        .arg("-net")
        .arg(netdev_arg(ssh_port, &config.portfwd));

    // Legacy containers boot from the bootloader inside the image; everyone
    // else ships an external kernel and initrd.
    if !config.legacy {
        cmd.args(["-kernel", "vmlinuz", "-initrd", "initrd.img"])
            .arg("-append")
            .arg(format!(
                "root={} console={}",
                template.root, template.console
            ));
    }
    cmd
}

fn qemu_program(arch: Arch) -> PathBuf {
    paths::qemu_bin().join(arch.qemu_binary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demo_config(legacy: bool) -> ContainerConfig {
        ContainerConfig::from_value(&json!({
            "manifest": 1,
            "arch": "x86_64",
            "memory": 512,
            "hddmaxsize": 10,
            "password": "root",
            "portfwd": [[8080, 18080]],
            "legacy": legacy,
        }))
        .unwrap()
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_netdev_arg_ssh_pair_first() {
        let arg = netdev_arg(12345, &[(8080, 18080), (443, 10443)]);
        assert_eq!(
            arg,
            "user,hostfwd=tcp::12345-:22,hostfwd=tcp::18080-:8080,hostfwd=tcp::10443-:443"
        );
    }

    #[test]
    fn test_qemu_command_modern_has_kernel() {
        let cmd = qemu_command(&demo_config(false), Path::new("/tmp"), 12345, 8192, 8);
        let args = args_of(&cmd);
        assert!(args.contains(&"-kernel".to_string()));
        assert!(args.contains(&"vmlinuz".to_string()));
        assert!(args.contains(&"-initrd".to_string()));
        assert!(args.iter().any(|a| a.starts_with("root=/dev/sda1")));
    }

    #[test]
    fn test_qemu_command_legacy_has_no_kernel() {
        let cmd = qemu_command(&demo_config(true), Path::new("/tmp"), 12345, 8192, 8);
        let args = args_of(&cmd);
        assert!(!args.contains(&"-kernel".to_string()));
        assert!(!args.contains(&"-append".to_string()));
    }

    #[test]
    fn test_qemu_command_caps_memory_and_smp() {
        let cmd = qemu_command(&demo_config(false), Path::new("/tmp"), 12345, 256, 2);
        let args = args_of(&cmd);
        let mem = args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(args[mem + 1], "256M");
        let smp = args.iter().position(|a| a == "-smp").unwrap();
        assert_eq!(args[smp + 1], "2");
    }

    #[test]
    fn test_qemu_command_forwards_every_pair() {
        let cmd = qemu_command(&demo_config(false), Path::new("/tmp"), 12345, 8192, 8);
        let args = args_of(&cmd);
        let net = args.iter().find(|a| a.starts_with("user,")).unwrap();
        assert!(net.contains("hostfwd=tcp::12345-:22"));
        assert!(net.contains("hostfwd=tcp::18080-:8080"));
    }

    #[test]
    fn test_aarch64_template_uses_virt_machine() {
        let t = template(Arch::Aarch64);
        assert!(t.machine.contains(&"virt"));
        assert_eq!(t.console, "ttyAMA0");
    }

    #[test]
    fn test_program_name_tracks_arch() {
        assert!(qemu_program(Arch::Mipsel)
            .to_string_lossy()
            .ends_with("qemu-system-mipsel"));
    }
}
