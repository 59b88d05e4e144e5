use std::fs::{self, File};
use std::io::{self, Read};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use ssh2::{Channel, Session, Sftp};
use sysinfo::{Pid, ProcessStatus, System};
use thiserror::Error;

/// How long to keep retrying the initial connection. sshd comes up a little
/// after the login prompt, so the first attempts routinely fail.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Blocking-operation timeout on established sessions.
const SESSION_TIMEOUT_MS: u32 = 30_000;
/// How long a guest gets to finish `poweroff` before the caller escalates.
const POWEROFF_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from the SSH/SFTP layer.
#[derive(Debug, Error)]
pub enum SshError {
    /// libssh2 failure.
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),
    /// Transport failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// sshd never accepted our credentials within the retry window.
    #[error("could not reach sshd on port {port} within {timeout:?}")]
    ConnectTimeout {
        /// Forwarded host port we dialed.
        port: u16,
        /// The exhausted retry window.
        timeout: Duration,
    },
    /// The `echo $$` preamble did not produce a number.
    #[error("could not parse guest pid from {0:?}")]
    Pid(String),
    /// The guest did not power off in time; the caller should kill instead.
    #[error("guest poweroff did not finish within {0:?}")]
    PoweroffTimeout(Duration),
    /// `ssh-keygen` failed to produce a key pair.
    #[error("ssh-keygen failed: {0}")]
    KeyGen(String),
    /// The fresh public key could not be appended to `authorized_keys`.
    #[error("failed to authorize key on guest: {0}")]
    KeyAuthorization(String),
}

/// Errors from file transfer, separated so the daemon can map them onto the
/// `INVALID_PATH` / `IS_A_DIRECTORY` wire keywords.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A path argument does not name a usable file.
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    /// A file operation hit a directory.
    #[error("'{0}' is a directory")]
    IsADirectory(String),
    /// Underlying session failure.
    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// The libssh2 handles, guarded as one unit: libssh2 forbids unsynchronized
/// concurrent access to a session or anything opened on it.
struct SshInner {
    session: Session,
    sftp: Sftp,
}

/// An authenticated SSH + SFTP session to one booted guest.
///
/// Shared by every connection handler touching the container, so all
/// operations on the underlying session go through one internal lock.
pub struct SshSession {
    port: u16,
    username: String,
    password: String,
    inner: Mutex<SshInner>,
}

/// A guest process started by [`SshSession::exec`].
///
/// Holds its own dedicated session so concurrent executions never contend;
/// the session is switched to non-blocking once the pid preamble has been
/// read, which suits the polling pumps of the streaming bridge.
pub struct Exec {
    _session: Session,
    /// Channel carrying the process's stdin/stdout/stderr. The bridge's
    /// pumps run on separate threads, so every channel operation must hold
    /// this lock for the duration of the call.
    pub channel: Mutex<Channel>,
    /// Guest-side pid, for signalling the process later.
    pub pid: u32,
}

impl SshSession {
    /// Connect and authenticate to `127.0.0.1:port`, retrying until sshd
    /// answers or the window closes.
    pub fn connect(port: u16, username: &str, password: &str) -> Result<Self, SshError> {
        let start = Instant::now();
        loop {
            match Self::dial(port, username, password) {
                Ok(session) => {
                    let sftp = session.sftp()?;
                    return Ok(Self {
                        port,
                        username: username.to_string(),
                        password: password.to_string(),
                        inner: Mutex::new(SshInner { session, sftp }),
                    });
                }
                Err(e) if start.elapsed() < CONNECT_TIMEOUT => {
                    debug!("ssh not ready on port {port} yet: {e}");
                    thread::sleep(Duration::from_secs(1));
                }
                Err(_) => {
                    return Err(SshError::ConnectTimeout {
                        port,
                        timeout: CONNECT_TIMEOUT,
                    })
                }
            }
        }
    }

    /// One handshake + password-auth attempt.
    fn dial(port: u16, username: &str, password: &str) -> Result<Session, SshError> {
        let tcp = TcpStream::connect(("127.0.0.1", port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(SESSION_TIMEOUT_MS);
        session.handshake()?;
        session.userauth_password(username, password)?;
        Ok(session)
    }

    /// Execute `argv` in the guest, returning its channel and guest pid.
    pub fn exec(&self, argv: &[String]) -> Result<Exec, SshError> {
        let session = Self::dial(self.port, &self.username, &self.password)?;
        let mut channel = session.channel_session()?;
        // The first stdout line is the pid of the shell, which exec then
        // replaces with the target process.
        channel.exec(&format!("echo $$ && exec {}", shell_join(argv)))?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match channel.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) => return Err(e.into()),
            }
            if line.len() > 32 {
                break;
            }
        }
        let line = String::from_utf8_lossy(&line).trim().to_string();
        let pid = parse_pid(&line).ok_or(SshError::Pid(line))?;

        // The bridge pumps poll; blocking reads would wedge them.
        session.set_blocking(false);
        Ok(Exec {
            _session: session,
            channel: Mutex::new(channel),
            pid,
        })
    }

    /// Run a short command on the control session, collecting stdout and the
    /// exit status. Serialized against every other operation on the session.
    pub fn run(&self, cmd: &str) -> Result<(String, i32), SshError> {
        let inner = self.inner.lock().unwrap();
        let mut channel = inner.session.channel_session()?;
        channel.exec(cmd)?;
        let mut out = String::new();
        channel.read_to_string(&mut out)?;
        channel.wait_close()?;
        let status = channel.exit_status()?;
        Ok((out, status))
    }

    /// Upload `local` to `remote` over SFTP.
    ///
    /// Local directories are rejected; a remote path that is an existing
    /// directory receives the local file under its own name.
    pub fn put(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        if local.is_dir() {
            return Err(TransferError::IsADirectory(local.display().to_string()));
        }
        let mut src = File::open(local)
            .map_err(|_| TransferError::InvalidPath(local.display().to_string()))?;

        let inner = self.inner.lock().unwrap();
        let mut remote = PathBuf::from(remote);
        if let Ok(stat) = inner.sftp.stat(&remote) {
            if stat.is_dir() {
                match local.file_name() {
                    Some(name) => remote.push(name),
                    None => {
                        return Err(TransferError::InvalidPath(local.display().to_string()))
                    }
                }
            }
        }

        let mut dst = inner
            .sftp
            .create(&remote)
            .map_err(|_| TransferError::InvalidPath(remote.display().to_string()))?;
        io::copy(&mut src, &mut dst).map_err(SshError::from)?;
        Ok(())
    }

    /// Download `remote` to `local` over SFTP.
    ///
    /// Remote directories are rejected; a local path that is an existing
    /// directory receives the remote file under its own name.
    pub fn get(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        let remote = Path::new(remote);
        let inner = self.inner.lock().unwrap();
        let stat = inner
            .sftp
            .stat(remote)
            .map_err(|_| TransferError::InvalidPath(remote.display().to_string()))?;
        if stat.is_dir() {
            return Err(TransferError::IsADirectory(remote.display().to_string()));
        }

        let mut local = local.to_path_buf();
        if local.is_dir() {
            match remote.file_name() {
                Some(name) => local.push(name),
                None => return Err(TransferError::InvalidPath(remote.display().to_string())),
            }
        }

        let mut src = inner
            .sftp
            .open(remote)
            .map_err(|_| TransferError::InvalidPath(remote.display().to_string()))?;
        let mut dst = File::create(&local)
            .map_err(|_| TransferError::InvalidPath(local.display().to_string()))?;
        io::copy(&mut src, &mut dst).map_err(SshError::from)?;
        Ok(())
    }

    /// Ask the guest to power off, then wait for the QEMU child to go away.
    ///
    /// A child that lingers as a zombie gets a hard signal; a child still
    /// alive after the window yields [`SshError::PoweroffTimeout`] so the
    /// daemon can fall back to a kill.
    pub fn poweroff(&self, qemu: &mut Child) -> Result<(), SshError> {
        // The connection usually dies mid-command as the guest goes down.
        if let Err(e) = self.run("poweroff") {
            debug!("poweroff command ended with {e} (expected while halting)");
        }

        let pid = qemu.id();
        let mut system = System::new();
        let start = Instant::now();
        while start.elapsed() < POWEROFF_TIMEOUT {
            if qemu.try_wait()?.is_some() {
                return Ok(());
            }
            system.refresh_process(Pid::from_u32(pid));
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                if process.status() == ProcessStatus::Zombie {
                    warn!("qemu pid {pid} is a zombie, sending hard signal");
                    let _ = qemu.kill();
                    qemu.wait()?;
                    return Ok(());
                }
            }
            thread::sleep(Duration::from_millis(100));
        }
        Err(SshError::PoweroffTimeout(POWEROFF_TIMEOUT))
    }

    /// Create a fresh RSA key pair at the given paths and authorize its
    /// public half in the guest, so `shell` can use key auth from then on.
    pub fn rotate_host_key(&self, key: &Path, pubkey: &Path) -> Result<(), SshError> {
        for stale in [key, pubkey] {
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }

        let output = Command::new("ssh-keygen")
            .args(["-q", "-t", "rsa", "-b", "2048", "-N", ""])
            .arg("-f")
            .arg(key)
            .output()?;
        if !output.status.success() {
            return Err(SshError::KeyGen(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let public = fs::read_to_string(pubkey)?;
        let cmd = format!(
            "mkdir -p ~/.ssh && echo {} >> ~/.ssh/authorized_keys",
            shell_quote(public.trim())
        );
        let (out, status) = self
            .run(&cmd)
            .map_err(|e| SshError::KeyAuthorization(e.to_string()))?;
        if status != 0 {
            return Err(SshError::KeyAuthorization(format!(
                "exit status {status}: {}",
                out.trim()
            )));
        }
        Ok(())
    }
}

/// Quote one word for the guest's `sh`.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Quote and join an argv for the guest's `sh`.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_pid(line: &str) -> Option<u32> {
    line.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_word() {
        assert_eq!(shell_quote("ls"), "'ls'");
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_shell_join() {
        let argv = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(shell_join(&argv), "'echo' 'hello world'");
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("1234\r"), Some(1234));
        assert_eq!(parse_pid("  77  "), Some(77));
        assert_eq!(parse_pid("bash: not found"), None);
        assert_eq!(parse_pid(""), None);
    }
}
