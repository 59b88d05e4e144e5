use std::env;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;

use crate::bridge;
use crate::daemon::{read_info, server_is_running};
use crate::paths::Paths;
use crate::protocol::{MessageStream, ProtocolError, BEGIN, OK, READY, YES};

/// How long a freshly spawned daemon gets to write its discovery record.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced to CLI users of the client library.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live daemon could be discovered.
    #[error("no daemon is running")]
    NotRunning,
    /// The wire exchange failed or concluded with a server error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A daemon was spawned but never became discoverable.
    #[error("daemon did not come up within {0:?}")]
    SpawnTimeout(Duration),
    /// The server's reply did not have the promised shape.
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// The `user:password:host:port` answer to `SSH-ADDRESS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAddress {
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Host to connect to.
    pub host: String,
    /// Forwarded sshd port.
    pub port: u16,
}

/// A handle on the daemon, one short-lived connection per request.
pub struct DaemonClient {
    addr: SocketAddr,
}

impl DaemonClient {
    /// Discover the daemon through its info file.
    pub fn connect(paths: &Paths) -> Result<Self, ClientError> {
        if !server_is_running(paths) {
            return Err(ClientError::NotRunning);
        }
        let info = read_info(paths).ok_or(ClientError::NotRunning)?;
        let addr = format!("{}:{}", info.addr, info.port)
            .parse()
            .map_err(|_| ClientError::Malformed(format!("{}:{}", info.addr, info.port)))?;
        Ok(Self { addr })
    }

    fn open(&self) -> Result<MessageStream<TcpStream>, ClientError> {
        let stream = TcpStream::connect(self.addr)?;
        let mut conn = MessageStream::new(stream);
        conn.recv_expect(READY)?;
        Ok(conn)
    }

    /// A request whose happy path is fields in, `OK` out.
    fn simple(&self, keyword: &[u8], fields: &[&str]) -> Result<(), ClientError> {
        let mut conn = self.open()?;
        conn.send(keyword)?;
        for field in fields {
            conn.send_field(field.as_bytes())?;
        }
        conn.recv_expect(OK)?;
        Ok(())
    }

    /// Liveness check; mutates nothing.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.simple(b"PING", &[])
    }

    /// Whether the named container is in the daemon's live map.
    pub fn started(&self, name: &str) -> Result<bool, ClientError> {
        let mut conn = self.open()?;
        conn.send(b"STARTED")?;
        conn.send_field(name.as_bytes())?;
        let reply = conn.recv_reply()?;
        Ok(reply == YES)
    }

    /// Boot a container; success if it is already running.
    pub fn start(&self, name: &str) -> Result<(), ClientError> {
        self.simple(b"START", &[name])
    }

    /// Gracefully stop a running container.
    pub fn stop(&self, name: &str) -> Result<(), ClientError> {
        self.simple(b"STOP", &[name])
    }

    /// Hard-kill a running container.
    pub fn kill(&self, name: &str) -> Result<(), ClientError> {
        self.simple(b"KILL", &[name])
    }

    /// Credentials and endpoint for reaching a running container over SSH.
    pub fn ssh_address(&self, name: &str) -> Result<SshAddress, ClientError> {
        let mut conn = self.open()?;
        conn.send(b"SSH-ADDRESS")?;
        conn.send_field(name.as_bytes())?;
        let reply = conn.recv_reply()?;
        let reply = String::from_utf8(reply)
            .map_err(|e| ClientError::Malformed(String::from_utf8_lossy(e.as_bytes()).into()))?;
        parse_ssh_address(&reply).ok_or(ClientError::Malformed(reply))
    }

    /// Rotate the per-container key pair and re-authorize it in the guest.
    pub fn update_hostkey(&self, name: &str) -> Result<(), ClientError> {
        self.simple(b"UPDATE-HOSTKEY", &[name])
    }

    /// Fetch a guest file to a local path.
    pub fn get_file(&self, name: &str, remote: &str, local: &Path) -> Result<(), ClientError> {
        let local = absolute(local)?;
        self.simple(b"GET-FILE", &[name, remote, &local.to_string_lossy()])
    }

    /// Send a local file to a guest path.
    pub fn put_file(&self, name: &str, local: &Path, remote: &str) -> Result<(), ClientError> {
        let local = absolute(local)?;
        self.simple(b"PUT-FILE", &[name, &local.to_string_lossy(), remote])
    }

    /// Install a container from an archive under a new name.
    pub fn install(&self, archive: &Path, name: &str) -> Result<(), ClientError> {
        let archive = absolute(archive)?;
        self.simple(b"INSTALL", &[&archive.to_string_lossy(), name])
    }

    /// Export a stopped container to a tar archive.
    pub fn archive(&self, name: &str, out: &Path) -> Result<(), ClientError> {
        let out = absolute(out)?;
        self.simple(b"ARCHIVE", &[name, &out.to_string_lossy()])
    }

    /// Delete a stopped container's directory.
    pub fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.simple(b"DELETE", &[name])
    }

    /// Rename a stopped container.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), ClientError> {
        self.simple(b"RENAME", &[old, new])
    }

    /// Ask the daemon to shut everything down and exit.
    pub fn server_halt(&self) -> Result<(), ClientError> {
        self.simple(b"HALT", &[])
    }

    /// Kill-all-QEMU escape hatch. The daemon aborts without replying.
    pub fn panic(&self) -> Result<(), ClientError> {
        let mut conn = self.open()?;
        conn.send(b"PANIC")?;
        Ok(())
    }

    /// Run `argv` in the guest, bridging this process's stdio until the
    /// stream ends. `Ok` means the stream closed cleanly, nothing more: the
    /// guest's own exit status is not carried by the protocol.
    pub fn run_command(&self, name: &str, argv: &[String]) -> Result<(), ClientError> {
        let mut conn = self.open()?;
        conn.send(b"RUN-COMMAND")?;
        conn.send_field(name.as_bytes())?;
        conn.send_field(argv.len().to_string().as_bytes())?;
        for arg in argv {
            conn.send_field(arg.as_bytes())?;
        }
        conn.recv_expect(BEGIN)?;

        let stream = conn.into_inner();
        bridge::run_client(stream, io::stdin(), &mut io::stdout(), &mut io::stderr())?;
        Ok(())
    }
}

/// Make sure a daemon is discoverable, spawning one if needed.
///
/// The daemon is this same executable run with the hidden `server`
/// subcommand, detached from the caller's stdio.
pub fn ensure_server(paths: &Paths) -> Result<(), ClientError> {
    if server_is_running(paths) {
        return Ok(());
    }
    let exe = env::current_exe()?;
    info!("no daemon found, spawning {}", exe.display());
    Command::new(exe)
        .arg("server")
        .env("HOME", paths.home())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let start = Instant::now();
    while start.elapsed() < SPAWN_TIMEOUT {
        if server_is_running(paths) {
            debug!("daemon became discoverable after {:?}", start.elapsed());
            return Ok(());
        }
        thread::sleep(Duration::from_millis(250));
    }
    Err(ClientError::SpawnTimeout(SPAWN_TIMEOUT))
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

/// Split `user:password:host:port`, tolerating `:` inside the password.
fn parse_ssh_address(reply: &str) -> Option<SshAddress> {
    let (username, rest) = reply.split_once(':')?;
    let (rest, port) = rest.rsplit_once(':')?;
    let (password, host) = rest.rsplit_once(':')?;
    Some(SshAddress {
        username: username.to_string(),
        password: password.to_string(),
        host: host.to_string(),
        port: port.parse().ok()?,
    })
}
