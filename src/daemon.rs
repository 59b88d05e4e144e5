use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tempfile::NamedTempFile;

use crate::archive::{self, ArchiveError};
use crate::bridge;
use crate::config::valid_container_name;
use crate::container::{Container, ContainerError};
use crate::paths::Paths;
use crate::ports;
use crate::protocol::{MessageStream, ProtocolError, RequestError, BEGIN, NO, OK, READY, YES};
use crate::ssh::TransferError;

/// Lowest port the daemon itself will bind.
const DAEMON_PORT_LO: u16 = 22300;
/// Most argv entries a RUN-COMMAND may carry.
const MAX_ARGV: usize = 1024;

/// The discovery record written next to the containers.
///
/// Clients treat the daemon as alive when this file exists, its pid is a
/// live process and its boot stamp postdates the OS boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// Address the daemon is bound to.
    pub addr: String,
    /// Port the daemon is listening on.
    pub port: u16,
    /// The daemon's pid.
    pub pid: u32,
    /// Seconds since the epoch when the daemon started.
    pub boot: f64,
}

/// Read the discovery record, if one exists and parses.
pub fn read_info(paths: &Paths) -> Option<DaemonInfo> {
    let raw = fs::read_to_string(paths.daemon_info_file()).ok()?;
    serde_json::from_str(&raw).ok()
}

/// The daemon liveness predicate.
pub fn server_is_running(paths: &Paths) -> bool {
    let info = match read_info(paths) {
        Some(info) => info,
        None => return false,
    };
    let mut sys = System::new();
    if !sys.refresh_process(Pid::from_u32(info.pid)) {
        return false;
    }
    info.boot > System::boot_time() as f64
}

enum HandlerError {
    /// Concluded with a typed wire error.
    Request(RequestError),
    /// The exchange script broke down; nothing sensible can be sent.
    Protocol(ProtocolError),
    /// Unclassified failure, reported as `EXCEPTION_OCCURED`.
    Internal(String),
}

impl From<RequestError> for HandlerError {
    fn from(e: RequestError) -> Self {
        HandlerError::Request(e)
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(e: ProtocolError) -> Self {
        HandlerError::Protocol(e)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Protocol(ProtocolError::Io(e))
    }
}

fn transfer_error(e: TransferError) -> HandlerError {
    match e {
        TransferError::InvalidPath(p) => RequestError::InvalidPath(p).into(),
        TransferError::IsADirectory(p) => RequestError::IsADirectory(p).into(),
        TransferError::Ssh(e) => HandlerError::Internal(e.to_string()),
    }
}

fn container_error(e: ContainerError) -> HandlerError {
    match e {
        ContainerError::NotInstalled(name) => RequestError::NoSuchContainer(name).into(),
        ContainerError::Boot(_) => RequestError::BootFailure.into(),
        other => HandlerError::Internal(other.to_string()),
    }
}

fn archive_error(e: ArchiveError) -> HandlerError {
    match e {
        ArchiveError::NotInstalled(name) => RequestError::NoSuchContainer(name).into(),
        ArchiveError::AlreadyExists(name) => RequestError::InvalidPath(name).into(),
        ArchiveError::InvalidPath(p) => RequestError::InvalidPath(p).into(),
        ArchiveError::IsADirectory(p) => RequestError::IsADirectory(p).into(),
        ArchiveError::Io(e) => HandlerError::Internal(e.to_string()),
    }
}

/// The container lifecycle daemon: owns every live container for one user.
pub struct Daemon {
    paths: Paths,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    /// Serializes check-and-insert so two STARTs of one name cannot race.
    startup: Mutex<()>,
    halt: AtomicBool,
    halt_tx: Mutex<Sender<()>>,
}

/// Run the daemon until halted. There is one per user: a live discovery
/// record makes a second instance refuse to start.
pub fn run(paths: Paths) -> Result<()> {
    fs::create_dir_all(paths.container_home())?;
    if server_is_running(&paths) {
        bail!("another daemon is already running");
    }

    let listener = bind_listener().context("could not bind a listening socket")?;
    let addr = listener.local_addr()?;
    write_info(&paths, addr).context("could not write the daemon info file")?;
    info!("daemon listening on {addr}");

    // Whatever happens from here on, the discovery record must go away.
    let info_path = paths.daemon_info_file();
    let _cleanup = scopeguard::guard((), move |_| {
        let _ = fs::remove_file(&info_path);
    });

    let (halt_tx, halt_rx) = mpsc::channel();
    let daemon = Arc::new(Daemon {
        paths,
        containers: Mutex::new(HashMap::new()),
        startup: Mutex::new(()),
        halt: AtomicBool::new(false),
        halt_tx: Mutex::new(halt_tx),
    });

    let accept_daemon = Arc::clone(&daemon);
    let accept_listener = listener.try_clone()?;
    let accept = thread::spawn(move || accept_loop(accept_listener, accept_daemon));

    // Park until a handler fires the halt event.
    let _ = halt_rx.recv();
    info!("halt requested, shutting down");
    daemon.halt.store(true, Ordering::SeqCst);
    // Wake the accept loop so it can observe the flag.
    let _ = TcpStream::connect(addr);
    let _ = accept.join();
    drop(listener);

    daemon.shutdown_containers();
    Ok(())
}

/// The daemon binds the lowest free port at or above its base. The probe
/// and the bind race, so a handful of attempts are allowed.
fn bind_listener() -> Result<TcpListener> {
    let mut last = None;
    for _ in 0..5 {
        let port = ports::allocate_port(DAEMON_PORT_LO, u16::MAX)?;
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => last = Some(e),
        }
    }
    Err(last.map(Into::into).unwrap_or_else(|| {
        anyhow::anyhow!("could not bind any port at or above {DAEMON_PORT_LO}")
    }))
}

fn write_info(paths: &Paths, addr: SocketAddr) -> Result<()> {
    let info = DaemonInfo {
        addr: addr.ip().to_string(),
        port: addr.port(),
        pid: process::id(),
        boot: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0),
    };
    let mut tmp = NamedTempFile::new_in(paths.container_home())?;
    tmp.write_all(serde_json::to_string(&info)?.as_bytes())?;
    // Atomic rename so clients never observe a half-written record.
    tmp.persist(paths.daemon_info_file())?;
    Ok(())
}

fn accept_loop(listener: TcpListener, daemon: Arc<Daemon>) {
    for stream in listener.incoming() {
        if daemon.halt.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let daemon = Arc::clone(&daemon);
                thread::spawn(move || daemon.handle_connection(stream));
            }
            Err(e) => {
                // Transient (EMFILE and friends); the listener itself stays
                // valid until shutdown.
                warn!("accept failed: {e}");
            }
        }
    }
}

impl Daemon {
    fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let mut conn = MessageStream::new(stream);
        if conn.send(READY).is_err() {
            return;
        }
        let request = match conn.recv() {
            Ok(r) => r,
            Err(e) => {
                debug!("dropping connection from {peer}: {e}");
                return;
            }
        };
        debug!(
            "request {} from {peer}",
            String::from_utf8_lossy(&request)
        );

        match self.dispatch(&request, &mut conn) {
            Ok(()) => (),
            Err(HandlerError::Request(e)) => {
                if let Err(send_err) = conn.send_error(&e) {
                    debug!("could not report '{e}' to {peer}: {send_err}");
                }
            }
            Err(HandlerError::Protocol(e)) => {
                warn!("protocol breakdown with {peer}: {e}");
            }
            Err(HandlerError::Internal(e)) => {
                error!("request from {peer} failed: {e}");
                let _ = conn.send_error(&RequestError::Exception);
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        request: &[u8],
        conn: &mut MessageStream<TcpStream>,
    ) -> Result<(), HandlerError> {
        match request {
            b"PING" => {
                conn.send(OK)?;
                Ok(())
            }
            b"STARTED" => self.r_started(conn),
            b"START" => self.r_start(conn),
            b"STOP" => self.r_stop(conn, false),
            b"KILL" => self.r_stop(conn, true),
            b"SSH-ADDRESS" => self.r_ssh_address(conn),
            b"UPDATE-HOSTKEY" => self.r_update_hostkey(conn),
            b"GET-FILE" => self.r_get_file(conn),
            b"PUT-FILE" => self.r_put_file(conn),
            b"RUN-COMMAND" => self.r_run_command(conn),
            b"INSTALL" => self.r_install(conn),
            b"ARCHIVE" => self.r_archive(conn),
            b"DELETE" => self.r_delete(conn),
            b"RENAME" => self.r_rename(conn),
            b"HALT" => {
                conn.send(OK)?;
                let _ = self.halt_tx.lock().unwrap().send(());
                Ok(())
            }
            b"PANIC" => self.r_panic(),
            other => Err(RequestError::UnknownRequest(
                String::from_utf8_lossy(other).into(),
            )
            .into()),
        }
    }

    /// A name is usable when it is well-formed and has a directory on disk.
    fn installed(&self, name: &str) -> bool {
        valid_container_name(name) && self.paths.container_dir(name).is_dir()
    }

    fn live(&self, name: &str) -> Option<Arc<Container>> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    /// Fetch the live container for a request, with the usual two failure
    /// modes.
    fn require_live(&self, name: &str) -> Result<Arc<Container>, HandlerError> {
        if !self.installed(name) {
            return Err(RequestError::NoSuchContainer(name.to_string()).into());
        }
        self.live(name)
            .ok_or_else(|| RequestError::ContainerNotStarted(name.to_string()).into())
    }

    fn r_started(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        if self.live(&name).is_some() {
            conn.send(YES)?;
        } else {
            conn.send(NO)?;
        }
        Ok(())
    }

    fn r_start(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        if !self.installed(&name) {
            return Err(RequestError::NoSuchContainer(name).into());
        }

        let _serialize = self.startup.lock().unwrap();
        if self.live(&name).is_some() {
            // Duplicate START is idempotent success.
            conn.send(OK)?;
            return Ok(());
        }
        info!("starting container '{name}'");
        let container = Container::start(&name, &self.paths).map_err(container_error)?;
        self.containers
            .lock()
            .unwrap()
            .insert(name, Arc::new(container));
        conn.send(OK)?;
        Ok(())
    }

    fn r_stop(
        &self,
        conn: &mut MessageStream<TcpStream>,
        hard: bool,
    ) -> Result<(), HandlerError> {
        let name = conn.field()?;
        if !self.installed(&name) {
            return Err(RequestError::NoSuchContainer(name).into());
        }
        let container = {
            let _serialize = self.startup.lock().unwrap();
            self.containers.lock().unwrap().remove(&name)
        };
        let container =
            container.ok_or_else(|| RequestError::ContainerNotStarted(name.clone()))?;

        if hard {
            info!("killing container '{name}'");
            container.kill();
        } else {
            info!("stopping container '{name}'");
            if let Err(e) = container.stop() {
                warn!("graceful stop of '{name}' failed ({e}), killing");
                container.kill();
            }
        }
        conn.send(OK)?;
        Ok(())
    }

    fn r_ssh_address(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        let container = self.require_live(&name)?;
        let reply = format!(
            "{}:{}:127.0.0.1:{}",
            container.username(),
            container.password(),
            container.ssh_port()
        );
        conn.send(reply.as_bytes())?;
        Ok(())
    }

    fn r_update_hostkey(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        let container = self.require_live(&name)?;
        container
            .session()
            .rotate_host_key(
                &self.paths.container_id_rsa(&name),
                &self.paths.container_id_rsa_pub(&name),
            )
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        conn.send(OK)?;
        Ok(())
    }

    fn r_get_file(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        let remote = conn.field()?;
        let local = conn.field()?;
        let container = self.require_live(&name)?;
        debug!("getting '{remote}' from '{name}' to '{local}'");
        container
            .get(&remote, Path::new(&local))
            .map_err(transfer_error)?;
        conn.send(OK)?;
        Ok(())
    }

    fn r_put_file(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        let local = conn.field()?;
        let remote = conn.field()?;
        let container = self.require_live(&name)?;
        debug!("putting '{local}' into '{name}' at '{remote}'");
        container
            .put(Path::new(&local), &remote)
            .map_err(transfer_error)?;
        conn.send(OK)?;
        Ok(())
    }

    fn r_run_command(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        let argc: usize = conn
            .field()?
            .trim()
            .parse()
            .map_err(|_| HandlerError::Protocol(ProtocolError::Unexpected("argc".into())))?;
        if argc == 0 || argc > MAX_ARGV {
            return Err(HandlerError::Protocol(ProtocolError::Unexpected(format!(
                "argc {argc}"
            ))));
        }
        let mut argv = Vec::with_capacity(argc);
        for _ in 0..argc {
            argv.push(conn.field()?);
        }

        let container = self.require_live(&name)?;
        let exec = container
            .run(&argv)
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        conn.send(BEGIN)?;

        let stream = conn.get_ref().try_clone()?;
        debug!("bridging guest pid {} for '{name}'", exec.pid);
        bridge::serve(stream, exec, container.session())?;
        Ok(())
    }

    fn r_install(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let archive_path = conn.field()?;
        let name = conn.field()?;
        if !valid_container_name(&name) {
            return Err(RequestError::InvalidPath(name).into());
        }
        if self.live(&name).is_some() {
            return Err(RequestError::ContainerStartedCannotModify(name).into());
        }
        info!("installing '{archive_path}' as '{name}'");
        archive::install(&self.paths, Path::new(&archive_path), &name)
            .map_err(archive_error)?;
        conn.send(OK)?;
        Ok(())
    }

    fn r_archive(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        let out = conn.field()?;
        if self.live(&name).is_some() {
            return Err(RequestError::ContainerStartedCannotModify(name).into());
        }
        info!("archiving '{name}' to '{out}'");
        archive::export(&self.paths, &name, Path::new(&out)).map_err(archive_error)?;
        conn.send(OK)?;
        Ok(())
    }

    fn r_delete(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let name = conn.field()?;
        if self.live(&name).is_some() {
            return Err(RequestError::ContainerStartedCannotModify(name).into());
        }
        info!("deleting container '{name}'");
        archive::delete(&self.paths, &name).map_err(archive_error)?;
        conn.send(OK)?;
        Ok(())
    }

    fn r_rename(&self, conn: &mut MessageStream<TcpStream>) -> Result<(), HandlerError> {
        let old = conn.field()?;
        let new = conn.field()?;
        for name in [&old, &new] {
            if !valid_container_name(name) {
                return Err(RequestError::InvalidPath(name.clone()).into());
            }
        }
        if self.live(&old).is_some() {
            return Err(RequestError::ContainerStartedCannotModify(old).into());
        }
        info!("renaming container '{old}' to '{new}'");
        archive::rename(&self.paths, &old, &new).map_err(archive_error)?;
        conn.send(OK)?;
        Ok(())
    }

    /// Last resort: sweep the host for QEMU processes, drop the discovery
    /// record and abort without any further cleanup.
    fn r_panic(&self) -> Result<(), HandlerError> {
        error!("panic requested: killing every qemu-system process");
        let sys = System::new_all();
        for (pid, process) in sys.processes() {
            if process.name().contains("qemu-system-") {
                warn!("panic: killing pid {pid} ({})", process.name());
                process.kill();
            }
        }
        let _ = fs::remove_file(self.paths.daemon_info_file());
        process::exit(1);
    }

    /// Halt-path cleanup: stop every container, falling back to kill, and
    /// keep going whatever happens.
    fn shutdown_containers(&self) {
        let drained: Vec<_> = {
            let mut map = self.containers.lock().unwrap();
            map.drain().collect()
        };
        for (name, container) in drained {
            info!("halting container '{name}'");
            if let Err(e) = container.stop() {
                warn!("stop of '{name}' failed ({e}), killing");
                container.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_no_info_file_means_not_running() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        assert!(!server_is_running(&paths));
    }

    #[test]
    fn test_garbage_info_file_means_not_running() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        fs::create_dir_all(paths.container_home()).unwrap();
        fs::write(paths.daemon_info_file(), b"not json").unwrap();
        assert!(!server_is_running(&paths));
    }

    #[test]
    fn test_dead_pid_means_not_running() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        fs::create_dir_all(paths.container_home()).unwrap();
        let info = DaemonInfo {
            addr: "127.0.0.1".to_string(),
            port: 22300,
            // Pid max on Linux is bounded well below this.
            pid: u32::MAX - 1,
            boot: 1e18,
        };
        fs::write(
            paths.daemon_info_file(),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();
        assert!(!server_is_running(&paths));
    }

    #[test]
    fn test_stale_boot_stamp_means_not_running() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        fs::create_dir_all(paths.container_home()).unwrap();
        let info = DaemonInfo {
            addr: "127.0.0.1".to_string(),
            port: 22300,
            // This test process is certainly alive.
            pid: process::id(),
            boot: 0.0,
        };
        fs::write(
            paths.daemon_info_file(),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();
        assert!(!server_is_running(&paths));
    }

    #[test]
    fn test_info_round_trips() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        fs::create_dir_all(paths.container_home()).unwrap();
        let addr: SocketAddr = "127.0.0.1:23456".parse().unwrap();
        write_info(&paths, addr).unwrap();
        let info = read_info(&paths).unwrap();
        assert_eq!(info.addr, "127.0.0.1");
        assert_eq!(info.port, 23456);
        assert_eq!(info.pid, process::id());
        assert!(info.boot > 0.0);
    }
}
