//! End-to-end tests against a real daemon, minus QEMU: everything here
//! exercises the wire protocol and the on-disk operations. Lifecycle paths
//! that need a bootable image are covered by unit tests of their parts.

use std::fs;
use std::net::TcpStream;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use vmkeep::archive;
use vmkeep::client::{ClientError, DaemonClient};
use vmkeep::daemon::{self, read_info, server_is_running};
use vmkeep::protocol::{MessageStream, ProtocolError, RequestError, OK, READY};
use vmkeep::Paths;

struct TestDaemon {
    paths: Paths,
    handle: Option<JoinHandle<()>>,
    _home: TempDir,
}

impl TestDaemon {
    /// Boot a daemon over a scratch home directory and wait until it is
    /// discoverable.
    fn spawn() -> Self {
        let home = TempDir::new().expect("failed to create scratch home");
        let paths = Paths::with_home(home.path());
        let daemon_paths = paths.clone();
        let handle = thread::spawn(move || {
            if let Err(e) = daemon::run(daemon_paths) {
                eprintln!("daemon exited with error: {e:?}");
            }
        });

        let start = Instant::now();
        while !server_is_running(&paths) {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "daemon never became discoverable"
            );
            thread::sleep(Duration::from_millis(50));
        }
        Self {
            paths,
            handle: Some(handle),
            _home: home,
        }
    }

    fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.paths).expect("could not discover the daemon")
    }

    /// Lay down a container directory without booting anything.
    fn fake_container(&self, name: &str) {
        fs::create_dir_all(self.paths.container_dir(name)).unwrap();
        fs::write(
            self.paths.container_config(name),
            br#"{"manifest": 1, "arch": "x86_64", "memory": 512, "hddmaxsize": 10, "password": "root"}"#,
        )
        .unwrap();
        fs::write(self.paths.container_disk(name), b"pretend qcow2").unwrap();
    }

    fn halt(mut self) {
        self.client().server_halt().expect("halt failed");
        self.handle
            .take()
            .expect("already halted")
            .join()
            .expect("daemon thread panicked");
    }
}

fn server_error(result: Result<(), ClientError>) -> RequestError {
    match result {
        Err(ClientError::Protocol(ProtocolError::Server(e))) => e,
        other => panic!("expected a server error, got {other:?}"),
    }
}

#[test_log::test]
fn test_ping() {
    let daemon = TestDaemon::spawn();
    daemon.client().ping().expect("ping failed");
    daemon.halt();
}

#[test_log::test]
fn test_ready_is_the_first_message() {
    let daemon = TestDaemon::spawn();
    let info = read_info(&daemon.paths).unwrap();
    let stream = TcpStream::connect(format!("{}:{}", info.addr, info.port)).unwrap();
    let mut conn = MessageStream::new(stream);
    assert_eq!(conn.recv().unwrap(), READY);
    daemon.halt();
}

#[test_log::test]
fn test_unknown_request_keyword() {
    let daemon = TestDaemon::spawn();
    let info = read_info(&daemon.paths).unwrap();
    let stream = TcpStream::connect(format!("{}:{}", info.addr, info.port)).unwrap();
    let mut conn = MessageStream::new(stream);
    conn.recv_expect(READY).unwrap();
    conn.send(b"MAKE-COFFEE").unwrap();
    match conn.recv_expect(OK).unwrap_err() {
        ProtocolError::Server(RequestError::UnknownRequest(kw)) => {
            assert_eq!(kw, "MAKE-COFFEE");
        }
        other => panic!("expected UnknownRequest, got {other:?}"),
    }
    daemon.halt();
}

#[test_log::test]
fn test_started_is_no_for_unknown_names() {
    let daemon = TestDaemon::spawn();
    assert!(!daemon.client().started("ghost").unwrap());
    daemon.halt();
}

#[test_log::test]
fn test_start_unknown_container() {
    let daemon = TestDaemon::spawn();
    let err = server_error(daemon.client().start("ghost"));
    assert_eq!(err, RequestError::NoSuchContainer("ghost".to_string()));
    daemon.halt();
}

#[test_log::test]
fn test_stop_on_stopped_container() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("demo");
    let err = server_error(daemon.client().stop("demo"));
    assert_eq!(err, RequestError::ContainerNotStarted("demo".to_string()));
    daemon.halt();
}

#[test_log::test]
fn test_file_transfer_on_stopped_container() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("demo");
    let scratch = TempDir::new().unwrap();
    let local = scratch.path().join("a.out");
    fs::write(&local, b"payload").unwrap();
    let err = server_error(daemon.client().put_file("demo", &local, "/root/a.out"));
    assert_eq!(err, RequestError::ContainerNotStarted("demo".to_string()));
    daemon.halt();
}

#[test_log::test]
fn test_install_archive_round_trip() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("demo");
    let scratch = TempDir::new().unwrap();

    // Archive the seed container, install it back under a new name.
    let first = scratch.path().join("demo.tar");
    daemon.client().archive("demo", &first).unwrap();
    daemon.client().install(&first, "copy").unwrap();

    // Re-archive the copy and install once more.
    let second = scratch.path().join("copy.tar");
    daemon.client().archive("copy", &second).unwrap();
    daemon.client().install(&second, "copy2").unwrap();

    let original = fs::read(daemon.paths.container_config("demo")).unwrap();
    let twice_copied = fs::read(daemon.paths.container_config("copy2")).unwrap();
    assert_eq!(original, twice_copied);
    daemon.halt();
}

#[test_log::test]
fn test_install_rejects_duplicate_name() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("demo");
    let scratch = TempDir::new().unwrap();
    let out = scratch.path().join("demo.tar");
    daemon.client().archive("demo", &out).unwrap();
    let err = server_error(daemon.client().install(&out, "demo"));
    assert!(matches!(err, RequestError::InvalidPath(_)));
    daemon.halt();
}

#[test_log::test]
fn test_delete_removes_stopped_container() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("demo");
    daemon.client().delete("demo").unwrap();
    assert!(!daemon.paths.container_dir("demo").exists());
    let err = server_error(daemon.client().delete("demo"));
    assert_eq!(err, RequestError::NoSuchContainer("demo".to_string()));
    daemon.halt();
}

#[test_log::test]
fn test_rename_stopped_container() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("old");
    daemon.client().rename("old", "new").unwrap();
    assert!(daemon.paths.container_config("new").is_file());
    assert!(!daemon.paths.container_dir("old").exists());

    let err = server_error(daemon.client().rename("new", "bad/name"));
    assert!(matches!(err, RequestError::InvalidPath(_)));
    daemon.halt();
}

#[test_log::test]
fn test_ssh_address_requires_running_container() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("demo");
    match daemon.client().ssh_address("demo") {
        Err(ClientError::Protocol(ProtocolError::Server(
            RequestError::ContainerNotStarted(name),
        ))) => assert_eq!(name, "demo"),
        other => panic!("expected ContainerNotStarted, got {other:?}"),
    }
    daemon.halt();
}

#[test_log::test]
fn test_halt_removes_info_file() {
    let daemon = TestDaemon::spawn();
    let info_file = daemon.paths.daemon_info_file();
    assert!(info_file.is_file());
    let paths = daemon.paths.clone();
    daemon.halt();
    assert!(!info_file.exists());
    assert!(!server_is_running(&paths));
}

#[test_log::test]
fn test_second_daemon_refuses_to_start() {
    let daemon = TestDaemon::spawn();
    let err = daemon::run(daemon.paths.clone()).unwrap_err();
    assert!(err.to_string().contains("already running"));
    daemon.halt();
}

#[test_log::test]
fn test_archive_errors_surface_as_wire_errors() {
    let daemon = TestDaemon::spawn();
    // Archiving a container that does not exist.
    let scratch = TempDir::new().unwrap();
    let err = server_error(
        daemon
            .client()
            .archive("ghost", &scratch.path().join("x.tar")),
    );
    assert_eq!(err, RequestError::NoSuchContainer("ghost".to_string()));

    // Installing from a directory instead of an archive.
    let err = server_error(daemon.client().install(scratch.path(), "fresh"));
    assert!(matches!(err, RequestError::IsADirectory(_)));
    daemon.halt();
}

#[test_log::test]
fn test_library_export_feeds_daemon_install() {
    let daemon = TestDaemon::spawn();
    daemon.fake_container("seed");
    let scratch = TempDir::new().unwrap();
    let out = scratch.path().join("seed.tar");
    archive::export(&daemon.paths, "seed", &out).unwrap();
    daemon.client().install(&out, "sprout").unwrap();
    assert!(daemon.paths.container_disk("sprout").is_file());
    daemon.halt();
}
