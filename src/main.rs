use std::cell::OnceCell;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::{exit, Command as SystemCommand};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::{fmt::Target as LogTarget, Builder};

use vmkeep::client::{ensure_server, DaemonClient};
use vmkeep::config::valid_container_name;
use vmkeep::daemon;
use vmkeep::Paths;

#[derive(Parser, Debug)]
#[clap(version, about = "Manage QEMU-backed containers through a local daemon")]
struct Args {
    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Boot a container
    Start { name: String },
    /// Gracefully stop a running container
    Stop { name: String },
    /// Hard-kill a running container
    Kill { name: String },
    /// Open an interactive shell in a container
    Shell { name: String },
    /// Open an SFTP session into a container
    Sftp { name: String },
    /// Run a command in a container, streaming its stdio
    Run {
        name: String,
        #[clap(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Copy a local file into a container
    SendFile {
        name: String,
        local: PathBuf,
        remote: String,
    },
    /// Copy a file out of a container
    GetFile {
        name: String,
        remote: String,
        local: PathBuf,
    },
    /// Install a container from a tar archive
    Install {
        archive: PathBuf,
        /// Defaults to the archive's stem
        name: Option<String>,
    },
    /// Export a stopped container to a tar archive
    Archive { name: String, out: PathBuf },
    /// Delete a stopped container
    Delete { name: String },
    /// Rename a stopped container
    Rename { old: String, new: String },
    /// List installed containers
    List,
    /// Print the SSH endpoint of a running container
    SshAddress { name: String },
    /// Check that the daemon answers
    Ping,
    /// Rotate a running container's key pair
    UpdateHostkey { name: String },
    /// Stop every container and shut the daemon down
    ServerHalt,
    /// Kill every QEMU process on the host and abort the daemon
    Panic,
    /// Print the version
    Version,
    /// Run the daemon in the foreground (normally spawned automatically)
    #[clap(hide = true)]
    Server,
}

/// A log sink that creates the daemon log file lazily on first write.
struct DeferredLog {
    path: PathBuf,
    file: OnceCell<File>,
}

impl DeferredLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: OnceCell::new(),
        }
    }

    fn file(&mut self) -> &File {
        self.file.get_or_init(|| {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                // The `log` machinery swallows write errors, so surface
                // setup problems loudly.
                .unwrap_or_else(|err| panic!("failed to create {}: {err}", self.path.display()))
        })
    }
}

impl io::Write for DeferredLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file().flush()
    }
}

/// The daemon logs into its per-user file; the CLI logs to stderr.
fn init_logging(paths: &Paths, server: bool) -> Result<()> {
    let mut builder = if server {
        fs::create_dir_all(paths.container_home())?;
        let mut builder = Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.target(LogTarget::Pipe(Box::new(DeferredLog::new(
            paths.daemon_log_file(),
        ))));
        builder
    } else {
        let mut builder = Builder::from_default_env();
        builder.target(LogTarget::Stderr);
        builder
    };
    builder.try_init().context("Failed to init env_logger")?;
    Ok(())
}

fn check_name(name: &str) -> Result<()> {
    if !valid_container_name(name) {
        bail!("'{name}' is not a valid container name");
    }
    Ok(())
}

/// Connect, auto-spawning the daemon first.
fn client(paths: &Paths) -> Result<DaemonClient> {
    ensure_server(paths)?;
    Ok(DaemonClient::connect(paths)?)
}

/// Make sure `name` is running, booting it when needed.
fn ensure_started(client: &DaemonClient, name: &str) -> Result<()> {
    if !client.started(name)? {
        println!("Booting '{name}'...");
        client.start(name)?;
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let paths = Paths::new()?;

    if matches!(args.command, Cmd::Server) {
        init_logging(&paths, true)?;
        return daemon::run(paths);
    }
    init_logging(&paths, false)?;

    match args.command {
        Cmd::Server => unreachable!("handled above"),
        Cmd::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Cmd::Start { name } => {
            check_name(&name)?;
            client(&paths)?.start(&name)?;
            println!("Container '{name}' is running");
        }
        Cmd::Stop { name } => {
            check_name(&name)?;
            client(&paths)?.stop(&name)?;
        }
        Cmd::Kill { name } => {
            check_name(&name)?;
            client(&paths)?.kill(&name)?;
        }
        Cmd::Shell { name } => {
            check_name(&name)?;
            let client = client(&paths)?;
            ensure_started(&client, &name)?;
            let addr = client.ssh_address(&name)?;
            interactive_session(
                "ssh",
                &paths,
                &name,
                &["-p", &addr.port.to_string()],
                &format!("{}@{}", addr.username, addr.host),
            )?;
        }
        Cmd::Sftp { name } => {
            check_name(&name)?;
            let client = client(&paths)?;
            ensure_started(&client, &name)?;
            let addr = client.ssh_address(&name)?;
            interactive_session(
                "sftp",
                &paths,
                &name,
                &["-P", &addr.port.to_string()],
                &format!("{}@{}", addr.username, addr.host),
            )?;
        }
        Cmd::Run { name, command } => {
            check_name(&name)?;
            let client = client(&paths)?;
            ensure_started(&client, &name)?;
            client.run_command(&name, &command)?;
        }
        Cmd::SendFile {
            name,
            local,
            remote,
        } => {
            check_name(&name)?;
            client(&paths)?.put_file(&name, &local, &remote)?;
        }
        Cmd::GetFile {
            name,
            remote,
            local,
        } => {
            check_name(&name)?;
            client(&paths)?.get_file(&name, &remote, &local)?;
        }
        Cmd::Install { archive, name } => {
            let name = match name {
                Some(name) => name,
                None => archive
                    .file_stem()
                    .context("archive has no file name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            check_name(&name)?;
            client(&paths)?.install(&archive, &name)?;
            println!("Installed '{name}'");
        }
        Cmd::Archive { name, out } => {
            check_name(&name)?;
            client(&paths)?.archive(&name, &out)?;
        }
        Cmd::Delete { name } => {
            check_name(&name)?;
            client(&paths)?.delete(&name)?;
        }
        Cmd::Rename { old, new } => {
            check_name(&old)?;
            check_name(&new)?;
            client(&paths)?.rename(&old, &new)?;
        }
        Cmd::List => {
            let client = client(&paths)?;
            for name in installed_containers(&paths)? {
                if client.started(&name)? {
                    println!("{name} {}", style("(running)").green());
                } else {
                    println!("{name}");
                }
            }
        }
        Cmd::SshAddress { name } => {
            check_name(&name)?;
            let addr = client(&paths)?.ssh_address(&name)?;
            println!(
                "{}:{}:{}:{}",
                addr.username, addr.password, addr.host, addr.port
            );
        }
        Cmd::Ping => {
            client(&paths)?.ping()?;
            println!("OK");
        }
        Cmd::UpdateHostkey { name } => {
            check_name(&name)?;
            client(&paths)?.update_hostkey(&name)?;
        }
        Cmd::ServerHalt => {
            DaemonClient::connect(&paths)?.server_halt()?;
        }
        Cmd::Panic => {
            DaemonClient::connect(&paths)?.panic()?;
        }
    }
    Ok(())
}

/// Hand the terminal to the system `ssh`/`sftp` with the container's key.
fn interactive_session(
    program: &str,
    paths: &Paths,
    name: &str,
    port_args: &[&str],
    destination: &str,
) -> Result<()> {
    let status = SystemCommand::new(program)
        .arg("-oStrictHostKeyChecking=no")
        .arg("-oLogLevel=ERROR")
        .arg("-oPasswordAuthentication=no")
        .arg("-i")
        .arg(paths.container_id_rsa(name))
        .args(port_args)
        .arg(destination)
        .status()
        .with_context(|| format!("failed to launch {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}; try `vmkeep update-hostkey {name}`");
    }
    Ok(())
}

fn installed_containers(paths: &Paths) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let home = paths.container_home();
    if !home.is_dir() {
        return Ok(names);
    }
    for entry in fs::read_dir(home)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() && valid_container_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("{} {e:#}", style("error:").red().bold());
        exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_collects_trailing_command() {
        let args = Args::parse_from(["vmkeep", "run", "demo", "echo", "hi", "-n"]);
        match args.command {
            Cmd::Run { name, command } => {
                assert_eq!(name, "demo");
                assert_eq!(command, vec!["echo", "hi", "-n"]);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_install_name_defaults_later() {
        let args = Args::parse_from(["vmkeep", "install", "demo.tar"]);
        match args.command {
            Cmd::Install { archive, name } => {
                assert_eq!(archive, PathBuf::from("demo.tar"));
                assert!(name.is_none());
            }
            other => panic!("expected Install, got {other:?}"),
        }
    }

    #[test]
    fn test_rename_takes_two_names() {
        let args = Args::parse_from(["vmkeep", "rename", "old", "new"]);
        match args.command {
            Cmd::Rename { old, new } => {
                assert_eq!(old, "old");
                assert_eq!(new, "new");
            }
            other => panic!("expected Rename, got {other:?}"),
        }
    }

    #[test]
    fn test_installed_containers_skips_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_home(tmp.path());
        fs::create_dir_all(paths.container_dir("demo")).unwrap();
        fs::create_dir_all(paths.container_dir("other")).unwrap();
        fs::write(paths.container_home().join("server.json"), b"{}").unwrap();
        let names = installed_containers(&paths).unwrap();
        assert_eq!(names, vec!["demo".to_string(), "other".to_string()]);
    }
}
