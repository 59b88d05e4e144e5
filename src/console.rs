//! Serial-console expect engine for the boot handshake.
//!
//! QEMU runs with its serial port on stdio; a reader thread mirrors every
//! byte into the boot log while `expect` scans for the next anchor string.

use std::fs::File;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use thiserror::Error;

/// Poll granularity while waiting for console output.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Substrings in the boot transcript that identify a failure cause.
/// First match wins; anything unmatched is an unknown exit.
const FAILURE_PATTERNS: &[(&str, BootFailure)] = &[
    (
        "Could not set up host forwarding rule",
        BootFailure::PortCollision,
    ),
    ("Address already in use", BootFailure::PortCollision),
    ("Permission denied", BootFailure::Permission),
];

/// Classified reasons a boot attempt did not reach the login prompt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootFailure {
    /// The allocated host port was taken before QEMU could bind it.
    /// Retried internally with a fresh port.
    #[error("host port was taken before QEMU could bind it")]
    PortCollision,
    /// Ports kept colliding until the retry budget ran out.
    #[error("address already in use")]
    AddressInUse,
    /// QEMU was refused access to a resource it needs.
    #[error("permission denied while starting QEMU")]
    Permission,
    /// QEMU went away for a reason the transcript does not explain.
    #[error("QEMU exited without reaching a login prompt: {0}")]
    UnknownExit(String),
}

/// Why an `expect` call gave up.
#[derive(Debug, Error)]
pub(crate) enum ExpectError {
    #[error("timed out after {timeout:?} waiting for {pattern:?}")]
    Timeout {
        pattern: String,
        timeout: Duration,
    },
    #[error("console closed while waiting for {pattern:?}")]
    Eof { pattern: String },
}

pub(crate) struct Console<W: Write = ChildStdin> {
    stdin: W,
    rx: Receiver<Vec<u8>>,
    log: File,
    transcript: Vec<u8>,
    /// Transcript offset the next `expect` starts scanning from.
    scanned: usize,
}

impl Console<ChildStdin> {
    /// Take over a freshly spawned QEMU child's stdio.
    ///
    /// Both stdout and stderr feed the transcript: QEMU reports startup
    /// problems on stderr while the guest serial console rides stdout.
    pub fn attach(child: &mut Child, log: File) -> Result<Self> {
        let stdin = child.stdin.take().context("qemu stdin was not piped")?;
        let stdout = child.stdout.take().context("qemu stdout was not piped")?;
        let stderr = child.stderr.take().context("qemu stderr was not piped")?;

        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        thread::spawn(move || reader_thread(stdout, tx));
        thread::spawn(move || reader_thread(stderr, err_tx));
        Ok(Self {
            stdin,
            rx,
            log,
            transcript: Vec::new(),
            scanned: 0,
        })
    }
}

impl<W: Write> Console<W> {
    #[cfg_attr(not(test), allow(dead_code))]
    fn from_parts<R: Read + Send + 'static>(stdin: W, output: R, log: File) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || reader_thread(output, tx));
        Self {
            stdin,
            rx,
            log,
            transcript: Vec::new(),
            scanned: 0,
        }
    }

    /// Wait until `pattern` shows up in the console output.
    ///
    /// Successive calls resume scanning after the previous match, so a
    /// login conversation can be driven anchor by anchor.
    pub fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<(), ExpectError> {
        let deadline = Instant::now() + timeout;
        let mut closed = false;
        loop {
            if let Some(pos) = find(&self.transcript[self.scanned..], pattern.as_bytes()) {
                self.scanned += pos + pattern.len();
                return Ok(());
            }
            if closed {
                return Err(ExpectError::Eof {
                    pattern: pattern.to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(ExpectError::Timeout {
                    pattern: pattern.to_string(),
                    timeout,
                });
            }
            match self.rx.recv_timeout(POLL_TICK) {
                Ok(chunk) => {
                    let _ = self.log.write_all(&chunk);
                    let _ = self.log.flush();
                    self.transcript.extend_from_slice(&chunk);
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => closed = true,
            }
        }
    }

    /// Type one line into the guest console.
    pub fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    /// Everything the console has produced so far.
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// Drain remaining output into the transcript and log.
    ///
    /// Two passes with a short wait in between, since the readers may still
    /// be flushing the child's final output when the child goes away.
    pub fn drain(&mut self) {
        for pass in 0..2 {
            while let Ok(chunk) = self.rx.try_recv() {
                let _ = self.log.write_all(&chunk);
                self.transcript.extend_from_slice(&chunk);
            }
            if pass == 0 {
                thread::sleep(Duration::from_millis(200));
            }
        }
        let _ = self.log.flush();
    }
}

impl<W: Write + Send + 'static> Console<W> {
    /// Hand the console to a background thread that keeps mirroring output
    /// into the log for the rest of the VM's life.
    ///
    /// Without a consumer the guest would eventually block writing to its
    /// serial port once the pipe buffer fills.
    pub fn into_logger(self) {
        let mut log = self.log;
        let rx = self.rx;
        // Dropping stdin would send the console getty an EOF.
        let _stdin = self.stdin;
        thread::spawn(move || {
            let _stdin = _stdin;
            while let Ok(chunk) = rx.recv() {
                let _ = log.write_all(&chunk);
                let _ = log.flush();
            }
        });
    }
}

/// Decide why a boot attempt failed from its transcript.
pub(crate) fn classify(transcript: &[u8]) -> BootFailure {
    let text = String::from_utf8_lossy(transcript);
    for (pattern, failure) in FAILURE_PATTERNS {
        if text.contains(pattern) {
            return failure.clone();
        }
    }
    let tail = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("<no output>")
        .trim()
        .to_string();
    BootFailure::UnknownExit(tail)
}

fn reader_thread<R: Read>(mut output: R, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match output.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
