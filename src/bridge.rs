//! The post-`BEGIN` streaming sub-protocol behind `RUN-COMMAND`.
//!
//! Client to server: length-prefixed chunks `[len:1][payload:len]` sourced
//! from the client's stdin; an empty chunk is a keepalive. Server to client:
//! fixed two-byte frames `[stream:1][byte:1]` where stream 0 is keepalive,
//! 1 stdout, 2 stderr. The byte-at-a-time format is kept for strict wire
//! compatibility; writes are serialized behind a mutex so frames never tear.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::ssh::{Exec, SshSession};

/// Server-to-client stream id for keepalives.
const STREAM_KEEPALIVE: u8 = 0x00;
/// Server-to-client stream id for guest stdout.
const STREAM_STDOUT: u8 = 0x01;
/// Server-to-client stream id for guest stderr.
const STREAM_STDERR: u8 = 0x02;

/// Largest client-to-server chunk; the length field is one byte.
const MAX_CHUNK: usize = 255;
/// Poll tick for stdin and non-blocking channel reads.
const POLL_TICK: Duration = Duration::from_millis(100);
/// Keepalive cadence on both sides.
const KEEPALIVE_EVERY: Duration = Duration::from_secs(1);

/// Stream id libssh2 assigns to stderr within a channel.
const SSH_STDERR_STREAM: i32 = 1;

/// Server half: pump one guest process between its SSH channel and the
/// connected client until either side goes away.
///
/// Three workers run per bridge: a stdout pump, a stderr pump and a
/// keepalive pump; the calling thread relays client chunks into the guest's
/// stdin. The channel is non-blocking and lives behind a mutex, so every
/// worker holds the lock for exactly one libssh2 call at a time. However
/// the bridge ends, the guest process is signalled so it cannot linger
/// after its client disconnects.
pub fn serve(stream: TcpStream, exec: Exec, session: &SshSession) -> io::Result<()> {
    stream.set_read_timeout(Some(POLL_TICK))?;
    let writer = Mutex::new(stream.try_clone()?);
    let stop = AtomicBool::new(false);
    let stdout_done = AtomicBool::new(false);
    let stderr_done = AtomicBool::new(false);
    let pid = exec.pid;
    let channel = &exec.channel;

    thread::scope(|s| {
        s.spawn(|| {
            pump_stream(channel, 0, STREAM_STDOUT, &writer, &stop);
            stdout_done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            pump_stream(channel, SSH_STDERR_STREAM, STREAM_STDERR, &writer, &stop);
            stderr_done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            let mut last = Instant::now();
            loop {
                let drained = stdout_done.load(Ordering::SeqCst)
                    && stderr_done.load(Ordering::SeqCst);
                if stop.load(Ordering::SeqCst) || drained {
                    break;
                }
                if last.elapsed() >= KEEPALIVE_EVERY {
                    let mut w = writer.lock().unwrap();
                    if w.write_all(&[STREAM_KEEPALIVE, 0]).is_err() {
                        stop.store(true, Ordering::SeqCst);
                        break;
                    }
                    let _ = w.flush();
                    last = Instant::now();
                }
                thread::sleep(POLL_TICK);
            }
        });

        // Relay client chunks into the guest's stdin.
        let mut reader = &stream;
        loop {
            let drained =
                stdout_done.load(Ordering::SeqCst) && stderr_done.load(Ordering::SeqCst);
            if stop.load(Ordering::SeqCst) || drained {
                break;
            }
            let mut len = [0u8; 1];
            match reader.read(&mut len) {
                Ok(0) => break,
                Ok(_) => {
                    let len = len[0] as usize;
                    if len == 0 {
                        continue;
                    }
                    let mut payload = vec![0u8; len];
                    if read_fully(&mut reader, &mut payload, &stop).is_err() {
                        break;
                    }
                    if write_stdin(channel, &payload, &stop).is_err() {
                        break;
                    }
                }
                Err(e) if would_block(&e) => continue,
                Err(_) => break,
            }
        }
        stop.store(true, Ordering::SeqCst);
    });

    // The client is gone or the process drained: make sure the guest side
    // does not linger.
    if let Err(e) = session.run(&format!("kill -9 {pid}")) {
        debug!("reaping guest pid {pid} failed: {e}");
    }
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// Forward every byte of one channel stream as two-byte frames.
///
/// The channel lock is held only across the single non-blocking read, never
/// while writing to the client socket.
fn pump_stream(
    channel: &Mutex<ssh2::Channel>,
    ssh_stream: i32,
    frame_id: u8,
    writer: &Mutex<TcpStream>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 4096];
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let read = {
            let guard = channel.lock().unwrap();
            let mut src = guard.stream(ssh_stream);
            src.read(&mut buf)
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let mut w = writer.lock().unwrap();
                for &byte in &buf[..n] {
                    if w.write_all(&[frame_id, byte]).is_err() {
                        stop.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                let _ = w.flush();
            }
            Err(e) if would_block(&e) => thread::sleep(Duration::from_millis(20)),
            Err(_) => break,
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// `read_exact` over a stream with a read timeout set.
fn read_fully<R: Read>(src: &mut R, buf: &mut [u8], stop: &AtomicBool) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if stop.load(Ordering::SeqCst) {
            return Err(ErrorKind::Interrupted.into());
        }
        match src.read(&mut buf[filled..]) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if would_block(&e) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// `write_all` of a stdin chunk against the non-blocking channel, taking
/// the lock once per attempt so the output pumps stay interleaved.
fn write_stdin(
    channel: &Mutex<ssh2::Channel>,
    buf: &[u8],
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        if stop.load(Ordering::SeqCst) {
            return Err(ErrorKind::Interrupted.into());
        }
        let result = {
            let guard = channel.lock().unwrap();
            let mut stdin = guard.stream(0);
            stdin.write(&buf[written..])
        };
        match result {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if would_block(&e) => thread::sleep(Duration::from_millis(10)),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Client half: bridge the local stdin/stdout/stderr to the server until the
/// connection ends.
///
/// Returns `Ok` when the server closed the stream cleanly at a frame
/// boundary, `Err` otherwise. The guest's own exit status is not carried by
/// the protocol.
pub fn run_client<R>(
    stream: TcpStream,
    input: R,
    out: &mut (impl Write + Send),
    err: &mut (impl Write + Send),
) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    let mut writer = stream.try_clone()?;
    let done = AtomicBool::new(false);

    // Stdin is read on its own thread; the sender below paces and frames it.
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut input = input;
        let mut buf = [0u8; MAX_CHUNK];
        loop {
            match input.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut result = Ok(());
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut reader = &stream;
            let outcome = pump_frames(&mut reader, out, err);
            done.store(true, Ordering::SeqCst);
            outcome
        });

        let mut last_send = Instant::now();
        loop {
            if done.load(Ordering::SeqCst) {
                break;
            }
            let chunk = match rx.recv_timeout(POLL_TICK) {
                Ok(chunk) => Some(chunk),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    // Local stdin is closed; stay connected for output and
                    // keep the link alive.
                    thread::sleep(POLL_TICK);
                    None
                }
            };
            let failed = match chunk {
                Some(chunk) => chunk.chunks(MAX_CHUNK).any(|part| {
                    last_send = Instant::now();
                    write_chunk(&mut writer, part).is_err()
                }),
                None if last_send.elapsed() >= KEEPALIVE_EVERY => {
                    last_send = Instant::now();
                    write_chunk(&mut writer, &[]).is_err()
                }
                None => false,
            };
            if failed {
                break;
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
        result = reader.join().unwrap_or_else(|_| Err(ErrorKind::Other.into()));
    });
    result
}

/// Emit one client-to-server chunk frame.
fn write_chunk<W: Write>(dst: &mut W, payload: &[u8]) -> io::Result<()> {
    debug_assert!(payload.len() <= MAX_CHUNK);
    dst.write_all(&[payload.len() as u8])?;
    dst.write_all(payload)?;
    dst.flush()
}

/// Decode two-byte frames onto the local stdout/stderr until EOF.
///
/// A clean close at a frame boundary is `Ok`; a half frame or transport
/// error is not.
fn pump_frames<R: Read>(
    src: &mut R,
    out: &mut impl Write,
    err: &mut impl Write,
) -> io::Result<()> {
    loop {
        let mut frame = [0u8; 2];
        match src.read(&mut frame[..1]) {
            Ok(0) => return Ok(()),
            Ok(_) => (),
            Err(e) if would_block(&e) => continue,
            Err(e) => return Err(e),
        }
        src.read_exact(&mut frame[1..])?;
        match frame[0] {
            STREAM_KEEPALIVE => (),
            STREAM_STDOUT => {
                out.write_all(&frame[1..])?;
                out.flush()?;
            }
            STREAM_STDERR => {
                err.write_all(&frame[1..])?;
                err.flush()?;
            }
            other => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown stream id {other}"),
                ))
            }
        }
    }
}
