use std::io::{self, Read, Write};

use thiserror::Error;

/// First message on every accepted connection.
pub const READY: &[u8] = b"READY";
/// Pacing message between fields of a multi-field request.
pub const CONT: &[u8] = b"CONT";
/// Successful conclusion of a request.
pub const OK: &[u8] = b"OK";
/// Server reply announcing the streaming sub-protocol.
pub const BEGIN: &[u8] = b"BEGIN";
/// Affirmative reply to `STARTED`.
pub const YES: &[u8] = b"YES";
/// Negative reply to `STARTED`.
pub const NO: &[u8] = b"NO";

/// Largest frame either side will accept. Requests carry keywords, names and
/// paths, never file contents, so anything bigger is a framing bug.
const MAX_FRAME: u32 = 1 << 20;

/// A request that ended in a typed server-side error keyword.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The request keyword is not in the dispatch table.
    #[error("unknown request '{0}'")]
    UnknownRequest(String),
    /// The named container exists but is not running.
    #[error("container '{0}' is not started")]
    ContainerNotStarted(String),
    /// No container directory with that name.
    #[error("no such container '{0}'")]
    NoSuchContainer(String),
    /// The operation requires the container to be stopped first.
    #[error("container '{0}' is started and cannot be modified")]
    ContainerStartedCannotModify(String),
    /// The container's QEMU process never reached a usable state.
    #[error("container failed to boot")]
    BootFailure,
    /// A path argument does not name a usable file.
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    /// A file operation hit a directory.
    #[error("'{0}' is a directory")]
    IsADirectory(String),
    /// The handler failed in a way it could not classify.
    #[error("an exception occurred on the server")]
    Exception,
}

impl RequestError {
    /// The wire keyword for this error.
    pub fn keyword(&self) -> &'static [u8] {
        match self {
            RequestError::UnknownRequest(_) => b"UNKNOWN_REQUEST",
            RequestError::ContainerNotStarted(_) => b"CONTAINER_NOT_STARTED",
            RequestError::NoSuchContainer(_) => b"NO_SUCH_CONTAINER",
            RequestError::ContainerStartedCannotModify(_) => b"CONTAINER_STARTED_CANNOT_MODIFY",
            RequestError::BootFailure => b"BOOT_FAILURE",
            RequestError::InvalidPath(_) => b"INVALID_PATH",
            RequestError::IsADirectory(_) => b"IS_A_DIRECTORY",
            RequestError::Exception => b"EXCEPTION_OCCURED",
        }
    }

    /// The parameter sent after the keyword, if this kind carries one.
    pub fn param(&self) -> Option<&str> {
        match self {
            RequestError::UnknownRequest(p)
            | RequestError::ContainerNotStarted(p)
            | RequestError::NoSuchContainer(p)
            | RequestError::ContainerStartedCannotModify(p)
            | RequestError::InvalidPath(p)
            | RequestError::IsADirectory(p) => Some(p),
            RequestError::BootFailure | RequestError::Exception => None,
        }
    }

    /// Rebuild the error from its keyword and (already fetched) parameter.
    fn from_wire(keyword: &[u8], param: Option<String>) -> Option<Self> {
        let param = param.unwrap_or_default();
        Some(match keyword {
            b"UNKNOWN_REQUEST" => RequestError::UnknownRequest(param),
            b"CONTAINER_NOT_STARTED" => RequestError::ContainerNotStarted(param),
            b"NO_SUCH_CONTAINER" => RequestError::NoSuchContainer(param),
            b"CONTAINER_STARTED_CANNOT_MODIFY" => {
                RequestError::ContainerStartedCannotModify(param)
            }
            b"BOOT_FAILURE" => RequestError::BootFailure,
            b"INVALID_PATH" => RequestError::InvalidPath(param),
            b"IS_A_DIRECTORY" => RequestError::IsADirectory(param),
            b"EXCEPTION_OCCURED" => RequestError::Exception,
            _ => return None,
        })
    }

    fn keyword_has_param(keyword: &[u8]) -> bool {
        !matches!(keyword, b"BOOT_FAILURE" | b"EXCEPTION_OCCURED")
    }
}

/// Anything that can go wrong on the framed socket.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The server concluded the exchange with an error keyword.
    #[error(transparent)]
    Server(#[from] RequestError),
    /// The peer sent something the exchange script does not allow here.
    #[error("unexpected message '{0}'")]
    Unexpected(String),
    /// The peer announced a frame larger than [`MAX_FRAME`].
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(u32),
}

/// Length-prefixed message framing over any byte stream.
///
/// The transport only needs to move bytes; a loopback TCP stream in
/// production, an in-memory pair in tests.
pub struct MessageStream<S> {
    inner: S,
}

impl<S: Read + Write> MessageStream<S> {
    /// Wrap a connected transport.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Send one framed message.
    pub fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let len = u32::try_from(msg.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(msg)?;
        self.inner.flush()
    }

    /// Receive one framed message.
    pub fn recv(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut len = [0u8; 4];
        self.inner.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len);
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Receive one message and require valid UTF-8.
    pub fn recv_str(&mut self) -> Result<String, ProtocolError> {
        let msg = self.recv()?;
        String::from_utf8(msg)
            .map_err(|e| ProtocolError::Unexpected(String::from_utf8_lossy(e.as_bytes()).into()))
    }

    /// Receive a reply, decoding server error keywords into typed errors
    /// (fetching the parameter where the keyword carries one).
    pub fn recv_reply(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let msg = self.recv()?;
        if RequestError::from_wire(&msg, None).is_some() {
            let param = if RequestError::keyword_has_param(&msg) {
                self.send(CONT)?;
                Some(self.recv_str()?)
            } else {
                None
            };
            // from_wire cannot fail here, the keyword was just matched
            return Err(RequestError::from_wire(&msg, param).unwrap().into());
        }
        Ok(msg)
    }

    /// Require the next message to be exactly `expected`.
    ///
    /// Anything else is decoded as a server error keyword or reported as
    /// unexpected.
    pub fn recv_expect(&mut self, expected: &[u8]) -> Result<(), ProtocolError> {
        let msg = self.recv_reply()?;
        if msg == expected {
            return Ok(());
        }
        Err(ProtocolError::Unexpected(
            String::from_utf8_lossy(&msg).into(),
        ))
    }

    /// Server side: pace the client with `CONT`, then take the next field.
    pub fn field(&mut self) -> Result<String, ProtocolError> {
        self.send(CONT)?;
        self.recv_str()
    }

    /// Client side: wait for `CONT`, then send the next field.
    pub fn send_field(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.recv_expect(CONT)?;
        self.send(data)?;
        Ok(())
    }

    /// Server side: conclude the exchange with a typed error, including the
    /// parameter round trip for kinds that carry one.
    pub fn send_error(&mut self, err: &RequestError) -> Result<(), ProtocolError> {
        self.send(err.keyword())?;
        if let Some(param) = err.param() {
            self.recv_expect(CONT)?;
            self.send(param.as_bytes())?;
        }
        Ok(())
    }

    /// Unwrap the transport, e.g. to hand the connection to the streaming
    /// sub-protocol.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Borrow the transport.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn socket_pair() -> (MessageStream<TcpStream>, MessageStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (MessageStream::new(server), MessageStream::new(client))
    }

    #[test]
    fn test_send_recv_round_trip() {
        let (mut server, mut client) = socket_pair();
        server.send(READY).unwrap();
        client.recv_expect(READY).unwrap();
        client.send(b"PING").unwrap();
        assert_eq!(server.recv().unwrap(), b"PING");
        server.send(OK).unwrap();
        client.recv_expect(OK).unwrap();
    }

    #[test]
    fn test_empty_and_binary_payloads() {
        let (mut server, mut client) = socket_pair();
        client.send(b"").unwrap();
        assert_eq!(server.recv().unwrap(), b"");
        client.send(&[0u8, 255, 7]).unwrap();
        assert_eq!(server.recv().unwrap(), vec![0u8, 255, 7]);
    }

    #[test]
    fn test_error_with_param_round_trips() {
        let (mut server, mut client) = socket_pair();
        let handle = thread::spawn(move || {
            server
                .send_error(&RequestError::NoSuchContainer("demo".into()))
                .unwrap();
        });
        let err = client.recv_expect(OK).unwrap_err();
        handle.join().unwrap();
        match err {
            ProtocolError::Server(RequestError::NoSuchContainer(name)) => {
                assert_eq!(name, "demo");
            }
            other => panic!("expected NoSuchContainer, got {other:?}"),
        }
    }

    #[test]
    fn test_error_without_param() {
        let (mut server, mut client) = socket_pair();
        server.send_error(&RequestError::BootFailure).unwrap();
        let err = client.recv_expect(OK).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Server(RequestError::BootFailure)
        ));
    }

    #[test]
    fn test_unexpected_message_is_not_an_error_keyword() {
        let (mut server, mut client) = socket_pair();
        server.send(b"GIBBERISH").unwrap();
        let err = client.recv_expect(OK).unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected(_)));
    }

    #[test]
    fn test_field_pacing() {
        let (mut server, mut client) = socket_pair();
        let handle = thread::spawn(move || server.field().unwrap());
        client.send_field(b"demo").unwrap();
        assert_eq!(handle.join().unwrap(), "demo");
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let (mut server, client) = socket_pair();
        let mut raw = client.into_inner();
        raw.write_all(&(MAX_FRAME + 1).to_be_bytes()).unwrap();
        let err = server.recv().unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn test_every_error_keyword_round_trips() {
        let cases = [
            RequestError::UnknownRequest("X".into()),
            RequestError::ContainerNotStarted("a".into()),
            RequestError::NoSuchContainer("b".into()),
            RequestError::ContainerStartedCannotModify("c".into()),
            RequestError::BootFailure,
            RequestError::InvalidPath("/p".into()),
            RequestError::IsADirectory("/d".into()),
            RequestError::Exception,
        ];
        for case in cases {
            let (mut server, mut client) = socket_pair();
            let sent = case.clone();
            let handle = thread::spawn(move || server.send_error(&sent).unwrap());
            let err = client.recv_expect(OK).unwrap_err();
            handle.join().unwrap();
            match err {
                ProtocolError::Server(decoded) => assert_eq!(decoded, case),
                other => panic!("expected server error, got {other:?}"),
            }
        }
    }
}
