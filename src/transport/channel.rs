//! Point-to-point channel to the supervised simulator.
//!
//! The shim side owns the socket: a listener is bound under the device
//! directory when the launch is requested, and the simulator connects
//! to it. The peer is accepted lazily on the first call so that channel
//! creation never blocks (a channel object exists even in dont-run
//! mode, where the peer may arrive much later or never).
//!
//! One call is one request frame answered by one response frame; an
//! internal lock keeps concurrent callers from interleaving frames.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use super::calls::{DecodeError, Request, Response};
use super::frame::{read_frame, write_frame};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed response: {0}")]
    Decode(#[from] DecodeError),
    #[error("call {0} not acknowledged by simulator")]
    Nack(&'static str),
    #[error("unexpected response variant for {0}")]
    UnexpectedResponse(&'static str),
}

#[derive(Debug)]
struct ChannelState {
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
}

/// A connected or connectable simulator channel.
#[derive(Debug)]
pub struct Channel {
    state: Mutex<ChannelState>,
    path: Option<PathBuf>,
}

impl Channel {
    /// Bind a listening socket at `path`; the simulator connects to it.
    ///
    /// A stale socket file from a previous run is removed first.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path)?;
        log::debug!("channel listening at {}", path.display());
        Ok(Self {
            state: Mutex::new(ChannelState { listener: Some(listener), stream: None }),
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already-connected stream. Used when the peer is set up by
    /// the caller, and by tests driving a stub simulator over a socket
    /// pair.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            state: Mutex::new(ChannelState { listener: None, stream: Some(stream) }),
            path: None,
        }
    }

    /// Socket path of a bound channel.
    pub fn socket_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether a peer has been accepted yet.
    pub fn is_connected(&self) -> bool {
        self.state.lock().expect("channel lock poisoned").stream.is_some()
    }

    /// Issue one call and wait for its response.
    ///
    /// Blocks until the simulator has connected when no peer was
    /// accepted yet.
    pub fn call(&self, request: &Request) -> Result<Response, ChannelError> {
        let mut state = self.state.lock().expect("channel lock poisoned");

        if state.stream.is_none() {
            let listener = state.listener.as_ref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "channel has no listener and no peer")
            })?;
            log::info!("waiting for simulator to connect");
            let (stream, _) = listener.accept()?;
            state.stream = Some(stream);
        }

        let stream = state.stream.as_mut().expect("peer accepted above");
        let (opcode, payload) = request.encode();
        write_frame(stream, opcode, &payload)?;
        let (resp_opcode, resp_payload) = read_frame(stream)?;
        Ok(Response::decode(resp_opcode, &resp_payload)?)
    }

    /// Drop the peer connection and remove the socket file.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("channel lock poisoned");
        state.stream = None;
        state.listener = None;
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn call_over_socket_pair() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = Channel::from_stream(ours);

        let peer = thread::spawn(move || {
            let mut stream = theirs;
            let (opcode, payload) = read_frame(&mut stream).unwrap();
            let request = Request::decode(opcode, &payload).unwrap();
            assert_eq!(request, Request::FreeBuffer { addr: 0x1000 });
            let (opcode, payload) = Response::Ack(true).encode();
            write_frame(&mut stream, opcode, &payload).unwrap();
        });

        let response = channel.call(&Request::FreeBuffer { addr: 0x1000 }).unwrap();
        assert_eq!(response, Response::Ack(true));
        peer.join().unwrap();
    }

    #[test]
    fn bound_channel_accepts_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.sock");
        let channel = Channel::bind(&path).unwrap();
        assert!(!channel.is_connected());
        assert_eq!(channel.socket_path(), Some(path.as_path()));

        let connect_path = path.clone();
        let peer = thread::spawn(move || {
            let mut stream = UnixStream::connect(&connect_path).unwrap();
            let (opcode, payload) = read_frame(&mut stream).unwrap();
            assert!(Request::decode(opcode, &payload).is_ok());
            let (opcode, payload) = Response::Value(99).encode();
            write_frame(&mut stream, opcode, &payload).unwrap();
        });

        let response = channel.call(&Request::CreateQueue { write: true }).unwrap();
        assert_eq!(response, Response::Value(99));
        assert!(channel.is_connected());
        peer.join().unwrap();

        channel.shutdown();
        assert!(!path.exists());
    }
}
