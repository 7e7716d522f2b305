//! Connection-oriented stream substrate. SIP messages are delimited by the
//! `Content-Length` header per spec §4.4 ("SIP message framing accepts
//! either UDP datagram boundary or TCP/TLS Content-Length framing").

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{classify, ByteTransport, Destination, FrameKind, Inbound};
use crate::error::{Error, Result};
use crate::sip::framing::find_complete_message;

pub struct TcpTransport {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    /// Listener kept alive only on the server side; `None` for an outbound
    /// connection.
    accept_buf: Vec<u8>,
    closed: bool,
}

impl TcpTransport {
    /// Connect outbound to `server`.
    pub fn connect(local_port: u16, server: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = format!("0.0.0.0:{local_port}")
            .parse()
            .map_err(|e| Error::TransportInit(format!("invalid bind address: {e}")))?;
        let stream = {
            let socket = std::net::TcpListener::bind(bind_addr)
                .map_err(|e| Error::TransportInit(format!("tcp local bind failed: {e}")))?;
            drop(socket);
            TcpStream::connect(server)
                .map_err(|e| Error::TransportInit(format!("tcp connect failed: {e}")))?
        };
        Self::from_stream(stream)
    }

    /// Accept a single inbound connection on `local_port` (a minimal server
    /// mode sufficient for a user agent that expects one registrar/peer
    /// connection at a time).
    pub fn accept(local_port: u16) -> Result<Self> {
        let bind_addr: SocketAddr = format!("0.0.0.0:{local_port}")
            .parse()
            .map_err(|e| Error::TransportInit(format!("invalid bind address: {e}")))?;
        let listener = TcpListener::bind(bind_addr)
            .map_err(|e| Error::TransportInit(format!("tcp listen failed: {e}")))?;
        let (stream, _peer) = listener
            .accept()
            .map_err(|e| Error::TransportInit(format!("tcp accept failed: {e}")))?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::TransportInit(format!("tcp nonblocking failed: {e}")))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| Error::TransportInit(format!("tcp local_addr failed: {e}")))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| Error::TransportInit(format!("tcp peer_addr failed: {e}")))?;
        debug!(%local_addr, %peer_addr, "tcp transport connected");
        Ok(TcpTransport {
            stream,
            local_addr,
            peer_addr,
            accept_buf: Vec::new(),
            closed: false,
        })
    }
}

impl ByteTransport for TcpTransport {
    fn send(&mut self, bytes: &[u8], _dst: Option<Destination>) -> Result<usize> {
        if self.closed {
            return Err(Error::TransportClosed("tcp stream already closed".into()));
        }
        self.stream
            .write_all(bytes)
            .map_err(|e| Error::TransportSend(format!("tcp send failed: {e}")))?;
        Ok(bytes.len())
    }

    fn poll(&mut self, timeout_ms: u64, on_frame: &mut dyn FnMut(Inbound)) -> Result<()> {
        if self.closed {
            return Err(Error::TransportClosed("tcp stream already closed".into()));
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::TransportClosed("tcp peer closed connection".into()));
                }
                Ok(n) => {
                    self.accept_buf.extend_from_slice(&chunk[..n]);
                    self.drain_complete_messages(on_frame);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    self.closed = true;
                    return Err(Error::TransportClosed(format!("tcp read failed: {e}")));
                }
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
        }
    }

    fn local_address(&self) -> Destination {
        self.local_addr
    }

    fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl TcpTransport {
    fn drain_complete_messages(&mut self, on_frame: &mut dyn FnMut(Inbound)) {
        while let Some(len) = find_complete_message(&self.accept_buf) {
            let message: Vec<u8> = self.accept_buf.drain(..len).collect();
            match classify(&message) {
                Some(kind) => on_frame(Inbound {
                    kind,
                    data: message,
                    from: self.peer_addr,
                }),
                None => warn!("dropping unclassifiable tcp message"),
            }
        }
    }
}
