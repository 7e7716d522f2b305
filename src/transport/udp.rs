//! Connectionless datagram substrate.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{classify, ByteTransport, Destination, Inbound};
use crate::error::{Error, Result};

const MAX_DATAGRAM: usize = 65_536;

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    dropped: u64,
}

impl UdpTransport {
    /// Bind a UDP socket. `local_port == 0` auto-allocates (spec §6
    /// `local_port`).
    pub fn open(local_port: u16) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{local_port}")
            .parse()
            .map_err(|e| Error::TransportInit(format!("invalid bind address: {e}")))?;
        let socket = UdpSocket::bind(addr)
            .map_err(|e| Error::TransportInit(format!("udp bind failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::TransportInit(format!("udp nonblocking failed: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::TransportInit(format!("udp local_addr failed: {e}")))?;
        debug!(%local_addr, "udp transport bound");
        Ok(UdpTransport {
            socket,
            local_addr,
            dropped: 0,
        })
    }

    /// Count of inbound frames that matched no known classification.
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped
    }
}

impl ByteTransport for UdpTransport {
    fn send(&mut self, bytes: &[u8], dst: Option<Destination>) -> Result<usize> {
        let dst = dst.ok_or_else(|| {
            Error::TransportSend("udp send requires an explicit destination".into())
        })?;
        self.socket
            .send_to(bytes, dst)
            .map_err(|e| Error::TransportSend(format!("udp send failed: {e}")))
    }

    fn poll(&mut self, timeout_ms: u64, on_frame: &mut dyn FnMut(Inbound)) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => match classify(&buf[..n]) {
                    Some(kind) => {
                        trace!(?kind, %from, len = n, "udp frame classified");
                        on_frame(Inbound {
                            kind,
                            data: buf[..n].to_vec(),
                            from,
                        });
                    }
                    None => {
                        self.dropped += 1;
                        warn!(%from, len = n, "dropping unclassifiable udp frame");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(1).min(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                }
                Err(e) => {
                    return Err(Error::TransportSend(format!("udp recv failed: {e}")));
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
        // UdpSocket has no explicit close; dropping releases the fd. Nothing
        // to do here beyond documenting the contract.
    }
}
