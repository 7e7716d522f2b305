//! Secure stream substrate: TLS over TCP using exclusively in-memory
//! certificate/key/CA material (spec §9 "Memory mode TLS" — no filesystem
//! dependency).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConnection, ServerConnection, StreamOwned};
use tracing::{debug, warn};

use super::{classify, ByteTransport, Destination, Inbound};
use crate::config::TlsMaterial;
use crate::error::{Error, Result};
use crate::sip::framing::find_complete_message;

enum Conn {
    Client(StreamOwned<ClientConnection, TcpStream>),
    Server(StreamOwned<ServerConnection, TcpStream>),
}

pub struct TlsTransport {
    conn: Conn,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    recv_buf: Vec<u8>,
    closed: bool,
}

impl TlsTransport {
    /// Connect outbound to `server`, validating its certificate against
    /// `material.ca`.
    pub fn connect(server: SocketAddr, server_name: &str, material: &TlsMaterial) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in parse_certs(&material.ca)? {
            roots
                .add(&cert)
                .map_err(|e| Error::TransportInit(format!("invalid CA cert: {e}")))?;
        }
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let name = rustls::ServerName::try_from(server_name)
            .map_err(|e| Error::TransportInit(format!("invalid tls server name: {e}")))?;
        let client = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| Error::TransportInit(format!("tls client init failed: {e}")))?;

        let stream = TcpStream::connect(server)
            .map_err(|e| Error::TransportInit(format!("tcp connect failed: {e}")))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::TransportInit(format!("tcp nonblocking failed: {e}")))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| Error::TransportInit(format!("local_addr failed: {e}")))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| Error::TransportInit(format!("peer_addr failed: {e}")))?;

        debug!(%local_addr, %peer_addr, "tls transport (client) connected");
        Ok(TlsTransport {
            conn: Conn::Client(StreamOwned::new(client, stream)),
            local_addr,
            peer_addr,
            recv_buf: Vec::new(),
            closed: false,
        })
    }

    /// Accept a single inbound TLS connection, presenting `material.cert`/
    /// `material.key` as the server identity.
    pub fn accept(local_port: u16, material: &TlsMaterial) -> Result<Self> {
        let certs = parse_certs(&material.cert)?;
        let key = parse_private_key(&material.key)?;
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TransportInit(format!("tls server config invalid: {e}")))?;

        let bind_addr: SocketAddr = format!("0.0.0.0:{local_port}")
            .parse()
            .map_err(|e| Error::TransportInit(format!("invalid bind address: {e}")))?;
        let listener = std::net::TcpListener::bind(bind_addr)
            .map_err(|e| Error::TransportInit(format!("tcp listen failed: {e}")))?;
        let (stream, peer_addr) = listener
            .accept()
            .map_err(|e| Error::TransportInit(format!("tcp accept failed: {e}")))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::TransportInit(format!("tcp nonblocking failed: {e}")))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| Error::TransportInit(format!("local_addr failed: {e}")))?;

        let server = ServerConnection::new(Arc::new(config))
            .map_err(|e| Error::TransportInit(format!("tls server init failed: {e}")))?;

        debug!(%local_addr, %peer_addr, "tls transport (server) accepted");
        Ok(TlsTransport {
            conn: Conn::Server(StreamOwned::new(server, stream)),
            local_addr,
            peer_addr,
            recv_buf: Vec::new(),
            closed: false,
        })
    }

    fn drain_complete_messages(&mut self, on_frame: &mut dyn FnMut(Inbound)) {
        while let Some(len) = find_complete_message(&self.recv_buf) {
            let message: Vec<u8> = self.recv_buf.drain(..len).collect();
            match classify(&message) {
                Some(kind) => on_frame(Inbound {
                    kind,
                    data: message,
                    from: self.peer_addr,
                }),
                None => warn!("dropping unclassifiable tls message"),
            }
        }
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<rustls::Certificate>> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::TransportInit(format!("invalid certificate PEM: {e}")))
        .map(|certs| certs.into_iter().map(rustls::Certificate).collect())
}

fn parse_private_key(pem: &[u8]) -> Result<rustls::PrivateKey> {
    let mut reader = std::io::BufReader::new(pem);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::TransportInit(format!("invalid private key PEM: {e}")))?;
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| Error::TransportInit("no private key found in PEM material".into()))
}

impl ByteTransport for TlsTransport {
    fn send(&mut self, bytes: &[u8], _dst: Option<Destination>) -> Result<usize> {
        if self.closed {
            return Err(Error::TransportClosed("tls stream already closed".into()));
        }
        let result = match &mut self.conn {
            Conn::Client(s) => s.write_all(bytes),
            Conn::Server(s) => s.write_all(bytes),
        };
        result.map_err(|e| Error::TransportSend(format!("tls send failed: {e}")))?;
        Ok(bytes.len())
    }

    fn poll(&mut self, timeout_ms: u64, on_frame: &mut dyn FnMut(Inbound)) -> Result<()> {
        if self.closed {
            return Err(Error::TransportClosed("tls stream already closed".into()));
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut chunk = [0u8; 4096];
        loop {
            let read_result = match &mut self.conn {
                Conn::Client(s) => s.read(&mut chunk),
                Conn::Server(s) => s.read(&mut chunk),
            };
            match read_result {
                Ok(0) => {
                    self.closed = true;
                    return Err(Error::TransportClosed("tls peer closed connection".into()));
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
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
                    return Err(Error::TransportClosed(format!("tls read failed: {e}")));
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
        match &mut self.conn {
            Conn::Client(s) => {
                let _ = s.sock.shutdown(std::net::Shutdown::Both);
            }
            Conn::Server(s) => {
                let _ = s.sock.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}
