//! Optional TLS upgrade for connections.
//!
//! rustls sessions are sans-IO state machines, which is exactly what a
//! readiness loop needs: socket-readable feeds `read_tls`, decrypted bytes
//! come out of the session reader, and outgoing records are pumped into the
//! connection's ordinary write buffer. The handshake advances as a side
//! effect of the same pumping; `on_connect` is only delivered once the
//! session is ready, so handler bytes are always protected.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::ConnectionError;

/// Certificate bundle for one side of a connection.
///
/// Absence of a bundle disables TLS entirely. A client bundle must carry the
/// CA used to verify the server; the certificate/key pair is optional and
/// enables mutual TLS. A server bundle must carry its certificate and key;
/// `verify_peer` additionally requires and verifies client certificates
/// against the CA.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ca_certificate: Option<PathBuf>,
    pub verify_peer: bool,
}

impl TlsConfig {
    fn load_certs(path: &PathBuf) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ConnectionError> {
        let file = std::fs::File::open(path)
            .map_err(|e| ConnectionError::Tls(format!("cannot open {}: {e}", path.display())))?;
        let mut reader = io::BufReader::new(file);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConnectionError::Tls(format!("bad certificate {}: {e}", path.display())))
    }

    fn load_key(path: &PathBuf) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ConnectionError> {
        let file = std::fs::File::open(path)
            .map_err(|e| ConnectionError::Tls(format!("cannot open {}: {e}", path.display())))?;
        let mut reader = io::BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ConnectionError::Tls(format!("bad private key {}: {e}", path.display())))?
            .ok_or_else(|| {
                ConnectionError::Tls(format!("no private key found in {}", path.display()))
            })
    }

    fn root_store(&self) -> Result<RootCertStore, ConnectionError> {
        let path = self.ca_certificate.as_ref().ok_or_else(|| {
            ConnectionError::Tls("a CA certificate is required to verify the peer".into())
        })?;
        let mut roots = RootCertStore::empty();
        for cert in Self::load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| ConnectionError::Tls(format!("bad CA certificate: {e}")))?;
        }
        Ok(roots)
    }

    /// Build the rustls client configuration for this bundle.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, ConnectionError> {
        let roots = self.root_store()?;
        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.certificate, &self.private_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(Self::load_certs(cert)?, Self::load_key(key)?)
                .map_err(|e| ConnectionError::Tls(format!("bad client certificate: {e}")))?,
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    /// Build the rustls server configuration for this bundle.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, ConnectionError> {
        let cert = self.certificate.as_ref().ok_or_else(|| {
            ConnectionError::Tls("a server certificate is required for TLS".into())
        })?;
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| ConnectionError::Tls("a server private key is required for TLS".into()))?;

        let builder = if self.verify_peer {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(self.root_store()?))
                .build()
                .map_err(|e| ConnectionError::Tls(format!("bad client verifier: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };
        let config = builder
            .with_single_cert(Self::load_certs(cert)?, Self::load_key(key)?)
            .map_err(|e| ConnectionError::Tls(format!("bad server certificate: {e}")))?;
        Ok(Arc::new(config))
    }
}

/// What one readable pass produced through the TLS layer.
#[derive(Default)]
pub(crate) struct TlsRead {
    pub plaintext: Vec<u8>,
    pub eof: bool,
    pub error: Option<ConnectionError>,
    /// The handshake finished during this pass.
    pub became_ready: bool,
}

enum Session {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

/// An in-flight TLS session layered over one connection's socket.
pub(crate) struct TlsSession {
    session: Session,
}

macro_rules! with_session {
    ($self:expr, $conn:ident => $body:expr) => {
        match &mut $self.session {
            Session::Client($conn) => $body,
            Session::Server($conn) => $body,
        }
    };
}

impl TlsSession {
    pub(crate) fn client(config: &TlsConfig, server_name: &str) -> Result<Self, ConnectionError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ConnectionError::Tls(format!("invalid server name {server_name:?}: {e}")))?;
        let conn = ClientConnection::new(config.client_config()?, name)
            .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        Ok(Self {
            session: Session::Client(Box::new(conn)),
        })
    }

    pub(crate) fn server(config: Arc<ServerConfig>) -> Result<Self, ConnectionError> {
        let conn =
            ServerConnection::new(config).map_err(|e| ConnectionError::Tls(e.to_string()))?;
        Ok(Self {
            session: Session::Server(Box::new(conn)),
        })
    }

    /// True once the handshake has completed.
    pub(crate) fn is_ready(&self) -> bool {
        match &self.session {
            Session::Client(c) => !c.is_handshaking(),
            Session::Server(s) => !s.is_handshaking(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match &self.session {
            Session::Client(c) => c.wants_write(),
            Session::Server(s) => s.wants_write(),
        }
    }

    /// Drain pending TLS records into the connection's wire buffer.
    pub(crate) fn pump_out(&mut self, wire: &mut BytesMut) -> Result<(), ConnectionError> {
        let mut sink = BufSink(wire);
        with_session!(self, conn => {
            while conn.wants_write() {
                conn.write_tls(&mut sink)
                    .map_err(|e| ConnectionError::Tls(e.to_string()))?;
            }
        });
        Ok(())
    }

    /// Feed socket-readable bytes through the session: advance the
    /// handshake, decrypt application data, and queue any response records
    /// into `wire`.
    pub(crate) fn pump_read(&mut self, io: &mut dyn Read, wire: &mut BytesMut) -> TlsRead {
        let was_ready = self.is_ready();
        let mut out = TlsRead::default();
        with_session!(self, conn => {
            loop {
                match conn.read_tls(io) {
                    Ok(0) => {
                        out.eof = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        out.error = Some(ConnectionError::Io(e));
                        break;
                    }
                }
                match conn.process_new_packets() {
                    Ok(state) => {
                        let mut pending = state.plaintext_bytes_to_read();
                        let mut chunk = [0u8; 4096];
                        while pending > 0 {
                            match conn.reader().read(&mut chunk) {
                                Ok(0) => break,
                                Ok(n) => {
                                    out.plaintext.extend_from_slice(&chunk[..n]);
                                    pending = pending.saturating_sub(n);
                                }
                                Err(_) => break,
                            }
                        }
                        if state.peer_has_closed() {
                            out.eof = true;
                            break;
                        }
                    }
                    Err(e) => {
                        out.error = Some(map_tls_error(e));
                        break;
                    }
                }
            }
        });
        // Handshake replies (and any close/alert records) must reach the
        // peer even when this pass failed.
        if let Err(e) = self.pump_out(wire) {
            out.error.get_or_insert(e);
        }
        if !was_ready && self.is_ready() && out.error.is_none() {
            out.became_ready = true;
        }
        out
    }

    /// Queue application plaintext for encrypted transmission. rustls
    /// buffers plaintext written before the handshake completes.
    pub(crate) fn queue_plaintext(
        &mut self,
        data: &[u8],
        wire: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        with_session!(self, conn => {
            conn.writer()
                .write_all(data)
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        });
        self.pump_out(wire)
    }
}

fn map_tls_error(err: rustls::Error) -> ConnectionError {
    match err {
        rustls::Error::InvalidCertificate(reason) => {
            ConnectionError::PeerVerification(format!("{reason:?}"))
        }
        other => ConnectionError::Tls(other.to_string()),
    }
}

/// `io::Write` adapter appending to a `BytesMut`.
struct BufSink<'a>(&'a mut BytesMut);

impl Write for BufSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
