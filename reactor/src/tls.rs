//! TLS layering over a reactor session.
//!
//! A [`TlsSession`] wraps a plain session with a rustls connection and
//! shuttles bytes between the channel and the TLS state machine on the
//! session's own worker thread. Application data gates stay shut until the
//! handshake completes, so a handler wrapped in [`TlsHandler`] only ever
//! sees decrypted traffic.

use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::{debug, trace};

use crate::error::ReactorError;
use crate::handler::IoHandler;
use crate::interest::EventMask;
use crate::session::Session;

/// Progress of the TLS layer on one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// Created but not yet bound to the session
    NotInitialized,
    /// Handshake in progress; application gates shut
    Handshaking,
    /// Handshake complete; application data flows
    AppData,
    /// close_notify sent, draining outbound records
    Closing,
    /// TLS layer torn down
    Closed,
}

/// Which side of the handshake this session plays.
#[derive(Clone)]
pub enum TlsMode {
    /// Initiate the handshake against `server_name`.
    Client {
        /// Client-side TLS configuration
        config: Arc<ClientConfig>,
        /// Name presented for certificate verification (SNI)
        server_name: ServerName<'static>,
    },
    /// Answer handshakes with the server configuration.
    Server {
        /// Server-side TLS configuration
        config: Arc<ServerConfig>,
    },
}

struct TlsCore {
    conn: Connection,
    status: TlsStatus,
    app_in: BytesMut,
    inbound_done: bool,
    outbound_done: bool,
    ready_notified: bool,
}

/// The TLS state machine layered over one session.
pub struct TlsSession {
    session: Session,
    core: Mutex<TlsCore>,
}

fn tls_io_err(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl TlsSession {
    /// Creates the TLS layer for `session` without touching the channel.
    pub fn new(session: Session, mode: &TlsMode) -> Result<TlsSession, ReactorError> {
        let conn = match mode {
            TlsMode::Client {
                config,
                server_name,
            } => Connection::Client(
                ClientConnection::new(config.clone(), server_name.clone())
                    .map_err(|err| ReactorError::Tls(err.to_string()))?,
            ),
            TlsMode::Server { config } => Connection::Server(
                ServerConnection::new(config.clone())
                    .map_err(|err| ReactorError::Tls(err.to_string()))?,
            ),
        };
        Ok(TlsSession {
            session,
            core: Mutex::new(TlsCore {
                conn,
                status: TlsStatus::NotInitialized,
                app_in: BytesMut::new(),
                inbound_done: false,
                outbound_done: false,
                ready_notified: false,
            }),
        })
    }

    /// Starts the handshake by requesting both readiness kinds.
    pub fn bind(&self) {
        {
            let mut core = self.core.lock();
            if core.status != TlsStatus::NotInitialized {
                return;
            }
            core.status = TlsStatus::Handshaking;
        }
        self.session
            .set_event_mask(EventMask::READ | EventMask::WRITE);
    }

    /// Current TLS progress.
    pub fn status(&self) -> TlsStatus {
        self.core.lock().status
    }

    /// Pulls ciphertext off the channel and advances the state machine.
    pub fn inbound_transport(&self) -> io::Result<()> {
        let mut core = self.core.lock();
        if core.status == TlsStatus::Closed {
            return Ok(());
        }
        loop {
            let read = {
                let mut channel = self.session.channel();
                core.conn.read_tls(&mut channel)
            };
            match read {
                Ok(0) => {
                    core.inbound_done = true;
                    break;
                }
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.teardown(&mut core);
                    return Err(err);
                }
            }
            let state = match core.conn.process_new_packets() {
                Ok(state) => state,
                Err(err) => {
                    self.teardown(&mut core);
                    return Err(tls_io_err(err));
                }
            };
            let mut to_read = state.plaintext_bytes_to_read();
            while to_read > 0 {
                let mut chunk = [0u8; 4096];
                let n = core.conn.reader().read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                core.app_in.extend_from_slice(&chunk[..n]);
                to_read = to_read.saturating_sub(n);
            }
            if state.peer_has_closed() {
                core.inbound_done = true;
            }
        }
        if core.status == TlsStatus::Handshaking && !core.conn.is_handshaking() {
            core.status = TlsStatus::AppData;
            debug!(session = %self.session, "tls handshake complete");
        }
        if core.inbound_done && core.outbound_done {
            self.teardown(&mut core);
        } else if core.inbound_done && core.status == TlsStatus::Handshaking {
            // Peer went away mid handshake.
            self.teardown(&mut core);
        }
        Ok(())
    }

    /// Pushes pending ciphertext to the channel and settles the write
    /// interest to match what the state machine still wants.
    pub fn outbound_transport(&self) -> io::Result<()> {
        let mut core = self.core.lock();
        if core.status == TlsStatus::Closed {
            return Ok(());
        }
        while core.conn.wants_write() {
            let written = {
                let mut channel = self.session.channel();
                core.conn.write_tls(&mut channel)
            };
            match written {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.teardown(&mut core);
                    return Err(err);
                }
            }
        }
        if core.status == TlsStatus::Closing && !core.conn.wants_write() {
            core.outbound_done = true;
        }
        if core.inbound_done && core.outbound_done {
            self.teardown(&mut core);
            return Ok(());
        }
        if core.conn.wants_write() {
            drop(core);
            self.session.set_event(EventMask::WRITE);
        } else {
            drop(core);
            self.session.clear_event(EventMask::WRITE);
        }
        Ok(())
    }

    /// Whether decrypted input is available for the application.
    pub fn is_app_input_ready(&self) -> bool {
        let core = self.core.lock();
        matches!(core.status, TlsStatus::AppData | TlsStatus::Closing) && !core.app_in.is_empty()
    }

    /// Whether the application may produce output.
    pub fn is_app_output_ready(&self) -> bool {
        let core = self.core.lock();
        core.status == TlsStatus::AppData && !core.outbound_done
    }

    /// Drains decrypted bytes into `buf` and returns the count.
    pub fn read_app(&self, buf: &mut [u8]) -> usize {
        let mut core = self.core.lock();
        let n = core.app_in.len().min(buf.len());
        buf[..n].copy_from_slice(&core.app_in[..n]);
        core.app_in.advance(n);
        n
    }

    /// Encrypts `data` for transmission. Fails outside the `AppData`
    /// state.
    pub fn write_app(&self, data: &[u8]) -> io::Result<usize> {
        let mut core = self.core.lock();
        if core.status != TlsStatus::AppData {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tls layer not ready for application data",
            ));
        }
        let n = core.conn.writer().write(data)?;
        drop(core);
        self.session.set_event(EventMask::WRITE);
        Ok(n)
    }

    /// Initiates an orderly TLS close: queues close_notify and waits for
    /// the outbound side to drain.
    pub fn close(&self) {
        {
            let mut core = self.core.lock();
            if matches!(core.status, TlsStatus::Closing | TlsStatus::Closed) {
                return;
            }
            core.conn.send_close_notify();
            core.status = TlsStatus::Closing;
        }
        self.session.set_closing();
        self.session.set_event(EventMask::WRITE);
    }

    /// Tears the TLS layer and the underlying session down immediately.
    pub fn shutdown(&self) {
        let mut core = self.core.lock();
        self.teardown(&mut core);
    }

    /// Inactivity handling: a close handshake the peer never answers is
    /// abandoned.
    pub fn timed_out(&self) {
        let abandon = {
            let core = self.core.lock();
            core.status == TlsStatus::Closing && core.outbound_done && !core.inbound_done
        };
        if abandon {
            trace!(session = %self.session, "close handshake timed out");
            self.shutdown();
        }
    }

    /// Reports handshake completion exactly once, so the application gets
    /// a single output-ready nudge when the gates open.
    fn take_ready_event(&self) -> bool {
        let mut core = self.core.lock();
        if core.status == TlsStatus::AppData && !core.ready_notified {
            core.ready_notified = true;
            true
        } else {
            false
        }
    }

    fn teardown(&self, core: &mut TlsCore) {
        if core.status != TlsStatus::Closed {
            core.status = TlsStatus::Closed;
            self.session.close();
        }
    }
}

/// Wraps an application handler so it sees only decrypted traffic.
pub struct TlsHandler<H: IoHandler> {
    inner: H,
    mode: TlsMode,
}

impl<H: IoHandler> TlsHandler<H> {
    /// Wraps `inner` with TLS in the given mode.
    pub fn new(inner: H, mode: TlsMode) -> TlsHandler<H> {
        TlsHandler { inner, mode }
    }

    fn layer(session: &Session) -> io::Result<Arc<TlsSession>> {
        session.ext().get::<TlsSession>().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "tls layer missing")
        })
    }
}

impl<H: IoHandler> IoHandler for TlsHandler<H> {
    fn connected(&self, session: &Session) -> io::Result<()> {
        let tls = TlsSession::new(session.clone(), &self.mode)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
        session.ext().set(tls);
        Self::layer(session)?.bind();
        self.inner.connected(session)
    }

    fn disconnected(&self, session: &Session) -> io::Result<()> {
        self.inner.disconnected(session)
    }

    fn input_ready(&self, session: &Session) -> io::Result<()> {
        let tls = Self::layer(session)?;
        tls.inbound_transport()?;
        if tls.take_ready_event() {
            self.inner.output_ready(session)?;
        }
        if tls.is_app_input_ready() {
            self.inner.input_ready(session)?;
        }
        tls.outbound_transport()
    }

    fn output_ready(&self, session: &Session) -> io::Result<()> {
        let tls = Self::layer(session)?;
        tls.outbound_transport()?;
        if tls.take_ready_event() {
            self.inner.output_ready(session)?;
        }
        Ok(())
    }

    fn timeout(&self, session: &Session) -> io::Result<()> {
        if let Ok(tls) = Self::layer(session) {
            tls.timed_out();
        }
        self.inner.timeout(session)
    }
}

/// Builds a server-side TLS configuration from PEM-encoded certificate
/// chain and private key.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>, ReactorError> {
    install_provider();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|err| ReactorError::Tls(format!("bad certificate pem: {err}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|err| ReactorError::Tls(format!("bad key pem: {err}")))?
        .ok_or_else(|| ReactorError::Tls("no private key in pem".to_string()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ReactorError::Tls(err.to_string()))?;
    Ok(Arc::new(config))
}

/// Builds a client-side TLS configuration trusting the PEM-encoded roots.
pub fn client_config(ca_pem: &[u8]) -> Result<Arc<ClientConfig>, ReactorError> {
    install_provider();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|err| ReactorError::Tls(format!("bad root pem: {err}")))?;
        roots
            .add(cert)
            .map_err(|err| ReactorError::Tls(err.to_string()))?;
    }
    if roots.is_empty() {
        return Err(ReactorError::Tls("no trust anchors in pem".to_string()));
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
