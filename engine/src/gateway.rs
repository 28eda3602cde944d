//! QUIC gateway: accepts connections and bridges them onto endpoints.
//!
//! Each client opens one long-lived bidirectional stream after the
//! handshake. The read task extracts frames, decodes them against the
//! registry and feeds the endpoint's inbound queue; a writer task drains the
//! endpoint's client link into the send stream. Either side closing funnels
//! into the server's disconnect path.

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use protocol::{CodecError, CodecLimits, PeerId, codec};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::mpsc;

use crate::endpoint::ClientLink;
use crate::server::{PlayerConn, ServerApp};

const READ_CHUNK: usize = 8 * 1024;

/// Handle on the bound transport endpoint.
#[derive(Clone)]
pub struct GatewayHandle {
    endpoint: Endpoint,
    local_addr: SocketAddr,
}

impl GatewayHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutdown");
    }
}

pub(crate) async fn start_gateway(server: ServerApp) -> anyhow::Result<GatewayHandle> {
    let network = server.config().network.clone();
    let bind_addr = format!("{}:{}", network.host, network.port)
        .parse::<SocketAddr>()
        .with_context(|| {
            format!(
                "invalid bind address '{}:{}'",
                network.host, network.port
            )
        })?;

    let (cert_chain, private_key) = match (&network.cert_path, &network.key_path) {
        (Some(cert), Some(key)) => load_tls_from_files(cert, key)?,
        (None, None) => generate_self_signed_tls()?,
        _ => bail!("TLS is misconfigured: set both cert_path and key_path, or neither"),
    };

    let mut server_config = quinn::ServerConfig::with_single_cert(cert_chain, private_key)
        .context("invalid TLS material")?;
    let transport = Arc::get_mut(&mut server_config.transport)
        .ok_or_else(|| anyhow!("unable to mutate transport config"))?;
    transport.keep_alive_interval(Some(Duration::from_secs(5)));
    transport.max_idle_timeout(Some(quinn::IdleTimeout::try_from(Duration::from_secs(30))?));

    let endpoint =
        Endpoint::server(server_config, bind_addr).context("failed to create QUIC endpoint")?;
    let local_addr = endpoint
        .local_addr()
        .context("failed to resolve local address")?;

    let accept_endpoint = endpoint.clone();
    tokio::spawn(async move {
        accept_loop(accept_endpoint, server).await;
    });

    Ok(GatewayHandle {
        endpoint,
        local_addr,
    })
}

async fn accept_loop(endpoint: Endpoint, server: ServerApp) {
    loop {
        let Some(incoming) = endpoint.accept().await else {
            break;
        };

        let server = server.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => {
                    log::info!("client connected from {}", connection.remote_address());
                    if let Err(err) = handle_connection(connection, server).await {
                        log::warn!("connection ended: {err:#}");
                    }
                }
                Err(err) => {
                    log::warn!("handshake failed: {err}");
                }
            }
        });
    }
}

async fn handle_connection(connection: Connection, server: ServerApp) -> anyhow::Result<()> {
    let (send, recv) = connection
        .accept_bi()
        .await
        .context("client did not open a duplex stream")?;

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let conn = server
        .attach_player(ClientLink::new(frames_tx))
        .await
        .map_err(|err| anyhow!("could not attach player: {err}"))?;
    let pid = conn.pid;

    let writer = tokio::spawn(write_loop(pid, send, frames_rx));
    read_loop(&server, &conn, recv).await;

    server.disconnect(pid, "Client disconnected").await;
    writer.abort();
    log::info!(
        "[{pid}] client at {} disconnected",
        connection.remote_address()
    );
    Ok(())
}

async fn write_loop(
    pid: PeerId,
    mut send: SendStream,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = send.write_all(&frame).await {
            log::debug!("[{pid}] client write failed: {err}");
            break;
        }
    }
}

async fn read_loop(server: &ServerApp, conn: &PlayerConn, mut recv: RecvStream) {
    let limits = *server.limits();
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match recv.read(&mut chunk).await {
            Ok(Some(n)) => {
                buffer.extend_from_slice(&chunk[..n]);
                if !drain_frames(server, conn, &mut buffer, &limits) {
                    break;
                }
            }
            Ok(None) => {
                log::debug!("[{}] client stream finished", conn.pid);
                break;
            }
            Err(err) => {
                log::debug!("[{}] client stream read failed: {err}", conn.pid);
                break;
            }
        }
    }
}

/// Extracts and dispatches every complete frame in `buffer`. A record that
/// fails to decode is logged and dropped without affecting the connection;
/// a framing violation means the byte stream is out of sync and returns
/// `false` to close it.
fn drain_frames(
    server: &ServerApp,
    conn: &PlayerConn,
    buffer: &mut Vec<u8>,
    limits: &CodecLimits,
) -> bool {
    loop {
        match codec::try_decode_frame(buffer, limits) {
            Ok(Some((payload, consumed))) => {
                buffer.drain(..consumed);
                match codec::decode(server.registry(), &payload) {
                    Ok(packet) => {
                        if conn.inbound.send(packet).is_err() {
                            return false;
                        }
                    }
                    Err(err @ CodecError::Malformed(_)) => {
                        log::error!("[{}] malformed packet: {err}", conn.pid);
                    }
                    Err(err @ CodecError::Unknown(_)) => {
                        log::error!("[{}] unknown packet: {err}", conn.pid);
                    }
                }
            }
            Ok(None) => return true,
            Err(err) => {
                log::error!("[{}] framing error: {err}; closing connection", conn.pid);
                return false;
            }
        }
    }
}

fn load_tls_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_bytes = std::fs::read(cert_path)
        .with_context(|| format!("failed to read certificate file '{}'", cert_path.display()))?;
    let key_bytes = std::fs::read(key_path)
        .with_context(|| format!("failed to read key file '{}'", key_path.display()))?;

    let mut cert_reader = Cursor::new(cert_bytes);
    let cert_chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate chain")?;
    if cert_chain.is_empty() {
        bail!("certificate chain is empty");
    }

    let mut key_reader = Cursor::new(key_bytes);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse private key")?
        .ok_or_else(|| anyhow!("no private key found in '{}'", key_path.display()))?;

    Ok((cert_chain, key))
}

fn generate_self_signed_tls()
-> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let certified = rcgen::generate_simple_self_signed(subject_alt_names)
        .context("failed to generate self-signed certificate")?;

    let cert_der = certified.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    Ok((vec![cert_der], PrivateKeyDer::Pkcs8(key_der)))
}
