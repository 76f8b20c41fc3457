//! Connection to the signaling relay.
//!
//! The relay speaks length-prefixed JSON over TLS. After authenticating, a
//! writer task drains outbound frames and a reader task forwards inbound call
//! signals to the returned channel and completes pending directory requests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use peercall_crypto::{public_key_from_bytes, IdentityKeyPair, PublicKeyBytes};
use peercall_protocol::codec::{decode_server_msg, encode_client_msg, try_decode_frame, PROTOCOL_VERSION};
use peercall_protocol::{CallSignalingMessage, ClientMessage, IceServer, ServerMessage, UserId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::directory::Directory;
use crate::error::CallError;
use crate::signaling::SignalingSink;

/// Outbound frames queued for the writer task.
const OUTBOUND_QUEUE: usize = 256;

/// Requests waiting for the relay's reply.
#[derive(Default)]
struct Pending {
    ice_servers: Mutex<Vec<oneshot::Sender<Vec<IceServer>>>>,
    public_keys: DashMap<UserId, Vec<oneshot::Sender<Option<Vec<u8>>>>>,
}

impl Pending {
    fn complete_ice_servers(&self, servers: Vec<IceServer>) {
        let waiters = std::mem::take(&mut *self.ice_servers.lock().unwrap_or_else(|p| p.into_inner()));
        for waiter in waiters {
            let _ = waiter.send(servers.clone());
        }
    }

    fn complete_public_key(&self, user_id: UserId, key: Option<Vec<u8>>) {
        if let Some((_, waiters)) = self.public_keys.remove(&user_id) {
            for waiter in waiters {
                let _ = waiter.send(key.clone());
            }
        }
    }

    /// Drop every waiter so outstanding requests fail.
    fn clear(&self) {
        self.ice_servers.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.public_keys.clear();
    }
}

pub struct RelayClient {
    user_id: UserId,
    tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<Pending>,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Authenticate over an established stream and start the I/O tasks.
    ///
    /// Returns the client and the channel of inbound call signals. The channel
    /// closes when the relay connection is lost.
    pub async fn connect<S>(
        mut stream: S,
        username: &str,
        identity: &IdentityKeyPair,
        request_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CallSignalingMessage>), CallError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let auth = ClientMessage::Authenticate {
            username: username.to_string(),
            protocol_version: PROTOCOL_VERSION,
            identity_key: identity.public_bytes().to_vec(),
        };
        stream
            .write_all(&encode_client_msg(&auth)?)
            .await
            .map_err(|e| CallError::Signaling(format!("failed to send auth: {e}")))?;

        let mut buf = BytesMut::with_capacity(4096);
        let user_id = 'auth: loop {
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| CallError::Signaling(format!("failed to read auth response: {e}")))?;
            if n == 0 {
                return Err(CallError::Signaling(
                    "relay closed connection during authentication".into(),
                ));
            }

            while let Some(payload) = try_decode_frame(&mut buf)? {
                match decode_server_msg(&payload)? {
                    ServerMessage::Authenticated { user_id } => break 'auth user_id,
                    ServerMessage::AuthError { reason } => {
                        return Err(CallError::Signaling(format!("authentication failed: {reason}")));
                    }
                    other => warn!("unexpected message during auth: {:?}", other),
                }
            }
        };
        info!(user_id, username, "authenticated with relay");

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending::default());

        let tasks = vec![
            tokio::spawn(writer_task(write_half, rx)),
            tokio::spawn(reader_task(read_half, buf, inbound_tx, pending.clone())),
        ];

        let client = Arc::new(Self {
            user_id,
            tx,
            pending,
            request_timeout,
            tasks,
        });
        Ok((client, inbound_rx))
    }

    /// Open a TLS connection to `host:port`, verified against the web PKI roots.
    pub async fn connect_tls(
        host: &str,
        port: u16,
        username: &str,
        identity: &IdentityKeyPair,
        request_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CallSignalingMessage>), CallError> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| CallError::Signaling(format!("could not connect to {host}:{port}: {e}")))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            rustls::pki_types::ServerName::IpAddress(ip.into())
        } else {
            rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| CallError::Signaling(format!("invalid server name '{host}': {e}")))?
        };

        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CallError::Signaling(format!("TLS handshake failed: {e}")))?;
        debug!(host, port, "TLS handshake complete");

        Self::connect(tls, username, identity, request_timeout).await
    }

    /// Id assigned by the relay; peers see it as our `fromUserId`.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    async fn send_msg(&self, msg: &ClientMessage) -> Result<(), CallError> {
        let data = encode_client_msg(msg)?;
        self.tx
            .send(data)
            .await
            .map_err(|_| CallError::Signaling("relay connection closed".into()))
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>, what: &'static str) -> Result<T, CallError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::Signaling(format!(
                "relay connection closed awaiting {what}"
            ))),
            Err(_) => Err(CallError::Timeout(what)),
        }
    }

    pub async fn ping(&self, timestamp: u64) -> Result<(), CallError> {
        self.send_msg(&ClientMessage::Ping { timestamp }).await
    }

    /// Tell the relay we are leaving. The I/O tasks stop once it closes the stream.
    pub async fn disconnect(&self) -> Result<(), CallError> {
        self.send_msg(&ClientMessage::Disconnect).await
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingSink for RelayClient {
    async fn send(&self, message: CallSignalingMessage) -> Result<(), CallError> {
        self.send_msg(&ClientMessage::Signal { message }).await
    }
}

#[async_trait]
impl Directory for RelayClient {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .ice_servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        self.send_msg(&ClientMessage::RequestIceServers).await?;

        let servers = self.await_reply(rx, "ICE servers").await?;
        if servers.is_empty() {
            return Err(CallError::Transport("relay returned no ICE servers".into()));
        }
        Ok(servers)
    }

    async fn fetch_public_key(&self, user_id: UserId) -> Result<PublicKeyBytes, CallError> {
        let (tx, rx) = oneshot::channel();
        self.pending.public_keys.entry(user_id).or_default().push(tx);
        self.send_msg(&ClientMessage::RequestPublicKey { user_id }).await?;

        match self.await_reply(rx, "public key").await? {
            Some(key) => Ok(public_key_from_bytes(&key)?),
            None => Err(CallError::KeyExchange(format!(
                "no identity key available for user {user_id}"
            ))),
        }
    }
}

async fn writer_task<S>(mut write_half: WriteHalf<S>, mut rx: mpsc::Receiver<Vec<u8>>)
where
    S: AsyncWrite,
{
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            error!("relay write error: {}", e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
    debug!("relay writer task ended");
}

async fn reader_task<S>(
    mut read_half: ReadHalf<S>,
    mut buf: BytesMut,
    inbound: mpsc::UnboundedSender<CallSignalingMessage>,
    pending: Arc<Pending>,
) where
    S: AsyncRead,
{
    // Frames that arrived together with the auth reply.
    let mut open = drain_frames(&mut buf, &inbound, &pending);
    while open {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!("relay closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("relay read error: {}", e);
                break;
            }
        }
        open = drain_frames(&mut buf, &inbound, &pending);
    }
    pending.clear();
    debug!("relay reader task ended");
}

/// Handle every complete frame in `buf`. Returns `false` once the relay says goodbye.
fn drain_frames(
    buf: &mut BytesMut,
    inbound: &mpsc::UnboundedSender<CallSignalingMessage>,
    pending: &Pending,
) -> bool {
    loop {
        match try_decode_frame(buf) {
            Ok(Some(payload)) => match decode_server_msg(&payload) {
                Ok(msg) => {
                    if !handle_server_message(msg, inbound, pending) {
                        return false;
                    }
                }
                Err(e) => warn!("failed to decode relay message: {}", e),
            },
            Ok(None) => return true,
            Err(e) => {
                error!("frame decode error: {}", e);
                return false;
            }
        }
    }
}

fn handle_server_message(
    msg: ServerMessage,
    inbound: &mpsc::UnboundedSender<CallSignalingMessage>,
    pending: &Pending,
) -> bool {
    match msg {
        ServerMessage::Signal { message } => {
            if inbound.send(message).is_err() {
                debug!("inbound signal dropped, nobody is listening");
            }
        }
        ServerMessage::IceServers { servers } => pending.complete_ice_servers(servers),
        ServerMessage::PublicKey { user_id, key } => pending.complete_public_key(user_id, Some(key)),
        ServerMessage::PublicKeyUnavailable { user_id } => pending.complete_public_key(user_id, None),
        ServerMessage::SignalUndeliverable { to_user_id } => {
            warn!(to_user_id, "relay could not deliver signal, peer offline");
        }
        ServerMessage::Pong { timestamp } => debug!(timestamp, "pong"),
        ServerMessage::ServerShutdown { reason } => {
            warn!("relay shutting down: {}", reason);
            return false;
        }
        other @ (ServerMessage::Authenticated { .. } | ServerMessage::AuthError { .. }) => {
            warn!("unexpected message after auth: {:?}", other);
        }
    }
    true
}
