use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use peercall_protocol::codec::{decode_client_msg, encode_server_msg, try_decode_frame, PROTOCOL_VERSION};
use peercall_protocol::{ClientMessage, ServerMessage, UserId};

use crate::state::{Forward, RelayState};

/// Identity keys are raw X25519 public keys.
const IDENTITY_KEY_LEN: usize = 32;

/// Handle a single client connection (already TLS-wrapped in production).
pub async fn handle_connection<S>(mut stream: S, peer_addr: String, state: Arc<RelayState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!(peer = %peer_addr, "new connection");

    // Outbound queue; the writer task starts draining it after authentication.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    // --- Authentication phase (with timeout) ---
    let mut buf = BytesMut::with_capacity(4096);
    let auth_result = tokio::time::timeout(
        Duration::from_secs(5),
        authenticate(&mut stream, &mut buf, &state, &peer_addr, tx.clone()),
    )
    .await;
    let user_id = match auth_result {
        Ok(Ok(user_id)) => user_id,
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, "authentication failed: {}", e);
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "authentication timed out");
            return;
        }
    };

    // --- Split into reader/writer ---
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let writer_handle = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                error!("write error: {}", e);
                break;
            }
        }
    });

    // --- Message loop ---
    loop {
        // Frames that arrived together with the auth request are handled first.
        let mut msgs_this_read = 0u32;
        loop {
            if msgs_this_read >= 20 {
                tokio::task::yield_now().await;
                msgs_this_read = 0;
            }
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => {
                    msgs_this_read += 1;
                    match decode_client_msg(&payload) {
                        Ok(msg) => {
                            if let Err(e) = handle_message(msg, &state, user_id, &tx).await {
                                error!(user_id, "error handling message: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!(user_id, "failed to decode client message: {}", e);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(user_id, "frame decode error: {}", e);
                    break;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!(user_id, "client disconnected (EOF)");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(user_id, "read error: {}", e);
                break;
            }
        }
    }

    // --- Cleanup ---
    if let Some(user) = state.remove(user_id) {
        info!(user_id, username = %user.username, "user left");
    }
    writer_handle.abort();
}

/// Reply with an `AuthError` and fail the handshake.
async fn reject<S>(stream: &mut S, reason: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let data = encode_server_msg(&ServerMessage::AuthError {
        reason: reason.into(),
    })?;
    stream.write_all(&data).await?;
    anyhow::bail!("{reason}")
}

/// Perform the authentication handshake.
async fn authenticate<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    state: &RelayState,
    peer_addr: &str,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<UserId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Read until we get a complete message
    loop {
        if stream.read_buf(buf).await? == 0 {
            anyhow::bail!("connection closed before authentication");
        }

        let Some(payload) = try_decode_frame(buf)? else {
            continue;
        };

        match decode_client_msg(&payload)? {
            ClientMessage::Authenticate {
                username,
                protocol_version,
                identity_key,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    reject(
                        stream,
                        &format!(
                            "protocol version mismatch: client={}, server={}",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    )
                    .await?;
                }

                let username = username.trim().to_string();
                let char_count = username.chars().count();
                if char_count == 0 || char_count > 32 {
                    reject(stream, "username must be 1-32 characters").await?;
                }
                if username.chars().any(|c| c.is_control()) {
                    reject(stream, "username contains invalid characters").await?;
                }
                if identity_key.len() != IDENTITY_KEY_LEN {
                    reject(stream, "identity key must be 32 bytes").await?;
                }
                if state.is_username_taken(&username) {
                    reject(stream, "username already taken").await?;
                }
                if state.user_count() >= state.max_users as usize {
                    reject(stream, "relay is full").await?;
                }

                let user_id = state.register(username.clone(), identity_key, tx);
                let data = encode_server_msg(&ServerMessage::Authenticated { user_id })?;
                if let Err(e) = stream.write_all(&data).await {
                    state.remove(user_id);
                    return Err(e.into());
                }

                info!(peer = %peer_addr, username = %username, user_id, "authenticated");
                return Ok(user_id);
            }
            other => {
                anyhow::bail!("expected Authenticate message, got {:?}", other);
            }
        }
    }
}

/// Handle a client message after authentication.
async fn handle_message(
    msg: ClientMessage,
    state: &RelayState,
    user_id: UserId,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    match msg {
        ClientMessage::Signal { message } => {
            let to_user_id = message.to_user_id;
            let kind = message.kind();
            match state.forward_signal(user_id, message).await {
                Forward::Delivered => debug!(user_id, to_user_id, kind, "signal forwarded"),
                Forward::Undeliverable => {
                    debug!(user_id, to_user_id, kind, "signal recipient offline");
                    send_msg(tx, &ServerMessage::SignalUndeliverable { to_user_id }).await?;
                }
                Forward::RateLimited => {
                    warn!(user_id, to_user_id, kind, "signal dropped, rate limit exceeded");
                }
            }
        }
        ClientMessage::RequestIceServers => {
            send_msg(
                tx,
                &ServerMessage::IceServers {
                    servers: state.ice_servers.clone(),
                },
            )
            .await?;
        }
        ClientMessage::RequestPublicKey { user_id: target } => {
            let reply = match state.public_key(target) {
                Some(key) => ServerMessage::PublicKey { user_id: target, key },
                None => ServerMessage::PublicKeyUnavailable { user_id: target },
            };
            send_msg(tx, &reply).await?;
        }
        ClientMessage::Ping { timestamp } => {
            send_msg(tx, &ServerMessage::Pong { timestamp }).await?;
        }
        ClientMessage::Disconnect => {
            info!(user_id, "client sent disconnect");
            // Cleanup will happen when the connection loop ends
        }
        ClientMessage::Authenticate { .. } => {
            warn!(user_id, "ignoring repeated authentication");
        }
    }
    Ok(())
}

async fn send_msg(tx: &mpsc::Sender<Vec<u8>>, msg: &ServerMessage) -> Result<()> {
    let data = encode_server_msg(msg)?;
    tx.send(data).await.map_err(|_| anyhow::anyhow!("send channel closed"))?;
    Ok(())
}
