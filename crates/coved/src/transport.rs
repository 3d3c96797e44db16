//! In-tree TCP transport.
//!
//! The engine only requires "a bidirectional byte stream plus the remote's
//! public key", with the folder ID carried in the connection target so one
//! listener can route to the right controller. This module provides that
//! over plain TCP with a fixed-size hello in each direction:
//!
//!   magic "COVE1" ‖ folder_id (32) ‖ node_pubkey (32)
//!
//! Deployments that need transport-level confidentiality wrap the stream
//! in TLS outside this crate; the session handshake still binds the
//! channel to the folder secret either way.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use cove_core::secret::FolderId;

use crate::controller::FolderController;

pub const HELLO_MAGIC: [u8; 5] = *b"COVE1";
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Hello {
    pub folder_id: [u8; 32],
    pub node_pubkey: [u8; 32],
}

pub async fn write_hello<W: AsyncWrite + Unpin>(
    writer: &mut W,
    folder_id: [u8; 32],
    node_pubkey: [u8; 32],
) -> std::io::Result<()> {
    writer.write_all(&HELLO_MAGIC).await?;
    writer.write_all(&folder_id).await?;
    writer.write_all(&node_pubkey).await?;
    writer.flush().await
}

pub async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Hello> {
    let mut magic = [0u8; 5];
    reader.read_exact(&mut magic).await?;
    if magic != HELLO_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad hello magic",
        ));
    }
    let mut folder_id = [0u8; 32];
    reader.read_exact(&mut folder_id).await?;
    let mut node_pubkey = [0u8; 32];
    reader.read_exact(&mut node_pubkey).await?;
    Ok(Hello {
        folder_id,
        node_pubkey,
    })
}

/// Dial a peer for a folder. Returns the stream and the remote's claimed
/// public key (verified cryptographically by the session handshake).
pub async fn connect(
    endpoint: &str,
    folder_id: FolderId,
    node_pubkey: [u8; 32],
) -> anyhow::Result<(TcpStream, [u8; 32])> {
    let mut stream = TcpStream::connect(endpoint)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    write_hello(&mut stream, folder_id.0, node_pubkey).await?;

    let hello = tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream))
        .await
        .context("hello timed out")??;
    if hello.folder_id != folder_id.0 {
        bail!("peer at {endpoint} answered for a different folder");
    }
    Ok((stream, hello.node_pubkey))
}

/// Accept loop: route each inbound connection to the controller that owns
/// the folder named in its hello.
pub async fn serve(
    listener: TcpListener,
    controllers: Arc<DashMap<FolderId, Arc<FolderController>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("transport listener shutting down");
                return;
            }

            accepted = listener.accept() => {
                let (mut stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let controllers = controllers.clone();
                tokio::spawn(async move {
                    let hello =
                        match tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream)).await {
                            Ok(Ok(hello)) => hello,
                            Ok(Err(e)) => {
                                tracing::debug!(%addr, error = %e, "bad hello");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(%addr, "hello timed out");
                                return;
                            }
                        };

                    let Some(controller) = controllers
                        .get(&FolderId(hello.folder_id))
                        .map(|entry| entry.value().clone())
                    else {
                        tracing::debug!(
                            %addr,
                            folder = hex::encode(&hello.folder_id[..8]),
                            "connection for unknown folder"
                        );
                        return;
                    };

                    if write_hello(&mut stream, hello.folder_id, controller.node_pubkey())
                        .await
                        .is_err()
                    {
                        return;
                    }
                    controller.attach_session(stream, hello.node_pubkey);
                });
            }
        }
    }
}
