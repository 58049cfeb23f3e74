//! Per-connection tasks: handshake, receive loop, writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::registry::{Frame, Peer};
use super::HostShared;
use crate::connection::FrameBuffer;
use crate::protocol::{encode, now, verify_token, ConnectionId, Message, RejectReason};
use tether_shared::PROTOCOL_VERSION;

const READ_CHUNK: usize = 8192;

/// Drives one accepted socket until it disconnects.
pub(super) async fn serve(shared: Arc<HostShared>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "set_nodelay failed");
    }
    let (stream, link) = match with_link(stream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%addr, error = %e, "could not duplicate socket, closing");
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameBuffer::new(shared.config.max_frame_bytes);

    let handshake = tokio::select! {
        () = shared.shutdown.cancelled() => return,
        first = timeout(shared.config.handshake_timeout(), read_first(&mut reader, &mut frames)) => first,
    };
    let mut pending = match handshake {
        Ok(Some(messages)) => messages.into_iter(),
        Ok(None) => {
            debug!(%addr, "closed before handshake");
            return;
        }
        Err(_) => {
            debug!(%addr, "handshake timed out");
            return;
        }
    };

    let Some(Message::Hello { proto, token }) = pending.next() else {
        debug!(%addr, "first frame was not hello, closing");
        return;
    };

    let verdict = if proto != PROTOCOL_VERSION {
        Err(RejectReason::Proto)
    } else if !verify_token(token.as_deref(), shared.config.secret.as_deref()) {
        Err(RejectReason::Auth)
    } else {
        Ok(())
    };

    let (tx, rx) = unbounded_channel();
    let cancel = shared.shutdown.child_token();
    let admitted = shared.admit(Peer::new(addr, tx, cancel.clone()).with_link(link), verdict);

    let id = match admitted {
        Ok(id) => id,
        Err(Some(reason)) => {
            warn!(%addr, %reason, "handshake rejected");
            reject(&mut writer, reason).await;
            return;
        }
        Err(None) => return,
    };

    let span = info_span!("peer", id = id.0);
    tokio::spawn(write_loop(writer, rx, cancel.clone()).instrument(span.clone()));

    async move {
        info!(%addr, "client connected");
        shared.on_established(id);

        for msg in pending {
            shared.dispatch(id, msg);
        }
        read_loop(&shared, id, reader, frames, &cancel).await;
        shared.drop_peer(id, "receive loop ended");
    }
    .instrument(span)
    .await;
}

/// Splits off a second handle to the same socket for hang-up checks.
fn with_link(stream: TcpStream) -> std::io::Result<(TcpStream, std::net::TcpStream)> {
    let std_stream = stream.into_std()?;
    let link = std_stream.try_clone()?;
    link.set_nonblocking(true)?;
    Ok((TcpStream::from_std(std_stream)?, link))
}

/// Reads until at least one message decodes. `None` on close or error.
async fn read_first(reader: &mut OwnedReadHalf, frames: &mut FrameBuffer) -> Option<Vec<Message>> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        let messages = frames.extend(&buf[..n]).ok()?;
        if !messages.is_empty() {
            return Some(messages);
        }
    }
}

async fn reject(writer: &mut OwnedWriteHalf, reason: RejectReason) {
    if let Ok(frame) = encode(&Message::Error { reason }, false) {
        let _ = writer.write_all(&frame).await;
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    shared: &HostShared,
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut frames: FrameBuffer,
    cancel: &CancellationToken,
) {
    let poll = shared.config.recv_poll_interval();
    let inactivity = shared.config.inactivity_timeout();
    let mut last_activity = Instant::now();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = timeout(poll, reader.read(&mut buf)) => read,
        };
        match read {
            Err(_) => {
                if last_activity.elapsed() > inactivity {
                    info!(idle_ms = last_activity.elapsed().as_millis() as u64, "evicting inactive client");
                    return;
                }
            }
            Ok(Ok(0)) => {
                debug!("peer closed the stream");
                return;
            }
            Ok(Ok(n)) => {
                last_activity = Instant::now();
                shared.touch(id);
                match frames.extend(&buf[..n]) {
                    Ok(messages) => {
                        for msg in messages {
                            shared.dispatch(id, msg);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping client");
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "read failed");
                return;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: UnboundedReceiver<Frame>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let written = tokio::select! {
            () = cancel.cancelled() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            debug!(error = %e, "write failed");
            break;
        }
    }
    cancel.cancel();
    let _ = writer.shutdown().await;
}

/// Keep-alive ping stamped with the current clock.
pub(super) fn ping_frame() -> Option<Frame> {
    encode(&Message::Ping { t: now() }, false).ok().map(Frame::from)
}
