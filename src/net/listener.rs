// TCP listeners: one accepting receiver sessions, one serving the result
// feed to any subscriber that connects.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::coordinator::Event;
use crate::session::ClockSpec;

use super::messages::{Handshake, HandshakeAck, HandshakeDeny, InputRecord};

/// Time allowed for the handshake line.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Accept receiver connections and pump their records into the coordinator.
pub async fn run_client_listener(
    addr: SocketAddr,
    events: mpsc::Sender<Event>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("receiver listener on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, events).await {
                debug!(%peer, "client session ended: {e}");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<Event>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let handshake_line = match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(%peer, "handshake timeout");
            return Ok(());
        }
    };

    let hs: Handshake = match serde_json::from_str(&handshake_line) {
        Ok(hs) => hs,
        Err(e) => {
            let deny = HandshakeDeny { deny: format!("bad handshake: {e}") };
            send_json(&mut write_half, &deny).await?;
            return Ok(());
        }
    };

    let clock = match ClockSpec::new(hs.freq, hs.wrap_bits, hs.jitter_ns * 1e-9) {
        Ok(c) => c,
        Err(_) => {
            let deny = HandshakeDeny { deny: "unsupported clock parameters".into() };
            send_json(&mut write_half, &deny).await?;
            return Ok(());
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let connect = Event::Connect {
        user: hs.user.clone(),
        lat: hs.lat,
        lon: hs.lon,
        alt: hs.alt,
        clock,
        reply: reply_tx,
    };
    if events.send(connect).await.is_err() {
        return Ok(()); // coordinator gone, shutting down
    }

    let uid = match reply_rx.await {
        Ok(Ok(uid)) => uid,
        Ok(Err(reason)) => {
            send_json(&mut write_half, &HandshakeDeny { deny: reason }).await?;
            return Ok(());
        }
        Err(_) => return Ok(()),
    };
    send_json(&mut write_half, &HandshakeAck { ok: uid }).await?;
    info!(%peer, uid, user = hs.user, "receiver session established");

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let record: InputRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                debug!(uid, "unparsable record dropped: {e}");
                continue;
            }
        };
        let payload = match hex::decode(&record.m) {
            Ok(p) => p,
            Err(_) => {
                debug!(uid, "bad hex payload dropped");
                continue;
            }
        };
        let msg = Event::Message { uid, tick: record.t, payload, signal: record.s };
        if events.send(msg).await.is_err() {
            break;
        }
    }

    let _ = events.send(Event::Disconnect { uid }).await;
    Ok(())
}

async fn send_json<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

/// Serve the JSON result feed: every connection gets every fix from the
/// broadcast channel, newline-delimited.
pub async fn run_output_listener(
    addr: SocketAddr,
    feed: broadcast::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("result feed on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let mut rx = feed.subscribe();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if stream.write_all(&line).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(%peer, lagged = n, "slow feed subscriber skipped fixes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(%peer, "feed subscriber disconnected");
        });
    }
}
