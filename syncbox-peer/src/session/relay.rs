//! TCP session relay
//!
//! A relay process assigns peer ids, tracks membership and fans every
//! broadcast out to all connected members, the sender included. Peers
//! connect with [`RelaySession::connect`].
//!
//! Wire format: one JSON-encoded [`RelayFrame`] per line, at most
//! [`MAX_FRAME_BYTES`] long.

use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::session::{SessionEvent, SessionInbox, SessionLayer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use syncbox_common::{PeerId, PeerMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frames exchanged between relay and peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Relay → new peer: assigned id and current members (self included)
    Welcome { peer: PeerId, members: Vec<PeerId> },
    /// Relay → peers
    PeerJoined { peer: PeerId },
    /// Relay → peers
    PeerLeft { peer: PeerId },
    /// Peer → relay: deliver to every member
    Broadcast { message: PeerMessage },
    /// Relay → peers: a member's broadcast
    Deliver { from: PeerId, message: PeerMessage },
}

impl RelayFrame {
    /// Encode as one line, newline included
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).map_err(syncbox_common::Error::from)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line).map_err(syncbox_common::Error::from)?)
    }
}

/// Longest frame line accepted, newline excluded
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Line reader that refuses lines over [`MAX_FRAME_BYTES`]
struct FrameReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next line without its line ending; `None` at end of stream
    ///
    /// An oversized line is an error and leaves the stream mid-line.
    async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        let limit = MAX_FRAME_BYTES as u64 + 1;
        let read = (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if self.buf.len() > MAX_FRAME_BYTES {
            return Err(Error::Session(format!(
                "Frame exceeds {} bytes",
                MAX_FRAME_BYTES
            )));
        }

        String::from_utf8(std::mem::take(&mut self.buf))
            .map(Some)
            .map_err(|_| Error::Session("Frame is not valid UTF-8".to_string()))
    }
}

/// Drain `rx` onto the socket until either side closes
async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<RelayFrame>) {
    while let Some(frame) = rx.recv().await {
        let line = match frame.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping unencodable frame: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Relay connection write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[derive(Default)]
struct RelayState {
    next_id: u32,
    clients: BTreeMap<PeerId, mpsc::UnboundedSender<RelayFrame>>,
}

impl RelayState {
    fn send_all(&self, frame: &RelayFrame, except: Option<PeerId>) {
        for (peer, tx) in &self.clients {
            if Some(*peer) != except {
                let _ = tx.send(frame.clone());
            }
        }
    }
}

/// Relay server
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<Mutex<RelayState>>,
}

impl RelayServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(RelayState {
                next_id: 1,
                clients: BTreeMap::new(),
            })),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of connected peers
    pub fn member_count(&self) -> usize {
        lock_unpoisoned(&self.state).clients.len()
    }

    /// Accept peers until the task is dropped
    pub async fn serve(self) -> Result<()> {
        info!("Relay listening on {}", self.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                handle_client(stream, addr, state).await;
            });
        }
    }
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, state: Arc<Mutex<RelayState>>) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    let peer = {
        let mut state = lock_unpoisoned(&state);
        let peer = PeerId(state.next_id);
        state.next_id += 1;

        let mut members: Vec<PeerId> = state.clients.keys().copied().collect();
        members.push(peer);
        // Welcome is queued before the peer can see any other frame
        let _ = tx.send(RelayFrame::Welcome { peer, members });
        state.send_all(&RelayFrame::PeerJoined { peer }, None);
        state.clients.insert(peer, tx);
        info!("{} connected from {} ({} members)", peer, addr, state.clients.len());
        peer
    };

    tokio::spawn(write_frames(writer, rx));

    let mut frames = FrameReader::new(reader);
    loop {
        match frames.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match RelayFrame::decode(&line) {
                    Ok(RelayFrame::Broadcast { message }) => {
                        debug!("{} broadcast {}", peer, message.kind());
                        lock_unpoisoned(&state)
                            .send_all(&RelayFrame::Deliver { from: peer, message }, None);
                    }
                    Ok(other) => warn!("Unexpected frame from {}: {:?}", peer, other),
                    Err(e) => warn!("Malformed frame from {}: {}", peer, e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping {}: {}", peer, e);
                break;
            }
        }
    }

    let mut state = lock_unpoisoned(&state);
    state.clients.remove(&peer);
    state.send_all(&RelayFrame::PeerLeft { peer }, None);
    info!("{} disconnected ({} members)", peer, state.clients.len());
}

/// Peer side of a relay connection
pub struct RelaySession {
    peer: PeerId,
    members: Arc<Mutex<BTreeSet<PeerId>>>,
    outbound: mpsc::UnboundedSender<RelayFrame>,
}

impl RelaySession {
    /// Connect to the relay at `addr` and wait for the welcome frame
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<(Arc<Self>, SessionInbox)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Session(format!("Failed to connect to relay: {}", e)))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut frames = FrameReader::new(reader);

        let welcome = frames
            .next_line()
            .await?
            .ok_or_else(|| Error::Session("Relay closed before welcome".to_string()))?;
        let (peer, initial) = match RelayFrame::decode(&welcome)? {
            RelayFrame::Welcome { peer, members } => (peer, members),
            other => {
                return Err(Error::Session(format!("Expected welcome, got {:?}", other)));
            }
        };
        info!("Joined relay session as {} ({} members)", peer, initial.len());

        let members = Arc::new(Mutex::new(initial.into_iter().collect::<BTreeSet<_>>()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        tokio::spawn(write_frames(writer, outbound_rx));

        let reader_members = Arc::clone(&members);
        tokio::spawn(async move {
            loop {
                let line = match frames.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let event = match RelayFrame::decode(&line) {
                    Ok(RelayFrame::PeerJoined { peer }) => {
                        lock_unpoisoned(&reader_members).insert(peer);
                        SessionEvent::PeerJoined(peer)
                    }
                    Ok(RelayFrame::PeerLeft { peer }) => {
                        lock_unpoisoned(&reader_members).remove(&peer);
                        SessionEvent::PeerLeft(peer)
                    }
                    Ok(RelayFrame::Deliver { from, message }) => {
                        SessionEvent::Message { from, message }
                    }
                    Ok(other) => {
                        warn!("Unexpected frame from relay: {:?}", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("Malformed frame from relay: {}", e);
                        continue;
                    }
                };

                if inbox_tx.send(event).is_err() {
                    break;
                }
            }
            warn!("Relay connection closed");
        });

        let session = Arc::new(Self {
            peer,
            members,
            outbound,
        });
        Ok((session, inbox))
    }
}

impl SessionLayer for RelaySession {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn peer_count(&self) -> usize {
        lock_unpoisoned(&self.members).len()
    }

    fn members(&self) -> Vec<PeerId> {
        lock_unpoisoned(&self.members).iter().copied().collect()
    }

    fn broadcast(&self, message: PeerMessage) -> Result<()> {
        self.outbound
            .send(RelayFrame::Broadcast { message })
            .map_err(|_| Error::Session("Relay connection closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_format() {
        let frame = RelayFrame::PeerJoined { peer: PeerId(3) };
        assert_eq!(frame.encode().unwrap(), "{\"frame\":\"peer_joined\",\"peer\":3}\n");

        let decoded = RelayFrame::decode("{\"frame\":\"peer_left\",\"peer\":7}").unwrap();
        assert_eq!(decoded, RelayFrame::PeerLeft { peer: PeerId(7) });
    }

    #[test]
    fn test_malformed_frame() {
        assert!(RelayFrame::decode("{\"frame\":\"bogus\"}").is_err());
        assert!(RelayFrame::decode("not json").is_err());
    }

    #[tokio::test]
    async fn test_frame_reader_lines() {
        let mut frames = FrameReader::new(&b"a\nb\r\n\nc"[..]);
        assert_eq!(frames.next_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(frames.next_line().await.unwrap().as_deref(), Some("b"));
        assert_eq!(frames.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(frames.next_line().await.unwrap().as_deref(), Some("c"));
        assert_eq!(frames.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_oversized_line() {
        let mut data = vec![b'x'; MAX_FRAME_BYTES];
        data.extend_from_slice(b"\n");
        data.extend(vec![b'y'; MAX_FRAME_BYTES + 1]);
        data.extend_from_slice(b"\n");

        let mut frames = FrameReader::new(&data[..]);
        let line = frames.next_line().await.unwrap().unwrap();
        assert_eq!(line.len(), MAX_FRAME_BYTES);
        assert!(matches!(frames.next_line().await, Err(Error::Session(_))));
    }
}
