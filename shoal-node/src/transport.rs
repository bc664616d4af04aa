//! Peer links: handshake (version | peer id | public key), then encrypted,
//! length-prefixed frames with per-direction nonce counters.

use std::io;

use shoal_core::identity::{decrypt_wire, derive_session_key, encrypt_wire, PEER_ID_LEN};
use shoal_core::wire::{self, LEN_SIZE, MAX_FRAME_LEN};
use shoal_core::{Frame, Keypair, PeerId, PublicKey, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

const HANDSHAKE_SIZE: usize = 1 + PEER_ID_LEN + 32; // version + peer_id + public_key

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn handshake_bytes(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..1 + PEER_ID_LEN].copy_from_slice(keypair.peer_id().as_bytes());
    out[1 + PEER_ID_LEN..].copy_from_slice(keypair.public_key().as_bytes());
    out
}

/// Check the remote's handshake: version, and that the id belongs to the key.
fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> io::Result<(PeerId, PublicKey)> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(invalid(format!("unsupported protocol version {}", buf[0])));
    }
    let mut id = [0u8; PEER_ID_LEN];
    id.copy_from_slice(&buf[1..1 + PEER_ID_LEN]);
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[1 + PEER_ID_LEN..]);
    let peer = PeerId::from_bytes(id);
    if PeerId::from_public_key(&key) != peer {
        return Err(invalid("peer id does not match public key"));
    }
    Ok((peer, PublicKey::from_bytes(key)))
}

/// Sending half of a link.
pub struct LinkWriter<W> {
    inner: W,
    key: [u8; 32],
    counter: u64,
    direction: u64,
}

impl<W: AsyncWrite + Unpin> LinkWriter<W> {
    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let plain = wire::encode_payload(frame).map_err(|e| invalid(e.to_string()))?;
        let nonce = self.counter * 2 + self.direction;
        let cipher = encrypt_wire(&self.key, nonce, &plain).map_err(|e| invalid(e.to_string()))?;
        self.counter += 1;
        self.inner.write_all(&wire::length_prefixed(&cipher)).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Receiving half of a link.
pub struct LinkReader<R> {
    inner: R,
    key: [u8; 32],
    counter: u64,
    direction: u64,
}

impl<R: AsyncRead + Unpin> LinkReader<R> {
    /// Next frame, or `None` once the remote closed the stream cleanly.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut len_buf = [0u8; LEN_SIZE];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(invalid(format!("record of {len} bytes exceeds limit")));
        }
        let mut cipher = vec![0u8; len as usize];
        self.inner.read_exact(&mut cipher).await?;
        let nonce = self.counter * 2 + self.direction;
        let plain = decrypt_wire(&self.key, nonce, &cipher).map_err(|e| invalid(e.to_string()))?;
        self.counter += 1;
        let frame = wire::decode_payload(&plain).map_err(|e| invalid(e.to_string()))?;
        Ok(Some(frame))
    }
}

/// An authenticated link to `peer`.
pub struct Link<S> {
    pub peer: PeerId,
    pub reader: LinkReader<ReadHalf<S>>,
    pub writer: LinkWriter<WriteHalf<S>>,
}

/// Run the handshake over `stream`. The dialing side writes first.
pub async fn establish<S>(mut stream: S, keypair: &Keypair, dialer: bool) -> io::Result<Link<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    if dialer {
        stream.write_all(&handshake_bytes(keypair)).await?;
        stream.flush().await?;
        stream.read_exact(&mut buf).await?;
    } else {
        stream.read_exact(&mut buf).await?;
        stream.write_all(&handshake_bytes(keypair)).await?;
        stream.flush().await?;
    }
    let (peer, public) = parse_handshake(&buf)?;
    let local = keypair.peer_id();
    if peer == local {
        return Err(invalid("connected to self"));
    }
    let key = derive_session_key(&keypair.shared_secret(&public));
    // Both directions share the key; odd and even nonces keep them apart.
    let (send_dir, recv_dir) = if local < peer { (0, 1) } else { (1, 0) };
    let (r, w) = tokio::io::split(stream);
    Ok(Link {
        peer,
        reader: LinkReader {
            inner: r,
            key,
            counter: 0,
            direction: recv_dir,
        },
        writer: LinkWriter {
            inner: w,
            key,
            counter: 0,
            direction: send_dir,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{CloseCode, OpenOutcome};

    async fn pair() -> (Link<tokio::io::DuplexStream>, Link<tokio::io::DuplexStream>, Keypair, Keypair) {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let (sa, sb) = tokio::io::duplex(64 * 1024);
        let (a, b) = tokio::join!(establish(sa, &ka, true), establish(sb, &kb, false));
        (a.unwrap(), b.unwrap(), ka, kb)
    }

    #[tokio::test]
    async fn handshake_identifies_both_sides() {
        let (a, b, ka, kb) = pair().await;
        assert_eq!(a.peer, kb.peer_id());
        assert_eq!(b.peer, ka.peer_id());
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (mut a, mut b, _, _) = pair().await;
        let open = Frame::Open {
            channel: 2,
            protocol: "shoal/transfer/1".into(),
        };
        let reply = Frame::OpenReply {
            channel: 2,
            outcome: OpenOutcome::Granted,
        };
        a.writer.send(&open).await.unwrap();
        a.writer
            .send(&Frame::Close {
                channel: 2,
                code: CloseCode::Done,
            })
            .await
            .unwrap();
        b.writer.send(&reply).await.unwrap();
        assert_eq!(b.reader.next_frame().await.unwrap(), Some(open));
        assert!(matches!(
            b.reader.next_frame().await.unwrap(),
            Some(Frame::Close { .. })
        ));
        assert_eq!(a.reader.next_frame().await.unwrap(), Some(reply));
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (mut a, mut b, _, _) = pair().await;
        a.writer.shutdown().await.unwrap();
        assert_eq!(b.reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn forged_identity_is_rejected() {
        let ka = Keypair::generate();
        let (sa, mut sb) = tokio::io::duplex(1024);
        let mut forged = handshake_bytes(&Keypair::generate());
        forged[1..1 + PEER_ID_LEN].copy_from_slice(Keypair::generate().peer_id().as_bytes());
        let remote = async move {
            let mut buf = [0u8; HANDSHAKE_SIZE];
            sb.read_exact(&mut buf).await.unwrap();
            sb.write_all(&forged).await.unwrap();
            sb
        };
        let (res, _keep) = tokio::join!(establish(sa, &ka, true), remote);
        assert_eq!(res.err().map(|e| e.kind()), Some(io::ErrorKind::InvalidData));
    }
}
