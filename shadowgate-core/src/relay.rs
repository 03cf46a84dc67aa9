use crate::cipher::SealingKey;
use crate::error::{Error, Result};
use crate::protocol::{
    unix_now_secs, FixedLengthResponseHeader, TargetAddr, MAX_CHUNK_LEN,
};
use crate::server::ServerState;
use crate::session::{Session, SessionEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_util::sync::CancellationToken;

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Server→client framing. A single nonce sequence spans the response
/// header and every record after it, so one encoder instance must seal
/// everything the session sends back.
pub struct ResponseEncoder {
    sealer: SealingKey,
    response_salt: Vec<u8>,
    request_salt: Vec<u8>,
    sent_initial_response: bool,
}

impl ResponseEncoder {
    pub fn new(state: &ServerState, request_salt: Vec<u8>) -> Result<Self> {
        let suite = state.suite;
        let response_salt = suite.random_salt()?;
        let subkey = suite.derive_subkey(&state.psk, &response_salt)?;
        Ok(Self {
            sealer: SealingKey::new(suite, &subkey),
            response_salt,
            request_salt,
            sent_initial_response: false,
        })
    }

    /// Frame one remote read for the client. The first call carries the
    /// response salt and the fixed response header; the header's length
    /// field stands in for the first chunk's length prefix. Reads larger
    /// than a u16 length field are split into successive records.
    pub fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut wire = Vec::with_capacity(plaintext.len() + 128);
        for chunk in plaintext.chunks(MAX_CHUNK_LEN) {
            if !self.sent_initial_response {
                wire.extend_from_slice(&self.response_salt);
                let header = FixedLengthResponseHeader {
                    timestamp: unix_now_secs(),
                    request_salt: self.request_salt.clone(),
                    length: chunk.len() as u16,
                };
                wire.extend_from_slice(&self.sealer.seal(&header.encode())?);
                self.sent_initial_response = true;
            } else {
                let prefix = (chunk.len() as u16).to_be_bytes();
                wire.extend_from_slice(&self.sealer.seal(&prefix)?);
            }
            wire.extend_from_slice(&self.sealer.seal(chunk)?);
        }
        Ok(wire)
    }
}

/// Dial the request target. Domains resolve to a list of endpoints tried
/// in order; the first successful connect wins.
async fn connect_target(target: &TargetAddr) -> Result<TcpStream> {
    let stream = match target {
        TargetAddr::Ip(addr) => TcpStream::connect(*addr).await.map_err(|e| {
            tracing::debug!("connect to {} failed: {}", addr, e);
            Error::CantConnectToRemote {
                target: target.to_string(),
            }
        })?,
        TargetAddr::Domain(host, port) => {
            let endpoints = lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| {
                    tracing::debug!("resolve {} failed: {}", host, e);
                    Error::CantConnectToRemote {
                        target: target.to_string(),
                    }
                })?;
            let mut connected = None;
            for endpoint in endpoints {
                match TcpStream::connect(endpoint).await {
                    Ok(stream) => {
                        connected = Some(stream);
                        break;
                    }
                    Err(e) => tracing::debug!("connect to {} failed: {}", endpoint, e),
                }
            }
            connected.ok_or_else(|| Error::CantConnectToRemote {
                target: target.to_string(),
            })?
        }
    };
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Run one client session to completion and tear the sockets down.
/// Peer closes end with a graceful FIN; protocol, crypto, and dial
/// failures close the client abortively so it observes an RST.
pub async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    client.set_nodelay(true).ok();
    match relay(&mut client, peer, &state, &cancel).await {
        Ok(()) => {
            let _ = client.shutdown().await;
        }
        Err(e) if e.is_peer_close() => {
            crate::logging::log_error(&e, Some(&format!("session with {}", peer)));
            let _ = client.shutdown().await;
        }
        Err(e) => {
            tracing::warn!("session with {} aborted [{}]: {}", peer, e.code(), e);
            // SO_LINGER(1, 0): the drop below emits an RST instead of a FIN.
            let _ = client.set_linger(Some(Duration::from_secs(0)));
        }
    }
}

async fn relay(
    client: &mut TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut session = Session::new(Arc::clone(state));

    // Accumulate client bytes until the variable header yields the target.
    let (target, initial_payload) = loop {
        match session.advance()? {
            Some(SessionEvent::TargetReady {
                target,
                initial_payload,
            }) => break (target, initial_payload),
            Some(SessionEvent::Payload(_)) => {
                return Err(Error::internal("payload event before variable header"));
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    read = client.read_buf(session.buffer_mut()) => {
                        if read? == 0 {
                            return Err(Error::ClientDisconnected);
                        }
                    }
                }
            }
        }
    };

    let mut remote = connect_target(&target).await?;
    tracing::debug!("{} -> {} connected", peer, target);

    let mut responder = ResponseEncoder::new(state, session.request_salt().to_vec())?;

    if !initial_payload.is_empty() {
        remote
            .write_all(&initial_payload)
            .await
            .map_err(|_| Error::RemoteDisconnected)?;
    }

    // The client may have pipelined payload records behind the handshake in
    // the same burst; drain whatever is already buffered before waiting for
    // new reads.
    while let Some(event) = session.advance()? {
        match event {
            SessionEvent::Payload(chunk) => {
                remote
                    .write_all(&chunk)
                    .await
                    .map_err(|_| Error::RemoteDisconnected)?;
            }
            SessionEvent::TargetReady { .. } => {
                return Err(Error::internal("second variable header"));
            }
        }
    }

    // Pump both directions until one side goes away. The remote socket is
    // dropped with this frame on every exit path.
    let mut remote_buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = client.read_buf(session.buffer_mut()) => {
                if read? == 0 {
                    return Err(Error::ClientDisconnected);
                }
                while let Some(event) = session.advance()? {
                    match event {
                        SessionEvent::Payload(chunk) => {
                            remote
                                .write_all(&chunk)
                                .await
                                .map_err(|_| Error::RemoteDisconnected)?;
                        }
                        SessionEvent::TargetReady { .. } => {
                            return Err(Error::internal("second variable header"));
                        }
                    }
                }
            }
            read = remote.read(&mut remote_buf) => {
                let n = read.map_err(|_| Error::RemoteDisconnected)?;
                if n == 0 {
                    return Err(Error::RemoteDisconnected);
                }
                let wire = responder.encode(&remote_buf[..n])?;
                client
                    .write_all(&wire)
                    .await
                    .map_err(|_| Error::ClientDisconnected)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherSuite, OpeningKey, TAG_LEN};
    use crate::protocol::FIXED_REQUEST_HEADER_LEN;
    use crate::replay::SaltCache;

    const SUITE: CipherSuite = CipherSuite::Aes256Gcm;

    fn server_state() -> ServerState {
        ServerState {
            suite: SUITE,
            psk: vec![0u8; 32],
            salt_cache: SaltCache::new(),
        }
    }

    /// Client-side view of the response stream, for decoding what the
    /// encoder produced.
    struct ResponseReader<'a> {
        wire: &'a [u8],
        opener: OpeningKey,
    }

    impl<'a> ResponseReader<'a> {
        fn new(state: &ServerState, wire: &'a [u8]) -> Self {
            let salt = &wire[..SUITE.salt_len()];
            let subkey = SUITE.derive_subkey(&state.psk, salt).unwrap();
            Self {
                wire: &wire[SUITE.salt_len()..],
                opener: OpeningKey::new(SUITE, &subkey),
            }
        }

        fn open(&mut self, ciphertext_len: usize) -> Vec<u8> {
            let (record, rest) = self.wire.split_at(ciphertext_len + TAG_LEN);
            self.wire = rest;
            self.opener.open(record).unwrap()
        }
    }

    #[test]
    fn first_encode_carries_salt_header_and_chunk() {
        let state = server_state();
        let request_salt = vec![0x5A; SUITE.salt_len()];
        let mut encoder = ResponseEncoder::new(&state, request_salt.clone()).unwrap();

        let wire = encoder.encode(b"welcome back").unwrap();
        let mut reader = ResponseReader::new(&state, &wire);

        let header_plain = reader.open(FIXED_REQUEST_HEADER_LEN + SUITE.salt_len());
        let header =
            FixedLengthResponseHeader::decode(&header_plain, SUITE.salt_len()).unwrap();
        assert_eq!(header.request_salt, request_salt);
        assert_eq!(header.length as usize, b"welcome back".len());

        assert_eq!(reader.open(b"welcome back".len()), b"welcome back");
        assert!(reader.wire.is_empty());
    }

    #[test]
    fn later_encodes_use_length_prefixes_on_one_nonce_sequence() {
        let state = server_state();
        let mut encoder = ResponseEncoder::new(&state, vec![0; SUITE.salt_len()]).unwrap();

        let first = encoder.encode(b"one").unwrap();
        let second = encoder.encode(b"two!").unwrap();

        let mut wire = first;
        wire.extend_from_slice(&second);
        let mut reader = ResponseReader::new(&state, &wire);

        let _header = reader.open(FIXED_REQUEST_HEADER_LEN + SUITE.salt_len());
        assert_eq!(reader.open(3), b"one");
        let prefix = reader.open(2);
        assert_eq!(u16::from_be_bytes([prefix[0], prefix[1]]), 4);
        assert_eq!(reader.open(4), b"two!");
        assert!(reader.wire.is_empty());
    }

    #[test]
    fn oversized_reads_are_split_into_chunks() {
        let state = server_state();
        let mut encoder = ResponseEncoder::new(&state, vec![0; SUITE.salt_len()]).unwrap();

        let big = vec![0xCD; MAX_CHUNK_LEN + 1000];
        let wire = encoder.encode(&big).unwrap();
        let mut reader = ResponseReader::new(&state, &wire);

        let header_plain = reader.open(FIXED_REQUEST_HEADER_LEN + SUITE.salt_len());
        let header =
            FixedLengthResponseHeader::decode(&header_plain, SUITE.salt_len()).unwrap();
        assert_eq!(header.length as usize, MAX_CHUNK_LEN);

        let mut got = reader.open(MAX_CHUNK_LEN);
        let prefix = reader.open(2);
        let tail_len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
        assert_eq!(tail_len, 1000);
        got.extend_from_slice(&reader.open(tail_len));
        assert_eq!(got, big);
        assert!(reader.wire.is_empty());
    }
}
