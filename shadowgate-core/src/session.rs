use crate::cipher::{OpeningKey, TAG_LEN};
use crate::error::{Error, Result};
use crate::protocol::{
    unix_now_millis, unix_now_secs, validate_timestamp, FixedLengthRequestHeader, TargetAddr,
    VariableLengthRequestHeader, FIXED_REQUEST_HEADER_LEN,
};
use crate::replay::SALT_WINDOW_MILLIS;
use crate::server::ServerState;
use bytes::{Buf, BytesMut};
use std::sync::Arc;

/// Where the request decoder currently is. The decoder never terminates on
/// its own; after the handshake it loops between the length and payload
/// states for the life of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    WaitForFixed,
    WaitForVariable,
    WaitForLength,
    WaitForPayload,
}

/// Progress emitted by [`Session::advance`].
#[derive(Debug)]
pub enum SessionEvent {
    /// The variable header decoded: dial this target, then forward the
    /// initial payload. Emitted exactly once per session.
    TargetReady {
        target: TargetAddr,
        initial_payload: Vec<u8>,
    },
    /// One decrypted payload chunk bound for the remote.
    Payload(Vec<u8>),
}

/// Per-connection request decoder. Owns the receive buffer and the request
/// opening key; everything here is exclusive to one session task.
pub struct Session {
    state: Arc<ServerState>,
    status: DecodeStatus,
    recv: BytesMut,
    request_salt: Vec<u8>,
    opener: Option<OpeningKey>,
    /// Ciphertext length (tag excluded) the current state is waiting for.
    pending_len: usize,
}

impl Session {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            status: DecodeStatus::WaitForFixed,
            recv: BytesMut::with_capacity(32 * 1024),
            request_salt: Vec::new(),
            opener: None,
            pending_len: 0,
        }
    }

    /// The receive buffer; socket reads append here.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.recv
    }

    pub fn request_salt(&self) -> &[u8] {
        &self.request_salt
    }

    pub fn status(&self) -> DecodeStatus {
        self.status
    }

    /// Consume as much of the receive buffer as the current state allows.
    /// Returns the next event, or None once the buffer is starved.
    pub fn advance(&mut self) -> Result<Option<SessionEvent>> {
        loop {
            match self.status {
                DecodeStatus::WaitForFixed => {
                    let salt_len = self.state.suite.salt_len();
                    let need = salt_len + FIXED_REQUEST_HEADER_LEN + TAG_LEN;
                    if self.recv.len() < need {
                        return Ok(None);
                    }
                    let salt = self.recv[..salt_len].to_vec();

                    let now_ms = unix_now_millis();
                    self.state
                        .salt_cache
                        .evict_older_than(now_ms.saturating_sub(SALT_WINDOW_MILLIS));
                    if !self.state.salt_cache.try_add(&salt, now_ms) {
                        return Err(Error::DuplicateSalt);
                    }

                    let subkey = self.state.suite.derive_subkey(&self.state.psk, &salt)?;
                    let mut opener = OpeningKey::new(self.state.suite, &subkey);
                    let plain = opener.open(&self.recv[salt_len..need])?;
                    let header = FixedLengthRequestHeader::decode(&plain)?;
                    validate_timestamp(header.timestamp, unix_now_secs())?;

                    self.pending_len = header.length as usize;
                    self.request_salt = salt;
                    self.opener = Some(opener);
                    self.recv.advance(need);
                    self.status = DecodeStatus::WaitForVariable;
                }
                DecodeStatus::WaitForVariable => {
                    let need = self.pending_len + TAG_LEN;
                    if self.recv.len() < need {
                        return Ok(None);
                    }
                    let Some(opener) = self.opener.as_mut() else {
                        return Err(Error::internal("decoder has no request key"));
                    };
                    let plain = opener.open(&self.recv[..need])?;
                    let header = VariableLengthRequestHeader::decode(&plain)?;
                    self.recv.advance(need);
                    self.status = DecodeStatus::WaitForLength;
                    return Ok(Some(SessionEvent::TargetReady {
                        target: header.target,
                        initial_payload: header.initial_payload,
                    }));
                }
                DecodeStatus::WaitForLength => {
                    let need = 2 + TAG_LEN;
                    if self.recv.len() < need {
                        return Ok(None);
                    }
                    let Some(opener) = self.opener.as_mut() else {
                        return Err(Error::internal("decoder has no request key"));
                    };
                    let plain = opener.open(&self.recv[..need])?;
                    self.pending_len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    self.recv.advance(need);
                    self.status = DecodeStatus::WaitForPayload;
                }
                DecodeStatus::WaitForPayload => {
                    let need = self.pending_len + TAG_LEN;
                    if self.recv.len() < need {
                        return Ok(None);
                    }
                    let Some(opener) = self.opener.as_mut() else {
                        return Err(Error::internal("decoder has no request key"));
                    };
                    let plain = opener.open(&self.recv[..need])?;
                    self.recv.advance(need);
                    self.status = DecodeStatus::WaitForLength;
                    return Ok(Some(SessionEvent::Payload(plain)));
                }
            }
        }
    }
}
