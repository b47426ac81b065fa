//! Audio datagram framing for the encrypted channel: `nonce(16) || ciphertext`,
//! AES-128-CTR keyed by the session key with the packet's own nonce as IV.

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::error::TransportError;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const NONCE_LEN: usize = 16;
pub const AUDIO_PACKET_TYPE: u8 = 0x01;

#[derive(Clone)]
pub struct AudioCipher {
    key: [u8; 16],
    nonce_prefix: [u8; NONCE_LEN],
    local_sequence: u32,
}

impl AudioCipher {
    pub fn from_hex(key: &str, nonce: &str) -> Result<Self, TransportError> {
        let key = decode_fixed::<16>(key, "key")?;
        let nonce_prefix = decode_fixed::<NONCE_LEN>(nonce, "nonce")?;
        Ok(Self::new(key, nonce_prefix))
    }

    pub fn new(key: [u8; 16], nonce_prefix: [u8; NONCE_LEN]) -> Self {
        Self {
            key,
            nonce_prefix,
            local_sequence: 0,
        }
    }

    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    /// Frames one payload with the next sequence number. The payload length
    /// travels in two nonce bytes, so larger payloads are refused.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            TransportError::Packet(format!("payload too large: {} bytes", payload.len()))
        })?;
        self.local_sequence = self.local_sequence.wrapping_add(1);
        let mut nonce = self.nonce_prefix;
        nonce[2..4].copy_from_slice(&len.to_be_bytes());
        nonce[12..16].copy_from_slice(&self.local_sequence.to_be_bytes());

        let mut packet = Vec::with_capacity(NONCE_LEN + payload.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(payload);
        self.apply(&nonce, &mut packet[NONCE_LEN..]);
        Ok(packet)
    }

    /// Validates the header and returns `(sequence, payload)`.
    pub fn open(&self, packet: &[u8]) -> Result<(u32, Vec<u8>), TransportError> {
        if packet.len() < NONCE_LEN {
            return Err(TransportError::Packet(format!(
                "packet too short: {} bytes",
                packet.len()
            )));
        }
        if packet[0] != AUDIO_PACKET_TYPE {
            return Err(TransportError::Packet(format!(
                "unexpected packet type 0x{:02x}",
                packet[0]
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&packet[..NONCE_LEN]);
        let sequence = u32::from_be_bytes([nonce[12], nonce[13], nonce[14], nonce[15]]);
        let mut payload = packet[NONCE_LEN..].to_vec();
        self.apply(&nonce, &mut payload);
        Ok((sequence, payload))
    }

    fn apply(&self, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        let mut cipher = Aes128Ctr::new(&self.key.into(), &(*nonce).into());
        cipher.apply_keystream(data);
    }
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N], TransportError> {
    let bytes = hex::decode(value)
        .map_err(|e| TransportError::Protocol(format!("invalid {} hex: {}", what, e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        TransportError::Protocol(format!("{} must be {} bytes, got {}", what, N, bytes.len()))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    Gap { expected: u32 },
    Stale,
}

/// Highest inbound sequence accepted so far. No reordering window: anything
/// at or below it is dropped, anything above it is taken.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    remote_sequence: u32,
}

impl SequenceTracker {
    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn accept(&mut self, sequence: u32) -> SequenceCheck {
        if sequence <= self.remote_sequence {
            return SequenceCheck::Stale;
        }
        let expected = self.remote_sequence.wrapping_add(1);
        self.remote_sequence = sequence;
        if sequence == expected {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap { expected }
        }
    }

    pub fn reset(&mut self) {
        self.remote_sequence = 0;
    }
}
