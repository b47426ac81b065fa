//! Built-in sound cues stored as P3 files: back-to-back records of
//! `{type: u8, reserved: u8, payload_size: u16 BE, payload}` where each payload
//! is one 16 kHz / 60 ms opus frame.

use std::collections::HashMap;
use std::path::Path;

use crate::audio::AudioPacket;
use crate::error::AssetError;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sound {
    Success,
    Exclamation,
    Vibration,
    Upgrade,
    Activation,
    Digit(u8),
}

impl Sound {
    pub fn file_name(self) -> String {
        match self {
            Sound::Success => "success.p3".to_string(),
            Sound::Exclamation => "exclamation.p3".to_string(),
            Sound::Vibration => "vibration.p3".to_string(),
            Sound::Upgrade => "upgrade.p3".to_string(),
            Sound::Activation => "activation.p3".to_string(),
            Sound::Digit(d) => format!("{}.p3", d),
        }
    }

    /// Maps an activation-code character to its spoken digit.
    pub fn for_digit(c: char) -> Option<Sound> {
        c.to_digit(10).map(|d| Sound::Digit(d as u8))
    }

    fn all() -> impl Iterator<Item = Sound> {
        [
            Sound::Success,
            Sound::Exclamation,
            Sound::Vibration,
            Sound::Upgrade,
            Sound::Activation,
        ]
        .into_iter()
        .chain((0..10).map(Sound::Digit))
    }
}

pub fn read_p3(data: &[u8]) -> Result<Vec<AudioPacket>, AssetError> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = data
            .get(offset..offset + HEADER_LEN)
            .ok_or(AssetError::TruncatedHeader(offset))?;
        let payload_size = u16::from_be_bytes([header[2], header[3]]) as usize;
        let start = offset + HEADER_LEN;
        let payload = data
            .get(start..start + payload_size)
            .ok_or(AssetError::TruncatedPayload {
                offset: start,
                needed: payload_size,
                available: data.len() - start,
            })?;
        packets.push(payload.to_vec());
        offset = start + payload_size;
    }
    Ok(packets)
}

#[derive(Debug, Default, Clone)]
pub struct SoundBank {
    sounds: HashMap<Sound, Vec<u8>>,
}

impl SoundBank {
    pub fn load(dir: &Path) -> Self {
        let mut sounds = HashMap::new();
        for sound in Sound::all() {
            let path = dir.join(sound.file_name());
            match std::fs::read(&path) {
                Ok(bytes) => {
                    sounds.insert(sound, bytes);
                }
                Err(err) => {
                    tracing::debug!("sound cue '{}' unavailable: {}", path.display(), err);
                }
            }
        }
        tracing::info!("loaded {} sound cues from '{}'", sounds.len(), dir.display());
        Self { sounds }
    }

    pub fn insert(&mut self, sound: Sound, bytes: Vec<u8>) {
        self.sounds.insert(sound, bytes);
    }

    pub fn get(&self, sound: Sound) -> Option<&[u8]> {
        self.sounds.get(&sound).map(Vec::as_slice)
    }
}

#[cfg(test)]
pub(crate) fn encode_p3(payloads: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
    }
    out
}
