//! Sequences: register assignments for one hsct period.
//!
//! A [`Sequence`] is content-addressed. Its packet is a canonical text
//! encoding (registers in name order, then the flag word) and its id is the
//! SHA-256 of that packet, so equal sequences always share one cached packet
//! on the FPGA.

pub mod composer;
pub mod queue;

pub use composer::{DelaySequences, SequenceComposer, SequenceMode};
pub use queue::{SequencerQueue, UploadOutcome};

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Flags carried by a sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceFlags {
    pub acquiring: bool,
    pub image_number_inc: bool,
    pub pump_on: bool,
    pub laser_on: bool,
    pub xdet_on: bool,
    pub xosct_on: bool,
    pub losct_on: bool,
    pub ms_on: bool,
    pub trans_on: bool,
}

const FLAG_NAMES: [&str; 9] = [
    "acquiring",
    "image_number_inc",
    "pump_on",
    "laser_on",
    "xdet_on",
    "xosct_on",
    "losct_on",
    "ms_on",
    "trans_on",
];

impl SequenceFlags {
    fn as_array(&self) -> [bool; 9] {
        [
            self.acquiring,
            self.image_number_inc,
            self.pump_on,
            self.laser_on,
            self.xdet_on,
            self.xosct_on,
            self.losct_on,
            self.ms_on,
            self.trans_on,
        ]
    }

    fn from_array(bits: [bool; 9]) -> Self {
        Self {
            acquiring: bits[0],
            image_number_inc: bits[1],
            pump_on: bits[2],
            laser_on: bits[3],
            xdet_on: bits[4],
            xosct_on: bits[5],
            losct_on: bits[6],
            ms_on: bits[7],
            trans_on: bits[8],
        }
    }

    /// Flag word, bit `k` set for `FLAG_NAMES[k]`.
    pub fn bits(&self) -> u16 {
        self.as_array()
            .iter()
            .enumerate()
            .fold(0, |word, (k, on)| word | (u16::from(*on) << k))
    }

    /// Inverse of [`SequenceFlags::bits`].
    pub fn from_bits(word: u16) -> Self {
        let mut bits = [false; 9];
        for (k, bit) in bits.iter_mut().enumerate() {
            *bit = word & (1 << k) != 0;
        }
        Self::from_array(bits)
    }

    /// Names of the flags that are set.
    pub fn names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .zip(self.as_array())
            .filter(|(_, on)| *on)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Register assignments and flags for one hsct period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sequence {
    pub registers: BTreeMap<String, i64>,
    pub flags: SequenceFlags,
}

impl Sequence {
    /// Canonical packet bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut text = String::new();
        for (name, count) in &self.registers {
            text.push_str(name);
            text.push('=');
            text.push_str(&count.to_string());
            text.push('\n');
        }
        text.push_str(&format!("flags={}\n", self.flags.bits()));
        text.into_bytes()
    }

    /// Parse packet bytes produced by [`Sequence::encode`].
    pub fn decode(packet: &[u8]) -> AppResult<Self> {
        let text = std::str::from_utf8(packet)
            .map_err(|e| DaqError::Transport(format!("sequence packet is not UTF-8: {e}")))?;
        let mut sequence = Sequence::default();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| DaqError::Transport(format!("bad packet line {line:?}")))?;
            if name == "flags" {
                let word = value
                    .parse::<u16>()
                    .map_err(|e| DaqError::Transport(format!("bad flag word {value:?}: {e}")))?;
                sequence.flags = SequenceFlags::from_bits(word);
            } else {
                let count = value
                    .parse::<i64>()
                    .map_err(|e| DaqError::Transport(format!("bad count {value:?}: {e}")))?;
                sequence.registers.insert(name.to_string(), count);
            }
        }
        Ok(sequence)
    }

    /// Content hash (hex SHA-256 of the packet).
    pub fn id(&self) -> String {
        format!("{:x}", Sha256::digest(self.encode()))
    }
}

/// Hash of a queue: SHA-256 over the ordered packet ids.
pub fn queue_hash(ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(delay: i64) -> Sequence {
        let mut s = Sequence::default();
        s.registers.insert("ch3_delay".into(), delay);
        s.registers.insert("ch3_enable".into(), 1);
        s.flags.acquiring = true;
        s.flags.laser_on = true;
        s
    }

    #[test]
    fn test_content_addressing() {
        assert_eq!(sample(100), sample(100));
        assert_eq!(sample(100).id(), sample(100).id());
        assert_ne!(sample(100).id(), sample(101).id());
        let mut other = sample(100);
        other.flags.image_number_inc = true;
        assert_ne!(sample(100).id(), other.id());
    }

    #[test]
    fn test_packet_decodes_to_same_sequence() {
        let s = sample(-42);
        assert_eq!(Sequence::decode(&s.encode()).unwrap(), s);
        assert!(Sequence::decode(b"garbage").is_err());
    }

    #[test]
    fn test_flag_names() {
        let flags = SequenceFlags::from_bits(0b1001);
        assert_eq!(flags.names(), vec!["acquiring", "laser_on"]);
        assert_eq!(flags.bits(), 0b1001);
    }

    #[test]
    fn test_queue_hash_depends_on_order() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "x".to_string()];
        assert_ne!(queue_hash(&a), queue_hash(&b));
        assert_eq!(queue_hash(&a), queue_hash(&a.clone()));
    }
}
