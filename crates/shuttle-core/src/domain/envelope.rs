//! Envelope - ジョブのワイヤ表現
//!
//! Wire format: ASCII decimal TTR seconds, `;`, then the payload bytes as-is.
//!
//! ```text
//! 300;{"name":"shuttle"}
//! ```
//!
//! Decoding splits on the FIRST `;` only. The payload is never escaped, so an
//! embedded `;` survives a round trip but a payload must not try to smuggle its
//! own TTR prefix past the codec.

use std::time::Duration;

const DELIMITER: u8 = b';';

/// Job payload plus its time-to-run budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ttr: Duration,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope has no ';' delimiter")]
    MissingDelimiter,

    #[error("envelope ttr '{0}' is not a decimal number of seconds")]
    InvalidTtr(String),
}

impl Envelope {
    pub fn new(ttr: Duration, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ttr,
            payload: payload.into(),
        }
    }

    /// Serialize to `"<ttr>;<payload>"`. Sub-second parts of the TTR are dropped.
    pub fn encode(&self) -> Vec<u8> {
        let ttr = self.ttr.as_secs().to_string();
        let mut out = Vec::with_capacity(ttr.len() + 1 + self.payload.len());
        out.extend_from_slice(ttr.as_bytes());
        out.push(DELIMITER);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let split = bytes
            .iter()
            .position(|b| *b == DELIMITER)
            .ok_or(EnvelopeError::MissingDelimiter)?;
        let (ttr, rest) = bytes.split_at(split);

        let ttr_text = String::from_utf8_lossy(ttr);
        if ttr.is_empty() || !ttr.iter().all(u8::is_ascii_digit) {
            return Err(EnvelopeError::InvalidTtr(ttr_text.into_owned()));
        }
        let secs: u64 = ttr_text
            .parse()
            .map_err(|_| EnvelopeError::InvalidTtr(ttr_text.to_string()))?;

        Ok(Self {
            ttr: Duration::from_secs(secs),
            payload: rest[1..].to_vec(),
        })
    }
}
