//! SHAKE128 extendable-output stream
//!
//! VMESS consumes SHAKE128 as an endless pseudo-random byte source, so
//! the hasher keeps its squeeze state across reads instead of producing a
//! one-shot digest.

use crate::{Error, Result};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Shake128, Shake128Reader};

enum State {
    Absorbing(Shake128),
    Squeezing(Shake128Reader),
}

/// Incremental SHAKE128 reader with a position cursor.
///
/// Bytes are squeezed lazily on demand; successive reads continue where
/// the previous one stopped.
pub struct Shake128Stream {
    state: State,
    position: u64,
}

impl Shake128Stream {
    pub fn new() -> Self {
        Shake128Stream {
            state: State::Absorbing(Shake128::default()),
            position: 0,
        }
    }

    /// Convenience constructor: absorb `seed` and be ready to squeeze.
    pub fn seeded(seed: &[u8]) -> Self {
        let mut stream = Self::new();
        stream
            .absorb(seed)
            .expect("fresh stream is still absorbing");
        stream
    }

    /// Feed input. Only valid before the first read.
    pub fn absorb(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.state {
            State::Absorbing(hasher) => {
                hasher.update(data);
                Ok(())
            }
            State::Squeezing(_) => Err(Error::crypto("SHAKE128 stream already squeezed")),
        }
    }

    fn reader(&mut self) -> &mut Shake128Reader {
        if let State::Absorbing(hasher) = &self.state {
            let reader = hasher.clone().finalize_xof();
            self.state = State::Squeezing(reader);
        }
        match &mut self.state {
            State::Squeezing(reader) => reader,
            State::Absorbing(_) => unreachable!(),
        }
    }

    /// Squeeze the next `out.len()` bytes of the output stream.
    pub fn next_bytes(&mut self, out: &mut [u8]) {
        self.reader().read(out);
        self.position += out.len() as u64;
    }

    /// Squeeze two bytes as a big-endian u16 (the VMESS length mask).
    pub fn next_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.next_bytes(&mut buf);
        u16::from_be_bytes(buf)
    }

    /// Number of output bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Uppercase hex of the first 16 output bytes, for debugging only.
    /// Does not disturb the stream cursor.
    pub fn hex_digest(&self) -> String {
        let reader = match &self.state {
            State::Absorbing(hasher) => hasher.clone().finalize_xof(),
            State::Squeezing(_) => {
                // Cursor already moved; the debug digest is only defined
                // over the absorbed input, which is gone. Report that.
                return String::from("<squeezed>");
            }
        };
        let mut reader = reader;
        let mut out = [0u8; 16];
        reader.read(&mut out);
        hex::encode_upper(out)
    }
}

impl Default for Shake128Stream {
    fn default() -> Self {
        Self::new()
    }
}
