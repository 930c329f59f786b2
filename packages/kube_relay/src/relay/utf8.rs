//! Streaming UTF-8 decoding for terminal output.

/// Decodes a byte stream chunk by chunk without splitting multi-byte characters.
///
/// Exec output arrives in arbitrary frame boundaries; a character split across
/// two frames is held back until its continuation bytes arrive.
#[derive(Debug, Default)]
pub(crate) struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode everything in `chunk` except a trailing partial character.
    /// Invalid bytes come out as U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let ready = self.pending.len() - partial_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..ready]).into_owned();
        self.pending.drain(..ready);
        text
    }

    /// Flush whatever is still buffered once the stream has ended.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Length of an unfinished (but so far valid) character at the end of `bytes`.
fn partial_tail(bytes: &[u8]) -> usize {
    let floor = bytes.len().saturating_sub(3);
    let Some(lead) = (floor..bytes.len()).rev().find(|&i| bytes[i] & 0xC0 != 0x80) else {
        return 0;
    };
    let width = match bytes[lead] {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return 0,
    };
    let have = bytes.len() - lead;
    match std::str::from_utf8(&bytes[lead..]) {
        Err(e) if have < width && e.error_len().is_none() => have,
        _ => 0,
    }
}
