//! Splits the raw serial byte stream into complete telemetry lines.

/// Unterminated input longer than this is treated as garbage and dropped.
pub const MAX_PARTIAL_BYTES: usize = 8192;

/// Prefixes the firmware prints while booting; never telemetry.
pub const DEFAULT_BOOT_NOISE_PREFIXES: &[&str] = &["ets ", "rst:", "boot:", "load:", "entry "];

/// Outcome of feeding one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FramedLines {
    /// Complete telemetry candidates, in arrival order.
    pub lines: Vec<String>,
    /// Terminated lines that were dropped as boot noise.
    pub boot_noise: usize,
    /// Whether the partial buffer overflowed and was discarded.
    pub trimmed: bool,
}

#[derive(Debug, Clone)]
pub struct LineFramer {
    partial: Vec<u8>,
    noise_prefixes: Vec<String>,
    /// Set after an overflow; bytes are dropped up to the next terminator.
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_noise_prefixes(DEFAULT_BOOT_NOISE_PREFIXES.iter().map(|p| p.to_string()).collect())
    }

    pub fn with_noise_prefixes(noise_prefixes: Vec<String>) -> Self {
        Self { partial: Vec::new(), noise_prefixes, discarding: false }
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Bytes are buffered rather than decoded per chunk so a multi-byte
    /// character split across two reads is reassembled intact.
    pub fn feed(&mut self, chunk: &[u8]) -> FramedLines {
        let mut out = FramedLines::default();
        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    chunk = &chunk[pos + 1..];
                    self.discarding = false;
                }
                None => return out,
            }
        }
        self.partial.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(pos) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let raw = String::from_utf8_lossy(&self.partial[start..end]);
            let line = raw.trim();
            start = end + 1;

            if line.is_empty() {
                continue;
            }
            if self.is_boot_noise(line) {
                log::debug!("Dropping boot noise line: {}", line);
                out.boot_noise += 1;
                continue;
            }
            out.lines.push(line.to_string());
        }
        self.partial.drain(..start);

        if self.partial.len() > MAX_PARTIAL_BYTES {
            log::warn!("Discarding {} unterminated bytes from serial stream", self.partial.len());
            self.partial.clear();
            self.discarding = true;
            out.trimmed = true;
        }
        out
    }

    pub fn feed_str(&mut self, chunk: &str) -> FramedLines {
        self.feed(chunk.as_bytes())
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.discarding = false;
    }

    fn is_boot_noise(&self, line: &str) -> bool {
        self.noise_prefixes.iter().any(|p| line.starts_with(p.as_str()))
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
