use crate::models::{ReportTask, TaskSnapshot};

pub const MAX_REPORT_STREAM_BYTES: usize = 65535;

/// Turns captured bytes into report text. Platforms whose scripts emit a
/// non-UTF-8 code page plug their own decoder in here.
pub trait OutputDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> String;
}

pub struct Utf8Lossy;

impl OutputDecoder for Utf8Lossy {
    fn decode(&self, bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

pub struct ReportFormatter {
    decoder: Box<dyn OutputDecoder>,
    max_stream_bytes: usize,
}

impl Default for ReportFormatter {
    fn default() -> Self {
        Self {
            decoder: Box::new(Utf8Lossy),
            max_stream_bytes: MAX_REPORT_STREAM_BYTES,
        }
    }
}

impl ReportFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoder(mut self, decoder: impl OutputDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// Keeps only terminal tasks and caps each stream to its most recent
    /// bytes.
    pub fn format(&self, snapshots: impl IntoIterator<Item = TaskSnapshot>) -> Vec<ReportTask> {
        snapshots
            .into_iter()
            .filter(|snapshot| snapshot.status.is_terminal())
            .map(|snapshot| ReportTask {
                id: snapshot.id,
                clock: snapshot.clock,
                status: snapshot.status,
                stdout: self.bounded_text(&snapshot.stdout),
                stderr: self.bounded_text(&snapshot.stderr),
            })
            .collect()
    }

    fn bounded_text(&self, bytes: &[u8]) -> String {
        let text = self
            .decoder
            .decode(tail_bytes(bytes, self.max_stream_bytes));
        tail_text(text, self.max_stream_bytes)
    }
}

pub fn tail_bytes(bytes: &[u8], limit: usize) -> &[u8] {
    if bytes.len() > limit {
        &bytes[(bytes.len() - limit)..]
    } else {
        bytes
    }
}

// Decoding can grow the text (replacement characters), so cut again on a char
// boundary.
fn tail_text(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }

    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::{tail_bytes, tail_text};

    #[test]
    fn tail_bytes_keeps_latest_bytes() {
        assert_eq!(tail_bytes(b"abcdef", 4), b"cdef");
        assert_eq!(tail_bytes(b"abc", 4), b"abc");
    }

    #[test]
    fn tail_text_never_splits_a_character() {
        let text = "é".repeat(4);
        let cut = tail_text(text, 5);
        assert_eq!(cut, "éé");
    }
}
