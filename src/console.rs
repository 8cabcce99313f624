//! OTA Upload Tool
//! Console module: where process output ends up
//!
//! Holds the display sink contract used by the launcher, the helpers that
//! turn raw output bytes into text, and the text buffer rendered by the UI.

use tokio::sync::mpsc;

/// Append-only destination for text produced during an upload.
///
/// Each chunk must be visible to the user before the next one arrives.
pub trait DisplaySink {
    fn append(&mut self, chunk: &str);
}

#[cfg(test)]
impl DisplaySink for Vec<String> {
    fn append(&mut self, chunk: &str) {
        self.push(chunk.to_string());
    }
}

/// Sink that forwards chunks to the UI thread
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    ctx: Option<egui::Context>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx, ctx: None }
    }

    /// Wake the UI whenever a chunk is sent
    pub fn with_repaint(mut self, ctx: egui::Context) -> Self {
        self.ctx = Some(ctx);
        self
    }
}

impl DisplaySink for ChannelSink {
    fn append(&mut self, chunk: &str) {
        // Receiver gone means the window closed, nothing left to show
        let _ = self.tx.send(chunk.to_string());
        if let Some(ctx) = &self.ctx {
            ctx.request_repaint();
        }
    }
}

/// Incremental UTF-8 decoder for output read in arbitrary pieces.
///
/// A multi-byte character split across two reads is held back until the
/// rest of it arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated sequence at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    /// Whatever is still buffered once the stream has ended
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Collects text and hands it back one complete line at a time
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// Returns every line completed by `text`, each ending in `\n`
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let rest = self.partial.split_off(pos + 1);
            lines.push(std::mem::replace(&mut self.partial, rest));
        }
        lines
    }

    /// Trailing text without a newline, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// Text shown in the console area.
///
/// `\r\n` is treated as a newline. A lone `\r` returns to the start of the
/// current line, so tools that redraw a progress counter update it in place.
#[derive(Debug, Default)]
pub struct ConsoleBuffer {
    text: String,
    line_start: usize,
    pending_cr: bool,
}

impl ConsoleBuffer {
    pub fn append(&mut self, chunk: &str) {
        for c in chunk.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if c != '\n' {
                    self.text.truncate(self.line_start);
                }
            }

            match c {
                '\r' => {
                    self.pending_cr = true;
                }
                '\n' => {
                    self.text.push('\n');
                    self.line_start = self.text.len();
                }
                _ => self.text.push(c),
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.line_start = 0;
        self.pending_cr = false;
    }
}

impl DisplaySink for ConsoleBuffer {
    fn append(&mut self, chunk: &str) {
        ConsoleBuffer::append(self, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut decoder = Utf8ChunkDecoder::default();
        assert_eq!(decoder.push(b"Progress: [==="), "Progress: [===");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_joins_split_character() {
        let bytes = "µs".as_bytes();
        let mut decoder = Utf8ChunkDecoder::default();

        assert_eq!(decoder.push(&bytes[..1]), "");
        assert_eq!(decoder.push(&bytes[1..]), "µs");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8ChunkDecoder::default();
        assert_eq!(decoder.push(b"ok\xffdone"), "ok\u{FFFD}done");
    }

    #[test]
    fn test_decoder_flushes_truncated_tail() {
        let mut decoder = Utf8ChunkDecoder::default();
        assert_eq!(decoder.push(b"end\xc3"), "end");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_line_buffer_splits_and_holds_partial() {
        let mut lines = LineBuffer::default();

        assert!(lines.push("st-flash 1.7").is_empty());
        assert_eq!(lines.push(".0\nFlash written\nRese"), vec![
            "st-flash 1.7.0\n".to_string(),
            "Flash written\n".to_string()
        ]);
        assert_eq!(lines.push("t done\n"), vec!["Reset done\n".to_string()]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_buffer_finish_returns_remainder() {
        let mut lines = LineBuffer::default();
        lines.push("no newline");
        assert_eq!(lines.finish(), Some("no newline".to_string()));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_console_crlf_is_newline() {
        let mut console = ConsoleBuffer::default();
        console.append("Authenticating... done!\r");
        console.append("\nUploading\r\n");
        assert_eq!(console.as_str(), "Authenticating... done!\nUploading\n");
    }

    #[test]
    fn test_console_carriage_return_redraws_line() {
        let mut console = ConsoleBuffer::default();
        console.append("header\n 10%\r 55%\r100%\n");
        assert_eq!(console.as_str(), "header\n100%\n");
    }

    #[test]
    fn test_console_clear_resets_state() {
        let mut console = ConsoleBuffer::default();
        console.append("abc\r");
        console.clear();
        console.append("x");
        assert_eq!(console.as_str(), "x");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);

        sink.append("one");
        sink.append("two");
        drop(sink);

        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert_eq!(rx.recv().await, None);
    }
}
