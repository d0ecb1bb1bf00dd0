//! Server-Sent Events decoding for streaming backends.

use futures::stream::BoxStream;
use futures::StreamExt;

use super::ProviderError;

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// `event:` field, empty when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental frame decoder. Feed it raw bytes as they arrive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let (end, sep) = find_boundary(&self.buf)?;
            let raw: Vec<u8> = self.buf.drain(..end + sep).collect();
            let text = String::from_utf8_lossy(&raw[..end]);

            let mut event = String::new();
            let mut data_lines = Vec::new();
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                }
            }
            // Comment-only frames (": keepalive") carry nothing.
            if event.is_empty() && data_lines.is_empty() {
                continue;
            }
            return Some(SseFrame {
                event,
                data: data_lines.join("\n"),
            });
        }
    }
}

/// Position of the first blank-line boundary and its length.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Decode a streaming HTTP response body into SSE frames.
pub fn frames(response: reqwest::Response) -> BoxStream<'static, Result<SseFrame, ProviderError>> {
    let stream = async_stream::try_stream! {
        let mut decoder = SseDecoder::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(ProviderError::from)?;
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame() {
                yield frame;
            }
        }
        // A final frame without its trailing blank line.
        decoder.push(b"\n\n");
        while let Some(frame) = decoder.next_frame() {
            yield frame;
        }
    };
    stream.boxed()
}
