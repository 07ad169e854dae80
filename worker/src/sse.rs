/// Incremental decoder for `text/event-stream` bodies.
///
/// Buffers raw bytes so multi-byte characters split across chunks survive,
/// and yields the joined `data:` payload of each complete event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and drain every event it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((end, separator)) = event_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + separator).collect();
            if let Some(data) = extract_data(&String::from_utf8_lossy(&frame[..end])) {
                events.push(data);
            }
        }

        events
    }

    /// Flush a trailing event the server did not terminate with a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        extract_data(&String::from_utf8_lossy(&rest))
    }

    /// Decode a complete body in one shot.
    pub fn decode_all(body: &str) -> Vec<String> {
        let mut decoder = Self::new();
        let mut events = decoder.feed(body.as_bytes());
        events.extend(decoder.finish());
        events
    }
}

/// Position and length of the first blank-line separator.
fn event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buf, b"\n\n").map(|i| (i, 2));
    let crlf = find(buf, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn extract_data(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value).trim_end_matches('\r'))
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
