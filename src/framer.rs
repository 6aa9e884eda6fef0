use serde_json::Value;
use tracing::debug;

/// Noise accumulated outside an object is dropped once it exceeds this size.
pub const NOISE_LIMIT: usize = 100_000;

/// An object still open after this many bytes is abandoned.
pub const MAX_OBJECT_BYTES: usize = 8 * 1024 * 1024;

/// Splits `intel_gpu_top -J` output into objects by brace balance. Braces
/// inside string literals are not counted.
#[derive(Debug, Default)]
pub struct JsonFramer {
    buf: Vec<u8>,
    depth: usize,
    in_object: bool,
    start: usize,
    in_string: bool,
    escaped: bool,
    decoded: u64,
    dropped: u64,
}

impl JsonFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();

        for &byte in chunk {
            self.buf.push(byte);

            if self.in_object && self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'{' => {
                    if !self.in_object {
                        self.in_object = true;
                        self.start = self.buf.len() - 1;
                    }
                    self.depth += 1;
                }
                b'"' if self.in_object => self.in_string = true,
                b'}' if self.in_object => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(value) = self.take_object() {
                            out.push(value);
                        }
                    }
                }
                _ => {}
            }
        }

        if !self.in_object && self.buf.len() > NOISE_LIMIT {
            debug!(bytes = self.buf.len(), "discarding non-JSON output");
            self.buf.clear();
        } else if self.in_object && self.buf.len() - self.start > MAX_OBJECT_BYTES {
            debug!(
                bytes = self.buf.len() - self.start,
                "abandoning oversized JSON object"
            );
            self.dropped += 1;
            self.reset();
        }

        out
    }

    fn take_object(&mut self) -> Option<Value> {
        let result = serde_json::from_slice::<Value>(&self.buf[self.start..]);
        self.reset();
        match result {
            Ok(value) => {
                self.decoded += 1;
                Some(value)
            }
            Err(err) => {
                self.dropped += 1;
                debug!(error = %err, "dropping malformed JSON object");
                None
            }
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.depth = 0;
        self.in_object = false;
        self.start = 0;
        self.in_string = false;
        self.escaped = false;
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn in_object(&self) -> bool {
        self.in_object
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAM: &str = concat!(
        "[\n",
        r#"{"period":{"duration":1000.2,"unit":"ms"},"frequency":{"requested":300.0,"actual":300.0,"unit":"MHz"},"rc6":{"value":92.5,"unit":"%"},"power":{"GPU":1.25,"Package":6.5,"unit":"W"},"engines":{"Render/3D/0":{"busy":4.5,"sema":0.0,"wait":0.0,"unit":"%"},"Video/0":{"busy":20.0,"sema":0.0,"wait":0.0,"unit":"%"}}}"#,
        ",\n",
        r#"{"frequency":{"requested":1100.0,"actual":1050.0},"engines":{"Blitter/0":{"busy":0.0}}}"#,
        ",\n",
        r#"{"engines":{}}"#,
    );

    fn feed_all(framer: &mut JsonFramer, chunks: &[&[u8]]) -> Vec<Value> {
        chunks.iter().flat_map(|c| framer.feed(c)).collect()
    }

    #[test]
    fn whole_stream_yields_objects_in_order() {
        let mut framer = JsonFramer::new();
        let objects = framer.feed(STREAM.as_bytes());
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0]["power"]["GPU"], json!(1.25));
        assert_eq!(objects[1]["frequency"]["actual"], json!(1050.0));
        assert_eq!(objects[2], json!({"engines": {}}));
        assert_eq!(framer.decoded(), 3);
        assert_eq!(framer.dropped(), 0);
    }

    #[test]
    fn chunk_boundaries_do_not_change_output() {
        let expected = JsonFramer::new().feed(STREAM.as_bytes());
        let bytes = STREAM.as_bytes();

        let mut framer = JsonFramer::new();
        let one_byte: Vec<Value> = bytes.iter().flat_map(|b| framer.feed(&[*b])).collect();
        assert_eq!(one_byte, expected);

        for size in [2, 3, 7, 16, 61, 128] {
            let mut framer = JsonFramer::new();
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(feed_all(&mut framer, &chunks), expected, "chunk size {size}");
        }

        // Split inside a token and inside whitespace.
        let at = STREAM.find("busy").unwrap() + 2;
        let mut framer = JsonFramer::new();
        assert_eq!(feed_all(&mut framer, &[&bytes[..at], &bytes[at..]]), expected);
        let at = STREAM.find(",\n").unwrap() + 1;
        let mut framer = JsonFramer::new();
        assert_eq!(feed_all(&mut framer, &[&bytes[..at], &bytes[at..]]), expected);
    }

    #[test]
    fn noise_between_objects_is_skipped() {
        let mut framer = JsonFramer::new();
        let out = framer.feed(b"{\"a\":1}\nWARNING: something odd ] , happened\n{\"b\":2}");
        assert_eq!(out, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn stray_closing_brace_outside_object_is_ignored() {
        let mut framer = JsonFramer::new();
        let out = framer.feed(b"log line with } and }} in it\n{\"b\":2}");
        assert_eq!(out, vec![json!({"b": 2})]);
    }

    #[test]
    fn malformed_object_is_dropped_and_next_one_decodes() {
        let mut framer = JsonFramer::new();
        let out = framer.feed(b"{\"a\": nope}{\"b\":2}");
        assert_eq!(out, vec![json!({"b": 2})]);
        assert_eq!(framer.dropped(), 1);
        assert_eq!(framer.decoded(), 1);
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn braces_inside_strings_are_not_structure() {
        let mut framer = JsonFramer::new();
        let out = framer.feed(br#"{"msg":"a{b}c"}"#);
        assert_eq!(out, vec![json!({"msg": "a{b}c"})]);

        // Unbalanced braces in a string would desynchronise a plain brace
        // counter; both objects must still come out.
        let out = framer.feed(br#"{"msg":"a{b"}{"x":1}"#);
        assert_eq!(out, vec![json!({"msg": "a{b"}), json!({"x": 1})]);

        let out = framer.feed(br#"{"m":"q\"}{\\"}{"y":2}"#);
        assert_eq!(out, vec![json!({"m": "q\"}{\\"}), json!({"y": 2})]);
    }

    #[test]
    fn escape_split_across_chunks() {
        let mut framer = JsonFramer::new();
        let mut out = framer.feed(br#"{"m":"a\"#);
        out.extend(framer.feed(br#""}"}"#));
        assert_eq!(out, vec![json!({"m": "a\"}"})]);
    }

    #[test]
    fn noise_limit_clears_buffer_and_framing_continues() {
        let mut framer = JsonFramer::new();
        let noise = vec![b'x'; NOISE_LIMIT + 1];
        assert!(framer.feed(&noise).is_empty());
        assert_eq!(framer.buffered_len(), 0);
        assert!(!framer.in_object());

        let out = framer.feed(b"{\"ok\":true}");
        assert_eq!(out, vec![json!({"ok": true})]);
    }

    #[test]
    fn noise_below_limit_is_kept_until_next_object() {
        let mut framer = JsonFramer::new();
        framer.feed(b"hello");
        assert_eq!(framer.buffered_len(), 5);
        framer.feed(b"{\"a\":1}");
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn open_object_is_not_cleared_by_noise_limit() {
        let mut framer = JsonFramer::new();
        framer.feed(b"{\"pad\":\"");
        let pad = vec![b'y'; NOISE_LIMIT + 10];
        assert!(framer.feed(&pad).is_empty());
        assert!(framer.in_object());
        let out = framer.feed(b"\"}");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["pad"].as_str().map(str::len), Some(NOISE_LIMIT + 10));
    }
}
