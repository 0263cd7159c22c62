// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A minimal server-sent-events decoder.
//!
//! Only the subset of the SSE framing the configuration service uses is
//! implemented: `event` and `data` fields, multi-line data, comment lines
//! (the keep-alives), and CRLF tolerance. `id` and `retry` are parsed and
//! discarded. The decoder is push-based: feed it raw chunks as they arrive
//! and collect whatever events completed.

/// One decoded event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    event_name: String,
    data: String,
}

impl SseDecoder {
    pub fn new() -> SseDecoder {
        SseDecoder::default()
    }

    /// Feeds a chunk of bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = &raw[..raw.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // Blank line: dispatch whatever has accumulated.
            let name = std::mem::take(&mut self.event_name);
            let mut data = std::mem::take(&mut self.data);
            if data.is_empty() {
                return None;
            }
            // Every data line contributes a trailing newline; the last one
            // is not part of the payload.
            data.pop();
            let name = if name.is_empty() {
                "message".to_string()
            } else {
                name
            };
            return Some(SseEvent { name, data });
        }
        if line.starts_with(':') {
            // Comment; the service sends these as keep-alives.
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = value.to_string(),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            name: name.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_a_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: put\ndata: {\"x\":1}\n\n");
        assert_eq!(events, vec![event("put", "{\"x\":1}")]);
    }

    #[test]
    fn event_name_defaults_to_message() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: hello\n\n");
        assert_eq!(events, vec![event("message", "hello")]);
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: put\ndata: line1\ndata: line2\n\n");
        assert_eq!(events, vec![event("put", "line1\nline2")]);
    }

    #[test]
    fn tolerates_crlf_and_partial_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"event: patch\r\nda").is_empty());
        assert!(decoder.feed(b"ta: {}\r\n").is_empty());
        let events = decoder.feed(b"\r\n");
        assert_eq!(events, vec![event("patch", "{}")]);
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored(){
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\nid: 17\nretry: 1000\ndata: x\n\n");
        assert_eq!(events, vec![event("message", "x")]);
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n: ping\n\n").is_empty());
        // An event field alone is discarded by the blank line.
        assert!(decoder.feed(b"event: put\n\n").is_empty());
        let events = decoder.feed(b"data: later\n\n");
        assert_eq!(events, vec![event("message", "later")]);
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: a\ndata: 1\n\nevent: b\ndata: 2\n\n");
        assert_eq!(events, vec![event("a", "1"), event("b", "2")]);
    }
}
