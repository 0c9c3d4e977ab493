//! Server-Sent-Events wire parsing
//!
//! Implements the line format of the W3C 2011 EventSource draft: records
//! are separated by blank lines, lines are terminated by CRLF, LF or a
//! lone CR, `:` starts a comment, and field values lose a single leading
//! space. The parser is fed response chunks as they arrive and never
//! buffers more than the current line and the event under construction.

use std::time::Instant;

/// One parsed stream event
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub body: Vec<u8>,
    pub id: String,
    /// When the event was dispatched off the stream
    pub timestamp: Instant,
}

impl Event {
    fn new() -> Self {
        Self {
            event_type: String::new(),
            body: Vec::new(),
            id: String::new(),
            timestamp: Instant::now(),
        }
    }

    /// An event with none of type, body or id set is not dispatched.
    pub fn is_empty(&self) -> bool {
        self.event_type.is_empty() && self.body.is_empty() && self.id.is_empty()
    }

    /// Process one line. Returns true when the line was blank and the
    /// event under construction should be dispatched.
    pub fn parse_line(&mut self, line: &[u8]) -> bool {
        let mut line = line;
        if let Some(stripped) = line.strip_suffix(b"\n") {
            line = stripped;
        }
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        // a blank line dispatches the event, if there is one
        if line.is_empty() {
            return !self.is_empty();
        }

        // comment line
        if line[0] == b':' {
            return false;
        }

        let (field, value) = match line.iter().position(|&byte| byte == b':') {
            Some(index) => {
                let value = &line[index + 1..];
                // a single leading space is not part of the value
                (&line[..index], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &[][..]),
        };

        match field {
            b"event" => self.event_type = String::from_utf8_lossy(value).into_owned(),
            b"data" => {
                if !value.is_empty() {
                    self.body.extend_from_slice(value);
                    self.body.push(b'\n');
                }
            }
            b"id" => self.id = String::from_utf8_lossy(value).into_owned(),
            b"retry" => {
                // reconnection delay is not consumed
            }
            _ => {}
        }

        false
    }
}

/// What was in flight when the stream ended
#[derive(Debug)]
pub enum SseEof {
    /// The stream ended on a record boundary; the final event still gets
    /// delivered before the stream error surfaces.
    Dispatched(Event),
    /// The stream ended mid-event.
    Partial(Event),
}

/// Push parser assembling events from raw stream chunks
#[derive(Debug)]
pub struct EventStreamParser {
    line: Vec<u8>,
    pending_cr: bool,
    current: Event,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            pending_cr: false,
            current: Event::new(),
        }
    }

    /// Feed one chunk; returns the events completed by it, in stream
    /// order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut dispatched = Vec::new();

        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                // LF directly after CR belongs to the same terminator
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut dispatched),
                b'\r' => {
                    self.end_line(&mut dispatched);
                    self.pending_cr = true;
                }
                other => self.line.push(other),
            }
        }

        dispatched
    }

    fn end_line(&mut self, dispatched: &mut Vec<Event>) {
        let line = std::mem::take(&mut self.line);
        if self.current.parse_line(&line) {
            let mut event = std::mem::replace(&mut self.current, Event::new());
            event.timestamp = Instant::now();
            dispatched.push(event);
        }
    }

    /// The stream ended; the unterminated final line is processed like any
    /// other.
    pub fn finish(mut self) -> SseEof {
        let line = std::mem::take(&mut self.line);
        if self.current.parse_line(&line) {
            let mut event = self.current;
            event.timestamp = Instant::now();
            SseEof::Dispatched(event)
        } else {
            SseEof::Partial(self.current)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(stream: &[u8]) -> (Vec<Event>, SseEof) {
        let mut parser = EventStreamParser::new();
        let events = parser.feed(stream);
        (events, parser.finish())
    }

    #[test]
    fn populated_event_is_not_empty() {
        let mut event = Event::new();
        event.parse_line(b"event: status_update_event\n");
        event.parse_line(b"data: {\"id\": \"simpleId\"}\n");
        event.parse_line(b"id: id\n");
        assert!(!event.is_empty());
    }

    #[test]
    fn fresh_event_is_empty() {
        assert!(Event::new().is_empty());
    }

    #[test]
    fn parse_line_fills_fields() {
        let mut event = Event::new();
        event.parse_line(b"id: 0\n");
        event.parse_line(b"event: status_update_event\n");
        event.parse_line(b"data: testData\n");

        assert_eq!(event.id, "0");
        assert_eq!(event.event_type, "status_update_event");
        assert_eq!(event.body, b"testData\n");
    }

    #[test]
    fn unknown_field_leaves_body_empty() {
        let mut event = Event::new();
        event.parse_line(b"garbage data\n");
        assert!(event.body.is_empty());
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut event = Event::new();
        assert!(!event.parse_line(b": heartbeat\n"));
        assert!(event.is_empty());
    }

    #[test]
    fn data_lines_accumulate_with_linefeeds() {
        let mut event = Event::new();
        event.parse_line(b"data: first\n");
        event.parse_line(b"data: second\n");
        assert_eq!(event.body, b"first\nsecond\n");
    }

    #[test]
    fn stream_end_on_record_boundary_dispatches_final_event() {
        let (events, eof) = parse_all(b"event: status_update_event\ndata: testData\n");
        assert!(events.is_empty());
        match eof {
            SseEof::Dispatched(event) => {
                assert_eq!(event.event_type, "status_update_event");
                assert_eq!(event.body, b"testData\n");
            }
            SseEof::Partial(_) => panic!("expected dispatched event"),
        }
    }

    #[test]
    fn stream_end_mid_line_is_partial() {
        let (events, eof) = parse_all(b"event: status_update_event\ndata: testData\nlkajsd");
        assert!(events.is_empty());
        match eof {
            SseEof::Partial(event) => {
                assert_eq!(event.event_type, "status_update_event");
                assert_eq!(event.body, b"testData\n");
            }
            SseEof::Dispatched(_) => panic!("expected partial event"),
        }
    }

    #[test]
    fn bare_data_field_has_no_value() {
        let (_, eof) = parse_all(b"event: status_update_event\ndata");
        match eof {
            SseEof::Partial(event) => {
                assert_eq!(event.event_type, "status_update_event");
                assert!(event.body.is_empty());
            }
            SseEof::Dispatched(_) => panic!("expected partial event"),
        }
    }

    #[test]
    fn empty_data_value_appends_nothing() {
        let (_, eof) = parse_all(b"event: status_update_event\ndata:\n");
        match eof {
            SseEof::Dispatched(event) => {
                assert_eq!(event.event_type, "status_update_event");
                assert!(event.body.is_empty());
            }
            SseEof::Partial(_) => panic!("event only has a type, but that dispatches"),
        }
    }

    #[test]
    fn unterminated_data_line_still_lands_in_body() {
        let (_, eof) = parse_all(b"event: status_update_event\ndata: testEventData");
        match eof {
            SseEof::Partial(event) => {
                assert_eq!(event.event_type, "status_update_event");
                assert_eq!(event.body, b"testEventData\n");
            }
            SseEof::Dispatched(_) => panic!("expected partial event"),
        }
    }

    #[test]
    fn empty_stream_is_an_empty_partial() {
        let (events, eof) = parse_all(b"");
        assert!(events.is_empty());
        match eof {
            SseEof::Partial(event) => assert!(event.is_empty()),
            SseEof::Dispatched(_) => panic!("nothing to dispatch"),
        }
    }

    #[test]
    fn complete_records_dispatch_mid_stream() {
        let mut parser = EventStreamParser::new();
        let events =
            parser.feed(b"event: a\ndata: one\n\nevent: b\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "a");
        assert_eq!(events[0].body, b"one\n");
        assert_eq!(events[1].event_type, "b");
        assert_eq!(events[1].body, b"two\n");
    }

    #[test]
    fn terminator_style_does_not_change_the_parse() {
        let lf = b"event: a\ndata: one\n\nevent: b\ndata: two\n\n".to_vec();
        let crlf = lf
            .iter()
            .flat_map(|&byte| {
                if byte == b'\n' {
                    vec![b'\r', b'\n']
                } else {
                    vec![byte]
                }
            })
            .collect::<Vec<u8>>();
        let cr = lf
            .iter()
            .map(|&byte| if byte == b'\n' { b'\r' } else { byte })
            .collect::<Vec<u8>>();
        let mixed = b"event: a\r\ndata: one\n\revent: b\rdata: two\r\n\n".to_vec();

        let expected = {
            let mut parser = EventStreamParser::new();
            parser
                .feed(&lf)
                .into_iter()
                .map(|event| (event.event_type, event.body))
                .collect::<Vec<_>>()
        };

        for stream in [crlf, cr, mixed] {
            let mut parser = EventStreamParser::new();
            let events = parser
                .feed(&stream)
                .into_iter()
                .map(|event| (event.event_type, event.body))
                .collect::<Vec<_>>();
            assert_eq!(events, expected);
        }
    }

    #[test]
    fn crlf_split_across_chunks_is_one_terminator() {
        let mut parser = EventStreamParser::new();
        let mut events = parser.feed(b"event: a\r");
        events.extend(parser.feed(b"\ndata: one\r"));
        events.extend(parser.feed(b"\n\r\n"));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "a");
        assert_eq!(events[0].body, b"one\n");
    }
}
