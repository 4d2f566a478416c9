use std::fmt::Display;

use futures::{Stream, StreamExt};
use reqwest::Response;

use crate::error::{LlmError, Result};
use crate::streaming::StreamEvent;
use crate::traits::TextStream;

/// Turns one SSE event payload into stream events
pub trait SseEventParser: Send {
    fn parse_data(&self, data: &str) -> Result<Vec<StreamEvent>>;

    /// Check if this payload signals end of stream
    fn is_done_marker(&self, data: &str) -> bool {
        data == "[DONE]"
    }
}

/// Incremental SSE framing: body bytes in, complete `data` payloads out.
///
/// Multi-line `data:` fields are joined with `\n` and dispatched on the blank
/// line that closes the event. Comments and other fields are skipped. Bytes are
/// held until a full line arrives, so a UTF-8 sequence split across chunks is
/// decoded whole.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed body bytes; returns the payloads of every event they complete
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = std::str::from_utf8(&raw)
                .map_err(|e| LlmError::Decode(format!("Invalid UTF-8 in event stream: {}", e)))?;
            self.take_line(line.trim_end_matches(&['\n', '\r'][..]), &mut payloads);
        }
        Ok(payloads)
    }

    /// Payload of an event the body ended without closing
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            if let Ok(line) = std::str::from_utf8(&rest) {
                let mut ignored = Vec::new();
                self.take_line(line.trim_end_matches('\r'), &mut ignored);
            }
        }
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }

    fn take_line(&mut self, line: &str, payloads: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                payloads.push(std::mem::take(&mut self.data).join("\n"));
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }
}

enum Step {
    Continue,
    Finished,
}

fn dispatch<P: SseEventParser>(parser: &P, data: &str, out: &mut Vec<Result<StreamEvent>>) -> Step {
    if parser.is_done_marker(data) {
        out.push(Ok(StreamEvent::done()));
        return Step::Finished;
    }
    match parser.parse_data(data) {
        Ok(events) => {
            for event in events {
                let is_done = matches!(event, StreamEvent::Done { .. });
                out.push(Ok(event));
                if is_done {
                    return Step::Finished;
                }
            }
            Step::Continue
        }
        Err(e) => {
            out.push(Err(e));
            Step::Finished
        }
    }
}

/// SSE stream over any body of byte chunks
pub fn parse_sse_bytes<S, B, E, P>(body: S, parser: P) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
    P: SseEventParser + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDecoder::new();
        let mut out = Vec::new();
        let mut finished = false;

        'outer: while let Some(chunk) = body.next().await {
            let payloads = match chunk {
                Ok(bytes) => decoder.push(bytes.as_ref()),
                Err(e) => Err(LlmError::Transport(format!("Stream error: {}", e))),
            };
            let payloads = match payloads {
                Ok(payloads) => payloads,
                Err(e) => {
                    yield Err(e);
                    finished = true;
                    break;
                }
            };
            for data in payloads {
                let step = dispatch(&parser, &data, &mut out);
                for item in out.drain(..) {
                    yield item;
                }
                if let Step::Finished = step {
                    finished = true;
                    break 'outer;
                }
            }
        }

        if !finished {
            if let Some(data) = decoder.finish() {
                if let Step::Finished = dispatch(&parser, &data, &mut out) {
                    finished = true;
                }
                for item in out.drain(..) {
                    yield item;
                }
            }
        }

        // A body that ends without a terminal event is a truncated answer
        if !finished {
            yield Err(LlmError::Transport("stream ended before completion".to_string()));
        }
    })
}

/// SSE stream over an HTTP response body
pub fn parse_sse_stream<P: SseEventParser + 'static>(response: Response, parser: P) -> TextStream {
    parse_sse_bytes(response.bytes_stream(), parser)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct Echo;

    impl SseEventParser for Echo {
        fn parse_data(&self, data: &str) -> Result<Vec<StreamEvent>> {
            if data == "bad" {
                return Err(LlmError::Decode("bad payload".into()));
            }
            Ok(vec![StreamEvent::message(data)])
        }
    }

    async fn run(chunks: Vec<&'static str>) -> Vec<Result<StreamEvent>> {
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(c.as_bytes().to_vec())),
        );
        parse_sse_bytes(body, Echo).collect().await
    }

    #[test]
    fn test_event_waits_for_blank_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: response.output_text.delta\ndata: {\"delta\":").unwrap().is_empty());
        assert!(decoder.push(b"\"x\"}\n").unwrap().is_empty());
        assert_eq!(decoder.push(b"\n").unwrap(), vec!["{\"delta\":\"x\"}".to_string()]);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder
            .push(b": keepalive\r\ndata: first\r\ndata:second\r\n\r\ndata: third\n\n")
            .unwrap();
        assert_eq!(payloads, vec!["first\nsecond".to_string(), "third".to_string()]);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let text = "data: café\n\n".as_bytes();
        assert!(decoder.push(&text[..10]).unwrap().is_empty());
        assert_eq!(decoder.push(&text[10..]).unwrap(), vec!["café".to_string()]);
    }

    #[test]
    fn test_finish_flushes_unclosed_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").unwrap().is_empty());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_done_marker_ends_stream() {
        let events = run(vec!["data: a\n\n", "data: [DONE]\n\ndata: never\n\n"]).await;
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert_eq!(events, vec![StreamEvent::message("a"), StreamEvent::done()]);
    }

    #[tokio::test]
    async fn test_truncated_body_is_transport_error() {
        let events = run(vec!["data: a\n\n", "data: b"]).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].as_ref().unwrap(), &StreamEvent::message("b"));
        assert!(matches!(events[2], Err(LlmError::Transport(_))));
    }

    #[tokio::test]
    async fn test_parser_error_stops_stream() {
        let events = run(vec!["data: bad\n\ndata: a\n\n"]).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(LlmError::Decode(_))));
    }
}
