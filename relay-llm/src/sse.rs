use crate::error::{LlmError, Result};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::Deserialize;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseEvent {
    Data(String),
    Other,
}

/// Splits a byte stream into server-sent events. Bytes are buffered until a
/// blank line so multi-byte characters split across network chunks survive.
pub(crate) fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = find_event_boundary(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..idx + 2).collect();
                    let event = parse_event(&String::from_utf8_lossy(&raw[..idx]));
                    return Some((Ok(event), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => {
                        if buffer.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        // Trailing event without the closing blank line.
                        let event = parse_event(&String::from_utf8_lossy(&buffer));
                        buffer.clear();
                        return Some((Ok(event), (stream, buffer)));
                    }
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_event(raw: &str) -> SseEvent {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    if data_lines.is_empty() {
        return SseEvent::Other;
    }
    SseEvent::Data(data_lines.join("\n"))
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one `data:` payload contributes to the fragment sequence.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Fragment(String),
    Done,
    Skip,
}

pub(crate) fn interpret_frame(data: &str) -> Result<Frame> {
    if data.trim() == "[DONE]" {
        return Ok(Frame::Done);
    }
    let frame: StreamFrame = serde_json::from_str(data)
        .map_err(|e| LlmError::StreamParse(format!("chunk json error={e} data={data}")))?;
    let content = frame
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty());
    Ok(match content {
        Some(content) => Frame::Fragment(content),
        None => Frame::Skip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(
        parts: Vec<Vec<u8>>,
    ) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static
    {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    #[tokio::test]
    async fn decode_sse_reassembles_split_multibyte_text() {
        let text = "data: 你好\n\n".as_bytes();
        let (head, tail) = text.split_at(8);
        let events: Vec<_> = decode_sse(chunks(vec![head.to_vec(), tail.to_vec()]))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().expect("event"),
            &SseEvent::Data("你好".to_string())
        );
    }

    #[tokio::test]
    async fn decode_sse_reports_comment_lines_as_other() {
        let raw = b": keep-alive\r\n\r\ndata: x\r\n\r\n".to_vec();
        let events: Vec<_> = decode_sse(chunks(vec![raw])).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().expect("event"), &SseEvent::Other);
        assert_eq!(
            events[1].as_ref().expect("event"),
            &SseEvent::Data("x".to_string())
        );
    }

    #[test]
    fn interpret_frame_handles_done_delta_and_empty() {
        assert_eq!(interpret_frame("[DONE]").expect("done"), Frame::Done);
        assert_eq!(
            interpret_frame(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).expect("delta"),
            Frame::Fragment("hi".to_string())
        );
        assert_eq!(
            interpret_frame(r#"{"choices":[{"delta":{"reasoning_content":"..."}}]}"#)
                .expect("reasoning"),
            Frame::Skip
        );
        assert!(interpret_frame("{not json").is_err());
    }
}
