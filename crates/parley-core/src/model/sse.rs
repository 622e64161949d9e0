//! Server-sent-event plumbing for chat-completion streams.

use serde::Deserialize;
use tracing::debug;

use crate::types::Usage;

use super::{ChunkStream, StreamChunk};

/// Pulls complete `data:` payloads out of an SSE buffer. Events are
/// delimited by a blank line; any trailing partial event stays in the
/// buffer for the next call.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    // Some servers send CRLF line endings.
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_owned());
                }
            }
        }
    }

    data_lines
}

/// Appends `bytes` to `buffer` as text. A multi-byte character cut off at
/// the end of a network chunk is held in `pending` until the rest arrives;
/// bytes that can never form valid UTF-8 become U+FFFD.
pub(crate) fn push_utf8(buffer: &mut String, pending: &mut Vec<u8>, bytes: &[u8]) {
    pending.extend_from_slice(bytes);
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                buffer.push_str(text);
                pending.clear();
                return;
            }
            Err(error) => {
                let valid = error.valid_up_to();
                buffer.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match error.error_len() {
                    None => {
                        pending.drain(..valid);
                        return;
                    }
                    Some(invalid) => {
                        buffer.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + invalid);
                    }
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum ParsedLine {
    Delta(Option<String>, Option<Usage>),
    Done,
    Malformed,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

pub(crate) fn parse_data_line(data: &str) -> ParsedLine {
    if data == "[DONE]" {
        return ParsedLine::Done;
    }

    match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => {
            let delta = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta)
                .and_then(|delta| delta.content)
                .filter(|content| !content.is_empty());
            ParsedLine::Delta(delta, chunk.usage.map(Usage::from))
        }
        Err(_) => ParsedLine::Malformed,
    }
}

/// Turns a streaming chat-completion response into [`StreamChunk`]s.
/// Malformed lines are skipped. Exactly one `done` chunk is emitted, last.
/// Dropping the stream drops the response and aborts the upstream request.
pub(crate) fn completion_stream(response: reqwest::Response) -> ChunkStream {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut pending_bytes = Vec::new();
        let mut usage: Option<Usage> = None;
        let mut finished = false;

        while !finished {
            let data_lines = match response.chunk().await {
                Ok(Some(bytes)) => {
                    push_utf8(&mut buffer, &mut pending_bytes, &bytes);
                    drain_data_lines(&mut buffer)
                }
                Ok(None) => {
                    finished = true;
                    if !pending_bytes.is_empty() {
                        buffer.push_str(&String::from_utf8_lossy(&pending_bytes));
                        pending_bytes.clear();
                    }
                    if buffer.trim().is_empty() {
                        Vec::new()
                    } else {
                        buffer.push_str("\n\n");
                        drain_data_lines(&mut buffer)
                    }
                }
                Err(error) => {
                    yield Err(anyhow::Error::new(error).context("model stream interrupted"));
                    return;
                }
            };

            for data in data_lines {
                match parse_data_line(&data) {
                    ParsedLine::Done => {
                        finished = true;
                        break;
                    }
                    ParsedLine::Delta(delta, chunk_usage) => {
                        if chunk_usage.is_some() {
                            usage = chunk_usage;
                        }
                        if let Some(delta) = delta {
                            yield Ok(StreamChunk::delta(delta));
                        }
                    }
                    ParsedLine::Malformed => {
                        debug!(line_len = data.len(), "skipping malformed stream line");
                    }
                }
            }
        }

        yield Ok(StreamChunk::done(usage));
    };

    Box::pin(stream)
}
