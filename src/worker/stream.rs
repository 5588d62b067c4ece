//! Reply stream aggregation under a phase deadline.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::llm::StreamChunk;

/// Block appended to the reply when the backend reports an error detail.
pub fn error_block(detail: &str) -> String {
    format!("\n\n---\nSorry, we ran into an error. Details:\n{detail}\n")
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The backend closed the channel.
    Closed,
    /// The phase deadline elapsed first.
    DeadlineElapsed,
    /// The invocation was cancelled from outside.
    Cancelled,
    /// An error chunk arrived.
    Errored,
}

/// Everything observed while draining one reply stream.
#[derive(Debug)]
pub struct StreamReply {
    pub text: String,
    /// Chunks received, error chunk included.
    pub chunks: usize,
    /// Arrival of the second chunk; the first one is often a bare role marker.
    pub first_content_at: Option<Instant>,
    pub end: StreamEnd,
    error: Option<(String, String)>,
}

impl StreamReply {
    /// The reply text, or the terminal stream error carrying it.
    pub fn into_result(self) -> Result<String, JobError> {
        match self.error {
            Some((code, detail)) => Err(JobError::Stream {
                code,
                detail,
                partial: self.text,
            }),
            None => Ok(self.text),
        }
    }
}

/// Drain `rx` until it closes, an error chunk arrives, `deadline` elapses or
/// `cancel` fires. Only an error chunk makes the reply a failure.
pub async fn collect_reply(
    rx: &mut mpsc::Receiver<StreamChunk>,
    deadline: Duration,
    cancel: &CancellationToken,
) -> StreamReply {
    let mut reply = StreamReply {
        text: String::new(),
        chunks: 0,
        first_content_at: None,
        end: StreamEnd::Closed,
        error: None,
    };

    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                reply.end = StreamEnd::Cancelled;
                break;
            }
            _ = &mut timer => {
                tracing::debug!(chunks = reply.chunks, "Reply stream deadline elapsed");
                reply.end = StreamEnd::DeadlineElapsed;
                break;
            }
            next = rx.recv() => {
                let Some(chunk) = next else {
                    reply.end = StreamEnd::Closed;
                    break;
                };

                if reply.chunks == 1 {
                    reply.first_content_at = Some(Instant::now());
                }
                reply.chunks += 1;

                if chunk.is_error() {
                    tracing::warn!(
                        code = %chunk.error_code,
                        error = %chunk.error,
                        "Chat stream returned an error"
                    );
                    if chunk.error.is_empty() {
                        reply.text.push_str(&chunk.text);
                    } else {
                        reply.text.push_str(&error_block(&chunk.error));
                    }
                    reply.error = Some((chunk.error_code, chunk.error));
                    reply.end = StreamEnd::Errored;
                    break;
                }

                reply.text.push_str(&chunk.text);
            }
        }
    }

    reply
}
