//! JSON-lines transport: one call per input line, one response per output
//! line. Calls run concurrently, so responses may come back out of order;
//! callers correlate them through the echoed `id`.

use crate::dispatcher::{CallContext, Dispatcher};
use crate::error::DispatchError;
use crate::protocol::{CallRequest, Envelope};
use bytes::BytesMut;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

const CLIENT: &str = "stdio";

/// Longest accepted input line. Longer lines are discarded and answered
/// with an error.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

enum Frame {
    Line(String),
    Oversized,
}

/// Line framing that reports an overlong line as a frame, so the stream
/// keeps going after it.
struct CallLines {
    inner: LinesCodec,
}

impl CallLines {
    fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }
}

impl Decoder for CallLines {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        to_frame(self.inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        to_frame(self.inner.decode_eof(src))
    }
}

fn to_frame(decoded: Result<Option<String>, LinesCodecError>) -> Result<Option<Frame>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
        Err(e) => Err(e),
    }
}

/// Decode one line. Undecodable input still yields a response, carrying the
/// `id` when it can be recovered.
fn decode(line: &str) -> Result<CallRequest, Envelope> {
    serde_json::from_str::<CallRequest>(line).map_err(|e| {
        let id = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|value| value.get("id").cloned());
        Envelope::rejected(id, &DispatchError::MalformedRequest(e.to_string()))
    })
}

/// Serve calls from `input` until EOF or `shutdown`.
///
/// On EOF, in-flight calls finish and their responses are written. On
/// shutdown they are cancelled, which kills their processes.
pub async fn serve<R, W>(
    dispatcher: Arc<Dispatcher>,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let mut calls = JoinSet::new();
    let mut lines = FramedRead::new(input, CallLines::new(MAX_LINE_BYTES));
    let mut reading = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(in_flight = calls.len(), "stdio transport shutting down");
                calls.abort_all();
                break;
            }
            frame = lines.next(), if reading => {
                match frame {
                    None => {
                        reading = false;
                        if calls.is_empty() {
                            break;
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Frame::Oversized)) => {
                        let err = DispatchError::MalformedRequest(format!(
                            "line exceeds {MAX_LINE_BYTES} bytes"
                        ));
                        tracing::warn!(max_bytes = MAX_LINE_BYTES, "oversized stdio line discarded");
                        write_line(&mut output, &Envelope::rejected(None, &err)).await?;
                    }
                    Some(Ok(Frame::Line(line))) if line.trim().is_empty() => {}
                    Some(Ok(Frame::Line(line))) => match decode(&line) {
                        Ok(call) => {
                            let dispatcher = dispatcher.clone();
                            let tx = tx.clone();
                            calls.spawn(async move {
                                let id = call.id.clone();
                                let ctx = CallContext::new(CLIENT);
                                let result = dispatcher.dispatch(call.into_invocation(), &ctx).await;
                                let _ = tx.send(Envelope::new(id, &result));
                            });
                        }
                        Err(rejected) => write_line(&mut output, &rejected).await?,
                    },
                }
            }
            Some(envelope) = rx.recv() => {
                write_line(&mut output, &envelope).await?;
            }
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "stdio call task failed");
                }
                if !reading && calls.is_empty() {
                    break;
                }
            }
        }
    }

    drop(tx);
    while let Ok(envelope) = rx.try_recv() {
        write_line(&mut output, &envelope).await?;
    }
    output.flush().await?;
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, envelope: &Envelope) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
