//! Stdio transport
//!
//! One client over a pair of byte streams. Frames are read one at a time and
//! handed to the dispatcher, which runs tool calls concurrently. A single
//! writer task owns the output so frames never interleave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::mcp::codec::{Frame, JsonLineCodec};
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::message::{Message, RequestId};
use crate::mcp::peer::{Outbound, Peer};

/// In-flight scope of the single stdio client.
pub const STDIO_SCOPE: &str = "stdio";

const OUTBOUND_CAPACITY: usize = 256;

struct ChannelSink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl Outbound for ChannelSink {
    async fn send(&self, message: Message, _related: Option<RequestId>) -> Result<(), TransportError> {
        self.tx.send(message).await.map_err(|_| TransportError::Closed)
    }
}

/// Serves the process's stdin/stdout until EOF or `shutdown`.
pub async fn serve_stdio(
    dispatcher: Arc<Dispatcher>,
    grace: Duration,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    run(tokio::io::stdin(), tokio::io::stdout(), dispatcher, grace, shutdown).await
}

pub async fn run<R, W>(
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    grace: Duration,
    shutdown: CancellationToken,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let stop_writer = CancellationToken::new();
    let writer_task = tokio::spawn(write_loop(
        FramedWrite::new(writer, JsonLineCodec::new()),
        rx,
        stop_writer.clone(),
    ));
    let peer = Arc::new(Peer::new(STDIO_SCOPE, Arc::new(ChannelSink { tx }) as Arc<dyn Outbound>));
    info!("serving on stdio");

    let mut frames = FramedRead::new(reader, JsonLineCodec::new());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested");
                break;
            }
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Message(message))) => dispatcher.handle(&peer, message).await,
            Some(Ok(Frame::Malformed(error))) => dispatcher.handle_malformed(&peer, error).await,
            Some(Err(err)) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
            None => {
                debug!("stdin reached end of file");
                break;
            }
        }
    }

    let in_flight = dispatcher.in_flight_count(Some(STDIO_SCOPE));
    let cancelled = dispatcher.drain(Some(STDIO_SCOPE), grace).await;
    peer.close();
    stop_writer.cancel();
    info!(in_flight, cancelled, "stdio transport draining");

    match tokio::time::timeout(grace, writer_task).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => Err(TransportError::Io(err.to_string())),
        Err(_) => {
            warn!("stdout writer did not finish within the grace period");
            Ok(())
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, JsonLineCodec>,
    mut rx: mpsc::Receiver<Message>,
    stop: CancellationToken,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = stop.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    sink.feed(message).await?;
                }
                break;
            }
        };
        sink.send(message).await?;
    }
    sink.flush().await?;
    Ok(())
}
