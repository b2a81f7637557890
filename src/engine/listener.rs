//! Ingestion listener: one TCP port per worker slot.
//!
//! Each accepted connection carries exactly one frame. The connection is
//! decoded on its own task, turned into a [`WorkItem`] and offered to the
//! queue; the listener does no processing of its own.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, DecodeError, FrameLimits};
use crate::error::{Error, Result};
use crate::event::Observer;
use crate::model::{VideoMetadata, WorkItem, WorkerId};
use crate::queue::{Admission, BoundedQueue};
use crate::telemetry::metrics;

/// Pause after a failed `accept` so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection task needs, shared across the listener's tasks.
#[derive(Clone)]
pub struct IngestContext {
    pub queue: Arc<BoundedQueue>,
    pub observer: Arc<dyn Observer>,
    pub limits: FrameLimits,
    pub read_timeout: Duration,
}

pub struct IngestListener {
    worker: WorkerId,
    listener: TcpListener,
    ctx: IngestContext,
}

impl IngestListener {
    /// Bind the port for `worker`. Failure here is fatal for startup.
    pub async fn bind(worker: WorkerId, addr: SocketAddr, ctx: IngestContext) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Self {
            worker,
            listener,
            ctx,
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires. The port is released when
    /// this returns.
    pub async fn run(self, cancel: CancellationToken) {
        let worker = self.worker;
        let local = self.local_addr().ok();
        info!(worker = worker.get(), addr = ?local, "listener accepting connections");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        metrics::connections_accepted()
                            .add(1, &[KeyValue::new("worker", i64::from(worker.get()))]);
                        let ctx = self.ctx.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, worker, ctx).await;
                        });
                    }
                    Err(e) => {
                        warn!(worker = worker.get(), error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!(worker = worker.get(), addr = ?local, "listener stopped");
    }
}

/// Decode one frame and offer it to the queue. All failures stay here.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    worker: WorkerId,
    ctx: IngestContext,
) {
    debug!(worker = worker.get(), %peer, "connection accepted");

    let (metadata, payload) = match receive(&mut stream, &ctx).await {
        Ok(frame) => frame,
        Err(e) => {
            metrics::decode_errors().add(1, &[KeyValue::new("worker", i64::from(worker.get()))]);
            error!(worker = worker.get(), %peer, error = %e, "bad frame, closing connection");
            return;
        }
    };

    info!(
        worker = worker.get(),
        %peer,
        file_name = %metadata.file_name,
        kib = payload.len() / 1024,
        "video received"
    );

    let item = WorkItem::new(metadata, payload);
    match ctx.queue.try_submit(item) {
        Admission::Queued { depth } => {
            let capacity = ctx.queue.capacity();
            ctx.observer.queued(depth, capacity);
            info!(worker = worker.get(), depth, capacity, "video queued");
        }
        Admission::Dropped(item) => {
            ctx.observer.dropped(item.file_name());
            warn!(
                worker = worker.get(),
                file_name = item.file_name(),
                "video dropped, queue full"
            );
        }
    }
}

/// Read one frame, bounded by the context's read timeout.
async fn receive(stream: &mut TcpStream, ctx: &IngestContext) -> Result<(VideoMetadata, Vec<u8>)> {
    let frame = tokio::time::timeout(ctx.read_timeout, codec::read_frame(stream, ctx.limits))
        .await
        .map_err(|_| {
            DecodeError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "frame not received before read timeout",
            ))
        })??;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn ctx(read_timeout: Duration) -> IngestContext {
        IngestContext {
            queue: Arc::new(BoundedQueue::new(4)),
            observer: Arc::new(crate::event::NullObserver),
            limits: FrameLimits::default(),
            read_timeout,
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn malformed_frame_is_a_decode_error() {
        let (mut client, mut server) = connected_pair().await;
        client.write_all(&4i32.to_le_bytes()).await.unwrap();
        client.write_all(b"nope").await.unwrap();
        client.shutdown().await.unwrap();

        let err = receive(&mut server, &ctx(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::BadMetadata(_))));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_client, mut server) = connected_pair().await;

        let err = receive(&mut server, &ctx(Duration::from_millis(50)))
            .await
            .unwrap_err();
        match err {
            Error::Decode(DecodeError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other}"),
        }
    }
}
