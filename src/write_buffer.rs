//! A dedicated writer task owning the stream's write half.
//!
//! A bare `AsyncWrite` half is not a sufficient sink for concurrent
//! writers: several tasks (outbound requests, outbound events, and each
//! inbound request's eventual reply) all need to push frames onto the same
//! stream without interleaving their bytes. This mirrors the role a write
//! buffer plays on top of a single shared I/O device, except here the
//! "buffer" is a bounded channel drained by one task rather than a byte
//! buffer drained on writability.

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handle used by any task that wants to enqueue an encoded frame for
/// writing. Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl WriteHandle {
    /// Enqueues `bytes` for writing, preserving submission order relative
    /// to other calls from the same handle (and across clones, since the
    /// channel is a single FIFO). Awaits only once the configured queue
    /// depth is exceeded.
    pub async fn enqueue(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(bytes).await.is_ok()
    }
}

/// Spawns the writer task and returns a handle to it. The task exits once
/// every `WriteHandle` clone has been dropped, or on the first fatal write
/// error -- in which case `on_fatal_error` is called once so the owning
/// peer can transition to `Closed` instead of leaving pending requests
/// hanging forever.
pub fn spawn<W, F>(mut writer: W, queue_depth: usize, on_fatal_error: F) -> WriteHandle
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(queue_depth.max(1));
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!(error = %e, "write buffer: fatal write error, dropping queued frames");
                on_fatal_error();
                return;
            }
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "write buffer: flush failed, dropping queued frames");
                on_fatal_error();
                return;
            }
        }
        debug!("write buffer: writer task exiting");
    });
    WriteHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn preserves_submission_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (_read_half, write_half) = tokio::io::split(client);
        let handle = spawn(write_half, 16, || {});

        handle.enqueue(b"A".to_vec()).await;
        handle.enqueue(b"B".to_vec()).await;

        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"AB");
    }

    #[tokio::test]
    async fn fatal_write_error_invokes_callback() {
        let (client, server) = tokio::io::duplex(16);
        let (_read_half, write_half) = tokio::io::split(client);
        drop(server);

        let fired = Arc::new(AtomicBool::new(false));
        let fired_in_callback = fired.clone();
        let handle = spawn(write_half, 16, move || {
            fired_in_callback.store(true, Ordering::SeqCst);
        });

        // the duplex's other end is dropped, so this write fails.
        for _ in 0..10 {
            if !handle.enqueue(b"x".to_vec()).await {
                break;
            }
            if fired.load(Ordering::SeqCst) {
                break;
            }
        }
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
