use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Archive bytes delivered frame by frame from a background export.
///
/// The frames are produced on the blocking pool and handed over through a
/// bounded channel, so a slow consumer pauses the walk once `capacity`
/// frames are waiting. Dropping the stream stops the walk at its next frame
/// and releases whatever the frame source owns, including its read handle.
#[derive(Debug)]
pub struct CarStream {
    inner: ReceiverStream<SyncResult<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl CarStream {
    /// Start producing `frames` in the background. Must be called from
    /// within a Tokio runtime.
    pub fn spawn<I>(frames: I, capacity: usize) -> Self
    where
        I: Iterator<Item = SyncResult<Bytes>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::task::spawn_blocking(move || pump(frames, tx));
        Self {
            inner: ReceiverStream::new(rx),
            task: Some(task),
        }
    }

    /// Drain the stream into one buffer, stopping at the first error.
    pub async fn collect_bytes(mut self) -> SyncResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = self.next().await {
            out.extend_from_slice(&frame?);
        }
        Ok(out)
    }
}

fn pump<I>(frames: I, tx: mpsc::Sender<SyncResult<Bytes>>)
where
    I: Iterator<Item = SyncResult<Bytes>>,
{
    let mut sent = 0usize;
    for frame in frames {
        let failed = frame.is_err();
        if tx.blocking_send(frame).is_err() {
            debug!(frames = sent, "export consumer went away");
            return;
        }
        sent += 1;
        if failed {
            return;
        }
    }
    debug!(frames = sent, "export stream finished");
}

impl Stream for CarStream {
    type Item = SyncResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {}
            other => return other,
        }
        // Channel closed: report a producer that died instead of finishing.
        let Some(task) = this.task.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.task = None;
                match result {
                    Ok(()) => Poll::Ready(None),
                    Err(e) => Poll::Ready(Some(Err(SyncError::TaskFailed(e.to_string())))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use pds_repo::RepoReader;
    use pds_store::ActorStore;

    use crate::export;
    use crate::scenario::RepoWriter;

    fn counted(n: usize, produced: Arc<AtomicUsize>) -> impl Iterator<Item = SyncResult<Bytes>> + Send {
        (0..n).map(move |i| {
            produced.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(vec![i as u8; 4]))
        })
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn delivers_frames_in_order() {
        let produced = Arc::new(AtomicUsize::new(0));
        let stream = CarStream::spawn(counted(10, Arc::clone(&produced)), 3);
        let frames: Vec<Bytes> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().enumerate().all(|(i, f)| f[0] == i as u8));
    }

    #[tokio::test]
    async fn stalled_consumer_pauses_production() {
        let produced = Arc::new(AtomicUsize::new(0));
        let mut stream = CarStream::spawn(counted(100, Arc::clone(&produced)), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Two buffered frames plus the one waiting to be sent.
        assert!(produced.load(Ordering::SeqCst) <= 3);

        let mut received = 0;
        while let Some(frame) = stream.next().await {
            frame.unwrap();
            received += 1;
        }
        assert_eq!(received, 100);
        assert_eq!(produced.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn error_item_ends_stream() {
        let items = vec![
            Ok(Bytes::from_static(b"a")),
            Err(SyncError::VerificationFailed("boom".into())),
            Ok(Bytes::from_static(b"never")),
        ];
        let mut stream = CarStream::spawn(items.into_iter(), 4);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn panicking_producer_is_reported() {
        let items = (0..3).map(|i| -> SyncResult<Bytes> {
            if i == 1 {
                panic!("producer failure");
            }
            Ok(Bytes::from_static(b"x"))
        });
        let mut stream = CarStream::spawn(items, 4);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(stream.next().await, Some(Err(SyncError::TaskFailed(_)))));
        assert!(stream.next().await.is_none());
    }

    // --- Read handle lifetime ---

    #[tokio::test]
    async fn read_handle_released_on_completion() {
        let store = ActorStore::in_memory();
        let mut writer = RepoWriter::create(&store, "did:plc:complete");
        writer.put_many(20);
        let root = writer.commit().cid;

        let frames = export::get_repo(RepoReader::new(writer.db()), root).unwrap();
        assert_eq!(writer.db().open_read_handles(), 1);
        CarStream::spawn(frames, 4).collect_bytes().await.unwrap();
        wait_for(|| writer.db().open_read_handles() == 0).await;
    }

    #[tokio::test]
    async fn read_handle_released_on_cancellation() {
        let store = ActorStore::in_memory();
        let mut writer = RepoWriter::create(&store, "did:plc:cancel");
        writer.put_many(300);
        let root = writer.commit().cid;

        let frames = export::get_repo(RepoReader::new(writer.db()), root).unwrap();
        let mut stream = CarStream::spawn(frames, 1);
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream);
        wait_for(|| writer.db().open_read_handles() == 0).await;
    }

    #[tokio::test]
    async fn read_handle_released_on_error() {
        let store = ActorStore::in_memory();
        let mut writer = RepoWriter::create(&store, "did:plc:broken");
        writer.put_many(20);
        let root = writer.commit().cid;
        let data = writer.commit_object().data;
        writer
            .db()
            .transaction(|txn| txn.delete_many([&data]))
            .unwrap();

        let frames = export::get_repo(RepoReader::new(writer.db()), root).unwrap();
        let err = CarStream::spawn(frames, 4).collect_bytes().await.unwrap_err();
        assert!(matches!(err, SyncError::Repo(pds_repo::RepoError::BlockNotFound(cid)) if cid == data));
        wait_for(|| writer.db().open_read_handles() == 0).await;
    }
}
