//! Bounded frame queue between the filter stage and an output context.

use crate::error::{OutputError, Result};
use crate::media::Frame;
use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// One unit delivered to an output.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A filtered frame for output stream `stream`.
    Frame { stream: usize, frame: Frame },
    /// No more frames will arrive.
    EndOfStream,
}

/// Producer side of an [`OutputQueue`]. Cloneable; the queue reports end of
/// stream once every sender is gone.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: Sender<QueueItem>,
}

impl QueueSender {
    /// Enqueue a frame, blocking while the queue is full.
    pub fn send(&self, stream: usize, frame: Frame) -> Result<()> {
        self.tx
            .send(QueueItem::Frame { stream, frame })
            .map_err(|_| OutputError::Closed)
    }

    /// Enqueue the end-of-stream marker.
    pub fn finish(&self) -> Result<()> {
        self.tx
            .send(QueueItem::EndOfStream)
            .map_err(|_| OutputError::Closed)
    }
}

/// Consumer side, owned by the output context.
#[derive(Debug)]
pub struct OutputQueue {
    rx: Receiver<QueueItem>,
}

impl OutputQueue {
    /// A queue holding at most `capacity` items. Senders block when it is full.
    pub fn bounded(capacity: usize) -> (QueueSender, OutputQueue) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (QueueSender { tx }, OutputQueue { rx })
    }

    /// Block until the next item. A queue whose senders are all dropped
    /// yields end of stream.
    pub fn take(&self) -> QueueItem {
        self.rx.recv().unwrap_or(QueueItem::EndOfStream)
    }

    /// The next item if one is ready.
    pub fn try_take(&self) -> Option<QueueItem> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(QueueItem::EndOfStream),
        }
    }

    /// Items waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
