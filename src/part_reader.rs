//! Reading a byte range back out of cached parts
//!
//! [`PartReader`] is an [`AsyncRead`] over an inclusive byte range of an
//! object. Parts are opened one at a time, only when the previous one is
//! exhausted, so a reader that is dropped early never touches the rest of the
//! range. A part missing from disk is downloaded by the storage if it can be.

use crate::error::Result;
use crate::models::{ByteRange, ObjectId, ObjectIndex};
use crate::storage::{PartStream, Storage};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

type OpenPart = Pin<Box<dyn Future<Output = Result<Take<PartStream>>> + Send>>;

enum ReadState {
    /// Next part not opened yet
    Idle,
    Opening(OpenPart),
    Reading(Take<PartStream>),
    Done,
}

/// Sequential reader over a byte range of a cached object
pub struct PartReader {
    storage: Arc<dyn Storage>,
    object_id: ObjectId,
    part_size: u64,
    range: ByteRange,
    next_part: u64,
    last_part: u64,
    state: ReadState,
}

impl PartReader {
    /// Create a reader for `range` of `object_id`
    ///
    /// Nothing is opened until the first read.
    pub fn new(
        storage: Arc<dyn Storage>,
        object_id: ObjectId,
        part_size: u64,
        range: ByteRange,
    ) -> Self {
        PartReader {
            storage,
            object_id,
            part_size,
            range,
            next_part: range.start / part_size,
            last_part: range.end / part_size,
            state: ReadState::Idle,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    /// Total number of bytes the reader yields
    pub fn len(&self) -> u64 {
        self.range.size()
    }

    /// Always false, a range holds at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    fn open_part(&self, part: u64) -> OpenPart {
        let storage = self.storage.clone();
        let idx = ObjectIndex::new(self.object_id.clone(), part as u32);

        let part_start = part * self.part_size;
        let part_end = part_start + self.part_size - 1;
        let first = part_start.max(self.range.start);
        let last = part_end.min(self.range.end);
        let skip = first - part_start;
        let len = last - first + 1;

        Box::pin(async move {
            let mut stream = storage.get_part(&idx).await?;
            if skip > 0 {
                stream.skip(skip).await?;
            }
            Ok(stream.take(len))
        })
    }
}

impl AsyncRead for PartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match &mut this.state {
                ReadState::Idle => {
                    if this.next_part > this.last_part {
                        this.state = ReadState::Done;
                        continue;
                    }
                    let open = this.open_part(this.next_part);
                    this.next_part += 1;
                    this.state = ReadState::Opening(open);
                }
                ReadState::Opening(open) => match ready!(open.as_mut().poll(cx)) {
                    Ok(stream) => this.state = ReadState::Reading(stream),
                    Err(e) => {
                        this.state = ReadState::Done;
                        return Poll::Ready(Err(e.into()));
                    }
                },
                ReadState::Reading(stream) => {
                    let before = buf.filled().len();
                    ready!(Pin::new(&mut *stream).poll_read(cx, buf))?;
                    if buf.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }

                    let missing = stream.limit();
                    if missing > 0 {
                        this.state = ReadState::Done;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "part {} of {} ended {} bytes early",
                                this.next_part - 1,
                                this.object_id,
                                missing
                            ),
                        )));
                    }
                    this.state = ReadState::Idle;
                }
                ReadState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}
