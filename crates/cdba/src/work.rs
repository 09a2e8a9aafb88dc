use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::Arc,
};

use cdba_wire::{FASTBOOT_CHUNK, MsgType, encode_into};

/// One deferred outbound protocol action, drained when the write stream is
/// ready.
#[derive(Clone, Debug)]
pub enum WorkItem {
    SelectBoard(String),
    PowerOn,
    PowerOff,
    ListBoards,
    BoardInfo(String),
    /// A bare request frame with an empty payload.
    Request(MsgType),
    ConsoleInput(Vec<u8>),
    /// One slice of the boot image. The image bytes are shared so that
    /// continuation and requeueing never copy the payload; the allocation
    /// dies with the final zero-length chunk.
    FastbootChunk { image: Arc<Vec<u8>>, offset: usize },
}

impl WorkItem {
    /// Encodes this item's frame into `out` and returns the continuation
    /// item, if any. Only image chunks continue.
    fn encode(&self, out: &mut Vec<u8>) -> Option<Self> {
        // The encode calls cannot fail: every payload here is bounded far
        // below the frame limit (names and tty chunks are small, image
        // chunks are capped).
        match self {
            Self::SelectBoard(name) => {
                let _ = encode_into(out, MsgType::SelectBoard, name.as_bytes());
                None
            }
            Self::PowerOn => {
                let _ = encode_into(out, MsgType::PowerOn, &[]);
                None
            }
            Self::PowerOff => {
                let _ = encode_into(out, MsgType::PowerOff, &[]);
                None
            }
            Self::ListBoards => {
                let _ = encode_into(out, MsgType::ListDevices, &[]);
                None
            }
            Self::BoardInfo(name) => {
                let _ = encode_into(out, MsgType::BoardInfo, name.as_bytes());
                None
            }
            Self::Request(kind) => {
                let _ = encode_into(out, *kind, &[]);
                None
            }
            Self::ConsoleInput(bytes) => {
                let _ = encode_into(out, MsgType::Console, bytes);
                None
            }
            Self::FastbootChunk { image, offset } => {
                let left = FASTBOOT_CHUNK.min(image.len() - offset);
                let _ = encode_into(out, MsgType::FastbootDownload, &image[*offset..offset + left]);
                // A non-empty chunk is followed by the next slice; the final
                // slice is the zero-length terminator itself.
                (left > 0).then(|| Self::FastbootChunk {
                    image: Arc::clone(image),
                    offset: offset + left,
                })
            }
        }
    }
}

/// FIFO of pending outbound work, drained only while the write stream is
/// writable.
///
/// A frame interrupted by `EWOULDBLOCK` keeps its unwritten tail at the
/// front (`partial`), flushed before anything else, so payload order is
/// preserved across partial writes.
#[derive(Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
    partial: Vec<u8>,
    staging: Vec<u8>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.partial.is_empty()
    }

    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    /// Writes queued frames until the queue empties or the stream would
    /// block. Write errors other than would-block are fatal to the session.
    pub fn drain(&mut self, w: &mut dyn Write) -> io::Result<()> {
        loop {
            if !self.partial.is_empty() {
                let written = write_some(w, &self.partial)?;
                if written < self.partial.len() {
                    self.partial.drain(..written);
                    return Ok(());
                }
                self.partial.clear();
            }

            let Some(item) = self.items.pop_front() else {
                return Ok(());
            };
            self.staging.clear();
            if let Some(next) = item.encode(&mut self.staging) {
                self.items.push_front(next);
            }

            let written = write_some(w, &self.staging)?;
            if written < self.staging.len() {
                self.partial.extend_from_slice(&self.staging[written..]);
                return Ok(());
            }
        }
    }
}

/// Writes as much of `buf` as the stream accepts, returning the count once
/// it would block. `Interrupted` is retried.
fn write_some(w: &mut dyn Write, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match w.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
