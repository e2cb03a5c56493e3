//! Seekable blob reader

use blobfs_driver::{BlobError, Driver, DriverReader, ReaderAttributes, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

type Body = Pin<Box<dyn AsyncRead + Send>>;
type Opening = Pin<Box<dyn Future<Output = Result<DriverReader>> + Send>>;

enum State {
    /// Next read opens a new range at the current position
    Idle,
    Opening(Opening),
    Open(Body),
}

/// Reads one blob, or a range of it.
///
/// Positions are relative to the start of the requested range. Seeking
/// drops the current body; the next read asks the driver for a new range
/// starting at the new position.
pub struct Reader {
    driver: Arc<dyn Driver>,
    key: String,
    offset: u64,
    length: Option<u64>,
    pos: u64,
    state: State,
    attributes: ReaderAttributes,
}

impl Reader {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        key: &str,
        offset: u64,
        length: Option<u64>,
        reader: DriverReader,
    ) -> Self {
        Self {
            driver,
            key: key.to_string(),
            offset,
            length,
            pos: 0,
            state: State::Open(reader.body),
            attributes: reader.attributes,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn content_type(&self) -> &str {
        &self.attributes.content_type
    }

    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        self.attributes.mod_time
    }

    /// Size of the whole blob
    pub fn size(&self) -> u64 {
        self.attributes.size
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` at the end
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        AsyncReadExt::read(self, buf).await.map_err(from_io)
    }

    /// Read everything from the current position to the end
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.remaining().min(1 << 20) as usize);
        self.read_to_end(&mut buf).await.map_err(from_io)?;
        Ok(buf)
    }

    /// Copy the rest of the blob into `writer`
    pub async fn write_to<W>(&mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        tokio::io::copy(self, writer).await.map_err(from_io)
    }

    /// Move the read position. Returns the new position.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.range_len().checked_add_signed(delta),
        };
        let new_pos = new_pos.ok_or_else(|| {
            BlobError::Validation(format!("invalid seek to {:?} from {}", pos, self.pos))
        })?;

        if new_pos != self.pos {
            self.pos = new_pos;
            self.state = State::Idle;
        }
        Ok(new_pos)
    }

    /// Length of the requested range, clipped to the blob
    fn range_len(&self) -> u64 {
        let available = self.attributes.size.saturating_sub(self.offset);
        self.length.map_or(available, |l| l.min(available))
    }

    fn remaining(&self) -> u64 {
        self.range_len().saturating_sub(self.pos)
    }
}

impl AsyncRead for Reader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                State::Open(body) => {
                    let before = buf.filled().len();
                    ready!(body.as_mut().poll_read(cx, buf))?;
                    this.pos += (buf.filled().len() - before) as u64;
                    return Poll::Ready(Ok(()));
                }
                State::Opening(opening) => match ready!(opening.as_mut().poll(cx)) {
                    Ok(reader) => this.state = State::Open(reader.body),
                    Err(err) => {
                        this.state = State::Idle;
                        return Poll::Ready(Err(io::Error::other(err)));
                    }
                },
                State::Idle => {
                    if this.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let driver = this.driver.clone();
                    let key = this.key.clone();
                    let offset = this.offset + this.pos;
                    let length = this.length.map(|l| l - this.pos);
                    this.state = State::Opening(Box::pin(async move {
                        driver
                            .new_range_reader(&key, offset, length)
                            .await
                            .map_err(|e| driver.normalize_error(e).with_key(&key))
                    }));
                }
            }
        }
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("key", &self.key)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("pos", &self.pos)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// Recover a driver error that travelled through an `io::Error`
pub(crate) fn from_io(err: io::Error) -> BlobError {
    if !err.get_ref().is_some_and(|inner| inner.is::<BlobError>()) {
        return BlobError::Io(err);
    }
    match err.into_inner().map(|inner| inner.downcast::<BlobError>()) {
        Some(Ok(err)) => *err,
        _ => BlobError::Io(io::Error::other("reader failed")),
    }
}
