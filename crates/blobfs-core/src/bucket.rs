//! The bucket facade over a storage driver

use crate::list::ListIterator;
use crate::reader::Reader;
use crate::writer::Writer;
use blobfs_driver::{
    Attributes, BlobError, Driver, ListOptions, ListPage, LocalDriver, LocalOptions, Result,
    S3Driver, WriterOptions,
};
use blobfs_s3::S3Config;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, instrument};

/// A collection of blobs backed by one driver.
///
/// Cheap to clone; clones share the driver and the open/closed state.
/// Once [`Bucket::close`] returns, every operation fails with
/// [`BlobError::Closed`], while operations already running finish first.
#[derive(Clone)]
pub struct Bucket {
    driver: Arc<dyn Driver>,
    closed: Arc<RwLock<bool>>,
}

impl Bucket {
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::from_arc(Arc::new(driver))
    }

    pub fn from_arc(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            closed: Arc::new(RwLock::new(false)),
        }
    }

    /// Bucket over a local directory
    pub fn open_local(dir: impl AsRef<Path>, opts: LocalOptions) -> Result<Self> {
        Ok(Self::new(LocalDriver::open(dir, opts)?))
    }

    /// Bucket over an S3 bucket
    pub fn open_s3(config: S3Config) -> Result<Self> {
        Ok(Self::new(S3Driver::open(config)?))
    }

    /// The underlying driver
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub(crate) async fn guard(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let guard = self.closed.read().await;
        if *guard {
            return Err(BlobError::Closed);
        }
        Ok(guard)
    }

    pub(crate) fn fail(&self, err: BlobError, key: &str) -> BlobError {
        self.driver.normalize_error(err).with_key(key)
    }

    /// Attributes of the blob at `key`
    #[instrument(skip(self))]
    pub async fn attributes(&self, key: &str) -> Result<Attributes> {
        check_key(key)?;
        let _guard = self.guard().await?;
        self.driver
            .attributes(key)
            .await
            .map_err(|e| self.fail(e, key))
    }

    /// Whether a blob exists at `key`
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.attributes(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read the whole blob into memory
    pub async fn read_all(&self, key: &str) -> Result<Vec<u8>> {
        self.new_reader(key).await?.read_all().await
    }

    pub async fn new_reader(&self, key: &str) -> Result<Reader> {
        self.new_range_reader(key, 0, -1).await
    }

    /// Reader for `length` bytes starting at `offset`. A negative `length`
    /// reads to the end of the blob.
    #[instrument(skip(self))]
    pub async fn new_range_reader(&self, key: &str, offset: i64, length: i64) -> Result<Reader> {
        check_key(key)?;
        if offset < 0 {
            return Err(BlobError::Validation(format!(
                "negative offset {}",
                offset
            )));
        }
        let offset = offset as u64;
        let length = u64::try_from(length).ok();

        let _guard = self.guard().await?;
        let reader = self
            .driver
            .new_range_reader(key, offset, length)
            .await
            .map_err(|e| self.fail(e, key))?;
        Ok(Reader::new(self.driver.clone(), key, offset, length, reader))
    }

    /// Start writing `key`. The blob is only created when the returned
    /// writer is closed.
    #[instrument(skip(self, opts))]
    pub async fn new_writer(&self, key: &str, opts: WriterOptions) -> Result<Writer> {
        check_key(key)?;
        let _guard = self.guard().await?;
        Writer::open(self.driver.clone(), key, opts).await
    }

    /// Write `data` to `key` in one call
    pub async fn write_all(&self, key: &str, data: &[u8], opts: WriterOptions) -> Result<()> {
        let mut writer = self.new_writer(key, opts).await?;
        writer.write(data).await?;
        writer.close().await
    }

    /// Copy `src` to `dst`, replacing `dst`
    #[instrument(skip(self))]
    pub async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        check_key(dst)?;
        check_key(src)?;
        let _guard = self.guard().await?;
        self.driver
            .copy(dst, src)
            .await
            .map_err(|e| self.fail(e, src))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let _guard = self.guard().await?;
        self.driver.delete(key).await.map_err(|e| self.fail(e, key))
    }

    /// Iterate over all blobs matching `opts`
    pub fn list(&self, opts: ListOptions) -> ListIterator {
        ListIterator::new(self.clone(), opts)
    }

    /// One page of `page_size` results, starting after `page_token`.
    ///
    /// Keeps asking the driver until the page is full or the listing
    /// ends, so only the last page is ever short.
    #[instrument(skip(self))]
    pub async fn list_page(
        &self,
        page_token: Option<String>,
        page_size: usize,
        opts: ListOptions,
    ) -> Result<(Vec<blobfs_driver::ListObject>, Option<String>)> {
        if page_size == 0 {
            return Err(BlobError::Validation("page size must be positive".into()));
        }

        let mut opts = opts.with_page_token(page_token);
        let mut objects = Vec::with_capacity(page_size);
        loop {
            opts.page_size = page_size - objects.len();
            let page = self.list_driver_page(&opts).await?;
            objects.extend(page.objects);
            match page.next_page_token {
                Some(token) if objects.len() < page_size => opts.page_token = Some(token),
                next => return Ok((objects, next)),
            }
        }
    }

    pub(crate) async fn list_driver_page(&self, opts: &ListOptions) -> Result<ListPage> {
        let _guard = self.guard().await?;
        self.driver
            .list_paged(opts)
            .await
            .map_err(|e| self.driver.normalize_error(e))
    }

    /// Close the bucket and its driver. Waits for running operations.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.write().await;
        if *closed {
            return Err(BlobError::Closed);
        }
        *closed = true;
        debug!("closing bucket");
        self.driver
            .close()
            .await
            .map_err(|e| self.driver.normalize_error(e))
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BlobError::Validation("key must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bucket() -> (TempDir, Bucket) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Bucket::open_local(dir.path(), LocalOptions::default()).unwrap();
        (dir, bucket)
    }

    async fn put(bucket: &Bucket, key: &str, data: &[u8]) {
        bucket
            .write_all(key, data, WriterOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exists_and_not_found() {
        let (_dir, bucket) = bucket();
        assert!(!bucket.exists("a.txt").await.unwrap());

        put(&bucket, "a.txt", b"hello").await;
        assert!(bucket.exists("a.txt").await.unwrap());

        match bucket.attributes("missing.txt").await {
            Err(BlobError::NotFound { key, .. }) => assert_eq!(key, "missing.txt"),
            other => panic!("expected not found, got {:?}", other),
        }
        assert!(bucket.delete("missing.txt").await.unwrap_err().is_not_found());
        assert!(bucket.new_reader("missing.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_key_and_negative_offset() {
        let (_dir, bucket) = bucket();
        assert!(matches!(
            bucket.attributes("").await,
            Err(BlobError::Validation(_))
        ));
        assert!(matches!(
            bucket.new_range_reader("a", -1, 1).await,
            Err(BlobError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_range_reads() {
        let (_dir, bucket) = bucket();
        put(&bucket, "k", b"0123456789").await;

        assert_eq!(bucket.read_all("k").await.unwrap(), b"0123456789");

        let mut r = bucket.new_range_reader("k", 3, 4).await.unwrap();
        assert_eq!(r.read_all().await.unwrap(), b"3456");
        assert_eq!(r.size(), 10);

        let mut r = bucket.new_range_reader("k", 7, -1).await.unwrap();
        assert_eq!(r.read_all().await.unwrap(), b"789");

        let mut r = bucket.new_range_reader("k", 2, 0).await.unwrap();
        assert!(r.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy() {
        let (_dir, bucket) = bucket();
        put(&bucket, "src", b"data").await;
        bucket.copy("dst", "src").await.unwrap();
        assert_eq!(bucket.read_all("dst").await.unwrap(), b"data");

        match bucket.copy("dst", "nope").await {
            Err(BlobError::NotFound { key, .. }) => assert_eq!(key, "nope"),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_page_fills_pages() {
        let (_dir, bucket) = bucket();
        for i in 0..7 {
            put(&bucket, &format!("k{}", i), b"x").await;
        }

        assert!(matches!(
            bucket.list_page(None, 0, ListOptions::new()).await,
            Err(BlobError::Validation(_))
        ));

        let mut token = None;
        let mut pages = Vec::new();
        loop {
            let (objects, next) = bucket.list_page(token, 3, ListOptions::new()).await.unwrap();
            pages.push(objects.iter().map(|o| o.key.clone()).collect::<Vec<_>>());
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(
            pages,
            vec![
                vec!["k0", "k1", "k2"],
                vec!["k3", "k4", "k5"],
                vec!["k6"],
            ]
        );
    }

    #[tokio::test]
    async fn test_list_iterator() {
        let (_dir, bucket) = bucket();
        for key in ["b", "a/1", "a/2", "c"] {
            put(&bucket, key, b"x").await;
        }

        let mut iter = bucket.list(ListOptions::new().with_page_size(1));
        let mut keys = Vec::new();
        while let Some(obj) = iter.next().await.unwrap() {
            keys.push(obj.key);
        }
        assert_eq!(keys, vec!["a/1", "a/2", "b", "c"]);
        assert!(iter.next().await.unwrap().is_none());

        let mut iter = bucket.list(ListOptions::new().with_delimiter("/"));
        let first = iter.next().await.unwrap().unwrap();
        assert_eq!(first.key, "a/");
        assert!(first.is_dir);
    }

    #[tokio::test]
    async fn test_close() {
        let (_dir, bucket) = bucket();
        put(&bucket, "k", b"x").await;
        let clone = bucket.clone();

        bucket.close().await.unwrap();
        assert!(matches!(bucket.close().await, Err(BlobError::Closed)));
        assert!(matches!(clone.attributes("k").await, Err(BlobError::Closed)));
        assert!(matches!(
            clone.new_writer("k", WriterOptions::default()).await,
            Err(BlobError::Closed)
        ));
        assert!(matches!(
            clone.list(ListOptions::new()).next().await,
            Err(BlobError::Closed)
        ));
    }
}
