//! Listing iterator

use crate::Bucket;
use blobfs_driver::{ListObject, ListOptions, Result};
use std::collections::VecDeque;

/// Iterates over a listing page by page.
///
/// Results come in key order. Blobs written or deleted while iterating
/// may or may not show up.
pub struct ListIterator {
    bucket: Bucket,
    opts: ListOptions,
    page: VecDeque<ListObject>,
    done: bool,
}

impl ListIterator {
    pub(crate) fn new(bucket: Bucket, opts: ListOptions) -> Self {
        Self {
            bucket,
            opts,
            page: VecDeque::new(),
            done: false,
        }
    }

    /// The next object, or `None` once the listing is exhausted
    pub async fn next(&mut self) -> Result<Option<ListObject>> {
        loop {
            if let Some(obj) = self.page.pop_front() {
                return Ok(Some(obj));
            }
            if self.done {
                return Ok(None);
            }

            let page = self.bucket.list_driver_page(&self.opts).await?;
            self.done = page.next_page_token.is_none();
            self.opts.page_token = page.next_page_token;
            self.page = page.objects.into();
        }
    }

    /// Collect the remaining objects
    pub async fn collect(mut self) -> Result<Vec<ListObject>> {
        let mut out = Vec::new();
        while let Some(obj) = self.next().await? {
            out.push(obj);
        }
        Ok(out)
    }
}
