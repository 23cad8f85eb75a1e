//! Paginated upstream sources (the article API).

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use newsrelay_core::RowImage;

pub mod http;
pub mod in_memory;

pub use http::{HttpPageSource, HttpSourceSettings};
pub use in_memory::InMemoryPageSource;

/// One page to fetch: `page` is 1-indexed, scoped to `date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub date: NaiveDate,
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(date: NaiveDate, page: u32, page_size: u32) -> Self {
        Self {
            date,
            page,
            page_size,
        }
    }
}

/// A fetched page plus the total item count the source reports for the query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<RowImage>,
    pub total_count: u64,
}

impl Page {
    /// Pages needed to cover `total_count` at `page_size` (at least 1).
    pub fn total_pages(&self, page_size: u32) -> u32 {
        if page_size == 0 {
            return 1;
        }
        let pages = self.total_count.div_ceil(u64::from(page_size)).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("source returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode page: {0}")]
    Decode(String),

    /// Injected or otherwise unexplained failure (tests/dev).
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PaginatedSource: Send + Sync {
    async fn fetch(&self, request: PageRequest) -> Result<Page, SourceError>;
}

#[async_trait]
impl<S> PaginatedSource for std::sync::Arc<S>
where
    S: PaginatedSource + ?Sized,
{
    async fn fetch(&self, request: PageRequest) -> Result<Page, SourceError> {
        (**self).fetch(request).await
    }
}
