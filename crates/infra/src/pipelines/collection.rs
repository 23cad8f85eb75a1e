//! Daily article collection from the paginated source.
//!
//! Page 1 is fetched eagerly under its own retry budget because it carries the
//! total count; if it cannot be fetched the day fails without touching any
//! other page. Pages 2..=N then go through the batch processor. Every page is
//! persisted as soon as it is fetched, so a later page failing never loses
//! the pages that already made it.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use newsrelay_core::RowIdentity;

use crate::resilience::{
    BatchFailure, BatchProcessor, BatchSettings, RetriesExhausted, RetrySettings, execute_logged,
};
use crate::source::{Page, PageRequest, PaginatedSource, SourceError};
use crate::store::{RowStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSettings {
    pub page_size: u32,
    /// Budget for the eager first page.
    pub first_page_retry: RetrySettings,
    /// Per-page budget, resweeps and concurrency for pages 2..=N.
    pub batch: BatchSettings,
    pub identity: RowIdentity,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            first_page_retry: RetrySettings::default(),
            batch: BatchSettings::default(),
            identity: RowIdentity::new("id", "published_at"),
        }
    }
}

impl CollectionSettings {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_first_page_retry(mut self, retry: RetrySettings) -> Self {
        self.first_page_retry = retry;
        self
    }

    pub fn with_batch(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_identity(mut self, identity: RowIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// One page could not be fetched or persisted.
#[derive(Debug, Error)]
pub enum PageError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection for {date} aborted: first page failed: {source}")]
    FirstPage {
        date: NaiveDate,
        #[source]
        source: RetriesExhausted<PageError>,
    },

    #[error("collection for {date} incomplete: {source}")]
    Incomplete {
        date: NaiveDate,
        #[source]
        source: BatchFailure<u32, PageError>,
    },
}

impl CollectionError {
    /// Pages that were never persisted.
    pub fn unresolved_pages(&self) -> Vec<u32> {
        match self {
            CollectionError::FirstPage { .. } => vec![1],
            CollectionError::Incomplete { source, .. } => source.failed_units.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub date: NaiveDate,
    pub total_count: u64,
    pub pages: u32,
    /// Items fetched on persisted pages.
    pub fetched: u64,
    /// Rows newly inserted (already-known keys are not counted).
    pub inserted: u64,
    /// Items skipped because their key or timestamp was unreadable.
    pub invalid: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fetched: AtomicU64,
    inserted: AtomicU64,
    invalid: AtomicU64,
}

/// Collects one day of articles from a [`PaginatedSource`] into a [`RowStore`].
#[derive(Debug, Clone)]
pub struct ArticleCollector<S, R> {
    source: S,
    store: R,
    settings: CollectionSettings,
}

impl<S, R> ArticleCollector<S, R>
where
    S: PaginatedSource,
    R: RowStore,
{
    pub fn new(source: S, store: R, settings: CollectionSettings) -> Self {
        Self {
            source,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &CollectionSettings {
        &self.settings
    }

    #[instrument(skip(self), fields(page_size = self.settings.page_size))]
    pub async fn collect(&self, date: NaiveDate) -> Result<CollectionReport, CollectionError> {
        let counters = Counters::default();

        let first = execute_logged(self.settings.first_page_retry, "fetch first page", || {
            self.process_page(date, 1, &counters)
        })
        .await
        .map_err(|source| {
            error!(%date, attempts = source.attempts, error = %source.last_error, "first page failed; aborting collection");
            CollectionError::FirstPage { date, source }
        })?;

        let pages = first.total_pages(self.settings.page_size);
        info!(%date, total_count = first.total_count, pages, "first page collected");

        if pages > 1 {
            BatchProcessor::new(self.settings.batch)
                .run((2..=pages).collect(), |page| {
                    self.process_page(date, page, &counters)
                })
                .await
                .map_err(|source| {
                    error!(%date, failed_pages = ?source.failed_units, "collection incomplete");
                    CollectionError::Incomplete { date, source }
                })?;
        }

        let report = CollectionReport {
            date,
            total_count: first.total_count,
            pages,
            fetched: counters.fetched.load(Ordering::Relaxed),
            inserted: counters.inserted.load(Ordering::Relaxed),
            invalid: counters.invalid.load(Ordering::Relaxed),
        };
        info!(
            %date,
            pages,
            fetched = report.fetched,
            inserted = report.inserted,
            invalid = report.invalid,
            "collection finished"
        );
        Ok(report)
    }

    /// Fetch one page and persist it. Returns the page minus its items.
    async fn process_page(
        &self,
        date: NaiveDate,
        page: u32,
        counters: &Counters,
    ) -> Result<Page, PageError> {
        let fetched = self
            .source
            .fetch(PageRequest::new(date, page, self.settings.page_size))
            .await?;

        let item_count = fetched.items.len() as u64;
        let mut rows = Vec::with_capacity(fetched.items.len());
        let mut invalid = 0u64;
        for item in fetched.items {
            match self.settings.identity.row(item) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!(%date, page, error = %err, "skipping unreadable item");
                    invalid += 1;
                }
            }
        }

        let inserted = self.store.save_all(rows).await? as u64;

        counters.fetched.fetch_add(item_count, Ordering::Relaxed);
        counters.inserted.fetch_add(inserted, Ordering::Relaxed);
        counters.invalid.fetch_add(invalid, Ordering::Relaxed);

        Ok(Page {
            items: Vec::new(),
            total_count: fetched.total_count,
        })
    }
}
