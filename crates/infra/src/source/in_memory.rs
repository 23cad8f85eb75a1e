use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use newsrelay_core::RowImage;

use super::{Page, PageRequest, PaginatedSource, SourceError};

/// In-memory paginated source for tests/dev.
///
/// Serves a fixed item list sliced by page, ignoring the date. Pages can be
/// scripted to fail a number of times before they succeed.
#[derive(Debug, Default)]
pub struct InMemoryPageSource {
    items: Vec<RowImage>,
    failures: Mutex<HashMap<u32, u32>>,
    calls: Mutex<Vec<u32>>,
}

impl InMemoryPageSource {
    pub fn new(items: Vec<RowImage>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    /// Fail the next `times` fetches of `page`.
    pub fn fail_page(&self, page: u32, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(page, times);
        }
    }

    /// Pages fetched so far, in call order (failed calls included).
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, page: u32) -> usize {
        self.calls().into_iter().filter(|p| *p == page).count()
    }
}

#[async_trait]
impl PaginatedSource for InMemoryPageSource {
    async fn fetch(&self, request: PageRequest) -> Result<Page, SourceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.page);
        }

        {
            let mut failures = self
                .failures
                .lock()
                .map_err(|_| SourceError::Unavailable("failure script poisoned".into()))?;
            if let Some(remaining) = failures.get_mut(&request.page) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::Unavailable(format!(
                        "injected failure for page {}",
                        request.page
                    )));
                }
            }
        }

        let size = request.page_size as usize;
        let start = (request.page.saturating_sub(1) as usize).saturating_mul(size);
        let items = self
            .items
            .iter()
            .skip(start)
            .take(size)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total_count: self.items.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn items(n: usize) -> Vec<RowImage> {
        (0..n)
            .map(|i| RowImage::from_value(json!({ "id": format!("a{i}") })).unwrap())
            .collect()
    }

    fn request(page: u32) -> PageRequest {
        PageRequest::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), page, 2)
    }

    #[tokio::test]
    async fn slices_items_by_page() {
        let source = InMemoryPageSource::new(items(5));

        let last = source.fetch(request(3)).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.total_count, 5);

        let beyond = source.fetch(request(4)).await.unwrap();
        assert!(beyond.items.is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let source = InMemoryPageSource::new(items(2));
        source.fail_page(1, 2);

        assert!(source.fetch(request(1)).await.is_err());
        assert!(source.fetch(request(1)).await.is_err());
        assert!(source.fetch(request(1)).await.is_ok());
        assert_eq!(source.calls_for(1), 3);
    }
}
