use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use newsrelay_core::RowImage;

use super::{Page, PageRequest, PaginatedSource, SourceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceSettings {
    /// Listing endpoint, e.g. `https://news.example.com/v1/articles`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub timeout: Duration,
}

impl HttpSourceSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            api_key_header: "X-Api-Key".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Wire shape of one listing page.
#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(alias = "articles", alias = "data")]
    items: Vec<RowImage>,
    #[serde(alias = "totalCount", alias = "total")]
    total_count: u64,
}

/// Paginated article API over HTTP.
///
/// Issues `GET {base_url}?date=YYYY-MM-DD&page=N&size=M` and expects a JSON
/// body with an item array plus the total item count for the date.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http_client: reqwest::Client,
    settings: HttpSourceSettings,
}

impl HttpPageSource {
    pub fn new(settings: HttpSourceSettings) -> Result<Self, SourceError> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            settings,
        })
    }
}

#[async_trait]
impl PaginatedSource for HttpPageSource {
    async fn fetch(&self, request: PageRequest) -> Result<Page, SourceError> {
        let date = request.date.format("%Y-%m-%d").to_string();
        debug!(url = %self.settings.base_url, date = %date, page = request.page, "fetching page");

        let mut builder = self.http_client.get(&self.settings.base_url).query(&[
            ("date", date),
            ("page", request.page.to_string()),
            ("size", request.page_size.to_string()),
        ]);
        if let Some(key) = &self.settings.api_key {
            builder = builder.header(self.settings.api_key_header.as_str(), key.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: PageBody = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        Ok(Page {
            items: body.items,
            total_count: body.total_count,
        })
    }
}
