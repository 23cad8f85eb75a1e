//! Property tests over the public pipeline API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use newsrelay_core::{Row, RowIdentity, RowImage, RowKey};
use newsrelay_events::{InMemoryChannel, MessageChannel};
use newsrelay_infra::pipelines::{
    ArticleCollector, CdcConsumer, CollectionError, CollectionSettings, RelayRoute, UpsertRow,
};
use newsrelay_infra::resilience::{BatchSettings, RetrySettings};
use newsrelay_infra::source::InMemoryPageSource;
use newsrelay_infra::store::{InMemoryRowStore, RowStore};
use newsrelay_infra::{DeadLetterPublisher, OperationRegistry};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn fast_retry() -> RetrySettings {
    RetrySettings::new(1, Duration::from_millis(10), 2.0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever order creates for one key arrive in, the newest one wins.
    #[test]
    fn out_of_order_creates_never_regress_a_row(minutes in prop::collection::vec(0u32..600, 1..12)) {
        let rt = runtime();
        let stored = rt.block_on(async {
            let channel = Arc::new(InMemoryChannel::new());
            let store = Arc::new(InMemoryRowStore::new());
            let routes = OperationRegistry::new().with(RelayRoute::for_table(
                "articles",
                RowIdentity::new("id", "updated_at"),
                store.clone(),
                Arc::new(UpsertRow::new("article-relay", store.clone())),
            ));
            let consumer = CdcConsumer::new(
                "prop",
                routes,
                DeadLetterPublisher::new(channel.clone(), "dlq"),
                fast_retry(),
            );

            for minute in &minutes {
                let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::minutes(i64::from(*minute));
                let payload = json!({
                    "op": "c",
                    "after": { "id": "K", "updated_at": ts.to_rfc3339() },
                    "source": { "table": "articles" },
                });
                channel.push(Some("K"), payload.to_string());
            }

            while let Some(message) = channel.receive(1).await.unwrap().pop() {
                consumer.handle(&message).await.unwrap();
            }

            store.get(&RowKey::new("K").unwrap()).map(|r| r.updated_at)
        });

        let newest = minutes.iter().max().map(|m| {
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(i64::from(*m))
        });
        prop_assert_eq!(stored, newest);
    }

    /// Only the pages that keep failing are reported; every other page is persisted.
    #[test]
    fn batch_failure_names_exactly_the_failing_pages(
        pages in 2u32..8,
        failing in prop::collection::btree_set(2u32..8, 0..3),
    ) {
        let failing: BTreeSet<u32> = failing.into_iter().filter(|p| *p <= pages).collect();
        let page_size = 3u32;

        let rt = runtime();
        let (result, stored) = rt.block_on(async {
            let items: Vec<RowImage> = (0..pages * page_size)
                .map(|i| RowImage::from_value(json!({
                    "id": format!("a{i:03}"),
                    "published_at": "2024-05-01T08:00:00Z",
                })).unwrap())
                .collect();
            let source = Arc::new(InMemoryPageSource::new(items));
            for page in &failing {
                source.fail_page(*page, u32::MAX);
            }
            let store = Arc::new(InMemoryRowStore::new());
            let settings = CollectionSettings::default()
                .with_page_size(page_size)
                .with_first_page_retry(fast_retry())
                .with_batch(BatchSettings { unit_retry: fast_retry(), resweeps: 1, concurrency: 2 });

            let result = ArticleCollector::new(source, store.clone(), settings)
                .collect(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
                .await;
            (result, store.len())
        });

        let expected_rows = ((pages - failing.len() as u32) * page_size) as usize;
        prop_assert_eq!(stored, expected_rows);

        match result {
            Ok(report) => prop_assert!(failing.is_empty() && report.pages == pages),
            Err(err @ CollectionError::Incomplete { .. }) => {
                prop_assert_eq!(err.unresolved_pages(), failing.into_iter().collect::<Vec<_>>());
            }
            Err(other) => prop_assert!(false, "unexpected error: {other}"),
        }
    }

    /// Saving the same key set twice leaves one row per key.
    #[test]
    fn saving_a_key_set_twice_is_idempotent(keys in prop::collection::vec("[a-z]{1,6}", 1..20)) {
        let rt = runtime();
        let (first, second, len) = rt.block_on(async {
            let store = InMemoryRowStore::new();
            let rows: Vec<Row> = keys
                .iter()
                .map(|k| Row::new(RowKey::new(k.clone()).unwrap(), Utc::now(), json!({ "id": k })))
                .collect();
            let first = store.save_all(rows.clone()).await.unwrap();
            let second = store.save_all(rows).await.unwrap();
            (first, second, store.len())
        });

        let distinct: BTreeSet<&String> = keys.iter().collect();
        prop_assert_eq!(first, distinct.len());
        prop_assert_eq!(second, 0);
        prop_assert_eq!(len, distinct.len());
    }
}
