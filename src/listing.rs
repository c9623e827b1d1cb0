// Keyset-paginated listings with a static fallback
//
// Both paths use the same filters, the same (timestamp desc, id desc) order
// and the same cursor, so a cursor from one page can be followed on either.

use crate::accessor::RemoteAccessor;
use crate::config::ListingConfig;
use crate::cursor::{self, CursorPayload};
use crate::dataset::StaticDataset;
use crate::filter::Filter;
use crate::record::ListedRecord;
use crate::remote::{RecordQuery, RemoteStore};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use tracing::{debug, info};

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 100;
/// Upper bound for a configured `max_limit`
pub const LIMIT_CEILING: usize = 1000;

/// Listing request. All filters must hold (AND).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub category: Option<String>,
    pub search: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// One page of results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub entries: Vec<ListedRecord>,
    /// Cursor for the next page; `None` once nothing is left
    pub next_cursor: Option<String>,
}

impl ListPage {
    fn from_rows(mut rows: Vec<ListedRecord>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }

        let next_cursor = if has_more { cursor::encode(rows.last()) } else { None };
        Self {
            entries: rows,
            next_cursor,
        }
    }
}

pub struct RecordLister {
    accessor: Rc<RemoteAccessor>,
    dataset: Rc<StaticDataset>,
    default_limit: usize,
    max_limit: usize,
}

impl RecordLister {
    pub fn new(accessor: Rc<RemoteAccessor>, dataset: Rc<StaticDataset>) -> Self {
        Self {
            accessor,
            dataset,
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
        }
    }

    pub fn from_config(accessor: Rc<RemoteAccessor>, config: &ListingConfig) -> Self {
        let mut lister = Self::new(accessor, Rc::new(StaticDataset::load(config)));
        lister.max_limit = config.max_limit.clamp(1, LIMIT_CEILING);
        lister.default_limit = config.default_limit.clamp(1, lister.max_limit);
        lister
    }

    /// Page size actually used for `query`
    pub fn effective_limit(&self, query: &ListQuery) -> usize {
        query.limit.unwrap_or(self.default_limit).clamp(1, self.max_limit)
    }

    /// List one page. Served remotely when possible; a remote error, or an
    /// empty first page, falls back to the static dataset.
    pub fn list(&self, query: &ListQuery) -> ListPage {
        let limit = self.effective_limit(query);
        let filters = Filter::for_query(query);
        let after = cursor::decode(query.cursor.as_deref());

        if let Some(remote) = self.accessor.get() {
            match list_remote(&*remote, &filters, after.as_ref(), limit) {
                Ok(page) if page.entries.is_empty() && after.is_none() => {
                    info!("Remote listing is empty, serving fallback dataset");
                }
                Ok(page) => {
                    debug!(count = page.entries.len(), more = page.next_cursor.is_some(), "Served remote listing");
                    return page;
                }
                Err(e) => {
                    info!(error = %e, "Remote listing failed, serving fallback dataset");
                    self.accessor.invalidate();
                }
            }
        }

        list_static(&self.dataset, &filters, after.as_ref(), limit)
    }
}

fn list_remote(
    remote: &dyn RemoteStore,
    filters: &[Filter],
    after: Option<&CursorPayload>,
    limit: usize,
) -> Result<ListPage> {
    // One extra row tells whether another page exists
    let rows = remote.query_records(&RecordQuery {
        filters: filters.to_vec(),
        after: after.cloned(),
        limit: limit + 1,
    })?;
    Ok(ListPage::from_rows(rows, limit))
}

fn list_static(dataset: &StaticDataset, filters: &[Filter], after: Option<&CursorPayload>, limit: usize) -> ListPage {
    let rows: Vec<ListedRecord> = dataset
        .records()
        .iter()
        .filter(|r| filters.iter().all(|f| f.matches(r)))
        .filter(|r| after.is_none_or(|c| c.precedes(r)))
        .take(limit + 1)
        .cloned()
        .collect();
    ListPage::from_rows(rows, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FlakyRemote, limit, listed};

    fn four_updates() -> Vec<ListedRecord> {
        vec![
            listed("u1", "2025-01-28", "Generation", "Bulk runs", "Run prompts over rows"),
            listed("u2", "2025-02-05", "UI", "Column templates", "Placeholders in prompts"),
            listed("u3", "2025-02-12", "UI", "CSV export", "Export outputs"),
            listed("u4", "2025-02-16", "Settings", "Settings sync", "Sync across tabs"),
        ]
    }

    fn offline_lister(records: Vec<ListedRecord>) -> RecordLister {
        RecordLister::new(
            Rc::new(RemoteAccessor::unavailable()),
            Rc::new(StaticDataset::new(records).unwrap()),
        )
    }

    fn remote_accessor(remote: &Rc<FlakyRemote>) -> Rc<RemoteAccessor> {
        let handle: Rc<dyn RemoteStore> = remote.clone();
        Rc::new(RemoteAccessor::with_handle(handle))
    }

    fn remote_lister(remote: &Rc<FlakyRemote>, fallback: Vec<ListedRecord>) -> RecordLister {
        RecordLister::new(remote_accessor(remote), Rc::new(StaticDataset::new(fallback).unwrap()))
    }

    fn ids(page: &ListPage) -> Vec<&str> {
        page.entries.iter().map(|r| r.id.as_str()).collect()
    }

    fn follow_all(lister: &RecordLister, mut query: ListQuery) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let page = lister.list(&query);
            seen.extend(page.entries.iter().map(|r| r.id.clone()));
            match page.next_cursor {
                Some(next) => query.cursor = Some(next),
                None => return seen,
            }
        }
    }

    #[test]
    fn test_two_pages_static() {
        let lister = offline_lister(four_updates());

        let first = lister.list(&limit(2));
        assert_eq!(ids(&first), vec!["u4", "u3"]);
        assert!(first.next_cursor.is_some());

        let second = lister.list(&ListQuery {
            cursor: first.next_cursor.clone(),
            ..limit(2)
        });
        assert_eq!(ids(&second), vec!["u2", "u1"]);
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn test_two_pages_remote() {
        let remote = FlakyRemote::with_records(four_updates());
        let lister = remote_lister(&remote, vec![]);

        let first = lister.list(&limit(2));
        assert_eq!(ids(&first), vec!["u4", "u3"]);
        assert!(first.next_cursor.is_some());

        let second = lister.list(&ListQuery {
            cursor: first.next_cursor.clone(),
            ..limit(2)
        });
        assert_eq!(ids(&second), vec!["u2", "u1"]);
        // Exact end detection even when the last page is full
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn test_following_cursors_covers_everything_once() {
        let dataset = StaticDataset::bundled().unwrap();
        let expected: Vec<String> = dataset.records().iter().map(|r| r.id.clone()).collect();
        let records = dataset.records().to_vec();

        for page_size in 1..=4 {
            let lister = offline_lister(records.clone());
            assert_eq!(follow_all(&lister, limit(page_size)), expected);

            let remote = FlakyRemote::with_records(records.clone());
            let lister = remote_lister(&remote, vec![]);
            assert_eq!(follow_all(&lister, limit(page_size)), expected);
        }
    }

    #[test]
    fn test_cursor_between_equal_timestamps() {
        let records = vec![
            listed("a", "2025-02-12", "UI", "", ""),
            listed("b", "2025-02-12", "UI", "", ""),
            listed("c", "2025-02-12", "UI", "", ""),
            listed("z", "2025-01-01", "UI", "", ""),
        ];
        let lister = offline_lister(records.clone());

        let first = lister.list(&limit(2));
        assert_eq!(ids(&first), vec!["c", "b"]);
        let second = lister.list(&ListQuery {
            cursor: first.next_cursor.clone(),
            ..limit(2)
        });
        assert_eq!(ids(&second), vec!["a", "z"]);

        let remote = FlakyRemote::with_records(records);
        let lister = remote_lister(&remote, vec![]);
        let second_remote = lister.list(&ListQuery {
            cursor: first.next_cursor,
            ..limit(2)
        });
        assert_eq!(ids(&second_remote), vec!["a", "z"]);
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let records = vec![
            listed("1", "2025-02-01", "UI", "CSV export", ""),
            listed("2", "2025-02-02", "UI", "Dark mode", "Theme switch"),
            listed("3", "2025-02-03", "API", "Export endpoint", ""),
            listed("4", "2025-02-04", "UI", "Grid", "Faster EXPORT of rows"),
        ];
        let query = ListQuery {
            category: Some("UI".to_string()),
            search: Some("export".to_string()),
            ..limit(10)
        };

        let page = offline_lister(records.clone()).list(&query);
        assert_eq!(ids(&page), vec!["4", "1"]);

        let remote = FlakyRemote::with_records(records);
        let page = remote_lister(&remote, vec![]).list(&query);
        assert_eq!(ids(&page), vec!["4", "1"]);
    }

    #[test]
    fn test_date_range_inclusive_on_both_paths() {
        let query = ListQuery {
            start_date: Some("2025-02-05".to_string()),
            end_date: Some("2025-02-12".to_string()),
            ..limit(10)
        };

        let page = offline_lister(four_updates()).list(&query);
        assert_eq!(ids(&page), vec!["u3", "u2"]);

        let remote = FlakyRemote::with_records(four_updates());
        let page = remote_lister(&remote, vec![]).list(&query);
        assert_eq!(ids(&page), vec!["u3", "u2"]);
    }

    #[test]
    fn test_remote_error_falls_back() {
        let remote = FlakyRemote::with_records(vec![listed("remote-only", "2025-03-01", "UI", "", "")]);
        remote.fail_query.set(true);
        let lister = remote_lister(&remote, four_updates());

        let page = lister.list(&limit(2));
        assert_eq!(ids(&page), vec!["u4", "u3"]);
        assert!(!lister.accessor.is_cached());

        remote.fail_query.set(false);
        let page = lister.list(&limit(2));
        assert_eq!(ids(&page), vec!["remote-only"]);
    }

    #[test]
    fn test_empty_remote_first_page_falls_back() {
        let remote = FlakyRemote::with_records(vec![]);
        let lister = remote_lister(&remote, four_updates());

        let page = lister.list(&limit(3));
        assert_eq!(ids(&page), vec!["u4", "u3", "u2"]);
        assert_eq!(remote.queries.get(), 1);
        // Fallback does not count as a remote failure
        assert!(lister.accessor.is_cached());
    }

    #[test]
    fn test_empty_remote_later_page_stays_remote() {
        let remote = FlakyRemote::with_records(vec![listed("only", "2025-03-01", "UI", "", "")]);
        let lister = remote_lister(&remote, four_updates());

        let cursor = r#"{"timestamp":"2025-03-01T00:00:00.000Z","id":"only"}"#.to_string();
        let page = lister.list(&ListQuery {
            cursor: Some(cursor),
            ..limit(3)
        });
        assert!(page.entries.is_empty());
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_malformed_cursor_means_first_page() {
        let lister = offline_lister(four_updates());
        let page = lister.list(&ListQuery {
            cursor: Some("garbage".to_string()),
            ..limit(1)
        });
        assert_eq!(ids(&page), vec!["u4"]);
    }

    #[test]
    fn test_limit_clamped() {
        let lister = offline_lister(four_updates());
        assert_eq!(lister.effective_limit(&ListQuery::default()), DEFAULT_LIMIT);
        assert_eq!(lister.effective_limit(&limit(0)), 1);
        assert_eq!(lister.effective_limit(&limit(10_000)), MAX_LIMIT);

        let page = lister.list(&limit(0));
        assert_eq!(page.entries.len(), 1);
    }

    #[test]
    fn test_configured_max_limit_capped() {
        let config = ListingConfig {
            default_limit: usize::MAX,
            max_limit: usize::MAX,
            dataset: None,
        };
        let lister = RecordLister::from_config(Rc::new(RemoteAccessor::unavailable()), &config);
        assert_eq!(lister.effective_limit(&limit(usize::MAX)), LIMIT_CEILING);
        assert_eq!(lister.effective_limit(&ListQuery::default()), LIMIT_CEILING);

        let remote = FlakyRemote::with_records(four_updates());
        let lister = RecordLister::from_config(remote_accessor(&remote), &config);
        let page = lister.list(&limit(usize::MAX));
        assert_eq!(page.entries.len(), 4);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_search_non_ascii_on_both_paths() {
        let records = vec![
            listed("1", "2025-02-01", "UI", "Été release", ""),
            listed("2", "2025-02-02", "UI", "Ete release", ""),
            listed("3", "2025-02-03", "UI", "Notes", "ÉTÉ COLUMNS"),
        ];
        let query = ListQuery {
            search: Some("été".to_string()),
            ..limit(10)
        };

        let page = offline_lister(records.clone()).list(&query);
        assert_eq!(ids(&page), vec!["3", "1"]);

        let remote = FlakyRemote::with_records(records);
        let page = remote_lister(&remote, vec![]).list(&query);
        assert_eq!(ids(&page), vec!["3", "1"]);
    }

    #[test]
    fn test_fallback_cursor_followed_remotely() {
        // Healthy but empty remote: only the first page falls back
        let remote = FlakyRemote::with_records(vec![]);
        let lister = remote_lister(&remote, four_updates());

        let first = lister.list(&limit(2));
        assert_eq!(ids(&first), vec!["u4", "u3"]);
        assert!(first.next_cursor.is_some());

        let second = lister.list(&ListQuery {
            cursor: first.next_cursor,
            ..limit(2)
        });
        assert!(second.entries.is_empty());
        assert_eq!(second.next_cursor, None);
    }

    #[test]
    fn test_query_json_shape() {
        let query: ListQuery =
            serde_json::from_str(r#"{"limit":5,"startDate":"2025-01-01","search":"csv"}"#).unwrap();
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.start_date.as_deref(), Some("2025-01-01"));

        let page = ListPage::default();
        assert_eq!(serde_json::to_string(&page).unwrap(), r#"{"entries":[],"nextCursor":null}"#);
    }
}
