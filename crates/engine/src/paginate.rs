//! Cursor driven iteration over paged remote results.

use std::collections::VecDeque;

use async_trait::async_trait;
use quarry_types::Row;
use tracing::debug;

use crate::error::EngineResult;

/// Opaque continuation token handed back unchanged on the next call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One response: its rows and the cursor for the next page, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Row>,
    pub next_cursor: Option<Cursor>,
}

impl Page {
    pub fn last(rows: Vec<Row>) -> Self {
        Self { rows, next_cursor: None }
    }

    pub fn with_cursor(rows: Vec<Row>, cursor: impl Into<String>) -> Self {
        Self {
            rows,
            next_cursor: Some(Cursor::new(cursor)),
        }
    }
}

/// Something that can fetch the page following `cursor` (the first page when `None`).
#[async_trait]
pub trait PageSource: Send {
    async fn fetch_next(&mut self, cursor: Option<&Cursor>) -> EngineResult<Page>;
}

/// Lazily produced batches of rows.
#[async_trait]
pub trait RowBatches: Send {
    /// Next non-terminal batch, or `None` when the stream is finished.
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>>;
}

/// Walks a [`PageSource`] until the cursor runs out or `limit` records were yielded.
///
/// A paginator is single use: after it returns `None` (or an error) it keeps
/// returning `None`.
pub struct Paginator<S> {
    source: S,
    limit: Option<usize>,
    first_page_only: bool,
    cursor: Option<Cursor>,
    started: bool,
    exhausted: bool,
    yielded: usize,
    pages: usize,
}

impl<S: PageSource> Paginator<S> {
    pub fn new(source: S, limit: Option<usize>) -> Self {
        Self {
            source,
            limit,
            first_page_only: false,
            cursor: None,
            started: false,
            exhausted: false,
            yielded: 0,
            pages: 0,
        }
    }

    /// Stop after the first page even if the response carries a cursor.
    pub fn first_page_only(mut self) -> Self {
        self.first_page_only = true;
        self
    }

    pub fn rows_yielded(&self) -> usize {
        self.yielded
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub async fn next_page(&mut self) -> EngineResult<Option<Vec<Row>>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.started && self.cursor.is_none() {
            self.exhausted = true;
            return Ok(None);
        }
        if self.limit.is_some_and(|limit| self.yielded >= limit) {
            self.exhausted = true;
            return Ok(None);
        }

        let page = match self.source.fetch_next(self.cursor.as_ref()).await {
            Ok(page) => page,
            Err(error) => {
                self.exhausted = true;
                return Err(error);
            }
        };
        self.started = true;
        self.pages += 1;
        self.cursor = if self.first_page_only { None } else { page.next_cursor };

        let mut rows = page.rows;
        if let Some(limit) = self.limit {
            rows.truncate(limit.saturating_sub(self.yielded));
        }
        self.yielded += rows.len();
        debug!(
            page = self.pages,
            rows = rows.len(),
            has_next = self.cursor.is_some(),
            "fetched page"
        );
        Ok(Some(rows))
    }
}

#[async_trait]
impl<S: PageSource> RowBatches for Paginator<S> {
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>> {
        self.next_page().await
    }
}

/// Rows already in memory, handed out in fixed-size batches.
pub struct VecBatches {
    rows: VecDeque<Row>,
    batch_size: usize,
}

impl VecBatches {
    pub const DEFAULT_BATCH_SIZE: usize = 10_000;

    pub fn new(rows: Vec<Row>) -> Self {
        Self::with_batch_size(rows, Self::DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(rows: Vec<Row>, batch_size: usize) -> Self {
        Self {
            rows: rows.into(),
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl RowBatches for VecBatches {
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        let take = self.batch_size.min(self.rows.len());
        Ok(Some(self.rows.drain(..take).collect()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{error::EngineError, warehouse::WarehouseError};

    struct ScriptedPages {
        pages: Vec<Page>,
        seen: Vec<Option<Cursor>>,
        fail_at: Option<usize>,
    }

    impl ScriptedPages {
        fn new(pages: Vec<Page>) -> Self {
            Self {
                pages,
                seen: Vec::new(),
                fail_at: None,
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedPages {
        async fn fetch_next(&mut self, cursor: Option<&Cursor>) -> EngineResult<Page> {
            let index = self.seen.len();
            self.seen.push(cursor.cloned());
            if self.fail_at == Some(index) {
                return Err(EngineError::Warehouse(WarehouseError::Backend("boom".into())));
            }
            Ok(self.pages[index].clone())
        }
    }

    fn rows(ids: &[i64]) -> Vec<Row> {
        ids.iter()
            .map(|id| match json!({"id": id}) {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect()
    }

    fn three_pages() -> Vec<Page> {
        vec![
            Page::with_cursor(rows(&[1, 2]), "a"),
            Page::with_cursor(rows(&[3, 4]), "b"),
            Page::last(rows(&[5])),
        ]
    }

    async fn drain<S: PageSource>(paginator: &mut Paginator<S>) -> Vec<Row> {
        let mut all = Vec::new();
        while let Some(batch) = paginator.next_page().await.expect("page") {
            all.extend(batch);
        }
        all
    }

    #[tokio::test]
    async fn yields_all_pages_once_in_order() {
        let mut paginator = Paginator::new(ScriptedPages::new(three_pages()), None);
        let all = drain(&mut paginator).await;
        assert_eq!(all, rows(&[1, 2, 3, 4, 5]));
        assert_eq!(paginator.pages_fetched(), 3);
        assert!(paginator.next_page().await.expect("exhausted").is_none());
        assert_eq!(paginator.into_source().seen, vec![None, Some(Cursor::new("a")), Some(Cursor::new("b"))]);
    }

    #[tokio::test]
    async fn limit_truncates_last_page_and_stops_fetching() {
        let mut paginator = Paginator::new(ScriptedPages::new(three_pages()), Some(3));
        let all = drain(&mut paginator).await;
        assert_eq!(all, rows(&[1, 2, 3]));
        assert_eq!(paginator.into_source().seen.len(), 2);
    }

    #[tokio::test]
    async fn first_page_only_ignores_cursor() {
        let mut paginator = Paginator::new(ScriptedPages::new(three_pages()), None).first_page_only();
        assert_eq!(drain(&mut paginator).await, rows(&[1, 2]));
    }

    #[tokio::test]
    async fn failure_ends_iteration() {
        let mut source = ScriptedPages::new(three_pages());
        source.fail_at = Some(1);
        let mut paginator = Paginator::new(source, None);
        assert!(paginator.next_page().await.expect("first page").is_some());
        assert!(paginator.next_page().await.is_err());
        assert!(paginator.next_page().await.expect("exhausted").is_none());
    }

    #[tokio::test]
    async fn vec_batches_split_rows() {
        let mut batches = VecBatches::with_batch_size(rows(&[1, 2, 3]), 2);
        assert_eq!(batches.next_batch().await.expect("batch"), Some(rows(&[1, 2])));
        assert_eq!(batches.next_batch().await.expect("batch"), Some(rows(&[3])));
        assert_eq!(batches.next_batch().await.expect("batch"), None);
    }
}
