use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::error::{Result, SyncError};
use crate::query::Query;

/// Search arguments as received from a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
}

impl SearchParams {
    pub fn query(q: impl Into<String>) -> Self {
        Self {
            q: Some(q.into()),
            ..Default::default()
        }
    }

    pub fn with_page(mut self, page: usize, size: usize) -> Self {
        self.page = Some(page);
        self.size = Some(size);
        self
    }

    /// Check bounds and turn into an index request
    pub fn resolve(&self, config: &SearchConfig) -> Result<Pagination> {
        let page = self.page.unwrap_or(1);
        let size = self.size.unwrap_or(config.default_size);

        if page < 1 {
            return Err(SyncError::validation("page must be at least 1"));
        }
        if size < 1 || size > config.max_results {
            return Err(SyncError::validation(format!(
                "size must be between 1 and {}",
                config.max_results
            )));
        }
        if page.saturating_mul(size) > config.max_results {
            return Err(SyncError::validation(format!(
                "Maximum number of results have been reached ({})",
                config.max_results
            )));
        }

        let query = match self.q.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => Query::query_string(q),
            _ => Query::MatchAll,
        };

        Ok(Pagination {
            query,
            page,
            size,
            from: (page - 1) * size,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pagination {
    pub query: Query,
    pub page: usize,
    pub size: usize,
    pub from: usize,
}
