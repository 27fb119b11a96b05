//! Query options shared by the listing endpoints.

use crate::request::{RequestOpt, with_query};
use std::fmt;

/// Sort direction of a [`Sort`] clause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `by:DIRECTION` sort clause. Without an explicit direction it sorts ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub by: String,
    pub direction: Option<SortDirection>,
}

impl Sort {
    #[must_use]
    pub fn new(by: impl Into<String>) -> Self {
        Self {
            by: by.into(),
            direction: None,
        }
    }

    #[must_use]
    pub fn asc(by: impl Into<String>) -> Self {
        Self::new(by).with_direction(SortDirection::Ascending)
    }

    #[must_use]
    pub fn desc(by: impl Into<String>) -> Self {
        Self::new(by).with_direction(SortDirection::Descending)
    }

    #[must_use]
    pub fn with_direction(mut self, direction: SortDirection) -> Self {
        self.direction = Some(direction);
        self
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.by, self.direction.unwrap_or_default())
    }
}

/// Ask for signed distribution URLs (`sign=true`).
#[must_use]
pub fn with_signed_urls() -> RequestOpt {
    with_query("sign", "true")
}

/// `limit` and `offset` query parameters.
#[must_use]
pub fn with_pagination(limit: usize, offset: usize) -> RequestOpt {
    let limit = with_query("limit", limit.to_string());
    let offset = with_query("offset", offset.to_string());
    RequestOpt::new(move |req| {
        limit.apply(req)?;
        offset.apply(req)
    })
}

/// `filter=key:value,key:value`. An empty list leaves the request untouched.
#[must_use]
pub fn with_filter<K, V>(filters: &[(K, V)]) -> RequestOpt
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let joined = filters
        .iter()
        .map(|(k, v)| format!("{}:{}", k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    set_unless_empty("filter", joined)
}

/// `sort=by:DIRECTION,...`. An empty list leaves the request untouched.
#[must_use]
pub fn with_sort(sorts: &[Sort]) -> RequestOpt {
    let joined = sorts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    set_unless_empty("sort", joined)
}

fn set_unless_empty(key: &'static str, value: String) -> RequestOpt {
    if value.is_empty() {
        return RequestOpt::new(|_| Ok(()));
    }
    with_query(key, value)
}
