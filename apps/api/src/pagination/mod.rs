//! Page-number pagination for list endpoints.
//!
//! Any [`PageSource`] can be paginated: `paginate` counts the collection,
//! fetches the slice for the requested page and attaches `next`/`previous`
//! locators built from the original request's query string.

pub mod extract;
pub mod links;
pub mod request;
pub mod source;

use serde::{Deserialize, Serialize};

pub use extract::Pagination;
pub use links::PageLinks;
pub use request::{PageRequest, PaginationConfig, PaginationError};
pub use source::PageSource;

/// Response body of every list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub count: u64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
    #[serde(skip)]
    pub page: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            count: self.count,
            next: self.next,
            previous: self.previous,
            results: self.results.into_iter().map(f).collect(),
            page: self.page,
        }
    }
}

/// Number of pages for `count` items. An empty collection still has one (empty) page.
pub fn page_count(count: u64, page_size: u64) -> u64 {
    count.div_ceil(page_size.max(1)).max(1)
}

pub async fn paginate<S>(
    source: &S,
    request: PageRequest,
    links: &PageLinks,
) -> Result<Page<S::Item>, S::Error>
where
    S: PageSource + ?Sized,
{
    let count = source.count().await?;
    let offset = request.offset();
    let limit = request.page_size();

    let mut results = if offset >= count {
        Vec::new()
    } else {
        source.slice(offset, limit).await?
    };
    results.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

    let page = request.page();
    let last_page = page_count(count, limit);

    Ok(Page {
        count,
        next: (page < last_page).then(|| links.for_page(page + 1)),
        previous: (page > 1).then(|| links.for_page(page - 1)),
        results,
        page,
    })
}
