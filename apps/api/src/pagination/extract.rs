use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};

use super::links::PageLinks;
use super::request::{PageRequest, PaginationConfig};
use crate::errors::AppError;

/// Extracts `page`/`page_size` from the query string.
///
/// Handlers receive a validated [`PageRequest`] and the [`PageLinks`] needed to
/// build locators. Malformed page numbers are rejected with a 400.
#[derive(Debug, Clone)]
pub struct Pagination {
    pub request: PageRequest,
    pub links: PageLinks,
}

#[async_trait]
impl<S> FromRequestParts<S> for Pagination
where
    PaginationConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = PaginationConfig::from_ref(state);
        let links =
            PageLinks::from_uri(&parts.uri)?.with_base_url(config.public_base_url.as_deref());
        let request =
            PageRequest::from_params(links.param("page"), links.param("page_size"), &config)?;
        Ok(Self { request, links })
    }
}
