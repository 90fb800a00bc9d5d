use axum::extract::Query;
use axum::http::Uri;

use super::request::PaginationError;

const PAGE_PARAM: &str = "page";

/// Builds `next`/`previous` locators from the request that produced a page.
///
/// Every query parameter is carried over in its original order; only `page`
/// is rewritten (or appended when the request had none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLinks {
    base_url: Option<String>,
    path: String,
    params: Vec<(String, String)>,
}

impl PageLinks {
    pub fn new(path: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            base_url: None,
            path: path.into(),
            params,
        }
    }

    pub fn from_uri(uri: &Uri) -> Result<Self, PaginationError> {
        let Query(params) = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map_err(|e| PaginationError::InvalidQuery(e.body_text()))?;
        Ok(Self::new(uri.path(), params))
    }

    pub fn with_base_url(mut self, base_url: Option<&str>) -> Self {
        self.base_url = base_url.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// First value of a query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn for_page(&self, page: u64) -> String {
        let page = page.to_string();
        let mut replaced = false;
        let mut pairs = Vec::with_capacity(self.params.len() + 1);

        for (key, value) in &self.params {
            if key == PAGE_PARAM {
                if replaced {
                    continue;
                }
                replaced = true;
                pairs.push(encode_pair(key, &page));
            } else {
                pairs.push(encode_pair(key, value));
            }
        }
        if !replaced {
            pairs.push(encode_pair(PAGE_PARAM, &page));
        }

        format!(
            "{}{}?{}",
            self.base_url.as_deref().unwrap_or(""),
            self.path,
            pairs.join("&")
        )
    }
}

fn encode_pair(key: &str, value: &str) -> String {
    format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(uri: &str) -> PageLinks {
        PageLinks::from_uri(&uri.parse::<Uri>().unwrap()).unwrap()
    }

    #[test]
    fn test_rewrites_only_page() {
        let l = links("/api/v1/questionnaires?industry=Tech&page=2&page_size=5");
        assert_eq!(
            l.for_page(3),
            "/api/v1/questionnaires?industry=Tech&page=3&page_size=5"
        );
    }

    #[test]
    fn test_appends_page_when_missing() {
        let l = links("/api/v1/ai-responses?user_id=abc");
        assert_eq!(l.for_page(2), "/api/v1/ai-responses?user_id=abc&page=2");
    }

    #[test]
    fn test_no_query_at_all() {
        let l = links("/api/v1/tasks/failed");
        assert_eq!(l.for_page(2), "/api/v1/tasks/failed?page=2");
    }

    #[test]
    fn test_duplicate_page_params_collapse() {
        let l = links("/x?page=1&sort=asc&page=9");
        assert_eq!(l.for_page(2), "/x?page=2&sort=asc");
    }

    #[test]
    fn test_values_are_reencoded() {
        let l = links("/x?industry=Financial%20Services&q=a%26b");
        assert_eq!(l.for_page(2), "/x?industry=Financial%20Services&q=a%26b&page=2");
    }

    #[test]
    fn test_absolute_with_base_url() {
        let l = links("/x?page=1").with_base_url(Some("https://api.example.com/"));
        assert_eq!(l.for_page(2), "https://api.example.com/x?page=2");
    }

    #[test]
    fn test_param_lookup() {
        let l = links("/x?page=4&page_size=20");
        assert_eq!(l.param("page"), Some("4"));
        assert_eq!(l.param("page_size"), Some("20"));
        assert_eq!(l.param("missing"), None);
    }
}
