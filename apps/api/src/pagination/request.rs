use thiserror::Error;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("Invalid page '{0}': page must be a positive integer")]
    InvalidPage(String),

    #[error("Invalid query string: {0}")]
    InvalidQuery(String),
}

/// Server-side page size policy, plus the optional public origin used for locators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationConfig {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub public_base_url: Option<String>,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            public_base_url: None,
        }
    }
}

/// Parses a non-negative integer. Digit strings too large for `u64` become `u64::MAX`.
fn parse_saturating(raw: &str) -> Option<u64> {
    match raw.parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) => Some(u64::MAX),
        Err(_) => None,
    }
}

/// A validated page request. `page >= 1` and `1 <= page_size <= max_page_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    page_size: u64,
}

impl PageRequest {
    /// Builds a request from raw query values.
    ///
    /// A missing or empty `page` means page 1; anything that is not a positive
    /// integer is rejected. A bad `page_size` falls back to the default, and an
    /// oversized one is clamped to the maximum.
    pub fn from_params(
        page: Option<&str>,
        page_size: Option<&str>,
        config: &PaginationConfig,
    ) -> Result<Self, PaginationError> {
        let page = match page.map(str::trim) {
            None | Some("") => DEFAULT_PAGE,
            Some(raw) => match parse_saturating(raw) {
                Some(n) if n >= 1 => n,
                _ => return Err(PaginationError::InvalidPage(raw.to_string())),
            },
        };

        let page_size = page_size
            .and_then(|raw| parse_saturating(raw.trim()))
            .filter(|n| *n >= 1)
            .unwrap_or(config.default_page_size);

        Ok(Self::new(page, page_size, config))
    }

    /// `page` of 0 is treated as 1; `page_size` is clamped into `1..=max_page_size`.
    pub fn new(page: u64, page_size: u64, config: &PaginationConfig) -> Self {
        let max = config.max_page_size.max(1);
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, max),
        }
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}
