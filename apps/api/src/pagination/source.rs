use std::convert::Infallible;

use async_trait::async_trait;

/// An ordered, countable collection that can hand out contiguous slices.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;
    type Error: Send;

    async fn count(&self) -> Result<u64, Self::Error>;

    /// At most `limit` items starting at `offset`, in collection order.
    async fn slice(&self, offset: u64, limit: u64) -> Result<Vec<Self::Item>, Self::Error>;
}

#[async_trait]
impl<T> PageSource for Vec<T>
where
    T: Clone + Send + Sync,
{
    type Item = T;
    type Error = Infallible;

    async fn count(&self) -> Result<u64, Infallible> {
        Ok(self.len() as u64)
    }

    async fn slice(&self, offset: u64, limit: u64) -> Result<Vec<T>, Infallible> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len());
        let end = start
            .saturating_add(usize::try_from(limit).unwrap_or(usize::MAX))
            .min(self.len());
        Ok(self[start..end].to_vec())
    }
}

/// Converts a `u64` offset or limit into the `i64` SQL expects.
pub fn sql_bound(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts a SQL `COUNT(*)` into a page count.
pub fn sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
