//! Bounded parallel sub-fetches.

use std::future::Future;

use futures::stream::{self, StreamExt};

use crate::error::ConnectorError;

/// Workers used when a connector does not configure its own width.
pub const DEFAULT_WIDTH: usize = 5;

/// Runs `fetch` over `inputs` with at most `width` requests in flight.
///
/// Every sub-fetch runs to completion before failures are inspected, so one
/// failing lookup never cancels its siblings. `Ok(None)` results (optional
/// resources that were unavailable) are dropped; the first error in input
/// order is returned. Successful results keep input order.
pub async fn fetch_all<I, T, F, Fut>(
    inputs: impl IntoIterator<Item = I>,
    width: usize,
    fetch: F,
) -> Result<Vec<T>, ConnectorError>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Option<T>, ConnectorError>>,
{
    let results = stream::iter(inputs.into_iter().map(fetch))
        .buffered(width.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut fetched = Vec::with_capacity(results.len());
    for result in results {
        if let Some(value) = result? {
            fetched.push(value);
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn keeps_input_order_and_skips_missing() {
        let results = fetch_all(1..=6, 3, |n| async move {
            if n == 4 {
                Ok(None)
            } else {
                Ok(Some(n * 10))
            }
        })
        .await
        .expect("all fetched");

        assert_eq!(results, vec![10, 20, 30, 50, 60]);
    }

    #[tokio::test]
    async fn failure_does_not_cancel_siblings() {
        let completed = AtomicUsize::new(0);

        let error = fetch_all(0..5, 2, |n| {
            let completed = &completed;
            async move {
                completed.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    Err(ConnectorError::fatal(ErrorContext::endpoint("/detail/1"), "gone"))
                } else {
                    Ok(Some(n))
                }
            }
        })
        .await
        .expect_err("required failure propagates");

        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert_eq!(error.code(), "connector.fatal");
    }
}
