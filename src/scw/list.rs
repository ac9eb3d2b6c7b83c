//! List endpoints
//!
//! Scaleway list endpoints share one pagination contract: `page` / `page_size` query
//! parameters, a `total_count` field, and the items under a collection-specific key.

use super::client::ScopedApi;
use crate::error::Result;
use serde_json::Value;

/// Items requested per page
pub const PAGE_SIZE: u32 = 100;

/// Result of one page fetch
pub struct Page {
    pub items: Vec<Value>,
    pub total_count: Option<u64>,
}

/// Fetch one page of a collection
pub async fn fetch_page(
    api: &ScopedApi,
    path: &str,
    items_key: &str,
    filters: &[(&str, String)],
    page: u32,
) -> Result<Page> {
    let mut query: Vec<(&str, String)> = filters.to_vec();
    query.push(("page", page.to_string()));
    query.push(("page_size", PAGE_SIZE.to_string()));

    let response = api.get_query(path, &query).await?;

    let items = response
        .get(items_key)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let total_count = response.get("total_count").and_then(|v| v.as_u64());

    Ok(Page { items, total_count })
}

/// Fetch all items (auto-paginate)
pub async fn list_all(
    api: &ScopedApi,
    path: &str,
    items_key: &str,
    filters: &[(&str, String)],
) -> Result<Vec<Value>> {
    let mut all_items = Vec::new();
    let mut page = 1;

    loop {
        let result = fetch_page(api, path, items_key, filters, page).await?;
        let fetched = result.items.len();
        all_items.extend(result.items);

        let done = match result.total_count {
            Some(total) => all_items.len() as u64 >= total,
            None => fetched < PAGE_SIZE as usize,
        };
        if done || fetched == 0 {
            break;
        }
        page += 1;
    }

    tracing::debug!("listed {} items from {}", all_items.len(), api.url(path));
    Ok(all_items)
}
