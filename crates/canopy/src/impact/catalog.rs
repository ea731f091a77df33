//! Product tag lookups against the Shopify Admin GraphQL API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::domain::Shop;
use super::rules::ProductTags;

const PRODUCT_TAGS_QUERY: &str =
    "query ProductTags($ids: [ID!]!) { nodes(ids: $ids) { ... on Product { id tags } } }";
const PRODUCT_GID_PREFIX: &str = "gid://shopify/Product/";
/// Shopify caps `nodes(ids:)` at 250 ids per query.
const MAX_IDS_PER_QUERY: usize = 250;

/// Resolves product ids to their tag lists.
#[async_trait]
pub trait ProductTagResolver: Send + Sync {
    async fn product_tags(
        &self,
        shop: &Shop,
        product_ids: &[u64],
    ) -> Result<ProductTags, CatalogError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("shop {0} has no Admin API access token")]
    MissingAccessToken(String),
    #[error("catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("catalog responded with HTTP {0}")]
    Status(u16),
    #[error("catalog query failed: {0}")]
    Query(String),
}

pub fn product_gid(product_id: u64) -> String {
    format!("{PRODUCT_GID_PREFIX}{product_id}")
}

fn parse_product_gid(gid: &str) -> Option<u64> {
    gid.strip_prefix(PRODUCT_GID_PREFIX)?.parse().ok()
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<NodesData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct NodesData {
    #[serde(default)]
    nodes: Vec<Option<ProductNode>>,
}

#[derive(Debug, Deserialize)]
struct ProductNode {
    id: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

fn tags_from_response(response: GraphQlResponse) -> Result<ProductTags, CatalogError> {
    if !response.errors.is_empty() {
        let messages: Vec<String> = response
            .errors
            .into_iter()
            .map(|error| error.message)
            .collect();
        return Err(CatalogError::Query(messages.join("; ")));
    }

    let nodes = response.data.map(|data| data.nodes).unwrap_or_default();
    Ok(nodes
        .into_iter()
        .flatten()
        .filter_map(|node| {
            let id = node.id.as_deref().and_then(parse_product_gid)?;
            Some((id, node.tags))
        })
        .collect())
}

/// Admin API client authenticated with each shop's offline token.
#[derive(Debug, Clone)]
pub struct ShopifyCatalogClient {
    http: reqwest::Client,
    api_version: String,
}

impl ShopifyCatalogClient {
    pub fn new(api_version: impl Into<String>, timeout: Duration) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_version: api_version.into(),
        })
    }

    fn endpoint(&self, shop: &Shop) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            shop.domain, self.api_version
        )
    }

    async fn query_batch(
        &self,
        shop: &Shop,
        token: &str,
        product_ids: &[u64],
    ) -> Result<ProductTags, CatalogError> {
        let ids: Vec<String> = product_ids.iter().copied().map(product_gid).collect();
        let response = self
            .http
            .post(self.endpoint(shop))
            .header("X-Shopify-Access-Token", token)
            .json(&json!({
                "query": PRODUCT_TAGS_QUERY,
                "variables": { "ids": ids },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status().as_u16()));
        }

        let body: GraphQlResponse = response.json().await?;
        tags_from_response(body)
    }
}

#[async_trait]
impl ProductTagResolver for ShopifyCatalogClient {
    async fn product_tags(
        &self,
        shop: &Shop,
        product_ids: &[u64],
    ) -> Result<ProductTags, CatalogError> {
        if product_ids.is_empty() {
            return Ok(ProductTags::new());
        }

        let token = shop
            .access_token
            .as_deref()
            .ok_or_else(|| CatalogError::MissingAccessToken(shop.domain.clone()))?;

        let mut tags = ProductTags::new();
        for batch in product_ids.chunks(MAX_IDS_PER_QUERY) {
            tags.extend(self.query_batch(shop, token, batch).await?);
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_product_nodes_and_skips_unknown_ids() {
        let response: GraphQlResponse = serde_json::from_value(json!({
            "data": {
                "nodes": [
                    { "id": "gid://shopify/Product/101", "tags": ["Eco", "summer"] },
                    null,
                    { },
                    { "id": "gid://shopify/ProductVariant/7", "tags": ["eco"] }
                ]
            }
        }))
        .expect("valid response");

        let tags = tags_from_response(response).expect("tags parse");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[&101], vec!["Eco".to_string(), "summer".to_string()]);
    }

    #[test]
    fn graphql_errors_surface_as_query_failures() {
        let response: GraphQlResponse = serde_json::from_value(json!({
            "errors": [{ "message": "Throttled" }]
        }))
        .expect("valid response");

        match tags_from_response(response) {
            Err(CatalogError::Query(message)) => assert_eq!(message, "Throttled"),
            other => panic!("expected query error, got {other:?}"),
        }
    }

    #[test]
    fn gid_round_trips_numeric_ids() {
        assert_eq!(product_gid(42), "gid://shopify/Product/42");
        assert_eq!(parse_product_gid("gid://shopify/Product/42"), Some(42));
        assert_eq!(parse_product_gid("gid://shopify/Order/42"), None);
    }
}
