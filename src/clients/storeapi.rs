//! Store admin GraphQL client.
//!
//! Every call goes through `graphql_with_retry`: per-call timeout, failure
//! classification (including throttle messages reported inside a 200
//! response), cost-based pacing from the response's throttle telemetry, and
//! the shared retry loop.
//!
//! SEO writes go through `metafieldsSet` rather than the native `seo` field
//! so an update never clobbers the side it does not touch; the backfill rule
//! copies a live native value into an empty counterpart metafield when only
//! one side is being written.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::classify::ClientError;
use crate::config::StoreApiEnv;
use crate::retry::{RetryObserver, RetryPolicy, run_with_retry, with_timeout};

use super::{gid, retry_after_from_headers};

const ACCESS_TOKEN_HEADER: &str = "X-Store-Access-Token";
const SEO_NAMESPACE: &str = "global";
const TITLE_TAG_KEY: &str = "title_tag";
const DESCRIPTION_TAG_KEY: &str = "description_tag";
const METAFIELD_TYPE: &str = "single_line_text_field";

/// Which SEO fields a job is configured to write.
#[derive(Debug, Clone, Copy)]
pub struct FieldToggles {
    pub meta_title: bool,
    pub meta_description: bool,
}

/// Live SEO state of a product or article: the metafield pair the storefront
/// reads first, plus the native `seo{…}` values (articles have none).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSeo {
    pub native_title: Option<String>,
    pub native_description: Option<String>,
    pub metafield_title: Option<String>,
    pub metafield_description: Option<String>,
}

impl LiveSeo {
    /// The value the storefront effectively shows for the title.
    pub fn effective_title(&self) -> Option<&str> {
        non_empty(self.metafield_title.as_deref()).or_else(|| non_empty(self.native_title.as_deref()))
    }

    pub fn effective_description(&self) -> Option<&str> {
        non_empty(self.metafield_description.as_deref())
            .or_else(|| non_empty(self.native_description.as_deref()))
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct ProductInfo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub seo: LiveSeo,
}

#[derive(Debug, Clone)]
pub struct ArticleInfo {
    pub id: String,
    pub title: String,
    pub body: String,
    pub seo: LiveSeo,
}

/// One product image, as discovered for `ImageAlt` job expansion.
#[derive(Debug, Clone)]
pub struct ImageTarget {
    pub media_id: String,
    pub url: Option<String>,
    pub alt: Option<String>,
    pub product_title: String,
}

#[derive(Clone)]
pub struct StoreApiClient {
    http: Client,
    config: StoreApiEnv,
}

impl StoreApiClient {
    pub fn new(config: StoreApiEnv) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build store api http client");
        Self { http, config }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_attempts,
            backoff_base: self.config.backoff_base,
        }
    }

    /// POST one GraphQL operation with retries and cost pacing; returns the
    /// `data` object.
    async fn graphql_with_retry(
        &self,
        query: &'static str,
        variables: Value,
        observer: &dyn RetryObserver,
    ) -> Result<Value, ClientError> {
        run_with_retry(self.policy(), observer, "store api", |attempt| {
            debug!(attempt, "calling store api");
            self.call_once(query, &variables, observer)
        })
        .await
    }

    async fn call_once(
        &self,
        query: &str,
        variables: &Value,
        observer: &dyn RetryObserver,
    ) -> Result<Value, ClientError> {
        let request = async {
            let response = self
                .http
                .post(&self.config.endpoint)
                .header(ACCESS_TOKEN_HEADER, &self.config.access_token)
                .json(&json!({ "query": query, "variables": variables }))
                .send()
                .await
                .map_err(ClientError::from_reqwest)?;

            let status = response.status();
            let retry_after = retry_after_from_headers(response.headers());
            let text = response.text().await.map_err(ClientError::from_reqwest)?;

            if !status.is_success() {
                return Err(ClientError::Http {
                    status: status.as_u16(),
                    message: text,
                    retry_after,
                });
            }

            serde_json::from_str::<Value>(&text)
                .map_err(|e| ClientError::BadJson(format!("graphql response: {e}")))
        };
        let body = with_timeout(request, self.config.timeout, "store api").await?;

        // GraphQL-layer errors can carry a throttle signal even on HTTP 200;
        // the classifier decides based on the joined messages.
        if let Some(errors) = body.get("errors").and_then(Value::as_array)
            && !errors.is_empty()
        {
            let joined = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ClientError::Api(if joined.is_empty() {
                "graphql error".to_string()
            } else {
                joined
            }));
        }

        self.pace_for_cost(&body, observer).await;

        body.get("data")
            .cloned()
            .ok_or_else(|| ClientError::BadJson("graphql response without data".to_string()))
    }

    /// Synchronous cost pacing: when the remaining query budget drops under
    /// the floor, sleep long enough for the restore rate to refill it.
    async fn pace_for_cost(&self, body: &Value, observer: &dyn RetryObserver) {
        let Some(throttle) = body.pointer("/extensions/cost/throttleStatus") else {
            return;
        };
        let available = throttle
            .get("currentlyAvailable")
            .and_then(Value::as_f64)
            .unwrap_or(f64::MAX);
        let restore_rate = throttle.get("restoreRate").and_then(Value::as_f64).unwrap_or(0.0);

        let floor = self.config.throttle_min_available as f64;
        if available >= floor || restore_rate <= 0.0 {
            return;
        }
        let wait_secs = ((floor - available) / restore_rate).ceil();
        let wait = Duration::from_secs_f64(wait_secs.max(0.0)).min(self.config.throttle_max_wait);
        if wait.is_zero() {
            return;
        }
        warn!(
            available,
            restore_rate,
            wait_ms = wait.as_millis() as u64,
            "store api cost budget low, pacing"
        );
        observer.on_throttle(wait).await;
        sleep(wait).await;
    }

    // --- reads ---

    #[instrument(skip(self, observer))]
    pub async fn fetch_product(
        &self,
        id: &str,
        observer: &dyn RetryObserver,
    ) -> Result<ProductInfo, ClientError> {
        let gid = gid::normalize("Product", id);
        let data = self
            .graphql_with_retry(PRODUCT_QUERY, json!({ "id": gid }), observer)
            .await?;
        let product = data
            .get("product")
            .filter(|p| !p.is_null())
            .ok_or_else(|| ClientError::Api(format!("Product not found: {gid}")))?;
        Ok(ProductInfo {
            id: str_at(product, "/id").unwrap_or(gid),
            title: str_at(product, "/title").unwrap_or_default(),
            description: str_at(product, "/descriptionHtml").unwrap_or_default(),
            seo: live_seo_of(product),
        })
    }

    #[instrument(skip(self, observer))]
    pub async fn fetch_article(
        &self,
        id: &str,
        observer: &dyn RetryObserver,
    ) -> Result<ArticleInfo, ClientError> {
        let gid = gid::normalize("Article", id);
        let data = self
            .graphql_with_retry(ARTICLE_QUERY, json!({ "id": gid }), observer)
            .await?;
        let article = data
            .get("article")
            .filter(|a| !a.is_null())
            .ok_or_else(|| ClientError::Api(format!("Article not found: {gid}")))?;
        Ok(ArticleInfo {
            id: str_at(article, "/id").unwrap_or(gid),
            title: str_at(article, "/title").unwrap_or_default(),
            body: str_at(article, "/body").unwrap_or_default(),
            seo: live_seo_of(article),
        })
    }

    /// All images of a product, for `ImageAlt` job expansion.
    #[instrument(skip(self, observer))]
    pub async fn fetch_images(
        &self,
        product_id: &str,
        observer: &dyn RetryObserver,
    ) -> Result<Vec<ImageTarget>, ClientError> {
        let gid = gid::normalize("Product", product_id);
        let data = self
            .graphql_with_retry(PRODUCT_MEDIA_QUERY, json!({ "id": gid }), observer)
            .await?;
        let product = data
            .get("product")
            .filter(|p| !p.is_null())
            .ok_or_else(|| ClientError::Api(format!("Product not found: {gid}")))?;
        let product_title = str_at(product, "/title").unwrap_or_default();

        let mut targets = Vec::new();
        if let Some(nodes) = product.pointer("/media/nodes").and_then(Value::as_array) {
            for node in nodes {
                let Some(media_id) = str_at(node, "/id") else {
                    continue;
                };
                targets.push(ImageTarget {
                    media_id,
                    url: str_at(node, "/image/url"),
                    alt: str_at(node, "/alt"),
                    product_title: product_title.clone(),
                });
            }
        }
        Ok(targets)
    }

    /// Live SEO state for many products at once, keyed by GID.
    pub async fn fetch_product_seo_batch(
        &self,
        ids: &[String],
        observer: &dyn RetryObserver,
    ) -> Result<HashMap<String, LiveSeo>, ClientError> {
        self.fetch_seo_batch(PRODUCT_SEO_BATCH_QUERY, "Product", ids, observer).await
    }

    /// Live SEO state for many articles at once, keyed by GID.
    pub async fn fetch_article_seo_batch(
        &self,
        ids: &[String],
        observer: &dyn RetryObserver,
    ) -> Result<HashMap<String, LiveSeo>, ClientError> {
        self.fetch_seo_batch(ARTICLE_SEO_BATCH_QUERY, "Article", ids, observer).await
    }

    async fn fetch_seo_batch(
        &self,
        query: &'static str,
        kind: &str,
        ids: &[String],
        observer: &dyn RetryObserver,
    ) -> Result<HashMap<String, LiveSeo>, ClientError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let gids: Vec<String> = ids.iter().map(|id| gid::normalize(kind, id)).collect();
        let data = self
            .graphql_with_retry(query, json!({ "ids": gids }), observer)
            .await?;

        let mut map = HashMap::new();
        if let Some(nodes) = data.get("nodes").and_then(Value::as_array) {
            for node in nodes.iter().filter(|n| !n.is_null()) {
                if let Some(id) = str_at(node, "/id") {
                    map.insert(id, live_seo_of(node));
                }
            }
        }
        Ok(map)
    }

    // --- writes ---

    /// Write product SEO via `metafieldsSet`.
    #[instrument(skip(self, observer, title, description))]
    pub async fn write_product_seo(
        &self,
        product_id: &str,
        title: Option<&str>,
        description: Option<&str>,
        toggles: FieldToggles,
        observer: &dyn RetryObserver,
    ) -> Result<(), ClientError> {
        let owner_id = gid::normalize("Product", product_id);
        let current = self.fetch_product(&owner_id, observer).await?.seo;
        let staged = stage_seo_fields(title, description, toggles, &current);
        if staged.is_empty() {
            debug!(%owner_id, "nothing to write");
            return Ok(());
        }
        self.metafields_set(&owner_id, &staged, observer).await
    }

    /// Write article SEO via `metafieldsSet`. The owner id first uses the
    /// `Article` GID form; on an "Invalid id" user error the alternate form
    /// is tried once, but only after a `node(id:)` preflight confirms it.
    #[instrument(skip(self, observer, title, description))]
    pub async fn write_article_seo(
        &self,
        article_id: &str,
        title: Option<&str>,
        description: Option<&str>,
        toggles: FieldToggles,
        observer: &dyn RetryObserver,
    ) -> Result<(), ClientError> {
        let owner_id = gid::normalize("Article", article_id);
        let current = self.fetch_article(&owner_id, observer).await?.seo;
        let staged = stage_seo_fields(title, description, toggles, &current);
        if staged.is_empty() {
            debug!(%owner_id, "nothing to write");
            return Ok(());
        }

        match self.metafields_set(&owner_id, &staged, observer).await {
            Err(ClientError::Api(message)) if message.to_lowercase().contains("invalid id") => {
                let Some(resolved) = self.preflight_article_id(&owner_id, observer).await? else {
                    return Err(ClientError::Api(message));
                };
                warn!(%owner_id, %resolved, "article id rejected, retrying with preflighted id");
                self.metafields_set(&resolved, &staged, observer).await
            }
            other => other,
        }
    }

    /// Resolve the alternate article GID form via `node(id:)`; returns the id
    /// the API acknowledges, if any.
    async fn preflight_article_id(
        &self,
        owner_id: &str,
        observer: &dyn RetryObserver,
    ) -> Result<Option<String>, ClientError> {
        let Some(number) = gid::numeric_part(owner_id) else {
            return Ok(None);
        };
        let alternate = format!("gid://store/OnlineStoreArticle/{number}");
        let data = self
            .graphql_with_retry(NODE_QUERY, json!({ "id": alternate }), observer)
            .await?;
        Ok(data.pointer("/node/id").and_then(Value::as_str).map(str::to_string))
    }

    /// Write alt text for one product image.
    #[instrument(skip(self, observer, alt))]
    pub async fn write_image_alt(
        &self,
        product_id: &str,
        media_id: &str,
        alt: &str,
        observer: &dyn RetryObserver,
    ) -> Result<(), ClientError> {
        let data = self
            .graphql_with_retry(
                UPDATE_MEDIA_MUTATION,
                json!({
                    "productId": gid::normalize("Product", product_id),
                    "media": [{ "id": media_id, "alt": alt }],
                }),
                observer,
            )
            .await?;
        check_user_errors(&data, "/productUpdateMedia/mediaUserErrors")
    }

    async fn metafields_set(
        &self,
        owner_id: &str,
        staged: &[(&'static str, String)],
        observer: &dyn RetryObserver,
    ) -> Result<(), ClientError> {
        let metafields: Vec<Value> = staged
            .iter()
            .map(|(key, value)| {
                json!({
                    "ownerId": owner_id,
                    "namespace": SEO_NAMESPACE,
                    "key": key,
                    "type": METAFIELD_TYPE,
                    "value": value,
                })
            })
            .collect();
        let data = self
            .graphql_with_retry(METAFIELDS_SET_MUTATION, json!({ "metafields": metafields }), observer)
            .await?;
        check_user_errors(&data, "/metafieldsSet/userErrors")
    }
}

/// Decide which metafields to write.
///
/// Empty-after-trim values are never written (an empty metafield would clear
/// an existing value). When only one side is written and the job is
/// configured to produce the other, an empty counterpart metafield is
/// backfilled from the live native value so the untouched side stays visible
/// once the storefront reads metafields first.
fn stage_seo_fields(
    title: Option<&str>,
    description: Option<&str>,
    toggles: FieldToggles,
    current: &LiveSeo,
) -> Vec<(&'static str, String)> {
    let mut staged = Vec::new();

    let title = non_empty(title).filter(|_| toggles.meta_title);
    let description = non_empty(description).filter(|_| toggles.meta_description);

    if let Some(title) = title {
        staged.push((TITLE_TAG_KEY, title.to_string()));
    }
    if let Some(description) = description {
        staged.push((DESCRIPTION_TAG_KEY, description.to_string()));
    }

    if title.is_some() && description.is_none() && toggles.meta_description
        && non_empty(current.metafield_description.as_deref()).is_none()
        && let Some(native) = non_empty(current.native_description.as_deref())
    {
        staged.push((DESCRIPTION_TAG_KEY, native.to_string()));
    }
    if description.is_some() && title.is_none() && toggles.meta_title
        && non_empty(current.metafield_title.as_deref()).is_none()
        && let Some(native) = non_empty(current.native_title.as_deref())
    {
        staged.push((TITLE_TAG_KEY, native.to_string()));
    }

    staged
}

fn check_user_errors(data: &Value, pointer: &str) -> Result<(), ClientError> {
    if let Some(errors) = data.pointer(pointer).and_then(Value::as_array)
        && !errors.is_empty()
    {
        let joined = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ClientError::Api(if joined.is_empty() {
            "mutation rejected".to_string()
        } else {
            joined
        }));
    }
    Ok(())
}

fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

fn live_seo_of(node: &Value) -> LiveSeo {
    LiveSeo {
        native_title: str_at(node, "/seo/title"),
        native_description: str_at(node, "/seo/description"),
        metafield_title: str_at(node, "/titleTag/value"),
        metafield_description: str_at(node, "/descriptionTag/value"),
    }
}

const PRODUCT_QUERY: &str = r#"
query Product($id: ID!) {
  product(id: $id) {
    id
    title
    descriptionHtml
    seo { title description }
    titleTag: metafield(namespace: "global", key: "title_tag") { value }
    descriptionTag: metafield(namespace: "global", key: "description_tag") { value }
  }
}
"#;

const ARTICLE_QUERY: &str = r#"
query Article($id: ID!) {
  article(id: $id) {
    id
    title
    body
    titleTag: metafield(namespace: "global", key: "title_tag") { value }
    descriptionTag: metafield(namespace: "global", key: "description_tag") { value }
  }
}
"#;

const PRODUCT_MEDIA_QUERY: &str = r#"
query ProductMedia($id: ID!) {
  product(id: $id) {
    id
    title
    media(first: 250) {
      nodes {
        ... on MediaImage {
          id
          alt
          image { url }
        }
      }
    }
  }
}
"#;

const PRODUCT_SEO_BATCH_QUERY: &str = r#"
query ProductSeoBatch($ids: [ID!]!) {
  nodes(ids: $ids) {
    ... on Product {
      id
      seo { title description }
      titleTag: metafield(namespace: "global", key: "title_tag") { value }
      descriptionTag: metafield(namespace: "global", key: "description_tag") { value }
    }
  }
}
"#;

const ARTICLE_SEO_BATCH_QUERY: &str = r#"
query ArticleSeoBatch($ids: [ID!]!) {
  nodes(ids: $ids) {
    ... on Article {
      id
      titleTag: metafield(namespace: "global", key: "title_tag") { value }
      descriptionTag: metafield(namespace: "global", key: "description_tag") { value }
    }
  }
}
"#;

const NODE_QUERY: &str = r#"
query Probe($id: ID!) {
  node(id: $id) { id }
}
"#;

const METAFIELDS_SET_MUTATION: &str = r#"
mutation SetSeoMetafields($metafields: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $metafields) {
    metafields { id }
    userErrors { field message }
  }
}
"#;

const UPDATE_MEDIA_MUTATION: &str = r#"
mutation UpdateMediaAlt($productId: ID!, $media: [UpdateMediaInput!]!) {
  productUpdateMedia(productId: $productId, media: $media) {
    media { id }
    mediaUserErrors { field message }
  }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn live(
        native_title: Option<&str>,
        native_description: Option<&str>,
        metafield_title: Option<&str>,
        metafield_description: Option<&str>,
    ) -> LiveSeo {
        LiveSeo {
            native_title: native_title.map(str::to_string),
            native_description: native_description.map(str::to_string),
            metafield_title: metafield_title.map(str::to_string),
            metafield_description: metafield_description.map(str::to_string),
        }
    }

    const BOTH: FieldToggles = FieldToggles { meta_title: true, meta_description: true };

    #[test]
    fn stages_both_configured_fields() {
        let staged = stage_seo_fields(Some("T"), Some("D"), BOTH, &LiveSeo::default());
        assert_eq!(
            staged,
            vec![
                (TITLE_TAG_KEY, "T".to_string()),
                (DESCRIPTION_TAG_KEY, "D".to_string())
            ]
        );
    }

    #[test]
    fn empty_values_are_never_written() {
        let staged = stage_seo_fields(Some("  "), Some(""), BOTH, &LiveSeo::default());
        assert!(staged.is_empty());
    }

    #[test]
    fn unconfigured_fields_are_dropped() {
        let toggles = FieldToggles { meta_title: true, meta_description: false };
        let staged = stage_seo_fields(Some("T"), Some("D"), toggles, &LiveSeo::default());
        assert_eq!(staged, vec![(TITLE_TAG_KEY, "T".to_string())]);
    }

    #[test]
    fn backfills_missing_counterpart_from_native_seo() {
        // Writing only a title while a native description is live and its
        // metafield is empty: the description is carried over.
        let current = live(Some("Old title"), Some("Native description"), None, None);
        let staged = stage_seo_fields(Some("T"), None, BOTH, &current);
        assert_eq!(
            staged,
            vec![
                (TITLE_TAG_KEY, "T".to_string()),
                (DESCRIPTION_TAG_KEY, "Native description".to_string())
            ]
        );
    }

    #[test]
    fn no_backfill_when_metafield_already_set() {
        let current = live(None, Some("Native"), None, Some("Existing metafield"));
        let staged = stage_seo_fields(Some("T"), None, BOTH, &current);
        assert_eq!(staged, vec![(TITLE_TAG_KEY, "T".to_string())]);
    }

    #[test]
    fn no_backfill_when_other_side_not_configured() {
        let toggles = FieldToggles { meta_title: true, meta_description: false };
        let current = live(None, Some("Native"), None, None);
        let staged = stage_seo_fields(Some("T"), None, toggles, &current);
        assert_eq!(staged, vec![(TITLE_TAG_KEY, "T".to_string())]);
    }

    #[test]
    fn backfill_works_for_the_title_side_too() {
        let current = live(Some("Native title"), None, None, None);
        let staged = stage_seo_fields(None, Some("D"), BOTH, &current);
        assert_eq!(
            staged,
            vec![
                (DESCRIPTION_TAG_KEY, "D".to_string()),
                (TITLE_TAG_KEY, "Native title".to_string())
            ]
        );
    }

    #[test]
    fn effective_values_prefer_metafields() {
        let seo = live(Some("Native"), None, Some("Metafield"), Some("  "));
        assert_eq!(seo.effective_title(), Some("Metafield"));
        assert_eq!(seo.effective_description(), None);
    }

    #[test]
    fn user_errors_become_api_errors() {
        let data = json!({
            "metafieldsSet": {
                "metafields": null,
                "userErrors": [{ "field": ["ownerId"], "message": "Invalid id" }]
            }
        });
        match check_user_errors(&data, "/metafieldsSet/userErrors") {
            Err(ClientError::Api(message)) => assert_eq!(message, "Invalid id"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
