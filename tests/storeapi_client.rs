mod common;

use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use common::{metafields_ok_body, store_api_env};
use seobatch::classify::{ClientError, classify};
use seobatch::clients::{FieldToggles, StoreApiClient};
use seobatch::retry::NoopObserver;

fn client(server: &MockServer) -> StoreApiClient {
    StoreApiClient::new(store_api_env(
        format!("{}/graphql", server.uri()),
        Duration::from_millis(10),
    ))
}

const BOTH: FieldToggles = FieldToggles { meta_title: true, meta_description: true };

fn product_response(seo_title: Option<&str>, seo_description: Option<&str>) -> serde_json::Value {
    json!({
        "data": {
            "product": {
                "id": "gid://store/Product/1",
                "title": "Linen Shirt",
                "descriptionHtml": "<p>desc</p>",
                "seo": { "title": seo_title, "description": seo_description },
                "titleTag": null,
                "descriptionTag": null
            }
        }
    })
}

#[tokio::test]
async fn fetch_product_reads_native_seo_and_metafields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("X-Store-Access-Token", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "product": {
                    "id": "gid://store/Product/1",
                    "title": "Linen Shirt",
                    "descriptionHtml": "<p>desc</p>",
                    "seo": { "title": "Native title", "description": null },
                    "titleTag": { "value": "Metafield title" },
                    "descriptionTag": null
                }
            }
        })))
        .mount(&server)
        .await;

    let product = client(&server).fetch_product("1", &NoopObserver).await.unwrap();
    assert_eq!(product.title, "Linen Shirt");
    assert_eq!(product.seo.effective_title(), Some("Metafield title"));
    assert_eq!(product.seo.effective_description(), None);
}

#[tokio::test]
async fn throttle_messages_on_200_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{ "message": "Throttled: maximum query cost exceeded" }]
        })))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(product_response(None, None)))
        .expect(1)
        .mount(&server)
        .await;

    let product = client(&server).fetch_product("1", &NoopObserver).await.unwrap();
    assert_eq!(product.title, "Linen Shirt");
}

#[tokio::test]
async fn cost_pacing_sleeps_before_returning() {
    let server = MockServer::start().await;
    let mut body = product_response(None, None);
    body["extensions"] = json!({
        "cost": {
            "throttleStatus": { "currentlyAvailable": 50.0, "restoreRate": 50.0 }
        }
    });
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let started = Instant::now();
    client(&server).fetch_product("1", &NoopObserver).await.unwrap();
    let elapsed = started.elapsed();
    // (100 - 50) / 50 = 1 second, clamped well under the 5 s ceiling.
    assert!(elapsed >= Duration::from_secs(1), "paced only {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "paced too long: {elapsed:?}");
}

#[tokio::test]
async fn write_stages_metafields_and_never_touches_native_seo() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query Product"))
        .respond_with(ResponseTemplate::new(200).set_body_json(product_response(None, None)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("metafieldsSet"))
        .and(body_string_contains("title_tag"))
        .and(body_string_contains("description_tag"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metafields_ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .write_product_seo("1", Some("New title"), Some("New description"), BOTH, &NoopObserver)
        .await
        .unwrap();
}

#[tokio::test]
async fn write_backfills_counterpart_from_native_seo() {
    let server = MockServer::start().await;
    // Live native description exists, its metafield is empty, and only the
    // title is being written: the mutation must carry both keys.
    Mock::given(method("POST"))
        .and(body_string_contains("query Product"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(product_response(None, Some("Native description"))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("metafieldsSet"))
        .and(body_string_contains("Native description"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metafields_ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .write_product_seo("1", Some("New title"), None, BOTH, &NoopObserver)
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_drafts_skip_the_mutation_entirely() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query Product"))
        .respond_with(ResponseTemplate::new(200).set_body_json(product_response(None, None)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("metafieldsSet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metafields_ok_body()))
        .expect(0)
        .mount(&server)
        .await;

    client(&server)
        .write_product_seo("1", Some("   "), Some(""), BOTH, &NoopObserver)
        .await
        .unwrap();
}

#[tokio::test]
async fn user_errors_fail_the_write_permanently() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query Product"))
        .respond_with(ResponseTemplate::new(200).set_body_json(product_response(None, None)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("metafieldsSet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "metafieldsSet": {
                    "metafields": null,
                    "userErrors": [{ "field": ["value"], "message": "Value is invalid" }]
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .write_product_seo("1", Some("T"), Some("D"), BOTH, &NoopObserver)
        .await
        .unwrap_err();
    let classification = classify(&err);
    assert!(!classification.transient);
    assert_eq!(classification.user_message, "Value is invalid");
}

#[tokio::test]
async fn article_write_falls_back_via_node_preflight_on_invalid_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("query Article"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "article": {
                    "id": "gid://store/Article/7",
                    "title": "Post",
                    "body": "Body",
                    "titleTag": null,
                    "descriptionTag": null
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    // First mutation against the Article GID is rejected.
    Mock::given(method("POST"))
        .and(body_string_contains("metafieldsSet"))
        .and(body_string_contains("gid://store/Article/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "metafieldsSet": {
                    "metafields": null,
                    "userErrors": [{ "field": ["ownerId"], "message": "Invalid id" }]
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    // The alternate form is preflighted via node(id:) …
    Mock::given(method("POST"))
        .and(body_string_contains("node(id:"))
        .and(body_string_contains("OnlineStoreArticle/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "node": { "id": "gid://store/OnlineStoreArticle/7" } }
        })))
        .expect(1)
        .mount(&server)
        .await;
    // … and only then used for the retried mutation.
    Mock::given(method("POST"))
        .and(body_string_contains("metafieldsSet"))
        .and(body_string_contains("OnlineStoreArticle/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metafields_ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .write_article_seo("7", Some("T"), Some("D"), BOTH, &NoopObserver)
        .await
        .unwrap();
}

#[tokio::test]
async fn image_alt_write_sends_the_media_mutation() {
    let server = MockServer::start().await;
    let check = |request: &Request| {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        body["variables"]["media"][0]["alt"] == json!("A folded shirt")
    };
    Mock::given(method("POST"))
        .and(body_string_contains("productUpdateMedia"))
        .and(move |request: &Request| check(request))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "productUpdateMedia": {
                    "media": [{ "id": "gid://store/MediaImage/5" }],
                    "mediaUserErrors": []
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .write_image_alt(
            "1",
            "gid://store/MediaImage/5",
            "A folded shirt",
            &NoopObserver,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn http_401_is_classified_as_authentication_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).fetch_product("1", &NoopObserver).await.unwrap_err();
    assert!(matches!(err, ClientError::Http { status: 401, .. }));
    assert_eq!(classify(&err).user_message, "authentication failed");
}
