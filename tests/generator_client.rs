mod common;

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{completion_body, generator_env};
use seobatch::classify::{ClientError, classify};
use seobatch::clients::{GeneratedFields, GenerationHints, GeneratorClient, TargetPayload};
use seobatch::entities::JobType;
use seobatch::retry::NoopObserver;

fn client(server: &MockServer) -> GeneratorClient {
    GeneratorClient::new(generator_env(
        format!("{}/v1/chat/completions", server.uri()),
        Duration::from_millis(10),
    ))
}

fn product_target() -> TargetPayload {
    TargetPayload::Product {
        title: "Linen Shirt".to_string(),
        description: "A lightweight summer shirt".to_string(),
    }
}

#[tokio::test]
async fn generates_seo_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "seoTitle": "Linen Shirt | Acme",
            "seoDescription": "Breathable linen shirt for warm days."
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let fields = client(&server)
        .generate(
            JobType::ProductSeo,
            "en",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap();

    assert_eq!(
        fields,
        GeneratedFields::Seo {
            seo_title: "Linen Shirt | Acme".to_string(),
            seo_description: "Breathable linen shirt for warm days.".to_string(),
        }
    );
}

#[tokio::test]
async fn retries_transient_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "seoTitle": "A",
            "seoDescription": "B"
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let fields = client(&server)
        .generate(
            JobType::ProductSeo,
            "en",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap();

    assert!(matches!(fields, GeneratedFields::Seo { .. }));
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string("This model's maximum context length is 8192 tokens"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .generate(
            JobType::ProductSeo,
            "en",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap_err();

    let classification = classify(&err);
    assert!(!classification.transient);
    assert_eq!(classification.user_message, "input too long");
}

#[tokio::test]
async fn non_json_content_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body_raw("Sure! Here is your SEO copy:")),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "altText": "A folded linen shirt on a table"
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let fields = client(&server)
        .generate(
            JobType::ImageAlt,
            "en",
            &GenerationHints::default(),
            &TargetPayload::Image {
                product_title: "Linen Shirt".to_string(),
                image_url: None,
            },
            &NoopObserver,
        )
        .await
        .unwrap();

    assert_eq!(
        fields,
        GeneratedFields::Alt { alt_text: "A folded linen shirt on a table".to_string() }
    );
}

fn completion_body_raw(content: &str) -> serde_json::Value {
    json!({
        "choices": [ { "message": { "role": "assistant", "content": content } } ]
    })
}

#[tokio::test]
async fn language_mismatch_triggers_exactly_one_rewrite() {
    let server = MockServer::start().await;
    // First reply is English although Turkish was requested.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "seoTitle": "The best shirt for your summer",
            "seoDescription": "Made for the warm days of the year with care"
        }))))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    // The rewrite pass must carry the original values in its prompt.
    Mock::given(method("POST"))
        .and(body_string_contains("The best shirt for your summer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "seoTitle": "Yaz için en iyi gömlek",
            "seoDescription": "Yılın sıcak günleri için özenle üretildi"
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let fields = client(&server)
        .generate(
            JobType::ProductSeo,
            "tr",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap();

    assert_eq!(
        fields,
        GeneratedFields::Seo {
            seo_title: "Yaz için en iyi gömlek".to_string(),
            seo_description: "Yılın sıcak günleri için özenle üretildi".to_string(),
        }
    );
}

#[tokio::test]
async fn second_mismatch_is_accepted_without_looping() {
    let server = MockServer::start().await;
    // Both the original and the rewrite come back in English; exactly two
    // calls happen, never a third.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "seoTitle": "The best shirt for your summer",
            "seoDescription": "Made for the warm days of the year with care"
        }))))
        .expect(2)
        .mount(&server)
        .await;

    let fields = client(&server)
        .generate(
            JobType::ProductSeo,
            "tr",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap();

    assert!(matches!(fields, GeneratedFields::Seo { .. }));
}

#[tokio::test]
async fn oversized_output_is_truncated_to_the_limit() {
    let server = MockServer::start().await;
    let long_title = "t".repeat(200);
    let long_description = "d".repeat(1000);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&json!({
            "seoTitle": long_title,
            "seoDescription": long_description
        }))))
        .mount(&server)
        .await;

    let fields = client(&server)
        .generate(
            JobType::ProductSeo,
            "en",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap();

    match fields {
        GeneratedFields::Seo { seo_title, seo_description } => {
            assert_eq!(seo_title.chars().count(), seobatch::clients::generator::SEO_TITLE_MAX);
            assert_eq!(
                seo_description.chars().count(),
                seobatch::clients::generator::SEO_DESCRIPTION_MAX
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn auth_failure_surfaces_as_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .generate(
            JobType::ProductSeo,
            "en",
            &GenerationHints::default(),
            &product_target(),
            &NoopObserver,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Http { status: 401, .. }));
    assert_eq!(classify(&err).user_message, "authentication failed");
}
