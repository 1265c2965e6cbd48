//! Text-completion client.
//!
//! One chat-completions call per draft, constrained to a closed JSON object
//! whose keys depend on the job type. Non-JSON replies are treated as
//! transient. A language guard runs after parsing; on mismatch the values are
//! rewritten into the target language with exactly one extra pass.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::classify::ClientError;
use crate::config::GeneratorEnv;
use crate::entities::JobType;
use crate::retry::{RetryObserver, RetryPolicy, run_with_retry, with_timeout};

use super::language::is_language_mismatch;
use super::{retry_after_from_headers, truncate_chars};

/// Hard output limits, by character count.
pub const SEO_TITLE_MAX: usize = 70;
pub const SEO_DESCRIPTION_MAX: usize = 320;
pub const ALT_TEXT_MAX: usize = 125;

const MAX_REQUIRED_KEYWORDS: usize = 10;
const MAX_BANNED_WORDS: usize = 30;

/// Tenant-level generation preferences, carried as an opaque map on the job
/// row and decoded leniently here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationHints {
    pub brand_name: Option<String>,
    pub tone: Option<String>,
    pub brand_voice: Option<String>,
    pub target_keyword: Option<String>,
    pub required_keywords: Vec<String>,
    pub banned_words: Vec<String>,
    pub capitalization: Option<String>,
    pub emoji_policy: Option<String>,
}

impl GenerationHints {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// What we are writing copy for.
#[derive(Debug, Clone)]
pub enum TargetPayload {
    Product { title: String, description: String },
    Article { title: String, body: String },
    Image { product_title: String, image_url: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedFields {
    Seo { seo_title: String, seo_description: String },
    Alt { alt_text: String },
}

impl GeneratedFields {
    fn texts(&self) -> Vec<&str> {
        match self {
            GeneratedFields::Seo { seo_title, seo_description } => {
                vec![seo_title.as_str(), seo_description.as_str()]
            }
            GeneratedFields::Alt { alt_text } => vec![alt_text.as_str()],
        }
    }

    fn as_json(&self) -> Value {
        match self {
            GeneratedFields::Seo { seo_title, seo_description } => {
                json!({ "seoTitle": seo_title, "seoDescription": seo_description })
            }
            GeneratedFields::Alt { alt_text } => json!({ "altText": alt_text }),
        }
    }

    fn truncated(self) -> Self {
        match self {
            GeneratedFields::Seo { seo_title, seo_description } => GeneratedFields::Seo {
                seo_title: truncate_chars(&seo_title, SEO_TITLE_MAX),
                seo_description: truncate_chars(&seo_description, SEO_DESCRIPTION_MAX),
            },
            GeneratedFields::Alt { alt_text } => {
                GeneratedFields::Alt { alt_text: truncate_chars(&alt_text, ALT_TEXT_MAX) }
            }
        }
    }
}

#[derive(Clone)]
pub struct GeneratorClient {
    http: Client,
    config: GeneratorEnv,
}

impl GeneratorClient {
    pub fn new(config: GeneratorEnv) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build generator http client");
        Self { http, config }
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_attempts,
            backoff_base: self.config.backoff_base,
        }
    }

    /// Produce draft metadata for one target.
    #[instrument(skip_all, fields(job_type = ?job_type, lang = %lang))]
    pub async fn generate(
        &self,
        job_type: JobType,
        lang: &str,
        hints: &GenerationHints,
        target: &TargetPayload,
        observer: &dyn RetryObserver,
    ) -> Result<GeneratedFields, ClientError> {
        let system = system_prompt(job_type, lang);
        let user = user_prompt(job_type, lang, hints, target);
        let fields = self.request_fields(job_type, &system, &user, observer).await?;

        let fields = if is_language_mismatch(lang, &fields.texts()) {
            warn!(%lang, "generated text failed the language guard, requesting rewrite");
            let rewrite_user = format!(
                "Rewrite every value of this JSON object strictly into the language '{lang}', \
                 preserving meaning. Keep the same keys. Return ONLY the JSON object.\n\n{}",
                fields.as_json()
            );
            // One rewrite pass; a second mismatch is accepted as-is.
            self.request_fields(job_type, &system, &rewrite_user, observer)
                .await?
        } else {
            fields
        };

        Ok(fields.truncated())
    }

    async fn request_fields(
        &self,
        job_type: JobType,
        system: &str,
        user: &str,
        observer: &dyn RetryObserver,
    ) -> Result<GeneratedFields, ClientError> {
        run_with_retry(self.policy(), observer, "generator", |attempt| {
            debug!(attempt, "calling generator");
            self.call_once(job_type, system, user)
        })
        .await
    }

    async fn call_once(
        &self,
        job_type: JobType,
        system: &str,
        user: &str,
    ) -> Result<GeneratedFields, ClientError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.7,
        });

        let request = async {
            let response = self
                .http
                .post(&self.config.endpoint)
                .bearer_auth(&self.config.api_key)
                .json(&body)
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

            let envelope: Value = serde_json::from_str(&text)
                .map_err(|e| ClientError::BadJson(format!("completion envelope: {e}")))?;
            let content = envelope
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::BadJson("missing completion content".to_string()))?;

            parse_fields(job_type, content)
        };

        with_timeout(request, self.config.timeout, "generator").await
    }
}

/// Parse the model's JSON reply into the closed field set for the job type.
fn parse_fields(job_type: JobType, content: &str) -> Result<GeneratedFields, ClientError> {
    let stripped = strip_code_fence(content);
    let value: Value = serde_json::from_str(stripped)
        .map_err(|e| ClientError::BadJson(format!("completion content: {e}")))?;

    let field = |key: &str| -> Result<String, ClientError> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ClientError::BadJson(format!("missing or empty key '{key}'")))
    };

    match job_type {
        JobType::ProductSeo | JobType::BlogSeo => Ok(GeneratedFields::Seo {
            seo_title: field("seoTitle")?,
            seo_description: field("seoDescription")?,
        }),
        JobType::ImageAlt => Ok(GeneratedFields::Alt { alt_text: field("altText")? }),
    }
}

/// Models occasionally wrap JSON in a markdown fence despite the contract.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn expected_keys(job_type: JobType) -> &'static str {
    match job_type {
        JobType::ProductSeo | JobType::BlogSeo => {
            r#""seoTitle" (a string) and "seoDescription" (a string)"#
        }
        JobType::ImageAlt => r#""altText" (a string)"#,
    }
}

fn system_prompt(job_type: JobType, lang: &str) -> String {
    let task = match job_type {
        JobType::ProductSeo => "You write SEO meta titles and meta descriptions for online-store products.",
        JobType::BlogSeo => "You write SEO meta titles and meta descriptions for online-store blog articles.",
        JobType::ImageAlt => "You write concise, descriptive alt text for online-store product images.",
    };
    format!(
        "{task} Return ONLY a valid JSON object with keys {keys}. \
         No markdown, no commentary. Every value must be written in the language '{lang}'.",
        keys = expected_keys(job_type),
    )
}

fn user_prompt(job_type: JobType, lang: &str, hints: &GenerationHints, target: &TargetPayload) -> String {
    let mut lines = Vec::new();

    match target {
        TargetPayload::Product { title, description } => {
            lines.push(format!("Product title: {title}"));
            if !description.is_empty() {
                lines.push(format!("Product description: {description}"));
            }
        }
        TargetPayload::Article { title, body } => {
            lines.push(format!("Article title: {title}"));
            if !body.is_empty() {
                lines.push(format!("Article body: {body}"));
            }
        }
        TargetPayload::Image { product_title, image_url } => {
            lines.push(format!("Image of product: {product_title}"));
            if let Some(url) = image_url {
                lines.push(format!("Image URL: {url}"));
            }
        }
    }

    if let Some(brand) = &hints.brand_name {
        lines.push(format!("Brand name: {brand}"));
    }
    if let Some(tone) = &hints.tone {
        lines.push(format!("Tone: {tone}"));
    }
    if let Some(voice) = &hints.brand_voice {
        lines.push(format!("Brand voice: {voice}"));
    }
    if let Some(keyword) = &hints.target_keyword {
        lines.push(format!("Target keyword: {keyword}"));
    }
    if !hints.required_keywords.is_empty() {
        let keywords: Vec<&str> = hints
            .required_keywords
            .iter()
            .take(MAX_REQUIRED_KEYWORDS)
            .map(String::as_str)
            .collect();
        lines.push(format!("Required keywords: {}", keywords.join(", ")));
    }
    if !hints.banned_words.is_empty() {
        let banned: Vec<&str> = hints
            .banned_words
            .iter()
            .take(MAX_BANNED_WORDS)
            .map(String::as_str)
            .collect();
        lines.push(format!("Never use these words: {}", banned.join(", ")));
    }
    if let Some(capitalization) = &hints.capitalization {
        lines.push(format!("Capitalization style: {capitalization}"));
    }
    if let Some(emoji) = &hints.emoji_policy {
        lines.push(format!("Emoji policy: {emoji}"));
    }

    match job_type {
        JobType::ProductSeo | JobType::BlogSeo => {
            lines.push(format!(
                "Write a meta title of at most {SEO_TITLE_MAX} characters and a meta \
                 description of at most {SEO_DESCRIPTION_MAX} characters."
            ));
        }
        JobType::ImageAlt => {
            lines.push(format!("Write alt text of at most {ALT_TEXT_MAX} characters."));
        }
    }
    lines.push(format!("Write everything in the language '{lang}'."));

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seo_fields() {
        let fields = parse_fields(
            JobType::ProductSeo,
            r#"{"seoTitle": "A", "seoDescription": "B"}"#,
        )
        .unwrap();
        assert_eq!(
            fields,
            GeneratedFields::Seo {
                seo_title: "A".to_string(),
                seo_description: "B".to_string()
            }
        );
    }

    #[test]
    fn parses_alt_field_and_strips_fence() {
        let fields =
            parse_fields(JobType::ImageAlt, "```json\n{\"altText\": \"A red shirt\"}\n```").unwrap();
        assert_eq!(fields, GeneratedFields::Alt { alt_text: "A red shirt".to_string() });
    }

    #[test]
    fn missing_or_empty_keys_are_bad_json() {
        assert!(matches!(
            parse_fields(JobType::ProductSeo, r#"{"seoTitle": "A"}"#),
            Err(ClientError::BadJson(_))
        ));
        assert!(matches!(
            parse_fields(JobType::ProductSeo, r#"{"seoTitle": " ", "seoDescription": "B"}"#),
            Err(ClientError::BadJson(_))
        ));
        assert!(matches!(
            parse_fields(JobType::ProductSeo, "not json at all"),
            Err(ClientError::BadJson(_))
        ));
    }

    #[test]
    fn truncation_enforces_exact_limits() {
        let fields = GeneratedFields::Seo {
            seo_title: "t".repeat(SEO_TITLE_MAX + 40),
            seo_description: "d".repeat(SEO_DESCRIPTION_MAX + 1),
        }
        .truncated();
        match fields {
            GeneratedFields::Seo { seo_title, seo_description } => {
                assert_eq!(seo_title.chars().count(), SEO_TITLE_MAX);
                assert_eq!(seo_description.chars().count(), SEO_DESCRIPTION_MAX);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn hints_are_capped_in_the_prompt() {
        let hints = GenerationHints {
            required_keywords: (0..20).map(|i| format!("kw{i}")).collect(),
            ..GenerationHints::default()
        };
        let prompt = user_prompt(
            JobType::ProductSeo,
            "en",
            &hints,
            &TargetPayload::Product { title: "Shirt".to_string(), description: String::new() },
        );
        assert!(prompt.contains("kw9"));
        assert!(!prompt.contains("kw10"));
    }

    #[test]
    fn hints_decode_leniently() {
        let hints = GenerationHints::from_value(&serde_json::json!({
            "brandName": "Acme",
            "unknownField": 17,
        }));
        assert_eq!(hints.brand_name.as_deref(), Some("Acme"));
        assert!(hints.required_keywords.is_empty());

        let hints = GenerationHints::from_value(&serde_json::json!("not an object"));
        assert!(hints.brand_name.is_none());
    }
}
