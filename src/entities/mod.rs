use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// --- PostgreSQL Enums ---

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ProductSeo,
    ImageAlt,
    BlogSeo,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "job_phase", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Generating,
    Generated,
    Publishing,
    Published,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "item_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Queued,
    Running,
    Success,
    Failed,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "publish_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "target_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Product,
    Image,
    Article,
}

/// Which sub-pipeline a queue message (or a phase-scoped store operation)
/// refers to. Maps 1:1 onto the `generate`/`publish` message kinds.
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "message_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Generate,
    Publish,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Generate => "generate",
            MessageKind::Publish => "publish",
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "queue_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
}

/// --- Tables ---

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant: String,
    pub job_type: JobType,
    pub phase: JobPhase,
    pub status: JobStatus,

    pub total: i32,
    pub ok_count: i32,
    pub failed_count: i32,
    pub publish_ok_count: i32,
    pub publish_failed_count: i32,
    pub total_attempts: i32,
    pub total_retry_wait_ms: i64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub publish_started_at: Option<DateTime<Utc>>,
    pub publish_finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub lock_owner: Option<Uuid>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub language: String,
    pub meta_title: bool,
    pub meta_description: bool,
    pub generation_hints: serde_json::Value,
    pub apply_only_changed: bool,

    pub usage_reserved: bool,
    pub usage_count: i32,

    pub last_error: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobItem {
    pub id: i64,
    pub job_id: Uuid,

    pub target_type: TargetType,
    pub target_id: String,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub media_id: Option<String>,
    pub image_url: Option<String>,

    pub status: ItemStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub gen_attempts: i32,
    pub gen_retry_wait_ms: i64,

    pub seo_title: Option<String>,
    pub seo_description: Option<String>,

    pub publish_status: PublishStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub publish_error: Option<String>,
    pub publish_attempts: i32,
    pub publish_retry_wait_ms: i64,
}

/// Typed reading of the shared `seo_title`/`seo_description` columns.
///
/// The two columns carry different meanings per target type: for products and
/// articles they hold the SEO draft, for images `seo_title` is the draft alt
/// text and `seo_description` is the last known live alt. Reading through this
/// view keeps phase code from writing an image draft into a product field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftView<'a> {
    Seo {
        title: Option<&'a str>,
        description: Option<&'a str>,
    },
    ImageAlt {
        draft_alt: Option<&'a str>,
        live_alt: Option<&'a str>,
    },
}

impl JobItem {
    pub fn draft(&self) -> DraftView<'_> {
        match self.target_type {
            TargetType::Image => DraftView::ImageAlt {
                draft_alt: self.seo_title.as_deref(),
                live_alt: self.seo_description.as_deref(),
            },
            TargetType::Product | TargetType::Article => DraftView::Seo {
                title: self.seo_title.as_deref(),
                description: self.seo_description.as_deref(),
            },
        }
    }
}

/// Draft output written back by the generate phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Draft {
    Seo {
        title: Option<String>,
        description: Option<String>,
    },
    Alt(String),
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageCounter {
    pub tenant: String,
    pub month_key: String,
    pub used: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueMessage {
    pub id: Uuid,
    pub external_id: String,
    pub job_id: Uuid,
    pub kind: MessageKind,

    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    pub visibility_till: Option<DateTime<Utc>>,
    pub reserved_by: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(target_type: TargetType) -> JobItem {
        JobItem {
            id: 1,
            job_id: Uuid::new_v4(),
            target_type,
            target_id: "gid://store/Product/1".to_string(),
            parent_id: None,
            title: None,
            media_id: None,
            image_url: None,
            status: ItemStatus::Success,
            started_at: None,
            finished_at: None,
            error: None,
            gen_attempts: 0,
            gen_retry_wait_ms: 0,
            seo_title: Some("draft title".to_string()),
            seo_description: Some("draft description".to_string()),
            publish_status: PublishStatus::Skipped,
            published_at: None,
            publish_error: None,
            publish_attempts: 0,
            publish_retry_wait_ms: 0,
        }
    }

    #[test]
    fn product_draft_reads_as_seo() {
        let item = item(TargetType::Product);
        assert_eq!(
            item.draft(),
            DraftView::Seo {
                title: Some("draft title"),
                description: Some("draft description"),
            }
        );
    }

    #[test]
    fn image_draft_reads_as_alt_pair() {
        let item = item(TargetType::Image);
        assert_eq!(
            item.draft(),
            DraftView::ImageAlt {
                draft_alt: Some("draft title"),
                live_alt: Some("draft description"),
            }
        );
    }
}
