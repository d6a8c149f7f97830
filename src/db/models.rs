//! Normalized entities and graph artifacts (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Subreddit {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Post {
    pub id: i64,
    pub external_id: String,
    pub subreddit_id: i64,
    pub author_id: Option<i64>,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Comment {
    pub id: i64,
    pub external_id: String,
    pub post_id: i64,
    pub author_id: Option<i64>,
    pub parent_comment_id: Option<i64>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct UserSubredditActivity {
    pub user_id: i64,
    pub subreddit_id: i64,
    pub post_count: i64,
    pub comment_count: i64,
    pub last_activity_at: DateTime<Utc>,
}

/// Crawl job lifecycle state (§4.18).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Crawling,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CrawlJob {
    pub id: i64,
    pub subreddit_id: i64,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub visible_at: DateTime<Utc>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub subreddit_id: i64,
    pub cron_expression: String,
    pub enabled: bool,
    pub priority: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Namespaced node type prefix (`subreddit`, `user`, `post`, `comment`,
/// `community`); see `GraphNode::id_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Subreddit,
    User,
    Post,
    Comment,
    Community,
}

impl NodeType {
    pub fn prefix(self) -> &'static str {
        match self {
            NodeType::Subreddit => "subreddit",
            NodeType::User => "user",
            NodeType::Post => "post",
            NodeType::Comment => "comment",
            NodeType::Community => "community",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "subreddit" => Some(NodeType::Subreddit),
            "user" => Some(NodeType::User),
            "post" => Some(NodeType::Post),
            "comment" => Some(NodeType::Comment),
            "community" => Some(NodeType::Community),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct GraphNodeRow {
    pub id: String,
    pub name: String,
    pub val: String,
    pub r#type: String,
    pub pos_x: Option<f64>,
    pub pos_y: Option<f64>,
    pub pos_z: Option<f64>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct GraphLinkRow {
    pub id: i64,
    pub source: String,
    pub target: String,
    pub val: Option<f64>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Community {
    pub id: i64,
    pub label: String,
    pub size: i32,
    pub modularity: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommunityMember {
    pub community_id: i64,
    pub node_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CommunityLink {
    pub source_community_id: i64,
    pub target_community_id: i64,
    pub weight: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommunityHierarchyRow {
    pub node_id: String,
    pub level: i32,
    pub community_id: i64,
    pub parent_community_id: Option<i64>,
    pub centroid_x: Option<f64>,
    pub centroid_y: Option<f64>,
    pub centroid_z: Option<f64>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Bundle {
    pub source_community_id: i64,
    pub target_community_id: i64,
    pub weight: i64,
    pub avg_strength: f64,
    pub control_x: f64,
    pub control_y: f64,
    pub control_z: f64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PrecalcState {
    pub last_precalc_at: Option<DateTime<Utc>>,
    pub last_full_precalc_at: Option<DateTime<Utc>>,
    pub total_nodes: i64,
    pub total_links: i64,
    pub precalc_duration_ms: i64,
    pub version_id: i64,
}
