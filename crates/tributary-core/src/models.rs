//! Core data models for tributary.
//!
//! These types are shared across all tributary crates and represent the
//! sources being polled, the items flowing through the processing pipeline,
//! and the task envelopes carried by the queue.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

pub use pgvector::Vector;

// =============================================================================
// SOURCE TYPES
// =============================================================================

/// Lifecycle status of a polled source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Refreshed on its own schedule.
    Active,
    /// Stopped after too many consecutive failures; needs a manual reset.
    Error,
    /// Turned off by a user.
    Disabled,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Error => "error",
            SourceStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(SourceStatus::Active),
            "error" => Ok(SourceStatus::Error),
            "disabled" => Ok(SourceStatus::Disabled),
            other => Err(Error::InvalidInput(format!("unknown source status: {other}"))),
        }
    }
}

/// Outcome of the most recent fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    NotModified,
    Failed,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::NotModified => "not_modified",
            FetchStatus::Failed => "failed",
        }
    }
}

impl FromStr for FetchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(FetchStatus::Success),
            "not_modified" => Ok(FetchStatus::NotModified),
            "failed" => Ok(FetchStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown fetch status: {other}"))),
        }
    }
}

/// HTTP cache validators remembered between fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A periodically polled external content location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub status: SourceStatus,
    /// Consecutive failures since the last success.
    pub error_count: i32,
    pub last_fetch_status: Option<FetchStatus>,
    pub last_fetch_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub next_fetch_at: Option<DateTime<Utc>>,
    pub validators: CacheValidators,
    pub refresh_interval_minutes: i32,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Resource key shared by the task lock and the schedule lock.
    pub fn resource_key(id: Uuid) -> String {
        format!("feed:{id}")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.max(1) as u64 * 60)
    }
}

/// Request to register a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSourceRequest {
    pub url: String,
    pub title: Option<String>,
    pub refresh_interval_minutes: Option<i32>,
}

/// Scheduler-owned columns written after every refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUpdate {
    pub status: SourceStatus,
    pub error_count: i32,
    pub last_fetch_status: FetchStatus,
    pub last_fetch_error: Option<String>,
    pub last_fetched_at: DateTime<Utc>,
    pub next_fetch_at: Option<DateTime<Utc>>,
    /// New validators; `None` keeps the stored ones.
    pub validators: Option<CacheValidators>,
}

/// An entry discovered in a fetched document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingItem {
    /// Stable identifier, unique within the source.
    pub external_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
}

// =============================================================================
// FETCH TYPES
// =============================================================================

/// Result of a conditional fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The server confirmed the cached copy is current.
    NotModified,
    /// New content was returned and parsed.
    Modified {
        items: Vec<IncomingItem>,
        validators: CacheValidators,
    },
}

/// A downloaded binary resource (e.g. an image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

// =============================================================================
// WORK ITEM TYPES
// =============================================================================

/// Three-valued stage flag. Never stored as a nullable boolean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    /// Not attempted yet.
    #[default]
    Unset,
    Success,
    Failed,
}

impl TriState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriState::Unset => "unset",
            TriState::Success => "success",
            TriState::Failed => "failed",
        }
    }
}

impl FromStr for TriState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unset" => Ok(TriState::Unset),
            "success" => Ok(TriState::Success),
            "failed" => Ok(TriState::Failed),
            other => Err(Error::InvalidInput(format!("unknown stage status: {other}"))),
        }
    }
}

/// Kind of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Entry produced by a source refresh.
    Article,
    /// Code repository, linked from articles or synced from stars.
    Repository,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Article => "article",
            ItemKind::Repository => "repository",
        }
    }

    /// Stages that apply to this kind, in dependency order.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            ItemKind::Article => &[Stage::Images, Stage::Rag, Stage::RepoLinks],
            ItemKind::Repository => &[Stage::RepoEmbedding],
        }
    }
}

impl FromStr for ItemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "article" => Ok(ItemKind::Article),
            "repository" => Ok(ItemKind::Repository),
            other => Err(Error::InvalidInput(format!("unknown item kind: {other}"))),
        }
    }
}

/// A post-ingestion processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Caption images referenced by an article.
    Images,
    /// Chunk and embed article text plus captions.
    Rag,
    /// Extract linked code repositories.
    RepoLinks,
    /// Embed a repository item.
    RepoEmbedding,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Images,
        Stage::Rag,
        Stage::RepoLinks,
        Stage::RepoEmbedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Images => "images",
            Stage::Rag => "rag",
            Stage::RepoLinks => "repo_links",
            Stage::RepoEmbedding => "repo_embedding",
        }
    }

    /// Name of the persisted flag column for this stage.
    pub fn flag_name(&self) -> &'static str {
        match self {
            Stage::Images => "images_processed",
            Stage::Rag => "rag_processed",
            Stage::RepoLinks => "repos_extracted",
            Stage::RepoEmbedding => "embedding_processed",
        }
    }

    /// Item kind this stage runs on.
    pub fn kind(&self) -> ItemKind {
        match self {
            Stage::Images | Stage::Rag | Stage::RepoLinks => ItemKind::Article,
            Stage::RepoEmbedding => ItemKind::Repository,
        }
    }

    /// Stage whose success gates this one.
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Images => None,
            Stage::Rag => Some(Stage::Images),
            Stage::RepoLinks => Some(Stage::Rag),
            Stage::RepoEmbedding => None,
        }
    }

    /// Stage chained after this one succeeds.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Images => Some(Stage::Rag),
            Stage::Rag => Some(Stage::RepoLinks),
            Stage::RepoLinks | Stage::RepoEmbedding => None,
        }
    }

    /// Entry stage for a freshly created item.
    pub fn first_for(kind: ItemKind) -> Stage {
        kind.stages()[0]
    }

    /// Task that executes this stage.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            Stage::Images => TaskKind::ProcessImages,
            Stage::Rag => TaskKind::ProcessRag,
            Stage::RepoLinks => TaskKind::ExtractRepoLinks,
            Stage::RepoEmbedding => TaskKind::EmbedRepository,
        }
    }

    /// Resource key used for the item lock and queue de-duplication.
    pub fn dedup_key(&self, item_id: Uuid) -> String {
        format!("stage:{}:{item_id}", self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown stage: {s}")))
    }
}

/// Persisted state of one stage on one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub status: TriState,
    pub attempted_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub error: Option<String>,
}

/// A content item moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: ItemKind,
    /// Owning source for articles; `None` for repositories.
    pub source_id: Option<Uuid>,
    pub external_id: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content: String,
    pub metadata: JsonValue,
    pub stages: BTreeMap<Stage, StageState>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Current state of `stage`, `Unset` when never recorded.
    pub fn stage(&self, stage: Stage) -> StageState {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    pub fn resource_key(id: Uuid) -> String {
        format!("item:{id}")
    }
}

/// Caption produced for one image referenced by an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCaption {
    pub url: String,
    pub caption: String,
}

/// A chunk of text with its embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub index: i32,
    pub text: String,
    pub embedding: Vector,
}

/// Reference to a code repository by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Case-insensitive identity used as the repository's external id.
    pub fn external_id(&self) -> String {
        self.full_name().to_lowercase()
    }

    pub fn html_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }
}

/// Descriptive data fetched for a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoDetails {
    pub full_name: String,
    pub description: Option<String>,
    pub readme: Option<String>,
    pub topics: Vec<String>,
    pub language: Option<String>,
    pub stars: i64,
    pub html_url: Option<String>,
}

impl RepoDetails {
    /// Text handed to the analyzer and the embedder.
    pub fn document(&self) -> String {
        let mut parts = vec![self.full_name.clone()];
        if let Some(description) = &self.description {
            parts.push(description.clone());
        }
        if !self.topics.is_empty() {
            parts.push(format!("Topics: {}", self.topics.join(", ")));
        }
        if let Some(language) = &self.language {
            parts.push(format!("Language: {language}"));
        }
        if let Some(readme) = &self.readme {
            parts.push(readme.clone());
        }
        parts.join("\n\n")
    }
}

/// Structured analysis produced by an [`crate::Analyzer`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

// =============================================================================
// TASK TYPES
// =============================================================================

/// Named task types carried by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Fetch one source and schedule its successor.
    RefreshSource,
    /// Re-enqueue refreshes for sources whose chain was lost.
    SweepDueSources,
    ProcessImages,
    ProcessRag,
    ExtractRepoLinks,
    EmbedRepository,
    /// Re-enqueue stalled or retryable pipeline stages.
    SweepStalledStages,
    /// List starred repositories and fan out per-repository syncs.
    SyncStarredRepos,
    /// Batch member: fetch and analyze one repository.
    SyncRepository,
    /// Batch callback: runs once every member has finished.
    FinishRepoSync,
}

impl TaskKind {
    pub const ALL: [TaskKind; 10] = [
        TaskKind::RefreshSource,
        TaskKind::SweepDueSources,
        TaskKind::ProcessImages,
        TaskKind::ProcessRag,
        TaskKind::ExtractRepoLinks,
        TaskKind::EmbedRepository,
        TaskKind::SweepStalledStages,
        TaskKind::SyncStarredRepos,
        TaskKind::SyncRepository,
        TaskKind::FinishRepoSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RefreshSource => "refresh_source",
            TaskKind::SweepDueSources => "sweep_due_sources",
            TaskKind::ProcessImages => "process_images",
            TaskKind::ProcessRag => "process_rag",
            TaskKind::ExtractRepoLinks => "extract_repo_links",
            TaskKind::EmbedRepository => "embed_repository",
            TaskKind::SweepStalledStages => "sweep_stalled_stages",
            TaskKind::SyncStarredRepos => "sync_starred_repos",
            TaskKind::SyncRepository => "sync_repository",
            TaskKind::FinishRepoSync => "finish_repo_sync",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown task kind: {s}")))
    }
}

/// Queue lane. High-lane tasks are always claimed before default-lane ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// User-initiated work.
    High,
    /// Scheduled and background work.
    #[default]
    Default,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::High => "high",
            Lane::Default => "default",
        }
    }

    /// Sort key; lower is claimed first.
    pub fn rank(&self) -> i16 {
        match self {
            Lane::High => 0,
            Lane::Default => 1,
        }
    }
}

impl FromStr for Lane {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(Lane::High),
            "default" => Ok(Lane::Default),
            other => Err(Error::InvalidInput(format!("unknown lane: {other}"))),
        }
    }
}

/// Status of a task envelope in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Handler declined the task (lock busy, precondition unmet).
    Rejected,
    /// Retries exhausted or fatal failure; kept for inspection.
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Rejected | TaskStatus::Dead
        )
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "rejected" => Ok(TaskStatus::Rejected),
            "dead" => Ok(TaskStatus::Dead),
            other => Err(Error::InvalidInput(format!("unknown task status: {other}"))),
        }
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub kind: TaskKind,
    pub kwargs: JsonValue,
    pub lane: Lane,
    pub status: TaskStatus,
    /// Earliest time the task may run.
    pub eta: DateTime<Utc>,
    /// Queue-level retries already consumed.
    pub attempts: i32,
    pub max_retries: i32,
    pub dedup_key: Option<String>,
    pub result: Option<JsonValue>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    /// Deserialize the keyword arguments into a typed struct.
    pub fn kwargs<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.kwargs.clone()).map_err(|e| {
            Error::InvalidInput(format!("malformed kwargs for {}: {e}", self.kind))
        })
    }

    /// Whether another queue-level retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_retries
    }
}

/// Request to put a task on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub kind: TaskKind,
    pub kwargs: JsonValue,
    pub lane: Lane,
    /// Relative delay; ignored when `eta` is set.
    pub delay: Duration,
    pub eta: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
    pub dedup_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(kind: TaskKind, kwargs: JsonValue) -> Self {
        Self {
            kind,
            kwargs,
            lane: Lane::Default,
            delay: Duration::ZERO,
            eta: None,
            max_retries: None,
            dedup_key: None,
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Absolute time at which the task becomes claimable.
    pub fn resolve_eta(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.eta.unwrap_or_else(|| {
            now + chrono::Duration::from_std(self.delay).unwrap_or(chrono::Duration::zero())
        })
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub pending_high: i64,
    pub running: i64,
    pub completed: i64,
    pub rejected: i64,
    pub dead: i64,
}

// =============================================================================
// BATCH TYPES
// =============================================================================

/// Phase of a fan-out/fan-in batch, as shown to a polling UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    Fetching,
    Analyzing,
    Saving,
    Done,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Fetching => "fetching",
            BatchPhase::Analyzing => "analyzing",
            BatchPhase::Saving => "saving",
            BatchPhase::Done => "done",
        }
    }
}

impl FromStr for BatchPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetching" => Ok(BatchPhase::Fetching),
            "analyzing" => Ok(BatchPhase::Analyzing),
            "saving" => Ok(BatchPhase::Saving),
            "done" => Ok(BatchPhase::Done),
            other => Err(Error::InvalidInput(format!("unknown batch phase: {other}"))),
        }
    }
}

/// Snapshot of a batch's progress counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub phase: BatchPhase,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub remaining: i64,
}

impl BatchProgress {
    pub fn is_done(&self) -> bool {
        self.phase == BatchPhase::Done
    }
}
