pub mod freshservice;
pub mod jira;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::cache::{Row, SourceId};

/// Upstream ticket-system client. A refresh either produces a fresh table or
/// fails; single-record lookups go to the live API, bypassing the cache.
#[async_trait]
pub trait TicketSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// Fetch the full ticket table from the upstream API.
    async fn fetch_table(&self) -> Result<Vec<Row>>;

    /// Fetch one record by id from the live API.
    async fn fetch_record(&self, record_id: &str) -> Result<serde_json::Value>;
}
