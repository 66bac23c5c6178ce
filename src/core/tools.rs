use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::cache::{CacheStore, SourceId};
use super::query;
use super::refresh::{EnqueueResult, RefreshScheduler};
use crate::sources::TicketSource;

/// The closed set of capabilities exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    ForceRefreshFreshservice,
    ForceRefreshJira,
    GetDataStatus,
    GetSingleTicket,
    QueryFreshserviceTickets,
    QueryJiraDemands,
    GetCurrentTime,
}

impl ToolName {
    pub const ALL: [ToolName; 7] = [
        ToolName::ForceRefreshFreshservice,
        ToolName::ForceRefreshJira,
        ToolName::GetDataStatus,
        ToolName::GetSingleTicket,
        ToolName::QueryFreshserviceTickets,
        ToolName::QueryJiraDemands,
        ToolName::GetCurrentTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ForceRefreshFreshservice => "force_refresh_fresh_service",
            ToolName::ForceRefreshJira => "force_refresh_jira",
            ToolName::GetDataStatus => "get_data_status",
            ToolName::GetSingleTicket => "get_single_ticket",
            ToolName::QueryFreshserviceTickets => "query_fresh_service_tickets",
            ToolName::QueryJiraDemands => "query_jira_demands",
            ToolName::GetCurrentTime => "get_current_time",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

/// Human-readable description of an invocation, used for streamed
/// `tool_call` narration.
pub fn describe_invocation(name: &str, args: &Value) -> String {
    let sql_upper = args
        .get("sql")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_uppercase();
    match ToolName::parse(name) {
        Some(ToolName::QueryFreshserviceTickets) => {
            if sql_upper.contains("COUNT") {
                "Counting Freshservice tickets".to_string()
            } else if sql_upper.contains("WHERE") {
                "Filtering Freshservice tickets".to_string()
            } else {
                "Querying Freshservice tickets".to_string()
            }
        }
        Some(ToolName::QueryJiraDemands) => {
            if sql_upper.contains("COUNT") {
                "Counting JIRA demands".to_string()
            } else if sql_upper.contains("WHERE") {
                "Filtering JIRA demands".to_string()
            } else {
                "Querying JIRA demands".to_string()
            }
        }
        Some(ToolName::GetDataStatus) => "Checking data status".to_string(),
        Some(ToolName::ForceRefreshFreshservice) => "Refreshing Freshservice data".to_string(),
        Some(ToolName::ForceRefreshJira) => "Refreshing JIRA data".to_string(),
        Some(ToolName::GetSingleTicket) => "Fetching a single ticket".to_string(),
        Some(ToolName::GetCurrentTime) => "Getting the current time".to_string(),
        None => format!("Calling {}", name),
    }
}

/// Argument schemas published to the model, one entry per registered tool.
pub fn tool_schemas() -> Vec<Value> {
    let no_args = json!({ "type": "object", "properties": {} });
    let sql_arg = json!({
        "type": "object",
        "properties": {
            "sql": {
                "type": "string",
                "description": "SQL query string using 'tickets' as the table name"
            }
        },
        "required": ["sql"]
    });
    vec![
        json!({
            "name": ToolName::ForceRefreshFreshservice.as_str(),
            "description": "Force refresh Freshservice data from the API, bypassing cache. \
                Queues a refresh request and returns immediately; the actual refresh \
                happens asynchronously in the background.",
            "input_schema": no_args.clone(),
        }),
        json!({
            "name": ToolName::ForceRefreshJira.as_str(),
            "description": "Force refresh JIRA data from the API, bypassing cache. \
                Queues a refresh request and returns immediately; the actual refresh \
                happens asynchronously in the background.",
            "input_schema": no_args.clone(),
        }),
        json!({
            "name": ToolName::GetDataStatus.as_str(),
            "description": "Get the current status of cached data for both JIRA and \
                Freshservice: record counts, cache ages, last refresh times, and the \
                refresh queue state.",
            "input_schema": no_args.clone(),
        }),
        json!({
            "name": ToolName::GetSingleTicket.as_str(),
            "description": "Retrieve a single Freshservice ticket by its ID, including \
                conversations, directly from the live API.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "ticket_id": { "type": "string", "description": "The ID of the ticket to retrieve" }
                },
                "required": ["ticket_id"]
            },
        }),
        json!({
            "name": ToolName::QueryFreshserviceTickets.as_str(),
            "description": "Execute a SQL query on the Freshservice tickets table. The table \
                is referenced as 'tickets'. Examples: SELECT COUNT(*) FROM tickets; \
                SELECT * FROM tickets WHERE status = 'Open'; \
                SELECT ticket_id, subject, status FROM tickets LIMIT 10.",
            "input_schema": sql_arg.clone(),
        }),
        json!({
            "name": ToolName::QueryJiraDemands.as_str(),
            "description": "Execute a SQL query on the JIRA demands table. The table is \
                referenced as 'tickets'. Examples: SELECT COUNT(*) FROM tickets; \
                SELECT * FROM tickets WHERE Status = 'In Progress'.",
            "input_schema": sql_arg,
        }),
        json!({
            "name": ToolName::GetCurrentTime.as_str(),
            "description": "Retrieve the current Coordinated Universal Time (UTC) as an \
                ISO format string.",
            "input_schema": no_args,
        }),
    ]
}

/// Result text of one dispatched tool. The error flag marks outcomes that
/// should be surfaced as failures without aborting the round.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReply {
    pub text: String,
    pub is_error: bool,
}

impl ToolReply {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    fn err(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Dispatch seam between the orchestrator and the tool implementations;
/// tests substitute scripted dispatchers.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    fn schemas(&self) -> Vec<Value>;

    async fn dispatch(&self, name: &str, args: &Value) -> ToolReply;
}

/// The live tool registry, reading the cache store and enqueueing into the
/// refresh scheduler.
pub struct Toolbox {
    cache: Arc<CacheStore>,
    scheduler: Arc<RefreshScheduler>,
    freshservice: Arc<dyn TicketSource>,
}

impl Toolbox {
    pub fn new(
        cache: Arc<CacheStore>,
        scheduler: Arc<RefreshScheduler>,
        freshservice: Arc<dyn TicketSource>,
    ) -> Self {
        Self {
            cache,
            scheduler,
            freshservice,
        }
    }

    /// Refresh tools only enqueue; the caller gets an acknowledgement, not
    /// the refreshed data.
    fn enqueue_refresh(&self, source: SourceId) -> ToolReply {
        match self.scheduler.enqueue(source, true) {
            EnqueueResult::Accepted { position } => ToolReply::ok(format!(
                "{} refresh queued (position: {}). Check status with get_data_status().",
                source, position
            )),
            EnqueueResult::AlreadyPending => {
                ToolReply::ok(format!("{} refresh already queued", source))
            }
        }
    }

    async fn data_status(&self) -> ToolReply {
        let status = json!({
            "jira": self.cache.source(SourceId::Jira).status().await,
            "freshservice": self.cache.source(SourceId::Freshservice).status().await,
            "queue": self.scheduler.queue_status(),
            "current_time": Utc::now().to_rfc3339(),
        });
        ToolReply::ok(status.to_string())
    }

    async fn run_query(&self, source: SourceId, args: &Value) -> ToolReply {
        let Some(sql) = args.get("sql").and_then(|v| v.as_str()) else {
            return ToolReply::err(json!({"error": "missing required argument 'sql'"}).to_string());
        };
        info!("Tool query on {} data: {}", source, sql);
        let snapshot = self.cache.source(source).read().await;
        // The query runs against the cloned snapshot with no lock held.
        match query::execute(&snapshot, sql) {
            Ok(rows) => ToolReply::ok(rows),
            Err(e) => {
                warn!("Query error on {} data: {:#}", source, e);
                ToolReply::err(json!({ "error": e.to_string() }).to_string())
            }
        }
    }

    async fn single_ticket(&self, args: &Value) -> ToolReply {
        let ticket_id = match args.get("ticket_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return ToolReply::err(
                    json!({"error": "missing required argument 'ticket_id'"}).to_string(),
                );
            }
        };
        match self.freshservice.fetch_record(&ticket_id).await {
            Ok(record) => ToolReply::ok(record.to_string()),
            Err(e) => ToolReply::err(json!({ "error": e.to_string() }).to_string()),
        }
    }
}

#[async_trait]
impl ToolDispatch for Toolbox {
    fn schemas(&self) -> Vec<Value> {
        tool_schemas()
    }

    /// Total match over the registry with an explicit unknown arm; unknown
    /// names yield a structured outcome, never a crash.
    async fn dispatch(&self, name: &str, args: &Value) -> ToolReply {
        let Some(tool) = ToolName::parse(name) else {
            warn!("Tool {} not found", name);
            return ToolReply::err(format!("Tool {} not found", name));
        };
        match tool {
            ToolName::ForceRefreshFreshservice => self.enqueue_refresh(SourceId::Freshservice),
            ToolName::ForceRefreshJira => self.enqueue_refresh(SourceId::Jira),
            ToolName::GetDataStatus => self.data_status().await,
            ToolName::GetSingleTicket => self.single_ticket(args).await,
            ToolName::QueryFreshserviceTickets => {
                self.run_query(SourceId::Freshservice, args).await
            }
            ToolName::QueryJiraDemands => self.run_query(SourceId::Jira, args).await,
            ToolName::GetCurrentTime => ToolReply::ok(Utc::now().to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::refresh::SchedulerConfig;
    use anyhow::Result;
    use crate::core::cache::Row;
    use std::time::Duration;

    struct NoSource(SourceId);

    #[async_trait]
    impl TicketSource for NoSource {
        fn id(&self) -> SourceId {
            self.0
        }
        async fn fetch_table(&self) -> Result<Vec<Row>> {
            anyhow::bail!("no upstream in tests")
        }
        async fn fetch_record(&self, record_id: &str) -> Result<Value> {
            Ok(json!({ "ticket": { "id": record_id } }))
        }
    }

    async fn toolbox(dir: &std::path::Path) -> Toolbox {
        let cache = Arc::new(
            CacheStore::open(dir, Duration::from_secs(60), Duration::from_secs(60)).unwrap(),
        );
        let scheduler = RefreshScheduler::new(
            cache.clone(),
            Arc::new(NoSource(SourceId::Jira)),
            Arc::new(NoSource(SourceId::Freshservice)),
            SchedulerConfig {
                seed_initial_load: false,
                ..SchedulerConfig::default()
            },
        );
        Toolbox::new(cache, scheduler, Arc::new(NoSource(SourceId::Freshservice)))
    }

    #[tokio::test]
    async fn unknown_tool_yields_structured_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tb = toolbox(dir.path()).await;
        let reply = tb.dispatch("summon_dragon", &json!({})).await;
        assert!(reply.is_error);
        assert!(reply.text.contains("not found"));
    }

    #[tokio::test]
    async fn refresh_tool_acknowledges_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let tb = toolbox(dir.path()).await;
        let first = tb.dispatch("force_refresh_jira", &json!({})).await;
        assert!(!first.is_error);
        assert!(first.text.contains("queued"));
        let second = tb.dispatch("force_refresh_jira", &json!({})).await;
        assert!(second.text.contains("already queued"));
    }

    #[tokio::test]
    async fn query_tool_reports_errors_as_structured_payload() {
        let dir = tempfile::tempdir().unwrap();
        let tb = toolbox(dir.path()).await;
        let reply = tb
            .dispatch("query_jira_demands", &json!({"sql": "SELECT *"}))
            .await;
        assert!(reply.is_error);
        let parsed: Value = serde_json::from_str(&reply.text).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("SQL error"));
    }

    #[tokio::test]
    async fn query_tool_counts_empty_table_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tb = toolbox(dir.path()).await;
        let reply = tb
            .dispatch(
                "query_fresh_service_tickets",
                &json!({"sql": "SELECT COUNT(*) AS n FROM tickets"}),
            )
            .await;
        assert!(!reply.is_error);
        assert_eq!(reply.text, r#"[{"n":0}]"#);
    }

    #[tokio::test]
    async fn data_status_includes_both_sources_and_queue() {
        let dir = tempfile::tempdir().unwrap();
        let tb = toolbox(dir.path()).await;
        tb.dispatch("force_refresh_fresh_service", &json!({})).await;
        let reply = tb.dispatch("get_data_status", &json!({})).await;
        let parsed: Value = serde_json::from_str(&reply.text).unwrap();
        assert_eq!(parsed["jira"]["status"], "no_data");
        assert_eq!(parsed["freshservice"]["record_count"], 0);
        assert_eq!(parsed["queue"]["size"], 1);
        assert!(parsed["current_time"].is_string());
    }

    #[tokio::test]
    async fn single_ticket_goes_to_the_live_source() {
        let dir = tempfile::tempdir().unwrap();
        let tb = toolbox(dir.path()).await;
        let reply = tb
            .dispatch("get_single_ticket", &json!({"ticket_id": 19382}))
            .await;
        assert!(!reply.is_error);
        assert!(reply.text.contains("19382"));
    }

    #[test]
    fn every_registered_tool_has_a_schema() {
        let schemas = tool_schemas();
        assert_eq!(schemas.len(), ToolName::ALL.len());
        for tool in ToolName::ALL {
            assert!(
                schemas.iter().any(|s| s["name"] == tool.as_str()),
                "missing schema for {}",
                tool.as_str()
            );
        }
    }

    #[test]
    fn tool_name_round_trips_through_parse() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
        assert_eq!(ToolName::parse("nope"), None);
    }
}
