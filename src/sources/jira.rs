use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::TicketSource;
use crate::config::JiraConfig;
use crate::core::cache::{Row, SourceId};

const BATCH_SIZE: u32 = 100;
const MAX_RETRIES: u32 = 3;

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    issues: Vec<Issue>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct Issue {
    key: String,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
struct FieldDef {
    id: String,
    name: String,
}

/// Jira Cloud client over the v3 REST API. Issues come from the JQL search
/// endpoint with token pagination; columns are named after the instance's
/// field catalog.
pub struct JiraSource {
    client: Client,
    config: JiraConfig,
}

impl JiraSource {
    pub fn new(config: JiraConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn credentials(&self) -> Result<(&str, &str, &str)> {
        match (
            self.config.server.as_deref(),
            self.config.email.as_deref(),
            self.config.api_token.as_deref(),
        ) {
            (Some(server), Some(email), Some(token)) => {
                Ok((server.trim_end_matches('/'), email, token))
            }
            _ => bail!("Missing required JIRA environment variables"),
        }
    }

    async fn get_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let (_, email, token) = self.credentials()?;
        let mut attempt = 0;
        loop {
            let result = async {
                let res = self
                    .client
                    .get(url)
                    .basic_auth(email, Some(token))
                    .query(query)
                    .timeout(Duration::from_secs(60))
                    .send()
                    .await?;
                if !res.status().is_success() {
                    bail!("JIRA API returned {}: {}", res.status(), res.text().await?);
                }
                Ok(res.json::<Value>().await?)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    warn!(
                        "JIRA request failed (attempt {}/{}): {:#}",
                        attempt + 1,
                        MAX_RETRIES,
                        e
                    );
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Field catalog as id -> "Name (id)", keeping distinct custom fields
    /// with the same display name apart.
    async fn field_name_map(&self, server: &str) -> Result<HashMap<String, String>> {
        let url = format!("{}/rest/api/3/field", server);
        let raw = self.get_with_retry(&url, &[]).await?;
        let fields: Vec<FieldDef> =
            serde_json::from_value(raw).context("unexpected JIRA field catalog shape")?;
        Ok(fields
            .into_iter()
            .map(|f| (f.id.clone(), format!("{} ({})", f.name, f.id)))
            .collect())
    }

    async fn fetch_all_issues(&self, server: &str, jql: &str) -> Result<Vec<Issue>> {
        let url = format!("{}/rest/api/3/search/jql", server);
        let mut all_issues = Vec::new();
        let mut next_page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("jql", jql.to_string()),
                ("maxResults", BATCH_SIZE.to_string()),
                ("fields", "*all".to_string()),
            ];
            if let Some(ref token) = next_page_token {
                query.push(("nextPageToken", token.clone()));
            }

            let raw = self.get_with_retry(&url, &query).await?;
            let page: SearchPage =
                serde_json::from_value(raw).context("unexpected JIRA search response shape")?;

            let batch = page.issues.len();
            all_issues.extend(page.issues);
            next_page_token = page.next_page_token;
            info!("Fetched {} JIRA issues so far", all_issues.len());

            if batch < BATCH_SIZE as usize || next_page_token.is_none() {
                break;
            }
        }
        Ok(all_issues)
    }
}

#[async_trait]
impl TicketSource for JiraSource {
    fn id(&self) -> SourceId {
        SourceId::Jira
    }

    async fn fetch_table(&self) -> Result<Vec<Row>> {
        let (server, _, _) = self.credentials()?;
        let server = server.to_string();
        let jql = self
            .config
            .jql
            .clone()
            .context("No JQL query provided")?;
        info!("Using JQL query: {}", jql);

        let field_map = self.field_name_map(&server).await?;
        let issues = self.fetch_all_issues(&server, &jql).await?;
        Ok(shape_issues(issues, &field_map))
    }

    async fn fetch_record(&self, record_id: &str) -> Result<Value> {
        let (server, _, _) = self.credentials()?;
        let url = format!("{}/rest/api/3/issue/{}", server, record_id);
        self.get_with_retry(&url, &[]).await
    }
}

/// Flatten issues into rows keyed by catalog names, with the issue key
/// duplicated under both "Key" and "Jira". Values become strings so the
/// table has a uniform shape regardless of field type.
fn shape_issues(issues: Vec<Issue>, field_map: &HashMap<String, String>) -> Vec<Row> {
    issues
        .into_iter()
        .map(|issue| {
            let mut row = Row::new();
            row.insert("Key".to_string(), Value::String(issue.key.clone()));
            row.insert("Jira".to_string(), Value::String(issue.key));
            for (field_id, value) in issue.fields {
                if let Some(column) = field_map.get(&field_id) {
                    row.insert(column.clone(), Value::String(stringify(&value)));
                }
            }
            row
        })
        .collect()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
