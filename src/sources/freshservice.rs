use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use super::TicketSource;
use crate::config::FreshserviceConfig;
use crate::core::cache::{Row, SourceId};

const PER_PAGE: u32 = 100;

/// Numeric ticket status codes as configured in the service desk.
fn status_label(code: u64) -> Option<&'static str> {
    Some(match code {
        2 => "Open",
        3 => "Pending",
        4 => "Resolved",
        5 => "Closed",
        6 => "Waiting for approvals",
        8 => "Request Evaluation",
        9 => "Procurement Stage",
        10 => "Awaiting External Support",
        11 => "Waiting IT Action",
        12 => "In Development",
        13 => "Under Review",
        14 => "Waiting reviewer approval",
        15 => "Waiting solution approval",
        16 => "Waiting another department action",
        17 => "Modification Needed",
        18 => "Scheduled Action",
        19 => "Pending Internal Processing",
        20 => "Waiting initial approval",
        _ => return None,
    })
}

/// Freshservice v2 API client. Tickets are fetched with requester and
/// department context, joined with the agent list so every row carries the
/// responder's name instead of an opaque id.
pub struct FreshserviceSource {
    client: Client,
    config: FreshserviceConfig,
}

impl FreshserviceSource {
    pub fn new(config: FreshserviceConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        match (self.config.domain.as_deref(), self.config.api_key.as_deref()) {
            (Some(domain), Some(key)) => Ok((domain, key)),
            _ => bail!("Missing required Freshservice environment variables"),
        }
    }

    /// Paginated fetch of one collection endpoint. 429s honor Retry-After
    /// on the same page; any other non-200 fails the whole fetch so the
    /// cached snapshot survives instead of being replaced with a partial
    /// table.
    async fn get_collection(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Vec<Value>> {
        let (domain, api_key) = self.credentials()?;
        let url = format!("https://{}/api/v2/{}", domain, endpoint);
        let mut all_data = Vec::new();
        let mut page: u32 = 1;

        loop {
            let page_str = page.to_string();
            let per_page_str = PER_PAGE.to_string();
            let mut query: Vec<(&str, &str)> = params.to_vec();
            query.push(("page", &page_str));
            query.push(("per_page", &per_page_str));

            let res = self
                .client
                .get(&url)
                .basic_auth(api_key, Some("X"))
                .query(&query)
                .timeout(Duration::from_secs(60))
                .send()
                .await?;

            if res.status().as_u16() == 429 {
                let retry_after = res
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60u64);
                warn!(
                    "Rate limit hit, retrying page {} after {} seconds",
                    page, retry_after
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }
            if !res.status().is_success() {
                bail!(
                    "Freshservice API returned {}: {}",
                    res.status(),
                    res.text().await?
                );
            }

            let has_next = res
                .headers()
                .get("link")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|link| link.contains("rel=\"next\""));

            let body: Value = res.json().await?;
            let page_data = body
                .get(endpoint)
                .and_then(Value::as_array)
                .with_context(|| format!("unexpected response shape for {}", endpoint))?;
            all_data.extend(page_data.iter().cloned());
            info!("Retrieved {} {} so far (page {})", all_data.len(), endpoint, page);

            if !has_next {
                break;
            }
            page += 1;
        }
        Ok(all_data)
    }
}

#[async_trait]
impl TicketSource for FreshserviceSource {
    fn id(&self) -> SourceId {
        SourceId::Freshservice
    }

    async fn fetch_table(&self) -> Result<Vec<Row>> {
        info!("Fetching tickets from Freshservice");
        let tickets = self
            .get_collection(
                "tickets",
                &[("include", "requester,department,requested_for,stats")],
            )
            .await?;
        let agents = self.get_collection("agents", &[]).await?;
        Ok(shape_tickets(tickets, &agents))
    }

    async fn fetch_record(&self, record_id: &str) -> Result<Value> {
        let (domain, api_key) = self.credentials()?;
        let url = format!("https://{}/api/v2/tickets/{}", domain, record_id);
        let res = self
            .client
            .get(&url)
            .basic_auth(api_key, Some("X"))
            .query(&[("include", "conversations")])
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        if !res.status().is_success() {
            bail!(
                "Freshservice API returned {}: {}",
                res.status(),
                res.text().await?
            );
        }
        Ok(res.json().await?)
    }
}

/// Flatten nested objects into dotted columns, the way tabular exports of
/// this API conventionally read (e.g. "requester.email").
fn flatten_into(row: &mut Row, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                let column = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(row, &column, inner);
            }
        }
        // Arrays stay queryable as JSON text rather than exploding rows.
        Value::Array(_) => {
            row.insert(prefix.to_string(), Value::String(value.to_string()));
        }
        other => {
            row.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Shape raw API tickets into the cached table: responder ids resolve to
/// agent names, numeric statuses to labels, the primary key renames to
/// `ticket_id`, and all other raw `*_id` columns drop.
fn shape_tickets(tickets: Vec<Value>, agents: &[Value]) -> Vec<Row> {
    let agent_names: HashMap<u64, String> = agents
        .iter()
        .filter_map(|agent| {
            let id = agent.get("id")?.as_u64()?;
            let first = agent.get("first_name").and_then(Value::as_str).unwrap_or("");
            let last = agent.get("last_name").and_then(Value::as_str).unwrap_or("");
            Some((id, format!("{} {}", first, last).trim().to_string()))
        })
        .collect();

    tickets
        .into_iter()
        .map(|ticket| {
            let mut flat = Row::new();
            flatten_into(&mut flat, "", &ticket);

            let responder_name = flat
                .get("responder_id")
                .and_then(Value::as_u64)
                .and_then(|id| agent_names.get(&id).cloned());

            let mut row = Row::new();
            for (column, value) in flat {
                if column == "id" {
                    row.insert("ticket_id".to_string(), value);
                } else if column == "status" {
                    let label = value
                        .as_u64()
                        .and_then(status_label)
                        .unwrap_or("Unknown")
                        .to_string();
                    row.insert("status".to_string(), Value::String(label));
                } else if !column.ends_with("_id") {
                    row.insert(column, value);
                }
            }
            row.insert(
                "responder_name".to_string(),
                match responder_name {
                    Some(name) => Value::String(name),
                    None => Value::Null,
                },
            );
            row
        })
        .collect()
}
