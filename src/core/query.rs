use anyhow::{Result, anyhow, bail};
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde_json::Value;

use super::cache::{Row, Snapshot};

/// The fixed alias every ad-hoc query references, regardless of which
/// source's table it targets.
pub const TABLE_ALIAS: &str = "tickets";

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column set: union of row keys, in first-seen order. An empty table still
/// materializes the alias with a single column so aggregate queries return
/// rows instead of erroring.
fn collect_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    if columns.is_empty() {
        columns.push("ticket_id".to_string());
    }
    columns
}

fn bind_value(value: Option<&Value>) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(*b as i64),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        // Lists and nested objects stay queryable as JSON text.
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Execute a read-only SQL query against a snapshot, returning the result
/// rows as a JSON array string. The engine is read-only by construction:
/// the connection is flipped to `query_only` before user SQL runs, and any
/// statement that is not read-only is rejected before execution.
pub fn execute(snapshot: &Snapshot, sql: &str) -> Result<String> {
    let conn = Connection::open_in_memory()?;
    let columns = collect_columns(&snapshot.rows);

    let create = format!(
        "CREATE TABLE {} ({})",
        quote_ident(TABLE_ALIAS),
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    conn.execute(&create, [])?;

    if !snapshot.rows.is_empty() {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert = format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(TABLE_ALIAS),
            placeholders
        );
        let mut stmt = conn.prepare(&insert)?;
        for row in &snapshot.rows {
            let params: Vec<rusqlite::types::Value> =
                columns.iter().map(|c| bind_value(row.get(c))).collect();
            stmt.execute(rusqlite::params_from_iter(params))?;
        }
    }

    conn.pragma_update(None, "query_only", true)?;

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| anyhow!("SQL error: {}", e))?;
    if !stmt.readonly() {
        bail!("Only read-only SELECT queries are supported");
    }

    let column_names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([]).map_err(|e| anyhow!("SQL error: {}", e))?;
    let mut results: Vec<Value> = Vec::new();
    while let Some(row) = rows.next().map_err(|e| anyhow!("SQL error: {}", e))? {
        let mut out = serde_json::Map::new();
        for (i, name) in column_names.iter().enumerate() {
            out.insert(name.clone(), column_to_json(row.get_ref(i)?));
        }
        results.push(Value::Object(out));
    }

    Ok(serde_json::to_string(&results)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(rows: Vec<serde_json::Value>) -> Snapshot {
        Snapshot {
            rows: rows
                .into_iter()
                .map(|v| v.as_object().cloned().expect("object row"))
                .collect(),
            refreshed_at: None,
        }
    }

    #[test]
    fn count_on_empty_table_returns_zero_not_error() {
        let snap = Snapshot::default();
        let out = execute(&snap, "SELECT COUNT(*) AS n FROM tickets").unwrap();
        assert_eq!(out, r#"[{"n":0}]"#);
    }

    #[test]
    fn select_star_on_empty_table_returns_empty_array() {
        let snap = Snapshot::default();
        let out = execute(&snap, "SELECT * FROM tickets").unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn filters_rows_by_column_value() {
        let snap = snapshot(vec![
            json!({"ticket_id": 1, "status": "Open", "subject": "vpn down"}),
            json!({"ticket_id": 2, "status": "Closed", "subject": "done"}),
        ]);
        let out = execute(
            &snap,
            "SELECT ticket_id, subject FROM tickets WHERE status = 'Open'",
        )
        .unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["ticket_id"], 1);
        assert_eq!(parsed[0]["subject"], "vpn down");
    }

    #[test]
    fn query_without_table_alias_is_a_structured_error() {
        let snap = snapshot(vec![json!({"ticket_id": 1})]);
        let err = execute(&snap, "SELECT *").unwrap_err();
        assert!(err.to_string().contains("SQL error"));
    }

    #[test]
    fn unknown_table_name_is_an_error() {
        let snap = snapshot(vec![json!({"ticket_id": 1})]);
        assert!(execute(&snap, "SELECT * FROM df").is_err());
    }

    #[test]
    fn mutating_statements_are_rejected() {
        let snap = snapshot(vec![json!({"ticket_id": 1})]);
        assert!(execute(&snap, "DELETE FROM tickets").is_err());
        assert!(execute(&snap, "INSERT INTO tickets VALUES (2)").is_err());
        assert!(execute(&snap, "DROP TABLE tickets").is_err());
    }

    #[test]
    fn list_valued_fields_are_queryable_as_json_text() {
        let snap = snapshot(vec![json!({"ticket_id": 1, "tags": ["vpn", "network"]})]);
        let out = execute(&snap, "SELECT tags FROM tickets").unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["tags"], r#"["vpn","network"]"#);
    }

    #[test]
    fn columns_union_across_ragged_rows() {
        let snap = snapshot(vec![
            json!({"a": 1}),
            json!({"a": 2, "b": "extra"}),
        ]);
        let out = execute(&snap, "SELECT a, b FROM tickets ORDER BY a").unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["b"], serde_json::Value::Null);
        assert_eq!(parsed[1]["b"], "extra");
    }
}
