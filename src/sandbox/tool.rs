//! Agent tool boundary.
//!
//! The agent layer gets exactly one capability: `sql_query`. This module
//! provides its JSON function descriptor and a dispatcher for tool calls
//! whose arguments arrive as JSON.

use super::{QueryOutcome, QuerySandbox, RejectRule, Rejection};
use crate::config::MAX_QUERY_ROWS;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SQL_QUERY_TOOL: &str = "sql_query";

/// Function descriptors in the common `{"type": "function", ...}` shape.
pub fn tool_definitions(default_limit: usize) -> Vec<Value> {
    vec![json!({
        "type": "function",
        "function": {
            "name": SQL_QUERY_TOOL,
            "description": "Run one read-only SQL SELECT statement against the activity database. \
                            Mutating and administrative statements are rejected.",
            "parameters": {
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "A single SELECT statement, optionally with a WITH prefix."
                    },
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_QUERY_ROWS,
                        "default": default_limit
                    }
                },
                "required": ["sql"]
            }
        }
    })]
}

#[derive(Debug, Deserialize)]
struct SqlQueryArgs {
    sql: String,
    #[serde(default)]
    limit: Option<usize>,
}

/// Dispatch a tool call by name and return its JSON result.
///
/// Unknown tools and malformed arguments produce an `{"status": "error"}`
/// object rather than an `Err`, so the agent can see and correct them.
pub fn handle_tool_call(sandbox: &QuerySandbox, name: &str, arguments: &Value) -> Value {
    if name != SQL_QUERY_TOOL {
        return json!({
            "status": "error",
            "error": format!("unknown tool: {name}"),
        });
    }

    let args: SqlQueryArgs = match serde_json::from_value(arguments.clone()) {
        Ok(args) => args,
        Err(e) => {
            return outcome_json(&QueryOutcome::Rejected(Rejection::new(
                RejectRule::Syntax,
                format!("invalid arguments: {e}"),
            )))
        }
    };

    match sandbox.execute(&args.sql, args.limit) {
        Ok(outcome) => outcome_json(&outcome),
        Err(e) => json!({
            "status": "error",
            "error": e.to_string(),
        }),
    }
}

fn outcome_json(outcome: &QueryOutcome) -> Value {
    serde_json::to_value(outcome).unwrap_or_else(|e| {
        json!({
            "status": "error",
            "error": e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_single_tool_is_exposed() {
        let tools = tool_definitions(200);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], SQL_QUERY_TOOL);
        assert_eq!(tools[0]["function"]["parameters"]["properties"]["limit"]["maximum"], 10_000);
        assert_eq!(tools[0]["function"]["parameters"]["properties"]["limit"]["default"], 200);
    }

    #[test]
    fn test_tool_call_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let _store = Store::open_initialized(&path).unwrap();
        let sandbox = QuerySandbox::new(&path);

        let ok = handle_tool_call(
            &sandbox,
            SQL_QUERY_TOOL,
            &json!({"sql": "SELECT COUNT(*) AS n FROM sessions", "limit": 5}),
        );
        assert_eq!(ok["status"], "accepted");
        assert_eq!(ok["rows"][0]["n"], 0);
        assert_eq!(ok["truncated"], false);

        let rejected = handle_tool_call(
            &sandbox,
            SQL_QUERY_TOOL,
            &json!({"sql": "DELETE FROM sessions"}),
        );
        assert_eq!(rejected["status"], "rejected");
        assert_eq!(rejected["rule"], "not_select");

        let unknown = handle_tool_call(&sandbox, "schema_text", &json!({}));
        assert_eq!(unknown["status"], "error");

        let malformed = handle_tool_call(&sandbox, SQL_QUERY_TOOL, &json!({"query": "SELECT 1"}));
        assert_eq!(malformed["status"], "rejected");
    }
}
