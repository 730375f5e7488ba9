//! Integration tests for the read-only query boundary.

use mousetrace::sandbox::{handle_tool_call, tool_definitions, SQL_QUERY_TOOL};
use mousetrace::store::Store;
use mousetrace::{QueryOutcome, QuerySandbox, RejectRule};
use serde_json::json;

struct Fixture {
    _dir: tempfile::TempDir,
    store: Store,
    sandbox: QuerySandbox,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sandbox.db");
    let store = Store::open_initialized(&path).unwrap();
    store
        .connection()
        .execute_batch(
            "INSERT INTO sessions (id, started_at, ended_at, end_reason, run_id)
                 VALUES (1, 10.0, 50.0, 'explicit-stop', 'r');
             INSERT INTO applications (id, app_key, display_name, first_seen_at)
                 VALUES (1, 'term', 'Terminal', 10.0);
             INSERT INTO key_events (session_id, application_id, key_class, direction, ts)
                 VALUES (1, 1, 'letter', 'down', 11.0), (1, 1, 'letter', 'down', 12.0);",
        )
        .unwrap();
    let sandbox = QuerySandbox::new(&path);
    Fixture {
        _dir: dir,
        store,
        sandbox,
    }
}

fn session_count(store: &Store) -> i64 {
    store
        .connection()
        .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
        .unwrap()
}

fn rule_of(outcome: &QueryOutcome) -> Option<RejectRule> {
    outcome.rejection().map(|r| r.rule)
}

#[test]
fn test_select_all_sessions_succeeds() {
    let f = fixture();
    match f.sandbox.execute("SELECT * FROM sessions", None).unwrap() {
        QueryOutcome::Accepted(rows) => {
            assert_eq!(rows.rows.len(), 1);
            assert!(rows.columns.contains(&"end_reason".to_string()));
            assert_eq!(rows.rows[0]["end_reason"], "explicit-stop");
        }
        QueryOutcome::Rejected(r) => panic!("unexpected rejection: {r}"),
    }
}

#[test]
fn test_delete_is_rejected_and_nothing_changes() {
    let f = fixture();
    let outcome = f.sandbox.execute("DELETE FROM sessions", None).unwrap();
    assert!(!outcome.is_accepted());
    assert_eq!(rule_of(&outcome), Some(RejectRule::NotSelect));
    assert_eq!(session_count(&f.store), 1);
}

#[test]
fn test_multi_statement_is_rejected() {
    let f = fixture();
    let outcome = f
        .sandbox
        .execute("SELECT 1; DROP TABLE sessions;", None)
        .unwrap();
    assert_eq!(rule_of(&outcome), Some(RejectRule::MultipleStatements));
    assert_eq!(session_count(&f.store), 1);
}

#[test]
fn test_cte_passes_through() {
    let f = fixture();
    match f
        .sandbox
        .execute("WITH x AS (SELECT 1) SELECT * FROM x", None)
        .unwrap()
    {
        QueryOutcome::Accepted(rows) => {
            assert_eq!(rows.rows.len(), 1);
            assert_eq!(rows.rows[0]["1"], 1);
        }
        QueryOutcome::Rejected(r) => panic!("unexpected rejection: {r}"),
    }
}

#[test]
fn test_views_are_queryable() {
    let f = fixture();
    let QueryOutcome::Accepted(rows) = f
        .sandbox
        .execute("SELECT minute_start, kpm FROM vw_kpm_per_minute", None)
        .unwrap()
    else {
        panic!("view query rejected");
    };
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0]["minute_start"], 0);
    assert_eq!(rows.rows[0]["kpm"], 2);
}

#[test]
fn test_agent_tool_boundary() {
    let f = fixture();
    let tools = tool_definitions(200);
    assert_eq!(tools.len(), 1);

    let result = handle_tool_call(
        &f.sandbox,
        SQL_QUERY_TOOL,
        &json!({"sql": "SELECT app_name, clicks FROM vw_clicks_by_app"}),
    );
    assert_eq!(result["status"], "accepted");
    assert_eq!(result["rows"].as_array().map(Vec::len), Some(0));

    let result = handle_tool_call(
        &f.sandbox,
        SQL_QUERY_TOOL,
        &json!({"sql": "ATTACH DATABASE 'x.db' AS x"}),
    );
    assert_eq!(result["status"], "rejected");
    assert_eq!(session_count(&f.store), 1);
}
