//! Demonstration of the mousetrace capture pipeline.
//!
//! This example shows how to:
//! 1. Drive a capture service with synthetic input (no OS permission needed)
//! 2. Switch the foreground application mid-session
//! 3. Summarize what was recorded
//! 4. Query the database through the read-only sandbox
//!
//! Run with: cargo run --example capture_demo

use std::time::Duration;

use mousetrace::{
    collector::{
        AppIdentity, InputEvent, KeyClass, KeyDirection, KeyboardEvent, ManualProbe, ManualSource,
        MouseButton, PointerEvent,
    },
    sandbox::{handle_tool_call, QueryOutcome, QuerySandbox, SQL_QUERY_TOOL},
    summary, CaptureService, Config,
};

fn main() {
    println!("mousetrace - Capture Demo");
    println!("=========================");
    println!();

    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error creating temp dir: {e}");
            return;
        }
    };
    let config = Config {
        db_path: dir.path().join("demo.db"),
        flush_interval: Duration::from_millis(100),
        ..Config::default()
    };

    let source = ManualSource::new();
    let input = source.handle();
    let probe = ManualProbe::new(Some(AppIdentity::new("com.example.editor", "Editor")));

    let service = match CaptureService::start(&config, Box::new(source), Box::new(probe.clone())) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Error starting capture: {e}");
            return;
        }
    };
    println!("Capturing to {}", config.db_path.display());
    println!();

    // Two seconds of typing and pointer movement in the editor
    for i in 0..200 {
        let t = i as f64;
        input.push(InputEvent::Pointer(PointerEvent::movement(t * 3.0, 200.0 + t)));
        if i % 10 == 0 {
            input.push(InputEvent::Keyboard(KeyboardEvent::new(
                KeyClass::Letter,
                KeyDirection::Down,
            )));
            input.push(InputEvent::Keyboard(KeyboardEvent::new(
                KeyClass::Letter,
                KeyDirection::Up,
            )));
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("Switching to the browser...");
    probe.set(Some(AppIdentity::new("com.example.browser", "Browser")));
    std::thread::sleep(Duration::from_millis(300));

    for _ in 0..3 {
        input.push(InputEvent::Pointer(PointerEvent::click(640.0, 480.0, MouseButton::Left, true)));
        input.push(InputEvent::Pointer(PointerEvent::click(640.0, 480.0, MouseButton::Left, false)));
        std::thread::sleep(Duration::from_millis(50));
    }
    input.push(InputEvent::Pointer(PointerEvent::scroll(640.0, 480.0, 0.0, -3.0)));

    println!("Stopping capture...");
    let report = match service.stop() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error stopping capture: {e}");
            return;
        }
    };
    println!();
    println!("{}", report.stats);
    println!();

    match summary::summarize(&config.db_path) {
        Ok(summary) => {
            println!("=== Summary ===");
            print!("{summary}");
            println!();
        }
        Err(e) => eprintln!("Error summarizing: {e}"),
    }

    let sandbox = QuerySandbox::from_config(&config);
    for sql in [
        "SELECT app_name, moves, share_pct FROM vw_moves_share_by_app",
        "DELETE FROM sessions",
    ] {
        println!("> {sql}");
        match sandbox.execute(sql, Some(10)) {
            Ok(QueryOutcome::Accepted(result)) => {
                for row in &result.rows {
                    println!("  {}", serde_json::Value::Object(row.clone()));
                }
            }
            Ok(QueryOutcome::Rejected(rejection)) => println!("  {rejection}"),
            Err(e) => eprintln!("  Error: {e}"),
        }
    }
    println!();

    // The same query as an agent tool call
    let result = handle_tool_call(
        &sandbox,
        SQL_QUERY_TOOL,
        &serde_json::json!({"sql": "SELECT id, end_reason FROM sessions"}),
    );
    println!("Tool call result: {result}");
    println!();
    println!("Demo complete!");
}
