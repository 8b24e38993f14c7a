//! Basic example of status lines, a progress bar and a PTY subprocess.
//!
//! Run with: cargo run --example basic
//!
//! Try it piped (`2>&1 | cat`) or with `CARGO_TERM_PROGRESS_WHEN=never` to see
//! the plain fallbacks.

use std::time::Duration;

use cargo_plugin_term::{SpawnConfig, StatusMessage, TerminalSession};

#[tokio::main]
async fn main() -> cargo_plugin_term::Result<()> {
    let session = TerminalSession::detect();
    session.info("Checking", "demo v0.1.0");

    // Progress with a known total
    let mut progress = session.start_progress("Indexing", Some(40));
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        progress.inc(1);
    }
    progress.finish(&StatusMessage::success("Indexed", "40 files"));

    // A child with colored output streaming below a pinned header
    let script = r"for i in 1 2 3 4 5 6 7 8; do printf '\033[32mok\033[0m step %s\n' $i; sleep 0.2; done";
    let result = session
        .run(
            SpawnConfig::new("sh")
                .arg("-c")
                .arg(script)
                .status(StatusMessage::info("Running", "steps")),
        )
        .await?;

    if result.success() {
        session.success(
            "Finished",
            &format!("steps in {:.1}s", result.duration.as_secs_f64()),
        );
    } else {
        session.error("Failed", &format!("exit status {}", result.exit_code));
    }

    Ok(())
}
