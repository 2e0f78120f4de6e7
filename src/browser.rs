use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Delay before opening, so the listener is accepting by the time the
/// browser connects.
pub const OPEN_DELAY: Duration = Duration::from_secs(1);

/// Command line that opens `url` in the platform's default browser.
pub fn open_command(url: &str) -> (&'static str, Vec<String>) {
    if cfg!(target_os = "windows") {
        (
            "rundll32",
            vec!["url.dll,FileProtocolHandler".to_string(), url.to_string()],
        )
    } else if cfg!(target_os = "macos") {
        ("open", vec![url.to_string()])
    } else {
        ("xdg-open", vec![url.to_string()])
    }
}

/// Open `url` after [`OPEN_DELAY`]. Failure is logged and otherwise ignored.
pub fn spawn_open(url: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(OPEN_DELAY).await;
        let (program, args) = open_command(&url);
        let result = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match result {
            Ok(_) => tracing::info!(%url, "opened browser"),
            Err(e) => tracing::warn!(%url, error = %e, "could not open browser; visit the URL manually"),
        }
    })
}
