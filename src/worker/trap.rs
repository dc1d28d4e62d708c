//! Failure notification.
//!
//! The trap command is fire-and-forget: it runs detached in its own process
//! group with no stdin, and a background task reaps it so it never lingers
//! as a zombie. Nothing the trap does (hanging, failing, never starting)
//! reaches the dispatch loop beyond a log line.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::types::EntryId;

/// Starts `trap` with the entry id and failure code appended.
///
/// Must be called from within a tokio runtime.
pub fn fire(trap: &[String], num: EntryId, code: i32) {
    let Some((program, args)) = trap.split_first() else {
        return;
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(num.to_string())
        .arg(code.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(false);
    #[cfg(unix)]
    cmd.process_group(0);

    match cmd.spawn() {
        Ok(mut child) => {
            debug!(num = %num, code, pid = child.id(), "Trap started");
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if !status.success() => {
                        warn!(num = %num, status = %status, "Trap command failed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(num = %num, error = %e, "Failed to reap trap command"),
                }
            });
        }
        Err(e) => warn!(num = %num, program = %program, error = %e, "Failed to start trap command"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn wait_for(path: &std::path::Path) -> String {
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(path)
                && !s.is_empty()
            {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("trap never wrote {}", path.display());
    }

    #[tokio::test]
    async fn trap_receives_id_and_code() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("trap.out");
        let trap = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo \"$1 $2\" > {}", out.display()),
            "trap".to_string(),
        ];

        fire(&trap, EntryId(42), 7);
        assert_eq!(wait_for(&out).await.trim(), "42 7");
    }

    #[tokio::test]
    async fn missing_trap_program_is_harmless() {
        fire(&["/nonexistent/trap".to_string()], EntryId(1), 1);
        fire(&[], EntryId(1), 1);
    }
}
