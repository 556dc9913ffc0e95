//! Scripts sent to `bash -s` stop at the first failing line
//!
//! The same script text goes over ssh in a real run; here it is fed to a
//! local bash so the fail-fast behaviour is checked without a remote host.

use std::time::Duration;

use e2e_runner::exec::{CommandRunner, CommandSpec, LocalRunner};
use e2e_runner::remote::compose_script;
use tokio_util::sync::CancellationToken;

fn bash(script: String) -> CommandSpec {
    CommandSpec::new("bash")
        .arg("-s")
        .stdin(script)
        .timeout(Duration::from_secs(30))
}

#[tokio::test]
async fn a_failing_line_stops_the_script() {
    let dir = tempfile::tempdir().unwrap();
    let before = dir.path().join("before");
    let after = dir.path().join("after");
    let script = compose_script(
        &[
            format!("touch {}", before.display()),
            "false".to_string(),
            format!("touch {}", after.display()),
        ],
        None,
    );

    let output = LocalRunner::new()
        .run(&bash(script), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!output.success());
    assert!(before.exists());
    assert!(!after.exists());
}

#[tokio::test]
async fn a_failure_inside_a_pipeline_stops_the_script() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let script = compose_script(
        &[
            "false | cat".to_string(),
            format!("touch {}", marker.display()),
        ],
        None,
    );

    let output = LocalRunner::new()
        .run(&bash(script), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!output.success());
    assert!(!marker.exists());
}

#[tokio::test]
async fn the_script_runs_in_the_requested_directory() {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().to_string_lossy().to_string();
    let script = compose_script(&["pwd"], Some(cwd.as_str()));

    let output = LocalRunner::new()
        .run(&bash(script), &CancellationToken::new())
        .await
        .unwrap();

    assert!(output.success());
    let printed = std::fs::canonicalize(output.stdout_trimmed()).unwrap();
    assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
}

#[tokio::test]
async fn unset_variables_are_errors() {
    let output = LocalRunner::new()
        .run(
            &bash(compose_script(&["echo \"$E2E_RUNNER_SURELY_UNSET\""], None)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!output.success());
}
