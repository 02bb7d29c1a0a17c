//! Executor backed by operating system processes.

use keel_platform::{KeelError, KeelResult};
use keel_proto::ssh::Executor;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Status reported for a child killed by a signal.
const SIGNALED_STATUS: i32 = 255;

/// Spawns `argv[0]` with the remaining arguments.
///
/// The channel environment is layered over the daemon's own, so `PATH`
/// still resolves `sh`.
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        argv: &[String],
        env: &BTreeMap<String, String>,
        stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> KeelResult<i32> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| KeelError::Config("Empty argument vector".to_string()))?;

        let mut input = Vec::new();
        stdin.read_to_end(&mut input)?;

        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        debug!(program = %program, pid = child.id(), "spawned");

        // feed stdin while the pipes drain, or a chatty child blocks
        let child_stdin = child.stdin.take();
        let output = thread::scope(|s| {
            s.spawn(|| {
                if let Some(mut pipe) = child_stdin {
                    // the child may exit without reading everything
                    let _ = pipe.write_all(&input);
                }
            });
            child.wait_with_output()
        })?;

        stdout.write_all(&output.stdout)?;
        stderr.write_all(&output.stderr)?;

        let status = output.status.code().unwrap_or(SIGNALED_STATUS);
        debug!(program = %program, status, "exited");
        Ok(status)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn run(command: &str, env: &BTreeMap<String, String>) -> (i32, String, String) {
        let mut stdin = command.as_bytes();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = ProcessExecutor
            .execute(&["sh".to_string()], env, &mut stdin, &mut stdout, &mut stderr)
            .unwrap();
        (
            status,
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
        )
    }

    #[test]
    fn test_runs_shell_from_stdin() {
        let (status, out, err) = run("echo hello", &BTreeMap::new());
        assert_eq!(status, 0);
        assert_eq!(out, "hello\n");
        assert_eq!(err, "");
    }

    #[test]
    fn test_status_and_stderr() {
        let (status, out, err) = run("echo oops >&2; exit 3", &BTreeMap::new());
        assert_eq!(status, 3);
        assert_eq!(out, "");
        assert_eq!(err, "oops\n");
    }

    #[test]
    fn test_environment_is_passed() {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "vt100".to_string());
        let (_, out, _) = run("echo $TERM", &env);
        assert_eq!(out, "vt100\n");
    }

    #[test]
    fn test_empty_argv() {
        let result = ProcessExecutor.execute(
            &[],
            &BTreeMap::new(),
            &mut std::io::empty(),
            &mut std::io::sink(),
            &mut std::io::sink(),
        );
        assert!(matches!(result, Err(KeelError::Config(_))));
    }

    #[test]
    fn test_missing_program() {
        let result = ProcessExecutor.execute(
            &["/nonexistent/keel-test-program".to_string()],
            &BTreeMap::new(),
            &mut std::io::empty(),
            &mut std::io::sink(),
            &mut std::io::sink(),
        );
        assert!(matches!(result, Err(KeelError::Io(_))));
    }
}
