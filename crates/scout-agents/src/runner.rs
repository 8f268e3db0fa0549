//! Out-of-process script execution.
//!
//! [`PythonRunner`] runs each script with `python3 -I -B` in a fresh
//! temporary directory with a cleared environment and a hard wall-clock
//! timeout. The interpreter runs in its own process group, and the whole
//! group is killed and reaped before the result is returned. An audit-hook prelude blocks network access, process
//! creation and writes outside the working directory.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::ExecutorError;

/// Exit code the prelude uses after reporting a blocked operation.
const VIOLATION_EXIT: i32 = 86;
const VIOLATION_MARKER: &str = "SANDBOX VIOLATION: ";
const SCRIPT_FILE: &str = "main.py";
const PRELUDE_FILE: &str = "_scout_prelude.py";

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// The script raised; carries the traceback.
    Raised(String),
    TimedOut,
    /// The sandbox blocked an operation; carries the audit event.
    SandboxViolation(String),
}

/// Captured result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRun {
    pub status: RunStatus,
    /// Standard output, including output produced before a timeout.
    pub stdout: String,
    pub stderr: String,
}

impl ScriptRun {
    pub fn completed(stdout: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Completed,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn raised(traceback: impl Into<String>) -> Self {
        let traceback = traceback.into();
        Self {
            status: RunStatus::Raised(traceback.clone()),
            stdout: String::new(),
            stderr: traceback,
        }
    }
}

/// Executes extracted scripts.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, source: &str, timeout: Duration) -> Result<ScriptRun, ExecutorError>;
}

/// Capabilities a script is granted. Everything is denied by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub allow_network: bool,
    pub allow_subprocess: bool,
    /// Permit writes outside the script's temporary directory.
    pub allow_external_writes: bool,
}

impl SandboxPolicy {
    /// No audit hook at all.
    pub fn unrestricted() -> Self {
        Self {
            allow_network: true,
            allow_subprocess: true,
            allow_external_writes: true,
        }
    }

    fn prelude(&self) -> String {
        let flag = |b: bool| if b { "True" } else { "False" };
        PRELUDE
            .replace("@ALLOW_NETWORK@", flag(self.allow_network))
            .replace("@ALLOW_SUBPROCESS@", flag(self.allow_subprocess))
            .replace("@ALLOW_WRITES@", flag(self.allow_external_writes))
            .replace("@EXIT@", &VIOLATION_EXIT.to_string())
            .replace("@MARKER@", VIOLATION_MARKER)
            .replace("@SCRIPT@", SCRIPT_FILE)
    }
}

const PRELUDE: &str = r#"import os
import sys

sys.dont_write_bytecode = True
_root = os.path.realpath(os.getcwd())
with open("@SCRIPT@", encoding="utf-8") as _f:
    _code = compile(_f.read(), "@SCRIPT@", "exec")

_NETWORK = ("socket.connect", "socket.bind", "socket.getaddrinfo", "socket.sendto")
_PROCESS = ("subprocess.Popen", "os.system", "os.exec", "os.posix_spawn", "os.spawn", "os.fork", "os.forkpty")
_WRITE_FLAGS = os.O_WRONLY | os.O_RDWR | os.O_APPEND | os.O_CREAT | os.O_TRUNC


def _deny(event):
    sys.stdout.flush()
    sys.stderr.write("@MARKER@" + event + "\n")
    sys.stderr.flush()
    os._exit(@EXIT@)


# event -> (indices of path arguments, indices of dir_fd arguments)
_MUTATIONS = {
    "os.remove": ((0,), (1,)),
    "os.rmdir": ((0,), (1,)),
    "os.rename": ((0, 1), (2, 3)),
    "os.link": ((0, 1), (2, 3)),
    "os.symlink": ((1,), (2,)),
    "os.mkdir": ((0,), (2,)),
    "os.mkfifo": ((0,), (2,)),
    "os.mknod": ((0,), (3,)),
    "os.chmod": ((0,), (2,)),
    "os.chown": ((0,), (3,)),
    "os.chflags": ((0,), ()),
    "os.truncate": ((0,), ()),
    "os.utime": ((0,), (3,)),
    "shutil.rmtree": ((0,), (1,)),
}


def _outside(path):
    if isinstance(path, os.PathLike):
        path = os.fspath(path)
    if isinstance(path, bytes):
        path = os.fsdecode(path)
    if not isinstance(path, str):
        return False
    full = os.path.realpath(path)
    return full != os.devnull and os.path.commonpath([_root, full]) != _root


def _guard(event, args):
    if not @ALLOW_NETWORK@ and event in _NETWORK:
        _deny(event)
    if not @ALLOW_SUBPROCESS@ and event in _PROCESS:
        _deny(event)
    if not @ALLOW_WRITES@ and event == "open":
        path, mode, flags = args
        writing = (isinstance(mode, str) and any(c in mode for c in "wax+")) or (
            isinstance(flags, int) and flags & _WRITE_FLAGS
        )
        if writing and _outside(path):
            _deny("open " + str(path))
    if not @ALLOW_WRITES@ and event in _MUTATIONS:
        paths, dir_fds = _MUTATIONS[event]
        for i in dir_fds:
            if i < len(args) and args[i] is not None:
                _deny(event + " relative to a directory descriptor")
        for i in paths:
            if i < len(args) and _outside(args[i]):
                _deny(event + " " + str(args[i]))


sys.addaudithook(_guard)
del _f
exec(_code, {"__name__": "__main__", "__builtins__": __builtins__})
"#;

/// Sandboxed CPython runner.
#[derive(Debug, Clone)]
pub struct PythonRunner {
    program: PathBuf,
    policy: SandboxPolicy,
}

impl Default for PythonRunner {
    fn default() -> Self {
        Self::new("python3")
    }
}

impl PythonRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            policy: SandboxPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SandboxPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> SandboxPolicy {
        self.policy
    }

    fn command(&self, workdir: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-I")
            .arg("-B")
            .arg(PRELUDE_FILE)
            .current_dir(workdir)
            .env_clear()
            .env("HOME", workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Its own process group, so everything it starts can be killed with it.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd
    }
}

#[async_trait]
impl ScriptRunner for PythonRunner {
    async fn run(&self, source: &str, timeout: Duration) -> Result<ScriptRun, ExecutorError> {
        let started = std::time::Instant::now();
        let workdir = tempfile::Builder::new().prefix("scout-script-").tempdir()?;
        tokio::fs::write(workdir.path().join(SCRIPT_FILE), source).await?;
        tokio::fs::write(workdir.path().join(PRELUDE_FILE), self.policy.prelude()).await?;

        tracing::debug!(
            program = %self.program.display(),
            workdir = %workdir.path().display(),
            timeout_ms = timeout.as_millis() as u64,
            "script started"
        );

        let mut child = self
            .command(workdir.path())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let stdout = OutputReader::spawn(child.stdout.take());
        let stderr = OutputReader::spawn(child.stderr.take());

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => None,
        };
        // Reap whatever is left: the interpreter on timeout, and on any exit
        // the processes it started, which would otherwise hold the pipes open.
        kill_process_group(pid);
        if status.is_none() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }

        let stdout = stdout.finish(OUTPUT_GRACE).await?;
        let stderr = stderr.finish(OUTPUT_GRACE).await?;

        let status = match status {
            None => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "script timed out");
                RunStatus::TimedOut
            }
            Some(status) => classify(status, &stderr),
        };
        tracing::debug!(
            duration_ms = started.elapsed().as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            status = ?status,
            "script finished"
        );

        Ok(ScriptRun {
            status,
            stdout,
            stderr,
        })
    }
}

/// How long to keep draining pipes once the interpreter is gone.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Drains one pipe into a buffer that survives the reader being abandoned.
struct OutputReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl OutputReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return Ok(());
            };
            let mut chunk = [0u8; 8192];
            loop {
                let n = pipe.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]);
            }
        });
        Self { buffer, task }
    }

    /// Wait up to `grace` for end of file, then keep what was read.
    async fn finish(self, grace: Duration) -> Result<String, ExecutorError> {
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => joined.map_err(std::io::Error::other)??,
            Err(_) => {
                task.abort();
                tracing::warn!("script output pipe still open after exit; output truncated");
            }
        }
        let bytes = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(unix)]
fn kill_process_group(leader: Option<u32>) {
    let Some(pgid) = leader.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this
    // child by `process_group(0)`.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_leader: Option<u32>) {}

fn classify(status: ExitStatus, stderr: &str) -> RunStatus {
    if status.success() {
        return RunStatus::Completed;
    }
    if status.code() == Some(VIOLATION_EXIT) {
        if let Some(line) = stderr.lines().find_map(|l| l.strip_prefix(VIOLATION_MARKER)) {
            tracing::warn!(event = %line, "sandbox blocked script operation");
            return RunStatus::SandboxViolation(line.to_string());
        }
    }
    let trace = stderr.trim();
    if trace.is_empty() {
        RunStatus::Raised(format!("script exited with {status}"))
    } else {
        RunStatus::Raised(trace.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python3_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[test]
    fn prelude_substitutes_every_placeholder() {
        let prelude = SandboxPolicy::default().prelude();
        assert!(!prelude.contains('@'));
        assert!(prelude.contains("if not False and event in _NETWORK"));
        let open = SandboxPolicy::unrestricted().prelude();
        assert!(open.contains("if not True and event in _NETWORK"));
    }

    #[tokio::test]
    async fn captures_stdout() {
        if !python3_available() {
            return;
        }
        let run = PythonRunner::default()
            .run("print(6 * 7)", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn exception_carries_traceback() {
        if !python3_available() {
            return;
        }
        let run = PythonRunner::default()
            .run("print('before')\nprint(1/0)", Duration::from_secs(10))
            .await
            .unwrap();
        match run.status {
            RunStatus::Raised(trace) => assert!(trace.contains("ZeroDivisionError"), "{trace}"),
            other => panic!("unexpected status: {other:?}"),
        }
        assert_eq!(run.stdout.trim(), "before");
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        if !python3_available() {
            return;
        }
        let source = "import sys, time\nprint('partial')\nsys.stdout.flush()\ntime.sleep(30)";
        let run = PythonRunner::default()
            .run(source, Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
        assert_eq!(run.stdout.trim(), "partial");
    }

    #[tokio::test]
    async fn sandbox_blocks_subprocess_and_external_writes() {
        if !python3_available() {
            return;
        }
        let runner = PythonRunner::default();
        let run = runner
            .run("import os\nos.system('true')", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(
            matches!(&run.status, RunStatus::SandboxViolation(e) if e.starts_with("os.system")),
            "{run:?}"
        );

        let run = runner
            .run("open('/tmp/scout-escape.txt', 'w').write('x')", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(run.status, RunStatus::SandboxViolation(_)), "{run:?}");

        let run = runner
            .run(
                "open('notes.txt', 'w').write('ok')\nprint(open('notes.txt').read())",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed, "{run:?}");
        assert_eq!(run.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn sandbox_checks_every_path_a_mutation_touches() {
        if !python3_available() {
            return;
        }
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("moved.txt");
        let dir = outside.path().join("made");
        let runner = PythonRunner::default();
        let attempts = [
            format!("import os\nopen('x', 'w').write('x')\nos.rename('x', {target:?})"),
            format!("import os\nopen('x', 'w').write('x')\nos.replace('x', {target:?})"),
            format!("import os\nos.mkdir({dir:?})"),
            format!("import os\nos.symlink('/etc/hostname', {target:?})"),
            format!("import os\nos.chmod({:?}, 0o777)", outside.path()),
            format!("import os\nos.chdir({:?})\nopen('rel.txt', 'w').write('x')", outside.path()),
            format!(
                "import os\nfd = os.open({:?}, os.O_RDONLY)\nos.mkdir('via-fd', dir_fd=fd)",
                outside.path()
            ),
        ];
        for source in &attempts {
            let run = runner.run(source, Duration::from_secs(10)).await.unwrap();
            assert!(
                matches!(run.status, RunStatus::SandboxViolation(_)),
                "{source}: {run:?}"
            );
        }
        assert!(!target.exists());
        assert!(!dir.exists());
        assert!(!outside.path().join("rel.txt").exists());
        assert!(!outside.path().join("via-fd").exists());

        // Moving files around inside the working directory is fine.
        let run = runner
            .run(
                "import os\nopen('a', 'w').write('ok')\nos.mkdir('d')\nos.rename('a', 'd/b')\nprint(open('d/b').read())",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed, "{run:?}");
        assert_eq!(run.stdout.trim(), "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_reaps_processes_the_script_started() {
        if !python3_available() {
            return;
        }
        let runner = PythonRunner::default().with_policy(SandboxPolicy::unrestricted());
        let source = "import subprocess, time\nsubprocess.Popen(['sleep', '20'])\ntime.sleep(30)";
        let run = tokio::time::timeout(
            Duration::from_secs(8),
            runner.run(source, Duration::from_secs(1)),
        )
        .await
        .expect("run outlived its timeout")
        .unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lingering_child_does_not_hold_the_result() {
        if !python3_available() {
            return;
        }
        let runner = PythonRunner::default().with_policy(SandboxPolicy::unrestricted());
        let source = "import subprocess\nsubprocess.Popen(['sleep', '20'])\nprint('done')";
        let run = tokio::time::timeout(
            Duration::from_secs(8),
            runner.run(source, Duration::from_secs(10)),
        )
        .await
        .expect("run waited for a background process")
        .unwrap();
        assert_eq!(run.status, RunStatus::Completed, "{run:?}");
        assert_eq!(run.stdout.trim(), "done");
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let err = PythonRunner::new("/nonexistent/python")
            .run("print(1)", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
