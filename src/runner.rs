//! Process execution and teardown.
//!
//! A `ProcessRunner` owns exactly one child process. It spawns the child in its
//! own process group (a job object on Windows) so that `destroy` can take down
//! the child together with everything the child spawned, from any thread, any
//! number of times.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::RunnerError;
use crate::output::OutputMultiplexer;
use crate::process::{CommandSpec, RunnerState};

/// How a runner's lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child exited; `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// Destroyed before it was started; nothing was spawned.
    Cancelled,
}

/// Owns one child process and its merged output stream.
pub struct ProcessRunner {
    spec: CommandSpec,
    slot: Mutex<Slot>,
}

struct Slot {
    state: RunnerState,
    group: Option<ProcessGroup>,
}

impl ProcessRunner {
    /// An idle runner for `spec`. Nothing is spawned until `start`.
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            slot: Mutex::new(Slot {
                state: RunnerState::Idle,
                group: None,
            }),
        }
    }

    /// The command this runner was built for.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Snapshot of the lifecycle state.
    pub fn state(&self) -> RunnerState {
        self.lock_slot().state
    }

    /// Spawns the child. Only an idle runner can be started.
    pub fn start(&self) -> Result<RunningChild, RunnerError> {
        let mut slot = self.lock_slot();
        if slot.state != RunnerState::Idle {
            return Err(RunnerError::Cancelled);
        }

        let argv = self.spec.argv();
        let Some((program, args)) = argv.split_first() else {
            slot.state = RunnerState::Done;
            return Err(RunnerError::Spawn {
                command: self.spec.command_line.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.stderr(Stdio::inherit());
            // SAFETY: only async-signal-safe libc calls between fork and exec.
            unsafe {
                command.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    // stdout is already the pipe here; point stderr at it too.
                    if libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.stderr(Stdio::piped());
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                slot.state = RunnerState::Done;
                return Err(RunnerError::Spawn {
                    command: self.spec.command_line.clone(),
                    source,
                });
            }
        };
        let pid = child.id().unwrap_or(0);
        match ProcessGroup::attach(&child) {
            Ok(group) => slot.group = Some(group),
            Err(err) => warn!(pid, error = %err, "could not track process group"),
        }
        slot.state = RunnerState::Running { pid };
        info!(
            prefix = %self.spec.prefix,
            pid,
            command = %shell_words::join(&argv),
            "started"
        );

        let output = MergedOutput::take(&mut child);
        Ok(RunningChild { child, output })
    }

    /// Kills the child and all of its descendants.
    ///
    /// Idempotent: destroying an idle runner just retires it, and destroying a
    /// runner that is already terminating or done does nothing.
    pub fn destroy(&self) {
        let mut slot = self.lock_slot();
        match slot.state {
            RunnerState::Idle => slot.state = RunnerState::Done,
            RunnerState::Running { pid } => {
                debug!(prefix = %self.spec.prefix, pid, "destroying process group");
                if let Some(group) = &slot.group {
                    group.kill();
                }
                slot.state = RunnerState::Terminating { pid };
            }
            RunnerState::Terminating { .. } | RunnerState::Done => {}
        }
    }

    /// Runs the whole lifecycle: start, forward every line, wait for exit.
    pub async fn run(&self, output: &OutputMultiplexer) -> Result<RunOutcome, RunnerError> {
        let mut child = match self.start() {
            Ok(child) => child,
            Err(RunnerError::Cancelled) => return Ok(RunOutcome::Cancelled),
            Err(err) => return Err(err),
        };

        loop {
            match child.next_line().await {
                Ok(Some(line)) => output.write(self.spec.color, &self.spec.prefix, &line),
                Ok(None) => break,
                Err(err) => {
                    warn!(prefix = %self.spec.prefix, error = %err, "reading output failed");
                    break;
                }
            }
        }

        let status = child.wait_for_exit().await;
        self.finish();
        let status = status.map_err(RunnerError::Wait)?;
        info!(prefix = %self.spec.prefix, code = ?status.code(), "exited");
        Ok(RunOutcome::Exited {
            code: status.code(),
        })
    }

    /// Marks the runner done after its child was reaped, killing any
    /// descendants it left behind in its group.
    fn finish(&self) {
        let mut slot = self.lock_slot();
        match slot.state {
            RunnerState::Running { .. } => {
                if let Some(group) = &slot.group {
                    group.kill();
                }
            }
            RunnerState::Terminating { pid } => debug!(pid, "destroyed process exited"),
            RunnerState::Idle | RunnerState::Done => {}
        }
        slot.group = None;
        slot.state = RunnerState::Done;
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A started child whose merged output has not been drained yet.
pub struct RunningChild {
    child: Child,
    output: MergedOutput,
}

impl RunningChild {
    /// Next line of stdout+stderr, or `None` once the child closed its output.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.output.next_line().await
    }

    /// Waits for the child to exit. Call after draining output.
    pub async fn wait_for_exit(mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }
}

#[cfg(unix)]
struct MergedOutput {
    reader: Option<BufReader<tokio::process::ChildStdout>>,
    buf: Vec<u8>,
}

#[cfg(unix)]
impl MergedOutput {
    fn take(child: &mut Child) -> Self {
        Self {
            reader: child.stdout.take().map(BufReader::new),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        read_line_lossy(reader, &mut self.buf).await
    }
}

// Windows has no fd to redirect between fork and exec, so both pipes are read
// concurrently and funnelled into one channel.
#[cfg(not(unix))]
struct MergedOutput {
    lines: tokio::sync::mpsc::Receiver<io::Result<String>>,
}

#[cfg(not(unix))]
impl MergedOutput {
    fn take(child: &mut Child) -> Self {
        let (tx, lines) = tokio::sync::mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(BufReader::new(stdout), tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(BufReader::new(stderr), tx));
        }
        Self { lines }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.recv().await.transpose()
    }
}

#[cfg(not(unix))]
async fn forward_lines<R>(mut reader: R, tx: tokio::sync::mpsc::Sender<io::Result<String>>)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

/// Reads one line, dropping the terminator and replacing invalid UTF-8.
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Handle addressing a child together with all of its descendants.
#[cfg(unix)]
struct ProcessGroup {
    pgid: libc::pid_t,
}

#[cfg(unix)]
impl ProcessGroup {
    fn attach(child: &Child) -> io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "child already reaped"))?;
        // the child made itself group leader in pre_exec
        Ok(Self {
            pgid: pid as libc::pid_t,
        })
    }

    fn kill(&self) {
        // SAFETY: plain syscall; ESRCH just means the group is already gone.
        let rc = unsafe { libc::killpg(self.pgid, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid = self.pgid, error = %err, "killpg failed");
            }
        }
    }
}

#[cfg(windows)]
struct ProcessGroup {
    job: windows_sys::Win32::Foundation::HANDLE,
}

#[cfg(windows)]
impl ProcessGroup {
    fn attach(child: &Child) -> io::Result<Self> {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::JobObjects::{AssignProcessToJobObject, CreateJobObjectW};

        let process = child
            .raw_handle()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "child already reaped"))?;
        // SAFETY: handles are checked before use and closed on every path.
        unsafe {
            let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
            if job == 0 {
                return Err(io::Error::last_os_error());
            }
            if AssignProcessToJobObject(job, process as _) == 0 {
                let err = io::Error::last_os_error();
                CloseHandle(job);
                return Err(err);
            }
            Ok(Self { job })
        }
    }

    fn kill(&self) {
        use windows_sys::Win32::System::JobObjects::TerminateJobObject;
        // SAFETY: the job handle stays open until drop.
        if unsafe { TerminateJobObject(self.job, 1) } == 0 {
            warn!(error = %io::Error::last_os_error(), "TerminateJobObject failed");
        }
    }
}

#[cfg(windows)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        // SAFETY: the handle is owned by this value.
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.job);
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
struct ProcessGroup;

#[cfg(all(not(unix), not(windows)))]
impl ProcessGroup {
    fn attach(_child: &Child) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process groups are not supported on this platform",
        ))
    }

    fn kill(&self) {}
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write as _;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::{sleep, timeout, Instant};

    use super::*;
    use crate::ansi::BackgroundColor;
    use crate::output::testing::CaptureBuffer;

    fn runner(command: &str) -> ProcessRunner {
        ProcessRunner::new(CommandSpec::new(BackgroundColor::Red, "web", command))
    }

    fn script(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    async fn wait_until_running(runner: &ProcessRunner) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !matches!(runner.state(), RunnerState::Running { .. }) {
            assert!(Instant::now() < deadline, "runner never started");
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn process_is_gone(pid: u32) -> bool {
        #[cfg(target_os = "linux")]
        {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                // a zombie waiting for init to reap it is already dead
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .map(|rest| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
                Err(_) => true,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            unsafe { libc::kill(pid as libc::pid_t, 0) != 0 }
        }
    }

    #[tokio::test]
    async fn forwards_lines_with_prefix_and_color() {
        let capture = CaptureBuffer::default();
        let output = OutputMultiplexer::new(capture.clone(), true);
        let runner = runner("echo hi");

        let outcome = runner.run(&output).await.unwrap();

        assert_eq!(outcome, RunOutcome::Exited { code: Some(0) });
        assert_eq!(capture.lines(), vec!["\x1b[41mweb\x1b[0m hi"]);
        assert_eq!(runner.state(), RunnerState::Done);
    }

    #[tokio::test]
    async fn stderr_is_merged_in_write_order() {
        let file = script("echo one\necho two 1>&2\necho three\nexit 3\n");
        let capture = CaptureBuffer::default();
        let output = OutputMultiplexer::new(capture.clone(), false);
        let runner = runner(&format!("sh {}", file.path().display()));

        let outcome = runner.run(&output).await.unwrap();

        assert_eq!(outcome, RunOutcome::Exited { code: Some(3) });
        assert_eq!(capture.lines(), vec!["web one", "web two", "web three"]);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let output = OutputMultiplexer::new(CaptureBuffer::default(), true);
        let runner = runner("parrun-definitely-not-a-real-binary --flag");

        let err = runner.run(&output).await.unwrap_err();

        assert!(matches!(err, RunnerError::Spawn { ref command, .. } if command.starts_with("parrun-")));
        assert_eq!(runner.state(), RunnerState::Done);
    }

    #[tokio::test]
    async fn destroy_before_start_is_a_noop() {
        let capture = CaptureBuffer::default();
        let output = OutputMultiplexer::new(capture.clone(), true);
        let runner = runner("echo never");

        runner.destroy();
        runner.destroy();
        assert_eq!(runner.state(), RunnerState::Done);

        assert_eq!(runner.run(&output).await.unwrap(), RunOutcome::Cancelled);
        assert!(matches!(runner.start(), Err(RunnerError::Cancelled)));
        assert!(capture.contents().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroy_twice_terminates_once() {
        let output = Arc::new(OutputMultiplexer::new(CaptureBuffer::default(), true));
        let runner = Arc::new(runner("sleep 30"));
        let worker = {
            let runner = Arc::clone(&runner);
            let output = Arc::clone(&output);
            tokio::spawn(async move { runner.run(&output).await })
        };

        wait_until_running(&runner).await;
        let pid = match runner.state() {
            RunnerState::Running { pid } => pid,
            other => panic!("unexpected state {other:?}"),
        };
        runner.destroy();
        assert_eq!(runner.state(), RunnerState::Terminating { pid });
        runner.destroy();
        assert_eq!(runner.state(), RunnerState::Terminating { pid });

        let outcome = timeout(Duration::from_secs(5), worker)
            .await
            .expect("runner did not exit after destroy")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited { code: None });
        assert_eq!(runner.state(), RunnerState::Done);
        runner.destroy();
        assert_eq!(runner.state(), RunnerState::Done);
    }

    #[tokio::test]
    async fn destroy_kills_descendants() {
        let file = script("sleep 30 &\necho $!\nwait\n");
        let runner = runner(&format!("sh {}", file.path().display()));

        let mut child = runner.start().unwrap();
        let RunnerState::Running { pid: shell_pid } = runner.state() else {
            panic!("runner not running after start");
        };
        let descendant: u32 = child
            .next_line()
            .await
            .unwrap()
            .expect("script printed the background pid")
            .trim()
            .parse()
            .unwrap();
        assert!(!process_is_gone(descendant));

        runner.destroy();
        let status = timeout(Duration::from_secs(5), child.wait_for_exit())
            .await
            .expect("shell survived destroy")
            .unwrap();
        assert!(!status.success());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_is_gone(descendant) {
            assert!(Instant::now() < deadline, "descendant {descendant} survived");
            sleep(Duration::from_millis(20)).await;
        }
        assert!(process_is_gone(shell_pid));
    }

    #[tokio::test]
    async fn natural_exit_cleans_up_leftover_descendants() {
        // the background sleep detaches from stdout so draining can finish
        let file = script("sleep 30 >/dev/null 2>&1 &\necho $!\n");
        let capture = CaptureBuffer::default();
        let output = OutputMultiplexer::new(capture.clone(), false);
        let runner = runner(&format!("sh {}", file.path().display()));

        let outcome = timeout(Duration::from_secs(5), runner.run(&output))
            .await
            .expect("runner hung")
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exited { code: Some(0) });

        let line = capture.lines().pop().unwrap();
        let descendant: u32 = line.trim_start_matches("web ").trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_is_gone(descendant) {
            assert!(Instant::now() < deadline, "leftover {descendant} survived");
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_fatal() {
        let file = script("printf 'ok\\n\\377bad\\r\\n'\n");
        let capture = CaptureBuffer::default();
        let output = OutputMultiplexer::new(capture.clone(), false);
        let runner = runner(&format!("sh {}", file.path().display()));

        runner.run(&output).await.unwrap();

        assert_eq!(capture.lines(), vec!["web ok", "web \u{fffd}bad"]);
    }
}
