use std::{fmt, io, path::PathBuf, process::Stdio, time::Duration};

use tokio::{
    process::{Child, Command},
    sync::watch,
    task::JoinHandle,
};

use crate::logs::{LogSink, STDERR_PREFIX, STDOUT_PREFIX, pump_lines};

// How long the monitor waits for output pipes to drain after the leader exits.
// Helpers that inherited the pipes may keep them open much longer.
const READER_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// A spawned process group. The child itself is owned by the monitor task.
pub(crate) struct Launched {
    pub pid: u32,
    pub pgid: i32,
    pub exited: watch::Receiver<Option<ExitInfo>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    AlreadyGone,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    // If the agent process dies (crash/kill), ensure the child is terminated.
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

fn spawn_detached(spec: &LaunchSpec) -> io::Result<Child> {
    let mut cmd = Command::new(&spec.exec);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    // New session => new process group with pgid == pid, so the whole tree
    // can be signaled at once.
    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn()
}

/// Spawns `spec` in its own process group, pumps its output into `sink`
/// and hands the child to a monitor task that reaps it.
///
/// `on_exit` runs on the monitor task once the leader has exited, before the
/// exit is published on `Launched::exited`.
pub(crate) fn launch<F>(spec: &LaunchSpec, sink: &LogSink, on_exit: F) -> io::Result<Launched>
where
    F: FnOnce(ExitInfo) + Send + 'static,
{
    let mut child = spawn_detached(spec)?;
    let Some(pid) = child.id() else {
        return Err(io::Error::other("spawned process has no pid"));
    };

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(pump_lines(out, STDOUT_PREFIX, sink.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(pump_lines(err, STDERR_PREFIX, sink.clone()));
    }

    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        let info = match child.wait().await {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                tracing::warn!(pid, error = %e, "wait on server process failed");
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        for r in readers {
            let _ = tokio::time::timeout(READER_DRAIN, r).await;
        }
        on_exit(info);
        tx.send_replace(Some(info));
    });

    Ok(Launched {
        pid,
        pgid: pid as i32,
        exited: rx,
    })
}

#[cfg(unix)]
pub(crate) fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<Delivery> {
    // kill(0, ..) and kill(-1, ..) would hit our own group or every process.
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(Delivery::Sent);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(Delivery::AlreadyGone)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pgid: i32, _signal: i32) -> io::Result<Delivery> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signals require unix",
    ))
}

#[cfg(unix)]
const SIGTERM: libc::c_int = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: libc::c_int = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Resolves once the leader has been reaped.
pub(crate) async fn wait_exit(exited: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    let res = exited.wait_for(|v| v.is_some()).await.map(|info| *info);
    match res {
        Ok(info) => info,
        // The monitor only drops its sender after publishing.
        Err(_) => *exited.borrow(),
    }
}

fn kill_stragglers(pgid: i32) {
    if let Ok(Delivery::Sent) = signal_group(pgid, 0) {
        tracing::debug!(pgid, "process group outlived its leader; sending SIGKILL");
        let _ = signal_group(pgid, SIGKILL);
    }
}

/// terminate(pgid, graceful -> forced, grace)
///
/// Sends SIGTERM to the whole group, waits up to `grace` for the leader to be
/// reaped, then escalates to SIGKILL and waits without a bound. A group that
/// is already gone counts as success.
pub(crate) async fn terminate(
    pgid: i32,
    exited: &mut watch::Receiver<Option<ExitInfo>>,
    grace: Duration,
) -> io::Result<Termination> {
    let already = exited.borrow().is_some();
    if already {
        kill_stragglers(pgid);
        return Ok(Termination::AlreadyExited);
    }

    if signal_group(pgid, SIGTERM)? == Delivery::AlreadyGone {
        wait_exit(exited).await;
        return Ok(Termination::AlreadyExited);
    }

    let outcome = if tokio::time::timeout(grace, wait_exit(exited)).await.is_ok() {
        Termination::Graceful
    } else {
        let grace_ms = grace.as_millis() as u64;
        tracing::warn!(pgid, grace_ms, "graceful stop timed out; sending SIGKILL");
        signal_group(pgid, SIGKILL)?;
        wait_exit(exited).await;
        Termination::Forced
    };

    kill_stragglers(pgid);
    Ok(outcome)
}
