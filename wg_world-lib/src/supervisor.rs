use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use thiserror::Error;

use crate::exec::{ChildProcess, CommandLine, Runner};
use crate::netns::NetNs;

/// Port the transparent TCP proxy listens on.
pub const PROXY_PORT: u16 = 3140;
pub const PROXY_BIN: &str = "any_proxy";
pub const DNS_BIN: &str = "freedns-go";
pub const DEFAULT_DNS_UPSTREAM: &str = "1.1.1.1:53";

const POLL_PERIOD: Duration = Duration::from_secs(1);
const STARTUP_PROBE: Duration = Duration::from_secs(1);
const MIN_OPEN_FILES: u64 = 65535;

#[derive(Debug, Error)]
pub enum Error {
    #[error("open file limit too low: {0}")]
    FdLimit(u64),
    #[error("helper exited during startup")]
    FailedToStart,
    #[error("helper already running")]
    AlreadyRunning,
    #[error("helper not running")]
    NotRunning,
    #[error("exec error: {0}")]
    Exec(#[from] crate::exec::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    TransparentProxy,
    RecursiveDns,
}

/// A long-running external helper kept alive by a watcher thread.
///
/// The watcher polls the child once per second and respawns it on exit;
/// stopping raises a cooperative flag, terminates the tracked process and
/// joins the watcher within one poll period.
pub struct Supervised {
    kind: Kind,
    argv: Vec<String>,
    ns: NetNs,
    manage_resolver: bool,
    restarts: Arc<AtomicU32>,
    state: Option<Running>,
}

struct Running {
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    watcher: JoinHandle<()>,
    child: Arc<Mutex<Box<dyn ChildProcess>>>,
    resolver_stopped: bool,
}

impl fmt::Debug for Supervised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervised")
            .field("kind", &self.kind)
            .field("argv", &self.argv)
            .field("ns", &self.ns)
            .field("running", &self.state.is_some())
            .finish()
    }
}

impl Supervised {
    pub fn transparent_proxy(ns: &NetNs) -> Self {
        Supervised {
            kind: Kind::TransparentProxy,
            argv: vec![PROXY_BIN.to_string(), format!("-l=:{PROXY_PORT}")],
            ns: ns.clone(),
            manage_resolver: false,
            restarts: Arc::new(AtomicU32::new(0)),
            state: None,
        }
    }

    pub fn recursive_dns(listen: &str, upstream: &str, manage_resolver: bool, ns: &NetNs) -> Self {
        Supervised {
            kind: Kind::RecursiveDns,
            argv: vec![
                DNS_BIN.to_string(),
                "-l".to_string(),
                listen.to_string(),
                "-c".to_string(),
                upstream.to_string(),
            ],
            ns: ns.clone(),
            manage_resolver,
            restarts: Arc::new(AtomicU32::new(0)),
            state: None,
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn command(&self) -> CommandLine {
        CommandLine::new(self.ns.clone(), self.argv.clone())
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    pub fn start(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        if self.state.is_some() {
            return Err(Error::AlreadyRunning);
        }
        if self.kind == Kind::TransparentProxy {
            check_open_file_limit(runner)?;
        }
        let resolver_stopped = if self.manage_resolver {
            stop_system_resolver(runner)?
        } else {
            false
        };

        let cmd = self.command();
        let child = match runner.spawn(&cmd) {
            Ok(child) => Arc::new(Mutex::new(child)),
            Err(e) => {
                if resolver_stopped {
                    start_system_resolver(runner);
                }
                return Err(e.into());
            }
        };

        if self.kind == Kind::RecursiveDns {
            thread::sleep(STARTUP_PROBE);
            let alive = child.lock().map(|mut c| c.is_running()).unwrap_or(false);
            if !alive {
                if resolver_stopped {
                    start_system_resolver(runner);
                }
                return Err(Error::FailedToStart);
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (wake, wake_rx) = bounded(1);
        let watcher = {
            let cmd = cmd.clone();
            let runner = Arc::clone(runner);
            let child = Arc::clone(&child);
            let stop = Arc::clone(&stop);
            let restarts = Arc::clone(&self.restarts);
            thread::spawn(move || watch(cmd, runner, child, stop, wake_rx, restarts))
        };

        self.state = Some(Running { stop, wake, watcher, child, resolver_stopped });
        Ok(())
    }

    pub fn stop(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        let Some(running) = self.state.take() else {
            return Err(Error::NotRunning);
        };

        running.stop.store(true, Ordering::SeqCst);
        let _ = running.wake.send(());
        if let Ok(mut child) = running.child.lock() {
            child.terminate()?;
        }
        if running.watcher.join().is_err() {
            tracing::warn!(cmd = %self.command(), "supervisor watcher panicked");
        }
        if running.resolver_stopped {
            start_system_resolver(runner);
        }
        Ok(())
    }
}

fn watch(
    cmd: CommandLine,
    runner: Arc<dyn Runner>,
    child: Arc<Mutex<Box<dyn ChildProcess>>>,
    stop: Arc<AtomicBool>,
    wake: Receiver<()>,
    restarts: Arc<AtomicU32>,
) {
    loop {
        match wake.recv_timeout(POLL_PERIOD) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Ok(mut guard) = child.lock() else { break };
        if guard.is_running() || stop.load(Ordering::SeqCst) {
            continue;
        }
        tracing::warn!(cmd = %cmd, "supervised helper exited, restarting");
        match runner.spawn(&cmd) {
            Ok(respawned) => {
                *guard = respawned;
                restarts.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::error!(error = ?e, cmd = %cmd, "failed to restart helper");
            }
        }
    }
}

fn check_open_file_limit(runner: &Arc<dyn Runner>) -> Result<(), Error> {
    // raising the ceiling needs a reboot on some distributions, so CI skips it
    if env::var_os("CI").is_some() {
        return Ok(());
    }
    let cmd = CommandLine::new(NetNs::global(), vec!["sh".into(), "-c".into(), "ulimit -n".into()]);
    let out = runner.output(&cmd)?;
    if out.trim() == "unlimited" {
        return Ok(());
    }
    let limit: u64 = out.trim().parse().unwrap_or(0);
    if limit < MIN_OPEN_FILES {
        return Err(Error::FdLimit(limit));
    }
    Ok(())
}

fn stop_system_resolver(runner: &Arc<dyn Runner>) -> Result<bool, Error> {
    let status = CommandLine::new(
        NetNs::global(),
        vec!["systemctl".into(), "status".into(), "systemd-resolved".into()],
    );
    // a failing status query means the resolver is not there to conflict
    let Ok(out) = runner.output(&status) else {
        return Ok(false);
    };
    if out.contains("active (running)") {
        let stop = CommandLine::new(
            NetNs::global(),
            vec!["systemctl".into(), "stop".into(), "systemd-resolved".into()],
        );
        runner.run(&stop)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

fn start_system_resolver(runner: &Arc<dyn Runner>) {
    let start = CommandLine::new(
        NetNs::global(),
        vec!["systemctl".into(), "start".into(), "systemd-resolved".into()],
    );
    if let Err(e) = runner.run(&start) {
        tracing::warn!(error = ?e, "failed to restore system resolver");
    }
}
