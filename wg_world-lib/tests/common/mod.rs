#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use wg_world_lib::exec::{ChildProcess, CommandLine, Error, Runner};

/// Scripted runner for the test suite: records every intent in order,
/// answers queries from canned responses and can fail a chosen command.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<String>,
    fail_on: Option<String>,
    responses: Vec<(String, String)>,
    children_exit: bool,
    next_id: u32,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        let runner = RecordingRunner::default();
        runner.respond("ulimit -n", "unlimited");
        Arc::new(runner)
    }

    /// Fail the first `run` whose rendered line contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.state.lock().expect("runner state").fail_on = Some(needle.to_string());
    }

    /// Answer `output` queries whose rendered line contains `needle`.
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.state
            .lock()
            .expect("runner state")
            .responses
            .push((needle.to_string(), stdout.to_string()));
    }

    /// Spawned children report themselves exited on the first liveness poll.
    pub fn children_exit(&self) {
        self.state.lock().expect("runner state").children_exit = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("runner state").calls.clone()
    }
}

impl Runner for RecordingRunner {
    fn run(&self, cmd: &CommandLine) -> Result<(), Error> {
        let line = cmd.render();
        let mut state = self.state.lock().expect("runner state");
        state.calls.push(line.clone());
        if let Some(needle) = &state.fail_on {
            if line.contains(needle.as_str()) {
                return Err(Error::CommandFailed { cmd: line, status: 1 });
            }
        }
        Ok(())
    }

    fn output(&self, cmd: &CommandLine) -> Result<String, Error> {
        let line = cmd.render();
        let mut state = self.state.lock().expect("runner state");
        state.calls.push(line.clone());
        // the most recent registration for a matching needle wins
        let response = state
            .responses
            .iter()
            .rev()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();
        Ok(response)
    }

    fn spawn(&self, cmd: &CommandLine) -> Result<Box<dyn ChildProcess>, Error> {
        let line = cmd.render();
        let mut state = self.state.lock().expect("runner state");
        state.calls.push(format!("spawn {line}"));
        state.next_id += 1;
        Ok(Box::new(FakeChild {
            id: 1000 + state.next_id,
            running: !state.children_exit,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeChild {
    id: u32,
    running: bool,
    state: Arc<Mutex<State>>,
}

impl ChildProcess for FakeChild {
    fn is_running(&mut self) -> bool {
        self.running
    }

    fn terminate(&mut self) -> Result<(), Error> {
        self.running = false;
        self.state
            .lock()
            .expect("runner state")
            .calls
            .push(format!("terminate {}", self.id));
        Ok(())
    }

    fn id(&self) -> u32 {
        self.id
    }
}
