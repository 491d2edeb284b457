#![allow(dead_code)]

use fleetrun::errors::ChannelError;
use fleetrun::managers::channel::{AbortSignal, Channel, ChannelConnector, CommandResult};
use fleetrun::model::{AgentRequest, AgentResponse, ResponseState, Target};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

pub static ENV_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

/// How the scripted connector treats one target.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Shell commands exit with this code and echo the command.
    Exit(i64),
    Unreachable,
    /// Sleeps inside `connect` before succeeding; gives up when aborted.
    SlowConnect(Duration),
    /// Like `SlowConnect` but deaf to aborts, as a blocked dial would be.
    StuckConnect(Duration),
    Panic,
    Agent(ResponseState),
    /// The host presents a key that differs from the pinned one.
    TrustViolation,
}

/// `in_flight` counts targets whose work is running inside the connector
/// or holds an open channel.
#[derive(Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl Counters {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sleeps in small slices so an abort cuts the wait short.
fn pause(duration: Duration, abort: &AbortSignal, operation: &str) -> Result<(), ChannelError> {
    let started = Instant::now();
    while started.elapsed() < duration {
        abort.check(operation)?;
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

/// In-process stand-in for the SSH/TLS builder.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    pub counters: Arc<Counters>,
    pub hold: Duration,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, target: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(target.to_string(), behavior);
        self
    }

    /// Keeps each channel busy for `hold` so concurrency can be observed.
    pub fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    fn behavior(&self, target: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or(Behavior::Exit(0))
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl ChannelConnector for ScriptedConnector {
    fn connect(
        &self,
        target: &Target,
        _deadline: Instant,
        abort: &AbortSignal,
    ) -> Result<Box<dyn Channel>, ChannelError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.counters.enter();
        let behavior = self.behavior(&target.name);
        let ready = match &behavior {
            Behavior::Unreachable => Err(ChannelError::Connect {
                address: target.public_address.clone(),
                reason: "connection refused".to_string(),
            }),
            Behavior::TrustViolation => Err(ChannelError::TrustViolation {
                identity: format!("{}:22", target.public_address),
                expected: "SHA256:pinned".to_string(),
                observed: "SHA256:presented".to_string(),
            }),
            Behavior::SlowConnect(delay) => pause(*delay, abort, "scripted connect"),
            Behavior::StuckConnect(delay) => {
                std::thread::sleep(*delay);
                Ok(())
            }
            Behavior::Panic => {
                self.counters.leave();
                panic!("scripted panic for {}", target.name)
            }
            _ => Ok(()),
        };
        if let Err(err) = ready {
            self.counters.leave();
            return Err(err);
        }
        Ok(Box::new(ScriptedChannel {
            peer: format!("{}:22", target.public_address),
            behavior,
            counters: self.counters.clone(),
            hold: self.hold,
            abort: abort.clone(),
            closed: false,
        }))
    }
}

pub struct ScriptedChannel {
    peer: String,
    behavior: Behavior,
    counters: Arc<Counters>,
    hold: Duration,
    abort: AbortSignal,
    closed: bool,
}

impl Channel for ScriptedChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn request(&mut self, request: &AgentRequest) -> Result<AgentResponse, ChannelError> {
        pause(self.hold, &self.abort, "scripted request")?;
        let state = match self.behavior {
            Behavior::Agent(state) => state,
            _ => ResponseState::Changed,
        };
        Ok(AgentResponse::new(state, request.describe()))
    }

    fn run_shell(&mut self, command: &str) -> Result<CommandResult, ChannelError> {
        pause(self.hold, &self.abort, "scripted command")?;
        let exit_code = match self.behavior {
            Behavior::Exit(code) => code,
            _ => 0,
        };
        Ok(CommandResult {
            exit_code,
            stdout: format!("{}\n", command),
            ..CommandResult::default()
        })
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.leave();
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn fleet(names: &[&str]) -> Vec<Target> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| Target::new(*name, format!("10.0.0.{}", i + 1)))
        .collect()
}
