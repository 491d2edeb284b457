use crate::model::{ExecutionOutcome, OutcomeClass};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub success_count: usize,
    pub failure_count: usize,
    pub error_count: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.success_count + self.failure_count + self.error_count
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Success: {} Failure: {} Error: {}",
            self.success_count, self.failure_count, self.error_count
        )
    }
}

/// Collects exactly one outcome per target from concurrent workers.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    outcomes: Mutex<BTreeMap<String, ExecutionOutcome>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Recording a second outcome for the same target is a bug in the
    /// caller and panics instead of overwriting the first.
    pub fn record(&self, target: &str, outcome: ExecutionOutcome) {
        let mut guard = self.outcomes.lock().unwrap_or_else(|err| err.into_inner());
        if guard.contains_key(target) {
            drop(guard);
            panic!("outcome for target {} recorded twice", target);
        }
        guard.insert(target.to_string(), outcome);
    }

    pub fn contains(&self, target: &str) -> bool {
        self.outcomes
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .contains_key(target)
    }

    pub fn summary(&self) -> Summary {
        summarize(&self.outcomes.lock().unwrap_or_else(|err| err.into_inner()))
    }

    pub fn report(&self) -> Report {
        Report {
            outcomes: self
                .outcomes
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .clone(),
        }
    }
}

fn summarize(outcomes: &BTreeMap<String, ExecutionOutcome>) -> Summary {
    let mut summary = Summary::default();
    for outcome in outcomes.values() {
        match outcome.class() {
            OutcomeClass::Success => summary.success_count += 1,
            OutcomeClass::Failure => summary.failure_count += 1,
            OutcomeClass::Error => summary.error_count += 1,
        }
    }
    summary
}

/// Final, immutable result of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    outcomes: BTreeMap<String, ExecutionOutcome>,
}

impl Report {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> Summary {
        summarize(&self.outcomes)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcome(&self, target: &str) -> Option<&ExecutionOutcome> {
        self.outcomes.get(target)
    }

    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.outcomes.keys().map(String::as_str)
    }

    /// Successes, then failures, then errors; targets sorted by name
    /// inside each block. The summary line is always last and always
    /// counts successes, even when their block is suppressed.
    pub fn render(&self, suppress_successes: bool) -> String {
        let mut out = String::new();
        for class in [OutcomeClass::Success, OutcomeClass::Failure, OutcomeClass::Error] {
            if suppress_successes && class == OutcomeClass::Success {
                continue;
            }
            for (name, outcome) in self.outcomes.iter().filter(|(_, o)| o.class() == class) {
                out.push_str("  ");
                out.push_str(name);
                out.push_str(":\n");
                let body = outcome.body();
                if !body.is_empty() {
                    out.push_str(&body);
                    out.push('\n');
                }
                out.push('\n');
            }
        }
        out.push_str(&self.summary().to_string());
        out.push('\n');
        out
    }
}
