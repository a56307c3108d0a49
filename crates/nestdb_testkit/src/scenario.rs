//! Scripted scenarios checked against a reference model.
//!
//! A scenario opens a root transaction over the seeded users, applies a
//! list of [`Step`]s and, after every step, compares what the session holds
//! in memory with a stack-of-frames model: `begin_nested()` pushes a copy of
//! the top frame, a savepoint commit replaces the frame below with the top
//! one, a savepoint rollback drops the top frame. The final root commit must
//! leave exactly the model's rows in the engine.

use crate::fixtures::{committed_names, seeded_engine, session, user, USERS};
use nestdb_core::{CoreResult, InstanceId, ObjectStatus, Session};
use nestdb_storage::{MemoryEngine, Value};
use std::collections::BTreeMap;

/// One scripted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Add a new user.
    Add(String),
    /// Rename the seed user in slot `0` (modulo the seed count).
    Rename(usize, String),
    /// Delete the seed user in a slot.
    Delete(usize),
    /// Open a savepoint.
    BeginNested,
    /// Commit the innermost savepoint; ignored at root level.
    Commit,
    /// Roll back the innermost savepoint; ignored at root level.
    Rollback,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    names: BTreeMap<usize, String>,
    added: Vec<(InstanceId, String)>,
}

/// Result of a finished scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    /// Names committed to the engine, sorted.
    pub committed: Vec<String>,
    /// Names the model expects, sorted.
    pub expected: Vec<String>,
}

/// A running scenario.
pub struct Scenario {
    /// The engine.
    pub engine: MemoryEngine,
    /// The session under test.
    pub session: Session,
    seeds: Vec<InstanceId>,
    frames: Vec<Frame>,
    ever_added: Vec<InstanceId>,
}

impl Scenario {
    /// Opens a root transaction over the seeded users.
    pub fn new() -> Self {
        let engine = seeded_engine();
        let mut session = session(&engine);
        session.begin().expect("Failed to begin root");
        let seeds = session.query(USERS).expect("Failed to load seed users");

        let mut frame = Frame::default();
        for (slot, id) in seeds.iter().enumerate() {
            let name = session.value(*id, "name").expect("Failed to read name");
            frame
                .names
                .insert(slot, name.as_text().unwrap_or_default().to_owned());
        }
        Self {
            engine,
            session,
            seeds,
            frames: vec![frame],
            ever_added: Vec::new(),
        }
    }

    /// Number of open savepoints.
    pub fn savepoints(&self) -> usize {
        self.frames.len() - 1
    }

    fn top(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("Model always has a root frame")
    }

    /// Applies one step to both the session and the model.
    pub fn apply(&mut self, step: &Step) -> CoreResult<()> {
        match step {
            Step::Add(name) => {
                let id = self.session.add(USERS, user(name));
                self.ever_added.push(id);
                self.top().added.push((id, name.clone()));
            }
            Step::Rename(slot, name) => {
                let slot = slot % self.seeds.len();
                if self.top().names.contains_key(&slot) {
                    self.session
                        .set_value(self.seeds[slot], "name", name.as_str())?;
                    self.top().names.insert(slot, name.clone());
                }
            }
            Step::Delete(slot) => {
                let slot = slot % self.seeds.len();
                if self.top().names.contains_key(&slot) {
                    self.session.delete(self.seeds[slot])?;
                    self.top().names.remove(&slot);
                }
            }
            Step::BeginNested => {
                self.session.begin_nested()?;
                let copy = self.top().clone();
                self.frames.push(copy);
            }
            Step::Commit => {
                if self.savepoints() > 0 {
                    self.session.commit()?;
                    let top = self.frames.pop().expect("Frame present");
                    *self.top() = top;
                }
            }
            Step::Rollback => {
                if self.savepoints() > 0 {
                    self.session.rollback()?;
                    self.frames.pop();
                }
            }
        }
        Ok(())
    }

    /// Asserts that the session's objects match the model.
    pub fn verify_memory(&mut self) {
        let frame = self.frames.last().cloned().expect("Model always has a root frame");
        for (slot, id) in self.seeds.clone().into_iter().enumerate() {
            match frame.names.get(&slot) {
                Some(name) => {
                    let actual = self.session.value(id, "name").expect("Failed to read name");
                    assert_eq!(actual, Value::from(name.as_str()), "seed slot {slot}");
                    assert!(
                        !self.session.state(id).expect("Record exists").is_deleted(),
                        "seed slot {slot} should not be deleted"
                    );
                }
                None => {
                    let state = self.session.state(id).expect("Record exists");
                    assert!(
                        state.is_deleted() || state.status() == ObjectStatus::Deleted,
                        "seed slot {slot} should be deleted"
                    );
                }
            }
        }
        for id in &self.ever_added {
            let live = frame.added.iter().any(|(added, _)| added == id);
            assert_eq!(self.session.contains(*id), live, "added instance {id}");
            if !live {
                assert_eq!(self.session.status(*id), Some(ObjectStatus::Transient));
            }
        }
    }

    /// Commits the root and compares the engine with the model.
    pub fn finish(mut self) -> CoreResult<ScenarioOutcome> {
        let root = self
            .session
            .get_transaction()
            .expect("Scenario keeps the root open");
        self.session.commit_transaction(root)?;

        let frame = self.frames.pop().expect("Model always has a root frame");
        let mut expected: Vec<String> = frame.names.into_values().collect();
        expected.extend(frame.added.into_iter().map(|(_, name)| name));
        expected.sort();
        Ok(ScenarioOutcome {
            committed: committed_names(&self.engine),
            expected,
        })
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `steps`, verifying memory after each one, and returns the outcome.
pub fn run_scenario(steps: &[Step]) -> ScenarioOutcome {
    let mut scenario = Scenario::new();
    for step in steps {
        scenario
            .apply(step)
            .unwrap_or_else(|e| panic!("step {step:?} failed: {e}"));
        scenario.verify_memory();
    }
    scenario.finish().expect("Failed to commit scenario")
}
