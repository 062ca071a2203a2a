use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use factorflow_core::module::Module;
use factorflow_core::stage::TaskKind;
use factorflow_error::{DbError, Result};
use parking_lot::Mutex;

/// Timing for a single stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProfile {
    pub stage_id: usize,
    pub name: String,
    pub task_kind: TaskKind,
    /// Position in the run's event sequence when the stage started.
    pub start_seq: u64,
    /// Position in the run's event sequence when the stage finished.
    pub end_seq: u64,
    pub elapsed: Duration,
}

/// Profiles for every stage of one run, indexed by stage id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProfile {
    pub stages: Vec<StageProfile>,
}

impl ExecutionProfile {
    pub fn stage(&self, id: usize) -> Option<&StageProfile> {
        self.stages.get(id)
    }

    pub fn total_elapsed(&self) -> Duration {
        self.stages.iter().map(|s| s.elapsed).sum()
    }

    /// Check that every stage finished before any of its dependents started.
    pub fn check_dependency_order(&self, module: &Module) -> Result<()> {
        for stage in module.stages() {
            let Some(producer) = self.stage(stage.id) else {
                return Err(
                    DbError::new("Stage missing from profile").with_field("stage", stage.id)
                );
            };
            for &dep in &stage.dependents {
                let Some(consumer) = self.stage(dep) else {
                    return Err(DbError::new("Stage missing from profile").with_field("stage", dep));
                };
                if producer.end_seq >= consumer.start_seq {
                    return Err(DbError::new("Stage started before its dependency finished")
                        .with_field("producer", producer.name.clone())
                        .with_field("consumer", consumer.name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Where stages put their profiles as they complete.
#[derive(Debug)]
pub(crate) struct ProfileBuffer {
    seq: AtomicU64,
    profiles: Mutex<Vec<Option<StageProfile>>>,
}

impl ProfileBuffer {
    pub(crate) fn new(num_stages: usize) -> Self {
        ProfileBuffer {
            seq: AtomicU64::new(0),
            profiles: Mutex::new(vec![None; num_stages]),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn put(&self, profile: StageProfile) -> Result<()> {
        let mut profiles = self.profiles.lock();
        let id = profile.stage_id;
        let slot = profiles
            .get_mut(id)
            .ok_or_else(|| DbError::new("Profile for unknown stage").with_field("stage", id))?;
        if slot.replace(profile).is_some() {
            return Err(DbError::new("Stage executed more than once").with_field("stage", id));
        }
        Ok(())
    }

    /// Take all profiles, erroring if any stage never completed.
    pub(crate) fn take_profiles(&self) -> Result<ExecutionProfile> {
        let profiles = std::mem::take(&mut *self.profiles.lock());
        let stages = profiles
            .into_iter()
            .enumerate()
            .map(|(idx, p)| {
                p.ok_or_else(|| DbError::new("Stage never executed").with_field("stage", idx))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ExecutionProfile { stages })
    }
}
