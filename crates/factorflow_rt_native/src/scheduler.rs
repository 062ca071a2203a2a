//! Dependency counted execution of a module's stages.
//!
//! Every stage starts with its compile time pending count. Roots are spawned
//! onto the executor's pool right away, and a stage finishing decrements the
//! counter of each of its dependents, spawning those that reach zero. The
//! calling thread blocks until every spawned stage has returned.
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use factorflow_core::module::Module;
use factorflow_core::stage::Stage;
use factorflow_error::{DbError, Result};
use parking_lot::Mutex;
use rayon::Scope;
use tracing::{debug, trace};

use crate::executor::NativeExecutor;
use crate::profile::{ExecutionProfile, ProfileBuffer, StageProfile};

/// Where to put errors that happen during execution.
pub trait ErrorSink: Debug + Sync + Send {
    fn set_error(&self, error: DbError);
}

/// Error sink holding on to the first error only.
#[derive(Debug, Default)]
pub struct FirstErrorSink {
    failed: AtomicBool,
    error: Mutex<Option<DbError>>,
}

impl FirstErrorSink {
    pub fn has_error(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn take_error(&self) -> Option<DbError> {
        self.error.lock().take()
    }
}

impl ErrorSink for FirstErrorSink {
    fn set_error(&self, error: DbError) {
        let mut slot = self.error.lock();
        if slot.is_some() {
            debug!(%error, "dropping error, run already failed");
            return;
        }
        *slot = Some(error);
        self.failed.store(true, Ordering::Release);
    }
}

/// Executes the work inside a single stage.
pub trait StageRunner: Sync {
    fn run_stage(&self, stage: &Stage) -> Result<()>;
}

/// Run every stage of `module` exactly once, respecting dependencies.
///
/// The first stage error aborts the run. Stages already executing finish,
/// but nothing new gets started.
pub fn execute_stages<R>(
    executor: &NativeExecutor,
    module: &Module,
    runner: &R,
) -> Result<ExecutionProfile>
where
    R: StageRunner,
{
    let run = DagRun {
        module,
        runner,
        pending: module
            .stages()
            .iter()
            .map(|s| AtomicUsize::new(s.pending_count))
            .collect(),
        errors: FirstErrorSink::default(),
        profiles: ProfileBuffer::new(module.stages().len()),
    };

    debug!(module = module.name(), num_stages = module.stages().len(), "executing stages");

    executor.pool().scope(|scope| {
        for stage in module.stages().iter().filter(|s| s.is_root()) {
            run.spawn(scope, stage.id);
        }
    });

    if let Some(error) = run.errors.take_error() {
        return Err(error);
    }
    run.profiles.take_profiles()
}

#[derive(Debug)]
struct DagRun<'a, R> {
    module: &'a Module,
    runner: &'a R,
    /// Number of producers each stage is still waiting on.
    pending: Vec<AtomicUsize>,
    errors: FirstErrorSink,
    profiles: ProfileBuffer,
}

impl<'a, R> DagRun<'a, R>
where
    R: StageRunner,
{
    fn spawn<'s>(&'s self, scope: &Scope<'s>, id: usize) {
        scope.spawn(move |scope| self.execute(scope, id));
    }

    fn execute<'s>(&'s self, scope: &Scope<'s>, id: usize) {
        if self.errors.has_error() {
            return;
        }

        let stage = &self.module.stages()[id];
        let start_seq = self.profiles.next_seq();
        let start = Instant::now();
        trace!(stage = %stage.name, task_kind = %stage.task_kind, "executing stage");

        if let Err(error) = self.runner.run_stage(stage) {
            self.errors
                .set_error(error.with_field("stage", stage.name.clone()));
            return;
        }

        let profile = StageProfile {
            stage_id: id,
            name: stage.name.clone(),
            task_kind: stage.task_kind,
            start_seq,
            end_seq: self.profiles.next_seq(),
            elapsed: start.elapsed(),
        };
        if let Err(error) = self.profiles.put(profile) {
            self.errors.set_error(error);
            return;
        }

        for &dep in &stage.dependents {
            if self.pending[dep].fetch_sub(1, Ordering::AcqRel) == 1 {
                self.spawn(scope, dep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use factorflow_core::compiler::Compiler;
    use factorflow_core::config::CompilerConfig;
    use factorflow_core::ir::FunctionBuilder;
    use factorflow_error::ErrorKind;

    use super::*;

    /// Records the order stages ran in, optionally failing one of them.
    #[derive(Debug, Default)]
    struct RecordingRunner {
        order: Mutex<Vec<usize>>,
        fail: Option<usize>,
    }

    impl StageRunner for RecordingRunner {
        fn run_stage(&self, stage: &Stage) -> Result<()> {
            if self.fail == Some(stage.id) {
                return Err(DbError::execution("boom"));
            }
            self.order.lock().push(stage.id);
            Ok(())
        }
    }

    /// Diamond: a -> (rank, rank) -> combine.
    fn diamond() -> Module {
        let mut b = FunctionBuilder::new();
        let a = b.input("a");
        let s = b.windowed_sum(a, 2);
        let r1 = b.rank(s);
        let r2 = b.scale(s);
        let m = b.mul(r1, r2);
        b.output(m, "x");
        Compiler::new(CompilerConfig::default())
            .compile(&b.build("diamond").unwrap())
            .unwrap()
    }

    #[test]
    fn every_stage_once_in_order() {
        let module = diamond();
        assert_eq!(4, module.stages().len());

        for threads in [1, 4] {
            let executor = NativeExecutor::multi_threaded(threads).unwrap();
            let runner = RecordingRunner::default();
            let profile = execute_stages(&executor, &module, &runner).unwrap();

            let mut order = runner.order.lock().clone();
            assert_eq!(0, order[0]);
            assert_eq!(3, order[3]);
            order.sort();
            assert_eq!(vec![0, 1, 2, 3], order);

            profile.check_dependency_order(&module).unwrap();
        }
    }

    #[test]
    fn error_aborts_dependents() {
        let module = diamond();
        let executor = NativeExecutor::multi_threaded(2).unwrap();
        let runner = RecordingRunner {
            order: Mutex::new(Vec::new()),
            fail: Some(1),
        };

        let err = execute_stages(&executor, &module, &runner).unwrap_err();
        assert_eq!(ErrorKind::Execution, err.kind());
        assert!(err.field("stage").is_some());
        assert!(!runner.order.lock().contains(&3));
    }

    #[test]
    fn shared_module_concurrent_runs() {
        let module = Arc::new(diamond());
        let executor = NativeExecutor::multi_threaded(4).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                let module = module.clone();
                let executor = executor.clone();
                s.spawn(move || {
                    let runner = RecordingRunner::default();
                    execute_stages(&executor, &module, &runner).unwrap();
                    assert_eq!(4, runner.order.lock().len());
                });
            }
        });
    }
}
