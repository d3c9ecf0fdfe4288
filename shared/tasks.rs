//! Fan-out of independent units of work.
//!
//! A unit is a pure function of the data it captures. Units are submitted to a
//! [`TaskPool`] and the caller then blocks in [`await_all`] until every unit has
//! finished. Results come back in submission order regardless of completion order, and
//! the first failure (in submission order) becomes the failure of the whole run. There
//! is no retry and no cancellation; units that are still running when a failure is
//! reported simply finish and their results are discarded.

use crate::shared::progress::{Stage, TaskProgress};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use thiserror::Error;

/// Failures of the pool itself, as opposed to errors returned by a unit.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unit of work #{index} panicked: {message}")]
    Panicked { index: usize, message: String },
    #[error("Unit of work #{index} was lost before it produced a result")]
    Disconnected { index: usize },
    #[error("Failed to start the worker pool: {0}")]
    Pool(String),
}

/// A pending result of a submitted unit.
pub struct TaskHandle<T> {
    receiver: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    fn channel() -> (Sender<thread::Result<T>>, Self) {
        let (sender, receiver) = bounded(1);
        (sender, Self { receiver })
    }
}

/// Anything that can run units of work and hand back a [`TaskHandle`].
pub trait TaskPool: Sync {
    fn submit<T, F>(&self, unit: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;
}

/// Runs units on a dedicated rayon thread pool.
pub struct ThreadTaskPool {
    pool: rayon::ThreadPool,
}

impl ThreadTaskPool {
    /// Builds a pool with `workers` threads, or one per logical CPU when `None`.
    pub fn new(workers: Option<usize>) -> Result<Self, TaskError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.unwrap_or(0))
            .thread_name(|i| format!("dieback-worker-{i}"))
            .build()
            .map_err(|e| TaskError::Pool(e.to_string()))?;
        log::debug!("Started worker pool with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskPool for ThreadTaskPool {
    fn submit<T, F>(&self, unit: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, handle) = TaskHandle::channel();
        self.pool.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(unit));
            let _ = sender.send(outcome);
        });
        handle
    }
}

/// Runs every unit on the calling thread at submission time.
#[derive(Default)]
pub struct InlineTaskPool;

impl TaskPool for InlineTaskPool {
    fn submit<T, F>(&self, unit: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, handle) = TaskHandle::channel();
        let outcome = panic::catch_unwind(AssertUnwindSafe(unit));
        let _ = sender.send(outcome);
        handle
    }
}

/// Blocks until every handle has produced a result.
///
/// Returns the unit results in submission order, or the first error in submission
/// order. Panics inside a unit are converted into [`TaskError::Panicked`].
pub fn await_all<T, E>(
    handles: Vec<TaskHandle<Result<T, E>>>,
    stage: Stage,
    progress: &mut dyn TaskProgress,
) -> Result<Vec<T>, E>
where
    E: From<TaskError>,
{
    progress.on_stage_start(stage, handles.len());
    let mut results = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        let outcome = handle
            .receiver
            .recv()
            .map_err(|_| TaskError::Disconnected { index })?;
        match outcome {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(err)) => return Err(err),
            Err(payload) => {
                return Err(TaskError::Panicked {
                    index,
                    message: panic_message(payload.as_ref()),
                }
                .into());
            }
        }
        progress.on_unit_complete(stage);
    }
    progress.on_stage_finish(stage);
    Ok(results)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::progress::NoopProgress;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum UnitError {
        Bad(usize),
        Pool(String),
    }

    impl From<TaskError> for UnitError {
        fn from(value: TaskError) -> Self {
            Self::Pool(value.to_string())
        }
    }

    #[test]
    fn results_follow_submission_order() {
        let pool = ThreadTaskPool::new(Some(4)).expect("pool");
        let handles: Vec<_> = (0..8usize)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(((8 - i) * 3) as u64));
                    Ok::<usize, UnitError>(i * 10)
                })
            })
            .collect();
        let results = await_all(handles, Stage::FoldEvaluation, &mut NoopProgress).expect("ok");
        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn first_failure_in_submission_order_is_reported() {
        let pool = ThreadTaskPool::new(Some(2)).expect("pool");
        let handles: Vec<_> = (0..5usize)
            .map(|i| {
                pool.submit(move || {
                    if i >= 2 {
                        Err(UnitError::Bad(i))
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect();
        let err = await_all(handles, Stage::Spans, &mut NoopProgress).unwrap_err();
        assert_eq!(err, UnitError::Bad(2));
    }

    #[test]
    fn panics_become_errors() {
        let pool = InlineTaskPool;
        let handles = vec![
            pool.submit(|| Ok::<u8, UnitError>(1)),
            pool.submit(|| -> Result<u8, UnitError> { panic!("boom") }),
        ];
        let err = await_all(handles, Stage::Spans, &mut NoopProgress).unwrap_err();
        match err {
            UnitError::Pool(message) => assert!(message.contains("boom"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
