use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::image::TypeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Running(ThreadId),
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CctorStatus {
    Done,
    Reentered,
    Failed,
}

struct RunningGuard<'a> {
    manager: &'a CctorManager,
    ty: TypeId,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.finish(self.ty, State::Failed);
        }
    }
}

#[derive(Default)]
pub struct CctorManager {
    states: Mutex<HashMap<TypeId, State>>,
    finished: Condvar,
}

impl CctorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_once<F>(&self, ty: TypeId, cctor: F) -> CctorStatus
    where
        F: FnOnce() -> bool,
    {
        let me = thread::current().id();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match states.get(&ty) {
                None => break,
                Some(State::Done) => return CctorStatus::Done,
                Some(State::Failed) => return CctorStatus::Failed,
                Some(State::Running(owner)) if *owner == me => return CctorStatus::Reentered,
                Some(State::Running(_)) => {
                    states = self
                        .finished
                        .wait(states)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        states.insert(ty, State::Running(me));
        drop(states);

        tracing::trace!(ty = ty.0, "running static constructor");
        let mut guard = RunningGuard {
            manager: self,
            ty,
            armed: true,
        };
        let ok = cctor();
        guard.armed = false;

        if ok {
            self.finish(ty, State::Done);
            CctorStatus::Done
        } else {
            self.finish(ty, State::Failed);
            CctorStatus::Failed
        }
    }

    fn finish(&self, ty: TypeId, state: State) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(ty, state);
        self.finished.notify_all();
    }

    pub fn is_done(&self, ty: TypeId) -> bool {
        matches!(
            self.states
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&ty),
            Some(State::Done)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_once_across_threads() {
        let manager = CctorManager::new();
        let runs = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let status = manager.run_once(TypeId(1), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(5));
                        true
                    });
                    assert_eq!(status, CctorStatus::Done);
                });
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(manager.is_done(TypeId(1)));
    }

    #[test]
    fn reentry_does_not_wait() {
        let manager = CctorManager::new();
        let status = manager.run_once(TypeId(2), || {
            manager.run_once(TypeId(2), || unreachable!()) == CctorStatus::Reentered
        });
        assert_eq!(status, CctorStatus::Done);
    }

    #[test]
    fn panicking_cctor_fails_instead_of_blocking() {
        let manager = CctorManager::new();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.run_once(TypeId(4), || panic!("cctor blew up"))
        }));
        assert!(unwound.is_err());
        let status = thread::scope(|scope| {
            scope
                .spawn(|| manager.run_once(TypeId(4), || true))
                .join()
                .expect("waiter")
        });
        assert_eq!(status, CctorStatus::Failed);
        assert!(!manager.is_done(TypeId(4)));
    }

    #[test]
    fn failure_is_sticky() {
        let manager = CctorManager::new();
        assert_eq!(manager.run_once(TypeId(3), || false), CctorStatus::Failed);
        assert_eq!(manager.run_once(TypeId(3), || true), CctorStatus::Failed);
    }
}
