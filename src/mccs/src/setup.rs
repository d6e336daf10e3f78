//! Two-phase deferred setup.
//!
//! Connection handshakes and memory exchanges are queued in a [`SetupBatch`]
//! and run together: every action's `begin_setup` (sends, handshake
//! initiation) completes before any action's `end_setup` (blocking receives,
//! finalization) starts. An `end_setup` that waits on a peer's
//! `begin_setup` therefore never deadlocks, whatever the registration order.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::bootstrap::Bootstrap;
use crate::error::{Error, Result};

pub trait Setuppable: Send {
    fn begin_setup(&mut self, _bootstrap: &dyn Bootstrap) -> Result<()> {
        Ok(())
    }

    fn end_setup(&mut self, _bootstrap: &dyn Bootstrap) -> Result<()> {
        Ok(())
    }
}

/// Pending setup actions, consumed by [`crate::Communicator::setup`].
#[derive(Default)]
pub struct SetupBatch {
    actions: Vec<Box<dyn Setuppable>>,
}

impl SetupBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: impl Setuppable + 'static) {
        self.actions.push(Box::new(action));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn run(self, bootstrap: &dyn Bootstrap) -> Result<()> {
        let mut actions = self.actions;
        log::debug!(
            "Rank {} running setup batch of {} actions",
            bootstrap.rank(),
            actions.len()
        );
        for action in actions.iter_mut() {
            action.begin_setup(bootstrap)?;
        }
        for action in actions.iter_mut() {
            action.end_setup(bootstrap)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SetupBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupBatch")
            .field("actions", &self.actions.len())
            .finish()
    }
}

/// A value produced while its batch is set up.
pub struct SetupFuture<T> {
    cell: Arc<OnceCell<T>>,
}

/// Producer side of a [`SetupFuture`], owned by the deferred action.
pub(crate) struct SetupPromise<T> {
    cell: Arc<OnceCell<T>>,
}

impl<T> SetupFuture<T> {
    pub(crate) fn pending() -> (SetupFuture<T>, SetupPromise<T>) {
        let cell = Arc::new(OnceCell::new());
        (
            SetupFuture {
                cell: Arc::clone(&cell),
            },
            SetupPromise { cell },
        )
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get_ref(&self) -> Result<&T> {
        self.cell.get().ok_or(Error::FutureNotReady)
    }
}

impl<T: Clone> SetupFuture<T> {
    pub fn get(&self) -> Result<T> {
        self.get_ref().cloned()
    }
}

impl<T> Clone for SetupFuture<T> {
    fn clone(&self) -> Self {
        SetupFuture {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for SetupFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<T> SetupPromise<T> {
    pub(crate) fn fulfill(self, value: T) -> Result<()> {
        self.cell
            .set(value)
            .map_err(|_| Error::Internal("setup future fulfilled twice".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use spin::Mutex;

    use super::*;
    use crate::bootstrap::LocalBootstrap;

    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Setuppable for Recorder {
        fn begin_setup(&mut self, _: &dyn Bootstrap) -> Result<()> {
            self.log.lock().push(format!("begin{}", self.id));
            Ok(())
        }

        fn end_setup(&mut self, _: &dyn Bootstrap) -> Result<()> {
            self.log.lock().push(format!("end{}", self.id));
            Ok(())
        }
    }

    #[test]
    fn all_first_phases_run_before_second_phases() {
        let bootstrap = LocalBootstrap::create(1, 1).pop().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut batch = SetupBatch::new();
        for id in 0..3 {
            batch.push(Recorder {
                id,
                log: Arc::clone(&log),
            });
        }
        assert_eq!(batch.len(), 3);
        batch.run(&bootstrap).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["begin0", "begin1", "begin2", "end0", "end1", "end2"]
        );
    }

    // sends in the first phase, receives the peer's message in the second
    struct Exchange {
        peer: usize,
        tag: u32,
        promise: Option<SetupPromise<Vec<u8>>>,
    }

    impl Setuppable for Exchange {
        fn begin_setup(&mut self, bootstrap: &dyn Bootstrap) -> Result<()> {
            bootstrap.send(&self.tag.to_le_bytes(), self.peer, self.tag)?;
            Ok(())
        }

        fn end_setup(&mut self, bootstrap: &dyn Bootstrap) -> Result<()> {
            let data = bootstrap.recv(self.peer, self.tag)?;
            match self.promise.take() {
                Some(promise) => promise.fulfill(data),
                None => Err(Error::Internal("exchange ran twice".to_string())),
            }
        }
    }

    #[test]
    fn cross_dependent_actions_resolve_in_one_batch() {
        let handles = LocalBootstrap::create(2, 2)
            .into_iter()
            .map(|bootstrap| {
                thread::spawn(move || {
                    let peer = 1 - bootstrap.rank();
                    let mut tags = vec![1u32, 2, 3, 4];
                    if bootstrap.rank() == 1 {
                        tags.reverse();
                    }
                    let mut batch = SetupBatch::new();
                    let futures = tags
                        .iter()
                        .map(|&tag| {
                            let (future, promise) = SetupFuture::pending();
                            batch.push(Exchange {
                                peer,
                                tag,
                                promise: Some(promise),
                            });
                            (tag, future)
                        })
                        .collect::<Vec<_>>();
                    assert!(matches!(futures[0].1.get(), Err(Error::FutureNotReady)));
                    batch.run(&bootstrap).unwrap();
                    for (tag, future) in futures {
                        assert_eq!(future.get().unwrap(), tag.to_le_bytes().to_vec());
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
