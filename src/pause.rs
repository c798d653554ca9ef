//! Deferred-work handle.
//!
//! A [`Pause`] packages "I want to do X, but only once Y holds" without
//! leaking the completion across a stage boundary: the holder polls
//! [`is_ready`], then either [`run`]s or [`cancel`]s it. Both consume
//! the pause, and dropping an unconsumed one cancels it, so exactly one
//! of the two ever happens.
//!
//! [`is_ready`]: Pause::is_ready
//! [`run`]: Pause::run
//! [`cancel`]: Pause::cancel

use crate::error::{Error, Result};

type ReadyFn = Box<dyn Fn() -> bool + Send>;
type RunFn = Box<dyn FnOnce() + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

pub struct Pause {
    ready: ReadyFn,
    run: Option<RunFn>,
    cancel: Option<CancelFn>,
}

impl std::fmt::Debug for Pause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pause")
            .field("ready", &(self.ready)())
            .finish_non_exhaustive()
    }
}

impl Pause {
    pub fn new(
        ready: impl Fn() -> bool + Send + 'static,
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            ready: Box::new(ready),
            run: Some(Box::new(run)),
            cancel: Some(Box::new(cancel)),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        (self.ready)()
    }

    /// Perform the deferred work. Fails without running anything if the
    /// condition does not hold yet; the consumed pause then cancels on
    /// drop.
    pub fn run(mut self) -> Result<()> {
        if !self.is_ready() {
            // Dropping the consumed pause invokes cancel.
            return Err(Error::Internal("pause run before ready".into()));
        }
        self.cancel.take();
        if let Some(run) = self.run.take() {
            run();
        }
        Ok(())
    }

    /// Abandon the deferred work.
    pub fn cancel(mut self) {
        self.run.take();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Pause {
    fn drop(&mut self) {
        self.run.take();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
