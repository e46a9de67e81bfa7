use alloc::sync::Arc;

use rdma_shim::{log, CqHandle, WorkCompletion};

use crate::context::{Context, ContextRef};
use crate::{ControlpathError, DatapathError};

/// An abstraction completion queue (CQ)
pub struct CompletionQueue {
    _ctx: Arc<Context>,
    cq: CqHandle,
    capacity: u32,
    alive: bool,
}

/// Anything a completion can be polled from.
///
/// Lets the polling protocol run against a scripted source in tests.
pub trait CompletionSource {
    /// Poll at most `completions.len()` entries, return the filled prefix
    fn poll<'c>(
        &self,
        completions: &'c mut [WorkCompletion],
    ) -> Result<&'c mut [WorkCompletion], DatapathError>;
}

impl CompletionQueue {
    /// Currently, we don't need complex CQ handler as the callback
    /// Thus, we simplify the creation process.
    ///
    /// `max_cq_entries` is the maximum size of the completion queue
    ///
    /// # Errors:
    /// - `CreationError` : This error meaning there is something wrong
    /// when creating completion queue with the given context and arguments.
    /// Check them carefully if they are valid and legal.
    ///
    pub fn create(context: &ContextRef, max_cq_entries: u32) -> Result<Self, ControlpathError> {
        let cq = context
            .verbs()
            .create_cq(context.raw_handle(), max_cq_entries)
            .map_err(|e| {
                log::error!("failed to create a CQ with {} entries: {}", max_cq_entries, e);
                ControlpathError::CreationError("CQ", e)
            })?;
        log::info!("Opening a completion queue");

        Ok(Self {
            _ctx: context.clone(),
            cq,
            capacity: max_cq_entries,
            alive: true,
        })
    }

    pub fn get_ctx(&self) -> &Arc<Context> {
        // not clone, as the clone takes time
        &self._ctx
    }

    #[inline]
    pub fn raw_handle(&self) -> CqHandle {
        self.cq
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Destroy the CQ. Every QP using it must be gone.
    pub fn destroy(self: Arc<Self>) -> Result<(), ControlpathError> {
        let mut cq = Arc::try_unwrap(self).map_err(|_| {
            log::error!("CQ destroyed while still shared");
            ControlpathError::TeardownOrder("CQ")
        })?;
        cq.release()
    }

    fn release(&mut self) -> Result<(), ControlpathError> {
        if self.alive {
            self._ctx.verbs().destroy_cq(self.cq).map_err(|e| {
                log::error!("failed to destroy the CQ: {}", e);
                ControlpathError::DestroyError("CQ", e)
            })?;
            self.alive = false;
        }
        Ok(())
    }
}

impl CompletionSource for CompletionQueue {
    /// Poll multiple completions from the CQ
    #[inline]
    fn poll<'c>(
        &self,
        completions: &'c mut [WorkCompletion],
    ) -> Result<&'c mut [WorkCompletion], DatapathError> {
        let n = self
            ._ctx
            .verbs()
            .poll_cq(self.cq, completions)
            .map_err(DatapathError::PollCQError)?;
        Ok(&mut completions[0..n])
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("CQ leaked on drop: {}", e);
        }
    }
}

/// Busy-poll `source` for a single completion, at most `budget` times.
///
/// There is no back-off between attempts; the budget is the only way out
/// when nothing ever completes.
///
/// # Errors
/// - `PollBudgetExhausted`: `budget` polls returned nothing
/// - `CompletionError`: the completion carries a non-success status
/// - `PollCQError`: the poll call itself failed
pub fn poll_one<S: CompletionSource + ?Sized>(
    source: &S,
    budget: usize,
) -> Result<WorkCompletion, DatapathError> {
    let mut completions = [WorkCompletion::default(); 1];
    for _ in 0..budget {
        if let Some(wc) = source.poll(&mut completions)?.first() {
            if wc.status.is_success() {
                return Ok(*wc);
            }
            log::error!(
                "Poll failed with status {} (work request ID: {})",
                wc.status,
                wc.wr_id
            );
            return Err(DatapathError::CompletionError {
                status: wc.status,
                wr_id: wc.wr_id,
            });
        }
    }
    log::error!("no completion after {} polls", budget);
    Err(DatapathError::PollBudgetExhausted(budget))
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use rdma_shim::{WcOpcode, WcStatus, WorkCompletion};

    use super::*;

    /// Returns nothing for `empty_polls` polls, then `then` forever
    struct Scripted {
        polls: Cell<usize>,
        empty_polls: usize,
        then: Option<WorkCompletion>,
    }

    impl Scripted {
        fn new(empty_polls: usize, then: Option<WorkCompletion>) -> Self {
            Self {
                polls: Cell::new(0),
                empty_polls,
                then,
            }
        }
    }

    impl CompletionSource for Scripted {
        fn poll<'c>(
            &self,
            completions: &'c mut [WorkCompletion],
        ) -> Result<&'c mut [WorkCompletion], DatapathError> {
            let n = self.polls.get();
            self.polls.set(n + 1);
            match self.then {
                Some(wc) if n >= self.empty_polls => {
                    completions[0] = wc;
                    Ok(&mut completions[..1])
                }
                _ => Ok(&mut completions[..0]),
            }
        }
    }

    fn wc(status: WcStatus) -> WorkCompletion {
        WorkCompletion {
            wr_id: 42,
            status,
            opcode: WcOpcode::RdmaRead,
            byte_len: 4,
            qp_num: 0x100,
        }
    }

    #[test]
    fn silent_source_exhausts_exactly_the_budget() {
        let source = Scripted::new(usize::MAX, None);
        let res = poll_one(&source, 1000);
        assert!(matches!(res, Err(DatapathError::PollBudgetExhausted(1000))));
        assert_eq!(source.polls.get(), 1000);

        let source = Scripted::new(usize::MAX, None);
        assert!(poll_one(&source, 0).is_err());
        assert_eq!(source.polls.get(), 0);
    }

    #[test]
    fn late_success_within_budget() {
        let source = Scripted::new(999, Some(wc(WcStatus::Success)));
        let got = poll_one(&source, 1000).expect("completion");
        assert_eq!(got.wr_id, 42);
        assert_eq!(source.polls.get(), 1000);
    }

    #[test]
    fn completion_one_poll_too_late() {
        let source = Scripted::new(1000, Some(wc(WcStatus::Success)));
        assert!(matches!(
            poll_one(&source, 1000),
            Err(DatapathError::PollBudgetExhausted(1000))
        ));
    }

    #[test]
    fn error_status_carries_wr_id() {
        let source = Scripted::new(3, Some(wc(WcStatus::RemAccessErr)));
        match poll_one(&source, 10) {
            Err(DatapathError::CompletionError { status, wr_id }) => {
                assert_eq!(status, WcStatus::RemAccessErr);
                assert_eq!(wr_id, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(source.polls.get(), 4);
    }
}
