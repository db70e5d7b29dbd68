//! Completion queues.
//!
//! A CQ is a bounded MPMC queue. Producers are the QPs bound to it (each pushes under its own QP
//! lock, so completions of one QP keep their order), consumers are pollers. A push into a full
//! queue moves the CQ into a sticky overrun state that every later poll reports.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crossbeam::queue::ArrayQueue;

use bluerdma_api::net::{WcFlags, WcStatus, WorkCompletion};
use bluerdma_api::Handle;

use crate::log;
use crate::{Error, Result};

const DISARMED: u8 = 0;
const ARMED_NEXT: u8 = 1;
const ARMED_SOLICITED: u8 = 2;

#[derive(Debug)]
pub struct CompletionQueue {
    handle: Handle,
    queue: ArrayQueue<WorkCompletion>,
    overrun: AtomicBool,
    arm: AtomicU8,
    events: AtomicU64,
}

impl CompletionQueue {
    pub(crate) fn new(handle: Handle, capacity: usize) -> Self {
        CompletionQueue {
            handle,
            queue: ArrayQueue::new(capacity),
            overrun: AtomicBool::new(false),
            arm: AtomicU8::new(DISARMED),
            events: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Number of completions waiting to be polled.
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_overrun(&self) -> bool {
        self.overrun.load(Ordering::Acquire)
    }

    fn overrun_error(&self) -> Error {
        Error::ResourceExhausted(format!(
            "completion queue {:?} overran its capacity of {}",
            self.handle,
            self.capacity()
        ))
    }

    pub(crate) fn push(&self, wc: WorkCompletion) -> Result<()> {
        if self.is_overrun() {
            return Err(self.overrun_error());
        }
        let notify = self.disarm_for(&wc);
        if self.queue.push(wc).is_err() {
            self.overrun.store(true, Ordering::Release);
            log::error!(
                "completion queue {:?} overrun, capacity: {}",
                self.handle,
                self.capacity()
            );
            return Err(self.overrun_error());
        }
        if notify {
            self.events.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    // Consumes the arm if `wc` should raise an event.
    fn disarm_for(&self, wc: &WorkCompletion) -> bool {
        let solicited = wc.wc_flags.contains(WcFlags::SOLICITED) || wc.status != WcStatus::Success;
        self.arm
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |arm| match arm {
                ARMED_NEXT => Some(DISARMED),
                ARMED_SOLICITED if solicited => Some(DISARMED),
                _ => None,
            })
            .is_ok()
    }

    /// Moves up to `max_entries` completions into `wc`. Never blocks.
    pub fn poll(&self, max_entries: usize, wc: &mut Vec<WorkCompletion>) -> Result<usize> {
        if self.is_overrun() {
            return Err(self.overrun_error());
        }
        let mut n = 0;
        while n < max_entries {
            match self.queue.pop() {
                Some(c) => {
                    wc.push(c);
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    /// Arms a one-shot event for the next completion, or for the next solicited or failed one.
    /// An armed "next completion" request is not narrowed by a later solicited-only request.
    pub fn req_notify(&self, solicited_only: bool) {
        if solicited_only {
            let _ = self.arm.compare_exchange(
                DISARMED,
                ARMED_SOLICITED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        } else {
            self.arm.store(ARMED_NEXT, Ordering::Release);
        }
    }

    /// Returns and clears the number of events raised since the last call.
    pub fn take_events(&self) -> u64 {
        self.events.swap(0, Ordering::AcqRel)
    }
}
