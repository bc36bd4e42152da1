//! Request/response correlation for blocking calls into the host.
//!
//! A transport worker thread registers a [`PendingCall`] under its
//! [`CallerId`], hands the resulting [`CallTicket`] to the host together
//! with the request, and blocks in [`CorrelationTable::wait_call`]. The host
//! thread later reports the handler's answer with
//! [`CorrelationTable::complete_call`], which wakes exactly that caller.
//!
//! # Thread Safety
//!
//! The map lock is held only to insert, look up or remove entries. Each
//! pending call has its own mutex/condvar pair that the waiter sleeps on, so
//! completing one call never contends with waiters of another. The two locks
//! are never held at the same time.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::IpcDefaults;
use crate::error::{BridgeError, Result};
use crate::shutdown::ShutdownSignal;
use crate::value::Value;

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_CALLER_ID: CallerId =
        CallerId(NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed));
}

/// Identity of a caller that may have one blocking call outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    /// The id of the current thread. Stable for the thread's lifetime.
    pub fn current() -> Self {
        THREAD_CALLER_ID.with(|id| *id)
    }

    /// Use an explicit token instead of the thread identity.
    pub fn from_raw(raw: u64) -> Self {
        CallerId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// Handle the host uses to report a result for one specific call.
///
/// The generation distinguishes successive calls from the same caller, so
/// an answer that arrives after its caller gave up is dropped instead of
/// completing the caller's next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallTicket {
    caller: CallerId,
    generation: u64,
}

impl CallTicket {
    pub fn caller(&self) -> CallerId {
        self.caller
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Default)]
struct PendingState {
    finished: bool,
    result: Option<Value>,
}

/// Bookkeeping for one in-flight blocking call.
#[derive(Debug)]
pub struct PendingCall {
    ticket: CallTicket,
    state: Mutex<PendingState>,
    ready: Condvar,
}

impl PendingCall {
    fn new(ticket: CallTicket) -> Self {
        Self {
            ticket,
            state: Mutex::new(PendingState::default()),
            ready: Condvar::new(),
        }
    }

    pub fn ticket(&self) -> CallTicket {
        self.ticket
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn complete(&self, result: Value) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.result = Some(result);
        state.finished = true;
        self.ready.notify_all();
        true
    }

    fn wake(&self) {
        let _state = self.state.lock();
        self.ready.notify_all();
    }
}

/// Table of in-flight blocking calls keyed by caller.
#[derive(Debug)]
pub struct CorrelationTable {
    calls: Mutex<HashMap<CallerId, Arc<PendingCall>>>,
    next_generation: AtomicU64,
    shutdown: ShutdownSignal,
    poll_slice: Duration,
}

impl CorrelationTable {
    /// Create a table using the default polling slice.
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self::with_poll_slice(shutdown, IpcDefaults::WAIT_POLL_SLICE)
    }

    /// Create a table that re-checks waiters every `poll_slice`.
    pub fn with_poll_slice(shutdown: ShutdownSignal, poll_slice: Duration) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown,
            poll_slice,
        }
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Register a new call for `caller`.
    ///
    /// Fails with `DuplicateCall` if the caller already has one outstanding;
    /// nested blocking calls from one thread are not supported.
    pub fn begin_call(&self, caller: CallerId) -> Result<Arc<PendingCall>> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&caller) {
            error!("Nested blocking call from {}: a call is already in flight", caller);
            return Err(BridgeError::DuplicateCall { caller });
        }

        let ticket = CallTicket {
            caller,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        let pending = Arc::new(PendingCall::new(ticket));
        calls.insert(caller, pending.clone());
        Ok(pending)
    }

    /// Deliver the result for a call and wake its waiter.
    ///
    /// Returns `false` when the caller is gone or the ticket belongs to an
    /// older call. That is a race with timeout or shutdown, not an error,
    /// and the result is dropped.
    pub fn complete_call(&self, ticket: CallTicket, result: Value) -> bool {
        let pending = self.calls.lock().get(&ticket.caller).cloned();
        match pending {
            Some(pending) if pending.ticket == ticket => pending.complete(result),
            Some(_) => {
                debug!(
                    "Dropping stale result for {} (generation {})",
                    ticket.caller, ticket.generation
                );
                false
            }
            None => {
                debug!("Dropping result for {}: caller no longer waiting", ticket.caller);
                false
            }
        }
    }

    /// Block until the caller's result arrives, `timeout` elapses, or
    /// shutdown is signalled.
    ///
    /// Timeout and shutdown produce a fault value rather than blocking
    /// further. The entry is removed from the table before returning on
    /// every path.
    pub fn wait_call(&self, caller: CallerId, timeout: Duration) -> Value {
        let pending = self.calls.lock().get(&caller).cloned();
        let Some(pending) = pending else {
            warn!("wait_call for {} without a pending call", caller);
            return BridgeError::NotPending { caller }.to_fault();
        };

        let outcome = self.wait_pending(&pending, timeout);
        self.remove(&pending);

        match outcome {
            Ok(value) => value,
            Err(e) => {
                match &e {
                    BridgeError::Timeout(after) => {
                        warn!("No response for {} after {:?}", caller, after)
                    }
                    _ => debug!("Wait for {} aborted by shutdown", caller),
                }
                e.to_fault()
            }
        }
    }

    /// Release a call without waiting for it.
    pub fn cancel_call(&self, caller: CallerId) -> bool {
        self.calls.lock().remove(&caller).is_some()
    }

    /// Wake every waiter so it re-checks shutdown immediately.
    pub fn wake_all(&self) {
        let pending: Vec<Arc<PendingCall>> = self.calls.lock().values().cloned().collect();
        for call in pending {
            call.wake();
        }
    }

    /// Complete every pending call with `result`.
    ///
    /// Returns how many calls were still unfinished. Their waiters return
    /// `result` and remove their own entries.
    pub fn abort_all(&self, result: Value) -> usize {
        let pending: Vec<Arc<PendingCall>> = self.calls.lock().values().cloned().collect();
        pending
            .into_iter()
            .filter(|call| call.complete(result.clone()))
            .count()
    }

    pub fn contains(&self, caller: CallerId) -> bool {
        self.calls.lock().contains_key(&caller)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    fn wait_pending(&self, pending: &PendingCall, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let mut state = pending.state.lock();

        loop {
            if state.finished {
                return Ok(state.result.take().unwrap_or_default());
            }
            self.shutdown.check()?;

            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout(timeout));
            }

            let slice = self.poll_slice.min(deadline - now);
            pending.ready.wait_for(&mut state, slice);
        }
    }

    fn remove(&self, pending: &Arc<PendingCall>) {
        let mut calls = self.calls.lock();
        let caller = pending.ticket.caller;
        if calls
            .get(&caller)
            .is_some_and(|current| Arc::ptr_eq(current, pending))
        {
            calls.remove(&caller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn table() -> CorrelationTable {
        CorrelationTable::with_poll_slice(ShutdownSignal::new(), Duration::from_millis(20))
    }

    #[test]
    fn test_current_caller_id_is_stable_per_thread() {
        let here = CallerId::current();
        assert_eq!(here, CallerId::current());

        let other = thread::spawn(CallerId::current).join().unwrap();
        assert_ne!(here, other);
    }

    #[test]
    fn test_begin_call_rejects_duplicate() {
        let table = table();
        let caller = CallerId::from_raw(1);

        table.begin_call(caller).unwrap();
        let err = table.begin_call(caller).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateCall { caller: c } if c == caller));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_complete_then_wait_returns_result() {
        let table = table();
        let caller = CallerId::from_raw(2);
        let pending = table.begin_call(caller).unwrap();

        assert!(table.complete_call(pending.ticket(), Value::from("done")));
        assert!(pending.is_finished());
        assert_eq!(
            table.wait_call(caller, Duration::from_secs(1)),
            Value::from("done")
        );
        assert!(!table.contains(caller));
    }

    #[test]
    fn test_complete_from_other_thread_wakes_waiter() {
        let table = Arc::new(table());
        let caller = CallerId::from_raw(3);
        let ticket = table.begin_call(caller).unwrap().ticket();

        let completer = {
            let table = table.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                table.complete_call(ticket, Value::Integer(42))
            })
        };

        assert_eq!(
            table.wait_call(caller, Duration::from_secs(5)),
            Value::Integer(42)
        );
        assert!(completer.join().unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_complete_unknown_caller_is_dropped() {
        let table = table();
        let ticket = CallTicket {
            caller: CallerId::from_raw(99),
            generation: 1,
        };
        assert!(!table.complete_call(ticket, Value::Void));
    }

    #[test]
    fn test_stale_ticket_does_not_complete_newer_call() {
        let table = table();
        let caller = CallerId::from_raw(4);

        let stale = table.begin_call(caller).unwrap().ticket();
        table.wait_call(caller, Duration::from_millis(10));

        let fresh = table.begin_call(caller).unwrap();
        assert!(!table.complete_call(stale, Value::from("late")));
        assert!(!fresh.is_finished());
        assert!(table.complete_call(fresh.ticket(), Value::from("fresh")));
    }

    #[test]
    fn test_wait_times_out_with_fault() {
        let table = table();
        let caller = CallerId::from_raw(5);
        table.begin_call(caller).unwrap();

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let result = table.wait_call(caller, timeout);
        let elapsed = started.elapsed();

        let fault = result.as_fault().expect("timeout should yield a fault");
        assert_eq!(fault.message, "No response received.");
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(20) + Duration::from_millis(200));
        assert!(!table.contains(caller));
    }

    #[test]
    fn test_shutdown_unblocks_waiter() {
        let signal = ShutdownSignal::new();
        let table = Arc::new(CorrelationTable::with_poll_slice(
            signal.clone(),
            Duration::from_secs(1),
        ));
        let caller = CallerId::from_raw(6);
        table.begin_call(caller).unwrap();

        let trigger = {
            let table = table.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                signal.trigger();
                table.wake_all();
            })
        };

        let started = Instant::now();
        let result = table.wait_call(caller, Duration::from_secs(30));
        trigger.join().unwrap();

        assert_eq!(result.as_fault().unwrap().code, -32000);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(table.is_empty());
    }

    #[test]
    fn test_wait_without_pending_call_returns_internal_fault() {
        let table = table();
        let started = Instant::now();
        let result = table.wait_call(CallerId::from_raw(7), Duration::from_secs(1));

        let fault = result.as_fault().unwrap();
        assert_eq!(fault.code, -32603);
        assert_eq!(fault.message, "No call in flight for caller-7");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_abort_all_answers_every_waiter() {
        let table = Arc::new(table());
        let waiters: Vec<_> = (10..13)
            .map(|raw| {
                let caller = CallerId::from_raw(raw);
                table.begin_call(caller).unwrap();
                let table = table.clone();
                thread::spawn(move || table.wait_call(caller, Duration::from_secs(30)))
            })
            .collect();

        let finished = table.begin_call(CallerId::from_raw(13)).unwrap();
        assert!(table.complete_call(finished.ticket(), Value::from("done")));

        assert_eq!(table.abort_all(Value::fault(-32601, "gone")), 3);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().as_fault().unwrap().code, -32601);
        }
        assert_eq!(
            table.wait_call(CallerId::from_raw(13), Duration::from_secs(1)),
            Value::from("done")
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_call_releases_entry() {
        let table = table();
        let caller = CallerId::from_raw(8);
        table.begin_call(caller).unwrap();
        assert!(table.cancel_call(caller));
        assert!(!table.cancel_call(caller));
        assert!(table.begin_call(caller).is_ok());
    }
}
