//! C4: the Picker Snapshot protocol — the hot-path synchronization
//! primitive callers block on while waiting for a ready remote client.
//!
//! A snapshot pairs the currently-published [`Picker`] with a one-shot
//! "newer snapshot available" notification. `update_picker` atomically
//! swaps in a new snapshot and only *then* fires the old one's
//! notification, so every waiter blocked on snapshot *k* is guaranteed to
//! wake no later than the moment snapshot *k+1* becomes observable
//! (invariant 3, §8).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::status::{client_closing, is_no_available_instance, is_restricted_picker_code, Status};

use super::remote_client::ConnectivityState;
use super::picker::{Pick, PickInfo, Picker};

struct Snapshot {
    picker: Option<Arc<dyn Picker>>,
    /// Fires exactly once, when a newer snapshot replaces this one.
    superseded: Notify,
}

impl Snapshot {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            picker: None,
            superseded: Notify::new(),
        })
    }
}

/// The Client's atomic pointer to the current snapshot. Readers take a
/// short-lived read lock only to clone the `Arc`; writers take a short-lived
/// write lock only to swap the pointer. No lock is ever held across an
/// `.await`.
pub struct PickerSnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl PickerSnapshotStore {
    /// Pre-populated with `{picker: None, notification: open}` so
    /// concurrent early calls block safely before the first resolver
    /// update arrives (§4.4 step 2).
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Snapshot::empty()),
        }
    }

    /// Atomically swaps in a snapshot wrapping `picker`, then wakes every
    /// waiter blocked on the previous one.
    pub fn update_picker(&self, picker: Arc<dyn Picker>) {
        let new_snapshot = Arc::new(Snapshot {
            picker: Some(picker),
            superseded: Notify::new(),
        });
        let previous = {
            let mut current = self.current.write().unwrap();
            std::mem::replace(&mut *current, new_snapshot)
        };
        previous.superseded.notify_waiters();
    }

    /// Marks the snapshot terminal (`picker: None`, as if no balancer had
    /// ever run) and wakes every remaining waiter. Used by `Client::close`.
    pub fn close(&self) {
        let previous = {
            let mut current = self.current.write().unwrap();
            std::mem::replace(&mut *current, Snapshot::empty())
        };
        previous.superseded.notify_waiters();
    }
}

impl Default for PickerSnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// `pick(fast_fail, info)` from §4.3, parameterized over an optional caller
/// deadline and the client's own shutdown signal. Loops until it has a pick
/// against a client whose state is Ready, the deadline elapses, or the
/// client starts shutting down.
pub async fn pick(
    store: &PickerSnapshotStore,
    client_closed: &Notify,
    is_client_closed: impl Fn() -> bool,
    deadline: Option<Instant>,
    fast_fail: bool,
    info: &PickInfo<'_>,
) -> Result<Pick, Status> {
    loop {
        if is_client_closed() {
            return Err(client_closing());
        }

        let snapshot = store.current.read().unwrap().clone();

        // Register for "this snapshot was superseded" before inspecting its
        // picker below. `Notify::notified()` remembers a `notify_waiters()`
        // call that lands between this line and the future's first poll, so
        // a concurrent `update_picker` racing the checks below can never be
        // missed — this ordering is what makes invariant 3 (§8) hold.
        let notified = snapshot.superseded.notified();
        tokio::pin!(notified);

        if let Some(picker) = snapshot.picker.as_ref() {
            match picker.pick(info) {
                Ok(result) => {
                    if result.remote_client.state() == ConnectivityState::Ready {
                        return Ok(result);
                    }
                }
                Err(status) if is_no_available_instance(&status) => {}
                Err(status) if is_restricted_picker_code(status.code()) => {
                    return Err(Status::internal(format!(
                        "picker returned a restricted control-plane code: {status}"
                    )));
                }
                Err(status) => {
                    if fast_fail {
                        return Err(Status::unavailable(status.message().to_string()));
                    }
                }
            }
        }

        wait_for_change(&mut notified, client_closed, &is_client_closed, deadline).await?;
    }
}

async fn wait_for_change(
    notified: &mut (impl std::future::Future<Output = ()> + Unpin),
    client_closed: &Notify,
    is_client_closed: &impl Fn() -> bool,
    deadline: Option<Instant>,
) -> Result<(), Status> {
    // A second, cheap guard: catches a `close()` whose `notify_waiters()`
    // already fired before `client_notified` below was registered. The flag
    // itself never resets, so this check never has a false positive.
    if is_client_closed() {
        return Err(client_closing());
    }
    let client_notified = client_closed.notified();
    tokio::pin!(client_notified);

    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = notified => Ok(()),
                _ = &mut client_notified => Err(client_closing()),
                _ = tokio::time::sleep_until(deadline) => {
                    Err(Status::deadline_exceeded("deadline exceeded while waiting for a ready remote client"))
                }
            }
        }
        None => {
            tokio::select! {
                _ = notified => Ok(()),
                _ = &mut client_notified => Err(client_closing()),
            }
        }
    }
}

/// Convenience for constructing a deadline from "now + duration", mirroring
/// how callers typically express per-call timeouts.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::endpoint::Endpoint;
    use crate::client::remote_client::stub::StubRemoteClient;
    use crate::client::remote_client::RemoteClient;
    use crate::client::picker::EmptyPicker;
    use crate::client::balancer::round_robin::RoundRobinPicker;
    use std::time::Duration as StdDuration;

    fn info() -> PickInfo<'static> {
        PickInfo { method: "/X/Y" }
    }

    #[tokio::test]
    async fn picker_not_yet_available_times_out_with_deadline_exceeded() {
        let store = PickerSnapshotStore::new();
        let closed_notify = Notify::new();
        let err = pick(
            &store,
            &closed_notify,
            || false,
            Some(deadline_after(StdDuration::from_millis(10))),
            false,
            &info(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn picker_swap_unblocks_a_waiter_before_its_deadline() {
        let store = Arc::new(PickerSnapshotStore::new());
        let closed_notify = Arc::new(Notify::new());

        let waiter_store = store.clone();
        let waiter_closed = closed_notify.clone();
        let waiter = tokio::spawn(async move {
            pick(
                &waiter_store,
                &waiter_closed,
                || false,
                Some(deadline_after(StdDuration::from_secs(1))),
                false,
                &info(),
            )
            .await
        });

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let client = StubRemoteClient::new(Endpoint::new("tcp", "a"), Arc::new(|_| {}));
        client.connect().await;
        store.update_picker(Arc::new(RoundRobinPicker::new(vec![client])));

        let result = tokio::time::timeout(StdDuration::from_millis(200), waiter)
            .await
            .expect("waiter must finish well before its 1s deadline")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn client_closed_is_reported_immediately() {
        let store = PickerSnapshotStore::new();
        let closed_notify = Notify::new();
        let err = pick(&store, &closed_notify, || true, None, false, &info())
            .await
            .unwrap_err();
        assert!(crate::status::is_client_closing(&err));
    }

    #[tokio::test]
    async fn restricted_picker_code_is_rewritten_to_internal() {
        struct RestrictedPicker;
        impl Picker for RestrictedPicker {
            fn pick(&self, _info: &PickInfo<'_>) -> Result<Pick, Status> {
                Err(Status::not_found("nope"))
            }
        }
        let store = PickerSnapshotStore::new();
        store.update_picker(Arc::new(RestrictedPicker));
        let closed_notify = Notify::new();
        let err = pick(&store, &closed_notify, || false, None, false, &info())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }

    #[tokio::test]
    async fn fast_fail_returns_unavailable_immediately_on_generic_picker_error() {
        struct FailingPicker;
        impl Picker for FailingPicker {
            fn pick(&self, _info: &PickInfo<'_>) -> Result<Pick, Status> {
                Err(Status::permission_denied("nope"))
            }
        }
        let store = PickerSnapshotStore::new();
        store.update_picker(Arc::new(FailingPicker));
        let closed_notify = Notify::new();
        let err = pick(&store, &closed_notify, || false, None, true, &info())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Unavailable);
    }

    #[tokio::test]
    async fn empty_picker_keeps_waiting_rather_than_failing_fast() {
        let store = Arc::new(PickerSnapshotStore::new());
        store.update_picker(Arc::new(EmptyPicker));
        let closed_notify = Notify::new();
        let err = pick(
            &store,
            &closed_notify,
            || false,
            Some(deadline_after(StdDuration::from_millis(20))),
            true, // even with fast_fail, NoAvailableInstance means "keep waiting"
            &info(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::DeadlineExceeded);
    }
}
