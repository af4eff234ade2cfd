//! The Picker contract (§3, §4.2): a stateless-or-atomically-stateful
//! selector that chooses one Ready remote client per call. Built fresh by
//! the balancer on every state change and swapped into the
//! [`super::snapshot::PickerSnapshot`].

use std::sync::Arc;

use crate::status::Status;

use super::remote_client::RemoteClient;

/// Information about the call being picked for. Kept intentionally thin —
/// the core forwards only what a picker could plausibly need to make a
/// routing decision; anything richer belongs in `Attributes` on the pick.
pub struct PickInfo<'a> {
    pub method: &'a str,
}

/// The result of a successful pick: a view of the chosen remote client plus
/// a callback the caller uses to report the outcome of the call back to the
/// picker (or whatever richer policy it's wired to — load reporting,
/// circuit breaking, etc. are all out of scope here; this crate's pickers
/// only log).
pub struct Pick {
    pub remote_client: Arc<dyn RemoteClient>,
    report: Option<Box<dyn FnOnce(Option<&Status>) + Send>>,
}

impl std::fmt::Debug for Pick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pick")
            .field("remote_client", &self.remote_client)
            .field("report", &self.report.is_some())
            .finish()
    }
}

impl Pick {
    pub fn new(
        remote_client: Arc<dyn RemoteClient>,
        report: impl FnOnce(Option<&Status>) + Send + 'static,
    ) -> Self {
        Self {
            remote_client,
            report: Some(Box::new(report)),
        }
    }

    /// Reports the outcome of the call this pick was used for. `None` means
    /// success. Calling this more than once is a caller bug; the second
    /// call is silently ignored rather than panicking, since a dropped
    /// report is already harmless for this crate's pickers.
    pub fn report(&mut self, outcome: Option<&Status>) {
        if let Some(report) = self.report.take() {
            report(outcome);
        }
    }
}

pub trait Picker: Send + Sync {
    fn pick(&self, info: &PickInfo<'_>) -> Result<Pick, Status>;
}

/// A picker with zero ready clients. Every call returns the distinguished
/// `NoAvailableInstance` status so callers know to back off and retry
/// rather than fail fast (§4.3 step 3).
pub struct EmptyPicker;

impl Picker for EmptyPicker {
    fn pick(&self, _info: &PickInfo<'_>) -> Result<Pick, Status> {
        Err(crate::status::no_available_instance())
    }
}
