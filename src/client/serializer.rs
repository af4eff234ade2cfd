//! The callback serializer described in §4.5/§5/§9: breaks the cyclic
//! Client ↔ Balancer ↔ Manager ↔ Remote-Client dependency by dispatching
//! state-listener callbacks through a queue that owns none of the
//! participants' locks, guaranteeing listener *i* happens-before listener
//! *i+1* for a single remote client while different clients' listeners may
//! run concurrently (one serializer per remote client).

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

pub struct CallbackSerializer {
    sender: mpsc::UnboundedSender<Callback>,
    worker: JoinHandle<()>,
}

impl CallbackSerializer {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Callback>();
        let worker = tokio::spawn(async move {
            while let Some(callback) = receiver.recv().await {
                callback();
            }
        });
        Self { sender, worker }
    }

    /// Schedules `callback` to run after every previously-scheduled callback
    /// on this serializer has completed. If the serializer has already been
    /// stopped, the callback is dropped and the drop is logged rather than
    /// silently swallowed.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(callback)).is_err() {
            debug!("callback serializer stopped; dropping scheduled callback");
        }
    }

    /// Stops accepting new callbacks and waits for the ones already queued
    /// to finish draining.
    pub async fn stop(self) {
        drop(self.sender);
        let _ = self.worker.await;
    }
}

impl Default for CallbackSerializer {
    fn default() -> Self {
        Self::new()
    }
}
