use tokio::sync::broadcast;

/// Cooperative cancellation guard.
///
/// Every long-running task (listener accept loop, session relay, reaper,
/// retry scanner) holds one of these, subscribed to its supervisor's
/// broadcast channel. The supervisor cancels the whole group by sending a
/// single `()` or simply by dropping its sender.
///
/// Channel closure counts as cancellation too. That matters for sessions the
/// retry scanner spawns while a drain is already underway: they subscribe
/// after the notification was sent and would otherwise miss it, but they
/// still observe the channel closing once the scanner exits and the last
/// sender drops.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// Set once a notification (or channel closure) has been observed.
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Whether cancellation has already been observed by this guard.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for cancellation. Returns immediately on subsequent calls.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // A lag error is impossible (one value is ever sent) and a closed
        // channel means the supervisor is gone, so any result counts.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
