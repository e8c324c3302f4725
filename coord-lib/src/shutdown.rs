use tokio::sync::watch;

/// Cancellation signal observed by the blocking primitives (cancellable
/// borrow, scan, lock retries and the pub/sub listener).
///
/// The signal fires when [`ShutdownSignal::trigger`] is called or when the
/// `ShutdownSignal` is dropped.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    is_shutdown: bool,

    notify: watch::Receiver<bool>,
}

/// The sending half of a [`Shutdown`].
#[derive(Debug)]
pub struct ShutdownSignal {
    notify: watch::Sender<bool>,
}

/// Create a linked trigger / receiver pair.
pub fn channel() -> (ShutdownSignal, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownSignal { notify: tx },
        Shutdown {
            is_shutdown: false,
            notify: rx,
        },
    )
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.notify.send_replace(true);
    }

    /// A new receiver observing this signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify: self.notify.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown || *self.notify.borrow() || self.notify.has_changed().is_err()
    }

    /// Receive the shutdown notice, waiting if necessary.
    ///
    /// Cancel safe: it can be used as a `tokio::select!` branch.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // Resolves once the value flips to `true` or the sender goes away.
        let _ = self.notify.wait_for(|fired| *fired).await;

        self.is_shutdown = true;
    }
}
