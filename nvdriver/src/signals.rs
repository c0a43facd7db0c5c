use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU8, Ordering};

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Signals that end the process.
pub const TERMINATING: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
    Signal::SIGTERM,
];

/// Signals that only interrupt a wait.
pub const WAKE: [Signal; 2] = [Signal::SIGUSR1, Signal::SIGUSR2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop at the next step boundary and cancel in-flight waits.
    Abort,
    /// Leave the wait and run the orderly shutdown.
    Shutdown,
    Wake,
    Ignore,
}

/// A state that decides what a terminating signal means while it is current.
pub trait Stage: Copy + Send + Sync + 'static {
    fn code(self) -> u8;

    fn from_code(code: u8) -> Self;

    fn on_terminate(self) -> SignalAction;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub action: SignalAction,
    pub signal: Signal,
}

/// Routes delivered signals according to the current stage.
///
/// The stage lives in an atomic cell so the listener tasks read it without
/// locking. Aborts cancel the shared token; everything except ignored
/// signals is queued for the control flow.
#[derive(Debug)]
pub struct SignalRouter<S> {
    stage: AtomicU8,
    cancel: CancellationToken,
    aborted_by: StdMutex<Option<Signal>>,
    tx: mpsc::UnboundedSender<Directive>,
    rx: Mutex<mpsc::UnboundedReceiver<Directive>>,
    _stage: PhantomData<fn() -> S>,
}

impl<S: Stage> SignalRouter<S> {
    pub fn new(initial: S) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        SignalRouter {
            stage: AtomicU8::new(initial.code()),
            cancel: CancellationToken::new(),
            aborted_by: StdMutex::new(None),
            tx,
            rx: Mutex::new(rx),
            _stage: PhantomData,
        }
    }

    pub fn stage(&self) -> S {
        S::from_code(self.stage.load(Ordering::SeqCst))
    }

    pub fn set_stage(&self, stage: S) {
        self.stage.store(stage.code(), Ordering::SeqCst);
    }

    /// Cancelled on the first abort.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The signal behind the first abort, if any.
    pub fn abort_signal(&self) -> Option<Signal> {
        *self
            .aborted_by
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dispatch(&self, signal: Signal) -> SignalAction {
        let action = if TERMINATING.contains(&signal) {
            self.stage().on_terminate()
        } else if WAKE.contains(&signal) {
            SignalAction::Wake
        } else {
            SignalAction::Ignore
        };

        match action {
            SignalAction::Abort => {
                warn!("Caught {}, aborting", signal.as_str());
                self.aborted_by
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get_or_insert(signal);
                self.cancel.cancel();
            }
            SignalAction::Shutdown => info!("Caught {}, shutting down", signal.as_str()),
            SignalAction::Wake => debug!("Caught {}", signal.as_str()),
            SignalAction::Ignore => {
                debug!("Ignoring {}", signal.as_str());
                return action;
            }
        }
        // the receiver lives as long as the router
        let _ = self.tx.send(Directive { action, signal });
        action
    }

    pub async fn next(&self) -> Option<Directive> {
        self.rx.lock().await.recv().await
    }
}

/// Spawn one listener task per handled signal, all feeding `router`.
pub fn spawn_listener<S: Stage>(router: Arc<SignalRouter<S>>) -> io::Result<()> {
    for sig in TERMINATING.into_iter().chain(WAKE) {
        let mut stream = signal(SignalKind::from_raw(sig as i32))?;
        let router = router.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                router.dispatch(sig);
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::raise;
    use serial_test::serial;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Busy,
        Idle,
        Done,
    }

    impl Stage for Phase {
        fn code(self) -> u8 {
            self as u8
        }

        fn from_code(code: u8) -> Self {
            match code {
                0 => Phase::Busy,
                1 => Phase::Idle,
                _ => Phase::Done,
            }
        }

        fn on_terminate(self) -> SignalAction {
            match self {
                Phase::Busy => SignalAction::Abort,
                Phase::Idle => SignalAction::Shutdown,
                Phase::Done => SignalAction::Ignore,
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_follows_stage() {
        let router = SignalRouter::new(Phase::Idle);
        assert_eq!(router.dispatch(Signal::SIGTERM), SignalAction::Shutdown);
        assert!(!router.cancel_token().is_cancelled());

        router.set_stage(Phase::Busy);
        assert_eq!(router.stage(), Phase::Busy);
        assert_eq!(router.dispatch(Signal::SIGINT), SignalAction::Abort);
        assert_eq!(router.dispatch(Signal::SIGTERM), SignalAction::Abort);
        assert!(router.cancel_token().is_cancelled());
        assert_eq!(router.abort_signal(), Some(Signal::SIGINT));

        router.set_stage(Phase::Done);
        assert_eq!(router.dispatch(Signal::SIGTERM), SignalAction::Ignore);
        assert_eq!(router.dispatch(Signal::SIGUSR1), SignalAction::Wake);
        assert_eq!(router.dispatch(Signal::SIGCHLD), SignalAction::Ignore);

        let queued: Vec<SignalAction> = [
            router.next().await,
            router.next().await,
            router.next().await,
            router.next().await,
        ]
        .into_iter()
        .map(|d| d.unwrap().action)
        .collect();
        assert_eq!(
            queued,
            vec![
                SignalAction::Shutdown,
                SignalAction::Abort,
                SignalAction::Abort,
                SignalAction::Wake
            ]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_listener_receives_process_signals() {
        let router = Arc::new(SignalRouter::new(Phase::Idle));
        spawn_listener(router.clone()).unwrap();

        raise(Signal::SIGUSR2).unwrap();
        let directive = tokio::time::timeout(Duration::from_secs(5), router.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(directive.action, SignalAction::Wake);
        assert_eq!(directive.signal, Signal::SIGUSR2);
    }
}
