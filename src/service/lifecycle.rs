//! Service lifecycle: `unused -> initialized -> running -> stopping ->
//! stopped`, with `errored` reachable from any non-terminal state.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Unused,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl ServiceState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ServiceState::*;
        match (self, next) {
            (from, Errored) => !from.is_terminal(),
            (Unused, Initialized) | (Initialized, Running) | (Running, Stopping) | (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

/// What a service does while it is running.
pub trait ServiceBackend: Send + Sync + 'static {
    /// Begin serving. `stop` lets the backend request its own shutdown.
    fn start(&self, stop: StopHandle) -> Result<()>;

    /// Ask the backend to wind down. Must not block.
    fn interrupt(&self);

    /// Block until the backend has wound down.
    fn join(&self) -> Result<()>;
}

/// Lifecycle callback; returning `false` vetoes the transition.
pub type LifecycleCallback = Box<dyn FnMut() -> bool + Send>;

/// Sees every state change as `(from, to)`, after it happened.
pub type TransitionObserver = Box<dyn Fn(ServiceState, ServiceState) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_initialized: Option<LifecycleCallback>,
    on_started: Option<LifecycleCallback>,
    on_interrupted: Option<LifecycleCallback>,
    on_stopped: Option<LifecycleCallback>,
}

struct Status {
    state: ServiceState,
    joining: bool,
}

struct Shared<B> {
    name: String,
    backend: B,
    status: Mutex<Status>,
    changed: Condvar,
    callbacks: Mutex<Callbacks>,
    observer: Mutex<Option<TransitionObserver>>,
}

/// Requests shutdown of the service that handed it out.
#[derive(Clone)]
pub struct StopHandle(Arc<dyn Fn() + Send + Sync>);

impl StopHandle {
    pub fn request_stop(&self) {
        (self.0)()
    }

    /// A handle that does nothing, for driving backends directly.
    pub fn detached() -> Self {
        Self(Arc::new(|| {}))
    }
}

/// A service with a strict lifecycle around a backend.
///
/// `start` belongs to the owner. `stop` and `join` may be called from any
/// thread; `stop` only requests shutdown, `join` waits for it.
pub struct Service<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for Service<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: ServiceBackend> Service<B> {
    pub fn new(name: impl Into<String>, backend: B) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                backend,
                status: Mutex::new(Status {
                    state: ServiceState::Unused,
                    joining: false,
                }),
                changed: Condvar::new(),
                callbacks: Mutex::new(Callbacks::default()),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn state(&self) -> ServiceState {
        self.shared.status.lock().state
    }

    pub fn set_on_initialized(&self, callback: impl FnMut() -> bool + Send + 'static) {
        self.shared.callbacks.lock().on_initialized = Some(Box::new(callback));
    }

    pub fn set_on_started(&self, callback: impl FnMut() -> bool + Send + 'static) {
        self.shared.callbacks.lock().on_started = Some(Box::new(callback));
    }

    pub fn set_on_interrupted(&self, callback: impl FnMut() -> bool + Send + 'static) {
        self.shared.callbacks.lock().on_interrupted = Some(Box::new(callback));
    }

    pub fn set_on_stopped(&self, callback: impl FnMut() -> bool + Send + 'static) {
        self.shared.callbacks.lock().on_stopped = Some(Box::new(callback));
    }

    /// Install the transition observer, replacing any previous one.
    pub fn set_on_transition(&self, observer: impl Fn(ServiceState, ServiceState) + Send + Sync + 'static) {
        *self.shared.observer.lock() = Some(Box::new(observer));
    }

    /// Move to `state` under the status lock and return the old state.
    /// Report the change with [`Self::notify`] once the lock is released.
    fn swap_state(status: &mut Status, state: ServiceState) -> ServiceState {
        let from = status.state;
        debug_assert!(
            from.can_transition_to(state),
            "illegal service transition {} -> {}",
            from.name(),
            state.name()
        );
        status.state = state;
        from
    }

    fn notify(&self, from: ServiceState, to: ServiceState) {
        self.shared.changed.notify_all();
        debug!(service = %self.shared.name, from = from.name(), to = to.name(), "service state changed");
        if let Some(observer) = self.shared.observer.lock().as_ref() {
            observer(from, to);
        }
    }

    /// Move from `from` to `to`. Returns `false` if the state has moved on.
    fn advance(&self, from: ServiceState, to: ServiceState) -> bool {
        let mut status = self.shared.status.lock();
        if status.state != from {
            return false;
        }
        Self::swap_state(&mut status, to);
        drop(status);
        self.notify(from, to);
        true
    }

    /// Move to `errored` unless the service already finished.
    fn fail(&self) {
        let mut status = self.shared.status.lock();
        if status.state.is_terminal() {
            return;
        }
        let from = Self::swap_state(&mut status, ServiceState::Errored);
        drop(status);
        self.notify(from, ServiceState::Errored);
    }

    /// Run a callback, then move `from -> to`, or to `errored` on a veto.
    fn transition(
        &self,
        from: ServiceState,
        to: ServiceState,
        pick: fn(&mut Callbacks) -> &mut Option<LifecycleCallback>,
    ) -> Result<()> {
        let allowed = {
            let mut callbacks = self.shared.callbacks.lock();
            pick(&mut callbacks).as_mut().map_or(true, |callback| callback())
        };
        if !allowed {
            error!(service = %self.shared.name, state = to.name(), "transition vetoed");
            self.fail();
            return Err(Error::TransitionVetoed(to.name()));
        }
        if self.advance(from, to) {
            Ok(())
        } else {
            Err(self.invalid("transition"))
        }
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidServiceState {
            action,
            state: self.state().name(),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.state() != ServiceState::Unused {
            return Err(self.invalid("start"));
        }
        self.transition(ServiceState::Unused, ServiceState::Initialized, |c| &mut c.on_initialized)?;

        let weak = Arc::downgrade(&self.shared);
        let stop = StopHandle(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                let _ = Service { shared }.stop();
            }
        }));
        if let Err(err) = self.shared.backend.start(stop) {
            error!(service = %self.shared.name, error = %err, "service failed to start");
            self.fail();
            return Err(err);
        }

        if let Err(err) = self.transition(ServiceState::Initialized, ServiceState::Running, |c| &mut c.on_started) {
            self.shared.backend.interrupt();
            let _ = self.shared.backend.join();
            return Err(err);
        }
        info!(service = %self.shared.name, "service running");
        Ok(())
    }

    /// Request shutdown. Repeated requests are no-ops.
    pub fn stop(&self) -> Result<()> {
        {
            let mut status = self.shared.status.lock();
            match status.state {
                ServiceState::Running => {}
                ServiceState::Stopping | ServiceState::Stopped => return Ok(()),
                state => {
                    return Err(Error::InvalidServiceState {
                        action: "stop",
                        state: state.name(),
                    })
                }
            }
            // Claim the transition so concurrent stops see `stopping`.
            Self::swap_state(&mut status, ServiceState::Stopping);
        }
        self.notify(ServiceState::Running, ServiceState::Stopping);

        let allowed = {
            let mut callbacks = self.shared.callbacks.lock();
            callbacks.on_interrupted.as_mut().map_or(true, |callback| callback())
        };
        if !allowed {
            // Settled before the backend can wind down, so `join` never
            // reports `stopped` first.
            self.fail();
            self.shared.backend.interrupt();
            return Err(Error::TransitionVetoed(ServiceState::Stopping.name()));
        }
        self.shared.backend.interrupt();
        info!(service = %self.shared.name, "service stopping");
        Ok(())
    }

    /// Wait until the service has stopped.
    pub fn join(&self) -> Result<()> {
        {
            let mut status = self.shared.status.lock();
            loop {
                match status.state {
                    ServiceState::Unused | ServiceState::Initialized | ServiceState::Errored => {
                        return Err(Error::InvalidServiceState {
                            action: "join",
                            state: status.state.name(),
                        })
                    }
                    ServiceState::Stopped => return Ok(()),
                    _ if !status.joining => break,
                    _ => self.shared.changed.wait(&mut status),
                }
            }
            status.joining = true;
        }

        let joined = self.shared.backend.join();
        if joined.is_ok() {
            // A backend that wound down on its own still passes through
            // `stopping`.
            self.advance(ServiceState::Running, ServiceState::Stopping);
        }
        let result = match (joined, self.state()) {
            (Err(err), _) => {
                self.fail();
                Err(err)
            }
            (Ok(()), ServiceState::Errored) => Err(Error::InvalidServiceState {
                action: "join",
                state: ServiceState::Errored.name(),
            }),
            (Ok(()), _) => self.transition(ServiceState::Stopping, ServiceState::Stopped, |c| &mut c.on_stopped),
        };

        self.shared.status.lock().joining = false;
        self.shared.changed.notify_all();
        if result.is_ok() {
            info!(service = %self.shared.name, "service stopped");
        }
        result
    }
}
