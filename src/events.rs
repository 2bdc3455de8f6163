//! Named-event pub/sub.
//!
//! [`EventEmitter`] keeps, per event name, an ordered list of listeners.
//! Emitting invokes them synchronously on the calling task, in registration
//! order. The connection uses it to publish lifecycle transitions.
//!
//! # Usage
//!
//! ```
//! use hubsocket::events::{listener, EventEmitter};
//!
//! let emitter: EventEmitter<String> = EventEmitter::new();
//! let greet = listener(|name: &String| {
//!     println!("hello {name}");
//!     Ok(())
//! });
//! emitter.on("greet", greet.clone());
//! assert_eq!(emitter.emit("greet", &"world".to_string()), 1);
//! emitter.off("greet", &greet);
//! assert_eq!(emitter.listener_count("greet"), 0);
//! ```
//!
//! # Failure isolation
//!
//! A listener returning `Err` (or panicking) never stops the remaining
//! listeners of the same emit. The failure is handed to the hook installed
//! with [`EventEmitter::set_error_hook`], or logged when no hook is set.

// Rust guideline compliant 2026-02

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;

/// Shared listener callback.
///
/// Identity for [`EventEmitter::off`] is the `Arc` pointer, so keep a clone of
/// the value passed to [`EventEmitter::on`] if it needs removing later.
pub type Listener<A> = Arc<dyn Fn(&A) -> anyhow::Result<()> + Send + Sync>;

/// Receives `(event name, error)` for every failed listener.
pub type ErrorHook = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<A, F>(f: F) -> Listener<A>
where
    F: Fn(&A) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Registration<A> {
    id: u64,
    listener: Listener<A>,
    once: bool,
}

impl<A> Clone for Registration<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: Arc::clone(&self.listener),
            once: self.once,
        }
    }
}

struct Registry<A> {
    /// Event name -> registrations, in first-registration order.
    events: Vec<(String, Vec<Registration<A>>)>,
    next_id: u64,
    error_hook: Option<ErrorHook>,
}

impl<A> Registry<A> {
    fn entries_mut(&mut self, event: &str) -> Option<&mut Vec<Registration<A>>> {
        self.events
            .iter_mut()
            .find(|(name, _)| name == event)
            .map(|(_, regs)| regs)
    }

    fn drop_empty(&mut self) {
        self.events.retain(|(_, regs)| !regs.is_empty());
    }
}

/// Ordered, re-entrant event registry.
///
/// The internal lock is released before any listener runs, so listeners may
/// call `on`, `off` or `emit` on the same emitter.
pub struct EventEmitter<A> {
    registry: Mutex<Registry<A>>,
}

impl<A> std::fmt::Debug for EventEmitter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("EventEmitter")
            .field("event_count", &registry.events.len())
            .field(
                "total_listeners",
                &registry.events.iter().map(|(_, r)| r.len()).sum::<usize>(),
            )
            .field("has_error_hook", &registry.error_hook.is_some())
            .finish()
    }
}

impl<A> Default for EventEmitter<A> {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry {
                events: Vec::new(),
                next_id: 0,
                error_hook: None,
            }),
        }
    }
}

impl<A> EventEmitter<A> {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry<A>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, event: &str, listener: Listener<A>, once: bool) {
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;

        let registration = Registration { id, listener, once };
        if let Some(regs) = registry.entries_mut(event) {
            regs.push(registration);
        } else {
            registry.events.push((event.to_string(), vec![registration]));
        }
    }

    /// Append `listener` to `event`. Registering the same listener twice makes
    /// it fire twice.
    pub fn on(&self, event: &str, listener: Listener<A>) {
        self.register(event, listener, false);
    }

    /// Like [`Self::on`], but the registration is removed before its first call.
    pub fn once(&self, event: &str, listener: Listener<A>) {
        self.register(event, listener, true);
    }

    /// Remove the first registration of `listener` for `event`.
    ///
    /// Returns `false` (and does nothing) when it was not registered.
    pub fn off(&self, event: &str, listener: &Listener<A>) -> bool {
        let mut registry = self.registry();
        let Some(regs) = registry.entries_mut(event) else {
            return false;
        };
        let Some(idx) = regs
            .iter()
            .position(|r| Arc::ptr_eq(&r.listener, listener))
        else {
            return false;
        };
        regs.remove(idx);
        registry.drop_empty();
        true
    }

    /// Remove every listener of `event`, or of all events when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        let mut registry = self.registry();
        match event {
            Some(name) => registry.events.retain(|(n, _)| n != name),
            None => registry.events.clear(),
        }
    }

    /// Number of registrations for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.registry()
            .events
            .iter()
            .find(|(name, _)| name == event)
            .map_or(0, |(_, regs)| regs.len())
    }

    /// Names of events with at least one listener, in first-registration order.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        self.registry()
            .events
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Install the sink for listener failures, replacing any previous hook.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        self.registry().error_hook = Some(hook);
    }

    /// Invoke every listener registered for `event`, in order.
    ///
    /// The listener set is captured when `emit` starts: listeners added during
    /// the emit wait for the next one, and listeners removed by an earlier
    /// listener are skipped. Returns the number of listeners invoked.
    pub fn emit(&self, event: &str, args: &A) -> usize {
        let snapshot: Vec<Registration<A>> = {
            let registry = self.registry();
            registry
                .events
                .iter()
                .find(|(name, _)| name == event)
                .map(|(_, regs)| regs.clone())
                .unwrap_or_default()
        };

        let mut invoked = 0;
        for registration in snapshot {
            // An earlier listener or nested emit may have removed it.
            if !self.claim(event, &registration) {
                continue;
            }
            invoked += 1;

            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.listener)(args)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => anyhow!("listener panicked: {}", panic_message(panic.as_ref())),
            };
            self.report(event, &error);
        }
        invoked
    }

    /// Whether `registration` is still registered. Once-registrations are
    /// removed in the same step.
    fn claim(&self, event: &str, registration: &Registration<A>) -> bool {
        let mut registry = self.registry();
        let Some(regs) = registry.entries_mut(event) else {
            return false;
        };
        let Some(idx) = regs.iter().position(|r| r.id == registration.id) else {
            return false;
        };
        if registration.once {
            regs.remove(idx);
            registry.drop_empty();
        }
        true
    }

    fn report(&self, event: &str, error: &anyhow::Error) {
        let hook = self.registry().error_hook.clone();
        match hook {
            Some(hook) => hook(event, error),
            None => log::error!("[EventEmitter] Listener for '{}' failed: {:#}", event, error),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Listener<u32> {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        listener(move |n: &u32| {
            log.lock().unwrap().push(format!("{tag}:{n}"));
            Ok(())
        })
    }

    #[test]
    fn test_emit_runs_listeners_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = EventEmitter::new();
        emitter.on("tick", recorder(&log, "a"));
        emitter.on("tick", recorder(&log, "b"));
        emitter.on("other", recorder(&log, "x"));

        assert_eq!(emitter.emit("tick", &1), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_duplicate_registration_fires_twice_and_off_removes_one() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = EventEmitter::new();
        let a = recorder(&log, "a");
        emitter.on("tick", a.clone());
        emitter.on("tick", a.clone());

        emitter.emit("tick", &1);
        assert!(emitter.off("tick", &a));
        emitter.emit("tick", &2);

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "a:1", "a:2"]);
    }

    #[test]
    fn test_off_unknown_listener_is_noop() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let stray = listener(|_: &u32| Ok(()));
        assert!(!emitter.off("tick", &stray));

        emitter.on("tick", listener(|_: &u32| Ok(())));
        assert!(!emitter.off("tick", &stray));
        assert_eq!(emitter.listener_count("tick"), 1);
    }

    #[test]
    fn test_once_fires_at_most_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let emitter = EventEmitter::new();
        let c = Arc::clone(&count);
        emitter.once(
            "tick",
            listener(move |_: &u32| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        for n in 0..5 {
            emitter.emit("tick", &n);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count("tick"), 0);
    }

    #[test]
    fn test_once_cannot_reenter_through_nested_emit() {
        let count = Arc::new(AtomicUsize::new(0));
        let emitter = Arc::new(EventEmitter::new());
        let c = Arc::clone(&count);
        let inner = Arc::clone(&emitter);
        emitter.once(
            "tick",
            listener(move |n: &u32| {
                c.fetch_add(1, Ordering::SeqCst);
                if *n == 0 {
                    inner.emit("tick", &1);
                }
                Ok(())
            }),
        );

        emitter.emit("tick", &0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_listener_does_not_stop_later_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let emitter = EventEmitter::new();

        let sink = Arc::clone(&errors);
        emitter.set_error_hook(Arc::new(move |event: &str, e: &anyhow::Error| {
            sink.lock().unwrap().push(format!("{event}: {e}"));
        }));
        emitter.on("tick", listener(|_: &u32| Err(anyhow!("boom"))));
        emitter.on("tick", listener(|_: &u32| panic!("kaboom")));
        emitter.on("tick", recorder(&log, "last"));

        assert_eq!(emitter.emit("tick", &7), 3);
        assert_eq!(*log.lock().unwrap(), vec!["last:7"]);

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], "tick: boom");
        assert!(errors[1].contains("kaboom"));
    }

    #[test]
    fn test_listener_may_register_during_emit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = Arc::new(EventEmitter::new());
        let inner = Arc::clone(&emitter);
        let late = recorder(&log, "late");
        emitter.on(
            "tick",
            listener(move |_: &u32| {
                inner.on("tick", late.clone());
                Ok(())
            }),
        );

        emitter.emit("tick", &1);
        assert!(log.lock().unwrap().is_empty());
        emitter.emit("tick", &2);
        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[test]
    fn test_listener_removed_during_emit_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = Arc::new(EventEmitter::new());
        let inner = Arc::clone(&emitter);
        let second = recorder(&log, "second");
        let target = second.clone();
        emitter.on(
            "tick",
            listener(move |_: &u32| {
                inner.off("tick", &target);
                Ok(())
            }),
        );
        emitter.on("tick", second);
        emitter.on("tick", recorder(&log, "third"));

        assert_eq!(emitter.emit("tick", &1), 2);
        assert_eq!(*log.lock().unwrap(), vec!["third:1"]);
        assert_eq!(emitter.listener_count("tick"), 2);
    }

    #[test]
    fn test_remove_all_listeners_during_emit_skips_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let emitter = Arc::new(EventEmitter::new());
        let inner = Arc::clone(&emitter);
        emitter.on(
            "tick",
            listener(move |_: &u32| {
                inner.remove_all_listeners(None);
                Ok(())
            }),
        );
        emitter.on("tick", recorder(&log, "late"));

        assert_eq!(emitter.emit("tick", &1), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_all_listeners_and_introspection() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        emitter.on("b", listener(|_: &u32| Ok(())));
        emitter.on("a", listener(|_: &u32| Ok(())));
        emitter.once("a", listener(|_: &u32| Ok(())));

        assert_eq!(emitter.event_names(), vec!["b", "a"]);
        assert_eq!(emitter.listener_count("a"), 2);

        emitter.remove_all_listeners(Some("a"));
        assert_eq!(emitter.event_names(), vec!["b"]);

        emitter.remove_all_listeners(None);
        assert!(emitter.event_names().is_empty());
        assert_eq!(emitter.emit("b", &0), 0);
    }
}
