#[cfg(test)]
#[path = "observer_test.rs"]
mod tests;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time;

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    return mutex.lock().unwrap_or_else(PoisonError::into_inner);
}

struct Registry<T> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
}

/// A set of listeners for one signal. Listeners run in subscription order,
/// outside of the registry lock so they may subscribe or unsubscribe freely.
pub struct Subject<T> {
    registry: Arc<Registry<T>>,
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Subject<T> {
        return Subject {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(BTreeMap::new()),
            }),
        };
    }
}

impl<T: 'static> Subject<T> {
    pub fn subscribe(&self, listener: Listener<T>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.listeners).insert(id, listener);

        let registry: Weak<Registry<T>> = Arc::downgrade(&self.registry);
        return Subscription {
            release: Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    lock(&registry.listeners).remove(&id);
                }
            }),
        };
    }

    pub fn notify(&self, value: &T) {
        let listeners = lock(&self.registry.listeners)
            .values()
            .cloned()
            .collect::<Vec<Listener<T>>>();

        for listener in listeners {
            listener(value);
        }
    }

    /// Subscribes a [`throttle`] wrapped listener. Unsubscribing also drops a
    /// trailing call that is still waiting for its window to close.
    pub fn subscribe_throttled(&self, interval: Duration, listener: Listener<T>) -> Subscription
    where
        T: Clone + Send + Sync,
    {
        let throttled = throttle(interval, listener);
        let cancelled = throttled.cancelled.clone();
        let subscription = self.subscribe(throttled.listener);

        return Subscription {
            release: Box::new(move || {
                cancelled.store(true, Ordering::Release);
                (subscription.release)();
            }),
        };
    }
}

/// Handle returned by [`Subject::subscribe`]. Dropping it keeps the listener
/// registered; call `unsubscribe` to remove it.
pub struct Subscription {
    release: Box<dyn FnOnce() + Send + Sync>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        (self.release)();
    }
}

/// A throttled listener and the flag that silences its pending trailing call.
pub struct Throttled<T> {
    pub listener: Listener<T>,
    cancelled: Arc<AtomicBool>,
}

/// Wraps a listener so it fires at most once per `interval`, on the trailing
/// edge, with the most recent value seen during the window. Nothing is
/// delivered once the wrapper is cancelled.
///
/// Outside of a tokio runtime there is no timer to schedule on, so the value is
/// delivered immediately.
pub fn throttle<T>(interval: Duration, listener: Listener<T>) -> Throttled<T>
where
    T: Clone + Send + Sync + 'static,
{
    let pending: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();

    let listener: Listener<T> = Arc::new(move |value: &T| {
        if flag.load(Ordering::Acquire) {
            return;
        }

        let mut slot = lock(&pending);
        let scheduled = slot.is_some();
        *slot = Some(value.clone());
        if scheduled {
            return;
        }
        drop(slot);

        let Ok(runtime) = Handle::try_current() else {
            let latest = lock(&pending).take();
            if let Some(latest) = latest {
                listener(&latest);
            }
            return;
        };

        let pending = pending.clone();
        let listener = listener.clone();
        let flag = flag.clone();
        runtime.spawn(async move {
            time::sleep(interval).await;
            let latest = lock(&pending).take();
            if flag.load(Ordering::Acquire) {
                return;
            }
            if let Some(latest) = latest {
                listener(&latest);
            }
        });
    });

    return Throttled {
        listener,
        cancelled,
    };
}
