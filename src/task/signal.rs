use log::warn;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type Listener<T> = Box<dyn FnOnce(T) + Send>;

struct SignalState<T> {
    fired: bool,
    listeners: Vec<Listener<T>>,
}

/// Single-shot, multi-listener broadcast with late-subscription delivery.
///
/// The signal fires at most once. Listeners attached after it fired are
/// invoked immediately with the stored payload.
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    state: Arc<Mutex<SignalState<T>>>,
    payload: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            payload: self.payload.clone(),
        }
    }
}

impl<T> Default for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (payload, _) = watch::channel(None);
        Self {
            state: Arc::new(Mutex::new(SignalState {
                fired: false,
                listeners: Vec::new(),
            })),
            payload: Arc::new(payload),
        }
    }

    /// Attaches a listener. Returns true if it ran immediately because the
    /// signal had already fired.
    pub fn connect<F>(&self, listener: F) -> bool
    where
        F: FnOnce(T) + Send + 'static,
    {
        {
            let mut state = lock_state(&self.state);
            if !state.fired {
                state.listeners.push(Box::new(listener));
                return false;
            }
        }

        if let Some(value) = self.fired_payload() {
            invoke(Box::new(listener), value);
        }
        true
    }

    /// Fires the signal. Only the first call delivers; later calls return false.
    pub fn fire(&self, value: T) -> bool {
        let listeners = {
            let mut state = lock_state(&self.state);
            if state.fired {
                return false;
            }
            state.fired = true;
            self.payload.send_replace(Some(value.clone()));
            std::mem::take(&mut state.listeners)
        };

        for listener in listeners {
            invoke(listener, value.clone());
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        lock_state(&self.state).fired
    }

    pub fn fired_payload(&self) -> Option<T> {
        self.payload.borrow().clone()
    }

    /// Waits until the signal fires and returns its payload.
    pub async fn wait(&self) -> T {
        let mut receiver = self.payload.subscribe();
        loop {
            let current = receiver.borrow_and_update().clone();
            if let Some(value) = current {
                return value;
            }
            if receiver.changed().await.is_err() {
                // Sender is owned by `self`; a closed channel never fires.
                std::future::pending::<()>().await;
            }
        }
    }
}

fn lock_state<T>(state: &Mutex<SignalState<T>>) -> std::sync::MutexGuard<'_, SignalState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn invoke<T>(listener: Listener<T>, value: T) {
    if catch_unwind(AssertUnwindSafe(move || listener(value))).is_err() {
        warn!("Signal listener panicked; remaining listeners still run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_exactly_once() {
        let signal = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        signal.connect(move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.fire(1));
        assert!(!signal.fire(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.fired_payload(), Some(1));
    }

    #[test]
    fn late_listener_runs_immediately() {
        let signal = Signal::new();
        signal.fire("ended");

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        assert!(signal.connect(move |reason| {
            *sink.lock().unwrap() = Some(reason);
        }));
        assert_eq!(*seen.lock().unwrap(), Some("ended"));
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let signal = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        signal.connect(|_: ()| panic!("listener bug"));
        let counter = hits.clone();
        signal.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.fire(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_resolves_after_fire() {
        let signal = Signal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        signal.fire(7u32);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[test]
    fn wait_pends_until_fired() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let signal = Signal::new();
        let mut wait = task::spawn(signal.wait());
        assert_pending!(wait.poll());

        signal.fire(3u8);
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), 3);
    }
}
