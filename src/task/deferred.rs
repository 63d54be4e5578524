use crate::core::{Result, StoreError};
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared, try_join_all};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::task::JoinError;

/// Handle that cancels a pending [`Task`].
///
/// Cancelling stops the task's future at its next suspension point; handlers
/// chained after it observe `StoreError::Cancelled` instead of running.
#[derive(Clone)]
pub struct TaskCanceller {
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl TaskCanceller {
    fn new_pair() -> (Self, futures::future::AbortRegistration) {
        let (abort, registration) = AbortHandle::new_pair();
        (
            Self {
                abort,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
            registration,
        )
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TaskCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCanceller")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A deferred value that settles exactly once, fulfilled or rejected.
///
/// Work starts eagerly on the tokio runtime when the task is created, so a
/// task makes progress even if nobody awaits it. Clones share the same
/// settlement; awaiting any clone yields a clone of the result. A panic inside
/// the task's future rejects it with `StoreError::TaskFailed`.
pub struct Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Shared<BoxFuture<'static, Result<T>>>,
    canceller: Option<TaskCanceller>,
}

impl<T> Clone for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            canceller: self.canceller.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts `future` on the runtime and returns the task tracking it.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::spawn_with(|_| future)
    }

    /// Like [`Task::spawn`], but hands the future builder this task's own
    /// canceller so long-running work can observe cancellation.
    pub fn spawn_with<B, F>(build: B) -> Self
    where
        B: FnOnce(TaskCanceller) -> F,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (canceller, registration) = TaskCanceller::new_pair();
        let future = build(canceller.clone());
        let handle = tokio::spawn(Abortable::new(future, registration));

        let inner = async move {
            match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(_aborted)) => Err(StoreError::Cancelled("task was cancelled".to_string())),
                Err(err) => Err(join_error(err)),
            }
        }
        .boxed()
        .shared();

        Self {
            inner,
            canceller: Some(canceller),
        }
    }

    /// An already-fulfilled task.
    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// An already-rejected task.
    pub fn rejected(err: StoreError) -> Self {
        Self::settled(Err(err))
    }

    fn settled(result: Result<T>) -> Self {
        Self {
            inner: futures::future::ready(result).boxed().shared(),
            canceller: None,
        }
    }

    /// Chains a handler that runs once this task fulfills.
    ///
    /// The handler may itself return a pending computation; the resulting
    /// task settles only when that inner computation does. If this task
    /// rejects, the handler is skipped and the rejection propagates.
    pub fn then<U, F, Fut>(&self, handler: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let parent = self.clone();
        Task::spawn(async move {
            let value = parent.await?;
            handler(value).await
        })
    }

    /// Maps the fulfilled value synchronously.
    pub fn map<U, F>(&self, mapper: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let parent = self.clone();
        Task::spawn(async move { parent.await.map(mapper) })
    }

    /// Chains a handler that runs only when this task rejects.
    pub fn catch<F, Fut>(&self, handler: F) -> Task<T>
    where
        F: FnOnce(StoreError) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let parent = self.clone();
        Task::spawn(async move {
            match parent.await {
                Ok(value) => Ok(value),
                Err(err) => handler(err).await,
            }
        })
    }

    /// Aggregates tasks, fulfilling with every value in input order or
    /// rejecting as soon as any input rejects.
    pub fn all(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
        Task::spawn(async move { try_join_all(tasks).await })
    }

    /// Cancels the task if it is still pending. Settled tasks are unaffected.
    pub fn cancel(&self) {
        if let Some(canceller) = &self.canceller {
            canceller.cancel();
        }
    }

    pub fn canceller(&self) -> Option<TaskCanceller> {
        self.canceller.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }

    /// Returns the settled result without waiting, if there is one.
    pub fn peek(&self) -> Option<Result<T>> {
        self.inner.peek().cloned()
    }

    /// True when both handles observe the same underlying computation.
    pub fn ptr_eq(&self, other: &Task<T>) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl<T> Future for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(cx)
    }
}

/// Converts a join failure into the task error taxonomy.
pub fn join_error(err: JoinError) -> StoreError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        StoreError::TaskFailed(message)
    } else {
        StoreError::Cancelled(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Task;
    use crate::core::StoreError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn then_flattens_inner_tasks() {
        let task = Task::resolved(2).then(|v| Task::spawn(async move { Ok(v * 10) }));
        assert_eq!(task.await.unwrap(), 20);
    }

    #[tokio::test]
    async fn handlers_on_settled_task_run_after_a_yield() {
        let settled = Task::resolved(5);
        assert_eq!(settled.clone().await.unwrap(), 5);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let chained = settled.map(move |v| {
            flag.store(true, Ordering::SeqCst);
            v + 1
        });
        assert!(!ran.load(Ordering::SeqCst));

        assert_eq!(chained.await.unwrap(), 6);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejection_skips_handlers() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_handler = ran.clone();
        let task: Task<i32> = Task::rejected(StoreError::Transient("boom".into()));
        let chained = task.then(move |v| {
            ran_in_handler.fetch_add(1, Ordering::SeqCst);
            async move { Ok(v) }
        });

        assert_eq!(
            chained.await.unwrap_err(),
            StoreError::Transient("boom".into())
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_rejects_task() {
        let task = Task::resolved(1).then(|_| async move {
            if true {
                panic!("handler exploded");
            }
            Ok(0)
        });
        let err = task.await.unwrap_err();
        assert_eq!(err, StoreError::TaskFailed("handler exploded".into()));
    }

    #[tokio::test]
    async fn cancel_propagates_to_dependents() {
        let slow = Task::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });
        let dependent = slow.map(|v| v + 1);
        slow.cancel();

        assert!(matches!(slow.clone().await, Err(StoreError::Cancelled(_))));
        assert!(matches!(dependent.await, Err(StoreError::Cancelled(_))));
    }

    #[tokio::test]
    async fn all_fails_fast() {
        let pending = Task::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });
        let failing = Task::rejected(StoreError::NonRetryable("denied".into()));
        let started = std::time::Instant::now();

        let err = Task::all(vec![pending, failing]).await.unwrap_err();
        assert_eq!(err, StoreError::NonRetryable("denied".into()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn settles_once_and_shares_result() {
        let task = Task::spawn(async { Ok(String::from("done")) });
        let copy = task.clone();
        assert_eq!(task.await.unwrap(), "done");
        assert!(copy.is_settled());
        assert_eq!(copy.peek(), Some(Ok(String::from("done"))));
    }
}
