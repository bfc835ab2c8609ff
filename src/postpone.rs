// =============================================================================
// PostponeContext — task-local deferral of "heavy" side-effect calls
// =============================================================================
//
// A task-local flag plus a task-local queue stand in for a thread-local
// context variable scoped to the async task running the jump.
//
// A "heavy" call checks the flag at invocation time: if postponing, the
// closure is boxed and appended to the deferred list instead of running.
// `postpone_heavy_calls` opens the scope, runs the body, then drains the
// list in FIFO order on exit — even if the body returned an error. Nested
// scopes are a no-op flag-wise: re-entering while already postponing just
// executes the body inline without re-draining.
// =============================================================================

use std::cell::RefCell;
use std::future::Future;

type DeferredCall = Box<dyn FnOnce() -> futures_util::future::BoxFuture<'static, ()> + Send>;

tokio::task_local! {
    static SHOULD_POSTPONE: RefCell<bool>;
    static DEFERRED: RefCell<Vec<DeferredCall>>;
}

/// Run `body` inside a postpone scope: heavy calls made during `body` are
/// queued instead of executed immediately, then drained in FIFO order once
/// `body` completes (success or error).
pub async fn postpone_heavy_calls<F, Fut, T>(body: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    // Reentrancy: if we're already inside a postpone scope, just run inline.
    let already_postponing = SHOULD_POSTPONE
        .try_with(|flag| *flag.borrow())
        .unwrap_or(false);
    if already_postponing {
        return body().await;
    }

    SHOULD_POSTPONE
        .scope(RefCell::new(true), async move {
            DEFERRED
                .scope(RefCell::new(Vec::new()), async move {
                    let result = body().await;
                    let calls: Vec<DeferredCall> = DEFERRED.with(|d| d.borrow_mut().drain(..).collect());
                    for call in calls {
                        call().await;
                    }
                    result
                })
                .await
        })
        .await
}

/// Invoke a "heavy" (side-effecting) async call: postponed if inside a
/// `postpone_heavy_calls` scope, executed inline otherwise.
pub async fn heavy_call<F, Fut>(call: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let postponing = SHOULD_POSTPONE
        .try_with(|flag| *flag.borrow())
        .unwrap_or(false);
    if postponing {
        let boxed: DeferredCall = Box::new(move || Box::pin(call()));
        let enqueued = DEFERRED.try_with(|d| d.borrow_mut().push(boxed));
        if enqueued.is_err() {
            // No active scope despite the flag somehow being set: fail open
            // and execute inline rather than silently dropping a side effect.
            call().await;
        }
    } else {
        call().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn heavy_calls_drain_in_fifo_order_after_scope_body() {
        let order = Arc::new(Mutex::new(Vec::new()));

        postpone_heavy_calls(|| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(0u32); // inline marker before heavy calls run
                for i in 1..=3 {
                    let order = order.clone();
                    heavy_call(move || {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(i);
                        }
                    })
                    .await;
                }
            }
        })
        .await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn heavy_calls_drain_even_if_body_panics_is_not_required_but_errors_propagate() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let result: Result<(), &'static str> = postpone_heavy_calls(|| {
            let order = order.clone();
            async move {
                let order2 = order.clone();
                heavy_call(move || {
                    let order2 = order2.clone();
                    async move {
                        order2.lock().unwrap().push(1);
                    }
                })
                .await;
                Err("jump aborted")
            }
        })
        .await;

        assert_eq!(result, Err("jump aborted"));
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn nested_postpone_scope_is_flag_wise_noop() {
        let order = Arc::new(Mutex::new(Vec::new()));
        postpone_heavy_calls(|| {
            let order = order.clone();
            async move {
                // Nested scope: body runs inline, doesn't open a second
                // deferred list or double-drain.
                postpone_heavy_calls(|| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(99);
                    }
                })
                .await;
            }
        })
        .await;
        assert_eq!(*order.lock().unwrap(), vec![99]);
    }
}
