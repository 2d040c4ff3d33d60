//! Pool - 1 タスクの実行単位
//!
//! - `Tasks`: tokio タスク。kill は `abort()`（次の await 地点で止まる）
//! - `Threads`: 専用 OS スレッド + current-thread runtime。kill されると
//!   スレッドが終了するまで戻らない。await しないまま固まったハンドラは
//!   止められないが、そのスレッドが生きている間はワーカーの実行枠も
//!   解放されないので、同時実行数の上限は守られる
//!
//! どちらも kill トークンと競争させ、ハンドラの panic は `Panicked` になります。

use std::any::Any;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::config::PoolStrategy;
use crate::domain::TaskError;

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

#[derive(Debug)]
pub(crate) enum Execution {
    Finished(Result<Value, TaskError>),
    Panicked(String),
    Killed,
}

pub(crate) async fn execute(
    strategy: PoolStrategy,
    fut: TaskFuture,
    kill: CancellationToken,
) -> Execution {
    match strategy {
        PoolStrategy::Tasks => execute_on_task(fut, kill).await,
        PoolStrategy::Threads => execute_on_thread(fut, kill).await,
    }
}

async fn execute_on_task(fut: TaskFuture, kill: CancellationToken) -> Execution {
    let mut handle = tokio::spawn(fut);
    tokio::select! {
        joined = &mut handle => match joined {
            Ok(result) => Execution::Finished(result),
            Err(e) if e.is_panic() => Execution::Panicked(panic_message(e.into_panic())),
            Err(_) => Execution::Killed,
        },
        _ = kill.cancelled() => {
            handle.abort();
            Execution::Killed
        }
    }
}

async fn execute_on_thread(fut: TaskFuture, kill: CancellationToken) -> Execution {
    let (tx, rx) = oneshot::channel();
    // dropped when the thread exits, including by panic
    let (exited_tx, exited_rx) = oneshot::channel::<()>();
    let thread_kill = kill.clone();

    let spawned = std::thread::Builder::new()
        .name("bobbin-exec".into())
        .spawn(move || {
            let _exited = exited_tx;
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Err(TaskError::failed(format!(
                        "failed to start executor runtime: {e}"
                    ))));
                    return;
                }
            };
            let outcome = runtime.block_on(async move {
                tokio::select! {
                    result = fut => Some(result),
                    _ = thread_kill.cancelled() => None,
                }
            });
            if let Some(result) = outcome {
                let _ = tx.send(result);
            }
        });
    if let Err(e) = spawned {
        return Execution::Finished(Err(TaskError::failed(format!(
            "failed to spawn executor thread: {e}"
        ))));
    }

    tokio::select! {
        received = rx => match received {
            Ok(result) => Execution::Finished(result),
            // sender dropped without a value: the handler panicked
            Err(_) if !kill.is_cancelled() => Execution::Panicked("executor thread panicked".into()),
            Err(_) => Execution::Killed,
        },
        _ = kill.cancelled() => {
            warn!("waiting for killed executor thread to exit");
            let _ = exited_rx.await;
            Execution::Killed
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    #[rstest]
    #[case(PoolStrategy::Tasks)]
    #[case(PoolStrategy::Threads)]
    #[tokio::test]
    async fn returns_handler_result(#[case] strategy: PoolStrategy) {
        let fut: TaskFuture = Box::pin(async { Ok::<_, TaskError>(json!(42)) });
        match execute(strategy, fut, CancellationToken::new()).await {
            Execution::Finished(Ok(v)) => assert_eq!(v, json!(42)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case(PoolStrategy::Tasks)]
    #[case(PoolStrategy::Threads)]
    #[tokio::test]
    async fn kill_stops_a_sleeping_handler(#[case] strategy: PoolStrategy) {
        let fut: TaskFuture = Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, TaskError>(json!("too late"))
        });
        let kill = CancellationToken::new();
        let killer = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            killer.cancel();
        });

        let started = std::time::Instant::now();
        assert!(matches!(execute(strategy, fut, kill).await, Execution::Killed));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[rstest]
    #[case(PoolStrategy::Tasks)]
    #[case(PoolStrategy::Threads)]
    #[tokio::test]
    async fn panics_are_reported(#[case] strategy: PoolStrategy) {
        fn boom() -> Result<Value, TaskError> {
            panic!("kaboom")
        }
        let fut: TaskFuture = Box::pin(async { boom() });
        assert!(matches!(
            execute(strategy, fut, CancellationToken::new()).await,
            Execution::Panicked(_)
        ));
    }

    #[tokio::test]
    async fn killed_thread_is_waited_for() {
        let fut: TaskFuture = Box::pin(async {
            std::thread::sleep(Duration::from_millis(300));
            Ok::<_, TaskError>(json!("blocked"))
        });
        let kill = CancellationToken::new();
        let killer = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.cancel();
        });

        let started = std::time::Instant::now();
        let execution = execute(PoolStrategy::Threads, fut, kill).await;
        assert!(matches!(execution, Execution::Killed), "got {execution:?}");
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
