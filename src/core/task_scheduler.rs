//! 后台任务调度：OneShot / Exclusive / Interval
//!
//! 任务以名称标识（摘要、标题、保存等），注册表中的成员关系即「该任务是否正在运行」：任务结束（成功、失败、panic、取消）
//! 时由自身的收尾逻辑按 id 注销。Exclusive 在启动前取消同名的所有在跑实例；Interval 反复「执行 → 休眠」直到被取消。
//! 任务的错误与 panic 被捕获并按名称保存，只报告一次：下一次 schedule 同名任务时返回，或由 take_failure 取走。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

/// 调度模式
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskMode {
    /// 运行一次
    OneShot,
    /// 同名只保留最新一个实例
    Exclusive,
    /// 执行后休眠固定时长，循环直到取消
    Interval(Duration),
}

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct Entry {
    id: TaskId,
    token: CancellationToken,
}

#[derive(Default)]
struct Registry {
    tasks: HashMap<String, Vec<Entry>>,
    failures: HashMap<String, String>,
}

/// 任务调度器；Clone 后共享同一注册表
#[derive(Clone, Default)]
pub struct TaskScheduler {
    inner: Arc<Mutex<Registry>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.inner)
    }

    /// 调度一个任务；返回该名称上一次尚未报告的失败
    pub fn schedule<F, Fut>(&self, name: &str, mode: TaskMode, mut job: F) -> Option<String>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = TaskId::next();
        let token = CancellationToken::new();
        let previous_failure = {
            let mut reg = self.registry();
            let failure = reg.failures.remove(name);
            if mode == TaskMode::Exclusive {
                if let Some(live) = reg.tasks.remove(name) {
                    tracing::debug!(task = %name, count = live.len(), "replacing exclusive task");
                    for entry in live {
                        entry.token.cancel();
                    }
                }
            }
            reg.tasks.entry(name.to_string()).or_default().push(Entry {
                id,
                token: token.clone(),
            });
            failure
        };

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            let body = async {
                match mode {
                    TaskMode::OneShot | TaskMode::Exclusive => {
                        run_once(&inner, &name, &mut job).await;
                    }
                    TaskMode::Interval(period) => loop {
                        run_once(&inner, &name, &mut job).await;
                        tokio::time::sleep(period).await;
                    },
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => tracing::debug!(task = %name, "task cancelled"),
                _ = body => {}
            }
            deregister(&inner, &name, id);
        });
        previous_failure
    }

    /// 取消同名的所有实例
    pub fn cancel(&self, name: &str) {
        let live = self.registry().tasks.remove(name).unwrap_or_default();
        for entry in live {
            entry.token.cancel();
        }
    }

    /// 取消全部任务；可重复调用
    pub fn cancel_all(&self) {
        let all: Vec<Entry> = self
            .registry()
            .tasks
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect();
        if !all.is_empty() {
            tracing::info!(count = all.len(), "cancelling all tasks");
        }
        for entry in all {
            entry.token.cancel();
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.live_count(name) > 0
    }

    pub fn live_count(&self, name: &str) -> usize {
        self.registry().tasks.get(name).map_or(0, Vec::len)
    }

    /// 取走该名称尚未报告的失败
    pub fn take_failure(&self, name: &str) -> Option<String> {
        self.registry().failures.remove(name)
    }
}

fn lock(inner: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_once<F, Fut>(inner: &Mutex<Registry>, name: &str, job: &mut F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let outcome = AssertUnwindSafe(async { job().await }).catch_unwind().await;
    let failure = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:#}", e),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .map(|msg| format!("panicked: {}", msg))
            .unwrap_or_else(|| "panicked".to_string()),
    };
    tracing::warn!(task = %name, error = %failure, "background task failed");
    lock(inner).failures.insert(name.to_string(), failure);
}

fn deregister(inner: &Mutex<Registry>, name: &str, id: TaskId) {
    let mut reg = lock(inner);
    if let Some(entries) = reg.tasks.get_mut(name) {
        entries.retain(|e| e.id != id);
        if entries.is_empty() {
            reg.tasks.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Instant;

    use super::*;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn succeed() -> anyhow::Result<()> {
        Ok(())
    }

    async fn unavailable() -> anyhow::Result<()> {
        Err(anyhow::anyhow!("service unavailable"))
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    /// drop 时置位，用于观察任务是否被取消
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_one_shot_runs_and_deregisters() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        scheduler.schedule("once", TaskMode::OneShot, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        wait_until(|| !scheduler.is_running("once")).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.take_failure("once"), None);
    }

    #[tokio::test]
    async fn test_exclusive_replaces_running_instance() {
        let scheduler = TaskScheduler::new();
        let first_dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&first_dropped);
        scheduler.schedule("summarize", TaskMode::Exclusive, move || {
            let guard = DropFlag(Arc::clone(&flag));
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.live_count("summarize"), 1);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut tx = Some(tx);
        scheduler.schedule("summarize", TaskMode::Exclusive, move || {
            let tx = tx.take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(());
                }
                Ok(())
            }
        });
        assert_eq!(scheduler.live_count("summarize"), 1);

        rx.await.unwrap();
        wait_until(|| first_dropped.load(Ordering::SeqCst)).await;
        wait_until(|| !scheduler.is_running("summarize")).await;
    }

    #[tokio::test]
    async fn test_failure_reported_once_on_next_schedule() {
        let scheduler = TaskScheduler::new();
        scheduler.schedule("summarize", TaskMode::Exclusive, unavailable);
        wait_until(|| !scheduler.is_running("summarize")).await;

        let reported = scheduler.schedule("summarize", TaskMode::Exclusive, succeed);
        assert_eq!(reported.as_deref(), Some("service unavailable"));
        wait_until(|| !scheduler.is_running("summarize")).await;

        let reported = scheduler.schedule("summarize", TaskMode::Exclusive, succeed);
        assert_eq!(reported, None);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let scheduler = TaskScheduler::new();
        scheduler.schedule("title", TaskMode::OneShot, explode);
        wait_until(|| !scheduler.is_running("title")).await;
        let failure = scheduler.take_failure("title").unwrap();
        assert!(failure.contains("boom"));
        assert_eq!(scheduler.take_failure("title"), None);
    }

    #[tokio::test]
    async fn test_interval_repeats_until_cancelled_and_survives_failures() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.schedule("save", TaskMode::Interval(Duration::from_millis(5)), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("disk full");
                }
                Ok(())
            }
        });
        wait_until(|| runs.load(Ordering::SeqCst) >= 3).await;
        assert!(scheduler.is_running("save"));
        assert_eq!(scheduler.take_failure("save").as_deref(), Some("disk full"));

        scheduler.cancel("save");
        wait_until(|| !scheduler.is_running("save")).await;
        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[tokio::test]
    async fn test_cancel_all_is_idempotent() {
        let scheduler = TaskScheduler::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        for name in ["save", "title"] {
            let dropped = Arc::clone(&dropped);
            scheduler.schedule(name, TaskMode::Interval(Duration::from_secs(60)), move || {
                let flag = Arc::new(AtomicBool::new(false));
                let guard = DropFlag(flag);
                let dropped = Arc::clone(&dropped);
                async move {
                    let _guard = guard;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    dropped.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        assert!(scheduler.is_running("save"));
        scheduler.cancel_all();
        scheduler.cancel_all();
        assert!(!scheduler.is_running("save"));
        assert!(!scheduler.is_running("title"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        scheduler.cancel_all();
    }
}
