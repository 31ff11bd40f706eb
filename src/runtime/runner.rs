// Runner is a unit of work submitted to the executor.

use crate::error::Result;
use std::sync::Arc;

pub trait Runner: Send + Sync {
    fn run(&self) -> Result<()>;
}

struct TaskFn<F> {
    f: F,
}

impl<F> Runner for TaskFn<F>
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn run(&self) -> Result<()> {
        (self.f)()
    }
}

/// Wrap a closure as a Runner.
pub fn task<F>(f: F) -> Arc<dyn Runner>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    Arc::new(TaskFn { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closure_runner_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let r = task(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        r.run().unwrap();
        r.run().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
