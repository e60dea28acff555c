use crate::Result;
use std::sync::Barrier;

pub fn get_num_threads() -> usize {
    use std::str::FromStr;
    // Respond to the same environment variable as rayon.
    match std::env::var("RAYON_NUM_THREADS").ok().and_then(|s| usize::from_str(&s).ok()) {
        Some(x) if x > 0 => x,
        Some(_) | None => num_cpus::get(),
    }
}

/// Thread count used when the caller has no preference: half of the hardware threads, two
/// hyper-threads of a core share the same vector units.
pub fn default_parallelism() -> usize {
    (get_num_threads() / 2).max(1)
}

/// Fork-join region with a fixed number of workers.
///
/// Workers of a region may block on barriers waiting for each other, so they cannot share the
/// global rayon pool: every region runs on its own pool with exactly `nthr` threads.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
    nthr: usize,
}

impl ThreadPool {
    pub fn new(nthr: usize) -> Result<Self> {
        let nthr = nthr.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthr)
            .thread_name(|i| format!("xn-conv-{i}"))
            .build()?;
        Ok(Self { pool, nthr })
    }

    pub fn nthr(&self) -> usize {
        self.nthr
    }

    /// Runs `f(ithr, nthr)` once on every worker and returns when all of them are done.
    ///
    /// A panicking worker aborts the process, its peers may be blocked on a barrier waiting for
    /// it.
    pub fn parallel<F>(&self, f: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        self.pool.broadcast(|ctx| abort_on_panic(|| f(ctx.index(), ctx.num_threads())));
    }

    /// Same as `parallel`, collecting the results by worker index.
    pub fn parallel_collect<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize, usize) -> R + Sync,
    {
        self.pool.broadcast(|ctx| abort_on_panic(|| f(ctx.index(), ctx.num_threads())))
    }
}

fn abort_on_panic<R>(f: impl FnOnce() -> R) -> R {
    on_panic(f, || {
        tracing::error!(thread = ?std::thread::current().name(), "worker panicked, aborting");
        std::process::abort()
    })
}

/// Runs `f`, calling `handler` before resuming the unwind if it panics.
fn on_panic<R>(f: impl FnOnce() -> R, handler: impl FnOnce()) -> R {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(payload) => {
            handler();
            std::panic::resume_unwind(payload)
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool").field("nthr", &self.nthr).finish()
    }
}

/// A set of independent barriers sharing the same participant count.
#[derive(Debug)]
pub struct BarrierSet {
    barriers: Vec<Barrier>,
    participants: usize,
}

impl BarrierSet {
    pub fn new(count: usize, participants: usize) -> Self {
        let participants = participants.max(1);
        let barriers = if participants > 1 {
            (0..count).map(|_| Barrier::new(participants)).collect()
        } else {
            vec![]
        };
        Self { barriers, participants }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Blocks until all the participants of barrier `idx` arrived, a no-op with a single
    /// participant.
    pub fn wait(&self, idx: usize) {
        if self.participants > 1 {
            self.barriers[idx].wait();
        }
    }
}
