//! Batches of named generation jobs
//!
//! A [`JobPool`] runs independent jobs (typically one per generated graph)
//! and remembers how long each named job took.  Later batches start the
//! slowest jobs first, which keeps the tail of a parallel batch short; jobs
//! that were never seen before are started before everything else.
//!
//! With the `parallel` feature, jobs run on a [`rayon`] thread pool;
//! otherwise (or when the pool is disabled) they run on the calling thread.
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A named unit of work
pub struct Job<'a, R> {
    name: String,
    f: Box<dyn FnOnce() -> R + Send + 'a>,
}

impl<'a, R> Job<'a, R> {
    pub fn new(name: impl Into<String>, f: impl FnOnce() -> R + Send + 'a) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R> std::fmt::Debug for Job<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish()
    }
}

/// Thread pool to use for parallel jobs
#[cfg(feature = "parallel")]
pub enum ThreadPool {
    /// User-provided pool
    Custom(rayon::ThreadPool),
    /// Global Rayon pool
    Global,
}

#[cfg(feature = "parallel")]
impl ThreadPool {
    /// Runs a function across the thread pool
    pub fn run<F: FnOnce() -> V + Send, V: Send>(&self, f: F) -> V {
        match self {
            ThreadPool::Custom(p) => p.install(f),
            ThreadPool::Global => f(),
        }
    }

    /// Returns the number of threads in the pool
    pub fn thread_count(&self) -> usize {
        match self {
            ThreadPool::Custom(p) => p.current_num_threads(),
            ThreadPool::Global => rayon::current_num_threads(),
        }
    }
}

/// How sorted jobs are handed to worker threads
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum GroupStrategy {
    /// One job at a time, longest first
    #[default]
    SingleOrdered,
    /// Consecutive jobs with known durations are grouped, each group taking
    /// at most half of the remaining work per thread; jobs without a
    /// recorded duration run alone
    MultiHalfTime,
}

/// Runs batches of jobs, ordered by their previous running time
pub struct JobPool {
    history: HashMap<String, Duration>,
    enabled: bool,
    strategy: GroupStrategy,
    #[cfg(feature = "parallel")]
    threads: ThreadPool,
}

impl Default for JobPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A job and its position in the submitted batch
type Slot<'a, R> = (usize, Job<'a, R>);

/// Result of a job: position, name, running time and value
type Done<R> = (usize, String, Duration, R);

impl JobPool {
    /// Builds a pool using the global thread pool (if any)
    pub fn new() -> Self {
        Self {
            history: HashMap::new(),
            enabled: true,
            strategy: GroupStrategy::default(),
            #[cfg(feature = "parallel")]
            threads: ThreadPool::Global,
        }
    }

    /// Builds a pool running jobs on a dedicated thread pool
    #[cfg(feature = "parallel")]
    pub fn with_threads(pool: rayon::ThreadPool) -> Self {
        Self {
            threads: ThreadPool::Custom(pool),
            ..Self::new()
        }
    }

    /// Uses a dedicated pool of `n` threads, or the global pool if `n` is 0
    #[cfg(feature = "parallel")]
    pub fn set_threads(
        &mut self,
        n: usize,
    ) -> Result<(), rayon::ThreadPoolBuildError> {
        self.threads = match n {
            0 => ThreadPool::Global,
            n => ThreadPool::Custom(
                rayon::ThreadPoolBuilder::new().num_threads(n).build()?,
            ),
        };
        Ok(())
    }

    /// Stops the dedicated threads (if any) and forgets recorded durations
    ///
    /// The pool stays usable; later batches run on the global pool.
    pub fn shutdown(&mut self) {
        #[cfg(feature = "parallel")]
        {
            self.threads = ThreadPool::Global;
        }
        self.history.clear();
    }

    /// Enables or disables parallel execution
    ///
    /// When disabled, jobs run serially on the calling thread, still in
    /// longest-first order.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_strategy(&mut self, strategy: GroupStrategy) {
        self.strategy = strategy;
    }

    pub fn strategy(&self) -> GroupStrategy {
        self.strategy
    }

    /// Returns the number of threads used by [`run`](Self::run)
    pub fn thread_count(&self) -> usize {
        #[cfg(feature = "parallel")]
        if self.enabled {
            return self.threads.thread_count();
        }
        1
    }

    /// Returns the last recorded duration of a named job
    pub fn elapsed(&self, name: &str) -> Option<Duration> {
        self.history.get(name).copied()
    }

    /// Starts a batch of jobs submitted one at a time
    pub fn queue<'a, R: Send>(&mut self) -> JobQueue<'_, 'a, R> {
        JobQueue {
            pool: self,
            jobs: vec![],
        }
    }

    /// Runs a batch of jobs, returning their results in submission order
    pub fn run<'a, R: Send>(&mut self, jobs: Vec<Job<'a, R>>) -> Vec<R> {
        let start = Instant::now();
        let count = jobs.len();
        let groups = self.plan(jobs);
        debug!("{count} jobs in {} groups ({})", groups.len(), self.strategy);

        let run = |group: Vec<Slot<'a, R>>| -> Vec<Done<R>> {
            group
                .into_iter()
                .map(|(i, j)| {
                    let t = Instant::now();
                    let r = (j.f)();
                    (i, j.name, t.elapsed(), r)
                })
                .collect()
        };
        let mut done: Vec<Done<R>> = if self.enabled {
            self.run_parallel(groups, run)
        } else {
            groups.into_iter().flat_map(run).collect()
        };

        done.sort_by_key(|(i, ..)| *i);
        let mut out = Vec::with_capacity(done.len());
        for (_, name, elapsed, r) in done {
            debug!("job {name}: {elapsed:?}");
            self.history.insert(name, elapsed);
            out.push(r);
        }
        debug!("ran {count} jobs in {:?}", start.elapsed());
        out
    }

    /// Sorts jobs longest first (unknown first) and splits them into groups
    fn plan<'a, R>(&self, jobs: Vec<Job<'a, R>>) -> Vec<Vec<Slot<'a, R>>> {
        let mut jobs: Vec<Slot<'a, R>> = jobs.into_iter().enumerate().collect();
        jobs.sort_by_key(|(i, j)| {
            let t = self.elapsed(&j.name).unwrap_or(Duration::MAX);
            (std::cmp::Reverse(t), *i)
        });
        match self.strategy {
            GroupStrategy::SingleOrdered => {
                jobs.into_iter().map(|j| vec![j]).collect()
            }
            GroupStrategy::MultiHalfTime => self.half_time_groups(jobs),
        }
    }

    fn half_time_groups<'a, R>(
        &self,
        jobs: Vec<Slot<'a, R>>,
    ) -> Vec<Vec<Slot<'a, R>>> {
        let threads = u32::try_from(self.thread_count().max(1)).unwrap_or(u32::MAX);
        let mut remaining: Duration = jobs
            .iter()
            .filter_map(|(_, j)| self.elapsed(&j.name))
            .sum();

        let mut out = vec![];
        let mut current: Vec<Slot<'a, R>> = vec![];
        let mut current_time = Duration::ZERO;
        let mut target = Duration::ZERO;
        for (i, j) in jobs {
            let Some(t) = self.elapsed(&j.name) else {
                out.push(vec![(i, j)]);
                continue;
            };
            if !current.is_empty() && current_time + t > target {
                out.push(std::mem::take(&mut current));
                current_time = Duration::ZERO;
            }
            if current.is_empty() {
                target = remaining / threads / 2;
            }
            remaining = remaining.saturating_sub(t);
            current_time += t;
            current.push((i, j));
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    #[cfg(feature = "parallel")]
    fn run_parallel<'a, R, F>(&self, groups: Vec<Vec<Slot<'a, R>>>, f: F) -> Vec<Done<R>>
    where
        R: Send,
        F: Fn(Vec<Slot<'a, R>>) -> Vec<Done<R>> + Send + Sync,
    {
        use rayon::prelude::*;
        self.threads.run(|| {
            groups
                .into_par_iter()
                .with_max_len(1)
                .flat_map_iter(f)
                .collect()
        })
    }

    #[cfg(not(feature = "parallel"))]
    fn run_parallel<'a, R, F>(&self, groups: Vec<Vec<Slot<'a, R>>>, f: F) -> Vec<Done<R>>
    where
        R: Send,
        F: Fn(Vec<Slot<'a, R>>) -> Vec<Done<R>> + Send + Sync,
    {
        groups.into_iter().flat_map(f).collect()
    }
}

/// Jobs submitted one at a time, then run together by [`JobQueue::wait`]
pub struct JobQueue<'p, 'a, R> {
    pool: &'p mut JobPool,
    jobs: Vec<Job<'a, R>>,
}

impl<'a, R: Send> JobQueue<'_, 'a, R> {
    /// Adds a job, returning its position in the results of [`wait`](Self::wait)
    pub fn submit(&mut self, job: Job<'a, R>) -> usize {
        self.jobs.push(job);
        self.jobs.len() - 1
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Runs every submitted job, recording their durations in the pool
    pub fn wait(self) -> Vec<R> {
        self.pool.run(self.jobs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn submission_order() {
        let mut pool = JobPool::new();
        let jobs = (0..16)
            .map(|i| Job::new(format!("job{i}"), move || i * i))
            .collect();
        let out = pool.run(jobs);
        assert_eq!(out, (0..16).map(|i| i * i).collect::<Vec<_>>());
        assert!(pool.elapsed("job3").is_some());
        assert!(pool.elapsed("job16").is_none());
    }

    #[test]
    fn longest_first() {
        let mut pool = JobPool::new();
        pool.set_enabled(false);
        pool.history.insert("short".to_owned(), Duration::from_millis(1));
        pool.history.insert("long".to_owned(), Duration::from_secs(1));

        let order = Mutex::new(vec![]);
        let jobs = ["short", "new", "long"]
            .into_iter()
            .map(|n| {
                let order = &order;
                Job::new(n, move || order.lock().unwrap().push(n))
            })
            .collect();
        pool.run(jobs);
        assert_eq!(order.into_inner().unwrap(), ["new", "long", "short"]);
    }

    #[test]
    fn borrowed_data() {
        let data = vec![1.0, 2.0, 3.0];
        let mut pool = JobPool::new();
        let jobs = (0..3)
            .map(|i| {
                let data = &data;
                Job::new(format!("{i}"), move || data[i] * 2.0)
            })
            .collect();
        assert_eq!(pool.run(jobs), [2.0, 4.0, 6.0]);
    }

    fn record(pool: &mut JobPool, durations: &[(&str, u64)]) {
        for (n, ms) in durations {
            pool.history.insert(n.to_string(), Duration::from_millis(*ms));
        }
    }

    #[test]
    fn half_time_groups() {
        let mut pool = JobPool::new();
        pool.set_enabled(false);
        pool.set_strategy(GroupStrategy::MultiHalfTime);
        let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];
        record(&mut pool, &[("a", 8)]);
        record(&mut pool, &names[1..].iter().map(|n| (*n, 1u64)).collect::<Vec<_>>());

        let mut jobs: Vec<Job<()>> = names.iter().map(|n| Job::new(*n, || ())).collect();
        jobs.push(Job::new("new", || ()));
        let groups = pool.plan(jobs);
        let names = groups
            .iter()
            .map(|g| g.iter().map(|(_, j)| j.name()).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                vec!["new"],
                vec!["a"],
                vec!["b", "c", "d", "e"],
                vec!["f", "g"],
                vec!["h"],
                vec!["i"],
            ]
        );

        pool.set_strategy(GroupStrategy::SingleOrdered);
        let jobs: Vec<Job<()>> = names.iter().flatten().map(|n| Job::new(*n, || ())).collect();
        assert!(pool.plan(jobs).iter().all(|g| g.len() == 1));
    }

    #[test]
    fn grouped_submission_order() {
        let mut pool = JobPool::new();
        pool.set_strategy(GroupStrategy::MultiHalfTime);
        record(&mut pool, &[("job0", 5), ("job1", 1), ("job2", 1), ("job3", 2)]);
        let jobs = (0..6)
            .map(|i| Job::new(format!("job{i}"), move || i + 10))
            .collect();
        assert_eq!(pool.run(jobs), [10, 11, 12, 13, 14, 15]);
        assert_eq!(pool.strategy().to_string(), "multi_half_time");
    }

    #[test]
    fn queue() {
        let data = [3, 1, 4, 1, 5];
        let mut pool = JobPool::new();
        let mut queue = pool.queue();
        assert!(queue.is_empty());
        for (i, d) in data.iter().enumerate() {
            assert_eq!(queue.submit(Job::new(format!("q{i}"), move || d * 2)), i);
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.wait(), [6, 2, 8, 2, 10]);
        assert!((0..5).all(|i| pool.elapsed(&format!("q{i}")).is_some()));
    }

    #[test]
    fn shutdown() {
        let mut pool = JobPool::new();
        pool.run(vec![Job::new("once", || ())]);
        assert!(pool.elapsed("once").is_some());
        pool.shutdown();
        assert!(pool.elapsed("once").is_none());
        assert_eq!(pool.run(vec![Job::new("again", || 7)]), [7]);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn set_threads() {
        let mut pool = JobPool::new();
        pool.set_threads(3).unwrap();
        assert_eq!(pool.thread_count(), 3);
        let jobs = (0..8).map(|i| Job::new(format!("{i}"), move || i)).collect();
        assert_eq!(pool.run(jobs), (0..8).collect::<Vec<_>>());

        pool.set_enabled(false);
        assert_eq!(pool.thread_count(), 1);
        pool.set_enabled(true);
        pool.shutdown();
        assert_eq!(pool.thread_count(), rayon::current_num_threads());
    }
}
