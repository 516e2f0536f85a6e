use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::*;
use rayon::prelude::*;

use super::types::{
    CancellationToken, MalformedRow, ShardReport, ShardSink, ShardSource, DEFAULT_CHECK_INTERVAL,
};
use crate::core::concurrency::build_thread_pool;
use crate::core::error::{Result, ScsnvError};

/// Runs every shard of a [`ShardSource`] on a dedicated Rayon pool.
///
/// Each pool task owns a sink created by the caller's `init` closure; a shard is
/// complete once its sink has been flushed. Retryable failures resume the shard
/// at the first record that has not reached the sink.
#[derive(Debug)]
pub struct ShardScheduler {
    pool: rayon::ThreadPool,
    retries: u32,
    timeout: Option<Duration>,
    check_interval: usize,
    cancel: CancellationToken,
}

struct ShardFailure {
    offset: u64,
    error: ScsnvError,
}

impl ShardFailure {
    fn at(offset: u64) -> impl FnOnce(ScsnvError) -> ShardFailure {
        move |error| ShardFailure { offset, error }
    }
}

impl ShardScheduler {
    pub fn new(threads: usize, cancel: CancellationToken) -> Result<Self> {
        let pool = build_thread_pool(threads)?;
        info!("Using {} producer threads.", pool.current_num_threads());
        Ok(Self {
            pool,
            retries: 0,
            timeout: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            cancel,
        })
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Records read between cancellation and timeout checks.
    pub fn with_check_interval(mut self, records: usize) -> Self {
        self.check_interval = records.max(1);
        self
    }

    /// Process all shards. Returns one report per shard in shard order, or the
    /// first fatal failure.
    ///
    /// A shard that still fails after its retries becomes
    /// [`ScsnvError::BuildAborted`]; a sink that lost its consumer surfaces
    /// [`ScsnvError::WorkerDisconnected`] unchanged.
    pub fn run<S, K, I>(&self, source: &S, init: I) -> Result<Vec<ShardReport>>
    where
        S: ShardSource + ?Sized,
        K: ShardSink,
        I: Fn() -> K + Sync + Send,
    {
        let shard_count = source.shard_count();
        info!("Processing {} shard(s)", shard_count);
        let abort = AtomicBool::new(false);

        let results: Vec<std::result::Result<ShardReport, ShardFailure>> = self.pool.install(|| {
            (0..shard_count)
                .into_par_iter()
                .map_init(&init, |sink, shard| {
                    let result = self.run_shard(source, sink, shard, &abort);
                    if result.is_err() {
                        abort.store(true, Ordering::Release);
                    }
                    result
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(shard_count);
        let mut failures = Vec::new();
        for (shard, result) in results.into_iter().enumerate() {
            match result {
                Ok(report) => reports.push(report),
                Err(failure) => failures.push((shard, failure)),
            }
        }
        if failures.is_empty() {
            return Ok(reports);
        }

        // shards stopped by the abort flag report Cancelled; prefer the real cause
        let primary = failures
            .iter()
            .position(|(_, f)| !matches!(f.error, ScsnvError::Cancelled));
        let Some(primary) = primary else {
            warn!("Build cancelled after {} flushed shard(s)", reports.len());
            return Err(ScsnvError::Cancelled);
        };
        let (shard, failure) = failures.swap_remove(primary);
        match failure.error {
            err @ ScsnvError::WorkerDisconnected { .. } => Err(err),
            err => {
                let flushed_shards: Vec<usize> = reports.iter().map(|r| r.shard).collect();
                error!(
                    "Shard {} failed at record {}: {}",
                    shard, failure.offset, err
                );
                Err(ScsnvError::BuildAborted {
                    shard,
                    offset: failure.offset,
                    flushed_shards,
                    source: Box::new(err),
                })
            }
        }
    }

    fn interrupted(&self, abort: &AtomicBool) -> bool {
        self.cancel.is_cancelled() || abort.load(Ordering::Acquire)
    }

    fn run_shard<S, K>(
        &self,
        source: &S,
        sink: &mut K,
        shard: usize,
        abort: &AtomicBool,
    ) -> std::result::Result<ShardReport, ShardFailure>
    where
        S: ShardSource + ?Sized,
        K: ShardSink,
    {
        let mut consumed = 0u64;
        let mut attempts = 0u32;
        loop {
            if self.interrupted(abort) {
                return Err(ShardFailure {
                    offset: consumed,
                    error: ScsnvError::Cancelled,
                });
            }
            attempts += 1;
            match self.attempt(source, sink, shard, &mut consumed, abort) {
                Ok(()) => {
                    sink.flush().map_err(ShardFailure::at(consumed))?;
                    debug!(
                        "Shard {} flushed {} records in {} attempt(s)",
                        shard, consumed, attempts
                    );
                    return Ok(ShardReport {
                        shard,
                        records: consumed,
                        attempts,
                    });
                }
                Err(err) if err.is_retryable() && attempts <= self.retries => {
                    warn!(
                        "Shard {} interrupted at record {} (attempt {}/{}): {}",
                        shard,
                        consumed,
                        attempts,
                        self.retries + 1,
                        err
                    );
                    sink.flush().map_err(ShardFailure::at(consumed))?;
                }
                Err(err) => return Err(ShardFailure::at(consumed)(err)),
            }
        }
    }

    fn attempt<S, K>(
        &self,
        source: &S,
        sink: &mut K,
        shard: usize,
        consumed: &mut u64,
        abort: &AtomicBool,
    ) -> Result<()>
    where
        S: ShardSource + ?Sized,
        K: ShardSink,
    {
        let started = Instant::now();
        let stream = source.open(shard, *consumed)?;
        for (i, item) in stream.enumerate() {
            match item {
                Ok(record) => sink.accept(record)?,
                Err(err) => match err.downcast_ref::<MalformedRow>() {
                    Some(row) => {
                        trace!("Shard {} skipping malformed row {}", shard, row);
                        sink.malformed(row);
                    }
                    None => return Err(err.into()),
                },
            }
            *consumed += 1;

            if (i + 1) % self.check_interval == 0 {
                if self.interrupted(abort) {
                    return Err(ScsnvError::Cancelled);
                }
                if let Some(limit) = self.timeout {
                    if started.elapsed() > limit {
                        return Err(ScsnvError::ShardTimeout {
                            shard,
                            limit_ms: limit.as_millis(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::shards::{InMemoryShards, RecordStream};
    use crate::pipeline::snvmat::RawRecord;
    use crossbeam::channel::{bounded, Sender};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    fn records(shard: usize, n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| RawRecord::new(format!("S{}", shard), "chr1", i as u64 + 1, "A", 30))
            .collect()
    }

    fn source(shards: usize, per_shard: usize) -> InMemoryShards {
        InMemoryShards::new((0..shards).map(|s| records(s, per_shard)).collect())
    }

    /// Fails `shard` once per remaining budget when reaching record `fail_at`.
    struct FlakyShards {
        inner: InMemoryShards,
        shard: usize,
        fail_at: u64,
        failures: AtomicU32,
    }

    impl ShardSource for FlakyShards {
        fn shard_count(&self) -> usize {
            self.inner.shard_count()
        }

        fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>> {
            let stream = self.inner.open(shard, offset)?;
            if shard != self.shard {
                return Ok(stream);
            }
            let fail_at = self.fail_at;
            Ok(Box::new(stream.enumerate().map(move |(i, item)| {
                let position = offset + i as u64;
                if position == fail_at
                    && self
                        .failures
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                        .is_ok()
                {
                    anyhow::bail!("transient read failure");
                }
                item
            })))
        }
    }

    /// Replaces every `every`-th record with an unparseable row.
    struct GappyShards {
        inner: InMemoryShards,
        every: u64,
    }

    impl ShardSource for GappyShards {
        fn shard_count(&self) -> usize {
            self.inner.shard_count()
        }

        fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>> {
            let stream = self.inner.open(shard, offset)?;
            let every = self.every;
            Ok(Box::new(stream.enumerate().map(move |(i, item)| {
                let position = offset + i as u64;
                if position % every == 0 {
                    return Err(anyhow::Error::new(MalformedRow {
                        location: format!("shard{}:{}", shard, position),
                        reason: "bad quality".to_string(),
                    }));
                }
                item
            })))
        }
    }

    struct SlowShards(InMemoryShards);

    impl ShardSource for SlowShards {
        fn shard_count(&self) -> usize {
            self.0.shard_count()
        }

        fn open(&self, shard: usize, offset: u64) -> anyhow::Result<RecordStream<'_>> {
            let stream = self.0.open(shard, offset)?;
            Ok(Box::new(stream.inspect(|_| {
                thread::sleep(Duration::from_millis(5))
            })))
        }
    }

    /// Buffers records and publishes them on flush.
    struct CollectSink {
        pending: Vec<RawRecord>,
        out: Arc<Mutex<Vec<RawRecord>>>,
        malformed: Arc<AtomicU32>,
    }

    impl ShardSink for CollectSink {
        fn accept(&mut self, record: RawRecord) -> Result<()> {
            self.pending.push(record);
            Ok(())
        }

        fn malformed(&mut self, _row: &MalformedRow) {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        }

        fn flush(&mut self) -> Result<()> {
            self.out.lock().append(&mut self.pending);
            Ok(())
        }
    }

    fn collect_with(
        scheduler: &ShardScheduler,
        source: &dyn ShardSource,
    ) -> (Result<Vec<ShardReport>>, Vec<RawRecord>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let result = scheduler.run(source, || CollectSink {
            pending: Vec::new(),
            out: Arc::clone(&out),
            malformed: Arc::new(AtomicU32::new(0)),
        });
        let mut collected = out.lock().clone();
        collected.sort_by(|a, b| (&a.barcode, a.position).cmp(&(&b.barcode, b.position)));
        (result, collected)
    }

    #[test]
    fn every_record_reaches_a_sink_once() {
        let scheduler = ShardScheduler::new(3, CancellationToken::new()).unwrap();
        let (result, collected) = collect_with(&scheduler, &source(5, 40));
        let reports = result.unwrap();
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.records == 40 && r.attempts == 1));
        assert_eq!(collected.len(), 200);
    }

    #[test]
    fn retry_resumes_without_duplicates() {
        let flaky = FlakyShards {
            inner: source(3, 50),
            shard: 1,
            fail_at: 17,
            failures: AtomicU32::new(2),
        };
        let scheduler = ShardScheduler::new(2, CancellationToken::new())
            .unwrap()
            .with_retries(2);
        let (result, collected) = collect_with(&scheduler, &flaky);
        let reports = result.unwrap();
        assert_eq!(reports[1].attempts, 3);
        assert_eq!(reports[1].records, 50);
        assert_eq!(collected.len(), 150);
        let shard1: Vec<u64> = collected
            .iter()
            .filter(|r| r.barcode == "S1")
            .map(|r| r.position)
            .collect();
        assert_eq!(shard1, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn malformed_rows_reach_the_sink_without_failing_the_shard() {
        let gappy = GappyShards {
            inner: source(2, 30),
            every: 10,
        };
        let scheduler = ShardScheduler::new(2, CancellationToken::new())
            .unwrap()
            .with_retries(0);
        let out = Arc::new(Mutex::new(Vec::new()));
        let malformed = Arc::new(AtomicU32::new(0));
        let reports = scheduler
            .run(&gappy, || CollectSink {
                pending: Vec::new(),
                out: Arc::clone(&out),
                malformed: Arc::clone(&malformed),
            })
            .unwrap();
        assert!(reports.iter().all(|r| r.records == 30 && r.attempts == 1));
        assert_eq!(malformed.load(Ordering::Relaxed), 6);
        assert_eq!(out.lock().len(), 54);
    }

    #[test]
    fn exhausted_retries_abort_with_context() {
        let flaky = FlakyShards {
            inner: source(3, 50),
            shard: 2,
            fail_at: 30,
            failures: AtomicU32::new(10),
        };
        let scheduler = ShardScheduler::new(1, CancellationToken::new())
            .unwrap()
            .with_retries(1);
        let (result, _) = collect_with(&scheduler, &flaky);
        match result {
            Err(ScsnvError::BuildAborted {
                shard,
                offset,
                flushed_shards,
                source,
            }) => {
                assert_eq!(shard, 2);
                assert_eq!(offset, 30);
                assert_eq!(flushed_shards, vec![0, 1]);
                assert!(matches!(*source, ScsnvError::Source(_)));
            }
            other => panic!("expected BuildAborted, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_token_stops_before_any_shard() {
        let token = CancellationToken::new();
        token.cancel();
        let scheduler = ShardScheduler::new(2, token).unwrap();
        let (result, collected) = collect_with(&scheduler, &source(4, 10));
        assert!(matches!(result, Err(ScsnvError::Cancelled)));
        assert!(collected.is_empty());
    }

    #[test]
    fn slow_shard_times_out() {
        let slow = SlowShards(source(1, 20));
        let scheduler = ShardScheduler::new(1, CancellationToken::new())
            .unwrap()
            .with_timeout(Some(Duration::from_millis(1)))
            .with_check_interval(1);
        let (result, _) = collect_with(&scheduler, &slow);
        match result {
            Err(ScsnvError::BuildAborted { source, offset, .. }) => {
                assert_eq!(offset, 1);
                assert!(matches!(*source, ScsnvError::ShardTimeout { shard: 0, .. }));
            }
            other => panic!("expected timeout abort, got {other:?}"),
        }
    }

    /// Sink forwarding into a bounded channel, as the matrix builder does.
    struct ChannelSink {
        tx: Sender<RawRecord>,
        pending: Vec<RawRecord>,
    }

    impl ShardSink for ChannelSink {
        fn accept(&mut self, record: RawRecord) -> Result<()> {
            self.pending.push(record);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            for record in self.pending.drain(..) {
                self.tx
                    .send(record)
                    .map_err(|_| ScsnvError::WorkerDisconnected { worker: 0 })?;
            }
            Ok(())
        }
    }

    #[test]
    fn bounded_channel_drains_after_scoped_senders_drop() {
        let (tx, rx) = bounded::<RawRecord>(2);
        let consumer = thread::spawn(move || rx.into_iter().count());
        let scheduler = ShardScheduler::new(4, CancellationToken::new()).unwrap();
        {
            let tx = tx.clone();
            scheduler
                .run(&source(16, 25), || ChannelSink {
                    tx: tx.clone(),
                    pending: Vec::new(),
                })
                .unwrap();
        }
        drop(tx);
        assert_eq!(consumer.join().unwrap(), 400);
    }

    #[test]
    fn dropped_consumer_surfaces_disconnect() {
        let (tx, rx) = bounded::<RawRecord>(1);
        drop(rx);
        let scheduler = ShardScheduler::new(2, CancellationToken::new()).unwrap();
        let result = scheduler.run(&source(3, 5), || ChannelSink {
            tx: tx.clone(),
            pending: Vec::new(),
        });
        assert!(matches!(
            result,
            Err(ScsnvError::WorkerDisconnected { worker: 0 })
        ));
    }
}
