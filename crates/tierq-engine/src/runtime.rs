//! Persistent worker groups over one shared combiner.
//!
//! Every group is a [`ThreadGroup`] of `lanes` threads running the same loop:
//! maintain, dequeue a batch, run the batch's handler, flush the children the
//! handler emitted, finish the batch. A group whose dequeue comes back empty
//! stops once no record is in flight anywhere, or when any group has failed.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tierq_common::memory::{RecordWords, SharedRegion, encode_record};
use tierq_common::types::{GroupId, TaskType, TaskTypeId};
use tierq_common::{Error, Result};
use tierq_core::group::{Lane, ThreadGroup, rank_below};
use tierq_core::queue::{
    ChainPlan, ExternalQueue, GlobalQueue, GroupQueues, Residual, TieredCombiner, WorkBatch,
};

use crate::config::Config;
use crate::report::{RunReport, TypeCount};

/// Handle a task handler uses to look at its position and emit children.
///
/// Children are buffered per lane and enqueued by the whole group once every
/// handler of the batch has returned, so a handler never has to line up
/// collectives with its siblings.
pub struct TaskScope<'a> {
    plan: &'a ChainPlan,
    group: GroupId,
    lane: u32,
    item: u32,
    part: u32,
    threads_per_item: u32,
    children: &'a mut [Vec<RecordWords>],
}

impl TaskScope<'_> {
    /// Group running the item.
    #[must_use]
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Lane running this call.
    #[must_use]
    pub fn lane(&self) -> u32 {
        self.lane
    }

    /// Index of the item within its batch.
    #[must_use]
    pub fn item(&self) -> u32 {
        self.item
    }

    /// This lane's index among the lanes sharing the item.
    #[must_use]
    pub fn part(&self) -> u32 {
        self.part
    }

    /// Lanes sharing the item.
    #[must_use]
    pub fn threads_per_item(&self) -> u32 {
        self.threads_per_item
    }

    /// Queues a child record of type `T`.
    ///
    /// Every lane sharing an item runs the handler, so handlers of
    /// multi-lane types usually emit from `part() == 0` only.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`](tierq_common::QueueError) if `T` is not part
    /// of the chain.
    pub fn enqueue<T: TaskType>(&mut self, record: &T::Data) -> Result<()> {
        let pos = self.plan.position_of::<T>()?;
        self.children[pos].push(encode_record(record));
        Ok(())
    }
}

trait ErasedHandler<Q: ExternalQueue>: Send + Sync {
    fn call(
        &self,
        combiner: &TieredCombiner<Q>,
        group: &GroupQueues,
        batch: &WorkBatch,
        scope: &mut TaskScope<'_>,
    ) -> Result<()>;
}

struct TypedHandler<T, F> {
    f: F,
    _task: PhantomData<fn() -> T>,
}

impl<Q, T, F> ErasedHandler<Q> for TypedHandler<T, F>
where
    Q: ExternalQueue,
    T: TaskType,
    F: Fn(&mut TaskScope<'_>, &T::Data) -> Result<()> + Send + Sync,
{
    fn call(
        &self,
        combiner: &TieredCombiner<Q>,
        group: &GroupQueues,
        batch: &WorkBatch,
        scope: &mut TaskScope<'_>,
    ) -> Result<()> {
        let record = combiner.read::<T>(group, batch, scope.item)?;
        (self.f)(scope, &record)
    }
}

/// State shared by all groups of one run.
struct RunShared {
    abort: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl RunShared {
    fn fail(&self, err: Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            tracing::warn!("aborting run: {}", err);
            *failure = Some(err);
        }
        self.abort.store(true, Ordering::Release);
    }
}

/// Runs task handlers on persistent worker groups.
///
/// # Example
///
/// ```
/// use tierq_common::types::{TaskType, TaskTypeId};
/// use tierq_core::ChainPlan;
/// use tierq_engine::{Config, Runtime};
///
/// struct Countdown;
///
/// impl TaskType for Countdown {
///     type Data = u32;
///     const ID: TaskTypeId = TaskTypeId::new(1);
///     const NAME: &'static str = "countdown";
/// }
///
/// let plan = ChainPlan::builder(1024).count::<Countdown>(32).build().unwrap();
/// let config = Config::default().with_groups(2).with_lanes(4);
/// let mut runtime = Runtime::new(config, plan).unwrap();
/// runtime
///     .register::<Countdown, _>(|scope, &n| {
///         if n > 0 {
///             scope.enqueue::<Countdown>(&(n - 1))?;
///         }
///         Ok(())
///     })
///     .unwrap();
/// runtime.seed::<Countdown>([10]).unwrap();
///
/// let report = runtime.run().unwrap();
/// assert_eq!(report.total_executed(), 11);
/// ```
pub struct Runtime<Q: ExternalQueue + 'static = GlobalQueue> {
    config: Config,
    combiner: TieredCombiner<Q>,
    handlers: Vec<Option<Box<dyn ErasedHandler<Q>>>>,
    executed: Vec<AtomicU64>,
    started: AtomicBool,
}

impl Runtime<GlobalQueue> {
    /// Creates a runtime over a [`GlobalQueue`] external tier sized by
    /// `config.global_capacity`.
    ///
    /// # Errors
    ///
    /// See [`with_external`](Self::with_external).
    pub fn new(config: Config, plan: ChainPlan) -> Result<Self> {
        config.validate()?;
        let external = GlobalQueue::new(plan.registry(), config.global_capacity);
        Self::with_external(config, plan, Arc::new(external))
    }
}

impl<Q: ExternalQueue + 'static> Runtime<Q> {
    /// Creates a runtime over any external tier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid, the chain does not
    /// fit the per-group budget, a task type cannot run in a group of
    /// `config.lanes` lanes, or the external tier's maintenance needs more
    /// threads or shared memory than one group has.
    pub fn with_external(config: Config, plan: ChainPlan, external: Arc<Q>) -> Result<Self> {
        config.validate()?;
        if plan.region_bytes() > config.budget {
            return Err(Error::Config(format!(
                "chain needs {} bytes but the group budget is {}",
                plan.region_bytes(),
                config.budget
            )));
        }
        for desc in plan.registry().iter() {
            if desc.batch_cap(config.lanes, plan.extra_shared_budget()) == 0 {
                return Err(Error::Config(format!(
                    "{} ({}) cannot run in a group of {} lanes",
                    desc.name, desc.id, config.lanes
                )));
            }
        }
        if Q::GLOBAL_MAINTAIN_MIN_THREADS > 0 {
            if config.lanes < Q::GLOBAL_MAINTAIN_MIN_THREADS {
                return Err(Error::Config(format!(
                    "external maintenance needs {} threads but groups have {} lanes",
                    Q::GLOBAL_MAINTAIN_MIN_THREADS,
                    config.lanes
                )));
            }
            let needed = Q::global_maintain_shared_memory(config.lanes);
            if needed > config.budget {
                return Err(Error::Config(format!(
                    "external maintenance needs {needed} bytes but the group budget is {}",
                    config.budget
                )));
            }
        }
        let types = plan.registry().len();
        let combiner = TieredCombiner::new(Arc::new(plan), external, config.combiner.clone())?;
        Ok(Self {
            config,
            combiner,
            handlers: (0..types).map(|_| None).collect(),
            executed: (0..types).map(|_| AtomicU64::new(0)).collect(),
            started: AtomicBool::new(false),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared combiner.
    #[must_use]
    pub fn combiner(&self) -> &TieredCombiner<Q> {
        &self.combiner
    }

    /// Sets the handler for `T`, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`](tierq_common::QueueError) if `T` is not part
    /// of the chain.
    pub fn register<T, F>(&mut self, handler: F) -> Result<&mut Self>
    where
        T: TaskType,
        F: Fn(&mut TaskScope<'_>, &T::Data) -> Result<()> + Send + Sync + 'static,
    {
        let pos = self.combiner.plan().position_of::<T>()?;
        self.handlers[pos] = Some(Box::new(TypedHandler::<T, F> {
            f: handler,
            _task: PhantomData,
        }));
        Ok(self)
    }

    /// Pushes initial records into the external tier. Returns how many were
    /// stored.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`](tierq_common::QueueError) if `T` is not part
    /// of the chain.
    pub fn seed<T: TaskType>(&self, records: impl IntoIterator<Item = T::Data>) -> Result<u32> {
        let (mut stored, mut refused) = (0u32, 0u32);
        for record in records {
            if self.combiner.push::<T>(&record)? {
                stored += 1;
            } else {
                refused += 1;
            }
        }
        if refused > 0 {
            tracing::warn!("external tier refused {} {} seed records", refused, T::NAME);
        }
        Ok(stored)
    }

    /// Runs every group until no record is in flight.
    ///
    /// # Errors
    ///
    /// Returns the first handler error (or panic, as [`Error::Task`]); the
    /// other groups stop at their next loop iteration. Returns
    /// [`Error::Config`] on a second run when the external tier cannot set
    /// up its per-group state twice.
    pub fn run(&self) -> Result<RunReport> {
        if self.started.swap(true, Ordering::AcqRel) && !Q::SUPPORTS_REUSE_INIT {
            return Err(Error::Config(
                "the external tier does not support running twice".to_string(),
            ));
        }
        let started = Instant::now();
        tracing::info!(
            groups = self.config.groups,
            lanes = self.config.lanes,
            in_flight = self.combiner.in_flight(),
            "run starting"
        );
        if Q::GLOBAL_MAINTAIN_MIN_THREADS > 0 {
            self.combiner.external().global_maintain();
        }

        let shared = RunShared {
            abort: AtomicBool::new(false),
            failure: Mutex::new(None),
        };
        let residuals: Vec<Residual> = std::thread::scope(|scope| {
            let shared = &shared;
            let handles: Vec<_> = (0..self.config.groups)
                .map(|g| scope.spawn(move || self.run_group(GroupId::new(g), shared)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });

        if let Some(err) = shared.failure.into_inner() {
            return Err(err);
        }
        let residual = residuals.iter().fold(Residual::default(), |sum, r| Residual {
            drained: sum.drained + r.drained,
            lost: sum.lost + r.lost,
            discarded: sum.discarded + r.discarded,
        });
        let report = self.report(started.elapsed(), residual);
        tracing::info!(
            executed = report.total_executed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "run finished"
        );
        if report.stats.dropped > 0 {
            tracing::warn!("{} records were refused by both tiers", report.stats.dropped);
        }
        Ok(report)
    }

    fn run_group(&self, id: GroupId, shared: &RunShared) -> Residual {
        let setup = self.combiner.new_group(id, self.config.lanes).and_then(|queues| {
            let group = ThreadGroup::new(self.config.lanes)?;
            Ok((queues, group))
        });
        let (queues, mut group) = match setup {
            Ok(setup) => setup,
            Err(err) => {
                shared.fail(err);
                return Residual::default();
            }
        };
        let exchange = SharedRegion::with_words(self.config.lanes * self.max_record_words());
        tracing::debug!(group = id.as_u32(), "worker group started");

        let residual = group
            .run(|lane| self.lane_loop(&queues, &exchange, lane, shared))
            .first()
            .copied()
            .unwrap_or_default();

        tracing::debug!(
            group = id.as_u32(),
            drained = residual.drained,
            "worker group finished"
        );
        if residual.lost > 0 {
            tracing::warn!(
                "group {} lost {} records the external tier refused",
                id,
                residual.lost
            );
        }
        if residual.discarded > 0 {
            tracing::warn!("group {} discarded {} local records", id, residual.discarded);
        }
        residual
    }

    fn lane_loop<L: Lane + ?Sized>(
        &self,
        queues: &GroupQueues,
        exchange: &SharedRegion,
        lane: &L,
        shared: &RunShared,
    ) -> Residual {
        let combiner = &self.combiner;
        let mut children: Vec<Vec<RecordWords>> = vec![Vec::new(); self.executed.len()];
        let backoff = Backoff::new();
        combiner.worker_start(queues, lane);
        loop {
            let abort = lane.is_leader() && shared.abort.load(Ordering::Acquire);
            if lane.broadcast(u32::from(abort), 0) != 0 {
                break;
            }
            combiner.worker_maintain(lane);
            let Some(batch) = combiner.dequeue(queues, lane) else {
                let done = lane.is_leader() && combiner.in_flight() == 0;
                if lane.broadcast(u32::from(done), 0) != 0 {
                    break;
                }
                backoff.snooze();
                continue;
            };
            backoff.reset();

            let mut failure = self.execute(queues, lane, &batch, &mut children).err();
            if let Err(err) = self.flush(queues, exchange, lane, &mut children) {
                failure.get_or_insert(err);
            }
            if let Err(err) = combiner.finish_read(queues, lane, &batch) {
                failure.get_or_insert(err);
            }
            if lane.is_leader()
                && let Ok(pos) = combiner.plan().position(batch.type_id)
            {
                self.executed[pos].fetch_add(u64::from(batch.count), Ordering::Relaxed);
            }
            let failed = lane.ballot(failure.is_some()) != 0;
            if let Some(err) = failure {
                shared.fail(err);
            }
            if failed {
                break;
            }
        }
        combiner.worker_end(queues, lane)
    }

    /// Runs the batch's handler on every lane that owns an item.
    fn execute<L: Lane + ?Sized>(
        &self,
        queues: &GroupQueues,
        lane: &L,
        batch: &WorkBatch,
        children: &mut [Vec<RecordWords>],
    ) -> Result<()> {
        let plan = self.combiner.plan();
        let pos = plan.position(batch.type_id)?;
        let threads_per_item = plan.descriptor(pos).threads_per_item.max(1);
        let item = lane.id() / threads_per_item;
        if item >= batch.count {
            return Ok(());
        }
        let handler = self.handlers[pos]
            .as_ref()
            .ok_or_else(|| handler_error(batch.type_id, "no handler registered"))?;
        let mut scope = TaskScope {
            plan,
            group: queues.id(),
            lane: lane.id(),
            item,
            part: lane.id() % threads_per_item,
            threads_per_item,
            children,
        };
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            handler.call(&self.combiner, queues, batch, &mut scope)
        }))
        .unwrap_or_else(|_| Err(handler_error(batch.type_id, "handler panicked")))
    }

    /// Enqueues every lane's buffered children, one round per record.
    /// Collective.
    fn flush<L: Lane + ?Sized>(
        &self,
        queues: &GroupQueues,
        exchange: &SharedRegion,
        lane: &L,
        children: &mut [Vec<RecordWords>],
    ) -> Result<()> {
        let plan = self.combiner.plan();
        let lanes_per_record = self.config.combiner.lanes_per_record;
        let mut result = Ok(());
        for (pos, pending) in children.iter_mut().enumerate() {
            let desc = plan.descriptor(pos);
            loop {
                let mask = lane.ballot(!pending.is_empty());
                if mask == 0 {
                    break;
                }
                let offer = if lanes_per_record == 1 {
                    pending.pop()
                } else {
                    share_children(
                        exchange,
                        lane,
                        mask,
                        desc.record_words(),
                        pending,
                        lanes_per_record,
                    )
                };
                if let Err(err) = self
                    .combiner
                    .enqueue_raw(queues, lane, desc.id, offer.as_deref())
                {
                    result = result.and(Err(err));
                }
            }
        }
        result
    }

    fn max_record_words(&self) -> u32 {
        self.combiner
            .plan()
            .registry()
            .iter()
            .map(|desc| desc.record_words())
            .max()
            .unwrap_or(1)
    }

    fn report(&self, elapsed: Duration, residual: Residual) -> RunReport {
        let executed = self
            .combiner
            .plan()
            .registry()
            .iter()
            .zip(&self.executed)
            .map(|(desc, count)| TypeCount {
                id: desc.id,
                name: desc.name,
                executed: count.load(Ordering::Relaxed),
            })
            .collect();
        RunReport {
            config: self.config.clone(),
            stats: self.combiner.snapshot(),
            external: self.combiner.external().record(),
            residual,
            executed,
            elapsed,
        }
    }
}

impl<Q: ExternalQueue + std::fmt::Debug + 'static> std::fmt::Debug for Runtime<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("combiner", &self.combiner)
            .finish_non_exhaustive()
    }
}

/// Spreads up to `width / lanes_per_record` children over consecutive lane
/// sets through `exchange`, so every lane of a set offers the same record.
/// Collective.
fn share_children<L: Lane + ?Sized>(
    exchange: &SharedRegion,
    lane: &L,
    mask: u64,
    words: u32,
    pending: &mut Vec<RecordWords>,
    lanes_per_record: u32,
) -> Option<RecordWords> {
    let sets = lane.width() / lanes_per_record;
    let owners = mask.count_ones().min(sets);
    let rank = rank_below(mask, lane.id());
    if mask & (1u64 << lane.id()) != 0
        && rank < sets
        && let Some(child) = pending.pop()
    {
        exchange.write_record_part(rank * words, &child, 0, 1);
    }
    lane.barrier();
    let set = lane.id() / lanes_per_record;
    (set < owners).then(|| exchange.read_words(set * words, words))
}

fn handler_error(task: TaskTypeId, message: &str) -> Error {
    Error::Task {
        task,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierq_core::CombinerConfig;
    use tierq_core::queue::{BatchCap, Dequeued, ExternalStats};

    struct Node;
    impl TaskType for Node {
        type Data = [u32; 2];
        const ID: TaskTypeId = TaskTypeId::new(1);
        const NAME: &'static str = "node";
    }

    struct Leaf;
    impl TaskType for Leaf {
        type Data = u32;
        const ID: TaskTypeId = TaskTypeId::new(2);
        const NAME: &'static str = "leaf";
    }

    struct Wide;
    impl TaskType for Wide {
        type Data = u32;
        const ID: TaskTypeId = TaskTypeId::new(3);
        const NAME: &'static str = "wide";
        const THREADS_PER_ITEM: u32 = 2;
    }

    struct Hungry;
    impl TaskType for Hungry {
        type Data = u32;
        const ID: TaskTypeId = TaskTypeId::new(4);
        const NAME: &'static str = "hungry";
        const SHARED_PER_ITEM: u32 = 512;
    }

    struct Outsider;
    impl TaskType for Outsider {
        type Data = u32;
        const ID: TaskTypeId = TaskTypeId::new(9);
        const NAME: &'static str = "outsider";
    }

    /// A global queue whose maintenance needs eight threads and 64 shared
    /// bytes per thread, and which cannot be started twice.
    #[derive(Debug)]
    struct Maintained {
        inner: GlobalQueue,
        maintained: AtomicU64,
    }

    impl ExternalQueue for Maintained {
        const GLOBAL_MAINTAIN_MIN_THREADS: u32 = 8;

        fn global_maintain_shared_memory(threads: u32) -> u32 {
            threads * 64
        }

        fn global_maintain(&self) {
            self.maintained.fetch_add(1, Ordering::Relaxed);
        }

        fn enqueue(&self, type_id: TaskTypeId, record: &[u32]) -> bool {
            self.inner.enqueue(type_id, record)
        }

        fn dequeue<L: Lane + ?Sized>(
            &self,
            lane: &L,
            caps: &[BatchCap],
            out: &SharedRegion,
        ) -> Option<Dequeued> {
            self.inner.dequeue(lane, caps, out)
        }

        fn dequeue_selected<L: Lane + ?Sized>(
            &self,
            lane: &L,
            cap: &BatchCap,
            out: &SharedRegion,
        ) -> u32 {
            self.inner.dequeue_selected(lane, cap, out)
        }

        fn start_read<L: Lane + ?Sized>(
            &self,
            lane: &L,
            cap: &BatchCap,
            out: &SharedRegion,
        ) -> u32 {
            self.inner.start_read(lane, cap, out)
        }

        fn dequeue_start_read<L: Lane + ?Sized>(
            &self,
            lane: &L,
            caps: &[BatchCap],
            out: &SharedRegion,
        ) -> Option<Dequeued> {
            self.inner.dequeue_start_read(lane, caps, out)
        }

        fn finish_read<L: Lane + ?Sized>(&self, lane: &L, type_id: TaskTypeId, count: u32) {
            self.inner.finish_read(lane, type_id, count);
        }

        fn num_entries(&self, type_id: TaskTypeId) -> usize {
            self.inner.num_entries(type_id)
        }

        fn record(&self) -> ExternalStats {
            self.inner.record()
        }

        fn reset(&self) {
            self.inner.reset();
        }
    }

    fn maintained_runtime(config: Config) -> Result<Runtime<Maintained>> {
        let plan = tree_plan(8);
        let external = Maintained {
            inner: GlobalQueue::new(plan.registry(), 64),
            maintained: AtomicU64::new(0),
        };
        Runtime::with_external(config, plan, Arc::new(external))
    }

    fn tree_plan(local: u32) -> ChainPlan {
        ChainPlan::builder(4096)
            .count::<Node>(local)
            .count::<Leaf>(local)
            .build()
            .unwrap()
    }

    /// Nodes above `depth` fan out into `fanout` nodes; the deepest level
    /// emits two leaves each.
    fn tree_runtime(config: Config, local: u32, depth: u32, fanout: u32) -> Runtime {
        let mut runtime = Runtime::new(config, tree_plan(local)).unwrap();
        runtime
            .register::<Node, _>(move |scope, &[level, id]| {
                if level < depth {
                    for k in 0..fanout {
                        scope.enqueue::<Node>(&[level + 1, id * fanout + k])?;
                    }
                } else {
                    scope.enqueue::<Leaf>(&(id * 2))?;
                    scope.enqueue::<Leaf>(&(id * 2 + 1))?;
                }
                Ok(())
            })
            .unwrap()
            .register::<Leaf, _>(|_, _| Ok(()))
            .unwrap();
        runtime.seed::<Node>([[0, 0]]).unwrap();
        runtime
    }

    fn tree_counts(depth: u32, fanout: u32) -> (u64, u64) {
        let last = u64::from(fanout).pow(depth);
        let nodes: u64 = (0..=depth).map(|d| u64::from(fanout).pow(d)).sum();
        (nodes, last * 2)
    }

    #[test]
    fn test_tree_runs_to_completion() {
        let config = Config::default().with_groups(2).with_lanes(4);
        let runtime = tree_runtime(config, 16, 4, 3);
        let report = runtime.run().unwrap();

        let (nodes, leaves) = tree_counts(4, 3);
        assert_eq!(report.executed_of(Node::ID), nodes);
        assert_eq!(report.executed_of(Leaf::ID), leaves);
        assert_eq!(report.stats.in_flight(), 0);
        assert_eq!(report.stats.dropped, 0);
        assert_eq!(report.stats.finished, nodes + leaves);
        assert_eq!(runtime.combiner().in_flight(), 0);
    }

    #[test]
    fn test_small_chain_overflows_to_external() {
        let config = Config::default().with_groups(3).with_lanes(8);
        let report = tree_runtime(config, 2, 3, 4).run().unwrap();
        let (nodes, leaves) = tree_counts(3, 4);
        assert_eq!(report.total_executed(), nodes + leaves);
        assert!(report.stats.overflowed > 0);
        assert!(report.stats.external_batches > 0);
    }

    #[test]
    fn test_full_spill_still_completes() {
        let config = Config::default()
            .with_groups(2)
            .with_lanes(4)
            .with_combiner(CombinerConfig::default().with_spill_chance(100));
        let report = tree_runtime(config, 16, 3, 3).run().unwrap();
        let (nodes, leaves) = tree_counts(3, 3);
        assert_eq!(report.total_executed(), nodes + leaves);
        assert_eq!(report.stats.local_enqueued, 0);
        assert_eq!(report.stats.local_batches + report.stats.residual_batches, 0);
    }

    #[test]
    fn test_lanes_per_record_flush() {
        let config = Config::default()
            .with_groups(2)
            .with_lanes(8)
            .with_combiner(CombinerConfig::default().with_lanes_per_record(2));
        let report = tree_runtime(config, 16, 3, 3).run().unwrap();
        let (nodes, leaves) = tree_counts(3, 3);
        assert_eq!(report.executed_of(Node::ID), nodes);
        assert_eq!(report.executed_of(Leaf::ID), leaves);
        assert_eq!(report.stats.dropped, 0);
    }

    #[test]
    fn test_multi_lane_items() {
        let plan = ChainPlan::builder(1024).count::<Wide>(8).build().unwrap();
        let mut runtime = Runtime::new(Config::default().with_groups(1).with_lanes(4), plan).unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let leads = Arc::new(AtomicU64::new(0));
        let (c, l) = (Arc::clone(&calls), Arc::clone(&leads));
        runtime
            .register::<Wide, _>(move |scope, _| {
                assert_eq!(scope.threads_per_item(), 2);
                assert_eq!(scope.item(), scope.lane() / 2);
                c.fetch_add(1, Ordering::Relaxed);
                if scope.part() == 0 {
                    l.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(runtime.seed::<Wide>(0..10).unwrap(), 10);
        let report = runtime.run().unwrap();
        assert_eq!(report.executed_of(Wide::ID), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 20);
        assert_eq!(leads.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_handler_error_aborts_run() {
        let plan = ChainPlan::builder(1024).count::<Leaf>(8).build().unwrap();
        let mut runtime = Runtime::new(Config::default().with_groups(2).with_lanes(4), plan).unwrap();
        runtime
            .register::<Leaf, _>(|_, &value| {
                if value == 7 {
                    Err(handler_error(Leaf::ID, "bad leaf"))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        runtime.seed::<Leaf>(0..20).unwrap();
        let err = runtime.run().unwrap_err();
        assert!(matches!(err, Error::Task { task, .. } if task == Leaf::ID));
    }

    #[test]
    fn test_handler_panic_becomes_error() {
        let plan = ChainPlan::builder(1024).count::<Leaf>(8).build().unwrap();
        let mut runtime = Runtime::new(Config::default().with_groups(1).with_lanes(2), plan).unwrap();
        runtime
            .register::<Leaf, _>(|_, _| panic!("leaf handler exploded"))
            .unwrap();
        runtime.seed::<Leaf>([1]).unwrap();
        let err = runtime.run().unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn test_missing_handler_is_an_error() {
        let runtime = Runtime::new(Config::default().with_groups(1).with_lanes(2), tree_plan(8)).unwrap();
        runtime.seed::<Leaf>([1, 2]).unwrap();
        let err = runtime.run().unwrap_err();
        assert!(err.to_string().contains("no handler"));
    }

    #[test]
    fn test_construction_errors() {
        let tight = Config::default().with_budget(64);
        assert!(matches!(
            Runtime::new(tight, tree_plan(16)),
            Err(Error::Config(_))
        ));

        let plan = ChainPlan::builder(1024)
            .count::<Hungry>(8)
            .extra_shared_budget(256)
            .build()
            .unwrap();
        assert!(matches!(
            Runtime::new(Config::default(), plan),
            Err(Error::Config(_))
        ));

        let mut runtime = Runtime::new(Config::default(), tree_plan(8)).unwrap();
        assert!(runtime.register::<Outsider, _>(|_, _| Ok(())).is_err());
        assert!(runtime.seed::<Outsider>([1]).is_err());
    }

    #[test]
    fn test_external_maintenance_requirements() {
        let narrow = Config::default().with_groups(1).with_lanes(4);
        let err = maintained_runtime(narrow).unwrap_err();
        assert!(err.to_string().contains("needs 8 threads"));
        // The chain fits in 256 bytes but maintenance wants 512.
        let tight = Config::default().with_lanes(8).with_budget(256);
        let err = maintained_runtime(tight).unwrap_err();
        assert!(err.to_string().contains("needs 512 bytes"));

        let config = Config::default().with_groups(1).with_lanes(8);
        let mut runtime = maintained_runtime(config).unwrap();
        runtime.register::<Leaf, _>(|_, _| Ok(())).unwrap();
        runtime.seed::<Leaf>([1, 2, 3]).unwrap();
        assert_eq!(runtime.run().unwrap().executed_of(Leaf::ID), 3);
        assert_eq!(runtime.combiner().external().maintained.load(Ordering::Relaxed), 1);

        // The tier cannot set up its per-group state a second time.
        assert!(matches!(runtime.run(), Err(Error::Config(_))));
        assert_eq!(runtime.combiner().external().maintained.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_global_queue_runs_twice() {
        let config = Config::default().with_groups(2).with_lanes(4);
        let runtime = tree_runtime(config, 8, 2, 2);
        let first = runtime.run().unwrap();
        runtime.seed::<Node>([[2, 0]]).unwrap();
        let second = runtime.run().unwrap();
        assert_eq!(second.executed_of(Node::ID), first.executed_of(Node::ID) + 1);
        assert_eq!(second.executed_of(Leaf::ID), first.executed_of(Leaf::ID) + 2);
    }

    #[test]
    fn test_seed_reports_refusals() {
        let config = Config::default().with_global_capacity(3);
        let runtime = Runtime::new(config, tree_plan(8)).unwrap();
        assert_eq!(runtime.seed::<Leaf>(0..5).unwrap(), 3);
        assert_eq!(runtime.combiner().snapshot().dropped, 2);
    }

    #[test]
    fn test_report_serializes() {
        let config = Config::default().with_groups(1).with_lanes(4);
        let report = tree_runtime(config, 8, 2, 2).run().unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["config"]["lanes"], 4);
        assert_eq!(json["executed"][0]["name"], "node");
        assert_eq!(json["executed"][1]["executed"], 8);
        assert!(json["stats"]["finished"].as_u64().unwrap() > 0);
    }
}
