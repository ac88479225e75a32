//! Worker runtime: one I/O thread, a pool of compute threads.
//!
//! The thread that calls [`Worker::run`] becomes the I/O task. It owns the
//! transport endpoint, is the only code that touches a transport primitive,
//! and moves work through two hand-off queues: the ready queue (I/O ->
//! compute) and the completion queue (compute -> I/O). Compute threads
//! burn the simulated service time and never see the network, so a slow
//! service cannot stall receives and the transport never runs from two
//! threads.

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::queue::{Task, TaskQueue};
use crate::rpc::{alloc_msg_buffer, Nexus, ReqHandle, RpcEndpoint, RpcEvent};
use crate::threading::set_thread_core;
use crate::time::{now_ns, us_to_ns, Clock};
use crate::wire::{
    RequestType, StateUpdate, WorkerRequest, WorkerResponse, REQ_LB_TO_WORKER, REQ_STATE_UPDATE,
};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const COMPLETION_QUEUE_CAP: usize = 4096;
const COMPLETION_PUSH_RETRIES: usize = 1_000;

/// Burn wall time until `service_hint_us`, adjusted for the request class
/// and this node's capacity, has elapsed. Busy-waiting keeps sub-10 us
/// services from being blurred by scheduler wakeup jitter. Returns the
/// elapsed time actually spent.
pub fn simulate_service(
    request_type: RequestType,
    service_hint_us: u32,
    capacity_factor: f64,
    stop: &AtomicBool,
) -> u64 {
    let hint = if service_hint_us == 0 {
        10
    } else {
        service_hint_us
    };
    let target_us = hint as f64 * request_type.multiplier() / capacity_factor;
    let start = now_ns();
    let target = start + us_to_ns(target_us as u64);
    while now_ns() < target && !stop.load(Ordering::Relaxed) {
        std::hint::spin_loop();
    }
    now_ns() - start
}

/// Shared counters readable while the worker runs.
pub struct WorkerCounters {
    pub received: AtomicU64,
    pub active: AtomicU64,
    pub completed: AtomicU64,
}

pub struct Worker {
    config: WorkerConfig,
    clock: Clock,
    queue: Arc<TaskQueue>,
    counters: Arc<WorkerCounters>,
    metrics: Arc<MetricsCollector>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Worker {
        let clock = Clock::with_skew(config.clock_skew_ns);
        let queue = Arc::new(TaskQueue::new(config.queue));
        Worker {
            config,
            clock,
            queue,
            counters: Arc::new(WorkerCounters {
                received: AtomicU64::new(0),
                active: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn counters(&self) -> Arc<WorkerCounters> {
        self.counters.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Run until `stop` is set. Blocks the calling thread, which becomes
    /// the I/O task.
    pub fn run(&self, stop: Arc<AtomicBool>) -> Result<()> {
        let mut nexus = Nexus::new(&self.config.uri)?;
        nexus.register_req_func(REQ_LB_TO_WORKER);
        nexus.register_req_func(REQ_STATE_UPDATE);
        let mut endpoint = RpcEndpoint::new(&nexus);

        log::info!(
            "worker {} up on {} (queue={:?}, compute={}, capacity={:.2})",
            self.config.worker_id,
            self.config.uri,
            self.config.queue,
            self.config.compute_threads,
            self.config.capacity_factor
        );

        let (completion_tx, completion_rx) = bounded::<Task>(COMPLETION_QUEUE_CAP);
        let mut compute_handles = Vec::with_capacity(self.config.compute_threads);
        for i in 0..self.config.compute_threads {
            let ctx = ComputeContext {
                queue: self.queue.clone(),
                completion: completion_tx.clone(),
                counters: self.counters.clone(),
                metrics: self.metrics.clone(),
                stop: stop.clone(),
                clock: self.clock,
                worker_id: self.config.worker_id,
                capacity_factor: self.config.capacity_factor,
                artificial_delay_ns: self.config.artificial_delay_ns,
            };
            let core = self
                .config
                .pin_cores
                .get(i % self.config.pin_cores.len().max(1))
                .copied();
            let handle = thread::Builder::new()
                .name(format!("compute-{}-{}", self.config.worker_id, i))
                .spawn(move || {
                    if let Some(core) = core {
                        set_thread_core(core);
                    }
                    compute_loop(ctx);
                })
                .expect("spawn compute thread");
            compute_handles.push(handle);
        }
        drop(completion_tx);

        while !stop.load(Ordering::Relaxed) {
            let events = endpoint.run_event_loop_once();
            let idle_events = events.is_empty();
            for event in events {
                match event {
                    RpcEvent::Request {
                        req_type: REQ_LB_TO_WORKER,
                        data,
                        handle,
                    } => self.on_request(data.as_slice(), handle),
                    RpcEvent::Request {
                        req_type: REQ_STATE_UPDATE,
                        handle,
                        ..
                    } => self.on_state_probe(&mut endpoint, &handle),
                    RpcEvent::Request { req_type, .. } => {
                        log::warn!("worker: unexpected request type {req_type}");
                    }
                    RpcEvent::Response { tag, .. } => {
                        log::debug!("worker: stray response tag {tag}");
                    }
                }
            }

            let drained = self.drain_completions(&mut endpoint, &completion_rx);
            if idle_events && drained == 0 {
                thread::yield_now();
            }
        }

        for handle in compute_handles {
            let _ = handle.join();
        }

        if let Some(dir) = &self.config.output_dir {
            self.metrics.export_all(dir)?;
        }
        log::info!(
            "worker {} stopped: received={} completed={}",
            self.config.worker_id,
            self.counters.received.load(Ordering::Relaxed),
            self.counters.completed.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Receive path: stamp, wrap, enqueue. No compute, no response here.
    fn on_request(&self, data: &[u8], handle: ReqHandle) {
        let Some(req) = WorkerRequest::decode(data) else {
            log::warn!("worker: malformed request, discarding");
            return;
        };
        let task = Task {
            id: req.id,
            deadline: req.deadline,
            arrival_ts: self.clock.now(),
            client_send_ts: req.client_send_ts,
            service_hint_us: req.service_hint_us,
            request_type: req.request_type,
            payload_size: req.payload_size,
            handle: Some(handle),
            done_ts: 0,
            actual_service_ns: 0,
            queue_wait_ns: 0,
        };
        self.queue.push(task);
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Answer a state probe with queue depth and the slack histogram.
    fn on_state_probe(&self, endpoint: &mut RpcEndpoint, handle: &ReqHandle) {
        let queue_len = self.queue.len();
        let update = StateUpdate {
            queue_len: queue_len.min(u16::MAX as usize) as u16,
            active_tasks: self
                .counters
                .active
                .load(Ordering::Relaxed)
                .min(u16::MAX as u64) as u16,
            completed: self.counters.completed.load(Ordering::Relaxed) as u32,
            load_ema: queue_len as f32,
            worker_id: self.config.worker_id,
            healthy: 1,
            slack_histogram: self.queue.slack_histogram(self.clock.now()),
        };
        let mut buf = alloc_msg_buffer(StateUpdate::SIZE);
        update.encode_into(buf.as_mut_slice());
        endpoint.enqueue_response(handle, &buf);
    }

    /// Send path: pull finished tasks off the completion queue and emit
    /// their responses, at most `completion_batch` per loop iteration.
    fn drain_completions(&self, endpoint: &mut RpcEndpoint, rx: &Receiver<Task>) -> usize {
        let mut drained = 0;
        while drained < self.config.completion_batch {
            let Ok(task) = rx.try_recv() else { break };
            drained += 1;
            let resp = WorkerResponse {
                id: task.id,
                worker_recv_ts: task.arrival_ts,
                worker_done_ts: task.done_ts,
                queue_time_ns: task.queue_wait_ns,
                service_time_us: (task.actual_service_ns / 1_000).min(u32::MAX as u64) as u32,
                queue_len: self.queue.len().min(u16::MAX as usize) as u16,
                worker_id: self.config.worker_id,
                success: 1,
            };
            let mut buf = alloc_msg_buffer(WorkerResponse::SIZE);
            resp.encode_into(buf.as_mut_slice());
            if let Some(handle) = &task.handle {
                endpoint.enqueue_response(handle, &buf);
            }
        }
        drained
    }
}

struct ComputeContext {
    queue: Arc<TaskQueue>,
    completion: Sender<Task>,
    counters: Arc<WorkerCounters>,
    metrics: Arc<MetricsCollector>,
    stop: Arc<AtomicBool>,
    clock: Clock,
    worker_id: u8,
    capacity_factor: f64,
    artificial_delay_ns: u64,
}

fn compute_loop(ctx: ComputeContext) {
    while !ctx.stop.load(Ordering::Relaxed) {
        let Some(mut task) = ctx.queue.try_pop(ctx.clock.now()) else {
            thread::sleep(Duration::from_micros(1));
            continue;
        };

        let start = ctx.clock.now();
        task.queue_wait_ns = start.saturating_sub(task.arrival_ts);

        task.actual_service_ns = simulate_service(
            task.request_type,
            task.service_hint_us,
            ctx.capacity_factor,
            &ctx.stop,
        );

        if ctx.artificial_delay_ns > 0 {
            let delay_end = now_ns() + ctx.artificial_delay_ns;
            while now_ns() < delay_end && !ctx.stop.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }

        task.done_ts = ctx.clock.now();

        // Local bookkeeping in the worker's own clock domain. The client
        // remains authoritative for the reported miss rate.
        let local_latency = task.done_ts.saturating_sub(task.arrival_ts);
        let met_locally = task.done_ts <= task.deadline;
        ctx.metrics.record_service(task.actual_service_ns);
        ctx.metrics
            .record_e2e(local_latency, ctx.worker_id, !met_locally);

        ctx.counters.active.fetch_sub(1, Ordering::Relaxed);
        ctx.counters.completed.fetch_add(1, Ordering::Relaxed);

        push_completion(&ctx, task);
    }
}

/// Bounded-queue push with back-off. A completion that cannot be handed
/// over after the retry budget is dropped; the LB sees a timeout and fails
/// the request back to the client.
fn push_completion(ctx: &ComputeContext, task: Task) {
    let mut task = task;
    for _ in 0..COMPLETION_PUSH_RETRIES {
        match ctx.completion.try_send(task) {
            Ok(()) => return,
            Err(TrySendError::Full(t)) => {
                task = t;
                thread::sleep(Duration::from_micros(1));
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
        if ctx.stop.load(Ordering::Relaxed) {
            return;
        }
    }
    log::warn!("completion queue full, dropping response for request {}", task.id);
    ctx.metrics.record_lost();
}
