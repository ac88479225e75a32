//! Load balancer: policy-driven dispatch and response correlation.
//!
//! The thread calling [`LoadBalancer::run`] owns the endpoint and handles
//! both directions: client requests are scheduled and forwarded, worker
//! responses are matched against the pending table and relayed back. A
//! background thread drives the state cadence (EMA decay, health sweeps)
//! but never touches the transport; it raises flags the I/O loop honours
//! on its next iteration.
//!
//! The worker-state table and the pending table have disjoint mutexes and
//! are never locked at the same time.

use crate::config::LbConfig;
use crate::error::Result;
use crate::metrics::{MetricsCollector, ThroughputCounter};
use crate::policy::{
    artefact, Policy, PolicyKind, PowerOfChoices, RequestMeta, RiskMin, VarianceMin, WorkerView,
};
use crate::rpc::{alloc_msg_buffer, Nexus, ReqHandle, RpcEndpoint, RpcEvent, SessionHandle};
use crate::time::{Clock, Timestamp};
use crate::wire::{
    ClientRequest, ClientResponse, StateUpdate, WorkerRequest, WorkerResponse, REQ_CLIENT_TO_LB,
    REQ_LB_TO_WORKER, REQ_STATE_UPDATE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Tags at or above this value carry state-probe responses; below it they
/// are pending-table keys (bounded by client_id << 32 | seq).
const STATE_TAG_BASE: u64 = 1 << 63;

/// Composite pending-table key. Distinct client ids make collisions
/// impossible within a run.
pub fn pending_key(client_id: u8, request_id: u64) -> u64 {
    ((client_id as u64) << 32) | (request_id & 0xffff_ffff)
}

struct PendingEntry {
    client_handle: ReqHandle,
    request_id: u64,
    client_send_ts: Timestamp,
    deadline: Timestamp,
    lb_recv_ts: Timestamp,
    target: usize,
}

/// Build the policy for a run, falling back to the heuristic variant when
/// the artefact cannot be loaded and the config allows it.
pub fn build_policy(config: &LbConfig) -> Result<Policy> {
    match config.policy {
        PolicyKind::PowerOfChoices => Ok(Policy::PowerOfChoices(PowerOfChoices::new(
            2,
            config.policy_seed,
        ))),
        PolicyKind::VarianceMin => {
            let model = match &config.model_path {
                Some(path) => match artefact::load_value_net(path) {
                    Ok(net) => Some(net),
                    Err(e) if config.require_model => return Err(e),
                    Err(e) => {
                        log::warn!("artefact load failed, using heuristic: {e}");
                        None
                    }
                },
                None => None,
            };
            Ok(Policy::VarianceMin(VarianceMin::new(model)))
        }
        PolicyKind::RiskMin => {
            let model = match &config.model_path {
                Some(path) => match artefact::load_quantile_net(path) {
                    Ok(net) => Some(net),
                    Err(e) if config.require_model => return Err(e),
                    Err(e) => {
                        log::warn!("artefact load failed, using heuristic: {e}");
                        None
                    }
                },
                None => None,
            };
            Ok(Policy::RiskMin(RiskMin::new(model)))
        }
    }
}

pub struct LoadBalancer {
    config: LbConfig,
    clock: Clock,
    state: Arc<Mutex<Vec<WorkerView>>>,
    pending: Arc<Mutex<HashMap<u64, PendingEntry>>>,
    dispatches: Arc<Vec<AtomicU64>>,
    metrics: Arc<MetricsCollector>,
    throughput: Arc<ThroughputCounter>,
}

impl LoadBalancer {
    pub fn new(config: LbConfig) -> LoadBalancer {
        let clock = Clock::new();
        let now = clock.now();
        let views = (0..config.worker_uris.len())
            .map(|i| WorkerView::new(i as u8, now))
            .collect();
        let dispatches = (0..config.worker_uris.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        LoadBalancer {
            config,
            clock,
            state: Arc::new(Mutex::new(views)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            dispatches: Arc::new(dispatches),
            metrics: Arc::new(MetricsCollector::new()),
            throughput: Arc::new(ThroughputCounter::new()),
        }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Relay throughput over the sliding window.
    pub fn current_rps(&self) -> f64 {
        self.throughput.rps()
    }

    /// Requests forwarded to each worker so far.
    pub fn dispatch_counts(&self) -> Vec<u64> {
        self.dispatches
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Mark one worker's capacity in the LB view (known from deployment
    /// inventory rather than discovered).
    pub fn set_capacity_factor(&self, worker: usize, capacity: f64) {
        let mut state = self.state.lock();
        if let Some(view) = state.get_mut(worker) {
            view.capacity_factor = capacity;
        }
    }

    pub fn run(&self, stop: Arc<AtomicBool>) -> Result<()> {
        let mut policy = build_policy(&self.config)?;

        let mut nexus = Nexus::new(&self.config.uri)?;
        nexus.register_req_func(REQ_CLIENT_TO_LB);
        let mut endpoint = RpcEndpoint::new(&nexus);

        let mut sessions: Vec<SessionHandle> = Vec::with_capacity(self.config.worker_uris.len());
        for uri in &self.config.worker_uris {
            sessions.push(endpoint.create_session(uri)?);
        }
        log::info!(
            "lb up on {} with {} workers, policy {}",
            self.config.uri,
            sessions.len(),
            policy.name()
        );

        let poll_flag = Arc::new(AtomicBool::new(false));
        let sweep_flag = Arc::new(AtomicBool::new(false));
        let state_thread = self.spawn_state_thread(stop.clone(), poll_flag.clone(), sweep_flag.clone());

        while !stop.load(Ordering::Relaxed) {
            let events = endpoint.run_event_loop_once();
            let idle = events.is_empty();
            for event in events {
                match event {
                    RpcEvent::Request {
                        req_type: REQ_CLIENT_TO_LB,
                        data,
                        handle,
                    } => self.on_client_request(
                        &mut endpoint,
                        &mut policy,
                        &sessions,
                        data.as_slice(),
                        handle,
                    ),
                    RpcEvent::Request { req_type, .. } => {
                        log::warn!("lb: unexpected request type {req_type}");
                    }
                    RpcEvent::Response { tag, data } if tag >= STATE_TAG_BASE => {
                        self.on_state_update((tag - STATE_TAG_BASE) as usize, data.as_slice());
                    }
                    RpcEvent::Response { tag, data } => {
                        self.on_worker_response(&mut endpoint, &mut policy, tag, data.as_slice());
                    }
                }
            }

            if poll_flag.swap(false, Ordering::Relaxed) {
                self.poll_worker_states(&mut endpoint, &sessions);
            }
            if sweep_flag.swap(false, Ordering::Relaxed) {
                self.sweep_pending(&mut endpoint);
            }
            if idle {
                thread::yield_now();
            }
        }

        let _ = state_thread.join();
        if let Some(dir) = &self.config.output_dir {
            self.metrics.export_all(dir)?;
        }
        log::info!("lb stopped: {} requests relayed", self.metrics.total_requests());
        Ok(())
    }

    fn spawn_state_thread(
        &self,
        stop: Arc<AtomicBool>,
        poll_flag: Arc<AtomicBool>,
        sweep_flag: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        let state = self.state.clone();
        let clock = self.clock;
        let interval = Duration::from_nanos(self.config.state_update_interval_ns);
        let unhealthy_timeout = self.config.unhealthy_timeout_ns;
        let poll_every = self.config.poll_every_ticks.max(1);
        thread::Builder::new()
            .name("lb-state".into())
            .spawn(move || {
                let mut tick: u64 = 0;
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    let now = clock.now();
                    {
                        let mut state = state.lock();
                        for view in state.iter_mut() {
                            view.tick(now, unhealthy_timeout);
                        }
                    }
                    tick += 1;
                    if tick % poll_every == 0 {
                        poll_flag.store(true, Ordering::Relaxed);
                        sweep_flag.store(true, Ordering::Relaxed);
                    }
                }
            })
            .expect("spawn state thread")
    }

    fn on_client_request(
        &self,
        endpoint: &mut RpcEndpoint,
        policy: &mut Policy,
        sessions: &[SessionHandle],
        data: &[u8],
        handle: ReqHandle,
    ) {
        let Some(req) = ClientRequest::decode(data) else {
            log::warn!("lb: malformed client request, discarding");
            return;
        };
        let lb_recv_ts = self.clock.now();

        // Early drop: a request that is already past its deadline gets a
        // failure response instead of worker work.
        if req.deadline <= lb_recv_ts {
            self.metrics.record_lost();
            self.synthesize_failure(endpoint, &handle, &req);
            return;
        }

        let meta = RequestMeta {
            request_type: req.request_type,
            payload_size: req.payload_size,
            service_hint_us: req.service_hint_us,
            deadline: req.deadline,
        };

        let decision = {
            let state = self.state.lock();
            policy.schedule(&meta, &state, lb_recv_ts)
        };
        let Some(decision) = decision else {
            log::warn!("lb: no healthy worker for request {}", req.id);
            self.metrics.record_lost();
            self.synthesize_failure(endpoint, &handle, &req);
            return;
        };

        self.metrics.record_decision(decision.decision_ns);
        self.dispatches[decision.target].fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state[decision.target].note_dispatch();
        }

        let key = pending_key(req.client_id, req.id);
        self.pending.lock().insert(
            key,
            PendingEntry {
                client_handle: handle.clone(),
                request_id: req.id,
                client_send_ts: req.client_send_ts,
                deadline: req.deadline,
                lb_recv_ts,
                target: decision.target,
            },
        );

        let payload = &data[ClientRequest::SIZE.min(data.len())..];
        let wreq = WorkerRequest {
            id: req.id,
            client_send_ts: req.client_send_ts,
            deadline: req.deadline,
            lb_forward_ts: lb_recv_ts,
            service_hint_us: req.service_hint_us,
            worker_id: decision.target as u8,
            request_type: req.request_type,
            payload_size: req.payload_size,
        };
        let mut buf = alloc_msg_buffer(WorkerRequest::SIZE + payload.len());
        wreq.encode_into(buf.as_mut_slice());
        buf.as_mut_slice()[WorkerRequest::SIZE..].copy_from_slice(payload);

        let send = endpoint.enqueue_request(
            sessions[decision.target],
            REQ_LB_TO_WORKER,
            &buf,
            alloc_msg_buffer(WorkerResponse::SIZE),
            key,
        );
        if send.is_err() {
            log::warn!("lb: worker {} unreachable, failing request", decision.target);
            self.pending.lock().remove(&key);
            {
                let mut state = self.state.lock();
                state[decision.target].healthy = false;
                state[decision.target].queue_len =
                    state[decision.target].queue_len.saturating_sub(1);
            }
            self.metrics.record_lost();
            self.synthesize_failure(endpoint, &handle, &req);
        }
    }

    fn on_worker_response(
        &self,
        endpoint: &mut RpcEndpoint,
        policy: &mut Policy,
        tag: u64,
        data: &[u8],
    ) {
        let Some(resp) = WorkerResponse::decode(data) else {
            log::warn!("lb: malformed worker response, discarding");
            return;
        };
        let Some(entry) = self.pending.lock().remove(&tag) else {
            log::warn!("lb: response for unknown request {}, discarding", resp.id);
            return;
        };

        let complete_ts = self.clock.now();
        let e2e = complete_ts.saturating_sub(entry.client_send_ts);
        let advisory_met = complete_ts <= entry.deadline;

        self.metrics
            .record_e2e(e2e, entry.target as u8, !advisory_met);
        self.throughput.record(complete_ts);

        {
            let mut state = self.state.lock();
            let view = &mut state[entry.target];
            view.note_response(resp.service_time_us as u64 * 1_000, complete_ts);
            view.p99_latency_ns = self.metrics.worker(entry.target as u8).percentile(99.0);
            let missed = if advisory_met { 0.0 } else { 1.0 };
            view.miss_rate = 0.99 * view.miss_rate + 0.01 * missed;
        }
        policy.on_response(entry.target as u8, e2e, advisory_met);

        let cresp = ClientResponse {
            id: resp.id,
            client_send_ts: entry.client_send_ts,
            e2e_latency_ns: e2e,
            service_time_us: resp.service_time_us,
            worker_id: resp.worker_id,
            deadline_met_advisory: advisory_met as u8,
            success: resp.success,
        };
        let mut buf = alloc_msg_buffer(ClientResponse::SIZE);
        cresp.encode_into(buf.as_mut_slice());
        endpoint.enqueue_response(&entry.client_handle, &buf);
    }

    fn on_state_update(&self, worker: usize, data: &[u8]) {
        let Some(update) = StateUpdate::decode(data) else {
            log::debug!("lb: malformed state update from worker {worker}");
            return;
        };
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(view) = state.get_mut(worker) {
            view.apply_state_update(&update, now);
        }
    }

    fn poll_worker_states(&self, endpoint: &mut RpcEndpoint, sessions: &[SessionHandle]) {
        for (i, session) in sessions.iter().enumerate() {
            let probe = alloc_msg_buffer(1);
            let resp = alloc_msg_buffer(StateUpdate::SIZE);
            if endpoint
                .enqueue_request(*session, REQ_STATE_UPDATE, &probe, resp, STATE_TAG_BASE + i as u64)
                .is_err()
            {
                let mut state = self.state.lock();
                state[i].healthy = false;
            }
        }
    }

    /// Fail pending entries whose worker never answered back to their
    /// clients.
    fn sweep_pending(&self, endpoint: &mut RpcEndpoint) {
        let now = self.clock.now();
        let timeout = self.config.pending_timeout_ns;
        let expired: Vec<(u64, PendingEntry)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<u64> = pending
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.lb_recv_ts) > timeout)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|e| (k, e)))
                .collect()
        };
        for (_, entry) in expired {
            log::warn!("lb: request to worker {} timed out", entry.target);
            {
                let mut state = self.state.lock();
                let view = &mut state[entry.target];
                view.queue_len = view.queue_len.saturating_sub(1);
            }
            self.metrics.record_lost();
            let cresp = ClientResponse {
                id: entry.request_id,
                client_send_ts: entry.client_send_ts,
                e2e_latency_ns: now.saturating_sub(entry.client_send_ts),
                service_time_us: 0,
                worker_id: entry.target as u8,
                deadline_met_advisory: 0,
                success: 0,
            };
            let mut buf = alloc_msg_buffer(ClientResponse::SIZE);
            cresp.encode_into(buf.as_mut_slice());
            endpoint.enqueue_response(&entry.client_handle, &buf);
        }
    }

    fn synthesize_failure(&self, endpoint: &mut RpcEndpoint, handle: &ReqHandle, req: &ClientRequest) {
        let cresp = ClientResponse {
            id: req.id,
            client_send_ts: req.client_send_ts,
            e2e_latency_ns: 0,
            service_time_us: 0,
            worker_id: u8::MAX,
            deadline_met_advisory: 0,
            success: 0,
        };
        let mut buf = alloc_msg_buffer(ClientResponse::SIZE);
        cresp.encode_into(buf.as_mut_slice());
        endpoint.enqueue_response(handle, &buf);
    }
}
