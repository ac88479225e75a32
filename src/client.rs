//! Client generator: paced request stream and authoritative deadline
//! judgement.
//!
//! Each in-flight request occupies one slot in a pre-allocated pool. The
//! slot index rides the transport as the correlation tag, and the slot
//! stores the deadline at send time, so judgement on response needs
//! nothing but this process's clock: `hit = recv_ts <= slot.deadline`.
//! Whatever deadline bytes came back over the wire are ignored.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::metrics::{MetricsCollector, ThroughputCounter};
use crate::rpc::{alloc_msg_buffer, MsgBuffer, Nexus, RpcEndpoint, RpcEvent};
use crate::time::{ns_to_us, Clock, Timestamp};
use crate::wire::{ClientRequest, ClientResponse, REQ_CLIENT_TO_LB};
use crate::workload::RequestGenerator;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const PROGRESS_INTERVAL_NS: u64 = 5_000_000_000;
const MAX_PAYLOAD: usize = 320;

#[derive(Debug, Clone, Copy)]
struct Slot {
    deadline: Timestamp,
    send_ts: Timestamp,
    in_use: bool,
}

/// End-of-run numbers, all judged in the client's clock domain.
#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub sent: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub measured_requests: u64,
    pub deadline_misses: u64,
    pub miss_rate: f64,
    pub actual_rps: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
}

pub struct Client {
    config: ClientConfig,
    clock: Clock,
    metrics: Arc<MetricsCollector>,
    throughput: Arc<ThroughputCounter>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            config,
            clock: Clock::new(),
            metrics: Arc::new(MetricsCollector::new()),
            throughput: Arc::new(ThroughputCounter::new()),
        }
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Run the paced send/receive loop until the experiment window closes
    /// or `stop` is raised. The calling thread owns the endpoint for the
    /// whole run.
    pub fn run(&self, stop: Arc<AtomicBool>) -> Result<ClientReport> {
        let nexus = Nexus::new(&self.config.uri)?;
        let mut endpoint = RpcEndpoint::new(&nexus);
        let session = endpoint.create_session(&self.config.lb_uri)?;
        log::info!(
            "client {} connected to {} (target {} rps, {} slots)",
            self.config.client_id,
            self.config.lb_uri,
            self.config.target_rps,
            self.config.max_inflight
        );

        let mut gen =
            RequestGenerator::new(self.config.workload.clone(), self.config.effective_seed());

        let pool = self.config.max_inflight;
        let mut slots = vec![
            Slot {
                deadline: 0,
                send_ts: 0,
                in_use: false,
            };
            pool
        ];
        let mut free: Vec<usize> = (0..pool).rev().collect();
        let mut req_bufs: Vec<MsgBuffer> = (0..pool)
            .map(|_| alloc_msg_buffer(ClientRequest::SIZE + MAX_PAYLOAD))
            .collect();

        let interval_ns: u64 = if self.config.target_rps > 0 {
            1_000_000_000 / self.config.target_rps
        } else {
            1_000_000
        };

        let start = self.clock.now();
        let warmup_end = start + self.config.warmup_sec * 1_000_000_000;
        let end = warmup_end + self.config.duration_sec * 1_000_000_000;
        let grace_end = end + self.config.grace_sec * 1_000_000_000;

        let mut in_warmup = self.config.warmup_sec > 0;
        let mut next_send = start;
        let mut next_id: u64 = 0;
        let mut sent: u64 = 0;
        let mut completed: u64 = 0;
        let mut last_report = start;

        while !stop.load(Ordering::Relaxed) {
            let now = self.clock.now();
            if now >= end {
                break;
            }

            if in_warmup && now >= warmup_end {
                in_warmup = false;
                self.metrics.reset();
                log::info!("client {}: warmup complete", self.config.client_id);
            }

            for event in endpoint.run_event_loop_once() {
                if let RpcEvent::Response { tag, data } = event {
                    if self.on_response(&mut slots, &mut free, tag, data.as_slice(), in_warmup) {
                        completed += 1;
                    }
                }
            }

            if now.saturating_sub(last_report) >= PROGRESS_INTERVAL_NS {
                log::info!(
                    "client {}: sent={} completed={} inflight={} rps={:.0} p99={:.1}us",
                    self.config.client_id,
                    sent,
                    completed,
                    sent - completed,
                    self.throughput.rps(),
                    ns_to_us(self.metrics.e2e().percentile(99.0)),
                );
                last_report = now;
            }

            // Paced send. All slots busy means we simply don't send; the
            // slot pool, not the policy, bounds in-flight.
            if now >= next_send {
                let Some(slot_idx) = free.pop() else {
                    continue;
                };
                let draw = gen.generate();
                let send_ts = self.clock.now();
                let deadline = gen.deadline_for(send_ts, &draw);

                slots[slot_idx] = Slot {
                    deadline,
                    send_ts,
                    in_use: true,
                };

                let req = ClientRequest {
                    id: next_id,
                    client_send_ts: send_ts,
                    deadline,
                    service_hint_us: draw.service_hint_us,
                    client_id: self.config.client_id,
                    request_type: draw.request_type,
                    payload_size: draw.payload_size,
                };
                let buf = &mut req_bufs[slot_idx];
                buf.resize(ClientRequest::SIZE + draw.payload_size as usize);
                req.encode_into(buf.as_mut_slice());

                let sent_ok = endpoint
                    .enqueue_request(
                        session,
                        REQ_CLIENT_TO_LB,
                        buf,
                        alloc_msg_buffer(ClientResponse::SIZE),
                        slot_idx as u64,
                    )
                    .is_ok();
                if sent_ok {
                    sent += 1;
                    next_id += 1;
                    next_send += interval_ns;
                    // Catch up without backfilling missed intervals.
                    if next_send < send_ts {
                        next_send = send_ts;
                    }
                } else {
                    slots[slot_idx].in_use = false;
                    free.push(slot_idx);
                    log::warn!("client {}: send failed, lb gone?", self.config.client_id);
                }
            } else {
                thread::yield_now();
            }
        }

        // Grace window: stragglers may still land and free their slots.
        while !stop.load(Ordering::Relaxed)
            && self.clock.now() < grace_end
            && free.len() < pool
        {
            for event in endpoint.run_event_loop_once() {
                if let RpcEvent::Response { tag, data } = event {
                    if self.on_response(&mut slots, &mut free, tag, data.as_slice(), in_warmup) {
                        completed += 1;
                    }
                }
            }
            thread::yield_now();
        }

        // Whatever is still occupied timed out: release and count as a miss.
        let mut timed_out = 0;
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.in_use {
                slot.in_use = false;
                free.push(idx);
                timed_out += 1;
                self.metrics.record_lost();
            }
        }

        let measured_ns = self
            .clock
            .now()
            .min(end)
            .saturating_sub(warmup_end)
            .max(1);
        let report = ClientReport {
            sent,
            completed,
            timed_out,
            measured_requests: self.metrics.total_requests(),
            deadline_misses: self.metrics.deadline_misses(),
            miss_rate: self.metrics.miss_rate(),
            actual_rps: self.metrics.total_requests() as f64 * 1e9 / measured_ns as f64,
            p50_us: ns_to_us(self.metrics.e2e().percentile(50.0)),
            p99_us: ns_to_us(self.metrics.e2e().percentile(99.0)),
            p999_us: ns_to_us(self.metrics.e2e().percentile(99.9)),
        };

        if let Some(dir) = &self.config.output_dir {
            self.metrics.export_all(dir)?;
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            std::fs::write(dir.join("client_report.json"), json).map_err(crate::error::Error::Io)?;
        }

        log::info!(
            "client {} done: sent={} completed={} timed_out={} miss_rate={:.4}% p99={:.1}us",
            self.config.client_id,
            report.sent,
            report.completed,
            report.timed_out,
            report.miss_rate * 100.0,
            report.p99_us,
        );
        Ok(report)
    }

    /// Judge one response against the slot table. Returns whether a slot
    /// was freed (i.e. this was a live, known tag).
    fn on_response(
        &self,
        slots: &mut [Slot],
        free: &mut Vec<usize>,
        tag: u64,
        data: &[u8],
        in_warmup: bool,
    ) -> bool {
        let recv_ts = self.clock.now();
        let idx = tag as usize;
        if idx >= slots.len() || !slots[idx].in_use {
            log::warn!("client {}: response with unknown tag {tag}", self.config.client_id);
            return false;
        }
        let Some(resp) = ClientResponse::decode(data) else {
            log::warn!("client {}: malformed response", self.config.client_id);
            return false;
        };

        // The one judgement that counts: local clock vs the deadline this
        // slot recorded at send time. resp.deadline_met_advisory is
        // deliberately unused.
        let slot = slots[idx];
        let hit = recv_ts <= slot.deadline;
        if !in_warmup {
            let e2e = recv_ts.saturating_sub(slot.send_ts);
            self.metrics.record_e2e(e2e, resp.worker_id, !hit);
            self.throughput.record(recv_ts);
        }

        slots[idx].in_use = false;
        free.push(idx);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_is_ignored() {
        let client = Client::new(ClientConfig::new(0, "test://c-unk", "test://lb-unk"));
        let mut slots = vec![
            Slot {
                deadline: 0,
                send_ts: 0,
                in_use: false,
            };
            4
        ];
        let mut free = vec![3, 2, 1, 0];
        let buf = [0u8; ClientResponse::SIZE];
        assert!(!client.on_response(&mut slots, &mut free, 99, &buf, false));
        assert!(!client.on_response(&mut slots, &mut free, 1, &buf, false));
        assert_eq!(client.metrics.total_requests(), 0);
    }

    #[test]
    fn response_judged_against_slot_not_wire() {
        let client = Client::new(ClientConfig::new(0, "test://c-slot", "test://lb-slot"));
        let now = client.clock.now();
        let mut slots = vec![
            Slot {
                deadline: now + 1_000_000_000,
                send_ts: now,
                in_use: true,
            },
            // Slot whose deadline has long passed.
            Slot {
                deadline: 1,
                send_ts: 1,
                in_use: true,
            },
        ];
        let mut free = Vec::new();

        // Wire advisory claims a miss; the slot says hit.
        let resp = ClientResponse {
            id: 0,
            client_send_ts: now,
            e2e_latency_ns: 1,
            service_time_us: 1,
            worker_id: 0,
            deadline_met_advisory: 0,
            success: 1,
        };
        let mut buf = [0u8; ClientResponse::SIZE];
        resp.encode_into(&mut buf);
        assert!(client.on_response(&mut slots, &mut free, 0, &buf, false));
        assert_eq!(client.metrics.deadline_misses(), 0);

        // Wire advisory claims a hit; the slot says miss.
        let resp = ClientResponse {
            deadline_met_advisory: 1,
            ..resp
        };
        let mut buf = [0u8; ClientResponse::SIZE];
        resp.encode_into(&mut buf);
        assert!(client.on_response(&mut slots, &mut free, 1, &buf, false));
        assert_eq!(client.metrics.deadline_misses(), 1);
        assert_eq!(free.len(), 2);
    }

    #[test]
    fn warmup_responses_free_slots_without_recording() {
        let client = Client::new(ClientConfig::new(0, "test://c-warm", "test://lb-warm"));
        let now = client.clock.now();
        let mut slots = vec![Slot {
            deadline: now + 1_000_000,
            send_ts: now,
            in_use: true,
        }];
        let mut free = Vec::new();
        let resp = ClientResponse {
            id: 0,
            client_send_ts: now,
            e2e_latency_ns: 1,
            service_time_us: 1,
            worker_id: 0,
            deadline_met_advisory: 1,
            success: 1,
        };
        let mut buf = [0u8; ClientResponse::SIZE];
        resp.encode_into(&mut buf);
        assert!(client.on_response(&mut slots, &mut free, 0, &buf, true));
        assert_eq!(client.metrics.total_requests(), 0);
        assert_eq!(free.len(), 1);
    }
}
