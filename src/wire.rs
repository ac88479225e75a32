//! Fixed-layout wire messages exchanged between the three tiers.
//!
//! Every header is packed little-endian with no implicit padding, so the
//! encoded size is the sum of the field widths and a header round-trips
//! bit-exactly through any hop. Deadlines travel in these headers for
//! advisory use only; the client re-judges each response against its own
//! slot table.

use crate::time::Timestamp;

/// Request-type dispatch IDs registered on the transport.
pub const REQ_CLIENT_TO_LB: u8 = 1;
pub const REQ_LB_TO_WORKER: u8 = 2;
pub const REQ_STATE_UPDATE: u8 = 3;

/// Number of slack-histogram bins carried in state updates.
pub const SLACK_BINS: usize = 32;

/// Width of one slack bin in nanoseconds (100 us).
pub const SLACK_BIN_WIDTH_NS: u64 = 100_000;

/// Service class of a request, encoded as a single byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Get = 0,
    Put = 1,
    Scan = 2,
    Compute = 3,
}

impl RequestType {
    pub fn from_u8(v: u8) -> RequestType {
        match v {
            1 => RequestType::Put,
            2 => RequestType::Scan,
            3 => RequestType::Compute,
            _ => RequestType::Get,
        }
    }

    /// Service-time multiplier applied by the worker simulator.
    pub fn multiplier(self) -> f64 {
        match self {
            RequestType::Get => 1.0,
            RequestType::Put => 1.2,
            RequestType::Scan => 2.0,
            RequestType::Compute => 1.5,
        }
    }
}

macro_rules! read_le {
    ($buf:expr, $off:expr, u64) => {
        u64::from_le_bytes($buf[$off..$off + 8].try_into().unwrap())
    };
    ($buf:expr, $off:expr, u32) => {
        u32::from_le_bytes($buf[$off..$off + 4].try_into().unwrap())
    };
    ($buf:expr, $off:expr, u16) => {
        u16::from_le_bytes($buf[$off..$off + 2].try_into().unwrap())
    };
    ($buf:expr, $off:expr, i16) => {
        i16::from_le_bytes($buf[$off..$off + 2].try_into().unwrap())
    };
    ($buf:expr, $off:expr, f32) => {
        f32::from_le_bytes($buf[$off..$off + 4].try_into().unwrap())
    };
}

/// Client -> LB request header. Payload bytes follow the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub id: u64,
    pub client_send_ts: Timestamp,
    pub deadline: Timestamp,
    pub service_hint_us: u32,
    pub client_id: u8,
    pub request_type: RequestType,
    pub payload_size: u16,
}

impl ClientRequest {
    pub const SIZE: usize = 32;

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.client_send_ts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.deadline.to_le_bytes());
        buf[24..28].copy_from_slice(&self.service_hint_us.to_le_bytes());
        buf[28] = self.client_id;
        buf[29] = self.request_type as u8;
        buf[30..32].copy_from_slice(&self.payload_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<ClientRequest> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(ClientRequest {
            id: read_le!(buf, 0, u64),
            client_send_ts: read_le!(buf, 8, u64),
            deadline: read_le!(buf, 16, u64),
            service_hint_us: read_le!(buf, 24, u32),
            client_id: buf[28],
            request_type: RequestType::from_u8(buf[29]),
            payload_size: read_le!(buf, 30, u16),
        })
    }
}

/// LB -> Worker request header. Payload bytes follow the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub id: u64,
    pub client_send_ts: Timestamp,
    pub deadline: Timestamp,
    pub lb_forward_ts: Timestamp,
    pub service_hint_us: u32,
    pub worker_id: u8,
    pub request_type: RequestType,
    pub payload_size: u16,
}

impl WorkerRequest {
    pub const SIZE: usize = 40;

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.client_send_ts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.deadline.to_le_bytes());
        buf[24..32].copy_from_slice(&self.lb_forward_ts.to_le_bytes());
        buf[32..36].copy_from_slice(&self.service_hint_us.to_le_bytes());
        buf[36] = self.worker_id;
        buf[37] = self.request_type as u8;
        buf[38..40].copy_from_slice(&self.payload_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<WorkerRequest> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(WorkerRequest {
            id: read_le!(buf, 0, u64),
            client_send_ts: read_le!(buf, 8, u64),
            deadline: read_le!(buf, 16, u64),
            lb_forward_ts: read_le!(buf, 24, u64),
            service_hint_us: read_le!(buf, 32, u32),
            worker_id: buf[36],
            request_type: RequestType::from_u8(buf[37]),
            payload_size: read_le!(buf, 38, u16),
        })
    }
}

/// Worker -> LB response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponse {
    pub id: u64,
    pub worker_recv_ts: Timestamp,
    pub worker_done_ts: Timestamp,
    pub queue_time_ns: u64,
    pub service_time_us: u32,
    pub queue_len: u16,
    pub worker_id: u8,
    pub success: u8,
}

impl WorkerResponse {
    pub const SIZE: usize = 40;

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.worker_recv_ts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.worker_done_ts.to_le_bytes());
        buf[24..32].copy_from_slice(&self.queue_time_ns.to_le_bytes());
        buf[32..36].copy_from_slice(&self.service_time_us.to_le_bytes());
        buf[36..38].copy_from_slice(&self.queue_len.to_le_bytes());
        buf[38] = self.worker_id;
        buf[39] = self.success;
    }

    pub fn decode(buf: &[u8]) -> Option<WorkerResponse> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(WorkerResponse {
            id: read_le!(buf, 0, u64),
            worker_recv_ts: read_le!(buf, 8, u64),
            worker_done_ts: read_le!(buf, 16, u64),
            queue_time_ns: read_le!(buf, 24, u64),
            service_time_us: read_le!(buf, 32, u32),
            queue_len: read_le!(buf, 36, u16),
            worker_id: buf[38],
            success: buf[39],
        })
    }
}

/// LB -> Client response header.
///
/// `deadline_met_advisory` is populated from the LB's clock and exists for
/// diagnostics only; clients ignore it and re-judge against the slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub id: u64,
    pub client_send_ts: Timestamp,
    pub e2e_latency_ns: u64,
    pub service_time_us: u32,
    pub worker_id: u8,
    pub deadline_met_advisory: u8,
    pub success: u8,
}

impl ClientResponse {
    pub const SIZE: usize = 32;

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.client_send_ts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.e2e_latency_ns.to_le_bytes());
        buf[24..28].copy_from_slice(&self.service_time_us.to_le_bytes());
        buf[28] = self.worker_id;
        buf[29] = self.deadline_met_advisory;
        buf[30] = self.success;
        buf[31] = 0;
    }

    pub fn decode(buf: &[u8]) -> Option<ClientResponse> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(ClientResponse {
            id: read_le!(buf, 0, u64),
            client_send_ts: read_le!(buf, 8, u64),
            e2e_latency_ns: read_le!(buf, 16, u64),
            service_time_us: read_le!(buf, 24, u32),
            worker_id: buf[28],
            deadline_met_advisory: buf[29],
            success: buf[30],
        })
    }
}

/// Worker state snapshot returned for a `REQ_STATE_UPDATE` probe.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub queue_len: u16,
    pub active_tasks: u16,
    pub completed: u32,
    pub load_ema: f32,
    pub worker_id: u8,
    pub healthy: u8,
    pub slack_histogram: [u32; SLACK_BINS],
}

impl StateUpdate {
    pub const SIZE: usize = 16 + SLACK_BINS * 4;

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.queue_len.to_le_bytes());
        buf[2..4].copy_from_slice(&self.active_tasks.to_le_bytes());
        buf[4..8].copy_from_slice(&self.completed.to_le_bytes());
        buf[8..12].copy_from_slice(&self.load_ema.to_le_bytes());
        buf[12] = self.worker_id;
        buf[13] = self.healthy;
        buf[14..16].copy_from_slice(&[0, 0]);
        for (i, v) in self.slack_histogram.iter().enumerate() {
            let off = 16 + i * 4;
            buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn decode(buf: &[u8]) -> Option<StateUpdate> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut slack_histogram = [0u32; SLACK_BINS];
        for (i, v) in slack_histogram.iter_mut().enumerate() {
            let off = 16 + i * 4;
            *v = read_le!(buf, off, u32);
        }
        Some(StateUpdate {
            queue_len: read_le!(buf, 0, u16),
            active_tasks: read_le!(buf, 2, u16),
            completed: read_le!(buf, 4, u32),
            load_ema: read_le!(buf, 8, f32),
            worker_id: buf[12],
            healthy: buf[13],
            slack_histogram,
        })
    }
}

/// Optional 16-byte heartbeat. Semantics are defined only when a deployment
/// chooses to emit it; nothing in the core depends on receiving one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub node_id: u8,
    pub flags: u8,
    pub load_factor_x1000: u16,
    pub slack_p10: i16,
    pub slack_p50: i16,
    pub queue_len: u32,
    pub reserved: u32,
}

impl Heartbeat {
    pub const SIZE: usize = 16;

    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.node_id;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.load_factor_x1000.to_le_bytes());
        buf[4..6].copy_from_slice(&self.slack_p10.to_le_bytes());
        buf[6..8].copy_from_slice(&self.slack_p50.to_le_bytes());
        buf[8..12].copy_from_slice(&self.queue_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Heartbeat> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Heartbeat {
            node_id: buf[0],
            flags: buf[1],
            load_factor_x1000: read_le!(buf, 2, u16),
            slack_p10: read_le!(buf, 4, i16),
            slack_p50: read_le!(buf, 6, i16),
            queue_len: read_le!(buf, 8, u32),
            reserved: read_le!(buf, 12, u32),
        })
    }
}
