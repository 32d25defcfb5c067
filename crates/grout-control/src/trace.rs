//! Per-packet trace collection.
//!
//! Datapath workers attach a chain of trace items to each packet as it
//! walks the graph, then publish the finished chain on a bounded ring that
//! the control plane drains on request.
//!
//! # Thread safety
//!
//! - **Producers (datapath workers):** allocate items from a lock-free
//!   pool and enqueue finished chains. Never block: when the pool or the
//!   ring is exhausted they recycle the *oldest* published chain and
//!   retry, so producer latency stays bounded.
//! - **Consumer (reactor):** the dump path is the only reader. The ring
//!   preserves insertion order per producer; no global order is promised
//!   across producers.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crossbeam_queue::ArrayQueue;

use grout_core::errno::Result;

use grout_api::infra::{ApiTraceDumpReq, ApiTraceSetReq, TRACE_CLEAR, TRACE_DUMP, TRACE_SET};
use grout_api::wire::from_bytes;

use crate::api::{register_api_handler, ApiHandler, ApiResult};
use crate::module::{register_module, Module};
use crate::Control;

/// Payload bytes captured per graph node.
pub const TRACE_ITEM_MAX_LEN: usize = 120;

/// Ring capacity: how many traced packets are retained.
pub const TRACE_BURST: usize = 256;

// Builtin datapath node ids.
pub const NODE_PORT_RX: u16 = 0x0001;
pub const NODE_PORT_TX: u16 = 0x0002;

pub struct TraceItem {
    pub node_id: u16,
    /// Datapath worker that traced the packet; head item only.
    pub cpu_id: u16,
    pub len: u16,
    /// `CLOCK_REALTIME_COARSE` at chain head creation.
    pub ts: libc::timespec,
    pub data: [u8; TRACE_ITEM_MAX_LEN],
    next: Option<Box<TraceItem>>,
}

impl TraceItem {
    fn zeroed() -> Box<Self> {
        Box::new(Self {
            node_id: 0,
            cpu_id: 0,
            len: 0,
            ts: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            data: [0; TRACE_ITEM_MAX_LEN],
            next: None,
        })
    }
}

/// The chain under construction for one packet, owned by its producer
/// until `finish` hands it to the ring.
#[derive(Default)]
pub struct PacketTrace {
    head: Option<Box<TraceItem>>,
}

impl PacketTrace {
    pub fn new() -> Self {
        Self { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

fn coarse_now() -> libc::timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Safety: ts is a valid out-pointer; COARSE never fails on Linux.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME_COARSE, &mut ts) };
    ts
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn current_cpu() -> u16 {
            // Safety: no preconditions; -1 means unsupported kernel.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu < 0 { 0 } else { cpu as u16 }
        }
    } else {
        fn current_cpu() -> u16 {
            0
        }
    }
}

/// Fixed pool of trace items plus a bounded ring of finished chains.
///
/// The pool is sized so the ring can never starve it for long: oldest
/// published chains are recycled whenever either structure runs out.
pub struct TraceRing {
    pool: ArrayQueue<Box<TraceItem>>,
    ring: ArrayQueue<Box<TraceItem>>,
}

impl TraceRing {
    pub fn new(burst: usize) -> Self {
        let pool_size = (burst as u32 * 128).next_power_of_two() as usize - 1;
        let pool = ArrayQueue::new(pool_size);
        for _ in 0..pool_size {
            // pre-populated free list, all allocation happens here
            let _ = pool.push(TraceItem::zeroed());
        }
        Self { pool, ring: ArrayQueue::new(burst) }
    }

    /// Take a free item, recycling the oldest published chain when the
    /// pool is dry.
    fn alloc(&self) -> Box<TraceItem> {
        loop {
            if let Some(item) = self.pool.pop() {
                return item;
            }
            match self.ring.pop() {
                Some(oldest) => self.free_chain(oldest),
                // every item is in an unfinished chain of another worker
                None => std::hint::spin_loop(),
            }
        }
    }

    fn free_chain(&self, head: Box<TraceItem>) {
        let mut next = Some(head);
        while let Some(mut item) = next {
            next = item.next.take();
            // cannot overflow: pool capacity equals the total item count
            let _ = self.pool.push(item);
        }
    }

    /// Append one node record to a packet's chain. The first record stamps
    /// the chain with the timestamp and producer cpu.
    pub fn add(&self, pt: &mut PacketTrace, node_id: u16, data: &[u8]) {
        assert!(data.len() <= TRACE_ITEM_MAX_LEN);

        let mut item = self.alloc();
        item.node_id = node_id;
        item.len = data.len() as u16;
        item.data[..data.len()].copy_from_slice(data);
        item.next = None;

        if pt.head.is_none() {
            item.ts = coarse_now();
            item.cpu_id = current_cpu();
        }

        let mut cursor = &mut pt.head;
        while let Some(node) = cursor {
            cursor = &mut node.next;
        }
        *cursor = Some(item);
    }

    /// Publish a finished chain, dropping the oldest published packet if
    /// the ring is full. Resets the chain so the packet context can be
    /// reused with tracing disabled.
    pub fn finish(&self, pt: &mut PacketTrace) {
        let Some(mut head) = pt.head.take() else {
            return;
        };
        loop {
            match self.ring.push(head) {
                Ok(()) => return,
                Err(rejected) => {
                    head = rejected;
                    if let Some(oldest) = self.ring.pop() {
                        self.free_chain(oldest);
                    }
                }
            }
        }
    }

    /// Format and free the oldest published chain. Single consumer only.
    /// Returns false when the ring is empty.
    pub fn dump(&self, nodes: &NodeRegistry, out: &mut String) -> bool {
        let Some(head) = self.ring.pop() else {
            return false;
        };

        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        // Safety: valid in/out pointers.
        unsafe { libc::gmtime_r(&head.ts.tv_sec, &mut tm) };
        let _ = writeln!(
            out,
            "--------- {:02}:{:02}:{:02}.{:09} cpu {} ---------",
            tm.tm_hour, tm.tm_min, tm.tm_sec, head.ts.tv_nsec, head.cpu_id
        );

        let mut cur = Some(&*head);
        while let Some(item) = cur {
            let data = &item.data[..item.len as usize];
            let format = match nodes.get(item.node_id) {
                Some(node) => {
                    out.push_str(node.name);
                    out.push(':');
                    node.format
                }
                None => {
                    let _ = write!(out, "node-{}:", item.node_id);
                    None
                }
            };
            match format {
                Some(format) => {
                    out.push(' ');
                    format(out, data);
                }
                None => {
                    for byte in data {
                        let _ = write!(out, " {:02x}", byte);
                    }
                }
            }
            out.push('\n');
            cur = item.next.as_deref();
        }
        // empty line to separate packets
        out.push('\n');

        self.free_chain(head);
        true
    }

    /// Drop every published chain.
    pub fn clear(&self) {
        while let Some(chain) = self.ring.pop() {
            self.free_chain(chain);
        }
    }

    /// Published packets currently retained.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Trace formatter for one graph node's captured bytes.
pub type TraceFormatter = fn(&mut String, &[u8]);

pub struct NodeInfo {
    pub id: u16,
    pub name: &'static str,
    pub format: Option<TraceFormatter>,
}

/// Datapath graph nodes known to the dump formatter. Nodes register at
/// datapath init; unknown ids fall back to a numeric tag.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeInfo>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn get(&self, id: u16) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

pub fn register_node(ctl: &mut Control, id: u16, name: &'static str, format: Option<TraceFormatter>) {
    if ctl.nodes.get(id).is_some() {
        panic!("duplicate trace node 0x{:04x} '{}'", id, name);
    }
    ctl.nodes.nodes.push(NodeInfo { id, name, format });
}

static TRACE: OnceLock<TraceRing> = OnceLock::new();
static PACKET_TRACE_ENABLED: AtomicBool = AtomicBool::new(false);

/// The process-wide trace ring shared with the datapath workers.
pub fn trace_ring() -> &'static TraceRing {
    TRACE.get_or_init(|| TraceRing::new(TRACE_BURST))
}

pub fn trace_enabled() -> bool {
    PACKET_TRACE_ENABLED.load(Ordering::Relaxed)
}

pub fn set_trace_enabled(enabled: bool) {
    PACKET_TRACE_ENABLED.store(enabled, Ordering::Relaxed);
}

fn trace_init(ctl: &mut Control) -> Result<()> {
    set_trace_enabled(ctl.cfg.trace_packets);
    trace_ring().clear();
    Ok(())
}

fn trace_fini(_ctl: &mut Control) {
    trace_ring().clear();
}

fn trace_set(_ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiTraceSetReq = from_bytes(payload)?;
    set_trace_enabled(req.enabled != 0);
    Ok(Vec::new())
}

fn trace_dump(ctl: &mut Control, payload: &[u8]) -> ApiResult {
    let req: ApiTraceDumpReq = from_bytes(payload)?;
    let max_packets = if req.max_packets == 0 { 64 } else { req.max_packets };
    let mut text = String::new();
    for _ in 0..max_packets {
        if !trace_ring().dump(&ctl.nodes, &mut text) {
            break;
        }
    }
    Ok(text.into_bytes())
}

fn trace_clear(_ctl: &mut Control, _payload: &[u8]) -> ApiResult {
    trace_ring().clear();
    Ok(Vec::new())
}

pub fn register(ctl: &mut Control) {
    register_module(
        ctl,
        Module {
            init: Some(trace_init),
            fini: Some(trace_fini),
            init_prio: 4000,
            fini_prio: 6000,
            ..Module::empty("trace")
        },
    );
    register_api_handler(
        ctl,
        ApiHandler { request_type: TRACE_SET, name: "trace set", callback: trace_set },
    );
    register_api_handler(
        ctl,
        ApiHandler { request_type: TRACE_DUMP, name: "trace dump", callback: trace_dump },
    );
    register_api_handler(
        ctl,
        ApiHandler { request_type: TRACE_CLEAR, name: "trace clear", callback: trace_clear },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chain(ring: &TraceRing, tag: u8, nodes: usize) -> PacketTrace {
        let mut pt = PacketTrace::new();
        for i in 0..nodes {
            ring.add(&mut pt, i as u16, &[tag, i as u8]);
        }
        pt
    }

    #[test]
    fn test_finish_resets_chain() {
        let ring = TraceRing::new(4);
        let mut pt = chain(&ring, 1, 3);
        assert!(!pt.is_empty());
        ring.finish(&mut pt);
        assert!(pt.is_empty());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_ring_bounded_and_oldest_dropped() {
        let ring = TraceRing::new(4);
        for tag in 0..10u8 {
            let mut pt = chain(&ring, tag, 2);
            ring.finish(&mut pt);
            assert!(ring.len() <= ring.capacity());
        }
        assert_eq!(ring.len(), 4);

        // survivors are the newest four, in FIFO order
        let nodes = NodeRegistry::new();
        for expect in 6..10u8 {
            let mut out = String::new();
            assert!(ring.dump(&nodes, &mut out));
            assert!(out.contains(&format!("node-0: {:02x} 00", expect)), "out={out:?}");
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_dump_fifo_and_chain_order() {
        let ring = TraceRing::new(4);
        let mut pt = chain(&ring, 7, 3);
        ring.finish(&mut pt);

        let nodes = NodeRegistry::new();
        let mut out = String::new();
        assert!(ring.dump(&nodes, &mut out));
        assert!(!ring.dump(&nodes, &mut out));

        let n0 = out.find("node-0:").unwrap();
        let n1 = out.find("node-1:").unwrap();
        let n2 = out.find("node-2:").unwrap();
        assert!(n0 < n1 && n1 < n2);
        assert!(out.starts_with("--------- "));
        assert!(out.ends_with("\n\n"));
    }

    #[test]
    fn test_pool_exhaustion_recycles_published_chains() {
        // tiny ring: pool of 255, ring of 2
        let ring = TraceRing::new(2);
        let mut published = 0usize;
        // far more items than the pool holds: add must keep succeeding
        for tag in 0..100u8 {
            let mut pt = chain(&ring, tag, 5);
            ring.finish(&mut pt);
            published += 1;
        }
        assert_eq!(published, 100);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_concurrent_producers_stay_bounded() {
        let ring = Arc::new(TraceRing::new(8));
        let n_threads = 4;
        let per_thread = 200;

        let mut handles = vec![];
        for t in 0..n_threads {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..per_thread {
                    let mut pt = PacketTrace::new();
                    ring.add(&mut pt, t as u16, &[t as u8, i as u8]);
                    ring.add(&mut pt, 100, &[]);
                    ring.finish(&mut pt);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(ring.len() <= ring.capacity());
        // every retained chain is intact (two items, head carries the tag)
        let nodes = NodeRegistry::new();
        let mut drained = 0;
        let mut out = String::new();
        while ring.dump(&nodes, &mut out) {
            drained += 1;
        }
        assert!(drained <= 8);
        assert_eq!(out.matches("node-100:").count(), drained);
    }

    #[test]
    fn test_registered_node_formatter() {
        let ring = TraceRing::new(2);
        let mut pt = PacketTrace::new();
        ring.add(&mut pt, NODE_PORT_RX, &[9]);
        ring.finish(&mut pt);

        fn fmt(out: &mut String, data: &[u8]) {
            let _ = write!(out, "len={}", data.len());
        }
        let mut nodes = NodeRegistry::new();
        nodes.nodes.push(NodeInfo { id: NODE_PORT_RX, name: "port_rx", format: Some(fmt) });

        let mut out = String::new();
        assert!(ring.dump(&nodes, &mut out));
        assert!(out.contains("port_rx: len=1"));
    }
}
