//! Downlink scheduling.
//!
//! The server plans when each queued frame leaves which gateway. Class A
//! frames target RX1, falling back to RX2; a frame that cannot make
//! either window is a scheduling miss. Class B frames take the next ping
//! slot the gateway can honor, class C frames go out as soon as the
//! gateway is idle. Per-gateway busy times serialise downlinks sharing a
//! gateway.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use lwsim_common::{GatewayId, NodeId, SimTime};
use lwsim_mac::frames::DownlinkFrame;
use lwsim_mac::timing::next_ping_slot_time;

/// A frame queued for a node, with the radio parameters the gateway
/// should use.
#[derive(Debug, Clone)]
pub struct ScheduledDownlink {
    pub frame: DownlinkFrame,
    pub gateway: GatewayId,
    pub data_rate: Option<u8>,
    pub tx_power_dbm: Option<f64>,
}

#[derive(Debug)]
struct Entry {
    time: SimTime,
    priority: i32,
    counter: u64,
    item: ScheduledDownlink,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.counter == other.counter
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (time, priority, counter).
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.counter.cmp(&self.counter))
    }
}

/// Timing inputs for placing a class-B frame.
#[derive(Debug, Clone, Copy)]
pub struct PingSlotPlan {
    pub last_beacon: SimTime,
    pub beacon_interval_s: f64,
    pub ping_slot_interval_s: f64,
    pub ping_slot_offset_s: f64,
    pub periodicity: u8,
    pub clock_offset_s: f64,
}

/// Per-node queues of scheduled downlinks plus gateway occupancy.
#[derive(Debug, Default)]
pub struct DownlinkScheduler {
    queues: HashMap<NodeId, BinaryHeap<Entry>>,
    counter: u64,
    gateway_busy: HashMap<GatewayId, SimTime>,
}

impl DownlinkScheduler {
    pub fn new() -> Self {
        DownlinkScheduler::default()
    }

    /// When `gateway` finishes its last planned emission.
    pub fn gateway_busy_until(&self, gateway: GatewayId) -> SimTime {
        self.gateway_busy.get(&gateway).copied().unwrap_or(SimTime::ZERO)
    }

    fn push(&mut self, node: NodeId, time: SimTime, priority: i32, item: ScheduledDownlink) {
        let counter = self.counter;
        self.counter += 1;
        self.queues.entry(node).or_default().push(Entry {
            time,
            priority,
            counter,
            item,
        });
    }

    fn occupy(&mut self, gateway: GatewayId, start: SimTime, airtime_s: f64) {
        let end = start + SimTime::from_secs(airtime_s);
        let entry = self.gateway_busy.entry(gateway).or_insert(SimTime::ZERO);
        if end > *entry {
            *entry = end;
        }
    }

    /// Place a class-A frame in RX1 or RX2. Returns the emission time,
    /// or `None` when neither window can be met (a scheduling miss).
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_class_a(
        &mut self,
        node: NodeId,
        after: SimTime,
        rx1: SimTime,
        rx2: SimTime,
        item: ScheduledDownlink,
        airtime_s: f64,
        priority: i32,
    ) -> Option<SimTime> {
        let gateway = item.gateway;
        let candidate = after.max(self.gateway_busy_until(gateway));
        let time = if candidate <= rx1 {
            rx1
        } else if candidate <= rx2 {
            rx2
        } else {
            return None;
        };
        self.push(node, time, priority, item);
        self.occupy(gateway, time, airtime_s);
        Some(time)
    }

    /// Place a class-B frame on the next ping slot the gateway can make.
    /// The earliest eligible slot starts one packet airtime after
    /// `after`.
    pub fn schedule_class_b(
        &mut self,
        node: NodeId,
        after: SimTime,
        plan: &PingSlotPlan,
        item: ScheduledDownlink,
        airtime_s: f64,
        priority: i32,
    ) -> SimTime {
        let gateway = item.gateway;
        let mut earliest = after + SimTime::from_secs(airtime_s);
        let slot = loop {
            let slot = next_ping_slot_time(
                earliest,
                plan.last_beacon,
                plan.beacon_interval_s,
                plan.ping_slot_interval_s,
                plan.ping_slot_offset_s,
                plan.periodicity,
                plan.clock_offset_s,
            );
            if slot >= self.gateway_busy_until(gateway) {
                break slot;
            }
            earliest = self.gateway_busy_until(gateway);
        };
        self.push(node, slot, priority, item);
        self.occupy(gateway, slot, airtime_s);
        slot
    }

    /// Place a class-C frame at the earliest gateway-idle instant.
    pub fn schedule_class_c(
        &mut self,
        node: NodeId,
        after: SimTime,
        item: ScheduledDownlink,
        airtime_s: f64,
        priority: i32,
    ) -> SimTime {
        let gateway = item.gateway;
        let time = after.max(self.gateway_busy_until(gateway));
        self.push(node, time, priority, item);
        self.occupy(gateway, time, airtime_s);
        time
    }

    /// Pop the next frame for `node` whose emission time has come.
    pub fn pop_ready(&mut self, node: NodeId, now: SimTime) -> Option<ScheduledDownlink> {
        let queue = self.queues.get_mut(&node)?;
        if queue.peek().map_or(true, |e| e.time > now) {
            return None;
        }
        let entry = queue.pop().expect("peeked entry exists");
        if queue.is_empty() {
            self.queues.remove(&node);
        }
        Some(entry.item)
    }

    /// Emission time of the next frame queued for `node`.
    pub fn next_time(&self, node: NodeId) -> Option<SimTime> {
        self.queues.get(&node).and_then(|q| q.peek()).map(|e| e.time)
    }
}
