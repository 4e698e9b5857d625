//! The discrete-event engine.
//!
//! Single-threaded loop over a deterministic event queue. Every handler
//! runs to completion; all mutable state (nodes, gateways, server,
//! queue) lives here and is only touched from the loop. One master seed
//! feeds purpose-split RNG streams, so a scenario replayed with the same
//! seed produces a byte-identical event trace.

use std::collections::{BTreeMap, HashMap};

use metrics::{counter, histogram};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};
use serde::Serialize;
use tracing::{debug, info};

use lwsim_common::{
    EventKind, EventQueue, GatewayId, NodeId, PacketId, Position, RngStreams, RxWindow, SimError,
    SimTime,
};
use lwsim_mac::crypto;
use lwsim_mac::frames::DownlinkFrame;
use lwsim_mac::region::Region;
use lwsim_mac::timing::{compute_rx1, compute_rx2};
use lwsim_model::{ChannelConfig, ChannelDistribution, DeviceClass, Scenario, TrafficModel};
use lwsim_phy::energy::RadioState;
use lwsim_phy::pathloss::PathLossModel;
use lwsim_phy::per::PerModel;
use lwsim_phy::LinkGains;

use crate::duty_cycle::DutyCycleManager;
use crate::gateway::{BufferedDownlink, Gateway};
use crate::metrics_defs;
use crate::mobility::SmoothMobility;
use crate::node::{Node, ScheduleReason};
use crate::server::{NetworkServer, ReceivedCopy};
use crate::{UplinkRecord, UplinkResult, UplinkTransmission};

/// Gap inserted when a drawn arrival lands inside the previous frame.
const BACKPRESSURE_EPSILON_S: f64 = 1e-6;
/// Delay before a retransmission attempt, seconds.
const RETRANSMISSION_DELAY_S: f64 = 1.0;

/// One exported trace row.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub time_s: f64,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sf: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_hz: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr_db: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// A downlink currently on the air towards a node.
#[derive(Debug)]
struct ActiveDownlink {
    buffered: BufferedDownlink,
    sf: u8,
    airtime_s: f64,
    success: bool,
}

/// Aggregate results of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    pub pdr: f64,
    pub tx_attempted: u64,
    pub delivered: u64,
    pub collisions: u64,
    pub no_coverage: u64,
    pub duplicates: u64,
    pub missed_downlinks: u64,
    pub downlinks_sent: u64,
    pub retransmissions: u64,
    pub avg_delay_s: f64,
    pub avg_arrival_interval_s: f64,
    pub throughput_bps: f64,
    pub mean_snr_db: f64,
    pub simulated_time_s: f64,
    pub energy_j: f64,
    pub energy_nodes_j: f64,
    pub energy_gateways_j: f64,
    pub sf_distribution: BTreeMap<u8, usize>,
    pub tx_power_distribution: BTreeMap<String, usize>,
    pub pdr_by_node: BTreeMap<u32, f64>,
    pub pdr_by_sf: BTreeMap<u8, f64>,
    pub pdr_by_gateway: BTreeMap<u32, f64>,
    pub pdr_by_class: BTreeMap<String, f64>,
    pub energy_by_node: BTreeMap<u32, f64>,
    pub energy_breakdown_by_node: BTreeMap<u32, BTreeMap<String, f64>>,
    pub airtime_by_node: BTreeMap<u32, f64>,
}

impl SimulationMetrics {
    /// The fields an external comparator diffs against reference
    /// captures: sent, received, PDR, collisions, mean SNR.
    pub fn validation_row(&self) -> BTreeMap<&'static str, f64> {
        BTreeMap::from([
            ("sent", self.tx_attempted as f64),
            ("received", self.delivered as f64),
            ("PDR", self.pdr),
            ("collisions", self.collisions as f64),
            ("snr", self.mean_snr_db),
        ])
    }
}

/// The simulation engine.
pub struct Simulator {
    pub nodes: Vec<Node>,
    pub gateways: Vec<Gateway>,
    pub server: NetworkServer,
    queue: EventQueue,
    now: SimTime,

    region: Region,
    channel_plan: Vec<ChannelConfig>,
    channel_distribution: ChannelDistribution,
    rr_index: usize,
    path_loss: PathLossModel,
    per_model: PerModel,
    link_gains: LinkGains,
    payload_size_bytes: usize,
    traffic: TrafficModel,
    first_packet_interval_s: f64,
    packets_per_node: u32,
    max_sim_time_s: Option<f64>,
    class_c_rx_interval_s: f64,
    beacon_loss_prob: f64,
    duty: Option<DutyCycleManager>,
    mobility_model: Option<SmoothMobility>,

    arrival_rng: ChaCha8Rng,
    shadowing_rng: ChaCha8Rng,
    fading_rng: ChaCha8Rng,
    mobility_rng: ChaCha8Rng,
    beacon_rng: ChaCha8Rng,
    channel_rng: ChaCha8Rng,

    next_packet: u64,
    in_flight: HashMap<PacketId, UplinkTransmission>,
    active_downlinks: HashMap<NodeId, ActiveDownlink>,
    records: Vec<UplinkRecord>,
    record_index: HashMap<PacketId, usize>,
    trace: Vec<TraceEvent>,

    // Aggregate counters
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_lost_collision: u64,
    pub packets_lost_no_coverage: u64,
    pub downlinks_sent: u64,
    pub retransmissions: u64,
    total_delay_s: f64,
    delivered_snr_sum: f64,
}

impl Simulator {
    /// Build a simulator from a validated scenario.
    pub fn new(scenario: &Scenario) -> Result<Simulator, SimError> {
        scenario
            .validate()
            .map_err(|e| SimError::Config(e.to_string()))?;

        let streams = RngStreams::new(scenario.seed);
        let mut position_rng = streams.stream("positions", 0);
        let mut arrival_rng = streams.stream("arrivals", 0);
        let mut nonce_rng = streams.stream("nonces", 0);

        let per_model = PerModel::select(scenario.per_model, scenario.reference_mode);
        let profile = lwsim_phy::energy::profile_by_name(&scenario.energy_profile)
            .map_err(|e| SimError::Config(e.to_string()))?;

        // Gateways: explicit placements, a single centered one, or
        // uniform draws.
        let mut gateways = Vec::new();
        let gw_placements: Vec<Position> = if !scenario.gateways.is_empty() {
            scenario.gateways.iter().map(|g| Position::new(g.x, g.y)).collect()
        } else if scenario.num_gateways == 1 {
            vec![Position::new(scenario.area_size_m / 2.0, scenario.area_size_m / 2.0)]
        } else {
            (0..scenario.num_gateways)
                .map(|_| {
                    Position::new(
                        position_rng.gen::<f64>() * scenario.area_size_m,
                        position_rng.gen::<f64>() * scenario.area_size_m,
                    )
                })
                .collect()
        };
        for (i, position) in gw_placements.into_iter().enumerate() {
            let mut gw = Gateway::new(GatewayId(i as u32), position, scenario.energy_detection_dbm);
            gw.sensitivity_margin_db = scenario.sensitivity_margin_db;
            gw.downlink_power_dbm = scenario.region.max_power_dbm();
            gateways.push(gw);
        }

        // Nodes.
        let node_count = if scenario.nodes.is_empty() {
            scenario.num_nodes
        } else {
            scenario.nodes.len()
        };
        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let placement = scenario.nodes.get(i);
            let position = match placement {
                Some(p) => Position::new(p.x, p.y),
                None => Position::new(
                    position_rng.gen::<f64>() * scenario.area_size_m,
                    position_rng.gen::<f64>() * scenario.area_size_m,
                ),
            };
            let sf = placement
                .and_then(|p| p.sf)
                .or(scenario.fixed_sf)
                .unwrap_or_else(|| position_rng.gen_range(7..=12));
            let tx_power = placement
                .and_then(|p| p.tx_power_dbm)
                .or(scenario.fixed_tx_power_dbm)
                .unwrap_or(14.0);
            let clock_offset = if scenario.class_b.clock_accuracy_s > 0.0 {
                Normal::new(0.0, scenario.class_b.clock_accuracy_s)
                    .expect("validated std")
                    .sample(&mut position_rng)
            } else {
                0.0
            };
            let mut node = Node::new(
                NodeId(i as u32),
                position,
                sf,
                tx_power,
                scenario.node_class,
                profile.clone(),
                scenario.battery_capacity_j,
                clock_offset,
            );
            node.adr_enabled = scenario.adr_node;
            if scenario.enable_security {
                node.activated = false;
                node.draw_dev_nonce(&mut nonce_rng);
            }
            if scenario.node_class == DeviceClass::C {
                node.state = RadioState::Rx;
            }
            nodes.push(node);
        }

        let mut server = NetworkServer::new(
            scenario.region,
            scenario.adr_server,
            scenario.adr_method,
            scenario.timing.network_delay_s,
            scenario.timing.process_delay_s,
            scenario.timing.rx_delay_s,
        );
        server.enable_security = scenario.enable_security;
        server.beacon_interval_s = scenario.class_b.beacon_interval_s;
        server.beacon_drift = scenario.class_b.beacon_drift;
        server.ping_slot_interval_s = scenario.class_b.ping_slot_interval_s;
        server.ping_slot_offset_s = scenario.class_b.ping_slot_offset_s;

        let mobility_model = scenario.mobility.enabled.then(|| {
            SmoothMobility::new(
                scenario.area_size_m,
                scenario.mobility.min_speed_mps,
                scenario.mobility.max_speed_mps,
                scenario.mobility.step_s,
            )
        });

        let mut sim = Simulator {
            nodes,
            gateways,
            server,
            queue: EventQueue::new(),
            now: SimTime::ZERO,
            region: scenario.region,
            channel_plan: scenario.channel_plan(),
            channel_distribution: scenario.channel_distribution,
            rr_index: 0,
            path_loss: scenario.path_loss,
            per_model,
            link_gains: scenario.link_gains,
            payload_size_bytes: scenario.payload_size_bytes,
            traffic: scenario.traffic,
            first_packet_interval_s: scenario
                .first_packet_interval_s
                .unwrap_or(scenario.traffic.mean_interval_s()),
            packets_per_node: scenario.packets_per_node,
            max_sim_time_s: scenario.max_sim_time_s,
            class_c_rx_interval_s: scenario.class_c_rx_interval_s,
            beacon_loss_prob: scenario.class_b.beacon_loss_prob,
            duty: scenario.duty_cycle.map(DutyCycleManager::new),
            mobility_model,
            arrival_rng: streams.stream("arrivals", 1),
            shadowing_rng: streams.stream("shadowing", 0),
            fading_rng: streams.stream("fading", 0),
            mobility_rng: streams.stream("mobility", 0),
            beacon_rng: streams.stream("beacons", 0),
            channel_rng: streams.stream("channels", 0),
            next_packet: 0,
            in_flight: HashMap::new(),
            active_downlinks: HashMap::new(),
            records: Vec::new(),
            record_index: HashMap::new(),
            trace: Vec::new(),
            packets_sent: 0,
            packets_delivered: 0,
            packets_lost_collision: 0,
            packets_lost_no_coverage: 0,
            downlinks_sent: 0,
            retransmissions: 0,
            total_delay_s: 0.0,
            delivered_snr_sum: 0.0,
        };

        // First arrival per node.
        for idx in 0..sim.nodes.len() {
            let first = sim.draw_first_arrival(idx, &mut arrival_rng);
            sim.nodes[idx].arrival_clock_s = first;
            sim.schedule_transmission(idx, first, sim.initial_reason());
        }

        // Class B needs the beacon grid; class C needs its polls.
        let class_b = sim.nodes.iter().any(|n| n.class == DeviceClass::B);
        if class_b {
            sim.queue.insert(SimTime::ZERO, EventKind::Beacon);
            sim.server.notify_beacon(SimTime::ZERO);
        }
        for idx in 0..sim.nodes.len() {
            if sim.nodes[idx].class == DeviceClass::C {
                let node = sim.nodes[idx].id;
                sim.queue.insert(SimTime::ZERO, EventKind::ClassCPoll { node });
            }
        }

        // Mobility assignment and first steps.
        if let Some(model) = sim.mobility_model {
            for idx in 0..sim.nodes.len() {
                model.assign(&mut sim.nodes[idx], &mut sim.mobility_rng);
                let node = sim.nodes[idx].id;
                sim.queue
                    .insert(SimTime::from_secs(model.step_s), EventKind::Mobility { node });
            }
        }

        info!(
            nodes = sim.nodes.len(),
            gateways = sim.gateways.len(),
            channels = sim.channel_plan.len(),
            "simulation initialised"
        );
        Ok(sim)
    }

    fn initial_reason(&self) -> ScheduleReason {
        match self.traffic {
            TrafficModel::Random { .. } => ScheduleReason::Poisson,
            TrafficModel::Periodic { .. } => ScheduleReason::Periodic,
        }
    }

    fn draw_first_arrival(&mut self, _idx: usize, rng: &mut ChaCha8Rng) -> f64 {
        match self.traffic {
            TrafficModel::Random { .. } => {
                let exp = Exp::new(1.0 / self.first_packet_interval_s).expect("validated positive");
                exp.sample(rng)
            }
            TrafficModel::Periodic { period_s } => rng.gen::<f64>() * period_s,
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Pick the node's channel for its next uplink.
    fn select_channel(&mut self, node_idx: usize) -> usize {
        let mask = self.nodes[node_idx].channel_mask;
        let allowed: Vec<usize> = (0..self.channel_plan.len())
            .filter(|i| mask & (1 << i) != 0)
            .collect();
        let allowed = if allowed.is_empty() {
            (0..self.channel_plan.len()).collect()
        } else {
            allowed
        };
        match self.channel_distribution {
            ChannelDistribution::Random => allowed[self.channel_rng.gen_range(0..allowed.len())],
            ChannelDistribution::RoundRobin => {
                let choice = allowed[self.rr_index % allowed.len()];
                self.rr_index += 1;
                choice
            }
        }
    }

    /// Schedule a TX start. The drawn arrival is never re-sampled:
    /// an in-flight frame postpones the start to just after its end, and
    /// the duty cycle postpones it to the earliest legal instant.
    fn schedule_transmission(&mut self, node_idx: usize, requested_s: f64, reason: ScheduleReason) {
        if !self.nodes[node_idx].alive {
            return;
        }
        let channel = self.select_channel(node_idx);
        self.nodes[node_idx].channel_index = channel;
        let band = self.channel_plan[channel].frequency_hz;
        let node_id = self.nodes[node_idx].id;

        let mut reason = reason;
        let mut tx_s = requested_s.max(self.now.as_secs_f64());
        if let Some(end) = self.nodes[node_idx].current_end_time {
            let end_s = end.as_secs_f64();
            if tx_s < end_s + BACKPRESSURE_EPSILON_S {
                tx_s = end_s + BACKPRESSURE_EPSILON_S;
                reason = ScheduleReason::Overlap;
            }
        }
        if let Some(duty) = &self.duty {
            let enforced = duty.earliest_tx_s(node_id, band, tx_s);
            if enforced > tx_s {
                tx_s = enforced;
                reason = ScheduleReason::DutyCycle;
            }
        }

        // The radio spends its startup time powering up first.
        let startup_s = self.nodes[node_idx].profile.startup_time_s;
        if startup_s > 0.0 {
            let wake = (tx_s - startup_s).max(self.now.as_secs_f64());
            self.queue
                .insert(SimTime::from_secs(wake), EventKind::NodeWake { node: node_id });
        }

        self.nodes[node_idx].interval_log.push(crate::node::IntervalRecord {
            requested_s,
            tx_s,
            reason,
        });
        self.queue
            .insert(SimTime::from_secs(tx_s), EventKind::TxStart { node: node_id });
    }

    /// Whether every node has used up its packet budget.
    fn budget_reached(&self) -> bool {
        self.packets_per_node != 0
            && self
                .nodes
                .iter()
                .all(|n| !n.alive || n.packets_sent >= self.packets_per_node)
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run until the queue drains or a limit is reached.
    pub fn run(&mut self) -> Result<(), SimError> {
        let limit = self.max_sim_time_s.map(SimTime::from_secs);
        while let Some(event) = self.queue.pop() {
            if let Some(limit) = limit {
                if event.time > limit {
                    // Past the horizon: drain without dispatch.
                    self.now = limit;
                    self.queue.clear();
                    break;
                }
            }
            self.now = event.time;
            self.dispatch(event.kind)?;
        }
        for node in &mut self.nodes {
            node.consume_until(self.now);
        }
        info!(time = %self.now, sent = self.packets_sent, delivered = self.packets_delivered, "simulation finished");
        Ok(())
    }

    fn dispatch(&mut self, kind: EventKind) -> Result<(), SimError> {
        match kind {
            EventKind::TxStart { node } => self.handle_tx_start(node)?,
            EventKind::TxEnd { node, packet } => self.handle_tx_end(node, packet)?,
            EventKind::RxWindowOpen { node, window } => self.handle_rx_window_open(node, window)?,
            EventKind::RxWindowClose { node, window } => self.handle_rx_window_close(node, window)?,
            EventKind::Beacon => self.handle_beacon(),
            EventKind::PingSlot { node } => self.handle_ping_slot(node)?,
            EventKind::ClassCPoll { node } => self.handle_class_c_poll(node)?,
            EventKind::NodeWake { node } => self.handle_node_wake(node)?,
            EventKind::DownlinkStart { .. } => {}
            EventKind::DownlinkEnd { node, gateway } => self.handle_downlink_end(node, gateway)?,
            EventKind::ServerRx { packet } => self.handle_server_rx(packet),
            EventKind::ServerProcess { packet } => self.handle_server_process(packet),
            EventKind::Mobility { node } => self.handle_mobility(node),
        }
        Ok(())
    }

    fn node_index(&self, node: NodeId) -> Result<usize, SimError> {
        self.nodes
            .iter()
            .position(|n| n.id == node)
            .ok_or(SimError::UnknownNode(node))
    }

    // ------------------------------------------------------------------
    // Uplink path
    // ------------------------------------------------------------------

    fn handle_tx_start(&mut self, node_id: NodeId) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        if !self.nodes[idx].alive {
            return Ok(());
        }

        let channel = self.channel_plan[self.nodes[idx].channel_index];
        let region = self.region;
        let node = &mut self.nodes[idx];

        if node.nb_trans_left == 0 {
            node.nb_trans_left = node.nb_trans.max(1);
        }
        node.nb_trans_left -= 1;

        node.adr_uplink_bookkeeping(region);
        let frame = node.build_uplink(self.payload_size_bytes);
        let adr_ack_req = frame.adr_ack_req();
        let digest = crypto::frame_digest(&frame.payload, frame.fcnt);

        let airtime_s = lwsim_phy::airtime(
            node.sf,
            channel.bandwidth_hz,
            self.payload_size_bytes,
            1,
            lwsim_phy::DEFAULT_PREAMBLE_SYMBOLS,
            None,
        );
        let airtime = SimTime::from_secs(airtime_s);
        let end = now + airtime;

        let packet = PacketId(self.next_packet);
        self.next_packet += 1;

        let tx = UplinkTransmission {
            packet,
            node: node_id,
            spreading_factor: node.sf,
            frequency_hz: channel.frequency_hz,
            bandwidth_hz: channel.bandwidth_hz,
            payload_bytes: self.payload_size_bytes,
            fcnt: frame.fcnt,
            frame_digest: digest,
            adr_ack_req,
            start: now,
            end,
            airtime_s,
        };

        node.last_tx_time = Some(now);
        node.last_airtime_s = airtime_s;
        node.total_airtime_s += airtime_s;
        node.in_flight = true;
        node.current_end_time = Some(end);
        node.packets_sent += 1;
        node.tx_attempted += 1;

        // TX burst energy, billed up front; the state clock jumps past
        // the burst so lazy integration cannot double-count it.
        let tx_power = node.tx_power_dbm;
        let tx_energy = node.profile.tx_current(tx_power) * node.profile.voltage_v * airtime_s;
        node.add_energy(RadioState::Tx, tx_energy);
        let ramp_s = node.profile.ramp_up_s + node.profile.ramp_down_s;
        if ramp_s > 0.0 {
            let ramp_energy = node.profile.tx_current(tx_power) * node.profile.voltage_v * ramp_s;
            node.add_energy(RadioState::RampUp, ramp_energy);
        }
        node.state = RadioState::Tx;
        node.state_since = end;
        if !node.alive {
            return Ok(());
        }

        let sf = tx.spreading_factor;

        if let Some(duty) = &mut self.duty {
            duty.update_after_tx(node_id, channel.frequency_hz, now.as_secs_f64(), airtime_s);
        }

        self.packets_sent += 1;
        counter!(metrics_defs::UPLINKS_SENT.name).increment(1);

        // Propagate to every gateway.
        let mut heard = false;
        let node_pos = self.nodes[idx].position;
        let sigma = self.path_loss.shadowing_sigma_db();
        for gi in 0..self.gateways.len() {
            let gw_pos = self.gateways[gi].position;
            let distance = node_pos.distance_to(&gw_pos);
            let loss = self
                .path_loss
                .path_loss(distance)
                .map_err(|e| SimError::Domain(e.to_string()))?;
            let shadowing = if sigma > 0.0 {
                Normal::new(0.0, sigma)
                    .expect("validated sigma")
                    .sample(&mut self.shadowing_rng)
            } else {
                0.0
            };
            let rssi = lwsim_phy::rssi(tx_power, loss, &self.link_gains, shadowing);
            // One noise sample per packet copy, reused for every later
            // decision about it.
            let noise = lwsim_phy::noise_floor(channel.bandwidth_hz);
            match self.gateways[gi].start_reception(&tx, rssi, noise) {
                Ok(()) => heard = true,
                Err(reason) => {
                    debug!(node = %node_id, gateway = %self.gateways[gi].id, ?reason, "uplink not tracked");
                }
            }
        }

        self.in_flight.insert(packet, tx);
        self.record_index.insert(packet, self.records.len());
        self.records.push(UplinkRecord {
            packet,
            node: node_id,
            sf,
            frequency_hz: channel.frequency_hz,
            start_s: now.as_secs_f64(),
            end_s: end.as_secs_f64(),
            heard,
            result: None,
            gateway: None,
            rssi_dbm: None,
            snr_db: None,
            energy_j: tx_energy,
        });
        self.trace.push(TraceEvent {
            time_s: now.as_secs_f64(),
            kind: "tx_start",
            node: Some(node_id.0),
            gateway: None,
            sf: Some(sf),
            frequency_hz: Some(channel.frequency_hz),
            rssi_dbm: None,
            snr_db: None,
            success: None,
        });

        self.queue.insert(end, EventKind::TxEnd { node: node_id, packet });

        // Class A receive windows are planned from the TX end.
        if self.nodes[idx].class == DeviceClass::A {
            let rx1 = compute_rx1(end, self.server.rx_delay_s);
            let rx2 = compute_rx2(end, self.server.rx_delay_s);
            let window_s = self.nodes[idx].profile.rx_window_duration_s.max(0.0);
            for (window, open) in [(RxWindow::Rx1, rx1), (RxWindow::Rx2, rx2)] {
                self.queue
                    .insert(open, EventKind::RxWindowOpen { node: node_id, window });
                self.queue.insert(
                    open + SimTime::from_secs(window_s),
                    EventKind::RxWindowClose { node: node_id, window },
                );
            }
        }
        Ok(())
    }

    fn handle_tx_end(&mut self, node_id: NodeId, packet: PacketId) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);

        let Some(tx) = self.in_flight.remove(&packet) else {
            return Ok(());
        };

        {
            let node = &mut self.nodes[idx];
            node.in_flight = false;
            node.current_end_time = None;
            node.state = if node.class == DeviceClass::C {
                RadioState::Rx
            } else {
                RadioState::Processing
            };
            node.state_since = now;
        }

        // Every gateway finishes its copy; survivors go to the server.
        let mut best: Option<(GatewayId, f64, f64)> = None;
        let mut any_success = false;
        for gi in 0..self.gateways.len() {
            let Some(rx) = self.gateways[gi].end_reception(
                packet,
                self.per_model,
                tx.payload_bytes,
                &mut self.fading_rng,
            ) else {
                continue;
            };
            self.trace.push(TraceEvent {
                time_s: now.as_secs_f64(),
                kind: "rx",
                node: Some(node_id.0),
                gateway: Some(rx.gateway.0),
                sf: Some(rx.spreading_factor),
                frequency_hz: Some(rx.frequency_hz),
                rssi_dbm: Some(rx.rssi_dbm),
                snr_db: Some(rx.snir_db),
                success: Some(rx.success),
            });
            if !rx.success {
                continue;
            }
            any_success = true;
            if best.map_or(true, |(_, s, _)| rx.snir_db > s) {
                best = Some((rx.gateway, rx.snir_db, rx.rssi_dbm));
            }
            self.server.enqueue_copy(ReceivedCopy {
                packet,
                node: node_id,
                gateway: rx.gateway,
                rssi_dbm: rx.rssi_dbm,
                snir_db: rx.snir_db,
                uplink_end: now,
                fcnt: tx.fcnt,
                frame_digest: tx.frame_digest,
                adr_ack_req: tx.adr_ack_req,
            });
            let arrival = now + SimTime::from_secs(self.server.network_delay_s);
            self.queue.insert(arrival, EventKind::ServerRx { packet });
        }

        // Attribute the outcome.
        let record = &mut self.records[self.record_index[&packet]];
        if any_success {
            record.result = Some(UplinkResult::Delivered);
            if let Some((gw, snr, rssi)) = best {
                record.gateway = Some(gw);
                record.snr_db = Some(snr);
                record.rssi_dbm = Some(rssi);
                self.delivered_snr_sum += snr;
                histogram!(metrics_defs::UPLINK_SNR.name).record(snr);
            }
            self.packets_delivered += 1;
            self.total_delay_s += tx.airtime_s;
            self.nodes[idx].packets_success += 1;
            self.nodes[idx].rx_delivered += 1;
            counter!(metrics_defs::UPLINKS_DELIVERED.name).increment(1);
        } else if record.heard {
            record.result = Some(UplinkResult::CollisionLoss);
            self.packets_lost_collision += 1;
            self.nodes[idx].packets_collision += 1;
            counter!(metrics_defs::UPLINKS_COLLIDED.name).increment(1);
        } else {
            record.result = Some(UplinkResult::NoCoverage);
            self.packets_lost_no_coverage += 1;
            counter!(metrics_defs::UPLINKS_NO_COVERAGE.name).increment(1);
        }

        // Next attempt: pending retransmissions first, then the arrival
        // process.
        if self.nodes[idx].nb_trans_left > 0 {
            self.retransmissions += 1;
            let t = now.as_secs_f64() + RETRANSMISSION_DELAY_S;
            self.schedule_transmission(idx, t, ScheduleReason::Retransmission);
            return Ok(());
        }
        if self.packets_per_node == 0 || self.nodes[idx].packets_sent < self.packets_per_node {
            let next = match self.traffic {
                TrafficModel::Random { mean_interval_s } => {
                    self.nodes[idx].next_poisson_arrival_s(mean_interval_s, &mut self.arrival_rng)
                }
                TrafficModel::Periodic { period_s } => self.nodes[idx].next_periodic_arrival_s(period_s),
            };
            self.schedule_transmission(idx, next, self.initial_reason());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Downlink path
    // ------------------------------------------------------------------

    fn handle_rx_window_open(&mut self, node_id: NodeId, window: RxWindow) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        if !self.nodes[idx].alive || self.nodes[idx].in_flight {
            return Ok(());
        }

        self.server.deliver_scheduled(node_id, now, &mut self.gateways);
        let sf_override = match window {
            RxWindow::Rx1 => None,
            RxWindow::Rx2 => Some(self.region.dr_to_sf(self.region.rx2().data_rate)),
        };
        self.try_emit_downlink(idx, sf_override)?;
        self.settle_listen_window(idx, now);
        Ok(())
    }

    /// Bill the receive window (and any downlink tail beyond it)
    /// explicitly, then park the state clock past the listened span so
    /// lazy integration cannot double-count it.
    fn settle_listen_window(&mut self, idx: usize, now: SimTime) {
        let node_id = self.nodes[idx].id;
        let window_s = self.nodes[idx].profile.rx_window_duration_s.max(0.0);
        let listened_s = match self.active_downlinks.get(&node_id) {
            Some(active) => window_s.max(active.airtime_s),
            None => window_s,
        };
        let node = &mut self.nodes[idx];
        if listened_s > 0.0 {
            let energy = node
                .profile
                .energy_for(RadioState::Listen, listened_s, None)
                .unwrap_or(0.0);
            node.add_energy(RadioState::Listen, energy);
        }
        node.state = if self.active_downlinks.contains_key(&node_id) {
            RadioState::Listen
        } else {
            RadioState::Sleep
        };
        node.state_since = now + SimTime::from_secs(listened_s);
    }

    fn handle_rx_window_close(&mut self, node_id: NodeId, _window: RxWindow) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        // Keep listening while a downlink is still on the air.
        if self.active_downlinks.contains_key(&node_id) {
            return Ok(());
        }
        if self.nodes[idx].class != DeviceClass::C && !self.nodes[idx].in_flight {
            self.nodes[idx].state = RadioState::Sleep;
            self.nodes[idx].state_since = now;
        }
        Ok(())
    }

    /// Pop a buffered downlink from the first gateway holding one and
    /// put it on the air.
    fn try_emit_downlink(&mut self, idx: usize, sf_override: Option<u8>) -> Result<(), SimError> {
        let node_id = self.nodes[idx].id;
        if self.active_downlinks.contains_key(&node_id) {
            return Ok(());
        }
        let now = self.now;
        for gi in 0..self.gateways.len() {
            let Some(buffered) = self.gateways[gi].pop_downlink(node_id) else {
                continue;
            };
            // The window dictates the data rate (RX2 uses the region's
            // RX2 parameters); outside class A windows the frame's own
            // data rate applies.
            let sf = sf_override
                .or_else(|| buffered.data_rate.map(|dr| self.region.dr_to_sf(dr)))
                .unwrap_or(self.nodes[idx].sf);
            let bw = self.region.default_bandwidth_hz();
            let payload_len = match &buffered.frame {
                DownlinkFrame::Data(f) => f.payload.len(),
                DownlinkFrame::JoinAccept(f) => f.wire_size(),
            };
            let airtime_s = lwsim_phy::airtime(
                sf,
                bw,
                payload_len,
                1,
                lwsim_phy::DEFAULT_PREAMBLE_SYMBOLS,
                None,
            );
            let tx_power = buffered
                .tx_power_dbm
                .unwrap_or(self.gateways[gi].downlink_power_dbm);

            self.gateways[gi].account_downlink_energy(airtime_s, tx_power);

            // Propagation back to the node.
            let distance = self.gateways[gi].position.distance_to(&self.nodes[idx].position);
            let loss = self
                .path_loss
                .path_loss(distance)
                .map_err(|e| SimError::Domain(e.to_string()))?;
            let sigma = self.path_loss.shadowing_sigma_db();
            let shadowing = if sigma > 0.0 {
                Normal::new(0.0, sigma)
                    .expect("validated sigma")
                    .sample(&mut self.shadowing_rng)
            } else {
                0.0
            };
            let rssi = lwsim_phy::rssi(tx_power, loss, &self.link_gains, shadowing);
            let noise = lwsim_phy::noise_floor(bw);
            let snr = lwsim_phy::snr(rssi, noise, sf, false);
            let sensitivity = lwsim_phy::sensitivity(sf, bw) + self.gateways[gi].sensitivity_margin_db;
            let success = rssi >= sensitivity;

            let gateway = self.gateways[gi].id;
            self.downlinks_sent += 1;
            counter!(metrics_defs::DOWNLINKS_SENT.name).increment(1);
            self.queue
                .insert(now, EventKind::DownlinkStart { node: node_id, gateway });
            self.trace.push(TraceEvent {
                time_s: now.as_secs_f64(),
                kind: "downlink_start",
                node: Some(node_id.0),
                gateway: Some(gateway.0),
                sf: Some(sf),
                frequency_hz: None,
                rssi_dbm: Some(rssi),
                snr_db: Some(snr),
                success: Some(success),
            });

            self.active_downlinks.insert(
                node_id,
                ActiveDownlink {
                    buffered,
                    sf,
                    airtime_s,
                    success,
                },
            );
            self.queue.insert(
                now + SimTime::from_secs(airtime_s),
                EventKind::DownlinkEnd { node: node_id, gateway },
            );
            break;
        }
        Ok(())
    }

    fn handle_downlink_end(&mut self, node_id: NodeId, gateway: GatewayId) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        let Some(active) = self.active_downlinks.remove(&node_id) else {
            return Ok(());
        };

        if active.success {
            let region = self.region;
            self.nodes[idx].handle_downlink(&active.buffered.frame, region);
        } else {
            self.nodes[idx].downlink_pending = self.nodes[idx].downlink_pending.saturating_sub(1);
        }
        self.trace.push(TraceEvent {
            time_s: now.as_secs_f64(),
            kind: "downlink_end",
            node: Some(node_id.0),
            gateway: Some(gateway.0),
            sf: Some(active.sf),
            frequency_hz: None,
            rssi_dbm: None,
            snr_db: None,
            success: Some(active.success),
        });

        let node = &mut self.nodes[idx];
        if !node.in_flight {
            node.state = if node.class == DeviceClass::C {
                RadioState::Rx
            } else {
                RadioState::Sleep
            };
            node.state_since = now;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Class B / C machinery
    // ------------------------------------------------------------------

    fn handle_beacon(&mut self) {
        let now = self.now;
        self.server.notify_beacon(now);
        let next = self.server.next_beacon_time(now);
        if !self.budget_reached() {
            self.queue.insert(next, EventKind::Beacon);
        }
        self.trace.push(TraceEvent {
            time_s: now.as_secs_f64(),
            kind: "beacon",
            node: None,
            gateway: None,
            sf: None,
            frequency_hz: None,
            rssi_dbm: None,
            snr_db: None,
            success: None,
        });

        let interval_s = self.server.ping_slot_interval_s;
        let offset_s = self.server.ping_slot_offset_s;
        let beacon_interval_s = self.server.beacon_interval_s;
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].class != DeviceClass::B || !self.nodes[idx].alive {
                continue;
            }
            let lost = self.beacon_loss_prob > 0.0
                && self.beacon_rng.gen::<f64>() < self.beacon_loss_prob;
            self.nodes[idx].observe_beacon(now, lost);

            // Plan this period's ping slots on the node's beacon view.
            let node = &self.nodes[idx];
            let Some(last_beacon) = node.last_beacon else {
                continue;
            };
            let node_id = node.id;
            let periodicity = node.ping_slot_periodicity;
            let clock_offset = node.clock_offset_s;
            let mut slot = lwsim_mac::timing::next_ping_slot_time(
                now,
                last_beacon,
                beacon_interval_s,
                interval_s,
                offset_s,
                periodicity,
                clock_offset,
            );
            let step = SimTime::from_secs(interval_s * (1u32 << periodicity.min(7)) as f64);
            while slot < next {
                self.queue.insert(slot, EventKind::PingSlot { node: node_id });
                slot = slot + step;
            }
        }
    }

    fn handle_ping_slot(&mut self, node_id: NodeId) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        if self.nodes[idx].class != DeviceClass::B
            || !self.nodes[idx].alive
            || self.nodes[idx].in_flight
        {
            return Ok(());
        }

        self.server.deliver_scheduled(node_id, now, &mut self.gateways);
        self.try_emit_downlink(idx, None)?;
        self.settle_listen_window(idx, now);
        Ok(())
    }

    fn handle_class_c_poll(&mut self, node_id: NodeId) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        if !self.nodes[idx].alive {
            return Ok(());
        }
        if !self.nodes[idx].in_flight {
            self.server.deliver_scheduled(node_id, now, &mut self.gateways);
            self.try_emit_downlink(idx, None)?;
        }
        if !self.budget_reached() {
            let next = now + SimTime::from_secs(self.class_c_rx_interval_s);
            self.queue.insert(next, EventKind::ClassCPoll { node: node_id });
        }
        Ok(())
    }

    fn handle_node_wake(&mut self, node_id: NodeId) -> Result<(), SimError> {
        let idx = self.node_index(node_id)?;
        let now = self.now;
        self.nodes[idx].consume_until(now);
        if !self.nodes[idx].alive || self.nodes[idx].in_flight {
            return Ok(());
        }
        // Power-up phase ahead of the pending TX start.
        self.nodes[idx].state = RadioState::StartupTx;
        self.nodes[idx].state_since = now;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server pipeline
    // ------------------------------------------------------------------

    fn handle_server_rx(&mut self, packet: PacketId) {
        self.server.on_network_arrival(packet);
        let process_at = self.now + SimTime::from_secs(self.server.process_delay_s);
        self.queue.insert(process_at, EventKind::ServerProcess { packet });
    }

    fn handle_server_process(&mut self, packet: PacketId) {
        let Some(copy) = self.server.take_processable(packet) else {
            return;
        };
        let Ok(idx) = self.node_index(copy.node) else {
            return;
        };
        let now = self.now;
        let node = &mut self.nodes[idx];
        self.server.process_copy(copy, node, now);
    }

    fn handle_mobility(&mut self, node_id: NodeId) {
        let Ok(idx) = self.node_index(node_id) else {
            return;
        };
        let Some(model) = self.mobility_model else {
            return;
        };
        if self.budget_reached() || !self.nodes[idx].alive {
            return;
        }
        if self.nodes[idx].in_flight {
            // Finish the frame first, then move.
            let at = self.nodes[idx].current_end_time.unwrap_or(self.now);
            self.queue.insert(at, EventKind::Mobility { node: node_id });
            return;
        }
        model.step(&mut self.nodes[idx], &mut self.mobility_rng);
        let next = self.now + SimTime::from_secs(model.step_s);
        self.queue.insert(next, EventKind::Mobility { node: node_id });
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Per-uplink records, in TX order.
    pub fn uplink_records(&self) -> &[UplinkRecord] {
        &self.records
    }

    /// The exported event trace, in dispatch order.
    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    /// Aggregate metrics of the run so far.
    pub fn metrics(&self) -> SimulationMetrics {
        let sent = self.packets_sent;
        let delivered = self.packets_delivered;
        let pdr = if sent > 0 {
            delivered as f64 / sent as f64
        } else {
            0.0
        };
        let sim_time_s = self.now.as_secs_f64();

        let mut sf_distribution = BTreeMap::new();
        let mut tx_power_distribution: BTreeMap<String, usize> = BTreeMap::new();
        let mut pdr_by_node = BTreeMap::new();
        let mut energy_by_node = BTreeMap::new();
        let mut energy_breakdown_by_node = BTreeMap::new();
        let mut airtime_by_node = BTreeMap::new();
        let mut pdr_by_class: BTreeMap<String, (u32, u32)> = BTreeMap::new();
        for node in &self.nodes {
            *sf_distribution.entry(node.sf).or_insert(0) += 1;
            *tx_power_distribution
                .entry(format!("{:.0}", node.tx_power_dbm))
                .or_insert(0) += 1;
            pdr_by_node.insert(node.id.0, node.pdr());
            energy_by_node.insert(node.id.0, node.energy_consumed_j);
            energy_breakdown_by_node.insert(
                node.id.0,
                node.energy
                    .breakdown()
                    .iter()
                    .map(|(k, v)| (format!("{k:?}").to_lowercase(), *v))
                    .collect(),
            );
            airtime_by_node.insert(node.id.0, node.total_airtime_s);
            let class = format!("{:?}", node.class);
            let entry = pdr_by_class.entry(class).or_insert((0, 0));
            entry.0 += node.rx_delivered;
            entry.1 += node.tx_attempted;
        }

        let mut pdr_by_sf = BTreeMap::new();
        for sf in 7..=12u8 {
            let (d, s) = self
                .records
                .iter()
                .filter(|r| r.sf == sf)
                .fold((0u64, 0u64), |(d, s), r| {
                    (
                        d + (r.result == Some(UplinkResult::Delivered)) as u64,
                        s + 1,
                    )
                });
            if s > 0 {
                pdr_by_sf.insert(sf, d as f64 / s as f64);
            }
        }

        let mut pdr_by_gateway = BTreeMap::new();
        for gw in &self.gateways {
            let credited = self
                .records
                .iter()
                .filter(|r| r.gateway == Some(gw.id))
                .count();
            pdr_by_gateway.insert(
                gw.id.0,
                if sent > 0 {
                    credited as f64 / sent as f64
                } else {
                    0.0
                },
            );
        }

        // Mean interval between actual TX starts.
        let mut interval_sum = 0.0;
        let mut interval_count = 0usize;
        for node in &self.nodes {
            let times: Vec<f64> = node.interval_log.iter().map(|r| r.tx_s).collect();
            for pair in times.windows(2) {
                interval_sum += pair[1] - pair[0];
                interval_count += 1;
            }
        }

        let energy_nodes_j: f64 = self.nodes.iter().map(|n| n.energy_consumed_j).sum();
        let energy_gateways_j: f64 = self.gateways.iter().map(|g| g.energy.total()).sum();

        SimulationMetrics {
            pdr,
            tx_attempted: sent,
            delivered,
            collisions: self.packets_lost_collision,
            no_coverage: self.packets_lost_no_coverage,
            duplicates: self.server.duplicate_packets,
            missed_downlinks: self.server.missed_downlinks,
            downlinks_sent: self.downlinks_sent,
            retransmissions: self.retransmissions,
            avg_delay_s: if delivered > 0 {
                self.total_delay_s / delivered as f64
            } else {
                0.0
            },
            avg_arrival_interval_s: if interval_count > 0 {
                interval_sum / interval_count as f64
            } else {
                0.0
            },
            throughput_bps: if sim_time_s > 0.0 {
                delivered as f64 * self.payload_size_bytes as f64 * 8.0 / sim_time_s
            } else {
                0.0
            },
            mean_snr_db: if delivered > 0 {
                self.delivered_snr_sum / delivered as f64
            } else {
                0.0
            },
            simulated_time_s: sim_time_s,
            energy_j: energy_nodes_j + energy_gateways_j,
            energy_nodes_j,
            energy_gateways_j,
            sf_distribution,
            tx_power_distribution,
            pdr_by_node,
            pdr_by_sf,
            pdr_by_gateway,
            pdr_by_class: pdr_by_class
                .into_iter()
                .map(|(k, (d, s))| (k, if s > 0 { d as f64 / s as f64 } else { 0.0 }))
                .collect(),
            energy_by_node,
            energy_breakdown_by_node,
            airtime_by_node,
        }
    }

}
