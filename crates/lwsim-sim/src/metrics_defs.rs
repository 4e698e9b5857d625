//! Metric definitions emitted by the engine.
//!
//! Names follow the `lwsim.<subsystem>.<metric>` convention; the runner
//! installs a recorder and exports snapshots at the end of a run.

/// A metric definition: name and help text.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub help: &'static str,
}

/// Uplinks started (TX_START dispatched).
pub const UPLINKS_SENT: MetricDef = MetricDef {
    name: "lwsim.uplinks.sent",
    help: "Uplink transmissions started",
};

/// Uplinks received by at least one gateway.
pub const UPLINKS_DELIVERED: MetricDef = MetricDef {
    name: "lwsim.uplinks.delivered",
    help: "Uplinks delivered to the server via at least one gateway",
};

/// Uplinks heard but lost to collisions or decoding.
pub const UPLINKS_COLLIDED: MetricDef = MetricDef {
    name: "lwsim.uplinks.collided",
    help: "Uplinks lost to co-channel collisions",
};

/// Uplinks no gateway could hear.
pub const UPLINKS_NO_COVERAGE: MetricDef = MetricDef {
    name: "lwsim.uplinks.no_coverage",
    help: "Uplinks below every gateway's thresholds",
};

/// Downlinks emitted by gateways.
pub const DOWNLINKS_SENT: MetricDef = MetricDef {
    name: "lwsim.downlinks.sent",
    help: "Downlink transmissions emitted",
};

/// Downlinks that could not be placed in a window.
pub const DOWNLINKS_MISSED: MetricDef = MetricDef {
    name: "lwsim.downlinks.missed",
    help: "Downlinks that missed every receive window",
};

/// SNIR of delivered uplinks, dB.
pub const UPLINK_SNR: MetricDef = MetricDef {
    name: "lwsim.uplink.snr_db",
    help: "SNIR of delivered uplinks in dB",
};

/// All metric definitions, for `lwsim metrics` style listings.
pub const ALL: &[MetricDef] = &[
    UPLINKS_SENT,
    UPLINKS_DELIVERED,
    UPLINKS_COLLIDED,
    UPLINKS_NO_COVERAGE,
    DOWNLINKS_SENT,
    DOWNLINKS_MISSED,
    UPLINK_SNR,
];
