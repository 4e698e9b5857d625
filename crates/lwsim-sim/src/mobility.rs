//! Waypoint mobility.
//!
//! Nodes pick a random waypoint and speed, walk towards it step by step,
//! and pick a new one on arrival. Moves are deferred while a node is
//! transmitting; the simulator reschedules them after the frame ends.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use lwsim_common::Position;

use crate::node::{MobilityState, Node};

/// Smooth random-waypoint model over the square deployment area.
#[derive(Debug, Clone, Copy)]
pub struct SmoothMobility {
    pub area_size_m: f64,
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
    /// Seconds between mobility steps.
    pub step_s: f64,
}

impl SmoothMobility {
    pub fn new(area_size_m: f64, min_speed_mps: f64, max_speed_mps: f64, step_s: f64) -> Self {
        SmoothMobility {
            area_size_m,
            min_speed_mps,
            max_speed_mps,
            step_s,
        }
    }

    /// Give a node its first waypoint.
    pub fn assign(&self, node: &mut Node, rng: &mut ChaCha8Rng) {
        node.mobility = Some(self.draw_state(rng));
    }

    /// Advance a node by one step towards its waypoint.
    pub fn step(&self, node: &mut Node, rng: &mut ChaCha8Rng) {
        let Some(state) = node.mobility.clone() else {
            return;
        };
        let dx = state.target.x - node.position.x;
        let dy = state.target.y - node.position.y;
        let distance = (dx * dx + dy * dy).sqrt();
        let travel = state.speed_mps * self.step_s;

        if distance <= travel || distance < 1e-9 {
            node.position.x = state.target.x;
            node.position.y = state.target.y;
            node.mobility = Some(self.draw_state(rng));
        } else {
            node.position.x += dx / distance * travel;
            node.position.y += dy / distance * travel;
        }
    }

    fn draw_state(&self, rng: &mut ChaCha8Rng) -> MobilityState {
        MobilityState {
            target: Position::new(
                rng.gen::<f64>() * self.area_size_m,
                rng.gen::<f64>() * self.area_size_m,
            ),
            speed_mps: self.min_speed_mps
                + rng.gen::<f64>() * (self.max_speed_mps - self.min_speed_mps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwsim_common::NodeId;
    use lwsim_model::DeviceClass;
    use rand::SeedableRng;

    fn node() -> Node {
        Node::new(
            NodeId(1),
            Position::new(500.0, 500.0),
            7,
            14.0,
            DeviceClass::A,
            lwsim_phy::energy::reference_profile(),
            None,
            0.0,
        )
    }

    #[test]
    fn step_moves_at_most_speed_times_step() {
        let model = SmoothMobility::new(1000.0, 2.0, 10.0, 60.0);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut n = node();
        model.assign(&mut n, &mut rng);
        let before = n.position;
        let speed = n.mobility.as_ref().unwrap().speed_mps;
        model.step(&mut n, &mut rng);
        let moved = before.distance_to(&n.position);
        assert!(moved <= speed * 60.0 + 1e-9);
        assert!(moved > 0.0);
    }

    #[test]
    fn node_stays_inside_the_area() {
        let model = SmoothMobility::new(1000.0, 2.0, 10.0, 60.0);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut n = node();
        model.assign(&mut n, &mut rng);
        for _ in 0..500 {
            model.step(&mut n, &mut rng);
            assert!((0.0..=1000.0).contains(&n.position.x));
            assert!((0.0..=1000.0).contains(&n.position.y));
        }
    }

    #[test]
    fn reaching_the_waypoint_draws_a_new_one() {
        let model = SmoothMobility::new(1000.0, 5.0, 5.0, 60.0);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut n = node();
        n.mobility = Some(MobilityState {
            target: Position::new(500.0, 501.0),
            speed_mps: 5.0,
        });
        model.step(&mut n, &mut rng);
        // Arrived (1 m away, 300 m of travel) and re-targeted.
        assert_eq!(n.position.y, 501.0);
        let new_target = n.mobility.as_ref().unwrap().target;
        assert!(new_target.x != 500.0 || new_target.y != 501.0);
    }
}
