//! Binary sum tree over replay slots for proportional sampling.

use serde::{Deserialize, Serialize};

/// Array-backed complete binary tree; leaf `i` lives at `capacity + i` and
/// every inner node holds the sum of its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SumTree {
    capacity: usize,
    nodes: Vec<f64>,
}

impl SumTree {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            capacity,
            nodes: vec![0.0; 2 * capacity],
        }
    }

    pub fn total(&self) -> f64 {
        self.nodes[1]
    }

    pub fn get(&self, index: usize) -> f64 {
        self.nodes[self.capacity + index]
    }

    pub fn set(&mut self, index: usize, value: f64) {
        let mut node = self.capacity + index;
        self.nodes[node] = value;
        while node > 1 {
            node /= 2;
            self.nodes[node] = self.nodes[2 * node] + self.nodes[2 * node + 1];
        }
    }

    /// Leaf whose cumulative range contains `mass`. `mass` is clamped into
    /// `[0, total)` so rounding at the top end never walks off the tree.
    pub fn find(&self, mass: f64) -> usize {
        let mut mass = mass.clamp(0.0, self.total());
        let mut node = 1;
        while node < self.capacity {
            let left = 2 * node;
            if mass < self.nodes[left] || self.nodes[left + 1] <= 0.0 {
                node = left;
            } else {
                mass -= self.nodes[left];
                node = left + 1;
            }
        }
        node - self.capacity
    }
}
