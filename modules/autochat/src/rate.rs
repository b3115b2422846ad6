use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::types::RouteHandle;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute send budgets, global and per sending route.
/// A limit of 0 disables that budget.
#[derive(Debug)]
pub struct SendRateLimiter {
    global_per_min: u32,
    per_route_per_min: u32,
    global: VecDeque<Instant>,
    per_route: HashMap<RouteHandle, VecDeque<Instant>>,
}

impl SendRateLimiter {
    pub fn new(global_per_min: u32, per_route_per_min: u32) -> Self {
        Self {
            global_per_min,
            per_route_per_min,
            global: VecDeque::new(),
            per_route: HashMap::new(),
        }
    }

    pub fn try_acquire(&mut self, route: &RouteHandle) -> bool {
        self.try_acquire_at(route, Instant::now())
    }

    /// Consume one send from both budgets if both have room.
    pub fn try_acquire_at(&mut self, route: &RouteHandle, now: Instant) -> bool {
        prune(&mut self.global, now);
        let route_window = self.per_route.entry(*route).or_default();
        prune(route_window, now);

        if self.global_per_min > 0 && self.global.len() >= self.global_per_min as usize {
            return false;
        }
        if self.per_route_per_min > 0 && route_window.len() >= self.per_route_per_min as usize {
            return false;
        }

        self.global.push_back(now);
        route_window.push_back(now);
        true
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}
