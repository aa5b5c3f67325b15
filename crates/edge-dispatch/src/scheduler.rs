//! `ProximityScheduler` and the `Scheduler` capability, grounded on
//! `original_source/ryu_ctrl/ProximityScheduler.py`.
//!
//! `SPEC_FULL.md` §9 replaces the original's dynamic `module.Class` loading
//! with a small name-keyed registry resolved once at start-up, matching the
//! `scheduler.class` field of the root configuration document.

use edge_core::{Dpid, Service};
use edge_manager::Edge;
use std::collections::HashMap;
use std::sync::Arc;

/// `(edge, deployed, ready)`, as produced by `ServiceManager::avail_servers`:
/// `deployed`/`ready` are 0 or 1.
pub type Candidate = (Arc<Edge>, u32, u32);

/// Chooses which edge should serve a `(dpid, service)` request given the
/// availability vector the service manager computed.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the winning candidate, or `None` if `candidates` is empty.
    fn schedule(&self, dpid: Dpid, service: &Service, candidates: &[Candidate]) -> Option<Candidate>;
}

/// Preference order: ready edges beat merely-deployed edges beat empty
/// edges; within a tier, the edge attached to the requesting switch wins.
/// Ties are broken by input order (first candidate of the winning tier that
/// is also local, else the first candidate of the winning tier).
#[derive(Debug, Default)]
pub struct ProximityScheduler;

impl ProximityScheduler {
    pub fn new() -> Self {
        Self
    }

    fn tier((_, deployed, ready): &Candidate) -> u8 {
        if *ready >= 1 {
            0
        } else if *deployed >= 1 {
            1
        } else {
            2
        }
    }
}

impl Scheduler for ProximityScheduler {
    fn name(&self) -> &str {
        "ProxScheduler"
    }

    fn schedule(&self, dpid: Dpid, _service: &Service, candidates: &[Candidate]) -> Option<Candidate> {
        let mut best: Option<&Candidate> = None;
        for candidate in candidates {
            best = Some(match best {
                None => candidate,
                Some(current) => {
                    let (current_tier, candidate_tier) = (Self::tier(current), Self::tier(candidate));
                    let candidate_is_better = candidate_tier < current_tier
                        || (candidate_tier == current_tier
                            && candidate.0.dpid() == dpid
                            && current.0.dpid() != dpid);
                    if candidate_is_better { candidate } else { current }
                }
            });
        }
        best.cloned()
    }
}

/// Name-keyed registry of scheduler implementations, resolved at start-up
/// from the root configuration's `scheduler.class` field (and, reserved for
/// a future per-edge override, each edge's own `scheduler` name).
pub struct SchedulerRegistry {
    schedulers: HashMap<String, Arc<dyn Scheduler>>,
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        let mut schedulers: HashMap<String, Arc<dyn Scheduler>> = HashMap::new();
        schedulers.insert("proximity".to_string(), Arc::new(ProximityScheduler::new()));
        Self { schedulers }
    }
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, scheduler: Arc<dyn Scheduler>) {
        self.schedulers.insert(name.into(), scheduler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_core::{Ipv4Addr, RouteTarget, SocketAddr4};

    fn edge(ip: &str, dpid: Dpid) -> Arc<Edge> {
        Arc::new(Edge::new(ip.parse().unwrap(), dpid, RouteTarget::Pod, Vec::new(), None))
    }

    fn service() -> Service {
        Service::new(SocketAddr4::new("203.0.113.9".parse::<Ipv4Addr>().unwrap(), 80), "at.aau.hostinfo")
    }

    #[test]
    fn prefers_ready_over_deployed_over_empty() {
        let scheduler = ProximityScheduler::new();
        let local = Dpid::short(1);
        let remote = Dpid::short(2);

        let candidates = vec![
            (edge("10.0.2.1", remote), 1, 0),
            (edge("10.0.3.1", local), 0, 0),
            (edge("10.0.4.1", remote), 1, 1),
        ];

        let (chosen, _, ready) = scheduler.schedule(local, &service(), &candidates).expect("a winner");
        assert_eq!(ready, 1);
        assert_eq!(chosen.ip, "10.0.4.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn prefers_local_within_a_tier() {
        let scheduler = ProximityScheduler::new();
        let local = Dpid::short(1);
        let remote = Dpid::short(2);

        let candidates = vec![(edge("10.0.2.1", remote), 1, 1), (edge("10.0.3.1", local), 1, 1)];

        let (chosen, _, _) = scheduler.schedule(local, &service(), &candidates).expect("a winner");
        assert_eq!(chosen.dpid(), local);
    }

    #[test]
    fn ties_keep_input_order() {
        let scheduler = ProximityScheduler::new();
        let remote = Dpid::short(2);
        let other = Dpid::short(3);

        let candidates = vec![(edge("10.0.2.1", remote), 0, 0), (edge("10.0.3.1", other), 0, 0)];

        let (chosen, _, _) = scheduler.schedule(Dpid::short(1), &service(), &candidates).expect("a winner");
        assert_eq!(chosen.ip, "10.0.2.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn empty_candidates_yield_none() {
        let scheduler = ProximityScheduler::new();
        assert!(scheduler.schedule(Dpid::short(1), &service(), &[]).is_none());
    }

    #[test]
    fn registry_resolves_the_builtin_proximity_scheduler() {
        let registry = SchedulerRegistry::new();
        assert!(registry.get("proximity").is_some());
        assert!(registry.get("nonexistent").is_none());
    }
}
