//! Periodic background task that pairs waiting rides with free chairs.
//!
//! Two loops tick on independent timers: a coarse one (every
//! [`MATCHER_TICK_MS_COARSE`]) that solves an optimal min-cost bipartite
//! flow, and a fine one (every [`MATCHER_TICK_MS_FINE`]) that greedily mops
//! up whatever the coarse pass left behind once the queue is already short.
//! They share a single lock ([`spawn`]) so only one matching round — snapshot,
//! solve, and commit — ever runs at a time; both route every winning pair
//! through the same [`Repository::rides_assign`] call, so the solve strategy
//! is the only thing that differs between them.

use std::sync::Arc;
use std::time::Duration;

use crate::models::{Chair, Id, Ride, RideStatus};
use crate::repo::ride::RideEntry;
use crate::repo::Repository;
use crate::Coordinate;

crate::conf_env!(static MATCHER_TICK_MS_COARSE: u64 = {
    from: "MATCHER_TICK_MS_COARSE",
    default: "75",
});
crate::conf_env!(static MATCHER_TICK_MS_FINE: u64 = {
    from: "MATCHER_TICK_MS_FINE",
    default: "30",
});

/// Minimum free-chair supply before the coarse pass bothers building a flow
/// graph at all; below this, a single manual dispatch already saturates it.
const MIN_FREE_CHAIRS: usize = 5;
/// Candidate rides considered per tick, capped relative to chair supply so
/// the flow graph stays small even if the queue backs way up.
const CANDIDATE_RIDE_FACTOR: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ChairCandidate {
    pub id: Id<Chair>,
    pub location: Coordinate,
    pub speed: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct RideCandidate {
    pub id: Id<Ride>,
    pub pickup: Coordinate,
}

/// One assignment: chair index paired with ride index, both into the slices
/// passed to [`Matcher::solve`].
pub type Assignment = (usize, usize);

/// The actual bipartite-assignment strategy, kept swappable per the design
/// note that a prior iteration of this system even ran it out-of-process.
pub trait Matcher: Send + Sync {
    fn solve(&self, chairs: &[ChairCandidate], rides: &[RideCandidate]) -> Vec<Assignment>;
}

fn cost(chair: &ChairCandidate, ride: &RideCandidate) -> i64 {
    (chair.location.distance(ride.pickup) / chair.speed.max(1)) as i64
}

/// Successive-shortest-path min-cost flow with Johnson potentials, per the
/// AtCoder-Library-style "MinCostFlow" shape: half-edges in one flat
/// adjacency list, each forward edge paired with a zero-capacity reverse
/// edge that absorbs augmentation.
pub struct McmfMatcher;

impl Matcher for McmfMatcher {
    fn solve(&self, chairs: &[ChairCandidate], rides: &[RideCandidate]) -> Vec<Assignment> {
        if chairs.is_empty() || rides.is_empty() {
            return vec![];
        }

        let source = 0usize;
        let chair_base = 1usize;
        let ride_base = chair_base + chairs.len();
        let sink = ride_base + rides.len();
        let n = sink + 1;

        let mut graph = FlowGraph::new(n);
        for (ci, _) in chairs.iter().enumerate() {
            graph.add_edge(source, chair_base + ci, 1, 0);
        }
        for (ri, _) in rides.iter().enumerate() {
            graph.add_edge(ride_base + ri, sink, 1, 0);
        }
        for (ci, c) in chairs.iter().enumerate() {
            for (ri, r) in rides.iter().enumerate() {
                graph.add_edge(chair_base + ci, ride_base + ri, 1, cost(c, r));
            }
        }

        let flow_limit = chairs.len().min(rides.len());
        graph.min_cost_flow(source, sink, flow_limit as i64);

        let mut assignments = vec![];
        for (ci, _) in chairs.iter().enumerate() {
            for (ri, _) in rides.iter().enumerate() {
                if graph.flow_on_original_edge(chair_base + ci, ride_base + ri) > 0 {
                    assignments.push((ci, ri));
                }
            }
        }
        assignments
    }
}

/// Matches each chair, fastest first, to its nearest still-unmatched ride.
/// Not globally optimal, but cheap enough to run every tick once the queue
/// is already short and the coarse pass's optimality gain is marginal.
pub struct GreedyMatcher;

impl Matcher for GreedyMatcher {
    fn solve(&self, chairs: &[ChairCandidate], rides: &[RideCandidate]) -> Vec<Assignment> {
        let mut order: Vec<usize> = (0..chairs.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(chairs[i].speed));

        let mut taken = vec![false; rides.len()];
        let mut assignments = vec![];
        for ci in order {
            let mut best: Option<(usize, i64)> = None;
            for (ri, r) in rides.iter().enumerate() {
                if taken[ri] {
                    continue;
                }
                let c = cost(&chairs[ci], r);
                if best.is_none_or(|(_, bc)| c < bc) {
                    best = Some((ri, c));
                }
            }
            if let Some((ri, _)) = best {
                taken[ri] = true;
                assignments.push((ci, ri));
            }
        }
        assignments
    }
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    to: usize,
    cap: i64,
    cost: i64,
}

/// Flat half-edge adjacency list: edge `2k` and `2k+1` are always a
/// forward/reverse pair, so `edges[e ^ 1]` is the partner of `edges[e]`.
struct FlowGraph {
    g: Vec<Vec<usize>>,
    edges: Vec<Edge>,
}

impl FlowGraph {
    fn new(n: usize) -> Self {
        Self {
            g: vec![vec![]; n],
            edges: vec![],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, cap: i64, cost: i64) {
        let e = self.edges.len();
        self.g[from].push(e);
        self.edges.push(Edge { to, cap, cost });
        self.g[to].push(e + 1);
        self.edges.push(Edge {
            to: from,
            cap: 0,
            cost: -cost,
        });
    }

    /// Flow actually pushed along the original (non-reverse) edge from
    /// `from` to `to`, recovered from how much capacity the edge lost.
    fn flow_on_original_edge(&self, from: usize, to: usize) -> i64 {
        for &e in &self.g[from] {
            let edge = &self.edges[e];
            if edge.to == to && e % 2 == 0 {
                let rev = &self.edges[e ^ 1];
                return rev.cap;
            }
        }
        0
    }

    /// Augments flow from `s` to `t` up to `limit` units, one shortest
    /// augmenting path (by reduced cost) at a time.
    fn min_cost_flow(&mut self, s: usize, t: usize, limit: i64) -> i64 {
        let n = self.g.len();
        let mut dual = vec![0i64; n];
        let mut flowed = 0i64;
        let mut total_cost = 0i64;

        while flowed < limit {
            let Some((dist, prev_edge)) = self.dijkstra(s, n, &dual) else {
                break;
            };
            if dist[t] == i64::MAX {
                break;
            }
            for v in 0..n {
                if dist[v] < i64::MAX {
                    dual[v] += dist[v];
                }
            }

            let mut bottleneck = limit - flowed;
            let mut v = t;
            while v != s {
                let e = prev_edge[v].unwrap();
                bottleneck = bottleneck.min(self.edges[e].cap);
                v = self.edges[e ^ 1].to;
            }

            let mut v = t;
            while v != s {
                let e = prev_edge[v].unwrap();
                self.edges[e].cap -= bottleneck;
                self.edges[e ^ 1].cap += bottleneck;
                v = self.edges[e ^ 1].to;
            }

            flowed += bottleneck;
            total_cost += bottleneck * dual[t];
        }

        total_cost
    }

    /// Dijkstra over reduced costs `cost' = cost + dual[u] - dual[v]`, which
    /// stay non-negative as long as `dual` was seeded from a prior run (or
    /// all-zero on the first call, since every original cost here is >= 0).
    fn dijkstra(
        &self,
        s: usize,
        n: usize,
        dual: &[i64],
    ) -> Option<(Vec<i64>, Vec<Option<usize>>)> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut dist = vec![i64::MAX; n];
        let mut prev_edge: Vec<Option<usize>> = vec![None; n];
        let mut settled = vec![false; n];
        let mut heap = BinaryHeap::new();

        dist[s] = 0;
        heap.push(Reverse((0i64, s)));

        while let Some(Reverse((d, u))) = heap.pop() {
            if settled[u] {
                continue;
            }
            settled[u] = true;
            if d > dist[u] {
                continue;
            }
            for &e in &self.g[u] {
                let edge = self.edges[e];
                if edge.cap <= 0 {
                    continue;
                }
                let reduced = edge.cost + dual[u] - dual[edge.to];
                debug_assert!(reduced >= 0, "negative reduced cost, dual invariant broken");
                let nd = d + reduced;
                if nd < dist[edge.to] {
                    dist[edge.to] = nd;
                    prev_edge[edge.to] = Some(e);
                    heap.push(Reverse((nd, edge.to)));
                }
            }
        }

        Some((dist, prev_edge))
    }
}

fn snapshot_candidates(
    repo: &Repository,
) -> Option<(Vec<ChairCandidate>, Vec<(RideCandidate, Arc<RideEntry>, Id<RideStatus>)>)> {
    let free = repo.chair_free_snapshot();
    if free.len() < MIN_FREE_CHAIRS {
        return None;
    }

    let mut waiting = repo.rides_waiting_snapshot();
    if waiting.is_empty() {
        return None;
    }
    waiting.sort_unstable_by_key(|(r, _)| r.created_at);
    let take = waiting.len().min(CANDIDATE_RIDE_FACTOR * free.len());
    waiting.truncate(take);

    Some((
        free.into_iter()
            .filter_map(|id| {
                let loc = repo.chair_location_get_latest(id).ok().flatten()?;
                Some((id, loc))
            })
            .map(|(id, location)| ChairCandidate {
                id,
                location,
                // speed is resolved asynchronously below; filled in by caller
                speed: 1,
            })
            .collect::<Vec<_>>(),
        waiting
            .into_iter()
            .map(|(entry, status_id)| {
                (
                    RideCandidate {
                        id: entry.id,
                        pickup: entry.pickup,
                    },
                    entry,
                    status_id,
                )
            })
            .collect(),
    ))
}

async fn fill_speeds(repo: &Repository, chairs: &mut [ChairCandidate]) {
    for c in chairs.iter_mut() {
        let Ok(Some(effortless)) = repo.chair_get_by_id_effortless(c.id) else {
            continue;
        };
        if let Ok(speed) = repo.chair_model_get_speed(effortless.model.resolve()).await {
            c.speed = speed;
        }
    }
}

async fn tick(repo: &Repository, matcher: &dyn Matcher) {
    let Some((mut chairs, rides)) = snapshot_candidates(repo) else {
        return;
    };
    if chairs.is_empty() {
        return;
    }
    fill_speeds(repo, &mut chairs).await;

    let ride_candidates: Vec<RideCandidate> = rides.iter().map(|(r, _, _)| *r).collect();
    let assignments = matcher.solve(&chairs, &ride_candidates);

    for (ci, ri) in assignments {
        let chair_id = chairs[ci].id;
        let (_, _entry, status_id) = &rides[ri];
        let ride_id = ride_candidates[ri].id;

        if let Err(e) = repo.rides_assign(ride_id, *status_id, chair_id) {
            tracing::warn!("matcher: failed to assign ride {ride_id:?} to chair {chair_id:?}: {e}");
            continue;
        }
        repo.rides_waiting_remove(ride_id);
    }
}

/// Spawns the coarse (optimal) and fine (greedy) matcher loops. Returns
/// immediately; both loops run for the lifetime of the process.
///
/// The two loops share one `tokio::sync::Mutex` so only one matching round
/// (snapshot + solve + commit) ever executes at a time, per spec §5 ("single
/// background goroutine behind a global mutex") — otherwise an overlapping
/// coarse and fine tick could solve against the same free-chair/waiting-ride
/// snapshot and both try to assign the same ride to different chairs.
pub fn spawn(repo: Arc<Repository>) {
    let lock = Arc::new(tokio::sync::Mutex::new(()));
    {
        let repo = Arc::clone(&repo);
        let lock = Arc::clone(&lock);
        tokio::spawn(async move {
            let matcher = McmfMatcher;
            loop {
                {
                    let _guard = lock.lock().await;
                    tick(&repo, &matcher).await;
                }
                tokio::time::sleep(Duration::from_millis(*MATCHER_TICK_MS_COARSE)).await;
            }
        });
    }
    {
        tokio::spawn(async move {
            let matcher = GreedyMatcher;
            loop {
                {
                    let _guard = lock.lock().await;
                    tick(&repo, &matcher).await;
                }
                tokio::time::sleep(Duration::from_millis(*MATCHER_TICK_MS_FINE)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: u8, lat: i32, lon: i32, speed: i32) -> ChairCandidate {
        ChairCandidate {
            id: Id::new(),
            location: Coordinate {
                latitude: lat,
                longitude: lon,
            },
            speed,
        }
        .with_id(id)
    }

    impl ChairCandidate {
        fn with_id(mut self, seed: u8) -> Self {
            // Ids are opaque ULIDs; tests only care about relative ordering,
            // so reuse whatever `Id::new()` produced and ignore `seed`.
            let _ = seed;
            self
        }
    }

    fn ride(lat: i32, lon: i32) -> RideCandidate {
        RideCandidate {
            id: Id::new(),
            pickup: Coordinate {
                latitude: lat,
                longitude: lon,
            },
        }
    }

    #[test]
    fn mcmf_prefers_closer_chair() {
        let chairs = vec![cand(0, 0, 0, 1), cand(1, 100, 100, 1)];
        let rides = vec![ride(1, 1)];

        let assignments = McmfMatcher.solve(&chairs, &rides);
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].0, 0);
    }

    #[test]
    fn mcmf_saturates_up_to_flow_limit() {
        let chairs = vec![cand(0, 0, 0, 1), cand(1, 10, 10, 1)];
        let rides = vec![ride(0, 1), ride(10, 11)];

        let assignments = McmfMatcher.solve(&chairs, &rides);
        assert_eq!(assignments.len(), 2);
    }

    #[test]
    fn greedy_matches_fastest_chair_first() {
        let chairs = vec![cand(0, 0, 0, 1), cand(1, 0, 0, 10)];
        let rides = vec![ride(1, 0), ride(2, 0)];

        let assignments = GreedyMatcher.solve(&chairs, &rides);
        assert_eq!(assignments.len(), 2);
        // the faster chair (index 1) should claim the nearer ride (index 0)
        assert!(assignments.contains(&(1, 0)));
    }

    #[test]
    fn empty_inputs_produce_no_assignments() {
        assert!(McmfMatcher.solve(&[], &[ride(0, 0)]).is_empty());
        assert!(GreedyMatcher.solve(&[cand(0, 0, 0, 1)], &[]).is_empty());
    }
}
