// Translation graph over synchronized receiver pairs. Vertices are live
// receivers, edges are publishable pair filters; Dijkstra composes offset
// translations through intermediate receivers when no direct pair exists.

use std::collections::HashMap;

use crate::constants::{GRAPH_EDGE_CUTOFF, GRAPH_HOP_PENALTY, GRAPH_PATH_CEILING};
use crate::errors::{CoreError, Result};

use super::pair::ClockPair;

/// Point-in-time linear model of one pair, detached from the filter so the
/// graph can be handed to solver workers as an immutable snapshot.
#[derive(Debug, Clone, Copy)]
struct Edge {
    offset: f64,
    rate: f64,
    t_ref: f64,
    weight: f64,
}

/// A timestamp translated into another receiver's timebase, with the
/// variance accumulated along the path.
#[derive(Debug, Clone, Copy)]
pub struct Translated {
    pub t: f64,
    pub variance: f64,
}

#[derive(Debug, Default, Clone)]
pub struct ClockGraph {
    edges: HashMap<(usize, usize), Edge>,
    adj: HashMap<usize, Vec<usize>>,
}

impl ClockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the current pair filters. Pairs below the maturity or
    /// above the jitter cutoff do not become edges.
    pub fn rebuild<'a>(&mut self, pairs: impl Iterator<Item = &'a ClockPair>) {
        self.edges.clear();
        self.adj.clear();
        for pair in pairs {
            let jitter_var = pair.jitter() * pair.jitter();
            if !pair.publishable() || jitter_var > GRAPH_EDGE_CUTOFF {
                continue;
            }
            self.edges.insert(
                (pair.base, pair.peer),
                Edge {
                    offset: pair.offset(),
                    rate: pair.rate(),
                    t_ref: pair.last_t_base(),
                    weight: jitter_var + GRAPH_HOP_PENALTY,
                },
            );
            self.adj.entry(pair.base).or_default().push(pair.peer);
            self.adj.entry(pair.peer).or_default().push(pair.base);
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.adj.keys().copied()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, uid: usize) -> bool {
        self.adj.contains_key(&uid)
    }

    /// Translate a session-timebase timestamp from one receiver's frame to
    /// another's, composing pair models along the lowest-variance path.
    pub fn translate(&self, t: f64, from: usize, to: usize) -> Result<Translated> {
        if from == to {
            return Ok(Translated { t, variance: 0.0 });
        }
        let path = self.shortest_path(from, to)?;

        let mut out = t;
        let mut variance = 0.0;
        for hop in path.windows(2) {
            let (a, b) = (hop[0], hop[1]);
            let (key, forward) = if a < b { ((a, b), true) } else { ((b, a), false) };
            let e = self.edges.get(&key).expect("path uses existing edges");
            out = if forward {
                // base -> peer
                out + e.offset + e.rate * (out - e.t_ref)
            } else {
                // peer -> base
                (out - e.offset + e.rate * e.t_ref) / (1.0 + e.rate)
            };
            variance += e.weight;
        }
        Ok(Translated { t: out, variance })
    }

    /// Variance of translating across a pair without doing it.
    pub fn expected_variance(&self, from: usize, to: usize) -> Result<f64> {
        if from == to {
            return Ok(0.0);
        }
        let (dist, _) = self.dijkstra(from);
        match dist.get(&to) {
            Some(&v) if v <= GRAPH_PATH_CEILING => Ok(v),
            _ => Err(CoreError::NoSyncPath { from, to }),
        }
    }

    /// The best-connected receiver: reaches the most peers with the lowest
    /// summed path variance; ties break to the lowest uid.
    pub fn anchor(&self) -> Option<usize> {
        let mut nodes: Vec<usize> = self.adj.keys().copied().collect();
        nodes.sort_unstable();

        let mut best: Option<(usize, f64, usize)> = None; // (reach, sum, uid)
        for &uid in &nodes {
            let (dist, _) = self.dijkstra(uid);
            let reach = dist.len() - 1;
            let sum: f64 = dist.values().sum();
            let better = match best {
                None => true,
                Some((r, s, _)) => reach > r || (reach == r && sum < s),
            };
            if better {
                best = Some((reach, sum, uid));
            }
        }
        best.map(|(_, _, uid)| uid)
    }

    fn shortest_path(&self, from: usize, to: usize) -> Result<Vec<usize>> {
        let (dist, prev) = self.dijkstra(from);
        match dist.get(&to) {
            Some(&v) if v <= GRAPH_PATH_CEILING => {}
            _ => return Err(CoreError::NoSyncPath { from, to }),
        }

        let mut path = vec![to];
        let mut cur = to;
        while cur != from {
            cur = *prev.get(&cur).ok_or(CoreError::NoSyncPath { from, to })?;
            path.push(cur);
        }
        path.reverse();
        Ok(path)
    }

    /// Plain O(V^2) Dijkstra; receiver graphs are small.
    fn dijkstra(&self, from: usize) -> (HashMap<usize, f64>, HashMap<usize, usize>) {
        let mut dist: HashMap<usize, f64> = HashMap::new();
        let mut prev: HashMap<usize, usize> = HashMap::new();
        let mut done: HashMap<usize, bool> = HashMap::new();

        if !self.adj.contains_key(&from) {
            dist.insert(from, 0.0);
            return (dist, prev);
        }
        dist.insert(from, 0.0);

        loop {
            let next = dist
                .iter()
                .filter(|(uid, _)| !done.get(*uid).copied().unwrap_or(false))
                .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(&uid, &d)| (uid, d));
            let Some((u, du)) = next else { break };
            done.insert(u, true);

            for &v in self.adj.get(&u).into_iter().flatten() {
                let key = if u < v { (u, v) } else { (v, u) };
                let w = self.edges[&key].weight;
                let alt = du + w;
                if alt < dist.get(&v).copied().unwrap_or(f64::INFINITY) {
                    dist.insert(v, alt);
                    prev.insert(v, u);
                }
            }
        }

        (dist, prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::pair::PairObservation;

    /// Converge a pair to the given constant offset and rate.
    fn made_pair(base: usize, peer: usize, offset: f64, rate: f64) -> ClockPair {
        let mut pair = ClockPair::new(base, peer, 0.0);
        for i in 0..20 {
            let t = i as f64 * 0.5;
            let obs = PairObservation { z: offset + rate * t, var: 1e-14, t_base: t };
            assert!(pair.update(&obs, t));
        }
        pair
    }

    fn graph_of(pairs: &[ClockPair]) -> ClockGraph {
        let mut g = ClockGraph::new();
        g.rebuild(pairs.iter());
        g
    }

    #[test]
    fn identity_translation() {
        let g = graph_of(&[made_pair(1, 2, 1e-3, 0.0)]);
        let t = g.translate(123.456, 1, 1).unwrap();
        assert_eq!(t.t, 123.456);
        assert_eq!(t.variance, 0.0);
    }

    #[test]
    fn direct_edge_translation() {
        let g = graph_of(&[made_pair(1, 2, 2e-3, 0.0)]);
        let t = g.translate(9.5, 1, 2).unwrap();
        assert!((t.t - (9.5 + 2e-3)).abs() < 1e-9);

        // And back.
        let back = g.translate(t.t, 2, 1).unwrap();
        assert!((back.t - 9.5).abs() < 1e-9);
    }

    #[test]
    fn composition_matches_two_hops() {
        let ab = made_pair(1, 2, 1.5e-3, 3e-6);
        let bc = made_pair(2, 3, -0.7e-3, -2e-6);
        let g = graph_of(&[ab, bc]);

        let t = 10.25;
        let direct = g.translate(t, 1, 3).unwrap();
        let via_b = g.translate(t, 1, 2).unwrap();
        let stepped = g.translate(via_b.t, 2, 3).unwrap();

        let tol = (direct.variance + via_b.variance + stepped.variance).sqrt();
        assert!((direct.t - stepped.t).abs() <= tol.max(1e-9));
        assert!((direct.variance - (via_b.variance + stepped.variance)).abs() < 1e-18);
    }

    #[test]
    fn no_path_is_an_error() {
        let g = graph_of(&[made_pair(1, 2, 0.0, 0.0)]);
        assert!(matches!(
            g.translate(1.0, 1, 9),
            Err(CoreError::NoSyncPath { from: 1, to: 9 })
        ));
        assert!(g.expected_variance(1, 9).is_err());
    }

    #[test]
    fn immature_pairs_are_not_edges() {
        let mut young = ClockPair::new(1, 2, 0.0);
        let obs = PairObservation { z: 0.0, var: 1e-14, t_base: 0.0 };
        young.update(&obs, 0.0);
        let g = graph_of(&[young]);
        assert_eq!(g.num_edges(), 0);
    }

    #[test]
    fn anchor_prefers_center_of_star() {
        // 2 is connected to everyone; 1, 3, 4 only to 2.
        let g = graph_of(&[
            made_pair(1, 2, 0.0, 0.0),
            made_pair(2, 3, 0.0, 0.0),
            made_pair(2, 4, 0.0, 0.0),
        ]);
        assert_eq!(g.anchor(), Some(2));
    }

    #[test]
    fn anchor_tie_breaks_by_uid() {
        // Symmetric triangle: all nodes equivalent, lowest uid wins.
        let g = graph_of(&[
            made_pair(1, 2, 0.0, 0.0),
            made_pair(2, 3, 0.0, 0.0),
            made_pair(1, 3, 0.0, 0.0),
        ]);
        assert_eq!(g.anchor(), Some(1));
    }
}
