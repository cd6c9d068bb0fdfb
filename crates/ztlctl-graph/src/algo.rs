//! Graph algorithms over index-based adjacency.
//!
//! petgraph 0.6 supplies the graph containers but none of the analytics the
//! engine needs, so PageRank, Louvain, Brandes betweenness, and Burt's
//! constraint are implemented here over plain adjacency lists. All functions
//! take the undirected projection unless noted.

use std::collections::VecDeque;

/// Undirected weighted adjacency: `adj[u] = [(v, weight), ...]`.
pub type Adjacency = Vec<Vec<(usize, f64)>>;

/// Spreading activation from a seed: BFS with multiplicative decay per hop.
///
/// Returns `(node, activation)` for every node reached within `max_depth`,
/// excluding the seed, strongest first.
pub fn spread_activation(adj: &Adjacency, seed: usize, decay: f64, max_depth: usize) -> Vec<(usize, f64)> {
    let mut depth = vec![usize::MAX; adj.len()];
    depth[seed] = 0;
    let mut queue = VecDeque::from([seed]);
    while let Some(u) = queue.pop_front() {
        if depth[u] >= max_depth {
            continue;
        }
        for &(v, _) in &adj[u] {
            if depth[v] == usize::MAX {
                depth[v] = depth[u] + 1;
                queue.push_back(v);
            }
        }
    }
    let mut out: Vec<(usize, f64)> = depth
        .iter()
        .enumerate()
        .filter(|&(v, &d)| v != seed && d != usize::MAX)
        .map(|(v, &d)| (v, decay.powi(d as i32)))
        .collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    out
}

/// Unweighted shortest path in the undirected projection, as node indices.
pub fn shortest_path(adj: &Adjacency, from: usize, to: usize) -> Option<Vec<usize>> {
    if from == to {
        return Some(vec![from]);
    }
    let mut prev = vec![usize::MAX; adj.len()];
    prev[from] = from;
    let mut queue = VecDeque::from([from]);
    while let Some(u) = queue.pop_front() {
        for &(v, _) in &adj[u] {
            if prev[v] == usize::MAX {
                prev[v] = u;
                if v == to {
                    let mut path = vec![to];
                    let mut cur = to;
                    while cur != from {
                        cur = prev[cur];
                        path.push(cur);
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(v);
            }
        }
    }
    None
}

/// Hop distance in the undirected projection, `None` when unreachable.
pub fn distance(adj: &Adjacency, from: usize, to: usize) -> Option<usize> {
    shortest_path(adj, from, to).map(|p| p.len() - 1)
}

/// Standard PageRank over the *directed* edge list.
///
/// `out_edges[u]` holds the targets of `u`. Dangling mass is redistributed
/// uniformly each iteration.
pub fn pagerank(out_edges: &[Vec<usize>], damping: f64, iterations: usize, tolerance: f64) -> Vec<f64> {
    let n = out_edges.len();
    if n == 0 {
        return Vec::new();
    }
    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];
    for _ in 0..iterations {
        let mut next = vec![(1.0 - damping) * uniform; n];
        let mut dangling = 0.0;
        for (u, targets) in out_edges.iter().enumerate() {
            if targets.is_empty() {
                dangling += rank[u];
                continue;
            }
            let share = damping * rank[u] / targets.len() as f64;
            for &v in targets {
                next[v] += share;
            }
        }
        let dangling_share = damping * dangling * uniform;
        for value in next.iter_mut() {
            *value += dangling_share;
        }
        let delta: f64 = rank.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < tolerance {
            break;
        }
    }
    rank
}

/// Louvain community detection on the undirected projection.
///
/// Returns a community id per node, renumbered densely from zero. A graph
/// with no edges yields singleton communities.
pub fn louvain(adj: &Adjacency) -> Vec<usize> {
    let n = adj.len();
    let mut membership: Vec<usize> = (0..n).collect();
    let mut level: Adjacency = adj.clone();

    loop {
        let (community, moved) = one_level(&level);
        let (dense, count) = dense_renumber(&community);
        for m in membership.iter_mut() {
            *m = dense[*m];
        }
        if !moved || count == level.len() {
            break;
        }
        // Collapse communities into a coarser weighted graph.
        let mut next: Adjacency = vec![Vec::new(); count];
        for (u, edges) in level.iter().enumerate() {
            for &(v, w) in edges {
                let (cu, cv) = (dense[u], dense[v]);
                match next[cu].iter_mut().find(|(t, _)| *t == cv) {
                    Some((_, total)) => *total += w,
                    None => next[cu].push((cv, w)),
                }
            }
        }
        level = next;
    }
    membership
}

/// One Louvain level: greedy local moving until no modularity gain.
///
/// Returns the community of every level node and whether any node moved.
fn one_level(level: &Adjacency) -> (Vec<usize>, bool) {
    let n = level.len();
    let mut community: Vec<usize> = (0..n).collect();
    let degree: Vec<f64> = level.iter().map(|edges| edges.iter().map(|(_, w)| w).sum()).collect();
    let two_m: f64 = degree.iter().sum();
    if two_m == 0.0 {
        return (community, false);
    }
    let mut community_total = degree.clone();
    let mut any_moved = false;

    loop {
        let mut moved_this_pass = false;
        for u in 0..n {
            let current = community[u];
            community_total[current] -= degree[u];

            // Weight from u into each neighboring community.
            let mut weight_to: Vec<(usize, f64)> = Vec::new();
            for &(v, w) in &level[u] {
                if v == u {
                    continue;
                }
                let c = community[v];
                match weight_to.iter_mut().find(|(cc, _)| *cc == c) {
                    Some((_, total)) => *total += w,
                    None => weight_to.push((c, w)),
                }
            }

            // Gain of staying is evaluated on the same footing as moving.
            let gain_of = |c: usize, w_in: f64| w_in - community_total[c] * degree[u] / two_m;
            let mut best = (
                current,
                weight_to
                    .iter()
                    .find(|(c, _)| *c == current)
                    .map(|&(c, w)| gain_of(c, w))
                    .unwrap_or(0.0),
            );
            for &(c, w_in) in &weight_to {
                let gain = gain_of(c, w_in);
                if gain > best.1 + 1e-12 {
                    best = (c, gain);
                }
            }

            community[u] = best.0;
            community_total[best.0] += degree[u];
            if best.0 != current {
                moved_this_pass = true;
                any_moved = true;
            }
        }
        if !moved_this_pass {
            break;
        }
    }
    (community, any_moved)
}

/// Map arbitrary ids to dense `0..count`; returns `(mapping, count)`.
fn dense_renumber(ids: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: Vec<(usize, usize)> = Vec::new();
    let dense = ids
        .iter()
        .map(|&id| match mapping.iter().find(|(old, _)| *old == id) {
            Some((_, d)) => *d,
            None => {
                let d = mapping.len();
                mapping.push((id, d));
                d
            }
        })
        .collect();
    (dense, mapping.len())
}

/// Brandes betweenness centrality on the undirected projection.
pub fn betweenness(adj: &Adjacency) -> Vec<f64> {
    let n = adj.len();
    let mut centrality = vec![0.0; n];
    for s in 0..n {
        let mut stack = Vec::new();
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0; n];
        let mut dist = vec![i64::MAX; n];
        sigma[s] = 1.0;
        dist[s] = 0;
        let mut queue = VecDeque::from([s]);
        while let Some(u) = queue.pop_front() {
            stack.push(u);
            for &(v, _) in &adj[u] {
                if dist[v] == i64::MAX {
                    dist[v] = dist[u] + 1;
                    queue.push_back(v);
                }
                if dist[v] == dist[u] + 1 {
                    sigma[v] += sigma[u];
                    predecessors[v].push(u);
                }
            }
        }
        let mut delta = vec![0.0; n];
        while let Some(w) = stack.pop() {
            for &p in &predecessors[w] {
                delta[p] += sigma[p] / sigma[w] * (1.0 + delta[w]);
            }
            if w != s {
                centrality[w] += delta[w];
            }
        }
    }
    // Undirected: every pair counted twice.
    for c in centrality.iter_mut() {
        *c /= 2.0;
    }
    centrality
}

/// Burt's constraint per node; lower constraint means a larger structural
/// hole around the node. Isolated nodes get `None`.
pub fn constraint(adj: &Adjacency) -> Vec<Option<f64>> {
    let n = adj.len();
    let strength: Vec<f64> = adj.iter().map(|edges| edges.iter().map(|(_, w)| w).sum()).collect();
    let p = |i: usize, j: usize| -> f64 {
        if strength[i] == 0.0 {
            return 0.0;
        }
        adj[i].iter().filter(|(v, _)| *v == j).map(|(_, w)| w).sum::<f64>() / strength[i]
    };
    (0..n)
        .map(|i| {
            if adj[i].is_empty() {
                return None;
            }
            let mut total = 0.0;
            for &(j, _) in &adj[i] {
                if j == i {
                    continue;
                }
                let mut indirect = 0.0;
                for &(q, _) in &adj[i] {
                    if q != i && q != j {
                        indirect += p(i, q) * p(q, j);
                    }
                }
                let c = (p(i, j) + indirect).powi(2);
                total += c;
            }
            Some(total)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Path graph 0-1-2-3 plus an isolated node 4.
    fn path_graph() -> Adjacency {
        let mut adj: Adjacency = vec![Vec::new(); 5];
        for (a, b) in [(0, 1), (1, 2), (2, 3)] {
            adj[a].push((b, 1.0));
            adj[b].push((a, 1.0));
        }
        adj
    }

    #[test]
    fn test_spread_activation_decays_per_hop() {
        let adj = path_graph();
        let hits = spread_activation(&adj, 0, 0.5, 3);
        assert_eq!(hits, vec![(1, 0.5), (2, 0.25), (3, 0.125)]);
        let capped = spread_activation(&adj, 0, 0.5, 1);
        assert_eq!(capped, vec![(1, 0.5)]);
    }

    #[test]
    fn test_shortest_path_and_distance() {
        let adj = path_graph();
        assert_eq!(shortest_path(&adj, 0, 3), Some(vec![0, 1, 2, 3]));
        assert_eq!(distance(&adj, 0, 3), Some(3));
        assert_eq!(distance(&adj, 0, 4), None);
        assert_eq!(distance(&adj, 2, 2), Some(0));
    }

    #[test]
    fn test_pagerank_sums_to_one_and_ranks_hubs() {
        // Star: 1,2,3 all point at 0.
        let out_edges = vec![vec![], vec![0], vec![0], vec![0]];
        let pr = pagerank(&out_edges, 0.85, 100, 1e-9);
        let total: f64 = pr.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(pr[0] > pr[1]);
        assert!((pr[1] - pr[2]).abs() < 1e-9);
    }

    #[test]
    fn test_betweenness_peaks_at_the_middle() {
        let adj = path_graph();
        let bc = betweenness(&adj);
        // Nodes 1 and 2 carry the through-traffic; endpoints carry none.
        assert!(bc[1] > bc[0]);
        assert!(bc[2] > bc[3]);
        assert_eq!(bc[4], 0.0);
    }

    #[test]
    fn test_louvain_separates_two_cliques() {
        // Two triangles joined by one bridge edge.
        let mut adj: Adjacency = vec![Vec::new(); 6];
        for (a, b) in [(0, 1), (1, 2), (0, 2), (3, 4), (4, 5), (3, 5), (2, 3)] {
            adj[a].push((b, 1.0));
            adj[b].push((a, 1.0));
        }
        let communities = louvain(&adj);
        assert_eq!(communities[0], communities[1]);
        assert_eq!(communities[1], communities[2]);
        assert_eq!(communities[3], communities[4]);
        assert_eq!(communities[4], communities[5]);
        assert_ne!(communities[0], communities[3]);
    }

    #[test]
    fn test_louvain_on_edgeless_graph_is_singletons() {
        let adj: Adjacency = vec![Vec::new(); 3];
        let communities = louvain(&adj);
        assert_eq!(communities.len(), 3);
        let mut unique = communities.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_constraint_lowest_at_broker() {
        // Node 0 bridges two otherwise disconnected pairs: 0-1, 0-2, 1 and 2
        // not connected; plus a tight triangle 3-4-5 for contrast.
        let mut adj: Adjacency = vec![Vec::new(); 6];
        for (a, b) in [(0, 1), (0, 2), (3, 4), (4, 5), (3, 5)] {
            adj[a].push((b, 1.0));
            adj[b].push((a, 1.0));
        }
        let c = constraint(&adj);
        let broker = c[0].unwrap();
        let clique_member = c[3].unwrap();
        assert!(broker < clique_member);
    }
}
