//! Dinic max-flow on a graph with terminal links, as used by graph-cut
//! segmentation.

use std::collections::VecDeque;

const EPS: f64 = 1e-9;

/// Flow network of `n` pixel nodes plus an implicit source and sink
#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: usize,
    adjacency: Vec<Vec<usize>>,
    to: Vec<usize>,
    capacity: Vec<f64>,
    level: Vec<i32>,
}

impl FlowGraph {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            adjacency: vec![Vec::new(); nodes + 2],
            to: Vec::new(),
            capacity: Vec::new(),
            level: Vec::new(),
        }
    }

    fn source(&self) -> usize {
        self.nodes
    }

    fn sink(&self) -> usize {
        self.nodes + 1
    }

    fn add_arc_pair(&mut self, u: usize, v: usize, forward: f64, backward: f64) {
        let e = self.to.len();
        self.to.push(v);
        self.capacity.push(forward);
        self.adjacency[u].push(e);
        self.to.push(u);
        self.capacity.push(backward);
        self.adjacency[v].push(e + 1);
    }

    /// Terminal links: capacity from the source into `node` and from
    /// `node` into the sink
    pub fn add_terminal_weights(&mut self, node: usize, from_source: f64, to_sink: f64) {
        let (s, t) = (self.source(), self.sink());
        if from_source > 0.0 {
            self.add_arc_pair(s, node, from_source, 0.0);
        }
        if to_sink > 0.0 {
            self.add_arc_pair(node, t, to_sink, 0.0);
        }
    }

    /// Undirected-style link with independent capacities per direction
    pub fn add_edge(&mut self, a: usize, b: usize, weight: f64, reverse_weight: f64) {
        self.add_arc_pair(a, b, weight, reverse_weight);
    }

    fn build_levels(&mut self) -> bool {
        let (s, t) = (self.source(), self.sink());
        self.level = vec![-1; self.nodes + 2];
        self.level[s] = 0;
        let mut queue = VecDeque::from([s]);
        while let Some(u) = queue.pop_front() {
            for &e in &self.adjacency[u] {
                let v = self.to[e];
                if self.capacity[e] > EPS && self.level[v] < 0 {
                    self.level[v] = self.level[u] + 1;
                    queue.push_back(v);
                }
            }
        }
        self.level[t] >= 0
    }

    /// Augment along level-graph paths until the flow is blocking
    fn blocking_flow(&mut self) -> f64 {
        let (s, t) = (self.source(), self.sink());
        let mut next_arc = vec![0usize; self.nodes + 2];
        let mut path: Vec<usize> = Vec::new();
        let mut total = 0.0;
        let mut u = s;

        loop {
            if u == t {
                let bottleneck = path
                    .iter()
                    .map(|&e| self.capacity[e])
                    .fold(f64::INFINITY, f64::min);
                for &e in &path {
                    self.capacity[e] -= bottleneck;
                    self.capacity[e ^ 1] += bottleneck;
                }
                total += bottleneck;
                path.clear();
                u = s;
                continue;
            }

            let mut advanced = false;
            while next_arc[u] < self.adjacency[u].len() {
                let e = self.adjacency[u][next_arc[u]];
                let v = self.to[e];
                if self.capacity[e] > EPS && self.level[v] == self.level[u] + 1 {
                    path.push(e);
                    u = v;
                    advanced = true;
                    break;
                }
                next_arc[u] += 1;
            }

            if !advanced {
                if u == s {
                    return total;
                }
                // Dead end: remove the node from the level graph and retreat
                self.level[u] = -1;
                let Some(e) = path.pop() else {
                    return total;
                };
                u = self.to[e ^ 1];
                next_arc[u] += 1;
            }
        }
    }

    /// Run max-flow and return its value
    pub fn max_flow(&mut self) -> f64 {
        let mut flow = 0.0;
        while self.build_levels() {
            flow += self.blocking_flow();
        }
        // Leave levels describing the final residual graph
        self.build_levels();
        flow
    }

    /// After `max_flow`: whether `node` stays on the source side of the
    /// minimum cut
    pub fn in_source_segment(&self, node: usize) -> bool {
        self.level.get(node).is_some_and(|&l| l >= 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_textbook_network() {
        // Source feeds nodes 0 and 1, nodes 2 and 3 drain to the sink
        let mut g = FlowGraph::new(4);
        g.add_terminal_weights(0, 16.0, 0.0);
        g.add_terminal_weights(1, 13.0, 0.0);
        g.add_edge(0, 2, 12.0, 0.0);
        g.add_edge(1, 0, 4.0, 0.0);
        g.add_edge(2, 1, 9.0, 0.0);
        g.add_edge(1, 3, 14.0, 0.0);
        g.add_edge(3, 2, 7.0, 0.0);
        g.add_terminal_weights(2, 0.0, 20.0);
        g.add_terminal_weights(3, 0.0, 4.0);

        assert_relative_eq!(g.max_flow(), 23.0);
    }

    #[test]
    fn test_min_cut_sides() {
        // 0 is tied to the source, 1 to the sink, weak link between them
        let mut g = FlowGraph::new(2);
        g.add_terminal_weights(0, 10.0, 1.0);
        g.add_terminal_weights(1, 1.0, 10.0);
        g.add_edge(0, 1, 0.5, 0.5);

        assert_relative_eq!(g.max_flow(), 2.5);
        assert!(g.in_source_segment(0));
        assert!(!g.in_source_segment(1));
    }

    #[test]
    fn test_disconnected_has_zero_flow() {
        let mut g = FlowGraph::new(3);
        g.add_terminal_weights(0, 5.0, 0.0);
        g.add_terminal_weights(2, 0.0, 5.0);
        assert_eq!(g.max_flow(), 0.0);
        assert!(g.in_source_segment(0));
        assert!(!g.in_source_segment(1));
    }
}
