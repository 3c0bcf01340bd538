use super::state::{StateGraph, StateKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

/// Transition graph of one state-machine scope (nested branches excluded)
pub struct ScopeGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    start: Option<NodeIndex>,
}

impl<'a> ScopeGraph<'a> {
    pub fn from_state_graph(states: &'a StateGraph) -> Self {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for state in &states.states {
            let node = graph.add_node(state.name.as_str());
            indices.insert(state.name.as_str(), node);
        }

        // Unknown targets are reported by dangling_references, skip them here
        for state in &states.states {
            let from = indices[state.name.as_str()];
            for target in state.targets() {
                if let Some(&to) = indices.get(target) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let start = indices.get(states.start_at.as_str()).copied();
        Self { graph, start }
    }

    /// States that can not be reached from `StartAt`
    pub fn unreachable(&self) -> Vec<&'a str> {
        let mut visited = vec![false; self.graph.node_count()];
        if let Some(start) = self.start {
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(node) = dfs.next(&self.graph) {
                visited[node.index()] = true;
            }
        }

        let mut unreachable: Vec<&'a str> = self
            .graph
            .node_indices()
            .filter(|node| !visited[node.index()])
            .map(|node| self.graph[node])
            .collect();
        unreachable.sort_unstable();
        unreachable
    }
}

/// Unreachable states across a graph and every nested Parallel branch
pub fn unreachable_states(graph: &StateGraph) -> Vec<String> {
    let mut unreachable: Vec<String> = ScopeGraph::from_state_graph(graph)
        .unreachable()
        .into_iter()
        .map(str::to_string)
        .collect();

    for state in &graph.states {
        if let StateKind::Parallel { branches, .. } = &state.kind {
            for branch in branches {
                unreachable.extend(unreachable_states(branch));
            }
        }
    }
    unreachable
}
