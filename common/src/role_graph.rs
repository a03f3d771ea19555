use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use thiserror::Error;

use crate::role::{Role, RoleCommandPair};
use crate::role_command_order::RoleCommandOrder;
use crate::stage::StagePlan;

/// Las restricciones de orden entre los roles del stage forman un ciclo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ciclo de dependencias entre roles: {}", describe_cycle(.cycle))]
pub struct GraphCycleError {
    /// Pares del ciclo en orden de dependencia (cada uno espera al siguiente).
    pub cycle: Vec<RoleCommandPair>,
}

impl GraphCycleError {
    pub fn roles(&self) -> Vec<&Role> {
        self.cycle.iter().map(|p| &p.role).collect()
    }
}

fn describe_cycle(cycle: &[RoleCommandPair]) -> String {
    cycle
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Nodo del grafo: un par rol-comando con todas sus tareas (una por host).
struct Node {
    pair: RoleCommandPair,
    commands: Vec<usize>,
    preds: Vec<usize>,
    succs: Vec<usize>,
}

/// Parte un stage candidato en stages que respetan el orden de roles.
pub struct RoleGraph<'a> {
    order: &'a RoleCommandOrder,
}

impl<'a> RoleGraph<'a> {
    pub fn new(order: &'a RoleCommandOrder) -> Self {
        RoleGraph { order }
    }

    fn nodes(&self, candidate: &StagePlan) -> Vec<Node> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut index: HashMap<RoleCommandPair, usize> = HashMap::new();

        for (i, cmd) in candidate.commands.iter().enumerate() {
            let pair = RoleCommandPair::for_ordering(&cmd.role, &cmd.role_command);
            let idx = *index.entry(pair.clone()).or_insert_with(|| {
                nodes.push(Node {
                    pair,
                    commands: Vec::new(),
                    preds: Vec::new(),
                    succs: Vec::new(),
                });
                nodes.len() - 1
            });
            nodes[idx].commands.push(i);
        }

        // sólo aristas entre roles presentes en el candidato
        for n in 0..nodes.len() {
            for pred in self.order.predecessors(&nodes[n].pair) {
                if let Some(&p) = index.get(&pred) {
                    nodes[n].preds.push(p);
                    nodes[p].succs.push(n);
                }
            }
        }
        nodes
    }

    /// Capas topológicas: la capa K+1 sólo depende de capas anteriores.
    /// Cada tarea cae en la capa más temprana posible.
    pub fn build(&self, candidate: &StagePlan) -> Result<Vec<StagePlan>, GraphCycleError> {
        let nodes = self.nodes(candidate);
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.preds.len()).collect();
        let mut layer_of: Vec<Option<usize>> = vec![None; nodes.len()];
        let mut current: Vec<usize> = (0..nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut layer = 0;
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &n in &current {
                layer_of[n] = Some(layer);
                placed += 1;
                for &s in &nodes[n].succs {
                    in_degree[s] -= 1;
                    if in_degree[s] == 0 {
                        next.push(s);
                    }
                }
            }
            next.sort_unstable();
            current = next;
            layer += 1;
        }

        if placed < nodes.len() {
            let remaining: HashSet<usize> = (0..nodes.len()).filter(|&n| layer_of[n].is_none()).collect();
            return Err(GraphCycleError {
                cycle: find_cycle(&nodes, &remaining),
            });
        }

        // armamos los stages respetando el orden original de los comandos
        let mut command_layer: Vec<usize> = vec![0; candidate.commands.len()];
        for (n, node) in nodes.iter().enumerate() {
            for &c in &node.commands {
                command_layer[c] = layer_of[n].unwrap_or(0);
            }
        }

        let mut stages: Vec<StagePlan> = (0..layer)
            .map(|_| StagePlan {
                context: candidate.context.clone(),
                skippable: candidate.skippable,
                commands: Vec::new(),
            })
            .collect();
        for (c, cmd) in candidate.commands.iter().enumerate() {
            stages[command_layer[c]].commands.push(cmd.clone());
        }
        stages.retain(|s| !s.is_empty());
        Ok(stages)
    }

    /// Texto legible del grafo, para logs de debug.
    pub fn describe(&self, candidate: &StagePlan) -> String {
        let nodes = self.nodes(candidate);
        let mut out = String::new();
        let by_pair: BTreeMap<String, &Node> = nodes.iter().map(|n| (n.pair.to_string(), n)).collect();
        for (name, node) in by_pair {
            let succs: Vec<String> = node.succs.iter().map(|&s| nodes[s].pair.to_string()).collect();
            let _ = writeln!(
                out,
                "{} ({} hosts) -> [{}]",
                name,
                node.commands.len(),
                succs.join(", ")
            );
        }
        out
    }
}

/// DFS sobre los nodos que no se pudieron ubicar siguiendo predecesores.
fn find_cycle(nodes: &[Node], remaining: &HashSet<usize>) -> Vec<RoleCommandPair> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    fn visit(
        n: usize,
        nodes: &[Node],
        remaining: &HashSet<usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[n] = Mark::Gray;
        stack.push(n);
        for &p in &nodes[n].preds {
            if !remaining.contains(&p) {
                continue;
            }
            match marks[p] {
                Mark::Gray => {
                    let start = stack.iter().position(|&x| x == p).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                Mark::White => {
                    if let Some(cycle) = visit(p, nodes, remaining, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[n] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; nodes.len()];
    let mut starts: Vec<usize> = remaining.iter().copied().collect();
    starts.sort_unstable();
    for start in starts {
        if marks[start] != Mark::White {
            continue;
        }
        let mut stack = Vec::new();
        if let Some(cycle) = visit(start, nodes, remaining, &mut marks, &mut stack) {
            return cycle.into_iter().map(|i| nodes[i].pair.clone()).collect();
        }
    }
    // Kahn dejó nodos sin ubicar, así que siempre hay ciclo; por las dudas
    // devolvemos todo lo que quedó.
    let mut rest: Vec<usize> = remaining.iter().copied().collect();
    rest.sort_unstable();
    rest.into_iter().map(|i| nodes[i].pair.clone()).collect()
}
