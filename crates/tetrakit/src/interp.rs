//! Donor-cell location and field transfer between two meshes.
//!
//! Every receptor vertex of the *to* mesh is bound to the donor tet of the
//! *from* mesh enclosing it, plus barycentric weights. Location runs three
//! stages: a geometry-node exchange seeds walks near sharp features, an
//! agent drain walks the remaining receptors flood-fill style across
//! partitions, and a bounding-sphere tree query with growing fuzz picks up
//! whatever the walks missed. The final binding is deterministic: the first
//! ENCLOSING agent wins, and distributed candidates are reduced min-by-part.

use tracing::{debug, info, warn};

use crate::agent::{AgentMode, AgentPool};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::math::{self, bary4, bary4_unscaled, clip_bary4, distance};
use crate::matrix::SymMat;
use crate::metric::interpolate_log_cell;
use crate::search::SearchTree;

const MAX_NODE_LIST: usize = 200;

pub struct Interp {
    /// Donor cell per receptor slot; `None` until located.
    pub cell: Vec<Option<usize>>,
    /// Rank holding the donor cell.
    pub part: Vec<usize>,
    pub bary: Vec<[f64; 4]>,
    agent_hired: Vec<bool>,
    agents: AgentPool,
    tree: SearchTree,
    /// Barycentric slack still counted as inside a donor.
    pub inside: f64,
    /// Outside tolerance used by diagnostics.
    pub bound: f64,
    /// Hard cap on walk steps; roughly the cube root of the donor count.
    pub step_limit: usize,
    pub search_fuzz: f64,
    pub search_donor_scale: f64,
    pub n_walk: i64,
    pub n_terminated: i64,
    pub walk_steps: i64,
    pub n_geom: i64,
    pub n_geom_fail: i64,
    pub n_tree: i64,
    pub tree_cells: i64,
}

impl Interp {
    /// Build the interpolator and index the donor tets.
    pub fn create(from: &Grid, to: &Grid) -> Result<Interp> {
        let max = to.nodes.max();
        let donor_scale = 2.0;
        let mut spheres = Vec::with_capacity(from.tet().n());
        for cell in from.tet().valid_cells() {
            let nodes = from.tet().nodes_of(cell)?;
            let (center, radius) = bounding_sphere(from, nodes);
            spheres.push((cell, center, donor_scale * radius));
        }
        Ok(Interp {
            cell: vec![None; max],
            part: vec![0; max],
            bary: vec![[0.0; 4]; max],
            agent_hired: vec![false; max],
            agents: AgentPool::new(),
            tree: SearchTree::build(&spheres),
            inside: -1.0e-12,
            bound: -0.1,
            step_limit: 215,
            search_fuzz: 1.0e-12,
            search_donor_scale: donor_scale,
            n_walk: 0,
            n_terminated: 0,
            walk_steps: 0,
            n_geom: 0,
            n_geom_fail: 0,
            n_tree: 0,
            tree_cells: 0,
        })
    }

    /// Grow the receptor arrays after the to mesh added vertices.
    pub fn resize(&mut self, max: usize) {
        if max > self.cell.len() {
            self.cell.resize(max, None);
            self.part.resize(max, 0);
            self.bary.resize(max, [0.0; 4]);
            self.agent_hired.resize(max, false);
        }
    }

    fn bary_inside(&self, bary: &[f64; 4]) -> bool {
        bary.iter().all(|&b| b >= self.inside)
    }

    /// Drop the record of a removed receptor.
    pub fn remove(&mut self, node: usize) -> Result<()> {
        if self.agent_hired[node] {
            return Err(Error::Invalid(format!("node {node} has a hired agent")));
        }
        if self.cell[node].is_none() {
            return Err(Error::NotFound(format!("node {node} was never located")));
        }
        self.cell[node] = None;
        Ok(())
    }

    /// Permute receptor records through a node compaction.
    pub fn pack(&mut self, new_to_old: &[usize]) -> Result<()> {
        if self.agents.n() != 0 {
            // active agents pin the old numbering
            return Err(Error::Invalid(format!(
                "pack with {} active agents",
                self.agents.n()
            )));
        }
        if self.agent_hired.iter().any(|&hired| hired) {
            return Err(Error::Invalid("pack with hired agents".to_string()));
        }
        let cell = new_to_old.iter().map(|&old| self.cell[old]).collect();
        let part = new_to_old.iter().map(|&old| self.part[old]).collect();
        let bary = new_to_old.iter().map(|&old| self.bary[old]).collect();
        self.cell = cell;
        self.part = part;
        self.bary = bary;
        self.agent_hired = vec![false; new_to_old.len()];
        Ok(())
    }

    // -- stage 2: walks ---------------------------------------------------

    fn update_agent_seed(
        &mut self,
        from: &Grid,
        id: usize,
        node0: usize,
        node1: usize,
        node2: usize,
    ) -> Result<()> {
        let face = [node0, node1, node2, node0];
        let (cell0, cell1) = from.tet().cells_with_face(&face);
        let cell0 = cell0.ok_or_else(|| Error::Invalid("walk face missing first cell".to_string()))?;
        let Some(cell1) = cell1 else {
            if !from.nodes.owned(node0) && !from.nodes.owned(node1) && !from.nodes.owned(node2) {
                // off-part face: pick a face vertex pseudo-randomly and hop
                let agent = self.agents.get_mut(id);
                let pick = [node0, node1, node2][agent.step % 3];
                agent.part = from.nodes.part(pick);
                agent.seed = from.nodes.global(pick) as usize;
                agent.mode = AgentMode::HopPart;
                return Ok(());
            }
            // hit boundary, but verifying
            from.tri()
                .with_nodes(&[node0, node1, node2])
                .ok_or_else(|| Error::NotFound("boundary tri expected".to_string()))?;
            self.agents.get_mut(id).mode = AgentMode::AtBoundary;
            return Ok(());
        };
        let agent = self.agents.get_mut(id);
        if agent.seed == cell0 {
            agent.seed = cell1;
            return Ok(());
        }
        if agent.seed == cell1 {
            agent.seed = cell0;
            return Ok(());
        }
        Err(Error::NotFound("agent seed not on face".to_string()))
    }

    fn walk_agent(&mut self, from: &Grid, id: usize) -> Result<()> {
        loop {
            if self.agents.get(id).mode != AgentMode::Walking {
                return Ok(());
            }
            if self.agents.get(id).step >= self.step_limit {
                self.agents.get_mut(id).mode = AgentMode::Terminated;
                return Ok(());
            }
            self.agents.get_mut(id).step += 1;

            let (seed, xyz) = {
                let agent = self.agents.get(id);
                (agent.seed, agent.xyz)
            };
            let nodes: Vec<usize> = from.tet().nodes_of(seed)?.to_vec();
            let corners = [
                from.nodes.xyz(nodes[0]),
                from.nodes.xyz(nodes[1]),
                from.nodes.xyz(nodes[2]),
                from.nodes.xyz(nodes[3]),
            ];
            // a degenerate donor keeps the raw volumes so the walk can still
            // rank exits
            let bary = match bary4(corners[0], corners[1], corners[2], corners[3], &xyz) {
                Ok(bary) => bary,
                Err(Error::DivZero(_)) => {
                    bary4_unscaled(corners[0], corners[1], corners[2], corners[3], &xyz)
                }
                Err(other) => return Err(other),
            };

            if self.bary_inside(&bary) {
                let agent = self.agents.get_mut(id);
                agent.mode = AgentMode::Enclosing;
                agent.bary = bary;
                return Ok(());
            }

            // exit through the face opposite the smallest bary; strict
            // ordering first, ties broken by less-than-or-equal
            if bary[0] < bary[1] && bary[0] < bary[2] && bary[0] < bary[3] {
                self.update_agent_seed(from, id, nodes[1], nodes[2], nodes[3])?;
            } else if bary[1] < bary[0] && bary[1] < bary[3] && bary[1] < bary[2] {
                self.update_agent_seed(from, id, nodes[0], nodes[3], nodes[2])?;
            } else if bary[2] < bary[0] && bary[2] < bary[1] && bary[2] < bary[3] {
                self.update_agent_seed(from, id, nodes[0], nodes[1], nodes[3])?;
            } else if bary[3] < bary[0] && bary[3] < bary[2] && bary[3] < bary[1] {
                self.update_agent_seed(from, id, nodes[0], nodes[2], nodes[1])?;
            } else if bary[0] <= bary[1] && bary[0] <= bary[2] && bary[0] <= bary[3] {
                self.update_agent_seed(from, id, nodes[1], nodes[2], nodes[3])?;
            } else if bary[1] <= bary[0] && bary[1] <= bary[3] && bary[1] <= bary[2] {
                self.update_agent_seed(from, id, nodes[0], nodes[3], nodes[2])?;
            } else if bary[2] <= bary[0] && bary[2] <= bary[1] && bary[2] <= bary[3] {
                self.update_agent_seed(from, id, nodes[0], nodes[1], nodes[3])?;
            } else if bary[3] <= bary[0] && bary[3] <= bary[2] && bary[3] <= bary[1] {
                self.update_agent_seed(from, id, nodes[0], nodes[2], nodes[1])?;
            } else {
                return Err(Error::NotFound("unable to find the next step".to_string()));
            }
        }
    }

    /// Queue the unlocated face-adjacent neighbors of a freshly located
    /// receptor; off-part neighbors become suggestions for their owner.
    fn push_onto_queue(&mut self, to: &Grid, node: usize) -> Result<()> {
        if !to.nodes.valid(node) || !to.nodes.owned(node) {
            return Err(Error::Invalid(format!("queue push from {node}")));
        }
        let cell = self.cell[node]
            .ok_or_else(|| Error::NotFound(format!("no donor guess at {node}")))?;
        let part = self.part[node];
        let neighbors = match to.tet().node_list_around(node, MAX_NODE_LIST) {
            Ok(neighbors) => neighbors,
            Err(Error::IncreaseLimit(_)) => to.tet().node_list_around(node, usize::MAX)?,
            Err(other) => return Err(other),
        };
        for other in neighbors {
            if to.nodes.owned(other) {
                if self.cell[other].is_none() && !self.agent_hired[other] {
                    self.agent_hired[other] = true;
                    self.agents
                        .push(other, part, cell, *to.nodes.xyz(other), to.comm.rank());
                }
            } else {
                let id = self
                    .agents
                    .push(other, part, cell, *to.nodes.xyz(other), to.comm.rank());
                let agent = self.agents.get_mut(id);
                agent.mode = AgentMode::Suggestion;
                agent.home = to.nodes.part(other);
                agent.node = to.nodes.global(other) as usize;
            }
        }
        Ok(())
    }

    /// Sweep the agent pool to exhaustion; each sweep walks local agents,
    /// migrates, localizes hops, adjudicates suggestions, and finalizes
    /// finished walks.
    fn process_agents(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        let comm = &from.comm;
        let rank = comm.rank();
        let mut n_agents = comm.allsum_int(self.agents.n() as i64);
        let mut sweep = 0usize;

        while n_agents > 0 {
            sweep += 1;
            debug!("sweep {sweep}: {n_agents} agents");

            let walking: Vec<usize> = self
                .agents
                .active()
                .filter(|&id| {
                    let agent = self.agents.get(id);
                    agent.mode == AgentMode::Walking && agent.part == rank
                })
                .collect();
            for id in walking {
                self.walk_agent(from, id)?;
            }

            self.agents.migrate(comm)?;

            let hopping: Vec<usize> = self
                .agents
                .active()
                .filter(|&id| {
                    let agent = self.agents.get(id);
                    agent.mode == AgentMode::HopPart && agent.part == rank
                })
                .collect();
            for id in hopping {
                let seed_global = self.agents.get(id).seed as i64;
                let node = from.nodes.local(seed_global)?;
                let seed = from
                    .tet()
                    .first_with(node)
                    .ok_or_else(|| Error::NotFound(format!("no tet at hop node {node}")))?;
                let agent = self.agents.get_mut(id);
                agent.mode = AgentMode::Walking;
                agent.seed = seed;
            }

            let suggested: Vec<usize> = self
                .agents
                .active()
                .filter(|&id| {
                    let agent = self.agents.get(id);
                    agent.mode == AgentMode::Suggestion && agent.home == rank
                })
                .collect();
            for id in suggested {
                let node = to.nodes.local(self.agents.get(id).node as i64)?;
                if self.cell[node].is_some() || self.agent_hired[node] {
                    self.agents.remove(id)?;
                } else {
                    let agent = self.agents.get_mut(id);
                    agent.mode = AgentMode::Walking;
                    agent.node = node;
                    self.agent_hired[node] = true;
                }
            }

            let finished: Vec<usize> = self
                .agents
                .active()
                .filter(|&id| {
                    let agent = self.agents.get(id);
                    (agent.mode == AgentMode::AtBoundary || agent.mode == AgentMode::Terminated)
                        && agent.home == rank
                })
                .collect();
            for id in finished {
                let agent = *self.agents.get(id);
                let node = agent.node;
                if self.cell[node].is_some() || !self.agent_hired[node] {
                    return Err(Error::Invalid(format!("stale walk record at {node}")));
                }
                if agent.mode == AgentMode::Terminated {
                    self.walk_steps += agent.step as i64 + 1;
                    self.n_terminated += 1;
                }
                self.agent_hired[node] = false;
                self.agents.remove(id)?;
            }

            let enclosing: Vec<usize> = self
                .agents
                .active()
                .filter(|&id| {
                    let agent = self.agents.get(id);
                    agent.mode == AgentMode::Enclosing && agent.home == rank
                })
                .collect();
            for id in enclosing {
                let agent = *self.agents.get(id);
                let node = agent.node;
                if self.cell[node].is_some() || !self.agent_hired[node] {
                    return Err(Error::Invalid(format!("stale walk record at {node}")));
                }
                self.cell[node] = Some(agent.seed);
                self.part[node] = agent.part;
                self.bary[node] = agent.bary;
                self.walk_steps += agent.step as i64 + 1;
                self.n_walk += 1;
                self.agent_hired[node] = false;
                self.agents.remove(id)?;
                self.push_onto_queue(to, node)?;
            }

            n_agents = comm.allsum_int(self.agents.n() as i64);
        }

        self.walk_steps = comm.allsum_int(self.walk_steps);
        self.n_walk = comm.allsum_int(self.n_walk);
        self.n_terminated = comm.allsum_int(self.n_terminated);

        for node in to.nodes.iter_valid() {
            if to.nodes.owned(node) && self.agent_hired[node] {
                return Err(Error::Invalid(format!("agent left hired at {node}")));
            }
        }
        Ok(())
    }

    // -- stage 1: geometry nodes ------------------------------------------

    /// Owned vertices pinned by the CAD topology: at least three distinct
    /// face ids or two distinct edge ids.
    fn geom_node_list(grid: &Grid) -> Vec<usize> {
        let mut list = Vec::new();
        for node in grid.nodes.iter_valid() {
            if !grid.nodes.owned(node) {
                continue;
            }
            let mut face_ids: Vec<i64> = Vec::new();
            for cell in grid.tri().cells_having_node(node) {
                let id = grid.tri().surface_id(cell).unwrap_or(0);
                if !face_ids.contains(&id) {
                    face_ids.push(id);
                }
            }
            let mut edge_ids: Vec<i64> = Vec::new();
            for cell in grid.edg().cells_having_node(node) {
                let id = grid.edg().surface_id(cell).unwrap_or(0);
                if !edge_ids.contains(&id) {
                    edge_ids.push(id);
                }
            }
            if face_ids.len() >= 3 || edge_ids.len() >= 2 {
                list.push(node);
            }
        }
        list
    }

    fn geom_nodes(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        let comm = &from.comm;
        let to_list = Interp::geom_node_list(to);
        let from_list = Interp::geom_node_list(from);

        let mut local_xyz = Vec::with_capacity(3 * to_list.len());
        let mut local_node = Vec::with_capacity(to_list.len());
        for &node in &to_list {
            local_node.push(node as i64);
            local_xyz.extend_from_slice(to.nodes.xyz(node));
        }
        let (global_xyz, _) = comm.allconcat_dbls(3, &local_xyz);
        let (global_node, source) = comm.allconcat_ints(1, &local_node);
        let total = global_node.len();

        // nearest local geometry node per target
        let mut best_dist = vec![1.0e20; total];
        let mut best_node = vec![None; total];
        for item in 0..total {
            let xyz = [
                global_xyz[3 * item],
                global_xyz[3 * item + 1],
                global_xyz[3 * item + 2],
            ];
            for &from_node in &from_list {
                let dist = distance(&xyz, from.nodes.xyz(from_node));
                if best_node[item].is_none() || dist < best_dist[item] {
                    best_dist[item] = dist;
                    best_node[item] = Some(from_node);
                }
            }
        }
        let winner = comm.allminwho(&best_dist);

        let mut send_dest = Vec::new();
        let mut send_node = Vec::new();
        let mut send_cell = Vec::new();
        let mut send_part = Vec::new();
        let mut send_bary = Vec::new();
        for item in 0..total {
            if winner[item] != comm.rank() {
                continue;
            }
            let near = best_node[item]
                .ok_or_else(|| Error::NotFound("geometry node with no donor".to_string()))?;
            let xyz = [
                global_xyz[3 * item],
                global_xyz[3 * item + 1],
                global_xyz[3 * item + 2],
            ];
            let (cell, bary) = exhaustive_tet_around_node(from, near, &xyz)?;
            send_dest.push(source[item]);
            send_node.push(global_node[item]);
            send_cell.push(cell as i64);
            send_part.push(comm.rank() as i64);
            send_bary.extend_from_slice(&bary);
        }

        let recv_node = comm.blindsend_ints(&send_dest, &send_node, 1);
        let recv_cell = comm.blindsend_ints(&send_dest, &send_cell, 1);
        let recv_part = comm.blindsend_ints(&send_dest, &send_part, 1);
        let recv_bary = comm.blindsend_dbls(&send_dest, &send_bary, 4);

        for item in 0..recv_node.len() {
            let bary = [
                recv_bary[4 * item],
                recv_bary[4 * item + 1],
                recv_bary[4 * item + 2],
                recv_bary[4 * item + 3],
            ];
            if bary.iter().all(|&b| b > self.inside) {
                self.n_geom += 1;
                let node = recv_node[item] as usize;
                if self.cell[node].is_some() {
                    return Err(Error::Invalid(format!("geometry node {node} already located")));
                }
                if self.agent_hired[node] {
                    self.agents.delete_for_node(node, comm.rank())?;
                    self.agent_hired[node] = false;
                }
                self.cell[node] = Some(recv_cell[item] as usize);
                self.part[node] = recv_part[item] as usize;
                self.bary[node] = bary;
                self.push_onto_queue(to, node)?;
            } else {
                self.n_geom_fail += 1;
            }
        }

        self.n_geom = comm.allsum_int(self.n_geom);
        self.n_geom_fail = comm.allsum_int(self.n_geom_fail);
        Ok(())
    }

    // -- stage 3: tree fallback -------------------------------------------

    fn unlocated_targets(&self, to: &Grid) -> Vec<i64> {
        let mut node = Vec::new();
        for local in to.nodes.iter_valid() {
            if !to.nodes.owned(local) || self.cell[local].is_some() {
                continue;
            }
            node.push(local as i64);
        }
        node
    }

    /// One collective tree pass over the given receptor targets. Returns
    /// true when some receptor had no candidate anywhere and the fuzz must
    /// grow.
    fn tree_pass(
        &mut self,
        from: &Grid,
        to: &Grid,
        local_node: &[i64],
        seed_queue: bool,
    ) -> Result<bool> {
        let comm = &from.comm;
        let mut local_xyz = Vec::with_capacity(3 * local_node.len());
        for &local in local_node {
            local_xyz.extend_from_slice(to.nodes.xyz(local as usize));
        }
        let (global_xyz, _) = comm.allconcat_dbls(3, &local_xyz);
        let (global_node, source) = comm.allconcat_ints(1, local_node);
        let total = global_node.len();

        let mut best_bary = vec![1.0e20; total];
        let mut best_cell = vec![None; total];
        for item in 0..total {
            let xyz = [
                global_xyz[3 * item],
                global_xyz[3 * item + 1],
                global_xyz[3 * item + 2],
            ];
            let candidates = self.tree.touching(&xyz, self.search_fuzz);
            self.tree_cells += candidates.len() as i64;
            if let Some((cell, bary)) = enclosing_tet_in_list(from, &candidates, &xyz)? {
                // negated so the min-reduction selects the deepest enclosure
                best_bary[item] = -(bary[0].min(bary[1]).min(bary[2]).min(bary[3]));
                best_cell[item] = Some(cell);
            }
        }
        let winner = comm.allminwho(&best_bary);

        let mut increase_fuzz = false;
        let mut send_dest = Vec::new();
        let mut send_node = Vec::new();
        let mut send_cell = Vec::new();
        let mut send_part = Vec::new();
        let mut send_bary = Vec::new();
        for item in 0..total {
            if winner[item] != comm.rank() {
                continue;
            }
            match best_cell[item] {
                Some(cell) => {
                    let xyz = [
                        global_xyz[3 * item],
                        global_xyz[3 * item + 1],
                        global_xyz[3 * item + 2],
                    ];
                    let nodes = from.tet().nodes_of(cell)?;
                    let bary = bary4(
                        from.nodes.xyz(nodes[0]),
                        from.nodes.xyz(nodes[1]),
                        from.nodes.xyz(nodes[2]),
                        from.nodes.xyz(nodes[3]),
                        &xyz,
                    )?;
                    send_dest.push(source[item]);
                    send_node.push(global_node[item]);
                    send_cell.push(cell as i64);
                    send_part.push(comm.rank() as i64);
                    send_bary.extend_from_slice(&bary);
                }
                None => {
                    // candidate not found, try again with larger fuzz
                    increase_fuzz = true;
                }
            }
        }

        let recv_node = comm.blindsend_ints(&send_dest, &send_node, 1);
        let recv_cell = comm.blindsend_ints(&send_dest, &send_cell, 1);
        let recv_part = comm.blindsend_ints(&send_dest, &send_part, 1);
        let recv_bary = comm.blindsend_dbls(&send_dest, &send_bary, 4);

        for item in 0..recv_node.len() {
            let node = recv_node[item] as usize;
            if self.cell[node].is_some() {
                return Err(Error::Invalid(format!("tree target {node} already located")));
            }
            if self.agent_hired[node] {
                self.agents.delete_for_node(node, comm.rank())?;
                self.agent_hired[node] = false;
            }
            self.n_tree += 1;
            self.cell[node] = Some(recv_cell[item] as usize);
            self.part[node] = recv_part[item] as usize;
            self.bary[node] = [
                recv_bary[4 * item],
                recv_bary[4 * item + 1],
                recv_bary[4 * item + 2],
                recv_bary[4 * item + 3],
            ];
            if seed_queue {
                self.push_onto_queue(to, node)?;
            }
        }

        Ok(comm.all_or(increase_fuzz))
    }

    fn tree_drain(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        for tries in 0..12 {
            let targets = self.unlocated_targets(to);
            let increase_fuzz = self.tree_pass(from, to, &targets, false)?;
            if !increase_fuzz {
                // every remaining receptor must now be bound
                for node in to.nodes.iter_valid() {
                    if to.nodes.owned(node) && self.cell[node].is_none() {
                        return Err(Error::NotFound(format!(
                            "receptor missed by tree: {}",
                            to.nodes.location(node)
                        )));
                    }
                }
                return Ok(());
            }
            self.search_fuzz *= 10.0;
            if from.comm.once() {
                info!("retry {tries}: tree search fuzz grown to {:e}", self.search_fuzz);
            }
        }
        Err(Error::NotFound(
            "unable to grow fuzz to find tree candidate".to_string(),
        ))
    }

    /// Locate every owned receptor: geometry exchange, walk drain, then the
    /// tree fallback.
    pub fn locate(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        self.geom_nodes(from, to)?;
        self.process_agents(from, to)?;
        self.tree_drain(from, to)
    }

    /// Cheap warm start: seed roughly one percent of the targets through the
    /// tree, drain the walks that spread from them, then mop up.
    pub fn locate_subset(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        self.seed_tree(from, to)?;
        self.process_agents(from, to)?;
        self.tree_drain(from, to)
    }

    fn seed_tree(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        // between 10 and 100 seeds, about one percent, never more than all
        let node = self.unlocated_targets(to);
        let ntarget = node.len();
        let seed_target = (ntarget / 100).clamp(10, 100).min(ntarget);
        if seed_target > 0 {
            let stride = 1 + ntarget / seed_target;
            let keep: Vec<i64> = node.iter().step_by(stride).copied().collect();
            self.tree_pass(from, to, &keep, true)?;
        }
        Ok(())
    }

    // -- warm restarts ----------------------------------------------------

    /// Relocate one moved receptor from its previous donor record; the
    /// record is cleared when the walk leaves this part or fails.
    pub fn locate_node(&mut self, from: &Grid, to: &Grid, node: usize) -> Result<()> {
        if node >= self.cell.len() {
            return Err(Error::Invalid(format!(
                "node {node} beyond interp extent; moves only",
            )));
        }
        let Some(seed) = self.cell[node] else {
            return Ok(()); // no starting guess, skip
        };
        if self.agents.n() != 0 {
            return Err(Error::Invalid("active agents during relocate".to_string()));
        }
        if self.part[node] != from.comm.rank() {
            self.cell[node] = None;
        } else {
            self.agent_hired[node] = true;
            let id = self
                .agents
                .push(node, self.part[node], seed, *to.nodes.xyz(node), from.comm.rank());
            self.walk_agent(from, id)?;
            let agent = *self.agents.get(id);
            if agent.mode == AgentMode::Enclosing {
                self.cell[node] = Some(agent.seed);
                self.part[node] = agent.part;
                self.bary[node] = agent.bary;
                self.walk_steps += agent.step as i64 + 1;
                self.n_walk += 1;
            } else {
                self.cell[node] = None;
            }
            self.agent_hired[node] = false;
            self.agents.remove(id)?;
        }

        if self.cell[node].is_none() {
            self.local_tree_fallback(from, to, node)?;
        }
        Ok(())
    }

    /// Locate a vertex created between two parents, walking from either
    /// parent's donor before falling back to the tree.
    pub fn locate_between(
        &mut self,
        from: &Grid,
        to: &Grid,
        node0: usize,
        node1: usize,
        new_node: usize,
    ) -> Result<()> {
        self.resize(to.nodes.max());
        self.cell[new_node] = None;
        let seed0 = self.cell[node0]
            .ok_or_else(|| Error::NotFound(format!("parent {node0} has no donor")))?;
        let seed1 = self.cell[node1]
            .ok_or_else(|| Error::NotFound(format!("parent {node1} has no donor")))?;
        if self.agents.n() != 0 {
            return Err(Error::Invalid("active agents during relocate".to_string()));
        }

        self.agent_hired[new_node] = true;
        let id = self.agents.push(
            new_node,
            self.part[node0],
            seed0,
            *to.nodes.xyz(new_node),
            from.comm.rank(),
        );
        if self.part[node0] == from.comm.rank() {
            self.walk_agent(from, id)?;
        }
        if self.agents.get(id).mode != AgentMode::Enclosing && self.part[node1] == from.comm.rank()
        {
            self.agents.restart(id, self.part[node1], seed1);
            self.walk_agent(from, id)?;
        }
        let agent = *self.agents.get(id);
        if agent.mode == AgentMode::Enclosing {
            self.cell[new_node] = Some(agent.seed);
            self.part[new_node] = agent.part;
            self.bary[new_node] = agent.bary;
            self.walk_steps += agent.step as i64 + 1;
            self.n_walk += 1;
        } else {
            self.cell[new_node] = None;
        }
        self.agent_hired[new_node] = false;
        self.agents.remove(id)?;

        if self.cell[new_node].is_none() {
            self.local_tree_fallback(from, to, new_node)?;
        }
        Ok(())
    }

    fn local_tree_fallback(&mut self, from: &Grid, to: &Grid, node: usize) -> Result<()> {
        let xyz = *to.nodes.xyz(node);
        let candidates = self.tree.touching(&xyz, self.search_fuzz);
        if let Some((cell, bary)) = enclosing_tet_in_list(from, &candidates, &xyz)? {
            self.cell[node] = Some(cell);
            self.part[node] = from.comm.rank();
            self.bary[node] = bary;
        }
        Ok(())
    }

    /// Re-bind every owned receptor from warm donor records, e.g. after the
    /// meshes moved; records that no longer enclose walk or fall to the
    /// tree.
    pub fn locate_warm(&mut self, from: &Grid, to: &Grid) -> Result<()> {
        let rank = from.comm.rank();
        for node in to.nodes.iter_valid() {
            if !to.nodes.owned(node) {
                continue;
            }
            if let Some(seed) = self.cell[node] {
                // the recorded donor cell id is local to its part; the agent
                // migrates there before walking
                self.cell[node] = None;
                self.agent_hired[node] = true;
                self.agents
                    .push(node, self.part[node], seed, *to.nodes.xyz(node), rank);
            }
        }
        self.process_agents(from, to)?;
        self.tree_drain(from, to)
    }

    // -- transfers and diagnostics ----------------------------------------

    /// Interpolate a donor vertex field of `leading_dim` values into a
    /// receptor field, one blindsend out and one back.
    pub fn scalar(
        &self,
        from: &Grid,
        to: &Grid,
        leading_dim: usize,
        from_field: &[f64],
        to_field: &mut [f64],
    ) -> Result<()> {
        let comm = &from.comm;
        let mut recept_dest = Vec::new();
        let mut recept_cell = Vec::new();
        let mut recept_node = Vec::new();
        let mut recept_ret = Vec::new();
        let mut recept_bary = Vec::new();
        for node in to.nodes.iter_valid() {
            if !to.nodes.owned(node) {
                continue;
            }
            let cell = self.cell[node]
                .ok_or_else(|| Error::NotFound(format!("receptor {node} not located")))?;
            recept_dest.push(self.part[node]);
            recept_cell.push(cell as i64);
            recept_node.push(node as i64);
            recept_ret.push(comm.rank() as i64);
            recept_bary.extend_from_slice(&clip_bary4(&self.bary[node])?);
        }

        let donor_cell = comm.blindsend_ints(&recept_dest, &recept_cell, 1);
        let donor_ret = comm.blindsend_ints(&recept_dest, &recept_ret, 1);
        let donor_node = comm.blindsend_ints(&recept_dest, &recept_node, 1);
        let donor_bary = comm.blindsend_dbls(&recept_dest, &recept_bary, 4);

        let mut donor_dest = Vec::with_capacity(donor_cell.len());
        let mut donor_field = Vec::with_capacity(leading_dim * donor_cell.len());
        for item in 0..donor_cell.len() {
            let nodes = from.tet().nodes_of(donor_cell[item] as usize)?;
            donor_dest.push(donor_ret[item] as usize);
            for dim in 0..leading_dim {
                let mut value = 0.0;
                for (weight_slot, &donor) in nodes.iter().enumerate() {
                    value += donor_bary[4 * item + weight_slot]
                        * from_field[dim + leading_dim * donor];
                }
                donor_field.push(value);
            }
        }

        let recept_field = comm.blindsend_dbls(&donor_dest, &donor_field, leading_dim);
        let recept_back = comm.blindsend_ints(&donor_dest, &donor_node, 1);

        for item in 0..recept_back.len() {
            let node = recept_back[item] as usize;
            to_field[leading_dim * node..leading_dim * (node + 1)]
                .copy_from_slice(&recept_field[leading_dim * item..leading_dim * (item + 1)]);
        }

        to.nodes.ghost_sync_dbl(comm, to_field, leading_dim)?;
        Ok(())
    }

    /// Interpolate the donor metric (log-blended with clipped weights) onto
    /// every owned receptor.
    pub fn metric_interpolate(&self, from: &Grid, to: &mut Grid) -> Result<()> {
        let comm = &from.comm;
        let mut recept_dest = Vec::new();
        let mut recept_cell = Vec::new();
        let mut recept_node = Vec::new();
        let mut recept_ret = Vec::new();
        let mut recept_bary = Vec::new();
        for node in to.nodes.iter_valid() {
            if !to.nodes.owned(node) {
                continue;
            }
            let cell = self.cell[node]
                .ok_or_else(|| Error::NotFound(format!("receptor {node} not located")))?;
            recept_dest.push(self.part[node]);
            recept_cell.push(cell as i64);
            recept_node.push(node as i64);
            recept_ret.push(comm.rank() as i64);
            recept_bary.extend_from_slice(&clip_bary4(&self.bary[node])?);
        }

        let donor_cell = comm.blindsend_ints(&recept_dest, &recept_cell, 1);
        let donor_ret = comm.blindsend_ints(&recept_dest, &recept_ret, 1);
        let donor_node = comm.blindsend_ints(&recept_dest, &recept_node, 1);
        let donor_bary = comm.blindsend_dbls(&recept_dest, &recept_bary, 4);

        let mut donor_dest = Vec::with_capacity(donor_cell.len());
        let mut donor_log = Vec::with_capacity(6 * donor_cell.len());
        for item in 0..donor_cell.len() {
            let nodes = from.tet().nodes_of(donor_cell[item] as usize)?;
            let logs: Vec<SymMat> = nodes
                .iter()
                .map(|&donor| *from.nodes.metric_get_log(donor))
                .collect();
            let bary = [
                donor_bary[4 * item],
                donor_bary[4 * item + 1],
                donor_bary[4 * item + 2],
                donor_bary[4 * item + 3],
            ];
            donor_dest.push(donor_ret[item] as usize);
            donor_log.extend_from_slice(&interpolate_log_cell(&logs, &bary));
        }

        let recept_log = comm.blindsend_dbls(&donor_dest, &donor_log, 6);
        let recept_back = comm.blindsend_ints(&donor_dest, &donor_node, 1);

        for item in 0..recept_back.len() {
            let node = recept_back[item] as usize;
            let mut log_m = [0.0; 6];
            log_m.copy_from_slice(&recept_log[6 * item..6 * item + 6]);
            to.nodes.metric_set_log(node, log_m);
        }
        Ok(())
    }

    /// Refresh the receptor metric after local operators moved vertices:
    /// warm relocation plus metric transfer in parallel, a located-everywhere
    /// assertion in serial.
    pub fn synchronize(&mut self, from: &Grid, to: &mut Grid) -> Result<()> {
        if from.comm.para() {
            // parallel can miss on partition boundaries, refresh the map
            self.locate_warm(from, to)?;
            self.metric_interpolate(from, to)?;
        } else {
            for node in to.nodes.iter_valid() {
                if (!to.tri().node_empty(node) || !to.tet().node_empty(node))
                    && self.cell[node].is_none()
                {
                    return Err(Error::NotFound(format!(
                        "unlocated after operators: {}",
                        to.nodes.location(node)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Worst distance between each receptor and its donor-side evaluation.
    pub fn max_error(&self, from: &Grid, to: &Grid) -> Result<f64> {
        let comm = &from.comm;
        let mut recept_dest = Vec::new();
        let mut recept_cell = Vec::new();
        let mut recept_node = Vec::new();
        let mut recept_ret = Vec::new();
        let mut recept_bary = Vec::new();
        for node in to.nodes.iter_valid() {
            if !to.nodes.owned(node) {
                continue;
            }
            let cell = self.cell[node]
                .ok_or_else(|| Error::NotFound(format!("receptor {node} not located")))?;
            recept_dest.push(self.part[node]);
            recept_cell.push(cell as i64);
            recept_node.push(node as i64);
            recept_ret.push(comm.rank() as i64);
            recept_bary.extend_from_slice(&self.bary[node]);
        }

        let donor_cell = comm.blindsend_ints(&recept_dest, &recept_cell, 1);
        let donor_ret = comm.blindsend_ints(&recept_dest, &recept_ret, 1);
        let donor_node = comm.blindsend_ints(&recept_dest, &recept_node, 1);
        let donor_bary = comm.blindsend_dbls(&recept_dest, &recept_bary, 4);

        let mut donor_dest = Vec::with_capacity(donor_cell.len());
        let mut donor_xyz = Vec::with_capacity(3 * donor_cell.len());
        for item in 0..donor_cell.len() {
            let nodes = from.tet().nodes_of(donor_cell[item] as usize)?;
            donor_dest.push(donor_ret[item] as usize);
            for axis in 0..3 {
                let mut value = 0.0;
                for (weight_slot, &donor) in nodes.iter().enumerate() {
                    value += donor_bary[4 * item + weight_slot] * from.nodes.xyz(donor)[axis];
                }
                donor_xyz.push(value);
            }
        }

        let recept_xyz = comm.blindsend_dbls(&donor_dest, &donor_xyz, 3);
        let recept_back = comm.blindsend_ints(&donor_dest, &donor_node, 1);

        let mut max_error = 0.0f64;
        for item in 0..recept_back.len() {
            let node = recept_back[item] as usize;
            let evaluated = [
                recept_xyz[3 * item],
                recept_xyz[3 * item + 1],
                recept_xyz[3 * item + 2],
            ];
            max_error = max_error.max(distance(&evaluated, to.nodes.xyz(node)));
        }
        Ok(comm.max_dbl(max_error))
    }

    /// Smallest barycentric weight over all located receptors.
    pub fn min_bary(&self, from: &Grid, to: &Grid) -> Result<f64> {
        let mut min_bary = 1.0f64;
        for node in to.nodes.iter_valid() {
            if !to.nodes.owned(node) {
                continue;
            }
            if self.cell[node].is_none() {
                return Err(Error::NotFound(format!("receptor {node} not located")));
            }
            let bary = &self.bary[node];
            min_bary = min_bary.min(bary[0].min(bary[1]).min(bary[2]).min(bary[3]));
        }
        Ok(from.comm.min_dbl(min_bary))
    }

    /// One-line location report, plus extrapolation count past `bound`.
    pub fn stats(&self, from: &Grid, to: &Grid) -> Result<()> {
        let comm = &from.comm;
        let mut extrapolate = 0i64;
        for node in to.nodes.iter_valid() {
            if to.nodes.owned(node) {
                let bary = &self.bary[node];
                if bary[0].min(bary[1]).min(bary[2]).min(bary[3]) < self.inside {
                    extrapolate += 1;
                }
            }
        }
        let extrapolate = comm.allsum_int(extrapolate);
        let max_error = self.max_error(from, to)?;
        let min_bary = self.min_bary(from, to)?;
        if comm.once() {
            if self.n_tree > 0 {
                info!(
                    "tree search: {} found, {:.2} avg cells",
                    self.n_tree,
                    self.tree_cells as f64 / self.n_tree as f64
                );
            }
            if self.n_walk > 0 || self.n_terminated > 0 {
                info!(
                    "walks: {} successful, {:.2} avg steps, {} terminated",
                    self.n_walk,
                    self.walk_steps as f64 / self.n_walk.max(1) as f64,
                    self.n_terminated
                );
            }
            info!(
                "geom nodes: {} failed, {} successful",
                self.n_geom_fail, self.n_geom
            );
            info!("interp min bary {min_bary:e} max error {max_error:e} extrap {extrapolate}");
        }
        Ok(())
    }
}

/// Donor-tet bounding sphere: vertex centroid, max vertex distance.
fn bounding_sphere(grid: &Grid, nodes: &[usize]) -> ([f64; 3], f64) {
    let mut center = [0.0; 3];
    for &node in nodes {
        let xyz = grid.nodes.xyz(node);
        for axis in 0..3 {
            center[axis] += 0.25 * xyz[axis];
        }
    }
    let mut radius = 0.0f64;
    for &node in nodes {
        radius = radius.max(distance(&center, grid.nodes.xyz(node)));
    }
    (center, radius)
}

/// The incident tet around `node` with the deepest enclosure of `xyz`.
pub fn exhaustive_tet_around_node(
    grid: &Grid,
    node: usize,
    xyz: &[f64; 3],
) -> Result<(usize, [f64; 4])> {
    let candidates: Vec<usize> = grid.tet().cells_having_node(node).collect();
    enclosing_tet_in_list(grid, &candidates, xyz)?
        .ok_or_else(|| Error::NotFound("failed to find cell around node".to_string()))
}

/// The member of `candidates` with the deepest enclosure of `xyz`, with its
/// exact (unclipped) barycentrics; degenerate members are skipped.
pub fn enclosing_tet_in_list(
    grid: &Grid,
    candidates: &[usize],
    xyz: &[f64; 3],
) -> Result<Option<(usize, [f64; 4])>> {
    let mut best: Option<(usize, [f64; 4], f64)> = None;
    for &cell in candidates {
        let nodes = grid.tet().nodes_of(cell)?;
        let corners = [
            grid.nodes.xyz(nodes[0]),
            grid.nodes.xyz(nodes[1]),
            grid.nodes.xyz(nodes[2]),
            grid.nodes.xyz(nodes[3]),
        ];
        match bary4(corners[0], corners[1], corners[2], corners[3], xyz) {
            Ok(bary) => {
                let min_bary = bary[0].min(bary[1]).min(bary[2]).min(bary[3]);
                if best.map(|(_, _, deepest)| min_bary > deepest).unwrap_or(true) {
                    best = Some((cell, bary, min_bary));
                }
            }
            Err(Error::DivZero(_)) => {}
            Err(other) => return Err(other),
        }
    }
    Ok(best.map(|(cell, bary, _)| (cell, bary)))
}

/// Build the identity interpolation: the donor mesh is a deep copy of the
/// receptor mesh and every vertex is located exhaustively in its own star.
pub fn create_identity(to: &Grid) -> Result<(Grid, Interp)> {
    let from = to.deep_copy();
    let mut interp = Interp::create(&from, to)?;
    for node in to.nodes.iter_valid() {
        if !to.nodes.owned(node) {
            continue;
        }
        if interp.cell[node].is_some() {
            return Err(Error::Invalid(format!("identity node {node} already bound")));
        }
        let (cell, bary) = exhaustive_tet_around_node(&from, node, to.nodes.xyz(node))?;
        interp.cell[node] = Some(cell);
        interp.part[node] = from.comm.rank();
        interp.bary[node] = bary;
        if !interp.bary_inside(&bary) {
            warn!("identity bary {bary:?} outside tolerance at node {node}");
        }
    }
    let max_error = interp.max_error(&from, to)?;
    if from.comm.once() && max_error > 1.0e-12 {
        warn!("identity background grid max error {max_error:e}");
    }
    Ok((from, interp))
}

/// Interpolate receptor metrics after a single moved or inserted node, the
/// warm per-operator entry points.
pub fn metric_interpolate_node(
    interp: &mut Interp,
    from: &Grid,
    to: &mut Grid,
    node: usize,
) -> Result<()> {
    interp.locate_node(from, to, node)?;
    apply_node_metric(interp, from, to, node)
}

pub fn metric_interpolate_between(
    interp: &mut Interp,
    from: &Grid,
    to: &mut Grid,
    node0: usize,
    node1: usize,
    new_node: usize,
) -> Result<()> {
    interp.locate_between(from, to, node0, node1, new_node)?;
    apply_node_metric(interp, from, to, new_node)
}

fn apply_node_metric(interp: &Interp, from: &Grid, to: &mut Grid, node: usize) -> Result<()> {
    // location unsuccessful or off-part: the sweep synchronize fills in
    let Some(cell) = interp.cell[node] else {
        return Ok(());
    };
    if interp.part[node] != from.comm.rank() {
        return Ok(());
    }
    let nodes = from.tet().nodes_of(cell)?;
    let bary = math::clip_bary4(&interp.bary[node])?;
    let logs: Vec<SymMat> = nodes
        .iter()
        .map(|&donor| *from.nodes.metric_get_log(donor))
        .collect();
    to.nodes.metric_set_log(node, interpolate_log_cell(&logs, &bary));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::fixtures::{regular_cube, six_tet_cube};
    use approx::assert_abs_diff_eq;

    #[test]
    fn identity_binds_every_vertex_exactly() {
        let to = six_tet_cube();
        let (from, interp) = create_identity(&to).unwrap();
        let max_error = interp.max_error(&from, &to).unwrap();
        assert!(max_error <= 1.0e-12, "max error {max_error:e}");
        for node in to.nodes.iter_valid() {
            assert!(interp.cell[node].is_some());
            // the vertex-coincident donor puts one bary at one
            let bary = interp.bary[node];
            let biggest = bary.iter().fold(0.0f64, |acc, &b| acc.max(b));
            assert_abs_diff_eq!(biggest, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn locate_walks_a_shifted_cloud() {
        let from = regular_cube(3);
        let mut to = regular_cube(3);
        // shift interior targets so walks must actually cross cells
        let interior: Vec<usize> = to
            .nodes
            .iter_valid()
            .filter(|&node| {
                let xyz = to.nodes.xyz(node);
                xyz.iter().all(|&x| x > 0.0 && x < 1.0)
            })
            .collect();
        for node in interior {
            let mut xyz = *to.nodes.xyz(node);
            xyz[0] = (xyz[0] + 0.21).min(0.99);
            xyz[1] = (xyz[1] + 0.13).min(0.99);
            to.nodes.set_xyz(node, xyz);
        }
        let mut interp = Interp::create(&from, &to).unwrap();
        interp.locate(&from, &to).unwrap();
        let max_error = interp.max_error(&from, &to).unwrap();
        assert!(max_error <= 1.0e-12, "max error {max_error:e}");
        let min_bary = interp.min_bary(&from, &to).unwrap();
        assert!(min_bary >= interp.inside);
    }

    #[test]
    fn boundary_point_falls_back_to_tree() {
        // S6: a receptor just outside the donor volume walks to AT_BOUNDARY
        // and the fuzzed tree query binds the surface-adjacent tet
        let from = six_tet_cube();
        let mut to = six_tet_cube();
        let node = 0;
        to.nodes.set_xyz(node, [-1.0e-10, 0.25, 0.25]);
        let mut interp = Interp::create(&from, &to).unwrap();
        interp.search_fuzz = 1.0e-9;
        interp.locate(&from, &to).unwrap();
        assert!(interp.cell[node].is_some());
        let bary = interp.bary[node];
        let min_bary = bary[0].min(bary[1]).min(bary[2]).min(bary[3]);
        // enclosure is approximate by exactly the nudge distance
        assert!(min_bary > -1.0e-8);
    }

    #[test]
    fn scalar_transfer_reproduces_linear_fields() {
        let from = regular_cube(2);
        let mut to = regular_cube(2);
        for node in 0..to.nodes.max() {
            if to.nodes.valid(node) {
                let mut xyz = *to.nodes.xyz(node);
                for x in &mut xyz {
                    *x = (*x * 0.8) + 0.1;
                }
                to.nodes.set_xyz(node, xyz);
            }
        }
        let mut interp = Interp::create(&from, &to).unwrap();
        interp.locate(&from, &to).unwrap();
        let mut from_field = vec![0.0; from.nodes.max()];
        for node in from.nodes.iter_valid() {
            let xyz = from.nodes.xyz(node);
            from_field[node] = 1.0 + 2.0 * xyz[0] - xyz[1] + 0.5 * xyz[2];
        }
        let mut to_field = vec![0.0; to.nodes.max()];
        interp
            .scalar(&from, &to, 1, &from_field, &mut to_field)
            .unwrap();
        for node in to.nodes.iter_valid() {
            let xyz = to.nodes.xyz(node);
            let expected = 1.0 + 2.0 * xyz[0] - xyz[1] + 0.5 * xyz[2];
            assert_abs_diff_eq!(to_field[node], expected, epsilon = 1e-11);
        }
    }

    #[test]
    fn metric_interpolate_blends_logs() {
        let mut from = regular_cube(2);
        let mut to = regular_cube(2);
        // uniform donor metric transfers exactly through the log blend
        let m = [16.0, 0.0, 0.0, 4.0, 0.0, 1.0];
        for node in from.nodes.iter_valid().collect::<Vec<_>>() {
            from.nodes.metric_set(node, &m).unwrap();
        }
        let mut interp = Interp::create(&from, &to).unwrap();
        interp.locate(&from, &to).unwrap();
        interp.metric_interpolate(&from, &mut to).unwrap();
        for node in to.nodes.iter_valid().collect::<Vec<_>>() {
            let got = to.nodes.metric_get(node).unwrap();
            for i in 0..6 {
                assert_abs_diff_eq!(got[i], m[i], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn locate_between_reuses_parent_seeds() {
        let to = six_tet_cube();
        let (from, mut interp) = create_identity(&to).unwrap();
        // a midpoint vertex inserted between corners 0 and 6
        let mut to = to;
        let new_node = to.nodes.add(8).unwrap();
        to.nodes.set_xyz(new_node, [0.5, 0.5, 0.5]);
        interp
            .locate_between(&from, &to, 0, 6, new_node)
            .unwrap();
        assert!(interp.cell[new_node].is_some());
        let bary = interp.bary[new_node];
        assert!(bary.iter().all(|&b| b >= interp.inside));
    }

    #[test]
    fn locate_node_outside_walks_to_boundary_then_tree() {
        // the walk exits through a boundary face; the fuzzed local tree
        // query still binds the surface-adjacent tet
        let to = six_tet_cube();
        let (from, mut interp) = create_identity(&to).unwrap();
        let mut to = to;
        to.nodes.set_xyz(0, [-1.0e-10, 0.25, 0.25]);
        interp.search_fuzz = 1.0e-9;
        interp.locate_node(&from, &to, 0).unwrap();
        assert!(interp.cell[0].is_some());
        let bary = interp.bary[0];
        assert!(bary[0].min(bary[1]).min(bary[2]).min(bary[3]) > -1.0e-8);
    }

    #[test]
    fn locate_node_rewalks_moved_vertex() {
        let to = six_tet_cube();
        let (from, mut interp) = create_identity(&to).unwrap();
        let mut to = to;
        to.nodes.set_xyz(0, [0.3, 0.2, 0.1]);
        interp.locate_node(&from, &to, 0).unwrap();
        assert!(interp.cell[0].is_some());
        let max_error = interp.max_error(&from, &to).unwrap();
        assert!(max_error <= 1.0e-12);
    }

    #[test]
    fn pack_permutes_receptor_records() {
        let to = six_tet_cube();
        let (from, mut interp) = create_identity(&to).unwrap();
        let before: Vec<Option<usize>> = interp.cell.clone();
        // reverse the numbering, as a compaction might
        let new_to_old: Vec<usize> = (0..to.nodes.max()).rev().collect();
        interp.pack(&new_to_old).unwrap();
        for (new, &old) in new_to_old.iter().enumerate() {
            assert_eq!(interp.cell[new], before[old]);
        }
        let _ = from;
    }

    #[test]
    fn remove_clears_one_record() {
        let to = six_tet_cube();
        let (_from, mut interp) = create_identity(&to).unwrap();
        interp.remove(3).unwrap();
        assert!(interp.cell[3].is_none());
        assert!(interp.remove(3).is_err());
    }

    #[test]
    fn subset_seeding_locates_everything() {
        let from = regular_cube(3);
        let to = regular_cube(3);
        let mut interp = Interp::create(&from, &to).unwrap();
        interp.locate_subset(&from, &to).unwrap();
        for node in to.nodes.iter_valid() {
            assert!(interp.cell[node].is_some());
        }
    }
}
