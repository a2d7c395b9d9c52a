//! Point-location agents: one in-flight walk per receptor vertex.
//!
//! Agents live in an arena pool and migrate between partitions as their
//! walks cross boundaries. The rank that acts on an agent depends on its
//! mode: walks and hops run where the donor cells live, while suggestions
//! and finished walks are handled by the receptor's home rank.

use crate::comm::Comm;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Walking,
    Enclosing,
    AtBoundary,
    Terminated,
    HopPart,
    Suggestion,
}

impl AgentMode {
    fn to_int(self) -> i64 {
        match self {
            AgentMode::Walking => 0,
            AgentMode::Enclosing => 1,
            AgentMode::AtBoundary => 2,
            AgentMode::Terminated => 3,
            AgentMode::HopPart => 4,
            AgentMode::Suggestion => 5,
        }
    }

    fn from_int(value: i64) -> Result<AgentMode> {
        match value {
            0 => Ok(AgentMode::Walking),
            1 => Ok(AgentMode::Enclosing),
            2 => Ok(AgentMode::AtBoundary),
            3 => Ok(AgentMode::Terminated),
            4 => Ok(AgentMode::HopPart),
            5 => Ok(AgentMode::Suggestion),
            _ => Err(Error::Invalid(format!("agent mode {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Agent {
    pub mode: AgentMode,
    /// Rank owning the receptor.
    pub home: usize,
    /// Receptor: local slot while at home; the receptor's global id when a
    /// suggestion is in flight.
    pub node: usize,
    /// Rank whose donor cells the walk reads.
    pub part: usize,
    /// Donor cell on `part`; the seed vertex's global id while hopping.
    pub seed: usize,
    pub step: usize,
    pub xyz: [f64; 3],
    pub bary: [f64; 4],
}

impl Agent {
    /// The rank that must process this agent next.
    pub fn acting_rank(&self) -> usize {
        match self.mode {
            AgentMode::Walking | AgentMode::HopPart => self.part,
            AgentMode::Enclosing
            | AgentMode::AtBoundary
            | AgentMode::Terminated
            | AgentMode::Suggestion => self.home,
        }
    }
}

#[derive(Debug, Default)]
pub struct AgentPool {
    slots: Vec<Option<Agent>>,
    free: Vec<usize>,
    n: usize,
}

impl AgentPool {
    pub fn new() -> AgentPool {
        AgentPool::default()
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Hire a walking agent for `node` against the (part, seed) donor guess.
    pub fn push(&mut self, node: usize, part: usize, seed: usize, xyz: [f64; 3], home: usize) -> usize {
        self.insert(Agent {
            mode: AgentMode::Walking,
            home,
            node,
            part,
            seed,
            step: 0,
            xyz,
            bary: [0.0; 4],
        })
    }

    fn insert(&mut self, agent: Agent) -> usize {
        self.n += 1;
        if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(agent);
            slot
        } else {
            self.slots.push(Some(agent));
            self.slots.len() - 1
        }
    }

    pub fn remove(&mut self, id: usize) -> Result<()> {
        if self.slots.get(id).map(Option::is_none).unwrap_or(true) {
            return Err(Error::Invalid(format!("agent {id} not active")));
        }
        self.slots[id] = None;
        self.free.push(id);
        self.n -= 1;
        Ok(())
    }

    /// Drop the agent working receptor `node` at this rank, wherever it is
    /// in its lifecycle.
    pub fn delete_for_node(&mut self, node: usize, rank: usize) -> Result<()> {
        let id = self
            .active()
            .find(|&id| {
                let agent = self.get(id);
                agent.home == rank && agent.mode != AgentMode::Suggestion && agent.node == node
            })
            .ok_or_else(|| Error::NotFound(format!("no agent for node {node}")))?;
        self.remove(id)
    }

    pub fn get(&self, id: usize) -> &Agent {
        self.slots[id].as_ref().unwrap()
    }

    pub fn get_mut(&mut self, id: usize) -> &mut Agent {
        self.slots[id].as_mut().unwrap()
    }

    /// Restart a finished agent against a new donor guess.
    pub fn restart(&mut self, id: usize, part: usize, seed: usize) {
        let agent = self.get_mut(id);
        agent.mode = AgentMode::Walking;
        agent.part = part;
        agent.seed = seed;
        agent.step = 0;
    }

    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots.len()).filter(|&id| self.slots[id].is_some())
    }

    /// Ship every agent whose acting rank is elsewhere; returns with all
    /// local agents actionable on this rank. A collective.
    pub fn migrate(&mut self, comm: &Comm) -> Result<()> {
        let rank = comm.rank();
        let mut dest = Vec::new();
        let mut ints = Vec::new();
        let mut dbls = Vec::new();
        let leaving: Vec<usize> = self
            .active()
            .filter(|&id| self.get(id).acting_rank() != rank)
            .collect();
        for id in leaving {
            let agent = *self.get(id);
            dest.push(agent.acting_rank());
            ints.extend_from_slice(&[
                agent.mode.to_int(),
                agent.home as i64,
                agent.node as i64,
                agent.part as i64,
                agent.seed as i64,
                agent.step as i64,
            ]);
            dbls.extend_from_slice(&agent.xyz);
            dbls.extend_from_slice(&agent.bary);
            self.remove(id)?;
        }
        let got_ints = comm.blindsend_ints(&dest, &ints, 6);
        let got_dbls = comm.blindsend_dbls(&dest, &dbls, 7);
        for slot in 0..got_ints.len() / 6 {
            let ints = &got_ints[6 * slot..6 * slot + 6];
            let dbls = &got_dbls[7 * slot..7 * slot + 7];
            self.insert(Agent {
                mode: AgentMode::from_int(ints[0])?,
                home: ints[1] as usize,
                node: ints[2] as usize,
                part: ints[3] as usize,
                seed: ints[4] as usize,
                step: ints[5] as usize,
                xyz: [dbls[0], dbls[1], dbls[2]],
                bary: [dbls[3], dbls[4], dbls[5], dbls[6]],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::with_fabric;

    #[test]
    fn push_remove_recycle() {
        let mut pool = AgentPool::new();
        let a = pool.push(3, 0, 17, [0.0; 3], 0);
        let b = pool.push(4, 0, 18, [0.0; 3], 0);
        assert_eq!(pool.n(), 2);
        pool.remove(a).unwrap();
        assert!(pool.remove(a).is_err());
        let c = pool.push(5, 0, 19, [0.0; 3], 0);
        assert_eq!(c, a);
        assert_eq!(pool.n(), 2);
        assert_eq!(pool.get(b).node, 4);
    }

    #[test]
    fn delete_for_node_targets_home_agents() {
        let mut pool = AgentPool::new();
        pool.push(3, 0, 17, [0.0; 3], 0);
        assert!(pool.delete_for_node(9, 0).is_err());
        pool.delete_for_node(3, 0).unwrap();
        assert_eq!(pool.n(), 0);
    }

    #[test]
    fn migrate_ships_to_acting_rank() {
        let counts = with_fabric(2, |comm| {
            let mut pool = AgentPool::new();
            if comm.rank() == 0 {
                // walking on part 1: must leave rank 0
                let id = pool.push(7, 1, 42, [1.0, 2.0, 3.0], 0);
                pool.get_mut(id).step = 5;
            }
            pool.migrate(&comm).unwrap();
            let carried: Vec<Agent> = pool.active().map(|id| *pool.get(id)).collect();
            carried
        });
        assert!(counts[0].is_empty());
        assert_eq!(counts[1].len(), 1);
        let agent = counts[1][0];
        assert_eq!(agent.mode, AgentMode::Walking);
        assert_eq!(agent.seed, 42);
        assert_eq!(agent.step, 5);
        assert_eq!(agent.xyz, [1.0, 2.0, 3.0]);
    }
}
