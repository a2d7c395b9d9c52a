//! Cell shuffling, repartitioning, and ghost reconstruction.
//!
//! A cell lives on every rank owning one of its vertices and is mutated only
//! by the rank owning its lowest-part vertex. `shuffle` restores that
//! replication after streaming reads; `rebalance` moves vertex ownership to
//! a fresh partition assignment and rebuilds the one-layer ghost.

use petgraph::graph::{NodeIndex, UnGraph};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cell::CellKind;
use crate::edge::EdgeTable;
use crate::error::Result;
use crate::grid::Grid;

/// Replicate every local cell onto each rank owning one of its nodes,
/// materializing ghost vertices as needed. Idempotent.
pub fn shuffle(grid: &mut Grid) -> Result<()> {
    let comm = std::sync::Arc::clone(&grid.comm);
    if !comm.para() {
        return Ok(());
    }
    for kind in CellKind::ALL {
        let node_per = kind.node_per();
        let mut dest = Vec::new();
        let mut ints = Vec::new();
        let mut dbls = Vec::new();
        {
            let table = grid.cells(kind);
            for cell in table.valid_cells() {
                let nodes = table.nodes_of(cell)?;
                let mut targets: Vec<usize> = nodes
                    .iter()
                    .map(|&node| grid.nodes.part(node))
                    .filter(|&part| part != comm.rank())
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                for target in targets {
                    dest.push(target);
                    ints.push(table.surface_id(cell)?);
                    for &node in nodes {
                        ints.push(grid.nodes.global(node));
                        ints.push(grid.nodes.part(node) as i64);
                    }
                    for &node in nodes {
                        dbls.extend_from_slice(grid.nodes.xyz(node));
                    }
                }
            }
        }
        let got_ints = comm.blindsend_ints(&dest, &ints, 1 + 2 * node_per);
        let got_dbls = comm.blindsend_dbls(&dest, &dbls, 3 * node_per);
        let stride = 1 + 2 * node_per;
        for slot in 0..got_ints.len() / stride {
            let record = &got_ints[stride * slot..stride * (slot + 1)];
            let id = record[0];
            let mut locals = Vec::with_capacity(node_per);
            for (pick, chunk) in record[1..].chunks_exact(2).enumerate() {
                let local = grid.nodes.add(chunk[0])?;
                grid.nodes.set_part(local, chunk[1] as usize);
                let base = 3 * node_per * slot + 3 * pick;
                grid.nodes
                    .set_xyz(local, [got_dbls[base], got_dbls[base + 1], got_dbls[base + 2]]);
                locals.push(local);
            }
            grid.add_cell(kind, &locals, id)?;
        }
    }
    Ok(())
}

/// Choose a fresh partition for every owned vertex by balanced BFS growth
/// over the global vertex-adjacency graph, assembled on rank 0. Returns the
/// new part of each local slot (ghost slots keep their stale part until the
/// rebalance exchange refreshes them).
pub fn to_balance(grid: &Grid) -> Result<Vec<usize>> {
    let comm = &grid.comm;
    let rank = comm.rank();

    let mut vert_dest = Vec::new();
    let mut vert_global = Vec::new();
    let mut vert_home = Vec::new();
    for node in grid.nodes.iter_valid() {
        if grid.nodes.owned(node) {
            vert_dest.push(0);
            vert_global.push(grid.nodes.global(node));
            vert_home.push(rank as i64);
        }
    }
    let edges = EdgeTable::create(grid);
    let mut edge_dest = Vec::new();
    let mut edge_pairs = Vec::new();
    for [node0, node1] in edges.iter() {
        edge_dest.push(0);
        edge_pairs.push(grid.nodes.global(node0));
        edge_pairs.push(grid.nodes.global(node1));
    }

    let all_globals = comm.blindsend_ints(&vert_dest, &vert_global, 1);
    let all_homes = comm.blindsend_ints(&vert_dest, &vert_home, 1);
    let all_edges = comm.blindsend_ints(&edge_dest, &edge_pairs, 2);

    // root grows size-balanced regions from the lowest unassigned global
    let mut assign_dest = Vec::new();
    let mut assign_ints = Vec::new();
    if comm.once() {
        let mut graph = UnGraph::<i64, ()>::default();
        let mut index_of: FxHashMap<i64, NodeIndex> = FxHashMap::default();
        let mut order: Vec<usize> = (0..all_globals.len()).collect();
        order.sort_by_key(|&slot| all_globals[slot]);
        for &slot in &order {
            index_of
                .entry(all_globals[slot])
                .or_insert_with(|| graph.add_node(all_globals[slot]));
        }
        for pair in all_edges.chunks_exact(2) {
            if let (Some(&a), Some(&b)) = (index_of.get(&pair[0]), index_of.get(&pair[1])) {
                if graph.find_edge(a, b).is_none() {
                    graph.add_edge(a, b, ());
                }
            }
        }

        let total = graph.node_count();
        let target = total.div_ceil(comm.size());
        let mut part_of: FxHashMap<i64, usize> = FxHashMap::default();
        let mut part = 0usize;
        let mut filled = 0usize;
        let mut queue = std::collections::VecDeque::new();
        let mut seeds: Vec<i64> = index_of.keys().copied().collect();
        seeds.sort_unstable();
        let mut next_seed = 0usize;
        while part_of.len() < total {
            if queue.is_empty() {
                while next_seed < seeds.len() && part_of.contains_key(&seeds[next_seed]) {
                    next_seed += 1;
                }
                queue.push_back(index_of[&seeds[next_seed]]);
            }
            let Some(at) = queue.pop_front() else { continue };
            let global = graph[at];
            if part_of.contains_key(&global) {
                continue;
            }
            part_of.insert(global, part);
            filled += 1;
            if filled >= target && part + 1 < comm.size() {
                part += 1;
                filled = 0;
                queue.clear();
            } else {
                let mut around: Vec<i64> =
                    graph.neighbors(at).map(|index| graph[index]).collect();
                around.sort_unstable();
                for neighbor in around {
                    if !part_of.contains_key(&neighbor) {
                        queue.push_back(index_of[&neighbor]);
                    }
                }
            }
        }
        debug!("balanced {total} vertices over {} parts", comm.size());

        for (slot, &global) in all_globals.iter().enumerate() {
            assign_dest.push(all_homes[slot] as usize);
            assign_ints.push(global);
            assign_ints.push(part_of[&global] as i64);
        }
    }
    let got = comm.blindsend_ints(&assign_dest, &assign_ints, 2);

    let mut new_part: Vec<usize> = (0..grid.nodes.max())
        .map(|node| {
            if grid.nodes.valid(node) {
                grid.nodes.part(node)
            } else {
                0
            }
        })
        .collect();
    for chunk in got.chunks_exact(2) {
        let local = grid.nodes.local(chunk[0])?;
        new_part[local] = chunk[1] as usize;
    }
    Ok(new_part)
}

/// Move the mesh onto a fresh vertex partition: ship vertex records and
/// cells to their new owners, rebuild adjacency, and reinstate the
/// one-layer ghost. Any interpolator built against the old numbering must
/// be recreated.
pub fn rebalance(grid: &mut Grid) -> Result<()> {
    let comm = std::sync::Arc::clone(&grid.comm);
    let rank = comm.rank();
    let n_global = grid.nodes.n_global();

    let mut new_part = to_balance(grid)?;
    {
        let mut field: Vec<i64> = new_part.iter().map(|&part| part as i64).collect();
        grid.nodes.ghost_sync_int(&comm, &mut field, 1)?;
        for (slot, &value) in field.iter().enumerate() {
            new_part[slot] = value as usize;
        }
    }

    // owned vertex records to their new owners
    let mut vert_dest = Vec::new();
    let mut vert_ints = Vec::new();
    let mut vert_dbls = Vec::new();
    for node in grid.nodes.iter_valid() {
        if !grid.nodes.owned(node) {
            continue;
        }
        vert_dest.push(new_part[node]);
        vert_ints.push(grid.nodes.global(node));
        vert_dbls.extend_from_slice(grid.nodes.xyz(node));
        vert_dbls.extend_from_slice(grid.nodes.metric_get_log(node));
    }

    // owned cells to every rank holding one of their vertices afterwards
    let mut cell_dest: Vec<Vec<usize>> = vec![Vec::new(); CellKind::ALL.len()];
    let mut cell_ints: Vec<Vec<i64>> = vec![Vec::new(); CellKind::ALL.len()];
    let mut cell_dbls: Vec<Vec<f64>> = vec![Vec::new(); CellKind::ALL.len()];
    for (pick, &kind) in CellKind::ALL.iter().enumerate() {
        let table = grid.cells(kind);
        for cell in table.valid_cells() {
            if grid.cell_owner(kind, cell)? != rank {
                continue;
            }
            let nodes = table.nodes_of(cell)?;
            let mut targets: Vec<usize> = nodes.iter().map(|&node| new_part[node]).collect();
            targets.sort_unstable();
            targets.dedup();
            for target in targets {
                cell_dest[pick].push(target);
                cell_ints[pick].push(table.surface_id(cell)?);
                for &node in nodes {
                    cell_ints[pick].push(grid.nodes.global(node));
                    cell_ints[pick].push(new_part[node] as i64);
                }
                for &node in nodes {
                    cell_dbls[pick].extend_from_slice(grid.nodes.xyz(node));
                }
            }
        }
    }

    // geometry records ride with their vertices
    let mut geom_dest = Vec::new();
    let mut geom_ints = Vec::new();
    let mut geom_dbls = Vec::new();
    for node in grid.nodes.iter_valid() {
        if !grid.nodes.owned(node) {
            continue;
        }
        for record in grid.geom.records_of(node) {
            geom_dest.push(new_part[node]);
            geom_ints.extend_from_slice(&[
                grid.nodes.global(node),
                record.kind.index() as i64,
                record.id,
                i64::from(record.gref.is_some()),
                record.gref.unwrap_or(0),
            ]);
            geom_dbls.extend_from_slice(&record.param);
        }
    }

    let got_vert_ints = comm.blindsend_ints(&vert_dest, &vert_ints, 1);
    let got_vert_dbls = comm.blindsend_dbls(&vert_dest, &vert_dbls, 9);
    let mut got_cells = Vec::new();
    for (pick, &kind) in CellKind::ALL.iter().enumerate() {
        let node_per = kind.node_per();
        let ints = comm.blindsend_ints(&cell_dest[pick], &cell_ints[pick], 1 + 2 * node_per);
        let dbls = comm.blindsend_dbls(&cell_dest[pick], &cell_dbls[pick], 3 * node_per);
        got_cells.push((kind, ints, dbls));
    }
    let got_geom_ints = comm.blindsend_ints(&geom_dest, &geom_ints, 5);
    let got_geom_dbls = comm.blindsend_dbls(&geom_dest, &geom_dbls, 2);

    // rebuild this partition from the received records
    grid.nodes = crate::node::NodeTable::new(rank);
    grid.nodes.initialize_n_global(n_global);
    for kind in CellKind::ALL {
        *grid.cells_mut(kind) = crate::cell::CellTable::new(kind);
    }
    grid.geom = crate::geom::GeomTable::new();

    for (slot, &global) in got_vert_ints.iter().enumerate() {
        let local = grid.nodes.add(global)?;
        grid.nodes.set_part(local, rank);
        grid.nodes.set_xyz(
            local,
            [
                got_vert_dbls[9 * slot],
                got_vert_dbls[9 * slot + 1],
                got_vert_dbls[9 * slot + 2],
            ],
        );
        let mut log_m = [0.0; 6];
        log_m.copy_from_slice(&got_vert_dbls[9 * slot + 3..9 * slot + 9]);
        grid.nodes.metric_set_log(local, log_m);
    }

    for (kind, ints, dbls) in got_cells {
        let node_per = kind.node_per();
        let stride = 1 + 2 * node_per;
        for slot in 0..ints.len() / stride {
            let record = &ints[stride * slot..stride * (slot + 1)];
            let id = record[0];
            let mut locals = Vec::with_capacity(node_per);
            for (pick, chunk) in record[1..].chunks_exact(2).enumerate() {
                let local = grid.nodes.add(chunk[0])?;
                grid.nodes.set_part(local, chunk[1] as usize);
                let base = 3 * node_per * slot + 3 * pick;
                grid.nodes
                    .set_xyz(local, [dbls[base], dbls[base + 1], dbls[base + 2]]);
                locals.push(local);
            }
            grid.add_cell(kind, &locals, id)?;
        }
    }

    for slot in 0..got_geom_ints.len() / 5 {
        let record = &got_geom_ints[5 * slot..5 * slot + 5];
        let local = grid.nodes.local(record[0])?;
        let kind = crate::geom::GeomKind::from_index(record[1] as usize)?;
        let param = [got_geom_dbls[2 * slot], got_geom_dbls[2 * slot + 1]];
        grid.geom.add(local, kind, record[2], &param)?;
        if record[3] != 0 {
            grid.geom.set_gref(local, kind, record[2], record[4])?;
        }
    }

    grid.geom.ghost(&comm, &grid.nodes)?;
    grid.nodes.ghost_real(&comm)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::with_fabric;
    use crate::grid::fixtures::six_tet_cube;
    use crate::part;
    use crate::validate;
    use std::sync::Arc;

    #[test]
    fn solo_rebalance_is_identity() {
        let mut grid = six_tet_cube();
        rebalance(&mut grid).unwrap();
        assert_eq!(grid.nodes.n(), 8);
        assert_eq!(grid.tet().n(), 6);
        assert_eq!(grid.tri().n(), 12);
        validate::all(&grid).unwrap();
    }

    #[test]
    fn two_rank_rebalance_keeps_the_mesh_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.lb8.ugrid");
        part::write_ugrid(&six_tet_cube(), &path, false).unwrap();
        let results = with_fabric(2, |comm| {
            let mut grid = part::read_by_extension(Arc::new(comm), &path).unwrap();
            rebalance(&mut grid).unwrap();
            validate::cell_node(&grid).unwrap();
            validate::cell_volume(&grid).unwrap();
            validate::unused_node(&grid).unwrap();
            let owned = grid
                .nodes
                .iter_valid()
                .filter(|&node| grid.nodes.owned(node))
                .count();
            let owned_tets = grid
                .tet()
                .valid_cells()
                .filter(|&cell| {
                    grid.cell_owner(crate::cell::CellKind::Tet, cell).unwrap() == grid.comm.rank()
                })
                .count();
            (owned, owned_tets)
        });
        let total_owned: usize = results.iter().map(|&(owned, _)| owned).sum();
        let total_tets: usize = results.iter().map(|&(_, tets)| tets).sum();
        assert_eq!(total_owned, 8);
        assert_eq!(total_tets, 6);
        // the split leaves both ranks with work
        assert!(results.iter().all(|&(owned, _)| owned == 4));
    }

    #[test]
    fn to_balance_splits_evenly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tet.lb8.ugrid");
        part::write_ugrid(&crate::grid::fixtures::single_tet(), &path, false).unwrap();
        let results = with_fabric(2, |comm| {
            let grid = part::read_by_extension(Arc::new(comm), &path).unwrap();
            let new_part = to_balance(&grid).unwrap();
            let mut owned_targets: Vec<usize> = grid
                .nodes
                .iter_valid()
                .filter(|&node| grid.nodes.owned(node))
                .map(|node| new_part[node])
                .collect();
            owned_targets.sort_unstable();
            owned_targets
        });
        let mut counts = [0usize; 2];
        for targets in results {
            for part in targets {
                counts[part] += 1;
            }
        }
        assert_eq!(counts, [2, 2]);
    }
}
