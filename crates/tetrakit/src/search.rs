//! Bounding-sphere search tree over donor cells.
//!
//! A binary tree built by median split on the widest axis of the subtree's
//! sphere centers. Each node keeps, around its own center, the radius of a
//! ball covering every descendant sphere, so a query can prune whole
//! subtrees that cannot touch the probe point.

use crate::math::distance;

#[derive(Debug, Clone, Copy)]
struct Sphere {
    item: usize,
    center: [f64; 3],
    radius: f64,
}

#[derive(Debug)]
struct TreeNode {
    sphere: Sphere,
    cover_radius: f64,
    left: usize,
    right: usize,
}

const LEAF: usize = usize::MAX;

#[derive(Debug, Default)]
pub struct SearchTree {
    nodes: Vec<TreeNode>,
    root: usize,
}

impl SearchTree {
    /// Build from (item, center, radius) triples; radii arrive pre-scaled by
    /// the caller's donor scale.
    pub fn build(spheres: &[(usize, [f64; 3], f64)]) -> SearchTree {
        let mut pool: Vec<Sphere> = spheres
            .iter()
            .map(|&(item, center, radius)| Sphere {
                item,
                center,
                radius,
            })
            .collect();
        let mut tree = SearchTree {
            nodes: Vec::with_capacity(pool.len()),
            root: LEAF,
        };
        let n = pool.len();
        tree.root = tree.split(&mut pool, 0, n);
        tree
    }

    pub fn n(&self) -> usize {
        self.nodes.len()
    }

    fn split(&mut self, pool: &mut [Sphere], lo: usize, hi: usize) -> usize {
        if lo >= hi {
            return LEAF;
        }
        let axis = widest_axis(&pool[lo..hi]);
        pool[lo..hi].sort_unstable_by(|a, b| a.center[axis].total_cmp(&b.center[axis]));
        let mid = lo + (hi - lo) / 2;
        let sphere = pool[mid];
        let slot = self.nodes.len();
        self.nodes.push(TreeNode {
            sphere,
            cover_radius: sphere.radius,
            left: LEAF,
            right: LEAF,
        });
        let left = self.split(pool, lo, mid);
        let right = self.split(pool, mid + 1, hi);
        self.nodes[slot].left = left;
        self.nodes[slot].right = right;
        let mut cover = self.nodes[slot].sphere.radius;
        for child in [left, right] {
            if child != LEAF {
                let reach = distance(&self.nodes[slot].sphere.center, &self.nodes[child].sphere.center)
                    + self.nodes[child].cover_radius;
                cover = cover.max(reach);
            }
        }
        self.nodes[slot].cover_radius = cover;
        slot
    }

    /// Items whose sphere touches `point` expanded by `fuzz`.
    pub fn touching(&self, point: &[f64; 3], fuzz: f64) -> Vec<usize> {
        let mut found = Vec::new();
        if !self.nodes.is_empty() {
            self.visit(self.root, point, fuzz, &mut found);
        }
        found
    }

    fn visit(&self, slot: usize, point: &[f64; 3], fuzz: f64, found: &mut Vec<usize>) {
        let node = &self.nodes[slot];
        let dist = distance(point, &node.sphere.center);
        if dist > node.cover_radius + fuzz {
            return;
        }
        if dist <= node.sphere.radius + fuzz {
            found.push(node.sphere.item);
        }
        if node.left != LEAF {
            self.visit(node.left, point, fuzz, found);
        }
        if node.right != LEAF {
            self.visit(node.right, point, fuzz, found);
        }
    }
}

fn widest_axis(spheres: &[Sphere]) -> usize {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for sphere in spheres {
        for axis in 0..3 {
            lo[axis] = lo[axis].min(sphere.center[axis]);
            hi[axis] = hi[axis].max(sphere.center[axis]);
        }
    }
    let mut axis = 0;
    for candidate in 1..3 {
        if hi[candidate] - lo[candidate] > hi[axis] - lo[axis] {
            axis = candidate;
        }
    }
    axis
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_line(n: usize) -> Vec<(usize, [f64; 3], f64)> {
        (0..n)
            .map(|i| (i, [i as f64, 0.0, 0.0], 0.6))
            .collect()
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let tree = SearchTree::build(&[]);
        assert!(tree.touching(&[0.0, 0.0, 0.0], 1.0).is_empty());
    }

    #[test]
    fn touching_reports_overlapping_spheres() {
        let tree = SearchTree::build(&unit_line(10));
        let mut found = tree.touching(&[3.5, 0.0, 0.0], 0.0);
        found.sort_unstable();
        assert_eq!(found, vec![3, 4]);
    }

    #[test]
    fn fuzz_expands_the_probe() {
        let tree = SearchTree::build(&unit_line(10));
        assert!(tree.touching(&[3.0, 1.0, 0.0], 0.0).is_empty());
        let mut found = tree.touching(&[3.0, 1.0, 0.0], 0.5);
        found.sort_unstable();
        assert_eq!(found, vec![3]);
    }

    #[test]
    fn every_sphere_is_reachable() {
        // probing at each center must at least find that sphere
        let spheres: Vec<(usize, [f64; 3], f64)> = (0..50)
            .map(|i| {
                let f = i as f64;
                (
                    i,
                    [f.sin() * 5.0, (2.0 * f).cos() * 3.0, f * 0.1],
                    0.05,
                )
            })
            .collect();
        let tree = SearchTree::build(&spheres);
        assert_eq!(tree.n(), 50);
        for (item, center, _) in &spheres {
            assert!(tree.touching(center, 0.0).contains(item));
        }
    }

    #[test]
    fn far_probe_prunes_to_nothing() {
        let tree = SearchTree::build(&unit_line(100));
        assert!(tree.touching(&[1000.0, 0.0, 0.0], 1.0e-12).is_empty());
    }
}
