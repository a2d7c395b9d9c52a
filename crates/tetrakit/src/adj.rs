//! Chained node-to-item adjacency.
//!
//! An arena of (item, next) entries with an explicit free list; the head of
//! each node's chain is an index into the same arena. Entries never move on
//! add, so iteration stays valid while other nodes mutate.

/// Sentinel for "no entry" in arena and head arrays.
pub const EMPTY: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct NodeItem {
    item: usize,
    next: usize,
}

#[derive(Debug, Default, Clone)]
pub struct Adj {
    first: Vec<usize>,
    arena: Vec<NodeItem>,
    blank: usize,
}

impl Adj {
    pub fn new() -> Adj {
        Adj {
            first: Vec::new(),
            arena: Vec::new(),
            blank: EMPTY,
        }
    }

    fn grow_nodes(&mut self, node: usize) {
        if node >= self.first.len() {
            self.first.resize(node + 1, EMPTY);
        }
    }

    pub fn add(&mut self, node: usize, item: usize) {
        self.grow_nodes(node);
        let slot = if self.blank != EMPTY {
            let slot = self.blank;
            self.blank = self.arena[slot].next;
            slot
        } else {
            self.arena.push(NodeItem {
                item: EMPTY,
                next: EMPTY,
            });
            self.arena.len() - 1
        };
        self.arena[slot] = NodeItem {
            item,
            next: self.first[node],
        };
        self.first[node] = slot;
    }

    /// Unlink one occurrence of `item` from `node`'s chain; false on a miss.
    pub fn remove(&mut self, node: usize, item: usize) -> bool {
        if node >= self.first.len() {
            return false;
        }
        let mut previous = EMPTY;
        let mut current = self.first[node];
        while current != EMPTY {
            if self.arena[current].item == item {
                if previous == EMPTY {
                    self.first[node] = self.arena[current].next;
                } else {
                    self.arena[previous].next = self.arena[current].next;
                }
                self.arena[current] = NodeItem {
                    item: EMPTY,
                    next: self.blank,
                };
                self.blank = current;
                return true;
            }
            previous = current;
            current = self.arena[current].next;
        }
        false
    }

    pub fn empty(&self, node: usize) -> bool {
        node >= self.first.len() || self.first[node] == EMPTY
    }

    pub fn degree(&self, node: usize) -> usize {
        self.items(node).count()
    }

    pub fn exists(&self, node: usize, item: usize) -> bool {
        self.items(node).any(|it| it == item)
    }

    pub fn items(&self, node: usize) -> AdjIter<'_> {
        AdjIter {
            adj: self,
            cursor: if node < self.first.len() {
                self.first[node]
            } else {
                EMPTY
            },
        }
    }
}

pub struct AdjIter<'a> {
    adj: &'a Adj,
    cursor: usize,
}

impl Iterator for AdjIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == EMPTY {
            return None;
        }
        let entry = self.adj.arena[self.cursor];
        self.cursor = entry.next;
        Some(entry.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_iterate() {
        let mut adj = Adj::new();
        adj.add(2, 10);
        adj.add(2, 11);
        adj.add(0, 5);
        let mut items: Vec<usize> = adj.items(2).collect();
        items.sort_unstable();
        assert_eq!(items, vec![10, 11]);
        assert_eq!(adj.items(0).collect::<Vec<_>>(), vec![5]);
        assert!(adj.empty(1));
        assert!(adj.empty(99));
    }

    #[test]
    fn remove_recycles_entries() {
        let mut adj = Adj::new();
        adj.add(0, 7);
        adj.add(0, 8);
        assert!(adj.remove(0, 7));
        assert!(!adj.remove(0, 7));
        assert_eq!(adj.degree(0), 1);
        // the freed slot is reused before the arena grows
        let before = adj.arena.len();
        adj.add(1, 9);
        assert_eq!(adj.arena.len(), before);
        assert!(adj.exists(1, 9));
    }

    #[test]
    fn degree_counts_chain() {
        let mut adj = Adj::new();
        for item in 0..5 {
            adj.add(3, item);
        }
        assert_eq!(adj.degree(3), 5);
        assert_eq!(adj.degree(2), 0);
    }
}
