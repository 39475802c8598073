//! Union-Find (Disjoint Set Union) over dense indices.
//!
//! Used to cut agglomerative dendrograms, to build the single-linkage tree
//! for density clustering, and to merge epsilon-connected components.

/// Union-Find with path compression, union by rank and set sizes.
///
/// # Example
/// ```
/// use bizmap::union_find::UnionFind;
///
/// let mut uf = UnionFind::new(3);
/// uf.union(0, 1);
/// assert_eq!(uf.find(0), uf.find(1));
/// assert_ne!(uf.find(0), uf.find(2));
/// assert_eq!(uf.set_size(1), 2);
/// ```
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
    size: Vec<usize>,
}

impl UnionFind {
    /// Create `n` singleton sets `0..n`.
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
            size: vec![1; n],
        }
    }

    /// Find the root of the set containing `item`.
    ///
    /// Iterative with full path compression so long chains cannot overflow
    /// the stack.
    pub fn find(&mut self, item: usize) -> usize {
        let mut root = item;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = item;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Union the sets containing `a` and `b`.
    ///
    /// Returns the new root, or `None` if they were already joined.
    pub fn union(&mut self, a: usize, b: usize) -> Option<usize> {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return None;
        }

        let (winner, loser) = match self.rank[root_a].cmp(&self.rank[root_b]) {
            std::cmp::Ordering::Less => (root_b, root_a),
            std::cmp::Ordering::Greater => (root_a, root_b),
            std::cmp::Ordering::Equal => {
                self.rank[root_a] += 1;
                (root_a, root_b)
            }
        };
        self.parent[loser] = winner;
        self.size[winner] += self.size[loser];
        Some(winner)
    }

    /// Check if two elements are in the same set.
    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Number of elements in the set containing `item`.
    pub fn set_size(&mut self, item: usize) -> usize {
        let root = self.find(item);
        self.size[root]
    }

    /// Group indices by set, groups ordered by their smallest member.
    pub fn groups(&mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut slot_of_root: Vec<Option<usize>> = vec![None; n];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for item in 0..n {
            let root = self.find(item);
            let slot = *slot_of_root[root].get_or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(item);
        }
        groups
    }

    /// Get the number of elements in the structure.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Check if the structure is empty.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}
