//! Disjoint-set forest over dense indices.
//!
//! Path halving on `find`, union by size. Representatives are an internal
//! detail and must not be exposed as identifiers.

#[derive(Debug, Clone)]
pub struct DisjointSet {
    parent: Vec<usize>,
    size:   Vec<usize>,
}

impl DisjointSet {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size:   vec![1; n],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets holding `a` and `b`. Returns false if already joined.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    /// Union every member into the first one. O(members), no pairs.
    pub fn union_all(&mut self, members: &[usize]) -> usize {
        let Some((&first, rest)) = members.split_first() else { return 0 };
        rest.iter().filter(|&&m| self.union(first, m)).count()
    }

    pub fn set_size(&mut self, x: usize) -> usize {
        let root = self.find(x);
        self.size[root]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singletons_until_joined() {
        let mut ds = DisjointSet::new(4);
        assert_ne!(ds.find(0), ds.find(1));
        assert!(ds.union(0, 1));
        assert!(!ds.union(1, 0));
        assert_eq!(ds.find(0), ds.find(1));
        assert_eq!(ds.set_size(1), 2);
        assert_eq!(ds.set_size(3), 1);
    }

    #[test]
    fn union_all_joins_a_hub_in_one_pass() {
        let mut ds = DisjointSet::new(6);
        assert_eq!(ds.union_all(&[1, 3, 5]), 2);
        assert_eq!(ds.union_all(&[5, 3]), 0);
        assert_eq!(ds.union_all(&[]), 0);
        assert_eq!(ds.set_size(3), 3);
        assert_ne!(ds.find(0), ds.find(1));
    }

    #[test]
    fn long_chains_stay_connected() {
        let n = 10_000;
        let mut ds = DisjointSet::new(n);
        for i in 1..n {
            ds.union(i - 1, i);
        }
        let root = ds.find(0);
        assert!((0..n).all(|i| ds.find(i) == root));
        assert_eq!(ds.set_size(n - 1), n);
    }
}
