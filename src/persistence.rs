//! Saving and loading trees by name.
use crate::tree::MwTree;
use crate::types::{MwError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Storage of serialised trees.
pub trait TreeStore {
    /// Store `tree` under `name`, replacing an earlier entry.
    fn save_tree<const D: usize>(&self, name: &str, tree: &MwTree<D>) -> Result<()>;

    /// Replace `tree` by the tree stored under `name`.
    fn load_tree<const D: usize>(&self, name: &str, tree: &mut MwTree<D>) -> Result<()>;
}

/// Trees kept in memory in their transfer format.
#[derive(Debug, Default)]
pub struct MemoryStore {
    trees: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the stored trees, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.trees.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop the tree stored under `name`.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.trees
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MwError::NotFound(name.to_string()))
    }
}

impl TreeStore for MemoryStore {
    fn save_tree<const D: usize>(&self, name: &str, tree: &MwTree<D>) -> Result<()> {
        let bytes = tree.to_bytes();
        self.trees.lock().unwrap().insert(name.to_string(), bytes);
        Ok(())
    }

    fn load_tree<const D: usize>(&self, name: &str, tree: &mut MwTree<D>) -> Result<()> {
        let trees = self.trees.lock().unwrap();
        let bytes = trees
            .get(name)
            .ok_or_else(|| MwError::NotFound(name.to_string()))?;
        tree.load_bytes(bytes)?;
        tree.set_name(name);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::basis::ScalingBasis;
    use crate::builder::project;
    use crate::mra::{BoundingBox, MultiResolutionAnalysis};
    use approx::*;

    fn mra() -> MultiResolutionAnalysis<1> {
        MultiResolutionAnalysis::with_max_scale(
            BoundingBox::unit(),
            ScalingBasis::interpolating(4).unwrap(),
            10,
        )
        .unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryStore::new();
        let mut f = MwTree::new(mra());
        project(&mut f, 1e-6, false, |r| (8.0 * r[0]).cos());
        store.save_tree("f", &f).unwrap();
        assert_eq!(store.names(), vec!["f".to_string()]);

        let mut g = MwTree::new(mra());
        store.load_tree("f", &mut g).unwrap();
        assert_eq!(g.name(), "f");
        assert_eq!(g.n_nodes(), f.n_nodes());
        assert_relative_eq!(g.evalf(&[0.41]), f.evalf(&[0.41]), epsilon = 1e-15);

        store.remove("f").unwrap();
        assert!(matches!(store.load_tree("f", &mut g), Err(MwError::NotFound(_))));
        assert!(matches!(store.remove("f"), Err(MwError::NotFound(_))));
    }
}
