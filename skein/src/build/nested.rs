//! Layered (nested) artifact sets.
//!
//! Transitive input sets form a DAG shared across the whole action graph:
//! each set holds its direct items plus handles to child sets. Sets are
//! interned, so re-analyzing an unchanged target reproduces identical
//! handles and value equality keeps downstream nodes clean.
//!
//! Fingerprinting follows the cache-key discipline: per set, the sorted
//! (path, digest) pairs of the direct items are hashed together with the
//! sorted fingerprints of the child sets, visiting each shared sub-set once
//! and never materializing the flat list.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use skein_data::{ContentHasher, Fingerprint, HashFunction};

use crate::build::artifact::Artifact;

/// Iteration discipline of one set. The same discipline drives both
/// `flatten` and fingerprinting, so cache keys never depend on traversal
/// accidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Order {
    /// Direct items before transitive children.
    Preorder,
    /// Transitive children before direct items.
    Postorder,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SetHandle(usize);

#[derive(Clone, PartialEq, Eq, Hash)]
struct SetNode {
    order: Order,
    direct: Vec<Artifact>,
    children: Vec<SetHandle>,
}

/// Append-only interning store for nested sets. Shared process-wide through
/// the build environment; handles stay valid for the store's lifetime.
#[derive(Default)]
pub struct NestedSetStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    nodes: Vec<SetNode>,
    interned: HashMap<SetNode, SetHandle>,
}

impl NestedSetStore {
    pub fn new() -> NestedSetStore {
        NestedSetStore::default()
    }

    pub fn create(
        &self,
        order: Order,
        direct: Vec<Artifact>,
        children: Vec<SetHandle>,
    ) -> SetHandle {
        let node = SetNode { order, direct, children };
        let mut inner = self.inner.lock().unwrap();
        if let Some(&h) = inner.interned.get(&node) {
            return h;
        }
        let h = SetHandle(inner.nodes.len());
        inner.nodes.push(node.clone());
        inner.interned.insert(node, h);
        h
    }

    pub fn empty(&self) -> SetHandle {
        self.create(Order::Preorder, Vec::new(), Vec::new())
    }

    pub fn leaf(&self, direct: Vec<Artifact>) -> SetHandle {
        self.create(Order::Preorder, direct, Vec::new())
    }

    /// Visits every artifact in declared order, deduplicated, without
    /// building the flat list for shared sub-DAGs more than once.
    pub fn for_each(&self, handle: SetHandle, mut f: impl FnMut(&Artifact)) {
        let inner = self.inner.lock().unwrap();
        let mut visited_sets = HashSet::new();
        let mut emitted = HashSet::new();
        visit(&inner.nodes, handle, &mut visited_sets, &mut emitted, &mut f);

        fn visit(
            nodes: &[SetNode],
            handle: SetHandle,
            visited: &mut HashSet<SetHandle>,
            emitted: &mut HashSet<Artifact>,
            f: &mut impl FnMut(&Artifact),
        ) {
            if !visited.insert(handle) {
                return;
            }
            let node = &nodes[handle.0];
            let emit_direct = |emitted: &mut HashSet<Artifact>, f: &mut dyn FnMut(&Artifact)| {
                for item in &node.direct {
                    if emitted.insert(item.clone()) {
                        f(item);
                    }
                }
            };
            match node.order {
                Order::Preorder => {
                    emit_direct(emitted, f);
                    for &child in &node.children {
                        visit(nodes, child, visited, emitted, f);
                    }
                }
                Order::Postorder => {
                    for &child in &node.children {
                        visit(nodes, child, visited, emitted, f);
                    }
                    emit_direct(emitted, f);
                }
            }
        }
    }

    /// The deduplicated artifact list in declared order.
    pub fn flatten(&self, handle: SetHandle) -> Vec<Artifact> {
        let mut out = Vec::new();
        self.for_each(handle, |a| out.push(a.clone()));
        out
    }

    /// Fingerprint of the set under `leaf_fp`, which supplies each direct
    /// item's content contribution. Shared sub-sets are hashed once.
    pub fn fingerprint(
        &self,
        handle: SetHandle,
        hash: HashFunction,
        leaf_fp: &dyn Fn(&Artifact) -> Fingerprint,
    ) -> Fingerprint {
        let inner = self.inner.lock().unwrap();
        let mut memo: HashMap<SetHandle, Fingerprint> = HashMap::new();
        return go(&inner.nodes, handle, hash, leaf_fp, &mut memo);

        fn go(
            nodes: &[SetNode],
            handle: SetHandle,
            hash: HashFunction,
            leaf_fp: &dyn Fn(&Artifact) -> Fingerprint,
            memo: &mut HashMap<SetHandle, Fingerprint>,
        ) -> Fingerprint {
            if let Some(fp) = memo.get(&handle) {
                return fp.clone();
            }
            let node = &nodes[handle.0];
            let mut leaves: Vec<(String, Fingerprint)> = node
                .direct
                .iter()
                .map(|a| (a.exec_path().to_owned(), leaf_fp(a)))
                .collect();
            leaves.sort();
            let mut children: Vec<Fingerprint> =
                node.children.iter().map(|&c| go(nodes, c, hash, leaf_fp, memo)).collect();
            children.sort();

            let mut hasher = ContentHasher::new(hash);
            hasher.input_u64(leaves.len() as u64);
            for (path, fp) in &leaves {
                hasher.input_str(path).input_str(fp.hex());
            }
            hasher.input_u64(children.len() as u64);
            for fp in &children {
                hasher.input_str(fp.hex());
            }
            let fp = hasher.finish_fingerprint();
            memo.insert(handle, fp.clone());
            fp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(path: &str) -> Artifact {
        Artifact::Source { path: path.to_owned() }
    }

    fn paths(store: &NestedSetStore, h: SetHandle) -> Vec<String> {
        store.flatten(h).iter().map(|a| a.exec_path().to_owned()).collect()
    }

    #[test]
    fn interning_reuses_handles() {
        let store = NestedSetStore::new();
        let a = store.leaf(vec![src("a")]);
        let b = store.leaf(vec![src("a")]);
        assert_eq!(a, b);
        let c = store.create(Order::Preorder, vec![src("b")], vec![a]);
        let d = store.create(Order::Preorder, vec![src("b")], vec![b]);
        assert_eq!(c, d);
    }

    #[test]
    fn preorder_and_postorder() {
        let store = NestedSetStore::new();
        let child = store.leaf(vec![src("c1"), src("c2")]);
        let pre = store.create(Order::Preorder, vec![src("d")], vec![child]);
        let post = store.create(Order::Postorder, vec![src("d")], vec![child]);
        assert_eq!(paths(&store, pre), vec!["d", "c1", "c2"]);
        assert_eq!(paths(&store, post), vec!["c1", "c2", "d"]);
    }

    #[test]
    fn shared_diamond_dedupes() {
        let store = NestedSetStore::new();
        let base = store.leaf(vec![src("base")]);
        let left = store.create(Order::Preorder, vec![src("l")], vec![base]);
        let right = store.create(Order::Preorder, vec![src("r")], vec![base]);
        let top = store.create(Order::Preorder, vec![], vec![left, right]);
        assert_eq!(paths(&store, top), vec!["l", "base", "r"]);
    }

    #[test]
    fn fingerprint_ignores_child_declaration_order() {
        let store = NestedSetStore::new();
        let a = store.leaf(vec![src("a")]);
        let b = store.leaf(vec![src("b")]);
        let ab = store.create(Order::Preorder, vec![], vec![a, b]);
        let ba = store.create(Order::Preorder, vec![], vec![b, a]);
        let fp = |art: &Artifact| Fingerprint(format!("fp-{}", art.exec_path()));
        let h1 = store.fingerprint(ab, HashFunction::Sha256, &fp);
        let h2 = store.fingerprint(ba, HashFunction::Sha256, &fp);
        assert_eq!(h1, h2);
    }

    #[test]
    fn fingerprint_tracks_leaf_content() {
        let store = NestedSetStore::new();
        let set = store.leaf(vec![src("a")]);
        let fp1 = store.fingerprint(set, HashFunction::Sha256, &|_| Fingerprint("one".into()));
        let fp2 = store.fingerprint(set, HashFunction::Sha256, &|_| Fingerprint("two".into()));
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn layering_differs_from_flat() {
        // {a, {b}} and {a, b} hash differently: layering is part of the key.
        let store = NestedSetStore::new();
        let b = store.leaf(vec![src("b")]);
        let layered = store.create(Order::Preorder, vec![src("a")], vec![b]);
        let flat = store.leaf(vec![src("a"), src("b")]);
        let fp = |art: &Artifact| Fingerprint(art.exec_path().to_owned());
        assert_ne!(
            store.fingerprint(layered, HashFunction::Sha256, &fp),
            store.fingerprint(flat, HashFunction::Sha256, &fp)
        );
    }
}
