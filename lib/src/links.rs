//! Reference resolution.
//!
//! Archives cross-reference their own tree four ways: `uol` nodes, and
//! string nodes named `source`, `_outlink` or `_inlink`. Each pass collects
//! root-to-node index paths, then resolves them to a fixed point: references
//! whose target is itself an unresolved reference succeed on a later round.
//! A round that removes nothing leaves only dead references behind.

use crate::convert::Transcoder;
use crate::node::NodeKind;

type Path = Vec<u32>;

impl Transcoder {
    pub(crate) fn resolve_references(&mut self) {
        let mut uols = Vec::new();
        self.collect_uols(0, &mut Vec::new(), &mut uols);
        log::debug!("resolving {} uol references", uols.len());
        for path in self.fixed_point(uols, Self::resolve_uol) {
            self.uol_fail(&path);
        }

        for (name, resolve) in [
            ("source", Self::resolve_source as fn(&mut Self, &[u32]) -> bool),
            ("_outlink", Self::resolve_outlink),
            ("_inlink", Self::resolve_inlink),
        ] {
            let mut links = Vec::new();
            self.collect_links(0, name, &mut Vec::new(), &mut links);
            log::debug!("resolving {} {name} references", links.len());
            for path in self.fixed_point(links, resolve) {
                self.link_fail(name, &path);
            }
        }
    }

    /// Runs `resolve` over the paths until a full round removes nothing;
    /// returns the survivors.
    fn fixed_point(
        &mut self,
        mut paths: Vec<Path>,
        resolve: fn(&mut Self, &[u32]) -> bool,
    ) -> Vec<Path> {
        loop {
            let before = paths.len();
            paths.retain(|path| !resolve(self, path));
            if paths.len() == before {
                return paths;
            }
        }
    }

    fn collect_uols(&self, node: u32, stack: &mut Path, out: &mut Vec<Path>) {
        let n = &self.nodes[node as usize];
        if n.kind == NodeKind::Uol {
            stack.push(node);
            out.push(stack.clone());
            stack.pop();
        } else if n.num != 0 {
            stack.push(node);
            for i in 0..n.num as u32 {
                self.collect_uols(n.children + i, stack, out);
            }
            stack.pop();
        }
    }

    fn collect_links(&self, node: u32, name: &str, stack: &mut Path, out: &mut Vec<Path>) {
        let n = &self.nodes[node as usize];
        if self.strings.get(n.name) == name {
            stack.push(node);
            out.push(stack.clone());
            stack.pop();
        } else if n.num != 0 {
            stack.push(node);
            for i in 0..n.num as u32 {
                self.collect_links(n.children + i, name, stack, out);
            }
            stack.pop();
        }
    }

    /// Binary search over a parent's sorted children; 0 means absent. The
    /// root guard makes a failed lookup sticky while a uol path descends.
    fn get_child(&self, parent: u32, name: &str) -> u32 {
        if parent == 0 {
            return 0;
        }
        self.lookup_child(parent, name)
    }

    /// As [`get_child`](Self::get_child), but index 0 is the root itself, so
    /// link descents may start there.
    fn lookup_child(&self, parent: u32, name: &str) -> u32 {
        let n = &self.nodes[parent as usize];
        let first = n.children as usize;
        let kids = &self.nodes[first..first + n.num as usize];
        match kids.binary_search_by(|k| self.strings.get(k.name).cmp(name)) {
            Ok(i) => (first + i) as u32,
            Err(_) => 0,
        }
    }

    /// Walks the uol string relative to the uol's parent; `..` pops a level,
    /// anything else descends (the final segment always descends). Success
    /// copies the target's kind, children and payload over the uol in place.
    fn resolve_uol(&mut self, path: &[u32]) -> bool {
        let node_idx = *path.last().expect("uol paths include the uol node");
        let n = self.nodes[node_idx as usize];
        debug_assert_eq!(n.kind, NodeKind::Uol);
        let s = self.strings.get(n.string_id());
        let segments: Vec<&str> = s.split('/').collect();
        let mut stack: Vec<u32> = path[..path.len() - 1].to_vec();
        for (i, seg) in segments.iter().enumerate() {
            if i + 1 < segments.len() && *seg == ".." {
                if stack.pop().is_none() {
                    return false;
                }
            } else {
                let Some(&top) = stack.last() else {
                    return false;
                };
                stack.push(self.get_child(top, seg));
            }
        }
        let target = *stack.last().expect("final segment always pushes");
        if target == 0 {
            return false;
        }
        let t = self.nodes[target as usize];
        if t.kind == NodeKind::Uol {
            return false;
        }
        let n = &mut self.nodes[node_idx as usize];
        n.kind = t.kind;
        n.children = t.children;
        n.num = t.num;
        n.payload = t.payload;
        true
    }

    /// Descends the link string from the root; success copies the target's
    /// payload (only) into the link's parent.
    fn resolve_source(&mut self, path: &[u32]) -> bool {
        self.resolve_from_root(path, false)
    }

    /// As `source`, except a leading `Map` segment counts as resolved.
    fn resolve_outlink(&mut self, path: &[u32]) -> bool {
        self.resolve_from_root(path, true)
    }

    fn resolve_from_root(&mut self, path: &[u32], map_is_external: bool) -> bool {
        if path.len() < 2 {
            return false;
        }
        let node_idx = *path.last().expect("length checked");
        let parent = path[path.len() - 2];
        let n = self.nodes[node_idx as usize];
        let s = self.strings.get(n.string_id());
        if map_is_external && s.split('/').next() == Some("Map") {
            return true;
        }
        let mut target = 0u32;
        for part in s.split('/') {
            target = self.lookup_child(target, part);
        }
        if target == 0 {
            return false;
        }
        let payload = self.nodes[target as usize].payload;
        self.nodes[parent as usize].payload = payload;
        true
    }

    /// Tries the link string against the parent's ancestor chain, innermost
    /// first; success copies the target's payload into the link's parent.
    fn resolve_inlink(&mut self, path: &[u32]) -> bool {
        if path.len() < 2 {
            return false;
        }
        let node_idx = *path.last().expect("length checked");
        let parent = path[path.len() - 2];
        let n = self.nodes[node_idx as usize];
        let s = self.strings.get(n.string_id());
        let mut ancestors: Vec<u32> = path[..path.len() - 1].to_vec();
        loop {
            let Some(&start) = ancestors.last() else {
                return false;
            };
            let mut target = start;
            for part in s.split('/') {
                target = self.lookup_child(target, part);
                if target == 0 {
                    break;
                }
            }
            if target != 0 {
                let payload = self.nodes[target as usize].payload;
                self.nodes[parent as usize].payload = payload;
                return true;
            }
            ancestors.pop();
        }
    }

    /// A uol that never resolved becomes an empty node; its name survives.
    fn uol_fail(&mut self, path: &[u32]) {
        let idx = *path.last().expect("uol paths include the uol node");
        let n = self.nodes[idx as usize];
        if n.kind == NodeKind::Uol {
            log::warn!("Unresolved uol '{}'", self.strings.get(n.string_id()));
            let n = &mut self.nodes[idx as usize];
            n.kind = NodeKind::None;
            n.payload = 0;
        } else {
            log::warn!("Node claims to be an unresolved uol but is {:?}", n.kind);
        }
    }

    fn link_fail(&self, pass: &str, path: &[u32]) {
        let idx = *path.last().expect("link paths include the link node");
        let n = self.nodes[idx as usize];
        log::warn!(
            "Failed to find {pass} for [{}]",
            self.strings.get(n.string_id())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::Options;
    use crate::node::Node;

    /// A transcoder over a throwaway input file, for driving the resolver
    /// against hand-built arenas.
    fn harness() -> (tempfile::TempDir, Transcoder) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dummy.wz");
        std::fs::write(&path, [0u8; 4]).unwrap();
        let tx = Transcoder::new(&path, Options::default()).unwrap();
        (dir, tx)
    }

    fn intern(tx: &mut Transcoder, s: &str) -> u32 {
        tx.strings.add(s.to_owned())
    }

    /// Attaches pre-sorted children to `parent`, returning the first index.
    fn attach(tx: &mut Transcoder, parent: u32, names: &[&str]) -> u32 {
        let first = tx.nodes.len() as u32;
        for name in names {
            let id = intern(tx, name);
            tx.nodes.push(Node {
                name: id,
                ..Node::default()
            });
        }
        let p = &mut tx.nodes[parent as usize];
        p.children = first;
        p.num = names.len() as u16;
        first
    }

    #[test]
    fn uol_to_sibling_copies_kind_and_payload() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let first = attach(&mut tx, 0, &["a", "b"]);
        tx.nodes[first as usize].set_integer(99);
        let target = intern(&mut tx, "a");
        tx.nodes[first as usize + 1].set_uol(target);

        tx.resolve_references();

        let b = tx.nodes[first as usize + 1];
        assert_eq!(b.kind, NodeKind::Integer);
        assert_eq!(b.payload as i64, 99);
        assert_eq!(tx.strings.get(b.name), "b");
    }

    #[test]
    fn uol_with_parent_pops_ascend_the_tree() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let p = attach(&mut tx, 0, &["p"]);
        let mid = attach(&mut tx, p, &["dir", "x"]);
        let x = mid + 1;
        tx.nodes[x as usize].set_integer(7);
        let inner = attach(&mut tx, mid, &["b"]);
        let s = intern(&mut tx, "../x");
        tx.nodes[inner as usize].set_uol(s);

        tx.resolve_references();

        let b = tx.nodes[inner as usize];
        assert_eq!(b.kind, NodeKind::Integer);
        assert_eq!(b.payload as i64, 7);
    }

    #[test]
    fn uol_parent_pop_cannot_pass_the_root() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let top = attach(&mut tx, 0, &["dir", "x"]);
        tx.nodes[top as usize + 1].set_integer(7);
        let inner = attach(&mut tx, top, &["b"]);
        let s = intern(&mut tx, "../x");
        tx.nodes[inner as usize].set_uol(s);

        tx.resolve_references();

        // The pop lands on the root, where descent is refused.
        assert_eq!(tx.nodes[inner as usize].kind, NodeKind::None);
    }

    #[test]
    fn uol_chain_resolves_over_two_rounds() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let first = attach(&mut tx, 0, &["a", "b", "c"]);
        tx.nodes[first as usize].set_integer(5);
        let to_a = intern(&mut tx, "a");
        tx.nodes[first as usize + 1].set_uol(to_a);
        let to_b = intern(&mut tx, "b");
        tx.nodes[first as usize + 2].set_uol(to_b);

        tx.resolve_references();

        assert_eq!(tx.nodes[first as usize + 1].payload as i64, 5);
        assert_eq!(tx.nodes[first as usize + 2].payload as i64, 5);
        assert_eq!(tx.nodes[first as usize + 2].kind, NodeKind::Integer);
    }

    #[test]
    fn dead_uol_becomes_empty_node() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let first = attach(&mut tx, 0, &["u"]);
        let s = intern(&mut tx, "nowhere/at/all");
        tx.nodes[first as usize].set_uol(s);

        tx.resolve_references();

        let u = tx.nodes[first as usize];
        assert_eq!(u.kind, NodeKind::None);
        assert_eq!(u.payload, 0);
        assert_eq!(tx.strings.get(u.name), "u");
    }

    #[test]
    fn source_copies_payload_into_parent() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let top = attach(&mut tx, 0, &["data", "holder"]);
        let data = top;
        let holder = top + 1;
        tx.nodes[data as usize].set_integer(1234);
        let inner = attach(&mut tx, holder, &["source"]);
        let s = intern(&mut tx, "data");
        tx.nodes[inner as usize].set_string(s);

        tx.resolve_references();

        let h = tx.nodes[holder as usize];
        // Payload only; the holder keeps its own kind.
        assert_eq!(h.payload as i64, 1234);
        assert_eq!(h.kind, NodeKind::None);
    }

    #[test]
    fn outlink_to_map_is_a_no_op_success() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let holder = attach(&mut tx, 0, &["holder"]);
        let inner = attach(&mut tx, holder, &["_outlink"]);
        let s = intern(&mut tx, "Map/somewhere/else");
        tx.nodes[inner as usize].set_string(s);

        tx.resolve_references();

        assert_eq!(tx.nodes[holder as usize].payload, 0);
        assert_eq!(tx.nodes[inner as usize].kind, NodeKind::String);
    }

    #[test]
    fn inlink_walks_the_ancestor_chain() {
        let (_dir, mut tx) = harness();
        intern(&mut tx, "");
        let top = attach(&mut tx, 0, &["outer", "value"]);
        let outer = top;
        let value = top + 1;
        tx.nodes[value as usize].set_integer(-8);
        let holder = attach(&mut tx, outer, &["holder"]);
        let inner = attach(&mut tx, holder, &["_inlink"]);
        // "value" exists neither under holder nor outer, only at the root.
        let s = intern(&mut tx, "value");
        tx.nodes[inner as usize].set_string(s);

        tx.resolve_references();

        assert_eq!(tx.nodes[holder as usize].payload as i64, -8);
    }
}
