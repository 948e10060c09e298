//! Copy-on-write B-tree over the block file.
//!
//! Nodes are serialized terms: `{kv_node, [{K, V}]}` leaves and
//! `{kp_node, [{LastKey, {Pos, Reduction}}]}` interior nodes. Updates never
//! touch existing nodes; modified paths are appended and a new root pointer
//! is returned. Reads only need the root offset, which is what makes
//! signature-based salvage possible: any surviving leaf can serve as the
//! root of a degenerate tree.

use std::cmp::Ordering;

use crate::error::{DriftError, Result};
use crate::file::BlockFile;
use crate::term::{term_cmp, Term};

/// Upper bound on the encoded size of a node's entry list before it is split
/// into siblings.
const CHUNK_THRESHOLD: usize = 1279;

pub const KV_NODE_TAG: &str = "kv_node";
pub const KP_NODE_TAG: &str = "kp_node";

#[derive(Clone, Debug, PartialEq)]
pub struct NodePointer {
    pub pos: u64,
    pub reduction: Term,
}

impl NodePointer {
    pub fn to_term(&self) -> Term {
        Term::Tuple(vec![Term::Int(self.pos as i64), self.reduction.clone()])
    }

    pub fn from_term(term: &Term) -> Result<NodePointer> {
        let items = term
            .as_tuple()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| DriftError::Corruption("malformed node pointer".into()))?;
        let pos = items[0]
            .as_int()
            .filter(|p| *p >= 0)
            .ok_or_else(|| DriftError::Corruption("node pointer offset is not an offset".into()))?;
        Ok(NodePointer {
            pos: pos as u64,
            reduction: items[1].clone(),
        })
    }
}

#[derive(Clone, Debug)]
pub enum Node {
    Kv(Vec<(Term, Term)>),
    Kp(Vec<(Term, NodePointer)>),
}

impl Node {
    pub fn from_term(term: Term) -> Result<Node> {
        let Term::Tuple(mut items) = term else {
            return Err(DriftError::Corruption("node term is not a tuple".into()));
        };
        if items.len() != 2 {
            return Err(DriftError::Corruption("node tuple is not a pair".into()));
        }
        let entries = items.pop().expect("len checked");
        let tag = items.pop().expect("len checked");
        let Term::List(entries) = entries else {
            return Err(DriftError::Corruption("node entries are not a list".into()));
        };

        if tag.is_atom(KV_NODE_TAG) {
            let mut kvs = Vec::with_capacity(entries.len());
            for entry in entries {
                let Term::Tuple(mut pair) = entry else {
                    return Err(DriftError::Corruption("leaf entry is not a pair".into()));
                };
                if pair.len() != 2 {
                    return Err(DriftError::Corruption("leaf entry is not a pair".into()));
                }
                let value = pair.pop().expect("len checked");
                let key = pair.pop().expect("len checked");
                kvs.push((key, value));
            }
            Ok(Node::Kv(kvs))
        } else if tag.is_atom(KP_NODE_TAG) {
            let mut children = Vec::with_capacity(entries.len());
            for entry in entries {
                let Term::Tuple(mut pair) = entry else {
                    return Err(DriftError::Corruption("interior entry is not a pair".into()));
                };
                if pair.len() != 2 {
                    return Err(DriftError::Corruption("interior entry is not a pair".into()));
                }
                let pointer = NodePointer::from_term(&pair.pop().expect("len checked"))?;
                let key = pair.pop().expect("len checked");
                children.push((key, pointer));
            }
            Ok(Node::Kp(children))
        } else {
            Err(DriftError::Corruption("unknown node tag".into()))
        }
    }

    pub fn to_term(&self) -> Term {
        match self {
            Node::Kv(kvs) => Term::Tuple(vec![
                Term::atom(KV_NODE_TAG),
                Term::List(
                    kvs.iter()
                        .map(|(k, v)| Term::Tuple(vec![k.clone(), v.clone()]))
                        .collect(),
                ),
            ]),
            Node::Kp(children) => Term::Tuple(vec![
                Term::atom(KP_NODE_TAG),
                Term::List(
                    children
                        .iter()
                        .map(|(k, p)| Term::Tuple(vec![k.clone(), p.to_term()]))
                        .collect(),
                ),
            ]),
        }
    }
}

pub fn read_node(file: &BlockFile, pos: u64) -> Result<Node> {
    Node::from_term(file.read_term_at(pos)?)
}

/// Reduction computed bottom-up and cached in parent pointers.
pub trait Reduce {
    fn reduce(&self, kvs: &[(Term, Term)]) -> Term;
    fn rereduce(&self, reductions: &[Term]) -> Term;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Reverse,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FoldControl {
    Continue,
    Stop,
}

/// In-order traversal rooted at `root`, stopping early when the callback
/// says so.
pub fn fold<F>(file: &BlockFile, root: &NodePointer, dir: Direction, f: &mut F) -> Result<FoldControl>
where
    F: FnMut(&Term, &Term) -> Result<FoldControl>,
{
    fold_at(file, root.pos, dir, f)
}

fn fold_at<F>(file: &BlockFile, pos: u64, dir: Direction, f: &mut F) -> Result<FoldControl>
where
    F: FnMut(&Term, &Term) -> Result<FoldControl>,
{
    match read_node(file, pos)? {
        Node::Kv(kvs) => {
            let mut iter: Box<dyn Iterator<Item = &(Term, Term)> + '_> = match dir {
                Direction::Forward => Box::new(kvs.iter()),
                Direction::Reverse => Box::new(kvs.iter().rev()),
            };
            for (key, value) in &mut iter {
                if f(key, value)? == FoldControl::Stop {
                    return Ok(FoldControl::Stop);
                }
            }
        }
        Node::Kp(children) => {
            let mut iter: Box<dyn Iterator<Item = &(Term, NodePointer)> + '_> = match dir {
                Direction::Forward => Box::new(children.iter()),
                Direction::Reverse => Box::new(children.iter().rev()),
            };
            for (_, child) in &mut iter {
                if fold_at(file, child.pos, dir, f)? == FoldControl::Stop {
                    return Ok(FoldControl::Stop);
                }
            }
        }
    }
    Ok(FoldControl::Continue)
}

/// The greatest key/value pair under `root`.
pub fn last_entry(file: &BlockFile, root: &NodePointer) -> Result<Option<(Term, Term)>> {
    let mut found = None;
    fold(file, root, Direction::Reverse, &mut |key, value| {
        found = Some((key.clone(), value.clone()));
        Ok(FoldControl::Stop)
    })?;
    Ok(found)
}

pub fn lookup(file: &BlockFile, root: Option<&NodePointer>, key: &Term) -> Result<Option<Term>> {
    let Some(root) = root else {
        return Ok(None);
    };
    let mut pos = root.pos;
    loop {
        match read_node(file, pos)? {
            Node::Kv(kvs) => {
                return Ok(kvs
                    .binary_search_by(|(k, _)| term_cmp(k, key))
                    .ok()
                    .map(|idx| kvs[idx].1.clone()));
            }
            Node::Kp(children) => {
                match children
                    .iter()
                    .find(|(last, _)| term_cmp(key, last) != Ordering::Greater)
                {
                    Some((_, child)) => pos = child.pos,
                    None => return Ok(None),
                }
            }
        }
    }
}

enum Action {
    Insert(Term, Term),
    Remove(Term),
}

impl Action {
    fn key(&self) -> &Term {
        match self {
            Action::Insert(key, _) => key,
            Action::Remove(key) => key,
        }
    }
}

/// Applies sorted upserts and removals, appending rewritten nodes and
/// returning the new root pointer. Keys must be unique within one call.
pub fn update<R: Reduce>(
    file: &mut BlockFile,
    root: Option<NodePointer>,
    reduce: &R,
    inserts: Vec<(Term, Term)>,
    removes: Vec<Term>,
) -> Result<Option<NodePointer>> {
    let mut actions: Vec<Action> = Vec::with_capacity(inserts.len() + removes.len());
    actions.extend(inserts.into_iter().map(|(k, v)| Action::Insert(k, v)));
    actions.extend(removes.into_iter().map(Action::Remove));
    if actions.is_empty() {
        return Ok(root);
    }
    actions.sort_by(|a, b| term_cmp(a.key(), b.key()));

    let mut level = modify(file, reduce, root.as_ref(), &actions)?;
    loop {
        match level.len() {
            0 => return Ok(None),
            1 => return Ok(Some(level.pop().expect("len checked").1)),
            _ => level = write_kp_nodes(file, reduce, level)?,
        }
    }
}

fn modify<R: Reduce>(
    file: &mut BlockFile,
    reduce: &R,
    ptr: Option<&NodePointer>,
    actions: &[Action],
) -> Result<Vec<(Term, NodePointer)>> {
    let node = match ptr {
        Some(ptr) => read_node(file, ptr.pos)?,
        None => Node::Kv(Vec::new()),
    };
    match node {
        Node::Kv(kvs) => {
            let merged = merge_kv(kvs, actions);
            write_kv_nodes(file, reduce, merged)
        }
        Node::Kp(children) => {
            let mut staged = Vec::with_capacity(children.len());
            let last_idx = children.len() - 1;
            let mut start = 0;
            for (i, (last_key, child)) in children.into_iter().enumerate() {
                // Actions beyond the last child's key range still land in the
                // last child.
                let end = if i == last_idx {
                    actions.len()
                } else {
                    let mut end = start;
                    while end < actions.len()
                        && term_cmp(actions[end].key(), &last_key) != Ordering::Greater
                    {
                        end += 1;
                    }
                    end
                };
                if end == start {
                    staged.push((last_key, child));
                } else {
                    staged.extend(modify(file, reduce, Some(&child), &actions[start..end])?);
                }
                start = end;
            }
            write_kp_nodes(file, reduce, staged)
        }
    }
}

fn merge_kv(existing: Vec<(Term, Term)>, actions: &[Action]) -> Vec<(Term, Term)> {
    let mut out = Vec::with_capacity(existing.len() + actions.len());
    let mut entries = existing.into_iter().peekable();
    let mut actions = actions.iter().peekable();

    loop {
        match (entries.peek(), actions.peek()) {
            (Some(entry), Some(action)) => match term_cmp(&entry.0, action.key()) {
                Ordering::Less => out.push(entries.next().expect("peeked")),
                Ordering::Greater => {
                    if let Action::Insert(key, value) = actions.next().expect("peeked") {
                        out.push((key.clone(), value.clone()));
                    }
                }
                Ordering::Equal => {
                    let entry = entries.next().expect("peeked");
                    match actions.next().expect("peeked") {
                        Action::Insert(key, value) => out.push((key.clone(), value.clone())),
                        Action::Remove(_) => drop(entry),
                    }
                }
            },
            (Some(_), None) => out.push(entries.next().expect("peeked")),
            (None, Some(_)) => {
                if let Action::Insert(key, value) = actions.next().expect("peeked") {
                    out.push((key.clone(), value.clone()));
                }
            }
            (None, None) => break,
        }
    }
    out
}

fn write_kv_nodes<R: Reduce>(
    file: &mut BlockFile,
    reduce: &R,
    kvs: Vec<(Term, Term)>,
) -> Result<Vec<(Term, NodePointer)>> {
    let chunks = chunkify(&kvs, |(k, v)| entry_size(k) + entry_size(v));
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let node = Node::Kv(chunk.to_vec());
        let pos = file.append_term(&node.to_term())?;
        let last_key = chunk.last().expect("chunks are non-empty").0.clone();
        out.push((
            last_key,
            NodePointer {
                pos,
                reduction: reduce.reduce(chunk),
            },
        ));
    }
    Ok(out)
}

fn write_kp_nodes<R: Reduce>(
    file: &mut BlockFile,
    reduce: &R,
    children: Vec<(Term, NodePointer)>,
) -> Result<Vec<(Term, NodePointer)>> {
    let chunks = chunkify(&children, |(k, p)| entry_size(k) + entry_size(&p.reduction) + 16);
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let node = Node::Kp(chunk.to_vec());
        let pos = file.append_term(&node.to_term())?;
        let reductions: Vec<Term> = chunk.iter().map(|(_, p)| p.reduction.clone()).collect();
        let last_key = chunk.last().expect("chunks are non-empty").0.clone();
        out.push((
            last_key,
            NodePointer {
                pos,
                reduction: reduce.rereduce(&reductions),
            },
        ));
    }
    Ok(out)
}

fn entry_size(term: &Term) -> usize {
    crate::term::encode(term).len()
}

fn chunkify<T>(items: &[T], size_of: impl Fn(&T) -> usize) -> Vec<&[T]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut acc = 0;
    for (i, item) in items.iter().enumerate() {
        let size = size_of(item);
        if acc + size > CHUNK_THRESHOLD && i > start {
            chunks.push(&items[start..i]);
            start = i;
            acc = 0;
        }
        acc += size;
    }
    if start < items.len() {
        chunks.push(&items[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct CountReduce;

    impl Reduce for CountReduce {
        fn reduce(&self, kvs: &[(Term, Term)]) -> Term {
            Term::Int(kvs.len() as i64)
        }

        fn rereduce(&self, reductions: &[Term]) -> Term {
            Term::Int(reductions.iter().filter_map(Term::as_int).sum())
        }
    }

    fn key(i: usize) -> Term {
        Term::Binary(format!("doc-{i:05}").into_bytes())
    }

    fn value(i: usize) -> Term {
        Term::Binary(format!("value for entry {i}").into_bytes())
    }

    fn build_tree(file: &mut BlockFile, count: usize) -> NodePointer {
        let inserts: Vec<(Term, Term)> = (0..count).map(|i| (key(i), value(i))).collect();
        update(file, None, &CountReduce, inserts, Vec::new())
            .expect("update")
            .expect("non-empty root")
    }

    #[test]
    fn single_leaf_roundtrip() {
        let dir = tempdir().expect("temp dir");
        let mut file = BlockFile::open_or_create(dir.path().join("t.couch")).expect("open");
        let root = build_tree(&mut file, 3);
        assert_eq!(root.reduction, Term::Int(3));
        assert_eq!(
            lookup(&file, Some(&root), &key(1)).expect("lookup"),
            Some(value(1))
        );
        assert_eq!(lookup(&file, Some(&root), &key(9)).expect("lookup"), None);
    }

    #[test]
    fn multi_level_tree_folds_in_order() {
        let dir = tempdir().expect("temp dir");
        let mut file = BlockFile::open_or_create(dir.path().join("t.couch")).expect("open");
        let root = build_tree(&mut file, 400);

        // Enough entries to force a kp level above the leaves.
        assert!(matches!(
            read_node(&file, root.pos).expect("root node"),
            Node::Kp(_)
        ));
        assert_eq!(root.reduction, Term::Int(400));

        let mut keys = Vec::new();
        fold(&file, &root, Direction::Forward, &mut |k, _| {
            keys.push(k.clone());
            Ok(FoldControl::Continue)
        })
        .expect("fold");
        assert_eq!(keys.len(), 400);
        let mut sorted = keys.clone();
        sorted.sort_by(term_cmp);
        assert_eq!(keys, sorted);

        let mut reversed = Vec::new();
        fold(&file, &root, Direction::Reverse, &mut |k, _| {
            reversed.push(k.clone());
            Ok(FoldControl::Continue)
        })
        .expect("fold");
        sorted.reverse();
        assert_eq!(reversed, sorted);
    }

    #[test]
    fn last_entry_is_greatest_key() {
        let dir = tempdir().expect("temp dir");
        let mut file = BlockFile::open_or_create(dir.path().join("t.couch")).expect("open");
        let root = build_tree(&mut file, 250);
        let (last_key, _) = last_entry(&file, &root).expect("fold").expect("entry");
        assert_eq!(last_key, key(249));
    }

    #[test]
    fn update_replaces_and_removes() {
        let dir = tempdir().expect("temp dir");
        let mut file = BlockFile::open_or_create(dir.path().join("t.couch")).expect("open");
        let root = build_tree(&mut file, 100);

        let root = update(
            &mut file,
            Some(root),
            &CountReduce,
            vec![(key(5), Term::Binary(b"rewritten".to_vec()))],
            vec![key(6)],
        )
        .expect("update")
        .expect("root");

        assert_eq!(
            lookup(&file, Some(&root), &key(5)).expect("lookup"),
            Some(Term::Binary(b"rewritten".to_vec()))
        );
        assert_eq!(lookup(&file, Some(&root), &key(6)).expect("lookup"), None);
        assert_eq!(root.reduction, Term::Int(99));
    }

    #[test]
    fn removing_everything_drops_the_root() {
        let dir = tempdir().expect("temp dir");
        let mut file = BlockFile::open_or_create(dir.path().join("t.couch")).expect("open");
        let root = build_tree(&mut file, 10);
        let removes: Vec<Term> = (0..10).map(key).collect();
        let root = update(&mut file, Some(root), &CountReduce, Vec::new(), removes)
            .expect("update");
        assert!(root.is_none());
    }

    #[test]
    fn untouched_subtrees_keep_their_offsets() {
        let dir = tempdir().expect("temp dir");
        let mut file = BlockFile::open_or_create(dir.path().join("t.couch")).expect("open");
        let root = build_tree(&mut file, 400);
        let Node::Kp(before) = read_node(&file, root.pos).expect("root") else {
            panic!("expected kp root");
        };

        let root = update(
            &mut file,
            Some(root),
            &CountReduce,
            vec![(key(0), Term::Binary(b"new".to_vec()))],
            Vec::new(),
        )
        .expect("update")
        .expect("root");
        let Node::Kp(after) = read_node(&file, root.pos).expect("root") else {
            panic!("expected kp root");
        };

        // Only the leftmost child should have been rewritten.
        assert_eq!(before.len(), after.len());
        for ((_, b), (_, a)) in before.iter().zip(after.iter()).skip(1) {
            assert_eq!(b.pos, a.pos);
        }
        assert_ne!(before[0].1.pos, after[0].1.pos);
    }
}
