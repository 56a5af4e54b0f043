//! Generic helpers over [`Tree`] values: mapping, path-keyed flattening,
//! folding and merging.

use std::collections::BTreeMap;

use crate::codec::TreePath;
use crate::error::TreeError;
use crate::tree::Tree;

/// Applies `f` to every tensor leaf; constants and opaque values are kept.
pub fn tree_map<L, M>(tree: &Tree<L>, f: &mut impl FnMut(&L) -> M) -> Tree<M> {
    match tree {
        Tree::Leaf(leaf) => Tree::Leaf(f(leaf)),
        Tree::Sequence(items) => {
            Tree::Sequence(items.iter().map(|item| tree_map(item, f)).collect())
        }
        Tree::Mapping(entries) => Tree::Mapping(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), tree_map(item, f)))
                .collect(),
        ),
        Tree::Const(constant) => Tree::Const(constant.clone()),
        Tree::Opaque(opaque) => Tree::Opaque(opaque.clone()),
    }
}

/// Like [`tree_map`], but `is_leaf` may claim whole subtrees. Every node it
/// accepts, and every tensor leaf, is handed to `f` unopened.
pub fn tree_map_subtrees<L, M>(
    tree: &Tree<L>,
    is_leaf: &mut impl FnMut(&Tree<L>) -> bool,
    f: &mut impl FnMut(&Tree<L>) -> Tree<M>,
) -> Tree<M> {
    match tree {
        _ if is_leaf(tree) => f(tree),
        Tree::Leaf(_) => f(tree),
        Tree::Sequence(items) => Tree::Sequence(
            items
                .iter()
                .map(|item| tree_map_subtrees(item, is_leaf, f))
                .collect(),
        ),
        Tree::Mapping(entries) => Tree::Mapping(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), tree_map_subtrees(item, is_leaf, f)))
                .collect(),
        ),
        Tree::Const(constant) => Tree::Const(constant.clone()),
        Tree::Opaque(opaque) => Tree::Opaque(opaque.clone()),
    }
}

/// Like [`tree_map`], also passing the dotted path of each leaf (`"w.0"`).
pub fn tree_map_with_path<L, M>(tree: &Tree<L>, f: &mut impl FnMut(&str, &L) -> M) -> Tree<M> {
    let mut path = TreePath::root();
    map_with_path(tree, &mut path, f)
}

fn map_with_path<L, M>(
    tree: &Tree<L>,
    path: &mut TreePath,
    f: &mut impl FnMut(&str, &L) -> M,
) -> Tree<M> {
    match tree {
        Tree::Leaf(leaf) => Tree::Leaf(f(&path.dotted(), leaf)),
        Tree::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                path.push_index(index);
                out.push(map_with_path(item, path, f));
                path.pop();
            }
            Tree::Sequence(out)
        }
        Tree::Mapping(entries) => {
            let mut out = BTreeMap::new();
            for (key, item) in entries {
                path.push_key(key);
                out.insert(key.clone(), map_with_path(item, path, f));
                path.pop();
            }
            Tree::Mapping(out)
        }
        Tree::Const(constant) => Tree::Const(constant.clone()),
        Tree::Opaque(opaque) => Tree::Opaque(opaque.clone()),
    }
}

/// Maps two trees of identical structure leaf by leaf.
pub fn tree_zip_map<A, B, C>(
    a: &Tree<A>,
    b: &Tree<B>,
    f: &mut impl FnMut(&A, &B) -> C,
) -> Result<Tree<C>, TreeError> {
    let mut path = TreePath::root();
    zip_map(a, b, &mut path, f)
}

fn zip_map<A, B, C>(
    a: &Tree<A>,
    b: &Tree<B>,
    path: &mut TreePath,
    f: &mut impl FnMut(&A, &B) -> C,
) -> Result<Tree<C>, TreeError> {
    match (a, b) {
        (Tree::Leaf(x), Tree::Leaf(y)) => Ok(Tree::Leaf(f(x, y))),
        (Tree::Sequence(xs), Tree::Sequence(ys)) => {
            if xs.len() != ys.len() {
                return Err(mismatch(
                    path,
                    format!("sequence lengths differ ({} vs {})", xs.len(), ys.len()),
                ));
            }
            let mut out = Vec::with_capacity(xs.len());
            for (index, (x, y)) in xs.iter().zip(ys).enumerate() {
                path.push_index(index);
                out.push(zip_map(x, y, path, f)?);
                path.pop();
            }
            Ok(Tree::Sequence(out))
        }
        (Tree::Mapping(xs), Tree::Mapping(ys)) => {
            if !xs.keys().eq(ys.keys()) {
                return Err(mismatch(path, "mapping keys differ".to_owned()));
            }
            let mut out = BTreeMap::new();
            for ((key, x), y) in xs.iter().zip(ys.values()) {
                path.push_key(key);
                out.insert(key.clone(), zip_map(x, y, path, f)?);
                path.pop();
            }
            Ok(Tree::Mapping(out))
        }
        (Tree::Const(x), Tree::Const(y)) if x == y => Ok(Tree::Const(x.clone())),
        (Tree::Opaque(x), Tree::Opaque(y)) if x == y => Ok(Tree::Opaque(x.clone())),
        _ => Err(mismatch(
            path,
            format!("{} vs {}", a.kind_name(), b.kind_name()),
        )),
    }
}

/// Maps any number of trees of identical structure. `f` receives the leaves
/// found at the same position in every tree, in the order of `trees`.
pub fn tree_map_many<L, M>(
    trees: &[&Tree<L>],
    f: &mut impl FnMut(&[&L]) -> M,
) -> Result<Tree<M>, TreeError> {
    let mut path = TreePath::root();
    map_many(trees, &mut path, f)
}

fn map_many<L, M>(
    trees: &[&Tree<L>],
    path: &mut TreePath,
    f: &mut impl FnMut(&[&L]) -> M,
) -> Result<Tree<M>, TreeError> {
    let Some(first) = trees.first() else {
        return Err(mismatch(path, "no trees to map".to_owned()));
    };
    match first {
        Tree::Leaf(_) => {
            let mut leaves = Vec::with_capacity(trees.len());
            for tree in trees {
                match tree {
                    Tree::Leaf(leaf) => leaves.push(leaf),
                    other => {
                        return Err(mismatch(path, format!("leaf vs {}", other.kind_name())));
                    }
                }
            }
            Ok(Tree::Leaf(f(&leaves)))
        }
        Tree::Sequence(items) => {
            let mut sequences = Vec::with_capacity(trees.len());
            for tree in trees {
                match tree {
                    Tree::Sequence(other) if other.len() == items.len() => sequences.push(other),
                    other => {
                        return Err(mismatch(
                            path,
                            format!("sequence of {} vs {}", items.len(), other.kind_name()),
                        ));
                    }
                }
            }
            let mut out = Vec::with_capacity(items.len());
            for index in 0..items.len() {
                let column: Vec<&Tree<L>> = sequences.iter().map(|seq| &seq[index]).collect();
                path.push_index(index);
                out.push(map_many(&column, path, f)?);
                path.pop();
            }
            Ok(Tree::Sequence(out))
        }
        Tree::Mapping(entries) => {
            let mut mappings = Vec::with_capacity(trees.len());
            for tree in trees {
                match tree {
                    Tree::Mapping(other) if other.keys().eq(entries.keys()) => {
                        mappings.push(other);
                    }
                    _ => return Err(mismatch(path, "mapping keys differ".to_owned())),
                }
            }
            let mut out = BTreeMap::new();
            for key in entries.keys() {
                let column: Vec<&Tree<L>> =
                    mappings.iter().filter_map(|map| map.get(key)).collect();
                path.push_key(key);
                out.insert(key.clone(), map_many(&column, path, f)?);
                path.pop();
            }
            Ok(Tree::Mapping(out))
        }
        Tree::Const(constant) => {
            if trees
                .iter()
                .all(|tree| matches!(tree, Tree::Const(other) if other == constant))
            {
                Ok(Tree::Const(constant.clone()))
            } else {
                Err(mismatch(path, "constants differ".to_owned()))
            }
        }
        Tree::Opaque(opaque) => {
            if trees
                .iter()
                .all(|tree| matches!(tree, Tree::Opaque(other) if other == opaque))
            {
                Ok(Tree::Opaque(opaque.clone()))
            } else {
                Err(mismatch(path, "opaque values differ".to_owned()))
            }
        }
    }
}

fn mismatch(path: &TreePath, detail: String) -> TreeError {
    TreeError::StructureMismatch {
        path: path.to_string(),
        detail,
    }
}

/// Lists every non-container node under a dotted key.
///
/// Keys are prefixed with `prefix` when it is non-empty. An empty container
/// contributes nothing.
pub fn tree_flatten_with_paths<L: Clone>(tree: &Tree<L>, prefix: &str) -> Vec<(String, Tree<L>)> {
    let mut out = Vec::new();
    flatten_paths(tree, prefix.to_owned(), &mut out);
    out
}

fn flatten_paths<L: Clone>(tree: &Tree<L>, key: String, out: &mut Vec<(String, Tree<L>)>) {
    let child_key = |child: &str| {
        if key.is_empty() {
            child.to_owned()
        } else {
            format!("{key}.{child}")
        }
    };
    match tree {
        Tree::Sequence(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_paths(item, child_key(&index.to_string()), out);
            }
        }
        Tree::Mapping(entries) => {
            for (name, item) in entries {
                flatten_paths(item, child_key(name), out);
            }
        }
        Tree::Leaf(_) | Tree::Const(_) | Tree::Opaque(_) => out.push((key, tree.clone())),
    }
}

/// Inverse of [`tree_flatten_with_paths`].
///
/// Children whose keys are all numeric become a sequence with each child at
/// its index and nulls in the gaps; any other set of keys becomes a mapping.
/// A single pair with an empty key is returned as-is.
pub fn tree_unflatten<L>(pairs: Vec<(String, Tree<L>)>) -> Tree<L> {
    if pairs.len() == 1 && pairs[0].0.is_empty() {
        if let Some((_, value)) = pairs.into_iter().next() {
            return value;
        }
        return Tree::Mapping(BTreeMap::new());
    }

    let mut groups: BTreeMap<String, Vec<(String, Tree<L>)>> = BTreeMap::new();
    for (key, value) in pairs {
        let (head, rest) = match key.split_once('.') {
            Some((head, rest)) => (head.to_owned(), rest.to_owned()),
            None => (key, String::new()),
        };
        groups.entry(head).or_default().push((rest, value));
    }

    let numeric = !groups.is_empty() && groups.keys().all(|key| key.parse::<usize>().is_ok());
    if numeric {
        let mut items: Vec<Tree<L>> = Vec::new();
        for (key, group) in groups {
            let Ok(index) = key.parse::<usize>() else {
                continue;
            };
            if items.len() <= index {
                items.resize_with(index + 1, Tree::null);
            }
            items[index] = tree_unflatten(group);
        }
        Tree::Sequence(items)
    } else {
        Tree::Mapping(
            groups
                .into_iter()
                .map(|(key, group)| (key, tree_unflatten(group)))
                .collect(),
        )
    }
}

/// Folds `f` over the tensor leaves in depth-first order.
pub fn tree_reduce<L, A>(tree: &Tree<L>, init: A, f: &mut impl FnMut(A, &L) -> A) -> A {
    match tree {
        Tree::Leaf(leaf) => f(init, leaf),
        Tree::Sequence(items) => items.iter().fold(init, |acc, item| tree_reduce(item, acc, f)),
        Tree::Mapping(entries) => entries
            .values()
            .fold(init, |acc, item| tree_reduce(item, acc, f)),
        Tree::Const(_) | Tree::Opaque(_) => init,
    }
}

/// Function used by [`tree_merge`] when two non-container nodes collide.
pub type MergeFn<'a, L> = &'a mut dyn FnMut(Tree<L>, Tree<L>) -> Tree<L>;

/// Merges two trees.
///
/// Empty containers and `null` count as absent. Sequences merge by index,
/// mappings by key. Two present non-container nodes are combined through
/// `merge`; without one the collision is an error.
pub fn tree_merge<L>(
    a: Tree<L>,
    b: Tree<L>,
    mut merge: Option<MergeFn<'_, L>>,
) -> Result<Tree<L>, TreeError> {
    let mut path = TreePath::root();
    merge_at(a, b, &mut path, &mut merge)
}

fn is_absent<L>(tree: &Tree<L>) -> bool {
    match tree {
        Tree::Sequence(items) => items.is_empty(),
        Tree::Mapping(entries) => entries.is_empty(),
        Tree::Const(constant) => constant.is_null(),
        Tree::Leaf(_) | Tree::Opaque(_) => false,
    }
}

fn merge_at<L>(
    a: Tree<L>,
    b: Tree<L>,
    path: &mut TreePath,
    merge: &mut Option<MergeFn<'_, L>>,
) -> Result<Tree<L>, TreeError> {
    if is_absent(&a) {
        return Ok(b);
    }
    if is_absent(&b) {
        return Ok(a);
    }
    match (a, b) {
        (Tree::Sequence(xs), Tree::Sequence(ys)) => {
            let len = xs.len().max(ys.len());
            let mut xs = xs.into_iter();
            let mut ys = ys.into_iter();
            let mut out = Vec::with_capacity(len);
            for index in 0..len {
                path.push_index(index);
                let merged = match (xs.next(), ys.next()) {
                    (Some(x), Some(y)) => merge_at(x, y, path, merge)?,
                    (Some(x), None) => x,
                    (None, Some(y)) => y,
                    (None, None) => Tree::null(),
                };
                out.push(merged);
                path.pop();
            }
            Ok(Tree::Sequence(out))
        }
        (Tree::Mapping(mut xs), Tree::Mapping(ys)) => {
            for (key, y) in ys {
                let merged = match xs.remove(&key) {
                    Some(x) => {
                        path.push_key(&key);
                        let merged = merge_at(x, y, path, merge)?;
                        path.pop();
                        merged
                    }
                    None => y,
                };
                xs.insert(key, merged);
            }
            Ok(Tree::Mapping(xs))
        }
        (x @ (Tree::Sequence(_) | Tree::Mapping(_)), y)
        | (x, y @ (Tree::Sequence(_) | Tree::Mapping(_))) => Err(mismatch(
            path,
            format!("cannot merge {} with {}", x.kind_name(), y.kind_name()),
        )),
        (x, y) => match merge {
            Some(merge) => Ok((*merge)(x, y)),
            None => Err(TreeError::MergeConflict {
                path: path.to_string(),
            }),
        },
    }
}
