//! Lossless conversion between trees and a flat leaf list plus a [`TreeDef`].
//!
//! Traversal is depth-first; sequence items in order, mapping values in key
//! order. The n-th `ArrayLeaf` of the descriptor always corresponds to the
//! n-th element of the flat list.

use smallvec::SmallVec;
use std::collections::BTreeMap;

use crate::error::TreeError;
use crate::tree::{CallArgs, Tree};
use crate::treedef::TreeDef;

/// What flattening does with nodes that are neither tensors nor containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LeafPolicy {
    /// Only tensor leaves are accepted; used for differentiation targets.
    #[default]
    Strict,
    /// Constants are recorded inline in the descriptor; opaque objects still
    /// fail. Used for compile/checkpoint inputs and outputs.
    AllowConstants,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Dotted location of a node inside a tree, e.g. `args.0.w.1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreePath {
    segments: SmallVec<[PathSegment; 8]>,
}

impl TreePath {
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Path of positional argument `index` of a call.
    #[must_use]
    pub fn positional(index: usize) -> Self {
        let mut path = Self::root();
        path.push_key("args");
        path.push_index(index);
        path
    }

    /// Path of keyword argument `name` of a call.
    #[must_use]
    pub fn keyword(name: &str) -> Self {
        let mut path = Self::root();
        path.push_key("kwargs");
        path.push_key(name);
        path
    }

    pub fn push_key(&mut self, key: &str) {
        self.segments.push(PathSegment::Key(key.to_owned()));
    }

    pub fn push_index(&mut self, index: usize) {
        self.segments.push(PathSegment::Index(index));
    }

    pub fn pop(&mut self) {
        self.segments.pop();
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Dotted rendering without the `<root>` placeholder; empty at the root.
    #[must_use]
    pub fn dotted(&self) -> String {
        let mut out = String::new();
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                out.push('.');
            }
            match segment {
                PathSegment::Key(key) => out.push_str(key),
                PathSegment::Index(index) => out.push_str(&index.to_string()),
            }
        }
        out
    }
}

impl std::fmt::Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.dotted())
        }
    }
}

pub fn flatten<L: Clone>(
    value: &Tree<L>,
    policy: LeafPolicy,
) -> Result<(TreeDef, Vec<L>), TreeError> {
    let mut leaves = Vec::new();
    let def = flatten_into(value, &mut leaves, policy)?;
    Ok((def, leaves))
}

/// Appends the leaves of `value` to `leaves` and returns its descriptor.
pub fn flatten_into<L: Clone>(
    value: &Tree<L>,
    leaves: &mut Vec<L>,
    policy: LeafPolicy,
) -> Result<TreeDef, TreeError> {
    let mut path = TreePath::root();
    flatten_at(value, &mut path, leaves, policy)
}

/// Like [`flatten_into`], reporting errors relative to `path`.
///
/// `path` is restored to its original depth on success.
pub fn flatten_at<L: Clone>(
    value: &Tree<L>,
    path: &mut TreePath,
    leaves: &mut Vec<L>,
    policy: LeafPolicy,
) -> Result<TreeDef, TreeError> {
    match value {
        Tree::Leaf(leaf) => {
            leaves.push(leaf.clone());
            Ok(TreeDef::ArrayLeaf)
        }
        Tree::Sequence(items) => {
            let mut defs = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                path.push_index(index);
                defs.push(flatten_at(item, path, leaves, policy)?);
                path.pop();
            }
            Ok(TreeDef::Sequence(defs))
        }
        Tree::Mapping(entries) => {
            let mut defs = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                path.push_key(key);
                defs.push((key.clone(), flatten_at(item, path, leaves, policy)?));
                path.pop();
            }
            Ok(TreeDef::Mapping(defs))
        }
        Tree::Const(constant) => match policy {
            LeafPolicy::Strict => Err(TreeError::NonTensorLeaf {
                path: path.to_string(),
                found: constant.kind_name(),
            }),
            LeafPolicy::AllowConstants => Ok(TreeDef::Constant(constant.clone())),
        },
        Tree::Opaque(opaque) => match policy {
            LeafPolicy::Strict => Err(TreeError::NonTensorLeaf {
                path: path.to_string(),
                found: "opaque object",
            }),
            LeafPolicy::AllowConstants => Err(TreeError::UnsupportedLeaf {
                path: path.to_string(),
                type_name: opaque.type_name().to_owned(),
            }),
        },
    }
}

/// Flattens a whole call as the tree `[positional, keyword]` without first
/// cloning it into that shape. Errors are reported under `args.N` and
/// `kwargs.NAME`.
pub fn flatten_call<L: Clone>(
    args: &CallArgs<L>,
    policy: LeafPolicy,
) -> Result<(TreeDef, Vec<L>), TreeError> {
    let mut leaves = Vec::new();
    let mut positional = Vec::with_capacity(args.positional.len());
    for (index, arg) in args.positional.iter().enumerate() {
        let mut path = TreePath::positional(index);
        positional.push(flatten_at(arg, &mut path, &mut leaves, policy)?);
    }
    let mut keyword = Vec::with_capacity(args.keyword.len());
    for (name, arg) in &args.keyword {
        let mut path = TreePath::keyword(name);
        keyword.push((name.clone(), flatten_at(arg, &mut path, &mut leaves, policy)?));
    }
    let def = TreeDef::Sequence(vec![TreeDef::Sequence(positional), TreeDef::Mapping(keyword)]);
    Ok((def, leaves))
}

/// Rebuilds the subtree described by `def` from `leaves[cursor..]` and
/// returns it along with the advanced cursor.
pub fn inflate_at<L: Clone>(
    def: &TreeDef,
    leaves: &[L],
    cursor: usize,
) -> Result<(Tree<L>, usize), TreeError> {
    match def {
        TreeDef::ArrayLeaf => {
            let leaf = leaves.get(cursor).ok_or(TreeError::LeafUnderflow {
                cursor,
                available: leaves.len(),
            })?;
            Ok((Tree::Leaf(leaf.clone()), cursor + 1))
        }
        TreeDef::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut cursor = cursor;
            for item in items {
                let (value, next) = inflate_at(item, leaves, cursor)?;
                out.push(value);
                cursor = next;
            }
            Ok((Tree::Sequence(out), cursor))
        }
        TreeDef::Mapping(entries) => {
            let mut out = BTreeMap::new();
            let mut cursor = cursor;
            for (key, item) in entries {
                let (value, next) = inflate_at(item, leaves, cursor)?;
                out.insert(key.clone(), value);
                cursor = next;
            }
            Ok((Tree::Mapping(out), cursor))
        }
        TreeDef::Constant(constant) => Ok((Tree::Const(constant.clone()), cursor)),
    }
}

/// Rebuilds a whole tree; every leaf must be consumed.
pub fn inflate<L: Clone>(def: &TreeDef, leaves: &[L]) -> Result<Tree<L>, TreeError> {
    inflate_exact(def, leaves, "tree")
}

/// [`inflate`] with a context label used in the mismatch error
/// (`"input"`, `"output"`, ...).
pub fn inflate_exact<L: Clone>(
    def: &TreeDef,
    leaves: &[L],
    context: &'static str,
) -> Result<Tree<L>, TreeError> {
    let (value, consumed) = inflate_at(def, leaves, 0)?;
    if consumed != leaves.len() {
        return Err(TreeError::LeafCountMismatch {
            context,
            consumed,
            provided: leaves.len(),
        });
    }
    Ok(value)
}

/// Rebuilds a call flattened with [`flatten_call`].
pub fn inflate_call<L: Clone>(def: &TreeDef, leaves: &[L]) -> Result<CallArgs<L>, TreeError> {
    CallArgs::from_tree(inflate_exact(def, leaves, "input")?)
}
