use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::TreeError;

/// A non-tensor scalar payload that is carried inline in a tree.
///
/// Floats are stored by bit pattern so constants can take part in
/// structural equality and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    I64(i64),
    F64Bits(u64),
    Str(String),
    Symbol(String),
}

impl Constant {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(*bits)),
            Self::I64(value) => Some(*value as f64),
            Self::Null | Self::Bool(_) | Self::Str(_) | Self::Symbol(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Text of a string or symbol constant.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(text) | Self::Symbol(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I64(_) => "int",
            Self::F64Bits(_) => "float",
            Self::Str(_) => "string",
            Self::Symbol(_) => "symbol",
        }
    }
}

/// An arbitrary host object riding along inside a tree.
///
/// Opaque values can be passed as closed-over context to gradient
/// transforms, but they cannot be flattened.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Opaque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opaque")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// A host value built from tensor leaves, sequences, string-keyed mappings
/// and constants.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree<L> {
    Leaf(L),
    Sequence(Vec<Tree<L>>),
    Mapping(BTreeMap<String, Tree<L>>),
    Const(Constant),
    Opaque(Opaque),
}

impl<L> Tree<L> {
    pub fn leaf(value: L) -> Self {
        Self::Leaf(value)
    }

    pub fn sequence(items: impl IntoIterator<Item = Tree<L>>) -> Self {
        Self::Sequence(items.into_iter().collect())
    }

    pub fn mapping<K: Into<String>>(entries: impl IntoIterator<Item = (K, Tree<L>)>) -> Self {
        Self::Mapping(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    #[must_use]
    pub fn null() -> Self {
        Self::Const(Constant::Null)
    }

    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::Const(Constant::I64(value))
    }

    #[must_use]
    pub fn float(value: f64) -> Self {
        Self::Const(Constant::from_f64(value))
    }

    #[must_use]
    pub fn bool(value: bool) -> Self {
        Self::Const(Constant::Bool(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Const(Constant::Str(value.into()))
    }

    pub fn symbol(value: impl Into<String>) -> Self {
        Self::Const(Constant::Symbol(value.into()))
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Opaque(Opaque::new(value))
    }

    /// Short human-readable name of the node kind, used in error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "tensor",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
            Self::Const(constant) => constant.kind_name(),
            Self::Opaque(_) => "opaque object",
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&L> {
        match self {
            Self::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_leaf(self) -> Option<L> {
        match self {
            Self::Leaf(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Tree<L>]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Tree<L>>> {
        match self {
            Self::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Self::Const(constant) => Some(constant),
            _ => None,
        }
    }

    /// Child of a mapping by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Tree<L>> {
        self.as_mapping().and_then(|entries| entries.get(key))
    }

    /// Child of a sequence by index.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&Tree<L>> {
        self.as_sequence().and_then(|items| items.get(index))
    }

    /// Tensor leaves in depth-first order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&L> {
        let mut out = Vec::new();
        collect_leaves(self, &mut out);
        out
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Sequence(items) => items.iter().map(Tree::leaf_count).sum(),
            Self::Mapping(entries) => entries.values().map(Tree::leaf_count).sum(),
            Self::Const(_) | Self::Opaque(_) => 0,
        }
    }
}

fn collect_leaves<'a, L>(tree: &'a Tree<L>, out: &mut Vec<&'a L>) {
    match tree {
        Tree::Leaf(value) => out.push(value),
        Tree::Sequence(items) => items.iter().for_each(|item| collect_leaves(item, out)),
        Tree::Mapping(entries) => entries.values().for_each(|item| collect_leaves(item, out)),
        Tree::Const(_) | Tree::Opaque(_) => {}
    }
}

impl<L> From<Constant> for Tree<L> {
    fn from(value: Constant) -> Self {
        Self::Const(value)
    }
}

impl<L> From<Vec<Tree<L>>> for Tree<L> {
    fn from(value: Vec<Tree<L>>) -> Self {
        Self::Sequence(value)
    }
}

/// The positional and keyword arguments of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs<L> {
    pub positional: Vec<Tree<L>>,
    pub keyword: BTreeMap<String, Tree<L>>,
}

impl<L> Default for CallArgs<L> {
    fn default() -> Self {
        Self {
            positional: Vec::new(),
            keyword: BTreeMap::new(),
        }
    }
}

impl<L> CallArgs<L> {
    #[must_use]
    pub fn new(positional: Vec<Tree<L>>) -> Self {
        Self {
            positional,
            keyword: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: Tree<L>) -> Self {
        self.keyword.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Tree<L>> {
        self.positional.get(index)
    }

    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Tree<L>> {
        self.keyword.get(name)
    }

    #[must_use]
    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    /// The whole call as one tree: `[positional, keyword]`.
    pub fn into_tree(self) -> Tree<L> {
        Tree::Sequence(vec![
            Tree::Sequence(self.positional),
            Tree::Mapping(self.keyword),
        ])
    }

    /// Inverse of [`CallArgs::into_tree`].
    pub fn from_tree(tree: Tree<L>) -> Result<Self, TreeError> {
        let found = tree.kind_name();
        let Tree::Sequence(parts) = tree else {
            return Err(TreeError::MalformedCallTree { found });
        };
        let mut parts = parts.into_iter();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Tree::Sequence(positional)), Some(Tree::Mapping(keyword)), None) => {
                Ok(Self {
                    positional,
                    keyword,
                })
            }
            _ => Err(TreeError::MalformedCallTree { found: "sequence" }),
        }
    }
}

impl<L> From<Vec<Tree<L>>> for CallArgs<L> {
    fn from(value: Vec<Tree<L>>) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{CallArgs, Constant, Opaque, Tree};
    use crate::error::TreeError;

    #[test]
    fn constants_compare_by_bit_pattern() {
        assert_eq!(Constant::from_f64(1.5), Constant::from_f64(1.5));
        assert_ne!(Constant::from_f64(0.0), Constant::from_f64(-0.0));
        assert_eq!(Constant::from_f64(2.0).as_f64(), Some(2.0));
        assert_eq!(Constant::I64(3).as_f64(), Some(3.0));
        assert_eq!(Constant::symbol("relu").as_str(), Some("relu"));
    }

    #[test]
    fn opaque_equality_is_identity() {
        let a = Opaque::new(String::from("cfg"));
        let b = a.clone();
        let c = Opaque::new(String::from("cfg"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.downcast_ref::<String>().map(String::as_str), Some("cfg"));
        assert!(a.type_name().contains("String"));
    }

    #[test]
    fn leaves_are_depth_first() {
        let tree: Tree<u32> = Tree::mapping([
            ("a", Tree::sequence([Tree::int(1), Tree::leaf(10)])),
            ("b", Tree::leaf(20)),
        ]);
        assert_eq!(tree.leaves(), vec![&10, &20]);
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(tree.get("b"), Some(&Tree::leaf(20)));
        assert_eq!(tree.get("a").and_then(|a| a.at(0)), Some(&Tree::int(1)));
    }

    #[test]
    fn call_args_round_trip_through_tree() {
        let args: CallArgs<u32> =
            CallArgs::new(vec![Tree::leaf(1), Tree::bool(true)]).with_kwarg("y", Tree::leaf(2));
        let tree = args.clone().into_tree();
        assert_eq!(CallArgs::from_tree(tree).expect("call tree"), args);
    }

    #[test]
    fn malformed_call_tree_is_internal() {
        let err = CallArgs::<u32>::from_tree(Tree::leaf(1)).expect_err("leaf is not a call");
        assert_eq!(err, TreeError::MalformedCallTree { found: "tensor" });
    }
}
