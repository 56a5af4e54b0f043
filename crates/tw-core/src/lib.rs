#![forbid(unsafe_code)]

//! Tree data model, the tree <-> flat leaf codec and differentiation target
//! selection.

pub mod codec;
pub mod error;
pub mod selection;
pub mod tree;
pub mod treedef;
pub mod utils;

pub use codec::{
    LeafPolicy, PathSegment, TreePath, flatten, flatten_at, flatten_call, flatten_into, inflate,
    inflate_at, inflate_call, inflate_exact,
};
pub use error::{ErrorKind, SelectionError, TreeError};
pub use selection::{ArgId, DiffTargets, Gradients, Selection, Selections, select};
pub use tree::{CallArgs, Constant, Opaque, Tree};
pub use treedef::TreeDef;
pub use utils::{
    MergeFn, tree_flatten_with_paths, tree_map, tree_map_many, tree_map_subtrees,
    tree_map_with_path, tree_merge, tree_reduce, tree_unflatten, tree_zip_map,
};
