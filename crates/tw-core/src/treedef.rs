use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::tree::Constant;

/// Shape descriptor of a flattened tree.
///
/// Tensor leaves appear as [`TreeDef::ArrayLeaf`] placeholders; constants are
/// stored inline. Two calls whose trees agree in structure and constants
/// produce equal descriptors regardless of tensor contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeDef {
    ArrayLeaf,
    Sequence(Vec<TreeDef>),
    Mapping(Vec<(String, TreeDef)>),
    Constant(Constant),
}

impl TreeDef {
    /// Number of `ArrayLeaf` placeholders, i.e. the flat list length this
    /// descriptor inflates from.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::ArrayLeaf => 1,
            Self::Sequence(items) => items.iter().map(Self::leaf_count).sum(),
            Self::Mapping(entries) => entries.iter().map(|(_, def)| def.leaf_count()).sum(),
            Self::Constant(_) => 0,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::ArrayLeaf)
    }

    /// Splits a whole-call descriptor into its positional and keyword parts.
    #[must_use]
    pub fn call_parts(&self) -> Option<(&[TreeDef], &[(String, TreeDef)])> {
        match self {
            Self::Sequence(parts) => match parts.as_slice() {
                [Self::Sequence(positional), Self::Mapping(keyword)] => {
                    Some((positional.as_slice(), keyword.as_slice()))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Stable textual rendering used for digests and log fields.
    #[must_use]
    pub fn canonical_fingerprint(&self) -> String {
        let mut out = String::new();
        write_def(&mut out, self);
        out
    }
}

fn write_def(out: &mut String, def: &TreeDef) {
    match def {
        TreeDef::ArrayLeaf => out.push('L'),
        TreeDef::Sequence(items) => {
            out.push_str("S[");
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_def(out, item);
            }
            out.push(']');
        }
        TreeDef::Mapping(entries) => {
            out.push_str("M{");
            for (idx, (key, item)) in entries.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{key:?}:");
                write_def(out, item);
            }
            out.push('}');
        }
        TreeDef::Constant(constant) => write_constant(out, constant),
    }
}

fn write_constant(out: &mut String, constant: &Constant) {
    let _ = match constant {
        Constant::Null => write!(out, "C(null)"),
        Constant::Bool(value) => write!(out, "C(bool:{value})"),
        Constant::I64(value) => write!(out, "C(i64:{value})"),
        Constant::F64Bits(bits) => write!(out, "C(f64:{bits:#018x})"),
        Constant::Str(text) => write!(out, "C(str:{text:?})"),
        Constant::Symbol(text) => write!(out, "C(sym:{text:?})"),
    };
}
