//! Choosing which call arguments a gradient is taken with respect to.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Range;

use crate::codec::{LeafPolicy, TreePath, flatten_at, inflate_at};
use crate::error::{SelectionError, TreeError};
use crate::tree::{CallArgs, Tree};
use crate::treedef::TreeDef;

/// Identifies one argument of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgId {
    Position(usize),
    Name(String),
}

impl std::fmt::Display for ArgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Position(index) => write!(f, "positional argument {index}"),
            Self::Name(name) => write!(f, "keyword argument '{name}'"),
        }
    }
}

/// Normalized differentiation targets, fixed when a wrapper is built.
///
/// Positions and names keep the order in which they were requested;
/// gradients come back in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffTargets {
    positions: SmallVec<[usize; 4]>,
    names: SmallVec<[String; 2]>,
}

impl Default for DiffTargets {
    fn default() -> Self {
        Self {
            positions: SmallVec::from_slice(&[0]),
            names: SmallVec::new(),
        }
    }
}

impl DiffTargets {
    /// `argnums = None` means `[0]` when no names are given and no positions
    /// otherwise.
    pub fn new(argnums: Option<&[i64]>, argnames: &[&str]) -> Result<Self, SelectionError> {
        let mut positions: SmallVec<[usize; 4]> = SmallVec::new();
        match argnums {
            Some(requested) => {
                for &raw in requested {
                    let position = usize::try_from(raw)
                        .map_err(|_| SelectionError::NegativePosition { position: raw })?;
                    if positions.contains(&position) {
                        return Err(SelectionError::DuplicatePosition { position });
                    }
                    positions.push(position);
                }
            }
            None if argnames.is_empty() => positions.push(0),
            None => {}
        }

        let mut names: SmallVec<[String; 2]> = SmallVec::new();
        for &name in argnames {
            if names.iter().any(|existing| existing == name) {
                return Err(SelectionError::DuplicateName {
                    name: name.to_owned(),
                });
            }
            names.push(name.to_owned());
        }

        if positions.is_empty() && names.is_empty() {
            return Err(SelectionError::NoTarget);
        }
        Ok(Self { positions, names })
    }

    /// Shorthand for differentiating with respect to positions only.
    pub fn positions_only(argnums: &[i64]) -> Result<Self, SelectionError> {
        Self::new(Some(argnums), &[])
    }

    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn has_names(&self) -> bool {
        !self.names.is_empty()
    }
}

/// One selected argument and where its leaves sit in the flat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub target: ArgId,
    pub def: TreeDef,
    pub range: Range<usize>,
}

/// The per-call result of [`select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selections {
    items: SmallVec<[Selection; 4]>,
    keyword_requested: bool,
    leaf_count: usize,
}

/// Flattens the requested arguments of `args` strictly, positions first.
pub fn select<L: Clone>(
    args: &CallArgs<L>,
    targets: &DiffTargets,
) -> Result<(Selections, Vec<L>), SelectionError> {
    let mut leaves = Vec::new();
    let mut items = SmallVec::new();

    for &position in targets.positions() {
        let arg = args
            .arg(position)
            .ok_or(SelectionError::PositionOutOfRange {
                position,
                provided: args.positional_len(),
            })?;
        let mut path = TreePath::positional(position);
        items.push(select_one(
            ArgId::Position(position),
            arg,
            &mut path,
            &mut leaves,
        )?);
    }

    for name in targets.names() {
        let arg = args.kwarg(name).ok_or_else(|| SelectionError::MissingKeyword {
            name: name.clone(),
        })?;
        let mut path = TreePath::keyword(name);
        items.push(select_one(
            ArgId::Name(name.clone()),
            arg,
            &mut path,
            &mut leaves,
        )?);
    }

    let selections = Selections {
        items,
        keyword_requested: targets.has_names(),
        leaf_count: leaves.len(),
    };
    Ok((selections, leaves))
}

fn select_one<L: Clone>(
    target: ArgId,
    arg: &Tree<L>,
    path: &mut TreePath,
    leaves: &mut Vec<L>,
) -> Result<Selection, SelectionError> {
    let start = leaves.len();
    let def = flatten_at(arg, path, leaves, LeafPolicy::Strict).map_err(|source| {
        SelectionError::Target {
            target: target.to_string(),
            source,
        }
    })?;
    Ok(Selection {
        target,
        def,
        range: start..leaves.len(),
    })
}

impl Selections {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Selection> {
        self.items.iter()
    }

    /// Total number of selected tensor leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Indices into the flat list an engine should differentiate, which is
    /// all of them.
    #[must_use]
    pub fn diff_positions(&self) -> Vec<usize> {
        (0..self.leaf_count).collect()
    }

    /// Rebuilds the call with every selected argument replaced from
    /// `new_leaves`; unselected arguments are cloned unchanged.
    pub fn substitute<L: Clone>(
        &self,
        args: &CallArgs<L>,
        new_leaves: &[L],
    ) -> Result<CallArgs<L>, TreeError> {
        let mut out = args.clone();
        let mut cursor = 0;
        for selection in &self.items {
            let (value, next) = inflate_at(&selection.def, new_leaves, cursor)?;
            cursor = next;
            match &selection.target {
                ArgId::Position(index) => {
                    if let Some(slot) = out.positional.get_mut(*index) {
                        *slot = value;
                    }
                }
                ArgId::Name(name) => {
                    out.keyword.insert(name.clone(), value);
                }
            }
        }
        ensure_consumed("input", cursor, new_leaves.len())?;
        Ok(out)
    }

    /// Regroups flat gradients into the shape the caller asked for.
    pub fn rebuild_gradients<L: Clone>(&self, flat_grads: &[L]) -> Result<Gradients<L>, TreeError> {
        let mut positional = Vec::new();
        let mut keyword = BTreeMap::new();
        let mut cursor = 0;
        for selection in &self.items {
            let (value, next) = inflate_at(&selection.def, flat_grads, cursor)?;
            cursor = next;
            match &selection.target {
                ArgId::Position(_) => positional.push(value),
                ArgId::Name(name) => {
                    keyword.insert(name.clone(), value);
                }
            }
        }
        ensure_consumed("gradient", cursor, flat_grads.len())?;

        let positional = match positional.len() {
            0 => None,
            1 => positional.pop(),
            _ => Some(Tree::Sequence(positional)),
        };
        if self.keyword_requested {
            Ok(Gradients::WithKeywords {
                positional,
                keyword,
            })
        } else {
            positional
                .map(Gradients::Positional)
                .ok_or(TreeError::LeafCountMismatch {
                    context: "gradient",
                    consumed: cursor,
                    provided: flat_grads.len(),
                })
        }
    }
}

fn ensure_consumed(
    context: &'static str,
    consumed: usize,
    provided: usize,
) -> Result<(), TreeError> {
    if consumed == provided {
        Ok(())
    } else {
        Err(TreeError::LeafCountMismatch {
            context,
            consumed,
            provided,
        })
    }
}

/// Gradients shaped like the requested targets.
///
/// A single positional target yields the bare gradient; several yield a
/// sequence. When any keyword was requested the result pairs the positional
/// part (possibly absent) with a mapping of keyword gradients.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradients<L> {
    Positional(Tree<L>),
    WithKeywords {
        positional: Option<Tree<L>>,
        keyword: BTreeMap<String, Tree<L>>,
    },
}

impl<L> Gradients<L> {
    #[must_use]
    pub fn positional(&self) -> Option<&Tree<L>> {
        match self {
            Self::Positional(tree) => Some(tree),
            Self::WithKeywords { positional, .. } => positional.as_ref(),
        }
    }

    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&Tree<L>> {
        match self {
            Self::Positional(_) => None,
            Self::WithKeywords { keyword, .. } => keyword.get(name),
        }
    }

    /// Renders the result as one tree; the keyword form becomes
    /// `[positional or null, {name: grad}]`.
    pub fn into_tree(self) -> Tree<L> {
        match self {
            Self::Positional(tree) => tree,
            Self::WithKeywords {
                positional,
                keyword,
            } => Tree::Sequence(vec![
                positional.unwrap_or_else(Tree::null),
                Tree::Mapping(keyword),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ArgId, DiffTargets, Gradients, select};
    use crate::error::{ErrorKind, SelectionError};
    use crate::tree::{CallArgs, Tree};

    fn three_args() -> CallArgs<i32> {
        CallArgs::new(vec![
            Tree::leaf(1),
            Tree::sequence([Tree::leaf(2), Tree::leaf(3)]),
            Tree::leaf(4),
        ])
    }

    #[test]
    fn default_targets_are_position_zero() {
        let targets = DiffTargets::new(None, &[]).expect("default");
        assert_eq!(targets, DiffTargets::default());
        assert_eq!(targets.positions(), &[0]);

        let named = DiffTargets::new(None, &["y"]).expect("names only");
        assert!(named.positions().is_empty());
        assert_eq!(named.names(), &["y".to_owned()]);
    }

    #[test]
    fn invalid_targets_are_usage_errors() {
        let cases = [
            (DiffTargets::new(Some(&[-1]), &[]), SelectionError::NegativePosition { position: -1 }),
            (
                DiffTargets::new(Some(&[1, 1]), &[]),
                SelectionError::DuplicatePosition { position: 1 },
            ),
            (
                DiffTargets::new(None, &["y", "y"]),
                SelectionError::DuplicateName {
                    name: "y".to_owned(),
                },
            ),
            (DiffTargets::new(Some(&[]), &[]), SelectionError::NoTarget),
        ];
        for (result, expected) in cases {
            let err = result.expect_err("invalid targets");
            assert_eq!(err, expected);
            assert_eq!(err.kind(), ErrorKind::Argument);
        }
    }

    #[test]
    fn select_only_flattens_requested_arguments() {
        let args = three_args();
        let targets = DiffTargets::positions_only(&[1]).expect("targets");
        let (selections, leaves) = select(&args, &targets).expect("select");
        assert_eq!(leaves, vec![2, 3]);
        assert_eq!(selections.len(), 1);
        let first = selections.iter().next().expect("one selection");
        assert_eq!(first.target, ArgId::Position(1));
        assert_eq!(first.range, 0..2);

        let substituted = selections.substitute(&args, &[20, 30]).expect("substitute");
        assert_eq!(substituted.positional[0], Tree::leaf(1));
        assert_eq!(substituted.positional[1], Tree::sequence([Tree::leaf(20), Tree::leaf(30)]));
        assert_eq!(substituted.positional[2], Tree::leaf(4));
    }

    #[test]
    fn select_reports_missing_arguments() {
        let args = three_args();
        let err = select(&args, &DiffTargets::positions_only(&[5]).expect("targets"))
            .expect_err("out of range");
        assert_eq!(
            err,
            SelectionError::PositionOutOfRange {
                position: 5,
                provided: 3,
            }
        );

        let err = select(&args, &DiffTargets::new(None, &["y"]).expect("targets"))
            .expect_err("missing keyword");
        assert!(err.to_string().contains("'y'"));
    }

    #[test]
    fn selected_constants_are_type_errors() {
        let args: CallArgs<i32> = CallArgs::new(vec![Tree::mapping([("w", Tree::int(3))])]);
        let err = select(&args, &DiffTargets::default()).expect_err("constant target");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert!(err.to_string().contains("args.0.w"));
    }

    #[test]
    fn gradients_follow_request_shape() {
        let args = three_args().with_kwarg("y", Tree::leaf(9));

        let (single, _) = select(&args, &DiffTargets::default()).expect("select");
        assert_eq!(
            single.rebuild_gradients(&[10]).expect("rebuild"),
            Gradients::Positional(Tree::leaf(10))
        );

        let (many, _) =
            select(&args, &DiffTargets::positions_only(&[0, 2]).expect("targets")).expect("select");
        assert_eq!(
            many.rebuild_gradients(&[10, 40]).expect("rebuild"),
            Gradients::Positional(Tree::sequence([Tree::leaf(10), Tree::leaf(40)]))
        );

        let targets = DiffTargets::new(Some(&[0]), &["y"]).expect("targets");
        let (mixed, leaves) = select(&args, &targets).expect("select");
        assert_eq!(leaves, vec![1, 9]);
        let grads = mixed.rebuild_gradients(&[10, 90]).expect("rebuild");
        assert_eq!(grads.positional(), Some(&Tree::leaf(10)));
        assert_eq!(grads.keyword("y"), Some(&Tree::leaf(90)));

        let (names_only, _) =
            select(&args, &DiffTargets::new(None, &["y"]).expect("targets")).expect("select");
        let grads = names_only.rebuild_gradients(&[90]).expect("rebuild");
        assert_eq!(grads.positional(), None);
        assert_eq!(
            grads.into_tree(),
            Tree::sequence([Tree::null(), Tree::mapping([("y", Tree::leaf(90))])])
        );
    }

    #[test]
    fn rebuild_rejects_wrong_gradient_count() {
        let (selections, _) = select(&three_args(), &DiffTargets::default()).expect("select");
        let err = selections.rebuild_gradients(&[1, 2]).expect_err("extra gradient");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
