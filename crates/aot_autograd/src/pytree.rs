//! Nested argument and result structures, and flattening them to lists of leaves.

use serde::Serialize;

use aot_tensor::Error;

#[derive(Clone, Debug, PartialEq)]
pub enum Tree<T> {
    Leaf(T),
    List(Vec<Tree<T>>),
    Dict(Vec<(String, Tree<T>)>),
}

/// The shape of a [`Tree`] without its leaves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TreeSpec {
    Leaf,
    List(Vec<TreeSpec>),
    Dict(Vec<(String, TreeSpec)>),
}

impl TreeSpec {
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeSpec::Leaf => 1,
            TreeSpec::List(children) => children.iter().map(TreeSpec::num_leaves).sum(),
            TreeSpec::Dict(children) => children.iter().map(|(_, c)| c.num_leaves()).sum(),
        }
    }
}

impl<T> Tree<T> {
    pub fn leaf(value: T) -> Self {
        Tree::Leaf(value)
    }

    pub fn list(leaves: impl IntoIterator<Item = T>) -> Self {
        Tree::List(leaves.into_iter().map(Tree::Leaf).collect())
    }

    pub fn into_leaf(self) -> Result<T, Error> {
        match self {
            Tree::Leaf(value) => Ok(value),
            _ => Err(Error::Invariant("expected a leaf".to_owned())),
        }
    }

    pub fn into_list(self) -> Result<Vec<Tree<T>>, Error> {
        match self {
            Tree::List(children) => Ok(children),
            _ => Err(Error::Invariant("expected a list".to_owned())),
        }
    }

    /// The child under `key` of a dict.
    pub fn get(&self, key: &str) -> Option<&Tree<T>> {
        match self {
            Tree::Dict(children) => children.iter().find(|(k, _)| k == key).map(|(_, c)| c),
            _ => None,
        }
    }
}

fn flatten_into<T>(tree: Tree<T>, leaves: &mut Vec<T>) -> TreeSpec {
    match tree {
        Tree::Leaf(value) => {
            leaves.push(value);
            TreeSpec::Leaf
        }
        Tree::List(children) => TreeSpec::List(
            children
                .into_iter()
                .map(|child| flatten_into(child, leaves))
                .collect(),
        ),
        Tree::Dict(children) => TreeSpec::Dict(
            children
                .into_iter()
                .map(|(key, child)| (key, flatten_into(child, leaves)))
                .collect(),
        ),
    }
}

/// Leaves in depth-first order, and the structure holding them.
pub fn tree_flatten<T>(tree: Tree<T>) -> (Vec<T>, TreeSpec) {
    let mut leaves = Vec::new();
    let spec = flatten_into(tree, &mut leaves);
    (leaves, spec)
}

fn unflatten_from<T>(
    leaves: &mut impl Iterator<Item = T>,
    spec: &TreeSpec,
) -> Result<Tree<T>, Error> {
    Ok(match spec {
        TreeSpec::Leaf => Tree::Leaf(
            leaves
                .next()
                .ok_or_else(|| Error::Invariant("too few leaves for tree spec".to_owned()))?,
        ),
        TreeSpec::List(children) => Tree::List(
            children
                .iter()
                .map(|child| unflatten_from(leaves, child))
                .collect::<Result<_, _>>()?,
        ),
        TreeSpec::Dict(children) => Tree::Dict(
            children
                .iter()
                .map(|(key, child)| Ok((key.clone(), unflatten_from(leaves, child)?)))
                .collect::<Result<_, Error>>()?,
        ),
    })
}

pub fn tree_unflatten<T>(leaves: Vec<T>, spec: &TreeSpec) -> Result<Tree<T>, Error> {
    if leaves.len() != spec.num_leaves() {
        return Err(Error::Invariant(format!(
            "tree spec has {} leaves, but {} were given",
            spec.num_leaves(),
            leaves.len()
        )));
    }
    unflatten_from(&mut leaves.into_iter(), spec)
}
