//! Root classification for candidate node offsets.

use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::btree::{self, Direction, FoldControl, NodePointer};
use crate::error::{DriftError, Result};
use crate::file::BlockFile;
use crate::term::Term;

/// Which of the two trees a node belongs to, decided purely by key type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeKind {
    BySeq,
    ById,
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeKind::BySeq => write!(f, "by_seq"),
            TreeKind::ById => write!(f, "by_id"),
        }
    }
}

/// Update sequences are integers, document ids are binaries; nothing else is
/// a valid tree key.
pub fn classify_key(key: &Term) -> Result<TreeKind> {
    match key {
        Term::Int(_) => Ok(TreeKind::BySeq),
        Term::Binary(_) => Ok(TreeKind::ById),
        other => Err(DriftError::Corruption(format!(
            "tree key is neither sequence nor document id: {other}"
        ))),
    }
}

/// Opens a tree rooted at `pos` with a placeholder reduction and
/// reverse-folds to its greatest key. Any failure along the way (unreadable
/// node, empty tree, unclassifiable key) means the offset is not a usable
/// root.
pub fn probe_root(file: &BlockFile, pos: u64) -> Option<(TreeKind, Term)> {
    let root = NodePointer {
        pos,
        reduction: Term::nil(),
    };
    let mut last_key = None;
    btree::fold(file, &root, Direction::Reverse, &mut |key, _| {
        last_key = Some(key.clone());
        Ok(FoldControl::Stop)
    })
    .ok()?;
    let key = last_key?;
    let kind = classify_key(&key).ok()?;
    trace!(pos, kind = %kind, "repair.probe.root_classified");
    Some((kind, key))
}
