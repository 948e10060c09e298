//! Document and revision model.
//!
//! A document's leaf entry carries its full revision list; replication-style
//! merges union revision lists, which is what makes salvaging the same
//! document from several stale roots idempotent.

use std::fmt;

use crate::error::{DriftError, Result};
use crate::term::Term;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevId {
    pub gen: u64,
    pub digest: Vec<u8>,
}

impl RevId {
    pub fn to_term(&self) -> Term {
        Term::Tuple(vec![
            Term::Int(self.gen as i64),
            Term::Binary(self.digest.clone()),
        ])
    }

    pub fn from_term(term: &Term) -> Result<RevId> {
        let items = term
            .as_tuple()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| DriftError::Corruption("malformed revision id".into()))?;
        let gen = items[0]
            .as_int()
            .filter(|g| *g > 0)
            .ok_or_else(|| DriftError::Corruption("revision generation is not positive".into()))?;
        let digest = items[1]
            .as_binary()
            .ok_or_else(|| DriftError::Corruption("revision digest is not a binary".into()))?
            .to_vec();
        Ok(RevId {
            gen: gen as u64,
            digest,
        })
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.gen)?;
        for byte in &self.digest {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One stored revision of a document.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    pub rev: RevId,
    pub body_pos: u64,
    pub deleted: bool,
}

impl Revision {
    fn to_term(&self) -> Term {
        Term::Tuple(vec![
            self.rev.to_term(),
            Term::Int(self.body_pos as i64),
            Term::bool(self.deleted),
        ])
    }

    fn from_term(term: &Term) -> Result<Revision> {
        let items = term
            .as_tuple()
            .filter(|items| items.len() == 3)
            .ok_or_else(|| DriftError::Corruption("malformed revision entry".into()))?;
        let body_pos = items[1]
            .as_int()
            .filter(|p| *p >= 0)
            .ok_or_else(|| DriftError::Corruption("revision body offset is invalid".into()))?;
        let deleted = items[2]
            .as_bool()
            .ok_or_else(|| DriftError::Corruption("revision deleted flag is invalid".into()))?;
        Ok(Revision {
            rev: RevId::from_term(&items[0])?,
            body_pos: body_pos as u64,
            deleted,
        })
    }
}

/// Everything the by-id tree knows about one document.
#[derive(Clone, Debug, PartialEq)]
pub struct DocInfo {
    pub id: Vec<u8>,
    pub update_seq: u64,
    pub revs: Vec<Revision>,
}

impl DocInfo {
    /// The winning revision: the greatest by `(generation, digest)`. The
    /// revision list is linear history, so the newest revision decides the
    /// document's current state, tombstone or not.
    pub fn winner(&self) -> Option<&Revision> {
        self.revs.iter().max_by(|a, b| a.rev.cmp(&b.rev))
    }

    pub fn has_rev(&self, rev: &RevId) -> bool {
        self.revs.iter().any(|r| &r.rev == rev)
    }

    /// Value stored under the document id in the by-id tree.
    pub fn id_value(&self) -> Term {
        Term::Tuple(vec![
            Term::Int(self.update_seq as i64),
            Term::List(self.revs.iter().map(Revision::to_term).collect()),
        ])
    }

    /// Value stored under the update sequence in the by-seq tree.
    pub fn seq_value(&self) -> Term {
        Term::Tuple(vec![
            Term::Binary(self.id.clone()),
            Term::List(self.revs.iter().map(Revision::to_term).collect()),
        ])
    }

    pub fn from_id_value(id: Vec<u8>, value: &Term) -> Result<DocInfo> {
        let items = value
            .as_tuple()
            .filter(|items| items.len() == 2)
            .ok_or_else(|| DriftError::Corruption("malformed by-id document value".into()))?;
        let update_seq = items[0]
            .as_int()
            .filter(|s| *s >= 0)
            .ok_or_else(|| DriftError::Corruption("document sequence is invalid".into()))?;
        let rev_terms = items[1]
            .as_list()
            .ok_or_else(|| DriftError::Corruption("document revisions are not a list".into()))?;
        let mut revs = Vec::with_capacity(rev_terms.len());
        for term in rev_terms {
            revs.push(Revision::from_term(term)?);
        }
        Ok(DocInfo {
            id,
            update_seq: update_seq as u64,
            revs,
        })
    }
}

/// True when the document a by-id leaf value describes is deleted. Parse
/// problems count as live; reductions are advisory.
pub fn id_value_deleted(value: &Term) -> bool {
    DocInfo::from_id_value(Vec::new(), value)
        .ok()
        .and_then(|info| info.winner().map(|w| w.deleted))
        .unwrap_or(false)
}

/// Derives the next revision id the way interactive writes do: generation
/// one past the parent, digest over the parent, flags, and body.
pub fn new_rev(parent: Option<&RevId>, body: &[u8], deleted: bool) -> RevId {
    let gen = parent.map_or(1, |p| p.gen + 1);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&gen.to_be_bytes());
    if let Some(parent) = parent {
        hasher.update(&parent.digest);
    }
    hasher.update(&[u8::from(deleted)]);
    hasher.update(body);
    let digest = hasher.finalize().to_be_bytes().to_vec();
    RevId { gen, digest }
}

/// A materialized document as handed back to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: Vec<u8>,
    pub rev: RevId,
    pub deleted: bool,
    pub body: Vec<u8>,
}
