//! Header records anchoring the tree roots.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::btree::NodePointer;
use crate::error::{DriftError, Result};
use crate::file::{BlockFile, BLOCK_SIZE};
use crate::term::Term;

pub const DISK_VERSION: i64 = 1;

const HEADER_TAG: &str = "db_header";
const HEADER_ARITY: usize = 8;

/// The persisted header term. Repair copies a prior header and only advances
/// the sequence and root positions, so every field added here is preserved
/// across a repair automatically.
#[derive(Clone, Debug)]
pub struct DbHeader {
    pub disk_version: i64,
    pub update_seq: u64,
    pub purge_seq: u64,
    pub by_id_root: Option<NodePointer>,
    pub by_seq_root: Option<NodePointer>,
    pub local_root: Option<NodePointer>,
    pub uuid: Vec<u8>,
}

impl DbHeader {
    pub fn new() -> DbHeader {
        let mut uuid = [0u8; 16];
        OsRng.fill_bytes(&mut uuid);
        DbHeader {
            disk_version: DISK_VERSION,
            update_seq: 0,
            purge_seq: 0,
            by_id_root: None,
            by_seq_root: None,
            local_root: None,
            uuid: uuid.to_vec(),
        }
    }

    pub fn to_term(&self) -> Term {
        Term::Tuple(vec![
            Term::atom(HEADER_TAG),
            Term::Int(self.disk_version),
            Term::Int(self.update_seq as i64),
            Term::Int(self.purge_seq as i64),
            root_to_term(&self.by_id_root),
            root_to_term(&self.by_seq_root),
            root_to_term(&self.local_root),
            Term::Binary(self.uuid.clone()),
        ])
    }

    pub fn from_term(term: &Term) -> Result<DbHeader> {
        let items = term
            .as_tuple()
            .filter(|items| items.len() == HEADER_ARITY)
            .ok_or_else(|| DriftError::Corruption("header term has unexpected shape".into()))?;
        if !items[0].is_atom(HEADER_TAG) {
            return Err(DriftError::Corruption("header term has unexpected tag".into()));
        }
        let disk_version = items[1]
            .as_int()
            .ok_or_else(|| DriftError::Corruption("header disk version is not an integer".into()))?;
        let update_seq = non_negative(&items[2], "update sequence")?;
        let purge_seq = non_negative(&items[3], "purge sequence")?;
        let uuid = items[7]
            .as_binary()
            .ok_or_else(|| DriftError::Corruption("header uuid is not a binary".into()))?
            .to_vec();
        Ok(DbHeader {
            disk_version,
            update_seq,
            purge_seq,
            by_id_root: root_from_term(&items[4])?,
            by_seq_root: root_from_term(&items[5])?,
            local_root: root_from_term(&items[6])?,
            uuid,
        })
    }

    /// Scans block boundaries from the end of the file for the most recent
    /// block that both carries the header marker and decodes to a well-formed
    /// header term. Damaged candidates are skipped, not fatal.
    pub fn find_last(file: &BlockFile) -> Result<Option<(u64, DbHeader)>> {
        for block in (0..file.block_count()).rev() {
            let pos = block * BLOCK_SIZE;
            let Ok(term) = file.read_header_at(pos) else {
                continue;
            };
            match DbHeader::from_term(&term) {
                Ok(header) => return Ok(Some((pos, header))),
                Err(_) => continue,
            }
        }
        Ok(None)
    }
}

impl Default for DbHeader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_negative(term: &Term, what: &str) -> Result<u64> {
    term.as_int()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| DriftError::Corruption(format!("header {what} is not a sequence")))
}

fn root_to_term(root: &Option<NodePointer>) -> Term {
    match root {
        Some(pointer) => pointer.to_term(),
        None => Term::nil(),
    }
}

fn root_from_term(term: &Term) -> Result<Option<NodePointer>> {
    if term.is_atom("nil") {
        return Ok(None);
    }
    Ok(Some(NodePointer::from_term(term)?))
}
