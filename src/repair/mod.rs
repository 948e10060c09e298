//! Salvage engine for damaged database files.
//!
//! Nothing here trusts the trailing header. In-place repair rebuilds a
//! header from the newest tree roots discoverable past the last good one;
//! lost-and-found recovery abandons the header entirely, enumerates every
//! surviving by-id leaf by its byte signature, and streams the documents
//! those leaves can reach into a fresh target database. The source file is
//! only ever appended to, never truncated or rewritten.

use std::fs;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::btree::{FoldControl, NodePointer};
use crate::config::ToolConfig;
use crate::db::{Db, DbHeader, DocInfo, IncomingDoc, IncomingRev, SyncPolicy};
use crate::error::{DriftError, Result};
use crate::file::BlockFile;
use crate::term::Term;

mod probe;
mod scan;

pub use probe::{classify_key, probe_root, TreeKind};
pub use scan::{find_node_candidates, tail_scan, FoundRoot, KV_NODE_SIG, SCAN_CHUNK_SIZE};

/// Documents are streamed into the lost-and-found target in batches this
/// large, with a full commit after each.
pub const MERGE_BATCH_SIZE: usize = 1000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    /// Trailing header is current; the file was left untouched.
    Clean,
    /// No valid header anywhere; the caller may escalate to lost-and-found.
    NoHeader,
    /// A new header was appended.
    Repaired(RepairReport),
}

#[derive(Clone, Debug, Serialize)]
pub struct RepairReport {
    pub prev_header_pos: u64,
    pub new_header_pos: u64,
    pub update_seq: u64,
    pub by_seq_root_pos: u64,
    pub by_id_root_pos: Option<u64>,
}

/// In-place header repair against an already-open file.
pub fn repair_file(file: &mut BlockFile) -> Result<RepairOutcome> {
    let Some((header_pos, header)) = DbHeader::find_last(file)? else {
        info!("repair.header.absent");
        return Ok(RepairOutcome::NoHeader);
    };
    debug!(pos = header_pos, update_seq = header.update_seq, "repair.header.found");

    let Some(seq_root) = tail_scan(file, TreeKind::BySeq, file.len())? else {
        info!("repair.no_by_seq_root");
        return Ok(RepairOutcome::Clean);
    };
    if seq_root.pos <= header_pos {
        info!(
            root = seq_root.pos,
            header = header_pos,
            "repair.roots_precede_header"
        );
        return Ok(RepairOutcome::Clean);
    }
    let id_root = tail_scan(file, TreeKind::ById, file.len())?;

    let update_seq = seq_root
        .last_key
        .as_int()
        .filter(|seq| *seq >= 0)
        .ok_or_else(|| {
            DriftError::Corruption("by-seq root's greatest key is not a sequence".into())
        })? as u64;

    // Root positions advance; the reductions stay as the previous header
    // recorded them and are refreshed by the next regular write.
    let mut repaired = header.clone();
    repaired.update_seq = update_seq;
    repaired.by_seq_root = Some(NodePointer {
        pos: seq_root.pos,
        reduction: preserved_reduction(&header.by_seq_root),
    });
    let by_id_root_pos = id_root.as_ref().map(|root| root.pos);
    repaired.by_id_root = match id_root {
        Some(found) => Some(NodePointer {
            pos: found.pos,
            reduction: preserved_reduction(&header.by_id_root),
        }),
        None => header.by_id_root.clone(),
    };

    file.sync()?;
    let new_header_pos = file.write_header(&repaired.to_term())?;
    file.sync()?;
    info!(
        prev = header_pos,
        new = new_header_pos,
        update_seq,
        by_seq_root = seq_root.pos,
        "repair.header.appended"
    );
    Ok(RepairOutcome::Repaired(RepairReport {
        prev_header_pos: header_pos,
        new_header_pos,
        update_seq,
        by_seq_root_pos: seq_root.pos,
        by_id_root_pos,
    }))
}

fn preserved_reduction(root: &Option<NodePointer>) -> Term {
    root.as_ref()
        .map(|pointer| pointer.reduction.clone())
        .unwrap_or_else(Term::nil)
}

/// Repairs the named database in place.
pub fn repair(config: &ToolConfig, db_name: &str) -> Result<RepairOutcome> {
    let path = config.db_path(db_name);
    info!(db = db_name, path = %path.display(), "repair.start");
    let mut file = BlockFile::open_rw(&path)?;
    repair_file(&mut file)
}

/// Signature-scans an open file for candidate by-id leaf offsets.
pub fn find_nodes_quickly(file: &BlockFile) -> Result<Vec<u64>> {
    find_node_candidates(file)
}

/// Like [`find_nodes_quickly`], but resolves, opens, and closes the named
/// database itself.
pub fn find_nodes_quickly_at(config: &ToolConfig, db_name: &str) -> Result<Vec<u64>> {
    let file = BlockFile::open_read(config.db_path(db_name))?;
    find_node_candidates(&file)
}

/// Streams every document reachable from `source`'s by-id tree into the
/// named target database, creating it if needed.
pub fn merge_to_file(source: &Db, config: &ToolConfig, target_name: &str) -> Result<()> {
    let path = config.db_path(target_name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut target = Db::open_or_create(&path, SyncPolicy::BeforeHeader)?;
    merge_into(source, &mut target)
}

fn merge_into(source: &Db, target: &mut Db) -> Result<()> {
    let mut batch: Vec<IncomingDoc> = Vec::new();
    source.fold_by_id(&mut |info| {
        batch.push(fetch_doc(source, &info)?);
        if batch.len() >= MERGE_BATCH_SIZE {
            flush_batch(target, std::mem::take(&mut batch))?;
        }
        Ok(FoldControl::Continue)
    })?;
    if !batch.is_empty() {
        flush_batch(target, batch)?;
    }
    Ok(())
}

/// Re-reads every leaf revision's body so the document can be replayed into
/// the target as a replicated change.
fn fetch_doc(source: &Db, info: &DocInfo) -> Result<IncomingDoc> {
    let mut revs = Vec::with_capacity(info.revs.len());
    for revision in &info.revs {
        revs.push(IncomingRev {
            rev: revision.rev.clone(),
            deleted: revision.deleted,
            body: source.read_doc_body(revision.body_pos)?,
        });
    }
    Ok(IncomingDoc {
        id: info.id.clone(),
        revs,
    })
}

fn flush_batch(target: &mut Db, batch: Vec<IncomingDoc>) -> Result<()> {
    let total = batch.len();
    let changed = target.apply_replicated(batch)?;
    target.commit()?;
    info!(total, changed, "repair.merge.batch_committed");
    Ok(())
}

/// Lost-and-found recovery: salvages every discoverable by-id leaf of the
/// named database into `lost+found/<db_name>`. Roots are processed
/// independently; a failure on one is logged and the rest continue.
pub fn make_lost_and_found(config: &ToolConfig, db_name: &str) -> Result<()> {
    let src_path = config.db_path(db_name);
    let file = BlockFile::open_read(&src_path)?;
    let candidates = find_node_candidates(&file)?;
    info!(
        db = db_name,
        roots = candidates.len(),
        "repair.lost_and_found.scan_complete"
    );

    let target_name = format!("lost+found/{db_name}");
    let target_path = config.db_path(&target_name);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut target = Db::open_or_create(&target_path, SyncPolicy::BeforeHeader)?;

    for root_pos in candidates {
        let root = NodePointer {
            pos: root_pos,
            reduction: Term::nil(),
        };
        let view = match Db::open_with_by_id_root(&src_path, root) {
            Ok(view) => view,
            Err(err) => {
                warn!(root = root_pos, error = %err, "repair.lost_and_found.open_failed");
                continue;
            }
        };
        if let Err(err) = merge_into(&view, &mut target) {
            warn!(root = root_pos, error = %err, "repair.lost_and_found.merge_failed");
        }
    }
    Ok(())
}
