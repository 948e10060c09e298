//! Database layer: header management, document reads and writes, commits.

use std::path::Path;

use tracing::debug;

use crate::btree::{self, Direction, FoldControl, NodePointer, Reduce};
use crate::error::{DriftError, Result};
use crate::file::BlockFile;
use crate::term::Term;

mod docs;
mod header;

pub use docs::{new_rev, DocInfo, Document, RevId, Revision};
pub use header::{DbHeader, DISK_VERSION};

/// When to fsync around a header append. `BeforeHeader` is the crash-safe
/// policy: data reaches disk before the header that references it, and the
/// header itself is synced afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPolicy {
    BeforeHeader,
    Never,
}

/// Reduction for the by-seq tree: entry count.
struct SeqCountReduce;

impl Reduce for SeqCountReduce {
    fn reduce(&self, kvs: &[(Term, Term)]) -> Term {
        Term::Int(kvs.len() as i64)
    }

    fn rereduce(&self, reductions: &[Term]) -> Term {
        Term::Int(reductions.iter().filter_map(Term::as_int).sum())
    }
}

/// Reduction for the by-id tree: `{live, deleted}` document counts.
struct IdStatsReduce;

impl Reduce for IdStatsReduce {
    fn reduce(&self, kvs: &[(Term, Term)]) -> Term {
        let deleted = kvs
            .iter()
            .filter(|(_, value)| docs::id_value_deleted(value))
            .count();
        Term::Tuple(vec![
            Term::Int((kvs.len() - deleted) as i64),
            Term::Int(deleted as i64),
        ])
    }

    fn rereduce(&self, reductions: &[Term]) -> Term {
        let mut live = 0;
        let mut deleted = 0;
        for reduction in reductions {
            if let Some(items) = reduction.as_tuple() {
                if items.len() == 2 {
                    live += items[0].as_int().unwrap_or(0);
                    deleted += items[1].as_int().unwrap_or(0);
                }
            }
        }
        Term::Tuple(vec![Term::Int(live), Term::Int(deleted)])
    }
}

/// One incoming revision of a replicated document, body included.
#[derive(Clone, Debug)]
pub struct IncomingRev {
    pub rev: RevId,
    pub deleted: bool,
    pub body: Vec<u8>,
}

/// A replicated document: the full revision set some peer (or salvage view)
/// knows about.
#[derive(Clone, Debug)]
pub struct IncomingDoc {
    pub id: Vec<u8>,
    pub revs: Vec<IncomingRev>,
}

struct PendingDoc {
    id: Vec<u8>,
    old: Option<DocInfo>,
    revs: Vec<Revision>,
}

pub struct Db {
    file: BlockFile,
    header: DbHeader,
    header_pos: Option<u64>,
    sync: SyncPolicy,
    read_only: bool,
}

impl Db {
    /// Creates a fresh database file and commits its empty header.
    pub fn create(path: impl AsRef<Path>, sync: SyncPolicy) -> Result<Db> {
        let file = BlockFile::open_or_create(path)?;
        if !file.is_empty() {
            return Err(DriftError::InvalidArgument(
                "database file already exists".into(),
            ));
        }
        let mut db = Db {
            file,
            header: DbHeader::new(),
            header_pos: None,
            sync,
            read_only: false,
        };
        db.commit()?;
        Ok(db)
    }

    pub fn open(path: impl AsRef<Path>, sync: SyncPolicy) -> Result<Db> {
        let file = BlockFile::open_rw(path)?;
        let (header_pos, header) =
            DbHeader::find_last(&file)?.ok_or(DriftError::NotFound("database header"))?;
        Ok(Db {
            file,
            header,
            header_pos: Some(header_pos),
            sync,
            read_only: false,
        })
    }

    pub fn open_or_create(path: impl AsRef<Path>, sync: SyncPolicy) -> Result<Db> {
        let file = BlockFile::open_or_create(&path)?;
        if file.is_empty() {
            drop(file);
            return Self::create(path, sync);
        }
        drop(file);
        Self::open(path, sync)
    }

    /// A read-only view of a database file whose by-id tree is rooted at an
    /// arbitrary node offset, bypassing the header entirely. This is how
    /// salvage opens trees discovered by the signature scanner.
    pub fn open_with_by_id_root(path: impl AsRef<Path>, root: NodePointer) -> Result<Db> {
        let file = BlockFile::open_read(path)?;
        let mut header = DbHeader::new();
        header.by_id_root = Some(root);
        Ok(Db {
            file,
            header,
            header_pos: None,
            sync: SyncPolicy::Never,
            read_only: true,
        })
    }

    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    pub fn header_pos(&self) -> Option<u64> {
        self.header_pos
    }

    pub fn update_seq(&self) -> u64 {
        self.header.update_seq
    }

    pub fn file(&self) -> &BlockFile {
        &self.file
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DriftError::InvalidArgument(
                "database opened read-only".into(),
            ));
        }
        Ok(())
    }

    /// Appends an updated header at the next block boundary. Under
    /// `SyncPolicy::BeforeHeader` the data is synced first and the header
    /// after, so a crash between the two leaves the previous header intact.
    pub fn commit(&mut self) -> Result<u64> {
        self.ensure_writable()?;
        if self.sync == SyncPolicy::BeforeHeader {
            self.file.sync()?;
        }
        let pos = self.file.write_header(&self.header.to_term())?;
        if self.sync == SyncPolicy::BeforeHeader {
            self.file.sync()?;
        }
        self.header_pos = Some(pos);
        debug!(
            pos,
            update_seq = self.header.update_seq,
            "db.commit.header_written"
        );
        Ok(pos)
    }

    pub fn doc_info(&self, id: &[u8]) -> Result<Option<DocInfo>> {
        let key = Term::Binary(id.to_vec());
        match btree::lookup(&self.file, self.header.by_id_root.as_ref(), &key)? {
            Some(value) => Ok(Some(DocInfo::from_id_value(id.to_vec(), &value)?)),
            None => Ok(None),
        }
    }

    pub fn open_doc(&self, id: &[u8]) -> Result<Option<Document>> {
        let Some(info) = self.doc_info(id)? else {
            return Ok(None);
        };
        let Some(winner) = info.winner() else {
            return Ok(None);
        };
        let body = self.read_doc_body(winner.body_pos)?;
        Ok(Some(Document {
            id: info.id.clone(),
            rev: winner.rev.clone(),
            deleted: winner.deleted,
            body,
        }))
    }

    pub fn read_doc_body(&self, pos: u64) -> Result<Vec<u8>> {
        match self.file.read_term_at(pos)? {
            Term::Binary(body) => Ok(body),
            _ => Err(DriftError::Corruption(
                "document body is not a binary term".into(),
            )),
        }
    }

    pub fn put(&mut self, id: &[u8], body: &[u8]) -> Result<RevId> {
        self.write_doc(id, body, false)
    }

    pub fn delete(&mut self, id: &[u8]) -> Result<RevId> {
        self.write_doc(id, &[], true)
    }

    fn write_doc(&mut self, id: &[u8], body: &[u8], deleted: bool) -> Result<RevId> {
        self.ensure_writable()?;
        let old = self.doc_info(id)?;
        let parent = old.as_ref().and_then(DocInfo::winner).map(|r| r.rev.clone());
        let rev = new_rev(parent.as_ref(), body, deleted);
        let body_pos = self.file.append_term(&Term::Binary(body.to_vec()))?;
        let mut revs = old.as_ref().map(|o| o.revs.clone()).unwrap_or_default();
        revs.push(Revision {
            rev: rev.clone(),
            body_pos,
            deleted,
        });
        revs.sort_by(|a, b| a.rev.cmp(&b.rev));
        self.commit_docs(vec![PendingDoc {
            id: id.to_vec(),
            old,
            revs,
        }])?;
        Ok(rev)
    }

    /// Applies replicated documents: each incoming revision set is unioned
    /// with what is already stored, so re-applying the same documents is a
    /// no-op. Returns how many documents actually changed.
    pub fn apply_replicated(&mut self, incoming: Vec<IncomingDoc>) -> Result<usize> {
        self.ensure_writable()?;
        let mut pending = Vec::new();
        for doc in incoming {
            let old = self.doc_info(&doc.id)?;
            let mut revs = old.as_ref().map(|o| o.revs.clone()).unwrap_or_default();
            let mut changed = false;
            for rev in doc.revs {
                if revs.iter().any(|existing| existing.rev == rev.rev) {
                    continue;
                }
                let body_pos = self.file.append_term(&Term::Binary(rev.body))?;
                revs.push(Revision {
                    rev: rev.rev,
                    body_pos,
                    deleted: rev.deleted,
                });
                changed = true;
            }
            if !changed {
                continue;
            }
            revs.sort_by(|a, b| a.rev.cmp(&b.rev));
            pending.push(PendingDoc {
                id: doc.id,
                old,
                revs,
            });
        }
        let changed = pending.len();
        if changed > 0 {
            self.commit_docs(pending)?;
        }
        Ok(changed)
    }

    fn commit_docs(&mut self, pending: Vec<PendingDoc>) -> Result<()> {
        let mut id_inserts = Vec::with_capacity(pending.len());
        let mut seq_inserts = Vec::with_capacity(pending.len());
        let mut seq_removes = Vec::new();
        for doc in pending {
            let seq = self.header.update_seq + 1;
            self.header.update_seq = seq;
            if let Some(old) = &doc.old {
                seq_removes.push(Term::Int(old.update_seq as i64));
            }
            let info = DocInfo {
                id: doc.id,
                update_seq: seq,
                revs: doc.revs,
            };
            id_inserts.push((Term::Binary(info.id.clone()), info.id_value()));
            seq_inserts.push((Term::Int(seq as i64), info.seq_value()));
        }

        self.header.by_id_root = btree::update(
            &mut self.file,
            self.header.by_id_root.take(),
            &IdStatsReduce,
            id_inserts,
            Vec::new(),
        )?;
        self.header.by_seq_root = btree::update(
            &mut self.file,
            self.header.by_seq_root.take(),
            &SeqCountReduce,
            seq_inserts,
            seq_removes,
        )?;
        Ok(())
    }

    /// Folds every document in by-id order.
    pub fn fold_by_id<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(DocInfo) -> Result<FoldControl>,
    {
        let Some(root) = &self.header.by_id_root else {
            return Ok(());
        };
        btree::fold(&self.file, root, Direction::Forward, &mut |key, value| {
            let id = key
                .as_binary()
                .ok_or_else(|| DriftError::Corruption("by-id key is not a binary".into()))?;
            f(DocInfo::from_id_value(id.to_vec(), value)?)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_commit_reopen_roundtrip() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        {
            let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");
            db.put(b"alpha", b"{\"n\":1}").expect("put");
            db.put(b"beta", b"{\"n\":2}").expect("put");
            db.commit().expect("commit");
        }
        let db = Db::open(&path, SyncPolicy::BeforeHeader).expect("open");
        assert_eq!(db.update_seq(), 2);
        let doc = db.open_doc(b"alpha").expect("read").expect("present");
        assert_eq!(doc.body, b"{\"n\":1}");
        assert_eq!(doc.rev.gen, 1);
        assert!(db.open_doc(b"missing").expect("read").is_none());
    }

    #[test]
    fn updating_a_doc_advances_rev_and_seq() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");
        db.put(b"doc", b"one").expect("put");
        let rev2 = db.put(b"doc", b"two").expect("put");
        assert_eq!(rev2.gen, 2);
        assert_eq!(db.update_seq(), 2);

        let info = db.doc_info(b"doc").expect("info").expect("present");
        assert_eq!(info.update_seq, 2);
        assert_eq!(info.revs.len(), 2);
        assert_eq!(db.open_doc(b"doc").expect("read").expect("doc").body, b"two");
    }

    #[test]
    fn deleting_a_doc_keeps_its_history() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");
        db.put(b"doc", b"body").expect("put");
        db.delete(b"doc").expect("delete");

        let doc = db.open_doc(b"doc").expect("read").expect("tombstone");
        assert!(doc.deleted);
        assert_eq!(doc.rev.gen, 2);

        let info = db.doc_info(b"doc").expect("info").expect("present");
        assert!(info.has_rev(&doc.rev));
    }

    #[test]
    fn by_id_reduction_tracks_live_and_deleted_counts() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");
        for i in 0..10u32 {
            db.put(format!("doc-{i}").as_bytes(), b"x").expect("put");
        }
        db.delete(b"doc-3").expect("delete");

        let root = db.header().by_id_root.as_ref().expect("root");
        assert_eq!(
            root.reduction,
            Term::Tuple(vec![Term::Int(9), Term::Int(1)])
        );
    }

    #[test]
    fn apply_replicated_is_idempotent() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");

        let batch = vec![IncomingDoc {
            id: b"doc".to_vec(),
            revs: vec![IncomingRev {
                rev: RevId {
                    gen: 1,
                    digest: vec![0xAB; 4],
                },
                deleted: false,
                body: b"payload".to_vec(),
            }],
        }];
        assert_eq!(db.apply_replicated(batch.clone()).expect("apply"), 1);
        let seq_after_first = db.update_seq();
        assert_eq!(db.apply_replicated(batch).expect("apply again"), 0);
        assert_eq!(db.update_seq(), seq_after_first);
    }

    #[test]
    fn replicated_revs_union_across_sources() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");

        let rev1 = RevId {
            gen: 1,
            digest: vec![1],
        };
        let rev2 = RevId {
            gen: 2,
            digest: vec![2],
        };
        db.apply_replicated(vec![IncomingDoc {
            id: b"doc".to_vec(),
            revs: vec![IncomingRev {
                rev: rev1.clone(),
                deleted: false,
                body: b"old".to_vec(),
            }],
        }])
        .expect("apply");
        db.apply_replicated(vec![IncomingDoc {
            id: b"doc".to_vec(),
            revs: vec![
                IncomingRev {
                    rev: rev1,
                    deleted: false,
                    body: b"old".to_vec(),
                },
                IncomingRev {
                    rev: rev2,
                    deleted: false,
                    body: b"new".to_vec(),
                },
            ],
        }])
        .expect("apply");

        let doc = db.open_doc(b"doc").expect("read").expect("present");
        assert_eq!(doc.rev.gen, 2);
        assert_eq!(doc.body, b"new");
        let info = db.doc_info(b"doc").expect("info").expect("present");
        assert_eq!(info.revs.len(), 2);
    }

    #[test]
    fn read_only_views_refuse_writes() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        {
            let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");
            db.put(b"doc", b"body").expect("put");
            db.commit().expect("commit");
        }
        let db = Db::open(&path, SyncPolicy::BeforeHeader).expect("open");
        let root = db.header().by_id_root.clone().expect("root");
        let mut view = Db::open_with_by_id_root(&path, root).expect("view");
        assert!(view.put(b"doc", b"nope").is_err());
        assert_eq!(
            view.open_doc(b"doc").expect("read").expect("doc").body,
            b"body"
        );
    }

    #[test]
    fn fold_by_id_yields_docs_in_order() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("db.couch");
        let mut db = Db::create(&path, SyncPolicy::BeforeHeader).expect("create");
        for id in [b"c".as_slice(), b"a", b"b"] {
            db.put(id, b"x").expect("put");
        }
        let mut ids = Vec::new();
        db.fold_by_id(&mut |info| {
            ids.push(info.id.clone());
            Ok(FoldControl::Continue)
        })
        .expect("fold");
        assert_eq!(ids, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
