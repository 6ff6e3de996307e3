//! Durable metadata catalog over SQLite.
//!
//! One writer, many readers. Every accepted write stamps a store-wide
//! sequence number; the executor follows that sequence to drive mirroring,
//! so a write must be committed before anything downstream can observe it.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use sea_orm::sea_query::Expr;
use sea_orm::{
	ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, ConnectOptions, ConnectionTrait,
	Database as SeaDatabase, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
	Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::domain::{DocType, Document, LocalInfo, MoveOrigin, RemoteInfo, Sides};

pub mod entities;
pub mod migration;

use entities::{checkpoint, document};

/// Checkpoint key for the remote changes-feed cursor.
pub const CHECKPOINT_REMOTE_SEQ: &str = "remote_seq";
/// Checkpoint key for the local initial-scan marker.
pub const CHECKPOINT_LOCAL_SCAN: &str = "local_scan";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Db(#[from] DbErr),
	/// The document changed under the caller; reload and retry.
	#[error("stale write for document {id}")]
	Conflict { id: String },
	/// A stored column failed to decode; the catalog cannot be trusted.
	#[error("metadata store corrupt: {0}")]
	Corrupt(String),
}

/// The metadata store.
pub struct Store {
	conn: DatabaseConnection,
	/// Serializes writers; readers go straight to the pool.
	write_lock: Mutex<()>,
	/// Store-wide commit sequence, monotonic across restarts.
	seq: AtomicI64,
	/// Broadcasts the latest committed sequence to feed followers.
	seq_tx: watch::Sender<i64>,
}

impl Store {
	/// Opens (or creates) the store at `path` and runs migrations.
	pub async fn open(path: &Path) -> Result<Self, StoreError> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| StoreError::Corrupt(format!("cannot create {parent:?}: {e}")))?;
		}
		let url = format!("sqlite://{}?mode=rwc", path.display());
		let store = Self::connect(&url).await?;
		info!(path = %path.display(), "metadata store open");
		Ok(store)
	}

	/// In-memory store for tests.
	pub async fn in_memory() -> Result<Self, StoreError> {
		Self::connect("sqlite::memory:").await
	}

	async fn connect(url: &str) -> Result<Self, StoreError> {
		let mut opt = ConnectOptions::new(url.to_string());
		// A single connection keeps SQLite's writer semantics simple and is
		// plenty for a metadata catalog.
		opt.max_connections(1).sqlx_logging(false);
		let conn = SeaDatabase::connect(opt).await?;

		for pragma in [
			"PRAGMA journal_mode=WAL",
			"PRAGMA busy_timeout=5000",
			"PRAGMA synchronous=NORMAL",
		] {
			conn.execute(Statement::from_string(conn.get_database_backend(), pragma.to_string()))
				.await?;
		}

		migration::Migrator::up(&conn, None).await?;

		let last_seq = document::Entity::find()
			.order_by_desc(document::Column::Seq)
			.one(&conn)
			.await?
			.map(|m| m.seq)
			.unwrap_or(0);
		let (seq_tx, _) = watch::channel(last_seq);

		Ok(Self {
			conn,
			write_lock: Mutex::new(()),
			seq: AtomicI64::new(last_seq),
			seq_tx,
		})
	}

	/// Receiver that observes the latest committed sequence.
	pub fn subscribe(&self) -> watch::Receiver<i64> {
		self.seq_tx.subscribe()
	}

	pub fn last_seq(&self) -> i64 {
		self.seq.load(Ordering::SeqCst)
	}

	pub async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
		document::Entity::find_by_id(id)
			.one(&self.conn)
			.await?
			.map(to_document)
			.transpose()
	}

	pub async fn get_by_path(&self, path: &str) -> Result<Option<Document>, StoreError> {
		document::Entity::find()
			.filter(document::Column::Path.eq(path))
			.one(&self.conn)
			.await?
			.map(to_document)
			.transpose()
	}

	pub async fn get_by_ino(&self, ino: u64) -> Result<Option<Document>, StoreError> {
		document::Entity::find()
			.filter(document::Column::Ino.eq(ino as i64))
			.one(&self.conn)
			.await?
			.map(to_document)
			.transpose()
	}

	pub async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Document>, StoreError> {
		document::Entity::find()
			.filter(document::Column::RemoteId.eq(remote_id))
			.one(&self.conn)
			.await?
			.map(to_document)
			.transpose()
	}

	/// Persists `doc`, assigning its commit sequence.
	///
	/// The caller must hold the latest state: a `seq` that no longer
	/// matches the stored row is rejected as stale. New documents pass
	/// `seq == 0`.
	pub async fn put(&self, doc: &mut Document) -> Result<(), StoreError> {
		debug_assert!(doc.sides_consistent(), "side markers past rev for {}", doc.id);
		let _guard = self.write_lock.lock().await;

		let existing = document::Entity::find_by_id(&doc.id).one(&self.conn).await?;
		match &existing {
			Some(row) if row.seq != doc.seq => {
				return Err(StoreError::Conflict { id: doc.id.clone() });
			}
			None if doc.seq != 0 => {
				return Err(StoreError::Conflict { id: doc.id.clone() });
			}
			_ => {}
		}

		let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
		doc.seq = seq;
		let model = to_model(doc)?;
		if existing.is_some() {
			model.update(&self.conn).await?;
		} else {
			model.insert(&self.conn).await?;
		}
		debug!(id = %doc.id, rev = doc.rev, seq, "document committed");
		let _ = self.seq_tx.send(seq);
		Ok(())
	}

	/// Rewrites a document under a new canonical id in one transaction.
	///
	/// Moves change the primary key, so the old row must vanish in the
	/// same commit that introduces the new one.
	pub async fn put_moved(&self, old_id: &str, doc: &mut Document) -> Result<(), StoreError> {
		self.put_moved_batch(vec![(old_id.to_string(), doc)]).await
	}

	/// Transactionally rewrites a whole subtree, for folder moves.
	///
	/// Either every document lands under its new id or none does.
	pub async fn put_moved_batch(
		&self,
		updates: Vec<(String, &mut Document)>,
	) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;

		// Validate staleness up-front against the live table.
		for (old_id, doc) in &updates {
			let existing = document::Entity::find_by_id(old_id).one(&self.conn).await?;
			match existing {
				Some(row) if row.seq == doc.seq => {}
				_ => return Err(StoreError::Conflict { id: old_id.clone() }),
			}
		}

		let txn = self.conn.begin().await?;
		let mut last = 0;
		let mut updates = updates;
		for (old_id, doc) in &mut updates {
			let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
			doc.seq = seq;
			last = seq;
			document::Entity::delete_by_id(old_id.as_str()).exec(&txn).await?;
			to_model(doc)?.insert(&txn).await?;
			debug!(from = %old_id, to = %doc.id, seq, "document moved");
		}
		txn.commit().await?;
		let _ = self.seq_tx.send(last);
		Ok(())
	}

	/// Physically removes a document. Only valid once both sides have
	/// acknowledged its deletion.
	pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;
		document::Entity::delete_by_id(id).exec(&self.conn).await?;
		debug!(id, "document removed");
		Ok(())
	}

	/// Documents with a side trailing their revision, in commit order.
	pub async fn dirty(&self) -> Result<Vec<Document>, StoreError> {
		document::Entity::find()
			.filter(
				Condition::any()
					.add(Expr::col(document::Column::SideLocal).lt(Expr::col(document::Column::Rev)))
					.add(
						Expr::col(document::Column::SideRemote)
							.lt(Expr::col(document::Column::Rev)),
					),
			)
			.order_by_asc(document::Column::Seq)
			.all(&self.conn)
			.await?
			.into_iter()
			.map(to_document)
			.collect()
	}

	/// All commits after `seq`, oldest first.
	pub async fn changes_since(&self, seq: i64) -> Result<Vec<Document>, StoreError> {
		document::Entity::find()
			.filter(document::Column::Seq.gt(seq))
			.order_by_asc(document::Column::Seq)
			.all(&self.conn)
			.await?
			.into_iter()
			.map(to_document)
			.collect()
	}

	/// Every descendant of the folder at `prefix` (the folder itself
	/// excluded), shallowest first.
	pub async fn tree_under(&self, prefix: &str) -> Result<Vec<Document>, StoreError> {
		// Everything under "a/b" sorts between "a/b/" and "a/b0"
		// ('0' is the code point after '/'), which avoids LIKE escaping.
		let lower = format!("{prefix}/");
		let upper = format!("{prefix}0");
		let mut docs: Vec<Document> = document::Entity::find()
			.filter(document::Column::Path.gte(lower))
			.filter(document::Column::Path.lt(upper))
			.order_by_asc(document::Column::Path)
			.all(&self.conn)
			.await?
			.into_iter()
			.map(to_document)
			.collect::<Result<_, _>>()?;
		docs.sort_by_key(|d| crate::shared::path::depth(&d.path));
		Ok(docs)
	}

	/// Every live (non-tombstoned) document.
	pub async fn all_live(&self) -> Result<Vec<Document>, StoreError> {
		document::Entity::find()
			.filter(document::Column::Deleted.eq(false))
			.all(&self.conn)
			.await?
			.into_iter()
			.map(to_document)
			.collect()
	}

	pub async fn get_checkpoint(&self, key: &str) -> Result<Option<String>, StoreError> {
		Ok(checkpoint::Entity::find_by_id(key)
			.one(&self.conn)
			.await?
			.map(|m| m.value))
	}

	pub async fn set_checkpoint(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;
		let existing = checkpoint::Entity::find_by_id(key).one(&self.conn).await?;
		let model = checkpoint::ActiveModel {
			key: Set(key.to_string()),
			value: Set(value.to_string()),
			updated_at: Set(chrono::Utc::now()),
		};
		if existing.is_some() {
			model.update(&self.conn).await?;
		} else {
			model.insert(&self.conn).await?;
		}
		Ok(())
	}
}

fn to_document(model: document::Model) -> Result<Document, StoreError> {
	let corrupt = |what: &str, err: serde_json::Error| {
		StoreError::Corrupt(format!("{what} column of {}: {err}", model.id))
	};
	let local: Option<LocalInfo> = model
		.local_state
		.as_deref()
		.map(serde_json::from_str)
		.transpose()
		.map_err(|e| corrupt("local_state", e))?;
	let remote: Option<RemoteInfo> = model
		.remote_state
		.as_deref()
		.map(serde_json::from_str)
		.transpose()
		.map_err(|e| corrupt("remote_state", e))?;
	let move_from: Option<MoveOrigin> = model
		.move_from
		.as_deref()
		.map(serde_json::from_str)
		.transpose()
		.map_err(|e| corrupt("move_from", e))?;
	let tags: Vec<String> =
		serde_json::from_str(&model.tags).map_err(|e| corrupt("tags", e))?;
	let doc_type = match model.doc_type.as_str() {
		"file" => DocType::File,
		"folder" => DocType::Folder,
		other => {
			return Err(StoreError::Corrupt(format!(
				"unknown doc_type {other:?} for {}",
				model.id
			)))
		}
	};

	Ok(Document {
		id: model.id,
		path: model.path,
		doc_type,
		rev: model.rev,
		sides: Sides { local: model.side_local, remote: model.side_remote },
		local,
		remote,
		md5sum: model.md5sum,
		ino: model.ino.map(|i| i as u64),
		size: model.size.map(|s| s as u64),
		executable: model.executable,
		class: model.class,
		mime: model.mime,
		tags,
		updated_at: model.updated_at,
		errors: model.errors,
		move_from,
		deleted: model.deleted,
		restored: model.restored,
		seq: model.seq,
	})
}

fn to_model(doc: &Document) -> Result<document::ActiveModel, StoreError> {
	let encode = |what: &str, value: serde_json::Result<String>| {
		value.map_err(|e| StoreError::Corrupt(format!("{what} of {}: {e}", doc.id)))
	};
	Ok(document::ActiveModel {
		id: Set(doc.id.clone()),
		path: Set(doc.path.clone()),
		doc_type: Set(doc.doc_type.to_string()),
		rev: Set(doc.rev),
		side_local: Set(doc.sides.local),
		side_remote: Set(doc.sides.remote),
		local_state: Set(doc
			.local
			.as_ref()
			.map(|l| encode("local_state", serde_json::to_string(l)))
			.transpose()?),
		remote_state: Set(doc
			.remote
			.as_ref()
			.map(|r| encode("remote_state", serde_json::to_string(r)))
			.transpose()?),
		md5sum: Set(doc.md5sum.clone()),
		ino: Set(doc.ino.map(|i| i as i64)),
		remote_id: Set(doc.remote.as_ref().map(|r| r.id.clone())),
		size: Set(doc.size.map(|s| s as i64)),
		executable: Set(doc.executable),
		class: Set(doc.class.clone()),
		mime: Set(doc.mime.clone()),
		tags: Set(encode("tags", serde_json::to_string(&doc.tags))?),
		updated_at: Set(doc.updated_at),
		errors: Set(doc.errors),
		move_from: Set(doc
			.move_from
			.as_ref()
			.map(|m| encode("move_from", serde_json::to_string(m)))
			.transpose()?),
		deleted: Set(doc.deleted),
		restored: Set(doc.restored),
		seq: Set(doc.seq),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::SideName;

	fn file_doc(id: &str, path: &str) -> Document {
		let mut doc = Document::new(id.to_string(), path.to_string(), DocType::File, SideName::Local);
		doc.md5sum = Some("XUFAKrxLKna5cZ2REBfFkg==".into());
		doc.size = Some(5);
		doc.ino = Some(42);
		doc
	}

	#[tokio::test]
	async fn put_then_get_round_trips() {
		let store = Store::in_memory().await.unwrap();
		let mut doc = file_doc("a/b.txt", "a/b.txt");
		store.put(&mut doc).await.unwrap();
		assert_eq!(doc.seq, 1);

		let loaded = store.get("a/b.txt").await.unwrap().unwrap();
		assert_eq!(loaded, doc);
		assert_eq!(store.get_by_path("a/b.txt").await.unwrap().unwrap().id, "a/b.txt");
		assert_eq!(store.get_by_ino(42).await.unwrap().unwrap().id, "a/b.txt");
	}

	#[tokio::test]
	async fn put_rejects_stale_writes() {
		let store = Store::in_memory().await.unwrap();
		let mut doc = file_doc("x", "x");
		store.put(&mut doc).await.unwrap();

		let mut fresh = store.get("x").await.unwrap().unwrap();
		let mut stale = fresh.clone();

		fresh.bump(SideName::Local);
		store.put(&mut fresh).await.unwrap();

		stale.bump(SideName::Remote);
		assert!(matches!(
			store.put(&mut stale).await,
			Err(StoreError::Conflict { .. })
		));
	}

	#[tokio::test]
	async fn dirty_lists_documents_with_trailing_sides() {
		let store = Store::in_memory().await.unwrap();
		let mut dirty = file_doc("d", "d");
		store.put(&mut dirty).await.unwrap();

		let mut synced = file_doc("s", "s");
		synced.mark_in_sync();
		store.put(&mut synced).await.unwrap();

		let listed = store.dirty().await.unwrap();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].id, "d");
	}

	#[tokio::test]
	async fn changes_feed_is_commit_ordered() {
		let store = Store::in_memory().await.unwrap();
		let mut a = file_doc("a", "a");
		let mut b = file_doc("b", "b");
		store.put(&mut a).await.unwrap();
		store.put(&mut b).await.unwrap();
		a = store.get("a").await.unwrap().unwrap();
		a.bump(SideName::Local);
		store.put(&mut a).await.unwrap();

		let changes = store.changes_since(1).await.unwrap();
		let ids: Vec<_> = changes.iter().map(|d| d.id.as_str()).collect();
		assert_eq!(ids, vec!["b", "a"]);
	}

	#[tokio::test]
	async fn tree_under_matches_descendants_only() {
		let store = Store::in_memory().await.unwrap();
		for (id, path) in [
			("dir", "dir"),
			("dir/a", "dir/a"),
			("dir/sub/b", "dir/sub/b"),
			("dirt", "dirt"),
			("other", "other"),
		] {
			let mut doc = file_doc(id, path);
			store.put(&mut doc).await.unwrap();
		}
		let tree = store.tree_under("dir").await.unwrap();
		let paths: Vec<_> = tree.iter().map(|d| d.path.as_str()).collect();
		assert_eq!(paths, vec!["dir/a", "dir/sub/b"]);
	}

	#[tokio::test]
	async fn checkpoints_round_trip() {
		let store = Store::in_memory().await.unwrap();
		assert!(store.get_checkpoint(CHECKPOINT_REMOTE_SEQ).await.unwrap().is_none());
		store.set_checkpoint(CHECKPOINT_REMOTE_SEQ, "42").await.unwrap();
		store.set_checkpoint(CHECKPOINT_REMOTE_SEQ, "43").await.unwrap();
		assert_eq!(
			store.get_checkpoint(CHECKPOINT_REMOTE_SEQ).await.unwrap().as_deref(),
			Some("43")
		);
	}

	#[tokio::test]
	async fn subscribe_observes_commits() {
		let store = Store::in_memory().await.unwrap();
		let mut rx = store.subscribe();
		assert_eq!(*rx.borrow(), 0);
		let mut doc = file_doc("w", "w");
		store.put(&mut doc).await.unwrap();
		rx.changed().await.unwrap();
		assert_eq!(*rx.borrow_and_update(), 1);
	}
}
