//! Document row mapping.

use sea_orm::entity::prelude::*;

/// Storage shape of a catalog document. Side snapshots, tags and the
/// in-flight move origin are JSON columns; everything queried by an index
/// is a plain column.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "documents")]
pub struct Model {
	/// Canonical id (platform-folded path).
	#[sea_orm(primary_key, auto_increment = false)]
	pub id: String,
	pub path: String,
	pub doc_type: String,
	pub rev: i64,
	pub side_local: i64,
	pub side_remote: i64,
	pub local_state: Option<String>,
	pub remote_state: Option<String>,
	pub md5sum: Option<String>,
	pub ino: Option<i64>,
	pub remote_id: Option<String>,
	pub size: Option<i64>,
	pub executable: bool,
	pub class: Option<String>,
	pub mime: Option<String>,
	pub tags: String,
	pub updated_at: DateTimeUtc,
	pub errors: i32,
	pub move_from: Option<String>,
	pub deleted: bool,
	pub restored: bool,
	pub seq: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
