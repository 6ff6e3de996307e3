//! Create the documents table and its secondary indexes.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Documents::Table)
					.if_not_exists()
					.col(ColumnDef::new(Documents::Id).text().not_null().primary_key())
					.col(ColumnDef::new(Documents::Path).text().not_null())
					.col(ColumnDef::new(Documents::DocType).text().not_null())
					.col(ColumnDef::new(Documents::Rev).big_integer().not_null())
					.col(ColumnDef::new(Documents::SideLocal).big_integer().not_null())
					.col(ColumnDef::new(Documents::SideRemote).big_integer().not_null())
					.col(ColumnDef::new(Documents::LocalState).text())
					.col(ColumnDef::new(Documents::RemoteState).text())
					.col(ColumnDef::new(Documents::Md5sum).text())
					.col(ColumnDef::new(Documents::Ino).big_integer())
					.col(ColumnDef::new(Documents::RemoteId).text())
					.col(ColumnDef::new(Documents::Size).big_integer())
					.col(
						ColumnDef::new(Documents::Executable)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(Documents::Class).text())
					.col(ColumnDef::new(Documents::Mime).text())
					.col(ColumnDef::new(Documents::Tags).text().not_null().default("[]"))
					.col(ColumnDef::new(Documents::UpdatedAt).timestamp().not_null())
					.col(
						ColumnDef::new(Documents::Errors)
							.integer()
							.not_null()
							.default(0),
					)
					.col(ColumnDef::new(Documents::MoveFrom).text())
					.col(
						ColumnDef::new(Documents::Deleted)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(Documents::Restored)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(Documents::Seq).big_integer().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_documents_path_unique")
					.table(Documents::Table)
					.col(Documents::Path)
					.unique()
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_documents_ino")
					.table(Documents::Table)
					.col(Documents::Ino)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_documents_remote_id")
					.table(Documents::Table)
					.col(Documents::RemoteId)
					.to_owned(),
			)
			.await?;

		// Commit order; the changes feed and dirty scheduling both sort on it.
		manager
			.create_index(
				Index::create()
					.name("idx_documents_seq")
					.table(Documents::Table)
					.col(Documents::Seq)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Checkpoints::Table)
					.if_not_exists()
					.col(ColumnDef::new(Checkpoints::Key).text().not_null().primary_key())
					.col(ColumnDef::new(Checkpoints::Value).text().not_null())
					.col(ColumnDef::new(Checkpoints::UpdatedAt).timestamp().not_null())
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(Checkpoints::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Documents::Table).to_owned())
			.await
	}
}

#[derive(DeriveIden)]
enum Documents {
	Table,
	Id,
	Path,
	DocType,
	Rev,
	SideLocal,
	SideRemote,
	LocalState,
	RemoteState,
	Md5sum,
	Ino,
	RemoteId,
	Size,
	Executable,
	Class,
	Mime,
	Tags,
	UpdatedAt,
	Errors,
	MoveFrom,
	Deleted,
	Restored,
	Seq,
}

#[derive(DeriveIden)]
enum Checkpoints {
	Table,
	Key,
	Value,
	UpdatedAt,
}
