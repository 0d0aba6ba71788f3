use std::collections::HashSet;

use bson::{doc, oid::ObjectId};
use mongodb::{options::IndexOptions, ClientSession, IndexModel};
use serde::{Deserialize, Serialize};

use super::mongo::{Collection, MongoStore};

#[derive(Serialize, Deserialize)]
pub struct MigrateModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub version: i64,
}

impl Collection<MigrateModel> {
    pub async fn insert_version_with_session(
        &self,
        version: i64,
        session: &mut ClientSession,
    ) -> Result<(), mongodb::error::Error> {
        self.insert_one_with_session(
            MigrateModel {
                id: ObjectId::new(),
                version,
            },
            None,
            session,
        )
        .await
        .map(|_| ())
    }
}

fn unique(keys: bson::Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn plain(keys: bson::Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

impl MongoStore {
    async fn v1_migrate(&self, session: &mut ClientSession) -> Result<(), mongodb::error::Error> {
        self.migrations
            .create_index_with_session(unique(doc! { "version": 1 }), None, session)
            .await?;

        self.users
            .create_index_with_session(unique(doc! { "email": 1 }), None, session)
            .await?;

        self.refresh_tokens
            .create_index_with_session(plain(doc! { "user_id": 1 }), None, session)
            .await?;

        self.parcels
            .create_index_with_session(unique(doc! { "tracking_id": 1 }), None, session)
            .await?;
        self.parcels
            .create_index_with_session(
                plain(doc! { "sender_id": 1, "created_at": 1 }),
                None,
                session,
            )
            .await?;

        // Sequence numbers are gapless per parcel, two writers racing for the
        // same slot collide here.
        self.records
            .create_index_with_session(
                unique(doc! { "parcel_id": 1, "sequence": 1 }),
                None,
                session,
            )
            .await?;
        // Handler history matches on any of the three handler fields.
        for field in ["to_handler_id", "from_handler_id", "actor_id"] {
            self.records
                .create_index_with_session(
                    plain(doc! { field: 1, "timestamp": 1 }),
                    None,
                    session,
                )
                .await?;
        }

        self.alerts
            .create_index_with_session(
                plain(doc! { "parcel_id": 1, "resolved": 1 }),
                None,
                session,
            )
            .await?;

        Ok(())
    }

    async fn get_all_migration(&self) -> Result<Vec<MigrateModel>, mongodb::error::Error> {
        let mut cursor = self.migrations.find(None, None).await?;

        let mut vec = vec![];

        while cursor.advance().await? {
            vec.push(cursor.deserialize_current()?);
        }

        Ok(vec)
    }

    pub async fn run_migration(&self) -> Result<(), mongodb::error::Error> {
        let migration: HashSet<i64> = self
            .get_all_migration()
            .await?
            .into_iter()
            .map(|it| it.version)
            .collect();

        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        macro_rules! migrate {
            ($version:expr, $fun:ident) => {
                if !migration.contains(&$version) {
                    tracing::debug!("running migration version {}", $version);
                    self.$fun(&mut session).await?;
                    self.migrations
                        .insert_version_with_session($version, &mut session)
                        .await?;
                }
            };
        }

        migrate!(1, v1_migrate);

        session.commit_transaction().await
    }
}
