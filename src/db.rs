use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::models::{
    ClientKeyword, ClientLocation, Location, RankingFilter, RankingRecord, RankingRow, SearchResult,
    TrackingPair, TrendPoint,
};

/// Storage the pipeline reads tracking pairs from and appends rankings to.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Tracking pairs whose active flag is set.
    async fn active_tracking_pairs(&self) -> Result<Vec<TrackingPair>, PersistenceError>;

    /// Append one check's rows for the pair. Returns the number of rows written.
    async fn save_tracking_results(
        &self,
        keyword_id: Uuid,
        location_id: Uuid,
        client_id: Uuid,
        results: &SearchResult,
    ) -> Result<usize, PersistenceError>;

    async fn client_keywords(&self, client_id: Uuid) -> Result<Vec<ClientKeyword>, PersistenceError>;

    async fn client_locations(&self, client_id: Uuid) -> Result<Vec<ClientLocation>, PersistenceError>;

    async fn tracking_results(
        &self,
        client_id: Uuid,
        filter: &RankingFilter,
    ) -> Result<Vec<RankingRow>, PersistenceError>;

    async fn ranking_trend(
        &self,
        keyword_id: Uuid,
        location_id: Uuid,
        filter: &RankingFilter,
    ) -> Result<Vec<TrendPoint>, PersistenceError>;
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS keywords (
            id UUID PRIMARY KEY,
            client_id UUID NOT NULL,
            keyword VARCHAR NOT NULL,
            created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS locations (
            id UUID PRIMARY KEY,
            client_id UUID NOT NULL,
            name VARCHAR NOT NULL,
            latitude DOUBLE PRECISION,
            longitude DOUBLE PRECISION,
            created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS keyword_location_tracking (
            id UUID PRIMARY KEY,
            keyword_id UUID NOT NULL REFERENCES keywords(id),
            location_id UUID NOT NULL REFERENCES locations(id),
            client_id UUID NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (keyword_id, location_id)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS rankings (
            id UUID PRIMARY KEY,
            tracking_pair_id UUID NOT NULL REFERENCES keyword_location_tracking(id),
            rank INTEGER NOT NULL,
            url_ranking TEXT,
            map_pack_present BOOLEAN NOT NULL DEFAULT FALSE,
            map_pack_position INTEGER,
            date_checked DATE NOT NULL,
            created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
        );
        "#,
        "CREATE INDEX IF NOT EXISTS rankings_pair_date_idx ON rankings (tracking_pair_id, date_checked);",
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// PostgreSQL implementation over a shared pool.
#[derive(Clone)]
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceAdapter for PgPersistence {
    async fn active_tracking_pairs(&self) -> Result<Vec<TrackingPair>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id AS tracking_id, k.id AS keyword_id, k.keyword, l.id AS location_id,
                   l.name, l.latitude, l.longitude, t.client_id
            FROM keyword_location_tracking t
            JOIN keywords k ON k.id = t.keyword_id
            JOIN locations l ON l.id = t.location_id
            WHERE t.is_active = TRUE
            ORDER BY t.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, sqlx::Error> {
                Ok(TrackingPair {
                    tracking_id: row.try_get("tracking_id")?,
                    keyword_id: row.try_get("keyword_id")?,
                    keyword: row.try_get("keyword")?,
                    location_id: row.try_get("location_id")?,
                    location: Location {
                        name: row.try_get("name")?,
                        lat: row.try_get("latitude")?,
                        lng: row.try_get("longitude")?,
                    },
                    client_id: row.try_get("client_id")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::from)
    }

    async fn save_tracking_results(
        &self,
        keyword_id: Uuid,
        location_id: Uuid,
        client_id: Uuid,
        results: &SearchResult,
    ) -> Result<usize, PersistenceError> {
        let tracking_pair_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM keyword_location_tracking WHERE keyword_id = $1 AND location_id = $2",
        )
        .bind(keyword_id)
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;

        let tracking_pair_id = tracking_pair_id.ok_or(PersistenceError::TrackingPairNotFound {
            keyword_id,
            location_id,
        })?;

        let records =
            RankingRecord::from_search_result(tracking_pair_id, results, Utc::now().date_naive());

        let mut tx = self.pool.begin().await?;
        for record in &records {
            sqlx::query(
                r#"
                INSERT INTO rankings (id, tracking_pair_id, rank, url_ranking, map_pack_present, map_pack_position, date_checked)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(record.tracking_pair_id)
            .bind(record.rank)
            .bind(&record.url_ranking)
            .bind(record.map_pack_present)
            .bind(record.map_pack_position)
            .bind(record.date_checked)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(
            "Saved {} ranking rows for client {} (pair {})",
            records.len(),
            client_id,
            tracking_pair_id
        );
        Ok(records.len())
    }

    async fn client_keywords(&self, client_id: Uuid) -> Result<Vec<ClientKeyword>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT id, keyword, client_id FROM keywords WHERE client_id = $1 ORDER BY created_at",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, sqlx::Error> {
                Ok(ClientKeyword {
                    id: row.try_get("id")?,
                    keyword: row.try_get("keyword")?,
                    client_id: row.try_get("client_id")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::from)
    }

    async fn client_locations(&self, client_id: Uuid) -> Result<Vec<ClientLocation>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT id, name, latitude, longitude, client_id FROM locations WHERE client_id = $1 ORDER BY created_at",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, sqlx::Error> {
                Ok(ClientLocation {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                    client_id: row.try_get("client_id")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::from)
    }

    async fn tracking_results(
        &self,
        client_id: Uuid,
        filter: &RankingFilter,
    ) -> Result<Vec<RankingRow>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.tracking_pair_id, k.id AS keyword_id, k.keyword, l.id AS location_id,
                   l.name AS location, r.rank, r.url_ranking, r.map_pack_present,
                   r.map_pack_position, r.date_checked
            FROM rankings r
            JOIN keyword_location_tracking t ON t.id = r.tracking_pair_id
            JOIN keywords k ON k.id = t.keyword_id
            JOIN locations l ON l.id = t.location_id
            WHERE t.client_id = $1
              AND ($2::date IS NULL OR r.date_checked >= $2)
              AND ($3::date IS NULL OR r.date_checked <= $3)
              AND ($4::uuid IS NULL OR k.id = $4)
              AND ($5::uuid IS NULL OR l.id = $5)
            ORDER BY r.date_checked DESC, k.keyword, l.name, r.map_pack_position NULLS FIRST, r.rank
            "#,
        )
        .bind(client_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.keyword_id)
        .bind(filter.location_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, sqlx::Error> {
                Ok(RankingRow {
                    id: row.try_get("id")?,
                    tracking_pair_id: row.try_get("tracking_pair_id")?,
                    keyword_id: row.try_get("keyword_id")?,
                    keyword: row.try_get("keyword")?,
                    location_id: row.try_get("location_id")?,
                    location: row.try_get("location")?,
                    rank: row.try_get("rank")?,
                    url_ranking: row.try_get("url_ranking")?,
                    map_pack_present: row.try_get("map_pack_present")?,
                    map_pack_position: row.try_get("map_pack_position")?,
                    date_checked: row.try_get("date_checked")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::from)
    }

    async fn ranking_trend(
        &self,
        keyword_id: Uuid,
        location_id: Uuid,
        filter: &RankingFilter,
    ) -> Result<Vec<TrendPoint>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT r.date_checked,
                   MIN(r.rank) FILTER (WHERE r.map_pack_position IS NULL) AS best_rank,
                   (ARRAY_AGG(r.url_ranking ORDER BY r.rank) FILTER (WHERE r.map_pack_position IS NULL))[1] AS url_ranking,
                   MIN(r.map_pack_position) AS map_pack_position
            FROM rankings r
            JOIN keyword_location_tracking t ON t.id = r.tracking_pair_id
            WHERE t.keyword_id = $1 AND t.location_id = $2
              AND ($3::date IS NULL OR r.date_checked >= $3)
              AND ($4::date IS NULL OR r.date_checked <= $4)
            GROUP BY r.date_checked
            ORDER BY r.date_checked
            "#,
        )
        .bind(keyword_id)
        .bind(location_id)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<_, sqlx::Error> {
                Ok(TrendPoint {
                    date_checked: row.try_get("date_checked")?,
                    best_rank: row.try_get("best_rank")?,
                    url_ranking: row.try_get("url_ranking")?,
                    map_pack_position: row.try_get("map_pack_position")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(PersistenceError::from)
    }
}
