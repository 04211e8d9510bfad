use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;

use async_trait::async_trait;

use crate::credentials::{CredentialError, KeyId, KeyMaterial, StoredDigest};
use crate::models::token::{ConfigPatch, Header, NewToken, Token, TokenId};
use crate::store::{Rotated, StoreError, TokenStore};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Writes touching `key_id` surface its unique index as `Conflict`.
fn write_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn create(&self, token: NewToken) -> Result<Token, StoreError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"INSERT INTO tokens (key_id, digest, owner, label, host, path, headers)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(token.key.key_id.to_string())
        .bind(token.key.digest.to_bytes())
        .bind(&token.user)
        .bind(&token.config.label)
        .bind(&token.config.host)
        .bind(&token.config.path)
        .bind(Json(&token.config.headers))
        .fetch_one(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(row.try_into()?)
    }

    async fn get(&self, user: &str, id: TokenId) -> Result<Token, StoreError> {
        let row = sqlx::query_as::<_, TokenRow>(
            "SELECT * FROM tokens WHERE id = $1 AND owner = $2",
        )
        .bind(id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.try_into()?)
    }

    async fn list(&self, user: &str) -> Result<Vec<Token>, StoreError> {
        let rows = sqlx::query_as::<_, TokenRow>(
            "SELECT * FROM tokens WHERE owner = $1 ORDER BY id DESC",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Token::try_from(row).map_err(StoreError::from))
            .collect()
    }

    async fn update(
        &self,
        user: &str,
        id: TokenId,
        patch: ConfigPatch,
    ) -> Result<Token, StoreError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"UPDATE tokens SET
                   label = COALESCE($3, label),
                   host = COALESCE($4, host),
                   path = COALESCE($5, path),
                   headers = COALESCE($6, headers),
                   updated_at = NOW()
               WHERE id = $1 AND owner = $2
               RETURNING *"#,
        )
        .bind(id)
        .bind(user)
        .bind(patch.label.into_option())
        .bind(patch.host.into_option())
        .bind(patch.path.into_option())
        .bind(patch.headers.into_option().map(Json))
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.try_into()?)
    }

    async fn rotate(
        &self,
        user: &str,
        id: TokenId,
        key: KeyMaterial,
    ) -> Result<Rotated, StoreError> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query_scalar::<_, String>(
            "SELECT key_id FROM tokens WHERE id = $1 AND owner = $2 FOR UPDATE",
        )
        .bind(id)
        .bind(user)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let row = sqlx::query_as::<_, TokenRow>(
            r#"UPDATE tokens SET key_id = $3, digest = $4, updated_at = NOW()
               WHERE id = $1 AND owner = $2
               RETURNING *"#,
        )
        .bind(id)
        .bind(user)
        .bind(key.key_id.to_string())
        .bind(key.digest.to_bytes())
        .fetch_one(&mut *tx)
        .await
        .map_err(write_error)?;

        tx.commit().await?;

        Ok(Rotated {
            token: row.try_into()?,
            previous_key_id: previous.parse()?,
        })
    }

    async fn delete(&self, user: &str, id: TokenId) -> Result<Token, StoreError> {
        let row = sqlx::query_as::<_, TokenRow>(
            "DELETE FROM tokens WHERE id = $1 AND owner = $2 RETURNING *",
        )
        .bind(id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        Ok(row.try_into()?)
    }

    async fn find_by_key_id(&self, key_id: &KeyId) -> Result<Token, StoreError> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE key_id = $1")
            .bind(key_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(row.try_into()?)
    }

    async fn key_revision(&self, key_id: &KeyId) -> Result<DateTime<Utc>, StoreError> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT updated_at FROM tokens WHERE key_id = $1")
            .bind(key_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn record_usage(
        &self,
        id: TokenId,
        hits: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE tokens SET
                   requests = requests + $2,
                   last_access_at = GREATEST(last_access_at, $3)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(i64::try_from(hits).unwrap_or(i64::MAX))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// -- Row structs --

#[derive(Debug, sqlx::FromRow)]
pub struct TokenRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_access_at: Option<DateTime<Utc>>,
    pub key_id: String,
    pub digest: Vec<u8>,
    pub owner: String,
    pub label: String,
    pub host: String,
    pub path: String,
    pub headers: Json<Vec<Header>>,
    pub requests: i64,
}

impl TryFrom<TokenRow> for Token {
    type Error = CredentialError;

    fn try_from(row: TokenRow) -> Result<Self, Self::Error> {
        Ok(Token {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_access_at: row.last_access_at,
            key_id: row.key_id.parse()?,
            user: row.owner,
            label: row.label,
            host: row.host,
            path: row.path,
            headers: row.headers.0,
            requests: row.requests,
            digest: StoredDigest::from_bytes(&row.digest)?,
        })
    }
}
