//! Identity lookups and bootstrap

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::models::*;
use crate::config::OwnerConfig;
use crate::data::{Database, EntityId, store::timestamp_now};
use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Identity service
///
/// Read-only lookups used by the request path and job handlers, plus the
/// writes needed to bootstrap the configured owner.
#[derive(Debug, Clone)]
pub struct IdentityService {
    db: Database,
}

impl IdentityService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<User, AppError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(AppError::UserNotFound)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<User, AppError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(AppError::UserNotFound)
    }

    /// The user's public key PEM
    ///
    /// # Errors
    /// `SigningKeyNotFound` if the user has no public key
    pub async fn get_public_key(&self, user_id: &str) -> Result<SigningKey, AppError> {
        self.get_signing_key(user_id, KeyKind::Public).await
    }

    /// The user's private key PEM
    ///
    /// # Errors
    /// `SigningKeyNotFound` if the user has no private key
    pub async fn get_private_key(&self, user_id: &str) -> Result<SigningKey, AppError> {
        self.get_signing_key(user_id, KeyKind::Private).await
    }

    async fn get_signing_key(&self, user_id: &str, kind: KeyKind) -> Result<SigningKey, AppError> {
        sqlx::query_as::<_, SigningKey>("SELECT * FROM key_pems WHERE user_id = ? AND kind = ?")
            .bind(user_id)
            .bind(kind)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(AppError::SigningKeyNotFound)
    }

    /// Resolve a bearer token of the form `$id.$value` to its user
    ///
    /// The value comparison takes the same time whether or not it matches.
    ///
    /// # Errors
    /// `InvalidApiKey` for malformed tokens, unknown IDs and wrong values
    pub async fn validate_api_key(&self, token: &str) -> Result<User, AppError> {
        let (key_id, value) = token.split_once('.').ok_or(AppError::InvalidApiKey)?;

        let api_key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
            .bind(key_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(AppError::InvalidApiKey)?;

        if !constant_time_eq(api_key.value.as_bytes(), value.as_bytes()) {
            return Err(AppError::InvalidApiKey);
        }

        self.get_user_by_id(&api_key.user_id).await
    }

    /// Insert a new user
    ///
    /// # Errors
    /// `Conflict` if the username is taken
    pub async fn create_user(&self, new_user: &NewUser) -> Result<User, AppError> {
        let now = timestamp_now();

        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, username, summary, name, image_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(EntityId::new().0)
        .bind(&new_user.email)
        .bind(&new_user.username)
        .bind(&new_user.summary)
        .bind(&new_user.name)
        .bind(&new_user.image_url)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                AppError::Conflict(format!("username {} is taken", new_user.username))
            }
            _ => AppError::Database(e),
        })
    }

    /// Replace the user's key pair
    pub async fn store_key_pair(
        &self,
        user_id: &str,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        for (kind, pem) in [(KeyKind::Private, private_pem), (KeyKind::Public, public_pem)] {
            let now = timestamp_now();
            sqlx::query(
                r#"
                INSERT INTO key_pems (id, user_id, kind, pem, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (user_id, kind) DO UPDATE SET
                    pem = excluded.pem,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(EntityId::new().0)
            .bind(user_id)
            .bind(kind)
            .bind(pem)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Store an API key with a caller-chosen ID, replacing any previous value
    pub async fn upsert_api_key(
        &self,
        user_id: &str,
        key_id: &str,
        value: &str,
    ) -> Result<(), AppError> {
        let now = timestamp_now();
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, user_id, value, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                user_id = excluded.user_id,
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key_id)
        .bind(user_id)
        .bind(value)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Ensure the configured owner exists with current configuration
    ///
    /// Creates the user and an RSA key pair on first start, refreshes the
    /// profile fields when the configuration changed, and installs the
    /// configured API key.
    pub async fn ensure_owner(&self, owner: &OwnerConfig) -> Result<User, AppError> {
        let user = match self.get_user_by_username(&owner.username).await {
            Ok(user) => self.refresh_profile(user, owner).await?,
            Err(AppError::UserNotFound) => {
                tracing::info!(username = %owner.username, "Creating owner identity...");
                self.create_user(&NewUser {
                    username: owner.username.clone(),
                    email: owner.email.clone(),
                    name: owner.name.clone(),
                    summary: owner.summary.clone(),
                    image_url: owner.image_url.clone(),
                })
                .await?
            }
            Err(error) => return Err(error),
        };

        match self.get_private_key(&user.id).await {
            Ok(_) => {}
            Err(AppError::SigningKeyNotFound) => {
                let (private_pem, public_pem) = generate_key_pair(owner.key_bits).await?;
                self.store_key_pair(&user.id, &private_pem, &public_pem).await?;
                tracing::info!(username = %user.username, bits = owner.key_bits, "Generated signing key pair");
            }
            Err(error) => return Err(error),
        }

        if let Some((key_id, value)) = owner.api_key.as_deref().and_then(|key| key.split_once('.')) {
            self.upsert_api_key(&user.id, key_id, value).await?;
        }

        tracing::info!(username = %user.username, "Owner identity ready");
        Ok(user)
    }

    async fn refresh_profile(&self, user: User, owner: &OwnerConfig) -> Result<User, AppError> {
        if user.email == owner.email
            && user.name == owner.name
            && user.summary == owner.summary
            && user.image_url == owner.image_url
        {
            return Ok(user);
        }

        let updated = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET email = ?, name = ?, summary = ?, image_url = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(&owner.email)
        .bind(&owner.name)
        .bind(&owner.summary)
        .bind(&owner.image_url)
        .bind(timestamp_now())
        .bind(&user.id)
        .fetch_one(self.db.pool())
        .await?;

        tracing::info!(username = %updated.username, "Owner profile updated");
        Ok(updated)
    }
}

/// Generate an RSA key pair as (PKCS#8 private PEM, SPKI public PEM)
pub async fn generate_key_pair(bits: usize) -> Result<(String, String), AppError> {
    tokio::task::spawn_blocking(move || -> Result<(String, String), anyhow::Error> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
        Ok((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(AppError::Internal)
}

/// Compare two byte strings without early exit
///
/// Both inputs are MACed under a fresh random key and the tags compared
/// with `verify_slice`, which is constant time.
fn constant_time_eq(expected: &[u8], actual: &[u8]) -> bool {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);

    let (Ok(mut expected_mac), Ok(mut actual_mac)) = (
        HmacSha256::new_from_slice(&key),
        HmacSha256::new_from_slice(&key),
    ) else {
        return false;
    };
    expected_mac.update(expected);
    actual_mac.update(actual);

    let tag = expected_mac.finalize().into_bytes();
    actual_mac.verify_slice(&tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use tempfile::TempDir;

    async fn create_service() -> (IdentityService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"), 2)
            .await
            .unwrap();
        (IdentityService::new(db), temp_dir)
    }

    #[test]
    fn constant_time_eq_matches_only_equal_inputs() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    #[tokio::test]
    async fn ensure_owner_creates_user_keys_and_api_key() {
        let (identity, _temp_dir) = create_service().await;
        let config = valid_config();

        let user = identity.ensure_owner(&config.owner).await.unwrap();
        assert_eq!(user.username, "alice");

        let private = identity.get_private_key(&user.id).await.unwrap();
        assert!(private.pem.contains("BEGIN PRIVATE KEY"));
        let public = identity.get_public_key(&user.id).await.unwrap();
        assert!(public.pem.contains("BEGIN PUBLIC KEY"));

        let resolved = identity.validate_api_key("owner.secret-value").await.unwrap();
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn ensure_owner_is_idempotent_and_refreshes_profile() {
        let (identity, _temp_dir) = create_service().await;
        let mut config = valid_config();

        let first = identity.ensure_owner(&config.owner).await.unwrap();
        let key = identity.get_private_key(&first.id).await.unwrap();

        config.owner.name = "Alice Renamed".to_string();
        let second = identity.ensure_owner(&config.owner).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Alice Renamed");
        assert_eq!(identity.get_private_key(&first.id).await.unwrap().pem, key.pem);
    }

    #[tokio::test]
    async fn validate_api_key_rejects_bad_tokens() {
        let (identity, _temp_dir) = create_service().await;
        identity.ensure_owner(&valid_config().owner).await.unwrap();

        for token in ["owner.wrong", "missing.secret-value", "no-separator", ""] {
            let error = identity.validate_api_key(token).await.unwrap_err();
            assert!(matches!(error, AppError::InvalidApiKey), "token {token:?}");
        }
    }

    #[tokio::test]
    async fn unknown_lookups_are_typed() {
        let (identity, _temp_dir) = create_service().await;

        assert!(matches!(
            identity.get_user_by_username("nobody").await,
            Err(AppError::UserNotFound)
        ));
        assert!(matches!(
            identity.get_user_by_id("01ARZ3NDEKTSV4RRFFQ69G5FAV").await,
            Err(AppError::UserNotFound)
        ));

        let user = identity
            .create_user(&NewUser {
                username: "keyless".to_string(),
                email: "keyless@localhost".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(matches!(
            identity.get_private_key(&user.id).await,
            Err(AppError::SigningKeyNotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_username_is_conflict() {
        let (identity, _temp_dir) = create_service().await;
        let new_user = NewUser {
            username: "dup".to_string(),
            email: "dup@localhost".to_string(),
            ..Default::default()
        };
        identity.create_user(&new_user).await.unwrap();
        assert!(matches!(
            identity.create_user(&new_user).await,
            Err(AppError::Conflict(_))
        ));
    }
}
