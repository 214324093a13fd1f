//! `SQLite` rule store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use super::model::{CorrectionEvent, LearnedRule, RuleKey, RuleScope};
use super::store::RuleStore;
use crate::Result;
use crate::fingerprint::Features;
use crate::mail::ItemId;
use crate::taxonomy::CategoryName;

/// Rule store persisted in a `SQLite` database.
pub struct SqliteRuleStore {
    pool: SqlitePool,
}

impl SqliteRuleStore {
    /// Create a new store with the given database path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS learned_rules (
                scope TEXT NOT NULL,
                pattern TEXT NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_hit TEXT,
                PRIMARY KEY (scope, pattern, category)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS corrections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL,
                previous TEXT,
                corrected TEXT NOT NULL,
                sender TEXT NOT NULL,
                domain TEXT NOT NULL,
                subject_tokens TEXT NOT NULL,
                observed_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // Lookups by sender when auditing corrections
        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_corrections_sender
            ON corrections(sender)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn get(&self, key: &RuleKey) -> Result<Option<LearnedRule>> {
        let row = sqlx::query(
            r"
            SELECT scope, pattern, category, confidence, hit_count,
                   created_at, updated_at, last_hit
            FROM learned_rules
            WHERE scope = ? AND pattern = ? AND category = ?
            ",
        )
        .bind(key.scope.as_str())
        .bind(&key.pattern)
        .bind(key.category.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().and_then(row_to_rule))
    }

    async fn put(&self, rule: &LearnedRule) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO learned_rules
                (scope, pattern, category, confidence, hit_count, created_at, updated_at, last_hit)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope, pattern, category) DO UPDATE SET
                confidence = excluded.confidence,
                hit_count = excluded.hit_count,
                updated_at = excluded.updated_at,
                last_hit = excluded.last_hit
            ",
        )
        .bind(rule.scope.as_str())
        .bind(&rule.pattern)
        .bind(rule.category.as_str())
        .bind(rule.confidence)
        .bind(i64::try_from(rule.hit_count).unwrap_or(i64::MAX))
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .bind(rule.last_hit.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &RuleKey) -> Result<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM learned_rules
            WHERE scope = ? AND pattern = ? AND category = ?
            ",
        )
        .bind(key.scope.as_str())
        .bind(&key.pattern)
        .bind(key.category.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<LearnedRule>> {
        let rows = sqlx::query(
            r"
            SELECT scope, pattern, category, confidence, hit_count,
                   created_at, updated_at, last_hit
            FROM learned_rules
            ORDER BY scope, pattern, category
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(row_to_rule).collect())
    }

    async fn append_correction(&self, event: &CorrectionEvent) -> Result<()> {
        let tokens = serde_json::to_string(&event.features.subject_tokens)?;

        sqlx::query(
            r"
            INSERT INTO corrections
                (item_id, previous, corrected, sender, domain, subject_tokens, observed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(event.item_id.as_str())
        .bind(event.previous.as_ref().map(CategoryName::as_str))
        .bind(event.corrected.as_str())
        .bind(&event.features.sender)
        .bind(&event.features.domain)
        .bind(tokens)
        .bind(event.observed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn corrections(&self) -> Result<Vec<CorrectionEvent>> {
        let rows = sqlx::query(
            r"
            SELECT item_id, previous, corrected, sender, domain, subject_tokens, observed_at
            FROM corrections
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(row_to_correction).collect())
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Convert a database row to a `LearnedRule`, skipping malformed rows.
fn row_to_rule(row: &SqliteRow) -> Option<LearnedRule> {
    let scope = RuleScope::parse(row.get("scope"))?;
    let last_hit: Option<String> = row.get("last_hit");

    Some(LearnedRule {
        scope,
        pattern: row.get("pattern"),
        category: CategoryName::new(row.get("category")),
        confidence: row.get("confidence"),
        hit_count: u64::try_from(row.get::<i64, _>("hit_count")).unwrap_or(0),
        created_at: parse_time(row.get("created_at"))?,
        updated_at: parse_time(row.get("updated_at"))?,
        last_hit: last_hit.as_deref().and_then(parse_time),
    })
}

/// Convert a database row to a `CorrectionEvent`, skipping malformed rows.
fn row_to_correction(row: &SqliteRow) -> Option<CorrectionEvent> {
    let previous: Option<String> = row.get("previous");
    let tokens: String = row.get("subject_tokens");

    Some(CorrectionEvent {
        item_id: ItemId::new(row.get::<String, _>("item_id")),
        previous: previous.as_deref().map(CategoryName::new),
        corrected: CategoryName::new(row.get("corrected")),
        features: Features {
            sender: row.get("sender"),
            domain: row.get("domain"),
            subject_tokens: serde_json::from_str(&tokens).ok()?,
        },
        observed_at: parse_time(row.get("observed_at"))?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(scope: RuleScope, pattern: &str, category: &str) -> RuleKey {
        RuleKey::new(scope, pattern, CategoryName::new(category))
    }

    #[tokio::test]
    async fn test_put_and_get_rule() {
        let store = SqliteRuleStore::in_memory().await.unwrap();
        let mut rule = LearnedRule::new(
            key(RuleScope::SenderExact, "boss@corp.test", "PRO"),
            0.75,
            Utc::now(),
        );
        rule.last_hit = Some(Utc::now());

        store.put(&rule).await.unwrap();
        let loaded = store.get(&rule.key()).await.unwrap().unwrap();

        assert_eq!(loaded.key(), rule.key());
        assert!((loaded.confidence - 0.75).abs() < f64::EPSILON);
        assert!(loaded.last_hit.is_some());
    }

    #[tokio::test]
    async fn test_put_replaces_confidence() {
        let store = SqliteRuleStore::in_memory().await.unwrap();
        let mut rule = LearnedRule::new(key(RuleScope::Domain, "corp.test", "PRO"), 0.75, Utc::now());
        store.put(&rule).await.unwrap();

        rule.confidence = 0.85;
        rule.hit_count = 4;
        store.put(&rule).await.unwrap();

        let rules = store.list().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!((rules[0].confidence - 0.85).abs() < f64::EPSILON);
        assert_eq!(rules[0].hit_count, 4);
    }

    #[tokio::test]
    async fn test_delete_rule() {
        let store = SqliteRuleStore::in_memory().await.unwrap();
        let rule = LearnedRule::new(
            key(RuleScope::SubjectKeyword, "invoice", "FINANCE"),
            0.75,
            Utc::now(),
        );
        store.put(&rule).await.unwrap();

        assert!(store.delete(&rule.key()).await.unwrap());
        assert!(!store.delete(&rule.key()).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_correction_log_is_ordered() {
        let store = SqliteRuleStore::in_memory().await.unwrap();
        for (id, corrected) in [("1", "PRO"), ("2", "FINANCE")] {
            let event = CorrectionEvent {
                item_id: ItemId::new(id),
                previous: Some(CategoryName::new("NEWSLETTER")),
                corrected: CategoryName::new(corrected),
                features: Features {
                    sender: "boss@corp.test".into(),
                    domain: "corp.test".into(),
                    subject_tokens: vec!["quarterly".into(), "report".into()],
                },
                observed_at: Utc::now(),
            };
            store.append_correction(&event).await.unwrap();
        }

        let log = store.corrections().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].item_id.as_str(), "1");
        assert_eq!(log[1].corrected.as_str(), "FINANCE");
        assert_eq!(log[0].features.subject_tokens, vec!["quarterly", "report"]);
    }

    #[tokio::test]
    async fn test_rules_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.db");
        let path = path.to_str().unwrap();
        let rule = LearnedRule::new(key(RuleScope::Domain, "corp.test", "PRO"), 0.8, Utc::now());

        {
            let store = SqliteRuleStore::new(path).await.unwrap();
            store.put(&rule).await.unwrap();
        }

        let store = SqliteRuleStore::new(path).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
