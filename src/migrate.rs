//! Schema migrations. Safe to run on every startup: plain tables use
//! `IF NOT EXISTS`, the FTS5 table is guarded by an existence check, and
//! column additions probe `pragma_table_info` first.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Files: one row per ingested file, keyed by content fingerprint.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            original_name TEXT NOT NULL,
            current_path TEXT NOT NULL,
            pages INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            last_error TEXT,
            discovered_at INTEGER NOT NULL,
            processed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Suppliers enriched from the registry.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suppliers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tax_id TEXT NOT NULL UNIQUE,
            name TEXT,
            address TEXT,
            legal_form TEXT,
            vat_payer INTEGER,
            synced_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            supplier_id INTEGER,
            supplier_tax_id TEXT,
            doc_number TEXT,
            bank_account TEXT,
            issue_date TEXT,
            total_with_vat REAL,
            currency TEXT NOT NULL DEFAULT 'CZK',
            confidence REAL NOT NULL DEFAULT 0,
            text_quality REAL NOT NULL DEFAULT 0,
            review_reasons TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (file_id) REFERENCES files(id),
            FOREIGN KEY (supplier_id) REFERENCES suppliers(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS line_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            line_no INTEGER NOT NULL,
            description TEXT NOT NULL,
            quantity REAL NOT NULL,
            unit_price REAL,
            line_total REAL,
            vat_rate REAL,
            UNIQUE(document_id, line_no),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                document_id UNINDEXED,
                supplier_tax_id,
                doc_number,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_file_id ON documents(file_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_business_key \
         ON documents(supplier_tax_id, doc_number, issue_date)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_line_items_document_id ON line_items(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn schema_dump(pool: &SqlitePool) -> Vec<String> {
        sqlx::query("SELECT name FROM sqlite_master WHERE type IN ('table','index') ORDER BY name")
            .fetch_all(pool)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.get::<String, _>("name"))
            .collect()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let first = schema_dump(&pool).await;
        run_migrations(&pool).await.unwrap();
        let second = schema_dump(&pool).await;
        assert_eq!(first, second);
        assert!(first.iter().any(|n| n == "documents"));
        assert!(first.iter().any(|n| n == "documents_fts"));
    }
}
