//! Storage port over SQLite: files, documents, line items, suppliers.
//!
//! `commit_document` runs as a single transaction so a failure can never
//! leave a document without its line items or its FTS row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::hash::Fingerprint;
use crate::models::{CandidateDocument, SupplierRecord};

/// Lifecycle of a file row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    New,
    Committed,
    Duplicate,
    Quarantined,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Committed => "committed",
            FileStatus::Duplicate => "duplicate",
            FileStatus::Quarantined => "quarantined",
        }
    }
}

/// One row from the `files` table.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub fingerprint: String,
    pub status: String,
    pub current_path: String,
}

#[async_trait]
pub trait StoragePort: Send + Sync {
    /// File previously seen with the same content, if any.
    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<FileRecord>>;

    /// Document id for an existing `(tax_id, doc_number, issue_date)` key.
    async fn find_by_business_key(
        &self,
        tax_id: &str,
        doc_number: &str,
        issue_date: &str,
    ) -> Result<Option<i64>>;

    /// Register a newly discovered file. Returns the file row id.
    async fn record_file(
        &self,
        fingerprint: &Fingerprint,
        original_name: &str,
        current_path: &Path,
        pages: usize,
        discovered_at: DateTime<Utc>,
    ) -> Result<i64>;

    /// Update a file's terminal status, error note, and current location.
    async fn mark_file(
        &self,
        file_id: i64,
        status: FileStatus,
        last_error: Option<&str>,
        current_path: Option<&Path>,
    ) -> Result<()>;

    /// Commit a gated document: supplier upsert, document row, line items
    /// and the search index, all in one transaction.
    async fn commit_document(
        &self,
        file_id: i64,
        doc: &CandidateDocument,
        supplier: &SupplierRecord,
    ) -> Result<i64>;

    /// Tax ids of suppliers not synced since `cutoff`.
    async fn stale_suppliers(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Overwrite a supplier row with a freshly fetched record.
    async fn update_supplier(&self, record: &SupplierRecord) -> Result<()>;
}

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn upsert_supplier<'c>(
    tx: &mut sqlx::Transaction<'c, sqlx::Sqlite>,
    supplier: &SupplierRecord,
) -> Result<i64> {
    sqlx::query(
        r#"
        INSERT INTO suppliers (tax_id, name, address, legal_form, vat_payer, synced_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(tax_id) DO UPDATE SET
            name = excluded.name,
            address = excluded.address,
            legal_form = excluded.legal_form,
            vat_payer = excluded.vat_payer,
            synced_at = excluded.synced_at
        "#,
    )
    .bind(&supplier.tax_id)
    .bind(&supplier.name)
    .bind(&supplier.address)
    .bind(&supplier.legal_form)
    .bind(supplier.vat_payer)
    .bind(supplier.synced_at.timestamp())
    .execute(&mut **tx)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT id FROM suppliers WHERE tax_id = ?")
        .bind(&supplier.tax_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(id)
}

#[async_trait]
impl StoragePort for SqliteStorage {
    async fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT id, fingerprint, status, current_path FROM files WHERE fingerprint = ?",
        )
        .bind(&fingerprint.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FileRecord {
            id: r.get("id"),
            fingerprint: r.get("fingerprint"),
            status: r.get("status"),
            current_path: r.get("current_path"),
        }))
    }

    async fn find_by_business_key(
        &self,
        tax_id: &str,
        doc_number: &str,
        issue_date: &str,
    ) -> Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM documents \
             WHERE supplier_tax_id = ? AND doc_number = ? AND issue_date = ?",
        )
        .bind(tax_id)
        .bind(doc_number)
        .bind(issue_date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_file(
        &self,
        fingerprint: &Fingerprint,
        original_name: &str,
        current_path: &Path,
        pages: usize,
        discovered_at: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO files (fingerprint, original_name, current_path, pages, status, discovered_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&fingerprint.0)
        .bind(original_name)
        .bind(current_path.to_string_lossy().as_ref())
        .bind(pages as i64)
        .bind(FileStatus::New.as_str())
        .bind(discovered_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to record file")?;
        Ok(result.last_insert_rowid())
    }

    async fn mark_file(
        &self,
        file_id: i64,
        status: FileStatus,
        last_error: Option<&str>,
        current_path: Option<&Path>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE files SET status = ?, last_error = ?, \
             current_path = COALESCE(?, current_path), processed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(current_path.map(|p| p.to_string_lossy().into_owned()))
        .bind(Utc::now().timestamp())
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_document(
        &self,
        file_id: i64,
        doc: &CandidateDocument,
        supplier: &SupplierRecord,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let supplier_id = upsert_supplier(&mut tx, supplier).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents
                (file_id, supplier_id, supplier_tax_id, doc_number, bank_account,
                 issue_date, total_with_vat, currency, confidence, text_quality,
                 review_reasons, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_id)
        .bind(supplier_id)
        .bind(&doc.supplier_tax_id)
        .bind(&doc.doc_number)
        .bind(&doc.bank_account)
        .bind(doc.issue_date.map(|d| d.to_string()))
        .bind(doc.total_with_vat)
        .bind(&doc.currency)
        .bind(doc.confidence)
        .bind(doc.text_quality)
        .bind(serde_json::to_string(&doc.review_reasons)?)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        let document_id = result.last_insert_rowid();

        for (line_no, item) in doc.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO line_items \
                 (document_id, line_no, description, quantity, unit_price, line_total, vat_rate) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(line_no as i64 + 1)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.line_total)
            .bind(item.vat_rate)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO documents_fts (document_id, supplier_tax_id, doc_number, text) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(&doc.supplier_tax_id)
        .bind(&doc.doc_number)
        .bind(doc.full_text())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(document_id)
    }

    async fn stale_suppliers(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT tax_id FROM suppliers WHERE synced_at IS NULL OR synced_at < ?",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("tax_id")).collect())
    }

    async fn update_supplier(&self, record: &SupplierRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_supplier(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fingerprint_bytes;
    use crate::migrate::run_migrations;
    use crate::models::{DocType, LineItem};
    use chrono::NaiveDate;

    async fn storage() -> SqliteStorage {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStorage::new(pool)
    }

    fn supplier() -> SupplierRecord {
        SupplierRecord {
            tax_id: "25063677".to_string(),
            name: Some("Rohlik.cz s.r.o.".to_string()),
            address: Some("Sokolovská 100, Praha".to_string()),
            legal_form: Some("s.r.o.".to_string()),
            vat_payer: Some(true),
            synced_at: Utc::now(),
        }
    }

    fn document() -> CandidateDocument {
        CandidateDocument {
            pages: vec![],
            doc_type: DocType::Invoice,
            supplier_tax_id: Some("25063677".to_string()),
            doc_number: Some("2024-0042".to_string()),
            bank_account: None,
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 12),
            total_with_vat: Some(242.0),
            currency: "CZK".to_string(),
            items: vec![LineItem {
                description: "Rohlík premium".to_string(),
                quantity: 2.0,
                unit_price: Some(100.0),
                line_total: Some(242.0),
                vat_rate: Some(21.0),
            }],
            review_reasons: vec![],
            confidence: 0.9,
            text_quality: 0.8,
        }
    }

    #[tokio::test]
    async fn fingerprint_roundtrip() {
        let s = storage().await;
        let fp = fingerprint_bytes(b"invoice");
        assert!(s.find_by_fingerprint(&fp).await.unwrap().is_none());

        let id = s
            .record_file(&fp, "a.pdf", Path::new("/inbox/a.pdf"), 1, Utc::now())
            .await
            .unwrap();
        let found = s.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, "new");
    }

    #[tokio::test]
    async fn commit_writes_document_items_and_fts() {
        let s = storage().await;
        let fp = fingerprint_bytes(b"invoice");
        let file_id = s
            .record_file(&fp, "a.pdf", Path::new("/inbox/a.pdf"), 1, Utc::now())
            .await
            .unwrap();

        let doc_id = s
            .commit_document(file_id, &document(), &supplier())
            .await
            .unwrap();

        let items: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM line_items WHERE document_id = ?")
                .bind(doc_id)
                .fetch_one(&s.pool)
                .await
                .unwrap();
        assert_eq!(items, 1);

        let hit: Option<i64> = sqlx::query_scalar(
            "SELECT document_id FROM documents_fts WHERE documents_fts MATCH '\"2024-0042\"'",
        )
        .fetch_optional(&s.pool)
        .await
        .unwrap();
        assert_eq!(hit, Some(doc_id));

        let dup = s
            .find_by_business_key("25063677", "2024-0042", "2024-03-12")
            .await
            .unwrap();
        assert_eq!(dup, Some(doc_id));
    }

    #[tokio::test]
    async fn unpriced_item_is_stored_as_null_not_zero() {
        let s = storage().await;
        let fp = fingerprint_bytes(b"invoice");
        let file_id = s
            .record_file(&fp, "a.pdf", Path::new("/inbox/a.pdf"), 1, Utc::now())
            .await
            .unwrap();

        let mut doc = document();
        doc.items.push(LineItem {
            description: "Záloha".to_string(),
            quantity: 1.0,
            unit_price: None,
            line_total: None,
            vat_rate: None,
        });
        let doc_id = s.commit_document(file_id, &doc, &supplier()).await.unwrap();

        // A missing price must stay missing; 0.00 is a real amount.
        let nulls: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM line_items \
             WHERE document_id = ? AND line_total IS NULL AND vat_rate IS NULL",
        )
        .bind(doc_id)
        .fetch_one(&s.pool)
        .await
        .unwrap();
        assert_eq!(nulls, 1);
    }

    #[tokio::test]
    async fn mark_file_updates_status_and_path() {
        let s = storage().await;
        let fp = fingerprint_bytes(b"x");
        let id = s
            .record_file(&fp, "a.pdf", Path::new("/inbox/a.pdf"), 1, Utc::now())
            .await
            .unwrap();
        s.mark_file(
            id,
            FileStatus::Quarantined,
            Some("supplier not found in registry"),
            Some(Path::new("/out/quarantine/a.pdf")),
        )
        .await
        .unwrap();

        let rec = s.find_by_fingerprint(&fp).await.unwrap().unwrap();
        assert_eq!(rec.status, "quarantined");
        assert_eq!(rec.current_path, "/out/quarantine/a.pdf");
    }

    #[tokio::test]
    async fn stale_suppliers_respects_cutoff() {
        let s = storage().await;
        let mut old = supplier();
        old.synced_at = Utc::now() - chrono::Duration::days(400);
        s.update_supplier(&old).await.unwrap();

        let mut fresh = supplier();
        fresh.tax_id = "00000001".to_string();
        s.update_supplier(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let stale = s.stale_suppliers(cutoff).await.unwrap();
        assert_eq!(stale, vec!["25063677".to_string()]);
    }
}
