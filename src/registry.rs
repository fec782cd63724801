//! Supplier registry client: lookup by tax id with a TTL cache.
//!
//! The transport is a port so the pipeline can be tested without a live
//! registry. Lookups distinguish three results: a record, an explicit
//! not-found (cached, so unknown ids do not hammer the registry), and a
//! transport failure (never cached, surfaced to the caller so the gate
//! can quarantine).

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RegistryConfig;
use crate::models::SupplierRecord;

#[derive(Debug)]
pub enum LookupError {
    /// Invalid client configuration, detected before any network activity.
    Config(String),
    /// Malformed tax id; nothing was sent to the registry.
    InvalidTaxId(String),
    /// Network failure or registry-side error.
    Transport(String),
    /// Registry answered but the payload did not decode.
    Decode(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Config(msg) => write!(f, "registry configuration error: {}", msg),
            LookupError::InvalidTaxId(id) => write!(f, "invalid tax id: {}", id),
            LookupError::Transport(msg) => write!(f, "registry transport error: {}", msg),
            LookupError::Decode(msg) => write!(f, "registry response decode error: {}", msg),
        }
    }
}

impl std::error::Error for LookupError {}

/// Normalize a raw tax id: strip spaces, left-pad short digit runs to
/// 8 characters. Anything non-numeric is rejected.
pub fn normalize_tax_id(raw: &str) -> Result<String, LookupError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.len() > 8 || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(LookupError::InvalidTaxId(raw.to_string()));
    }
    Ok(format!("{:0>8}", cleaned))
}

/// Fetches one supplier record. `Ok(None)` is an authoritative not-found.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn fetch(&self, tax_id: &str) -> Result<Option<SupplierRecord>, LookupError>;
}

#[derive(Debug, Deserialize)]
struct RegistrySubject {
    #[serde(rename = "obchodniJmeno")]
    name: Option<String>,
    #[serde(rename = "sidlo")]
    seat: Option<RegistrySeat>,
    #[serde(rename = "pravniForma")]
    legal_form: Option<String>,
    #[serde(rename = "dic")]
    vat_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrySeat {
    #[serde(rename = "textovaAdresa")]
    address: Option<String>,
}

/// HTTPS transport against the economic-subjects registry.
///
/// Each request carries its own timeout; there is no global client
/// default. One request per lookup: 404 is a clean not-found, any other
/// failure (network error or non-success status) is a single
/// [`LookupError::Transport`] and the caller decides what to do with it.
/// The registry is never retried; the caching front-end already keeps
/// traffic down, and a flaky lookup must surface as a gate decision, not
/// stall the pipeline.
pub struct HttpRegistryTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRegistryTransport {
    pub fn new(cfg: &RegistryConfig) -> Result<Self, LookupError> {
        if cfg.base_url.trim().is_empty() {
            return Err(LookupError::Config("base_url must not be empty".into()));
        }
        if cfg.timeout_secs == 0 {
            return Err(LookupError::Config("timeout_secs must be > 0".into()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LookupError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        })
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistryTransport {
    async fn fetch(&self, tax_id: &str) -> Result<Option<SupplierRecord>, LookupError> {
        let url = format!("{}/{}", self.base_url, tax_id);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let subject: RegistrySubject = response
                .json()
                .await
                .map_err(|e| LookupError::Decode(e.to_string()))?;
            return Ok(Some(SupplierRecord {
                tax_id: tax_id.to_string(),
                name: subject.name,
                address: subject.seat.and_then(|s| s.address),
                legal_form: subject.legal_form,
                vat_payer: Some(subject.vat_number.is_some_and(|d| !d.trim().is_empty())),
                synced_at: Utc::now(),
            }));
        }
        if status.as_u16() == 404 {
            return Ok(None);
        }
        Err(LookupError::Transport(format!(
            "registry returned {}",
            status
        )))
    }
}

struct CacheEntry {
    record: Option<SupplierRecord>,
    fetched_at: Instant,
}

/// Caching lookup front-end over a [`RegistryTransport`].
pub struct RegistryClient<T: RegistryTransport> {
    transport: T,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl<T: RegistryTransport> RegistryClient<T> {
    pub fn new(transport: T, cfg: &RegistryConfig) -> Result<Self, LookupError> {
        if cfg.cache_max_entries == 0 {
            return Err(LookupError::Config("cache_max_entries must be > 0".into()));
        }
        Ok(Self {
            transport,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(cfg.cache_ttl_secs),
            max_entries: cfg.cache_max_entries,
        })
    }

    /// Look up a supplier, serving fresh cache hits without a network
    /// round trip. Not-found answers are cached too; transport failures
    /// are never cached.
    pub async fn lookup(&self, raw_tax_id: &str) -> Result<Option<SupplierRecord>, LookupError> {
        let tax_id = normalize_tax_id(raw_tax_id)?;

        if self.ttl > Duration::ZERO {
            let cache = self.cache.lock().expect("registry cache poisoned");
            if let Some(entry) = cache.get(&tax_id) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.record.clone());
                }
            }
        }

        let record = self.transport.fetch(&tax_id).await?;
        self.store(tax_id, record.clone());
        Ok(record)
    }

    /// Bypass the cache and re-fetch, updating the cached entry. Used by
    /// the maintenance path that refreshes suppliers whose stored record
    /// has gone stale.
    pub async fn refresh(&self, raw_tax_id: &str) -> Result<Option<SupplierRecord>, LookupError> {
        let tax_id = normalize_tax_id(raw_tax_id)?;
        let record = self.transport.fetch(&tax_id).await?;
        self.store(tax_id, record.clone());
        Ok(record)
    }

    fn store(&self, tax_id: String, record: Option<SupplierRecord>) {
        if self.ttl == Duration::ZERO {
            return;
        }
        let mut cache = self.cache.lock().expect("registry cache poisoned");
        // Size check is independent of the TTL check on read: a cache full
        // of fresh entries still evicts its oldest one.
        if cache.len() >= self.max_entries && !cache.contains_key(&tax_id) {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            tax_id,
            CacheEntry {
                record,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg(ttl: u64, max: usize) -> RegistryConfig {
        RegistryConfig {
            base_url: "https://registry.example/subjects".to_string(),
            timeout_secs: 5,
            cache_ttl_secs: ttl,
            cache_max_entries: max,
        }
    }

    struct CountingTransport {
        calls: AtomicUsize,
        answer: fn(&str) -> Result<Option<SupplierRecord>, LookupError>,
    }

    #[async_trait]
    impl RegistryTransport for CountingTransport {
        async fn fetch(&self, tax_id: &str) -> Result<Option<SupplierRecord>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.answer)(tax_id)
        }
    }

    fn found(tax_id: &str) -> Result<Option<SupplierRecord>, LookupError> {
        Ok(Some(SupplierRecord {
            tax_id: tax_id.to_string(),
            name: Some("Test s.r.o.".to_string()),
            address: Some("Praha 1".to_string()),
            legal_form: Some("112".to_string()),
            vat_payer: Some(true),
            synced_at: Utc::now(),
        }))
    }

    #[test]
    fn tax_id_normalization() {
        assert_eq!(normalize_tax_id("25063677").unwrap(), "25063677");
        assert_eq!(normalize_tax_id(" 63677 ").unwrap(), "00063677");
        assert!(normalize_tax_id("CZ25063677").is_err());
        assert!(normalize_tax_id("").is_err());
        assert!(normalize_tax_id("123456789").is_err());
    }

    #[tokio::test]
    async fn fresh_cache_hit_skips_transport() {
        let client = RegistryClient::new(
            CountingTransport {
                calls: AtomicUsize::new(0),
                answer: found,
            },
            &cfg(3600, 16),
        )
        .unwrap();

        client.lookup("25063677").await.unwrap();
        client.lookup("25063677").await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_cached() {
        let client = RegistryClient::new(
            CountingTransport {
                calls: AtomicUsize::new(0),
                answer: |_| Ok(None),
            },
            &cfg(3600, 16),
        )
        .unwrap();

        assert!(client.lookup("25063677").await.unwrap().is_none());
        assert!(client.lookup("25063677").await.unwrap().is_none());
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_not_cached() {
        let client = RegistryClient::new(
            CountingTransport {
                calls: AtomicUsize::new(0),
                answer: |_| Err(LookupError::Transport("boom".to_string())),
            },
            &cfg(3600, 16),
        )
        .unwrap();

        assert!(client.lookup("25063677").await.is_err());
        assert!(client.lookup("25063677").await.is_err());
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_cache_evicts_oldest() {
        let client = RegistryClient::new(
            CountingTransport {
                calls: AtomicUsize::new(0),
                answer: found,
            },
            &cfg(3600, 2),
        )
        .unwrap();

        client.lookup("00000001").await.unwrap();
        client.lookup("00000002").await.unwrap();
        client.lookup("00000003").await.unwrap();
        // The first entry was evicted, so this is a second transport call.
        client.lookup("00000001").await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 4);
        // The second entry is still cached.
        client.lookup("00000003").await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let client = RegistryClient::new(
            CountingTransport {
                calls: AtomicUsize::new(0),
                answer: found,
            },
            &cfg(3600, 16),
        )
        .unwrap();

        client.lookup("25063677").await.unwrap();
        // Age the cached entry past the TTL.
        {
            let mut cache = client.cache.lock().unwrap();
            let entry = cache.get_mut("25063677").unwrap();
            entry.fetched_at = Instant::now() - Duration::from_secs(7200);
        }
        client.lookup("25063677").await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let client = RegistryClient::new(
            CountingTransport {
                calls: AtomicUsize::new(0),
                answer: found,
            },
            &cfg(0, 16),
        )
        .unwrap();

        client.lookup("25063677").await.unwrap();
        client.lookup("25063677").await.unwrap();
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_error_is_a_single_request() {
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                server_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\n\
                          content-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });

        let mut c = cfg(0, 1);
        c.base_url = format!("http://{}/subjects", addr);
        let transport = HttpRegistryTransport::new(&c).unwrap();

        let err = transport.fetch("25063677").await.unwrap_err();
        assert!(matches!(err, LookupError::Transport(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transport_rejects_bad_config() {
        let mut c = cfg(0, 1);
        c.base_url = " ".to_string();
        assert!(matches!(
            HttpRegistryTransport::new(&c),
            Err(LookupError::Config(_))
        ));
    }
}
