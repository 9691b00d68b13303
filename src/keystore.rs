//! Key store (spec §4.6, §6): at most one row per `(sdid, selector)`, three
//! modes, single in-flight DNS fetch per key, `rusqlite`-backed (no teacher
//! analog -- the teacher's `crates/dkim` treats every lookup as a one-shot
//! DNS call; grounded on the pack's `rusqlite` usage elsewhere and the
//! sibling `lruttl` crate's bounded-cache shape for the dedup idea).

use crate::dns::Resolver;
use crate::key::DkimKey;
use crate::DKIMError;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyStoreMode {
    Off,
    #[default]
    Cache,
    #[serde(rename = "compare")]
    CompareAndAlert,
}

#[derive(Debug, Clone)]
pub struct KeyRow {
    pub sdid: String,
    pub selector: String,
    pub key: String,
    pub inserted_at: String,
    pub last_used_at: String,
    pub secure: bool,
}

pub struct KeyStore {
    mode: KeyStoreMode,
    conn: AsyncMutex<Connection>,
    in_flight: StdMutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl KeyStore {
    pub fn open(path: &str, mode: KeyStoreMode) -> Result<Self, DKIMError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Self::migrate(&conn)?;
        Ok(Self {
            mode,
            conn: AsyncMutex::new(conn),
            in_flight: StdMutex::new(HashMap::new()),
        })
    }

    fn migrate(conn: &Connection) -> Result<(), DKIMError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS version (name TEXT PRIMARY KEY, version INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS keys (
                 sdid TEXT NOT NULL,
                 selector TEXT NOT NULL,
                 key TEXT NOT NULL,
                 insertedAt TEXT NOT NULL,
                 lastUsedAt TEXT NOT NULL,
                 secure INTEGER NOT NULL
             );
             INSERT OR IGNORE INTO version (name, version) VALUES ('TableKeys', 1);",
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))
    }

    /// Resolves a key for `(sdid, selector)` per the configured mode,
    /// deduplicating concurrent DNS fetches for the same key.
    pub async fn resolve(
        &self,
        resolver: &dyn Resolver,
        sdid: &str,
        selector: &str,
        now: &str,
    ) -> Result<DkimKey, DKIMError> {
        match self.mode {
            KeyStoreMode::Off => fetch_key(resolver, sdid, selector).await,
            KeyStoreMode::Cache => self.resolve_cached(resolver, sdid, selector, now).await,
            KeyStoreMode::CompareAndAlert => {
                self.resolve_compare_and_alert(resolver, sdid, selector, now)
                    .await
            }
        }
    }

    async fn lock_for(&self, sdid: &str, selector: &str) -> Arc<AsyncMutex<()>> {
        let key = (sdid.to_string(), selector.to_string());
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn resolve_cached(
        &self,
        resolver: &dyn Resolver,
        sdid: &str,
        selector: &str,
        now: &str,
    ) -> Result<DkimKey, DKIMError> {
        let lock = self.lock_for(sdid, selector).await;
        let _guard = lock.lock().await;

        if let Some(row) = self.read_newest(sdid, selector).await? {
            self.touch_last_used(sdid, selector, now).await?;
            return DkimKey::parse(&row.key, row.secure);
        }

        let key = fetch_key(resolver, sdid, selector).await?;
        self.insert_row(sdid, selector, &key, now).await?;
        Ok(key)
    }

    async fn resolve_compare_and_alert(
        &self,
        resolver: &dyn Resolver,
        sdid: &str,
        selector: &str,
        now: &str,
    ) -> Result<DkimKey, DKIMError> {
        let lock = self.lock_for(sdid, selector).await;
        let _guard = lock.lock().await;

        let cached = self.read_newest(sdid, selector).await?;
        let fetched_key = fetch_key(resolver, sdid, selector).await?;
        let fetched_row_key = render_key_tag(&fetched_key);

        match cached {
            Some(row) if row.key != fetched_row_key => Err(DKIMError::KeyMismatch),
            Some(row) => {
                self.touch_last_used(sdid, selector, now).await?;
                let secure = row.secure || fetched_key.secure;
                DkimKey::parse(&row.key, secure)
            }
            None => {
                self.insert_row(sdid, selector, &fetched_key, now).await?;
                Ok(fetched_key)
            }
        }
    }

    async fn read_newest(&self, sdid: &str, selector: &str) -> Result<Option<KeyRow>, DKIMError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT sdid, selector, key, insertedAt, lastUsedAt, secure FROM keys
             WHERE sdid = ?1 AND selector = ?2 ORDER BY insertedAt DESC LIMIT 1",
            params![sdid, selector],
            |row| {
                Ok(KeyRow {
                    sdid: row.get(0)?,
                    selector: row.get(1)?,
                    key: row.get(2)?,
                    inserted_at: row.get(3)?,
                    last_used_at: row.get(4)?,
                    secure: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            err => Err(DKIMError::DbUnavailable(err.to_string())),
        })
    }

    async fn touch_last_used(&self, sdid: &str, selector: &str, now: &str) -> Result<(), DKIMError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE keys SET lastUsedAt = ?1 WHERE sdid = ?2 AND selector = ?3",
            params![now, sdid, selector],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(())
    }

    async fn insert_row(
        &self,
        sdid: &str,
        selector: &str,
        key: &DkimKey,
        now: &str,
    ) -> Result<(), DKIMError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO keys (sdid, selector, key, insertedAt, lastUsedAt, secure) VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
            params![sdid, selector, render_key_tag(key), now, key.secure as i64],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(())
    }

    pub async fn delete_key(&self, sdid: &str, selector: &str) -> Result<(), DKIMError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM keys WHERE sdid = ?1 AND selector = ?2",
            params![sdid, selector],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(())
    }

    pub async fn mark_key_secure(&self, sdid: &str, selector: &str) -> Result<(), DKIMError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE keys SET secure = 1 WHERE sdid = ?1 AND selector = ?2",
            params![sdid, selector],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyRow>, DKIMError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT sdid, selector, key, insertedAt, lastUsedAt, secure FROM keys ORDER BY insertedAt DESC")
            .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(KeyRow {
                    sdid: row.get(0)?,
                    selector: row.get(1)?,
                    key: row.get(2)?,
                    inserted_at: row.get(3)?,
                    last_used_at: row.get(4)?,
                    secure: row.get::<_, i64>(5)? != 0,
                })
            })
            .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| DKIMError::DbUnavailable(err.to_string()))
    }

    pub async fn update_key(&self, sdid: &str, selector: &str, key: &str) -> Result<(), DKIMError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE keys SET key = ?1 WHERE sdid = ?2 AND selector = ?3",
            params![key, sdid, selector],
        )
        .map_err(|err| DKIMError::DbUnavailable(err.to_string()))?;
        Ok(())
    }
}

/// The raw TXT text is what's stored; re-parsed on read. Simpler and more
/// faithful to "what DNS said" than storing the decoded key material.
fn render_key_tag(key: &DkimKey) -> String {
    key.raw.clone()
}

async fn fetch_key(resolver: &dyn Resolver, sdid: &str, selector: &str) -> Result<DkimKey, DKIMError> {
    let name = format!("{}._domainkey.{}", selector, sdid);
    let answer = resolver.txt(&name).await?;

    if answer.bogus {
        return Err(DKIMError::DnssecBogus);
    }
    const RCODE_NO_ERROR: u8 = 0;
    const RCODE_NXDOMAIN: u8 = 3;
    if answer.rcode != RCODE_NO_ERROR && answer.rcode != RCODE_NXDOMAIN {
        return Err(DKIMError::DnsServerError(answer.rcode));
    }

    let data = match answer.data {
        Some(data) if !data.is_empty() => data,
        _ => return Err(DKIMError::NoKey),
    };
    let txt = data.join("");
    DkimKey::parse(&txt, answer.secure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::TestResolver;

    #[tokio::test]
    async fn test_cache_mode_dedupes_insert() {
        let store = KeyStore::open(":memory:", KeyStoreMode::Cache).unwrap();
        let resolver = TestResolver::new().with_txt(
            "selector._domainkey.example.com",
            vec!["v=DKIM1; p=".to_string()],
        );

        let key1 = store
            .resolve(&resolver, "example.com", "selector", "t0")
            .await
            .unwrap();
        assert!(matches!(key1.public_key, crate::crypto::DkimPublicKey::Revoked));

        let rows = store.list_keys().await.unwrap();
        assert_eq!(rows.len(), 1);

        store
            .resolve(&resolver, "example.com", "selector", "t1")
            .await
            .unwrap();
        let rows = store.list_keys().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_used_at, "t1");
    }

    #[tokio::test]
    async fn test_compare_and_alert_mismatch() {
        let store = KeyStore::open(":memory:", KeyStoreMode::CompareAndAlert).unwrap();
        let resolver = TestResolver::new().with_txt(
            "selector._domainkey.example.com",
            vec!["v=DKIM1; p=".to_string()],
        );
        store
            .resolve(&resolver, "example.com", "selector", "t0")
            .await
            .unwrap();

        let resolver2 = TestResolver::new().with_txt(
            "selector._domainkey.example.com",
            vec!["v=DKIM1; k=ed25519; p=".to_string()],
        );
        let err = store
            .resolve(&resolver2, "example.com", "selector", "t1")
            .await
            .unwrap_err();
        assert_eq!(err, DKIMError::KeyMismatch);
    }

    #[tokio::test]
    async fn test_off_mode_never_caches() {
        let store = KeyStore::open(":memory:", KeyStoreMode::Off).unwrap();
        let resolver = TestResolver::new().with_txt(
            "selector._domainkey.example.com",
            vec!["v=DKIM1; p=".to_string()],
        );
        store
            .resolve(&resolver, "example.com", "selector", "t0")
            .await
            .unwrap();
        assert_eq!(store.list_keys().await.unwrap().len(), 0);
    }
}
