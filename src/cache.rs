// Process-wide caches shared by all sessions. Both are explicitly
// constructed in main and handed to sessions as part of the shared state;
// entries live for the process lifetime, nothing is persisted.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Advisory DN <-> login-name correlation harvested from observed
/// SearchRequest/SearchResultEntry pairs. Keys are case folded; last writer
/// wins and entries are only ever overwritten, never expired.
#[derive(Debug, Default)]
pub struct DnCnCache {
    dn_to_cn: DashMap<String, String>,
    cn_to_dn: DashMap<String, String>,
}

impl DnCnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed (entry DN, looked-up name) pair.
    pub fn observe(&self, dn: &str, cn: &str) {
        let dn_key = dn.to_lowercase();
        let cn_key = cn.to_lowercase();
        self.dn_to_cn.insert(dn_key.clone(), cn_key.clone());
        self.cn_to_dn.insert(cn_key, dn_key);
    }

    pub fn cn_for_dn(&self, dn: &str) -> Option<String> {
        self.dn_to_cn.get(&dn.to_lowercase()).map(|v| v.clone())
    }

    pub fn dn_for_cn(&self, cn: &str) -> Option<String> {
        self.cn_to_dn.get(&cn.to_lowercase()).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.dn_to_cn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dn_to_cn.is_empty()
    }
}

/// Successful second-factor verdicts keyed by `client + "-" + username`.
/// An entry older than the client's TTL counts as absent and is removed
/// lazily on the next lookup.
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: DashMap<String, Instant>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(client: &str, username: &str) -> String {
        format!("{client}-{username}")
    }

    /// A zero TTL disables the cache outright.
    pub fn try_hit(&self, client: &str, username: &str, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let key = Self::key(client, username);
        // The guard must drop before remove, or the shard deadlocks
        let freshness = self.entries.get(&key).map(|at| at.elapsed() <= ttl);
        match freshness {
            Some(true) => true,
            Some(false) => {
                self.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn set(&self, client: &str, username: &str) {
        self.entries.insert(Self::key(client, username), Instant::now());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The two caches as one injectable bundle.
#[derive(Debug, Default)]
pub struct SharedCaches {
    pub dn_cn: DnCnCache,
    pub auth: AuthCache,
}

impl SharedCaches {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dn_cn_case_folding_both_ways() {
        let cache = DnCnCache::new();
        cache.observe("CN=Alice,DC=Example,DC=Com", "Alice");
        assert_eq!(
            cache.cn_for_dn("cn=alice,dc=example,dc=com"),
            Some("alice".to_string())
        );
        assert_eq!(
            cache.dn_for_cn("ALICE"),
            Some("cn=alice,dc=example,dc=com".to_string())
        );
        assert_eq!(cache.cn_for_dn("cn=bob,dc=example,dc=com"), None);
    }

    #[test]
    fn test_dn_cn_last_writer_wins() {
        let cache = DnCnCache::new();
        cache.observe("cn=alice,dc=x", "alice");
        cache.observe("cn=alice,dc=x", "a.liddell");
        assert_eq!(cache.cn_for_dn("cn=alice,dc=x"), Some("a.liddell".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_auth_cache_hit_within_ttl() {
        let cache = AuthCache::new();
        let ttl = Duration::from_secs(60);
        assert!(!cache.try_hit("corp", "j.doe", ttl));
        cache.set("corp", "j.doe");
        assert!(cache.try_hit("corp", "j.doe", ttl));
        // Different client or user is a different key
        assert!(!cache.try_hit("lab", "j.doe", ttl));
        assert!(!cache.try_hit("corp", "a.smith", ttl));
    }

    #[test]
    fn test_auth_cache_expires_and_removes_lazily() {
        let cache = AuthCache::new();
        cache.set("corp", "j.doe");
        std::thread::sleep(Duration::from_millis(50));
        assert!(!cache.try_hit("corp", "j.doe", Duration::from_millis(30)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = AuthCache::new();
        cache.set("corp", "j.doe");
        assert!(!cache.try_hit("corp", "j.doe", Duration::ZERO));
    }
}
