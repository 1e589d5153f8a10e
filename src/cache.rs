//! Stale-while-revalidate disk cache for `WebFetch`.
//!
//! SHA256-keyed entries live at `{cache_dir}/{first2}/{keyhex}.json`, a
//! versioned JSON envelope, written atomically (temp file + rename), and
//! evicted under a dual-limit LRU (oldest `last_accessed_at` evicted first
//! once either the entry count or the total byte budget is exceeded).
//!
//! Freshness is not baked into the entry at write time: only `stored_at` is
//! stored, and `fresh`/`stale`/expired-so-miss is decided against the
//! `EffectiveCachePolicy` (`ttl`, `stale`) in force for the *current*
//! request, since the resolved policy — and therefore the stale window —
//! can differ between two requests for the same URL under different site
//! overrides. `SingleFlight` is a separate, in-process primitive layered
//! above the disk format; it knows nothing about freshness and is reused for
//! both the blocking miss-path fetch and the fire-and-forget stale-path
//! revalidation.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use url::Url;

use crate::resolved::{CacheSettings, EffectiveCachePolicy};
use crate::types::{ErrorCode, WebFetchError};

/// Current cache entry format version.
pub const CACHE_VERSION: u32 = 3;

/// Cache entry stored on disk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    /// Format version for compatibility.
    pub version: u32,

    /// Original fetch timestamp (RFC3339, second precision). Freshness is
    /// computed from this against the *current* request's `ttl`/`stale`,
    /// not a value baked in at write time.
    pub stored_at: String,

    /// Last access timestamp (RFC3339, second precision).
    /// Updated on read; never used for freshness.
    pub last_accessed_at: String,

    /// Final URL after redirects.
    pub final_url: String,

    /// HTTP status code of the underlying response.
    pub status_code: u16,

    /// Normalized content-type of the raw response body, if known.
    pub content_type: Option<String>,

    /// `Last-Modified` header of the underlying response, used as the
    /// conditional-request validator on revalidation.
    pub last_modified: Option<String>,

    /// Page title.
    pub title: Option<String>,

    /// Page description.
    pub description: Option<String>,

    /// Favicon URL, resolved against `final_url`.
    pub favicon: Option<String>,

    /// Page language.
    pub language: Option<String>,

    /// Canonical extracted document (Markdown).
    /// NOT chunked - caller re-chunks with the request's token budget.
    pub markdown: String,
}

impl CacheEntry {
    /// Age of this entry as of now.
    fn age(&self) -> Duration {
        parse_rfc3339(&self.stored_at).map_or(Duration::MAX, |stored| {
            SystemTime::now().duration_since(stored).unwrap_or(Duration::ZERO)
        })
    }

    /// Freshness of this entry under `policy`.
    pub fn freshness(&self, policy: &EffectiveCachePolicy) -> Freshness {
        let age = self.age();
        if age <= policy.ttl {
            Freshness::Fresh
        } else if age <= policy.ttl + policy.stale {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Update last accessed time (does NOT affect freshness).
    pub fn touch(&mut self) {
        self.last_accessed_at = format_rfc3339(SystemTime::now());
    }

    /// Estimate serialized size in bytes.
    pub fn estimated_size(&self) -> u64 {
        let base_overhead = 200; // JSON structure, field names
        let opt_len = |o: &Option<String>| o.as_ref().map_or(0, String::len);
        let content_size = self.stored_at.len()
            + self.last_accessed_at.len()
            + self.final_url.len()
            + opt_len(&self.content_type)
            + opt_len(&self.last_modified)
            + opt_len(&self.title)
            + opt_len(&self.description)
            + opt_len(&self.favicon)
            + opt_len(&self.language)
            + self.markdown.len();

        (base_overhead + content_size) as u64
    }
}

/// Freshness band of a cache entry under a particular `EffectiveCachePolicy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Cache lookup result.
#[derive(Debug)]
pub enum CacheLookup {
    /// Entry found, within `ttl`.
    Fresh(CacheEntry),
    /// Entry found, within `ttl..=ttl+stale`. Caller should schedule a
    /// background revalidation and return this entry synchronously.
    Stale(CacheEntry),
    /// Not found, expired, corrupted, or version-mismatched.
    Miss,
}

/// Disk-based LRU cache with stale-while-revalidate freshness semantics.
pub struct Cache {
    dir: PathBuf,
    max_entries: u32,
    max_bytes: u64,
    lru: HashMap<String, (SystemTime, u64)>,
}

impl Cache {
    /// Create a new cache instance.
    pub fn new(settings: &CacheSettings) -> Result<Self, WebFetchError> {
        let dir = settings.dir.clone();

        fs::create_dir_all(&dir).map_err(|e| {
            WebFetchError::new(ErrorCode::Internal, format!("failed to create cache directory: {e}"), false)
        })?;

        let mut cache = Self {
            dir,
            max_entries: settings.max_entries,
            max_bytes: settings.max_bytes,
            lru: HashMap::new(),
        };

        cache.scan_entries();

        Ok(cache)
    }

    /// Look up `url`, classifying the result as fresh/stale/miss under
    /// `policy`. Cache read failures are treated as miss. Expired entries
    /// are deleted. Updates `last_accessed_at` on fresh/stale hits.
    pub fn get(&mut self, url: &Url, policy: &EffectiveCachePolicy) -> CacheLookup {
        let key = cache_key(url);
        let path = self.entry_path(&key);

        if !path.exists() {
            return CacheLookup::Miss;
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return CacheLookup::Miss,
        };

        let mut entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(_) => {
                let _ = fs::remove_file(&path);
                self.lru.remove(&key);
                return CacheLookup::Miss;
            }
        };

        if entry.version != CACHE_VERSION {
            let _ = fs::remove_file(&path);
            self.lru.remove(&key);
            return CacheLookup::Miss;
        }

        let freshness = entry.freshness(policy);
        if freshness == Freshness::Expired {
            let _ = fs::remove_file(&path);
            self.lru.remove(&key);
            return CacheLookup::Miss;
        }

        entry.touch();
        if let Ok(updated_content) = serde_json::to_string_pretty(&entry) {
            let _ = fs::write(&path, &updated_content);
        }

        let size = entry.estimated_size();
        self.lru.insert(key, (SystemTime::now(), size));

        match freshness {
            Freshness::Fresh => CacheLookup::Fresh(entry),
            Freshness::Stale => CacheLookup::Stale(entry),
            Freshness::Expired => unreachable!("handled above"),
        }
    }

    /// Store an entry in the cache (replace-don't-mutate: a revalidation
    /// installs a brand new entry atomically via this same path).
    ///
    /// Uses atomic write (temp file + rename).
    /// Returns error for oversized entries (caller adds a note).
    pub fn put(&mut self, url: &Url, entry: &CacheEntry) -> Result<(), CacheWriteError> {
        let size = entry.estimated_size();

        if size > self.max_bytes {
            return Err(CacheWriteError::EntryTooLarge { size, max: self.max_bytes });
        }

        let key = cache_key(url);

        self.evict_if_needed(size)?;

        let content = serde_json::to_string_pretty(entry).map_err(|e| CacheWriteError::SerializationFailed(e.to_string()))?;

        let path = self.entry_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &path)?;

        self.lru.insert(key, (SystemTime::now(), size));

        Ok(())
    }

    /// Refresh `stored_at` only, leaving all other fields untouched — used
    /// when a revalidation's conditional request returns `304 Not Modified`.
    pub fn touch_stored_at(&mut self, url: &Url) -> Result<(), CacheWriteError> {
        let key = cache_key(url);
        let path = self.entry_path(&key);

        let content = fs::read_to_string(&path)?;
        let mut entry: CacheEntry =
            serde_json::from_str(&content).map_err(|e| CacheWriteError::SerializationFailed(e.to_string()))?;
        entry.stored_at = format_rfc3339(SystemTime::now());
        entry.last_accessed_at = entry.stored_at.clone();

        self.put(url, &entry)
    }

    fn scan_entries(&mut self) {
        let Ok(subdirs) = fs::read_dir(&self.dir) else {
            return;
        };

        for subdir_entry in subdirs.flatten() {
            let subdir_path = subdir_entry.path();
            if !subdir_path.is_dir() {
                continue;
            }

            let Ok(files) = fs::read_dir(&subdir_path) else {
                continue;
            };

            for file_entry in files.flatten() {
                let file_path = file_entry.path();
                if file_path.extension().is_some_and(|e| e == "json")
                    && let Some(key) = file_path.file_stem().and_then(|s| s.to_str())
                {
                    let size = file_entry.metadata().map(|m| m.len()).unwrap_or(0);
                    let mtime = file_entry.metadata().ok().and_then(|m| m.modified().ok()).unwrap_or(UNIX_EPOCH);
                    self.lru.insert(key.to_string(), (mtime, size));
                }
            }
        }
    }

    /// Evict entries if cache limits exceeded.
    ///
    /// Dual-limit eviction (interleaved LRU).
    /// Tie-break: oldest `last_accessed_at`, then lexicographic key.
    fn evict_if_needed(&mut self, new_entry_bytes: u64) -> Result<(), CacheWriteError> {
        let (current_entries, current_bytes) = self.calculate_usage();

        let need_entries = current_entries >= self.max_entries;
        let need_bytes = current_bytes + new_entry_bytes > self.max_bytes;

        if !need_entries && !need_bytes {
            return Ok(());
        }

        let mut entries: Vec<_> = self.lru.iter().map(|(k, (t, s))| (k.clone(), *t, *s)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut removed_entries = 0u32;
        let mut removed_bytes = 0u64;

        for (key, _, size) in entries {
            let path = self.entry_path(&key);
            if path.exists() && fs::remove_file(&path).is_ok() {
                self.lru.remove(&key);
                removed_entries += 1;
                removed_bytes += size;

                let new_entries = current_entries.saturating_sub(removed_entries);
                let new_bytes = current_bytes.saturating_sub(removed_bytes);

                if new_entries < self.max_entries && new_bytes + new_entry_bytes <= self.max_bytes {
                    break;
                }
            }
        }

        Ok(())
    }

    fn calculate_usage(&self) -> (u32, u64) {
        let entries = self.lru.len() as u32;
        let bytes: u64 = self.lru.values().map(|(_, s)| s).sum();
        (entries, bytes)
    }

    /// Layout: `{cache_dir}/{first2}/{keyhex}.json`
    fn entry_path(&self, key: &str) -> PathBuf {
        let prefix = if key.len() >= 2 { &key[..2] } else { "00" };
        self.dir.join(prefix).join(format!("{key}.json"))
    }
}

/// Errors that can occur during cache write.
#[derive(Debug)]
pub enum CacheWriteError {
    EntryTooLarge { size: u64, max: u64 },
    SerializationFailed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CacheWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheWriteError::EntryTooLarge { size, max } => write!(f, "entry too large: {size} bytes (max {max})"),
            CacheWriteError::SerializationFailed(e) => write!(f, "serialization failed: {e}"),
            CacheWriteError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for CacheWriteError {}

impl From<std::io::Error> for CacheWriteError {
    fn from(e: std::io::Error) -> Self {
        CacheWriteError::Io(e)
    }
}

/// Derive cache key from the post-rewrite request URL exactly — this is
/// *not* a normalized/dedup identity; only the fragment is stripped before
/// hashing.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    let result = hasher.finalize();

    hex_encode(&result)
}

/// Format `SystemTime` as RFC3339 with second precision.
pub fn format_rfc3339(time: SystemTime) -> String {
    let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = duration.as_secs();

    let days = secs / 86400;
    let remaining = secs % 86400;
    let hours = remaining / 3600;
    let minutes = (remaining % 3600) / 60;
    let seconds = remaining % 60;

    let (year, month, day) = days_to_ymd(days);

    format!("{year:04}-{month:02}-{day:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

/// Parse RFC3339 timestamp to `SystemTime`.
pub fn parse_rfc3339(s: &str) -> Option<SystemTime> {
    if s.len() < 20 {
        return None;
    }

    let year: u64 = s.get(0..4)?.parse().ok()?;
    let month: u64 = s.get(5..7)?.parse().ok()?;
    let day: u64 = s.get(8..10)?.parse().ok()?;
    let hour: u64 = s.get(11..13)?.parse().ok()?;
    let min: u64 = s.get(14..16)?.parse().ok()?;
    let sec: u64 = s.get(17..19)?.parse().ok()?;

    let days = ymd_to_days(year, month, day)?;
    let total_secs = days * 86400 + hour * 3600 + min * 60 + sec;

    Some(UNIX_EPOCH + Duration::from_secs(total_secs))
}

fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let mut remaining = days;
    let mut year = 1970;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining < days_in_year {
            break;
        }
        remaining -= days_in_year;
        year += 1;
    }

    let leap = is_leap_year(year);
    let month_days = if leap {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days_in_month in month_days {
        if remaining < days_in_month {
            break;
        }
        remaining -= days_in_month;
        month += 1;
    }

    (year, month, remaining + 1)
}

fn ymd_to_days(year: u64, month: u64, day: u64) -> Option<u64> {
    if year < 1970 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let mut days = 0u64;

    for y in 1970..year {
        days += if is_leap_year(y) { 366 } else { 365 };
    }

    let leap = is_leap_year(year);
    let month_days = if leap {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    for m in 1..month {
        days += month_days[(m - 1) as usize];
    }

    days += day - 1;

    Some(days)
}

fn is_leap_year(year: u64) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Per-key single-flight coordination, independent of the disk cache.
///
/// Used two ways by the coordinator: [`SingleFlight::run`] blocks every
/// caller on the same in-flight future (the cache-miss path, where we want
/// exactly one origin fetch no matter how many callers raced in); and
/// [`SingleFlight::try_start`] is a non-blocking dedup guard (the stale-hit
/// path, where callers must never block on revalidation — only one
/// revalidation per key should run, and everyone else just proceeds with the
/// stale entry they already have).
pub(crate) struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: StdMutex<HashMap<String, watch::Receiver<Option<T>>>>,
    revalidating: StdMutex<std::collections::HashSet<String>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: StdMutex::new(HashMap::new()),
            revalidating: StdMutex::new(std::collections::HashSet::new()),
        }
    }

    /// Run `make` for `key` if no call is currently in flight; otherwise
    /// await the in-flight call's result. Exactly one call to `make` runs
    /// per overlapping burst of callers sharing `key`.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let existing = {
            let guard = self.inflight.lock().unwrap();
            guard.get(key).cloned()
        };

        if let Some(rx) = existing {
            return Self::wait_for(rx).await;
        }

        let (tx, rx) = watch::channel(None);
        {
            let mut guard = self.inflight.lock().unwrap();
            // Another caller may have raced us between the read above and
            // this insert; defer to whichever one actually got there first.
            if let Some(rx) = guard.get(key).cloned() {
                drop(guard);
                return Self::wait_for(rx).await;
            }
            guard.insert(key.to_string(), rx);
        }

        let result = make().await;
        let _ = tx.send(Some(result.clone()));
        self.inflight.lock().unwrap().remove(key);
        result
    }

    async fn wait_for(mut rx: watch::Receiver<Option<T>>) -> T {
        loop {
            if let Some(v) = rx.borrow().clone() {
                return v;
            }
            if rx.changed().await.is_err() {
                if let Some(v) = rx.borrow().clone() {
                    return v;
                }
                unreachable!("single-flight leader dropped its sender without producing a result");
            }
        }
    }

    /// Mark `key` as having a revalidation in flight, returning a guard that
    /// clears the mark on drop. Returns `None` if one is already running.
    pub fn try_start(&self, key: &str) -> Option<RevalidationGuard<'_, T>> {
        let mut guard = self.revalidating.lock().unwrap();
        if guard.insert(key.to_string()) {
            Some(RevalidationGuard { owner: self, key: key.to_string() })
        } else {
            None
        }
    }
}

/// Clears the associated key's revalidation mark when dropped.
pub(crate) struct RevalidationGuard<'a, T: Clone + Send + Sync + 'static> {
    owner: &'a SingleFlight<T>,
    key: String,
}

impl<'a, T: Clone + Send + Sync + 'static> Drop for RevalidationGuard<'a, T> {
    fn drop(&mut self) {
        self.owner.revalidating.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_deterministic() {
        let url1 = Url::parse("https://example.com/path").unwrap();
        let url2 = Url::parse("https://example.com/path").unwrap();
        assert_eq!(cache_key(&url1), cache_key(&url2));
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let url1 = Url::parse("https://example.com/path#section1").unwrap();
        let url2 = Url::parse("https://example.com/path#section2").unwrap();
        assert_eq!(cache_key(&url1), cache_key(&url2));
    }

    #[test]
    fn test_cache_key_different_urls() {
        let url1 = Url::parse("https://example.com/path1").unwrap();
        let url2 = Url::parse("https://example.com/path2").unwrap();
        assert_ne!(cache_key(&url1), cache_key(&url2));
    }

    #[test]
    fn test_rfc3339_roundtrip() {
        let now = SystemTime::now();
        let formatted = format_rfc3339(now);
        let parsed = parse_rfc3339(&formatted).unwrap();

        let diff = now.duration_since(parsed).or_else(|_| parsed.duration_since(now)).unwrap();
        assert!(diff.as_secs() <= 1);
    }

    #[test]
    fn test_entry_path_layout() {
        let temp = tempfile::tempdir().unwrap();
        let settings = CacheSettings { dir: temp.path().to_path_buf(), max_entries: 10, max_bytes: 1024 * 1024 };
        let cache = Cache::new(&settings).unwrap();

        let url = Url::parse("https://example.com/test").unwrap();
        let key = cache_key(&url);
        let path = cache.entry_path(&key);

        let parent = path.parent().unwrap();
        let subdir = parent.file_name().unwrap().to_str().unwrap();
        assert_eq!(subdir, &key[..2]);
        assert_eq!(path.extension().unwrap(), "json");
    }

    fn sample_entry(stored_at: SystemTime) -> CacheEntry {
        CacheEntry {
            version: CACHE_VERSION,
            stored_at: format_rfc3339(stored_at),
            last_accessed_at: format_rfc3339(stored_at),
            final_url: "https://example.com".to_string(),
            status_code: 200,
            content_type: Some("text/html".to_string()),
            last_modified: None,
            title: None,
            description: None,
            favicon: None,
            language: None,
            markdown: "# Test".to_string(),
        }
    }

    #[test]
    fn test_freshness_bands() {
        let policy = EffectiveCachePolicy { ttl: Duration::from_secs(60), stale: Duration::from_secs(60) };

        let fresh = sample_entry(SystemTime::now());
        assert_eq!(fresh.freshness(&policy), Freshness::Fresh);

        let stale = sample_entry(SystemTime::now() - Duration::from_secs(90));
        assert_eq!(stale.freshness(&policy), Freshness::Stale);

        let expired = sample_entry(SystemTime::now() - Duration::from_secs(200));
        assert_eq!(expired.freshness(&policy), Freshness::Expired);
    }

    #[test]
    fn test_cache_put_get_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let settings = CacheSettings { dir: temp.path().to_path_buf(), max_entries: 10, max_bytes: 1024 * 1024 };
        let mut cache = Cache::new(&settings).unwrap();
        let url = Url::parse("https://example.com/test").unwrap();
        let policy = EffectiveCachePolicy { ttl: Duration::from_secs(60), stale: Duration::from_secs(60) };

        cache.put(&url, &sample_entry(SystemTime::now())).unwrap();

        match cache.get(&url, &policy) {
            CacheLookup::Fresh(entry) => assert_eq!(entry.markdown, "# Test"),
            other => panic!("expected fresh hit, got {other:?}"),
        }
    }

    #[test]
    fn test_cache_miss_for_unknown_url() {
        let temp = tempfile::tempdir().unwrap();
        let settings = CacheSettings { dir: temp.path().to_path_buf(), max_entries: 10, max_bytes: 1024 * 1024 };
        let mut cache = Cache::new(&settings).unwrap();
        let url = Url::parse("https://example.com/missing").unwrap();
        let policy = EffectiveCachePolicy { ttl: Duration::from_secs(60), stale: Duration::from_secs(60) };

        assert!(matches!(cache.get(&url, &policy), CacheLookup::Miss));
    }

    #[tokio::test]
    async fn single_flight_runs_once_for_concurrent_callers() {
        let sf = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = Arc::clone(&sf);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sf.run("k", || async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    42
                })
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn try_start_dedups_concurrent_revalidations() {
        let sf = SingleFlight::<()>::new();
        let first = sf.try_start("k");
        assert!(first.is_some());
        assert!(sf.try_start("k").is_none());
        drop(first);
        assert!(sf.try_start("k").is_some());
    }
}
