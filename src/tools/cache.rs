//! 工具结果缓存
//!
//! - key：工具名 + 规范化参数（对象键排序后的紧凑 JSON），参数键顺序不影响指纹
//! - 分片：按指纹哈希选分片，每个分片一把锁，无关 key 不会争用同一把锁
//! - 淘汰：分片容量满时淘汰最久未访问的条目（LRU）；TTL 在访问时与后台清扫时过期
//! - 统计：hits / misses / evictions / expirations / size
//!
//! 只缓存成功结果；是否可缓存由调用方按 Tool::is_cacheable 判定。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheSection;
use crate::memory::ToolCallResult;

/// 缓存指纹
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    key: String,
    hash: u64,
}

impl Fingerprint {
    pub fn new(tool_name: &str, args: &Map<String, Value>) -> Self {
        let mut key = String::with_capacity(tool_name.len() + 32);
        key.push_str(tool_name);
        key.push('\u{0}');
        write_canonical(&Value::Object(args.clone()), &mut key);
        let hash = fnv1a(key.as_bytes());
        Self { key, hash }
    }

    /// 十六进制摘要（日志用）
    pub fn digest(&self) -> String {
        format!("{:016x}", self.hash)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub tool_name: String,
    pub result: ToolCallResult,
    pub inserted_at: Instant,
    pub ttl: Duration,
    pub size_estimate: usize,
    /// 参数中引用的路径（按路径失效时匹配）
    pub paths: Vec<String>,
    last_access: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
    /// 访问序号 -> key；最小序号即最久未访问
    lru: BTreeMap<u64, String>,
}

impl Shard {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.last_access);
        Some(entry)
    }
}

/// 缓存统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// 分片 LRU 工具结果缓存（跨运行、跨会话共享）
pub struct ToolResultCache {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    default_ttl: Duration,
    tool_ttl: HashMap<String, Duration>,
    enabled: bool,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ToolResultCache {
    /// 容量按分片均分（向上取整）
    pub fn new(capacity: usize, shards: usize, default_ttl: Duration) -> Self {
        let shards = shards.max(1);
        let capacity = capacity.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            shard_capacity: capacity.div_ceil(shards),
            default_ttl,
            tool_ttl: HashMap::new(),
            enabled: true,
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn from_section(section: &CacheSection) -> Self {
        let mut cache = Self::new(section.capacity, section.shards, Duration::from_secs(section.default_ttl_secs));
        cache.enabled = section.enabled;
        cache.tool_ttl = section
            .tool_ttl_secs
            .iter()
            .map(|(name, secs)| (name.clone(), Duration::from_secs(*secs)))
            .collect();
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 配置的按工具 TTL > 工具自带 TTL > 默认 TTL
    pub fn ttl_for(&self, tool_name: &str, tool_default: Option<Duration>) -> Duration {
        self.tool_ttl
            .get(tool_name)
            .copied()
            .or(tool_default)
            .unwrap_or(self.default_ttl)
    }

    fn shard(&self, fp: &Fingerprint) -> std::sync::MutexGuard<'_, Shard> {
        let idx = (fp.hash % self.shards.len() as u64) as usize;
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// 查找；命中时刷新 LRU 位置并返回标记 cached 的结果
    pub fn get(&self, tool_name: &str, args: &Map<String, Value>) -> Option<ToolCallResult> {
        if !self.enabled {
            return None;
        }
        let fp = Fingerprint::new(tool_name, args);
        let now = Instant::now();
        let mut shard = self.shard(&fp);

        let expired = match shard.entries.get(&fp.key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            shard.remove(&fp.key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = self.next_tick();
        let shard = &mut *shard;
        let entry = shard.entries.get_mut(&fp.key)?;
        shard.lru.remove(&entry.last_access);
        entry.last_access = tick;
        shard.lru.insert(tick, fp.key.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);

        let mut result = entry.result.clone();
        result.cached = true;
        tracing::debug!(tool = %tool_name, fingerprint = %fp.digest(), "tool cache hit");
        Some(result)
    }

    /// 写入成功结果；分片满时淘汰最久未访问的条目
    pub fn put(&self, tool_name: &str, args: &Map<String, Value>, result: &ToolCallResult, ttl: Duration, paths: Vec<String>) {
        if !self.enabled || !result.success {
            return;
        }
        let fp = Fingerprint::new(tool_name, args);
        let tick = self.next_tick();
        let entry = CacheEntry {
            tool_name: tool_name.to_string(),
            result: ToolCallResult {
                cached: false,
                ..result.clone()
            },
            inserted_at: Instant::now(),
            ttl,
            size_estimate: fp.key.len() + result.output.len(),
            paths,
            last_access: tick,
        };

        let mut shard = self.shard(&fp);
        shard.remove(&fp.key);
        while shard.entries.len() >= self.shard_capacity {
            let Some((_, oldest)) = shard.lru.pop_first() else {
                break;
            };
            shard.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        shard.lru.insert(tick, fp.key.clone());
        shard.entries.insert(fp.key, entry);
    }

    /// 按谓词失效，返回移除条数
    pub fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, e)| predicate(e))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                shard.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// 移除参数引用了 prefix 下路径的条目（按路径组件匹配，src 不会匹配 src2）
    pub fn invalidate_path_prefix(&self, prefix: &str) -> usize {
        let prefix = crate::tools::registry::normalize_path(prefix);
        let removed = self.invalidate(|entry| entry.paths.iter().any(|p| path_under(p, &prefix)));
        if removed > 0 {
            tracing::debug!(%prefix, removed, "tool cache invalidated by path");
        }
        removed
    }

    /// 清除所有过期条目，返回清除条数
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.invalidate(|entry| entry.is_expired(now));
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// 启动后台过期清扫，cancel 触发后退出
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "tool cache sweep");
                        }
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.invalidate(|_| true);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

fn path_under(path: &str, prefix: &str) -> bool {
    if prefix == "." {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn ok(output: &str) -> ToolCallResult {
        ToolCallResult::success("c", "read_file", output)
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = Fingerprint::new("grep", &args(json!({"q": "x", "opts": {"b": 1, "a": 2}})));
        let b = Fingerprint::new("grep", &args(json!({"opts": {"a": 2, "b": 1}, "q": "x"})));
        assert_eq!(a, b);
        let c = Fingerprint::new("read_file", &args(json!({"q": "x", "opts": {"b": 1, "a": 2}})));
        assert_ne!(a, c);
    }

    #[test]
    fn test_hit_after_put() {
        let cache = ToolResultCache::new(10, 4, Duration::from_secs(60));
        let a = args(json!({"path": "a.rs"}));
        assert!(cache.get("read_file", &a).is_none());
        cache.put("read_file", &a, &ok("fn main"), Duration::from_secs(60), vec!["a.rs".into()]);
        let first = cache.get("read_file", &a).unwrap();
        let second = cache.get("read_file", &a).unwrap();
        assert!(first.cached && second.cached);
        assert_eq!(first.output, "fn main");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (2, 1, 1));
    }

    #[test]
    fn test_failures_not_cached() {
        let cache = ToolResultCache::new(10, 1, Duration::from_secs(60));
        let a = args(json!({"path": "missing"}));
        cache.put("read_file", &a, &ToolCallResult::failure("c", "read_file", "nope"), Duration::from_secs(60), vec![]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ToolResultCache::new(2, 1, Duration::from_secs(60));
        let ttl = Duration::from_secs(60);
        let (a, b, c) = (args(json!({"p": 1})), args(json!({"p": 2})), args(json!({"p": 3})));
        cache.put("t", &a, &ok("a"), ttl, vec![]);
        cache.put("t", &b, &ok("b"), ttl, vec![]);
        assert!(cache.get("t", &a).is_some());
        cache.put("t", &c, &ok("c"), ttl, vec![]);

        assert!(cache.get("t", &b).is_none());
        assert!(cache.get("t", &a).is_some());
        assert!(cache.get("t", &c).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_expiry_on_access() {
        let cache = ToolResultCache::new(4, 1, Duration::from_secs(60));
        let a = args(json!({"p": 1}));
        cache.put("t", &a, &ok("a"), Duration::ZERO, vec![]);
        assert!(cache.get("t", &a).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_removes_expired() {
        let cache = ToolResultCache::new(4, 2, Duration::from_secs(60));
        cache.put("t", &args(json!({"p": 1})), &ok("a"), Duration::ZERO, vec![]);
        cache.put("t", &args(json!({"p": 2})), &ok("b"), Duration::from_secs(60), vec![]);
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_path_prefix_is_exact() {
        let cache = ToolResultCache::new(16, 4, Duration::from_secs(60));
        let ttl = Duration::from_secs(60);
        for path in ["src/a.rs", "src/b/c.rs", "src2/d.rs", "docs/readme.md"] {
            cache.put("read_file", &args(json!({ "path": path })), &ok(path), ttl, vec![path.to_string()]);
        }
        assert_eq!(cache.invalidate_path_prefix("./src/"), 2);
        assert!(cache.get("read_file", &args(json!({"path": "src2/d.rs"}))).is_some());
        assert!(cache.get("read_file", &args(json!({"path": "docs/readme.md"}))).is_some());
        assert!(cache.get("read_file", &args(json!({"path": "src/a.rs"}))).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_ttl_resolution() {
        let mut section = CacheSection::default();
        section.tool_ttl_secs.insert("grep".into(), 5);
        let cache = ToolResultCache::from_section(&section);
        assert_eq!(cache.ttl_for("grep", Some(Duration::from_secs(99))), Duration::from_secs(5));
        assert_eq!(cache.ttl_for("read_file", Some(Duration::from_secs(99))), Duration::from_secs(99));
        assert_eq!(cache.ttl_for("read_file", None), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let cache = Arc::new(ToolResultCache::new(4, 1, Duration::from_secs(60)));
        cache.put("t", &args(json!({"p": 1})), &ok("a"), Duration::ZERO, vec![]);
        let cancel = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_disabled_cache_is_noop() {
        let section = CacheSection {
            enabled: false,
            ..CacheSection::default()
        };
        let cache = ToolResultCache::from_section(&section);
        let a = args(json!({"p": 1}));
        cache.put("t", &a, &ok("a"), Duration::from_secs(60), vec![]);
        assert!(cache.get("t", &a).is_none());
        assert_eq!(cache.stats().misses, 0);
    }
}
