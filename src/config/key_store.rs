//! # 密钥配置存储
//!
//! 从 JSON 文件加载 AI 网关使用的密钥列表，文件变化时整体替换快照。
//! 选择密钥的读者只克隆 `Arc<KeySet>`，不会看到半更新的列表。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage, mask_secret};
use crate::usage::UsageStore;
use crate::utils::write_json_atomic;
use crate::{ldebug, lerror, linfo, lwarn};

/// 未指定模型时使用的模型
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
/// 未指定时的每日上限
pub const DEFAULT_DAILY_LIMIT: u64 = 1000;

/// 一个上游凭证及其模型和每日上限
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// 标识，用于用量记录
    pub id: String,
    /// 展示名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 上游凭证
    pub api_key: String,
    /// 目标模型
    pub model: String,
    /// 每日请求上限
    pub daily_limit: u64,
    /// 是否启用
    pub enabled: bool,
    /// 覆盖默认上游地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl std::fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("daily_limit", &self.daily_limit)
            .field("enabled", &self.enabled)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl ApiKeyConfig {
    /// 创建启用状态的密钥配置，id 由凭证和模型推导
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, daily_limit: u64) -> Self {
        let api_key = api_key.into();
        let model = model.into();
        Self {
            id: Self::derive_id(&api_key, &model),
            name: None,
            api_key,
            model,
            daily_limit,
            enabled: true,
            api_base: None,
        }
    }

    /// 凭证 + 模型的稳定标识
    #[must_use]
    pub fn derive_id(api_key: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("key-{}", &digest[..12])
    }

    /// 日志中展示的名称
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// 打码后的凭证
    #[must_use]
    pub fn masked_key(&self) -> String {
        mask_secret(&self.api_key)
    }
}

/// 文件中的单个条目，字段都可缺省以兼容各种写法
#[derive(Debug, Clone, Default, Deserialize)]
struct KeyFileEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "google_api_key")]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    daily_limit: Option<u64>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    api_base: Option<String>,
}

/// 支持的三种文件形态
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyFileDocument {
    List(Vec<KeyFileEntry>),
    Wrapped {
        #[serde(default)]
        enabled: Option<bool>,
        configs: Vec<KeyFileEntry>,
    },
    Single(KeyFileEntry),
}

/// 写回文件时的结构
#[derive(Debug, Serialize)]
struct KeyFileOutput<'a> {
    enabled: bool,
    configs: &'a [ApiKeyConfig],
}

/// 环境变量提供的额外密钥（优先级最高）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// 额外密钥
    pub key: Option<ApiKeyConfig>,
    /// 覆盖文件中的启用开关
    pub enabled: Option<bool>,
}

impl EnvOverrides {
    /// 从进程环境读取
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 通过查找函数读取，便于测试
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let key = lookup("GOOGLE_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .map(|api_key| {
                let model = lookup("GEMINI_MODEL")
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_MODEL.to_string());
                let mut config = ApiKeyConfig::new(api_key.trim(), model, DEFAULT_DAILY_LIMIT);
                config.name = Some("env".to_string());
                config.api_base = lookup("GEMINI_API_BASE").filter(|b| !b.trim().is_empty());
                config
            });
        let enabled = lookup("GEMINI_ENABLED").map(|v| {
            matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        });
        Self { key, enabled }
    }
}

/// 一次加载得到的不可变密钥集合
#[derive(Debug, Clone)]
pub struct KeySet {
    enabled: bool,
    keys: Vec<ApiKeyConfig>,
    loaded_at: DateTime<Local>,
}

impl KeySet {
    fn empty() -> Self {
        Self {
            enabled: true,
            keys: Vec::new(),
            loaded_at: Local::now(),
        }
    }

    /// 文件层面的启用开关
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// 按文件顺序的密钥
    #[must_use]
    pub fn keys(&self) -> &[ApiKeyConfig] {
        &self.keys
    }

    /// 密钥数量
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// 是否为空
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// 加载时间
    #[must_use]
    pub const fn loaded_at(&self) -> DateTime<Local> {
        self.loaded_at
    }

    /// 按 id 查找
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ApiKeyConfig> {
        self.keys.iter().find(|k| k.id == id)
    }
}

/// 密钥存储变化事件
#[derive(Debug, Clone)]
pub enum KeyStoreEvent {
    /// 重载成功
    Reloaded(Arc<KeySet>),
    /// 重载失败，保留旧快照
    ReloadFailed(String),
}

/// 文件变化标记
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileMarker {
    modified: Option<SystemTime>,
    digest: [u8; 32],
}

#[derive(Debug)]
struct ReloadState {
    loaded: bool,
    marker: Option<FileMarker>,
    last_check: Instant,
}

/// 密钥配置存储
pub struct KeyConfigStore {
    path: PathBuf,
    usage: Arc<UsageStore>,
    snapshot: RwLock<Arc<KeySet>>,
    reload_state: Mutex<ReloadState>,
    check_interval: Duration,
    overrides: EnvOverrides,
    events: broadcast::Sender<KeyStoreEvent>,
}

impl std::fmt::Debug for KeyConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfigStore")
            .field("path", &self.path)
            .field("keys", &self.snapshot().len())
            .field("check_interval", &self.check_interval)
            .finish_non_exhaustive()
    }
}

impl KeyConfigStore {
    /// 打开密钥文件
    ///
    /// 文件缺失或无法解析时以空集合启动，之后文件修好会被自动加载。
    pub fn open(
        path: impl Into<PathBuf>,
        usage: Arc<UsageStore>,
        check_interval: Duration,
        overrides: EnvOverrides,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let store = Self {
            path: path.into(),
            usage,
            snapshot: RwLock::new(Arc::new(KeySet::empty())),
            reload_state: Mutex::new(ReloadState {
                loaded: false,
                marker: None,
                last_check: Instant::now(),
            }),
            check_interval,
            overrides,
            events,
        };

        match store.reload_if_changed() {
            Ok(_) => linfo!(
                "system",
                LogStage::Startup,
                LogComponent::KeyStore,
                "keys_loaded",
                "Key configuration loaded",
                path = %store.path.display(),
                keys = store.snapshot().len()
            ),
            Err(e) => lerror!(
                "system",
                LogStage::Startup,
                LogComponent::KeyStore,
                "keys_load_failed",
                "Key configuration could not be loaded, starting with no keys",
                path = %store.path.display(),
                error = %e
            ),
        }
        store
    }

    /// 密钥文件路径
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 关联的用量存储
    #[must_use]
    pub fn usage(&self) -> &Arc<UsageStore> {
        &self.usage
    }

    /// 当前快照
    #[must_use]
    pub fn snapshot(&self) -> Arc<KeySet> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// 订阅重载事件
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<KeyStoreEvent> {
        self.events.subscribe()
    }

    /// 网关是否启用（文件开关与环境变量）
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.maybe_reload();
        self.snapshot().enabled()
    }

    /// 选择第一个未被排除、已启用且当日未达上限的密钥
    #[must_use]
    pub fn select_key(&self, excluding: &HashSet<String>, today: NaiveDate) -> Option<ApiKeyConfig> {
        self.maybe_reload();
        let snapshot = self.snapshot();

        snapshot
            .keys()
            .iter()
            .filter(|key| key.enabled && !excluding.contains(&key.id))
            .find(|key| self.usage.count_for(&key.id, today) < key.daily_limit)
            .cloned()
    }

    /// 间隔到期后检查一次文件
    fn maybe_reload(&self) {
        {
            let mut state = self.reload_state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.last_check.elapsed() < self.check_interval {
                return;
            }
            state.last_check = Instant::now();
        }

        if let Err(e) = self.reload_if_changed() {
            ldebug!(
                "system",
                LogStage::Reload,
                LogComponent::KeyStore,
                "lazy_reload_failed",
                "Lazy key reload failed, keeping previous keys",
                error = %e
            );
        }
    }

    /// 文件内容有变化时重载，返回是否替换了快照
    pub fn reload_if_changed(&self) -> Result<bool> {
        let (marker, content) = self.read_file()?;

        let mut state = self.reload_state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.loaded && state.marker == marker {
            return Ok(false);
        }
        state.loaded = true;
        state.marker = marker;
        state.last_check = Instant::now();

        self.apply(content.as_deref())
    }

    /// 无条件重载
    pub fn reload(&self) -> Result<()> {
        let (marker, content) = self.read_file()?;

        let mut state = self.reload_state.lock().unwrap_or_else(PoisonError::into_inner);
        state.loaded = true;
        state.marker = marker;
        state.last_check = Instant::now();

        self.apply(content.as_deref()).map(|_| ())
    }

    /// 写回密钥文件并立即生效
    pub fn save_keys(&self, enabled: bool, keys: &[ApiKeyConfig]) -> Result<()> {
        write_json_atomic(
            &self.path,
            &KeyFileOutput {
                enabled,
                configs: keys,
            },
        )?;
        self.reload()
    }

    fn read_file(&self) -> Result<(Option<FileMarker>, Option<Vec<u8>>)> {
        match std::fs::read(&self.path) {
            Ok(content) => {
                let modified = std::fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .ok();
                let digest: [u8; 32] = Sha256::digest(&content).into();
                Ok((Some(FileMarker { modified, digest }), Some(content)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((None, None)),
            Err(e) => Err(ProxyError::config_with_source(
                format!("读取密钥文件失败: {}", self.path.display()),
                e,
            )),
        }
    }

    /// 解析并替换快照，调用方持有 `reload_state` 锁保证单写者
    fn apply(&self, content: Option<&[u8]>) -> Result<bool> {
        let parsed = match content {
            Some(content) => parse_key_file(content),
            None => {
                lwarn!(
                    "system",
                    LogStage::Reload,
                    LogComponent::KeyStore,
                    "key_file_missing",
                    "Key file not found, using no file keys",
                    path = %self.path.display()
                );
                Ok((true, Vec::new()))
            }
        };

        let (file_enabled, file_keys) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                lerror!(
                    "system",
                    LogStage::Reload,
                    LogComponent::KeyStore,
                    "key_reload_failed",
                    "Key file could not be parsed, keeping previous keys",
                    path = %self.path.display(),
                    error = %e
                );
                let _ = self.events.send(KeyStoreEvent::ReloadFailed(e.to_string()));
                return Err(e);
            }
        };

        let mut keys = Vec::with_capacity(file_keys.len() + 1);
        if let Some(env_key) = &self.overrides.key {
            keys.push(env_key.clone());
        }
        for key in file_keys {
            if keys.iter().any(|k: &ApiKeyConfig| k.id == key.id) {
                lwarn!(
                    "system",
                    LogStage::Reload,
                    LogComponent::KeyStore,
                    "duplicate_key",
                    "Duplicate key entry ignored",
                    key_id = %key.id
                );
                continue;
            }
            keys.push(key);
        }

        let key_set = Arc::new(KeySet {
            enabled: self.overrides.enabled.unwrap_or(file_enabled),
            keys,
            loaded_at: Local::now(),
        });

        {
            let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::clone(&key_set);
        }

        linfo!(
            "system",
            LogStage::Reload,
            LogComponent::KeyStore,
            "keys_reloaded",
            "Key configuration swapped",
            keys = key_set.len(),
            enabled = key_set.enabled()
        );
        let _ = self.events.send(KeyStoreEvent::Reloaded(key_set));
        Ok(true)
    }
}

/// 解析密钥文件，返回 (启用开关, 按文件顺序的密钥)
fn parse_key_file(content: &[u8]) -> Result<(bool, Vec<ApiKeyConfig>)> {
    let document: KeyFileDocument = serde_json::from_slice(content)
        .map_err(|e| ProxyError::config_with_source("密钥文件格式错误", e))?;

    let (enabled, entries) = match document {
        KeyFileDocument::List(entries) => (true, entries),
        KeyFileDocument::Wrapped { enabled, configs } => (enabled.unwrap_or(true), configs),
        KeyFileDocument::Single(entry) => (true, vec![entry]),
    };

    let keys = entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let api_key = entry.api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
            let Some(api_key) = api_key else {
                lwarn!(
                    "system",
                    LogStage::Reload,
                    LogComponent::KeyStore,
                    "entry_without_key",
                    "Key entry without credential skipped",
                    index = index
                );
                return None;
            };
            let model = entry
                .model
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let id = entry
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| ApiKeyConfig::derive_id(&api_key, &model));

            Some(ApiKeyConfig {
                id,
                name: entry.name,
                api_key,
                model,
                daily_limit: entry.daily_limit.unwrap_or(DEFAULT_DAILY_LIMIT),
                enabled: entry.enabled.unwrap_or(true),
                api_base: entry.api_base.filter(|b| !b.trim().is_empty()),
            })
        })
        .collect();

    Ok((enabled, keys))
}
