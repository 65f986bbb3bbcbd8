//! # 按密钥、按日的用量计数
//!
//! 计数器是 `DashMap` 里的原子量，增量操作不需要全局锁；
//! 后台任务把快照以原子替换的方式写到 JSON 文件，供仪表盘读取。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{Days, Local, NaiveDate};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Context, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::write_json_atomic;
use crate::{ldebug, linfo, lwarn};

/// 默认保留天数
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// 用量文件的日期格式
const DATE_FORMAT: &str = "%Y-%m-%d";

type UsageKey = (String, NaiveDate);

/// 持久化文件结构
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageDocument {
    /// 保留天数
    #[serde(default)]
    pub retention_days: u32,
    /// 写入时间
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<Local>>,
    /// 密钥 id -> 日期 -> 次数
    #[serde(default)]
    pub usage: BTreeMap<String, BTreeMap<String, u64>>,
}

/// 用量存储
pub struct UsageStore {
    counts: DashMap<UsageKey, AtomicU64>,
    retention_days: u32,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl std::fmt::Debug for UsageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageStore")
            .field("records", &self.counts.len())
            .field("retention_days", &self.retention_days)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl UsageStore {
    /// 纯内存存储
    #[must_use]
    pub fn in_memory(retention_days: u32) -> Self {
        Self {
            counts: DashMap::new(),
            retention_days: retention_days.max(1),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// 打开持久化存储，文件不存在时从空开始
    pub fn open(path: impl Into<PathBuf>, retention_days: u32) -> Result<Self> {
        let path = path.into();
        let mut store = Self::in_memory(retention_days);

        if path.exists() {
            let content = std::fs::read(&path)
                .with_context(|| format!("读取用量文件失败: {}", path.display()))?;
            let document: UsageDocument = serde_json::from_slice(&content)
                .with_context(|| format!("解析用量文件失败: {}", path.display()))?;
            store.load_document(&document);
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Usage,
                "usage_loaded",
                "Usage history loaded",
                path = %path.display(),
                records = store.counts.len()
            );
        }

        store.path = Some(path);
        Ok(store)
    }

    fn load_document(&self, document: &UsageDocument) {
        let cutoff = self.cutoff(Local::now().date_naive());
        for (key_id, days) in &document.usage {
            for (date, count) in days {
                match NaiveDate::parse_from_str(date, DATE_FORMAT) {
                    Ok(date) if date >= cutoff => {
                        self.counts
                            .insert((key_id.clone(), date), AtomicU64::new(*count));
                    }
                    Ok(_) => {}
                    Err(e) => lwarn!(
                        "system",
                        LogStage::Startup,
                        LogComponent::Usage,
                        "usage_bad_date",
                        "Skipping usage record with invalid date",
                        key_id = %key_id,
                        date = %date,
                        error = %e
                    ),
                }
            }
        }
    }

    /// 对 (密钥, 日期) 原子加一，返回加一后的值
    pub fn increment(&self, key_id: &str, date: NaiveDate) -> u64 {
        let key = (key_id.to_owned(), date);

        // 计数先于脏标记，flush 清标记后拿到的快照不会漏掉未标记的计数
        if let Some(counter) = self.counts.get(&key) {
            let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
            self.dirty.store(true, Ordering::Release);
            return count;
        }

        let mut created = false;
        let count = {
            let counter = self.counts.entry(key).or_insert_with(|| {
                created = true;
                AtomicU64::new(0)
            });
            counter.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.dirty.store(true, Ordering::Release);

        if created {
            self.prune(date);
        }
        count
    }

    /// 读取 (密钥, 日期) 的次数
    #[must_use]
    pub fn count_for(&self, key_id: &str, date: NaiveDate) -> u64 {
        self.counts
            .get(&(key_id.to_owned(), date))
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    /// 指定密钥最近 `days` 天的用量（含今天，按日期升序）
    #[must_use]
    pub fn usage_range(&self, key_id: &str, days: u32, today: NaiveDate) -> Vec<(NaiveDate, u64)> {
        (0..days.max(1))
            .rev()
            .filter_map(|offset| today.checked_sub_days(Days::new(u64::from(offset))))
            .map(|date| (date, self.count_for(key_id, date)))
            .collect()
    }

    /// 某天所有密钥的用量
    #[must_use]
    pub fn usage_on(&self, date: NaiveDate) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .filter(|entry| entry.key().1 == date)
            .map(|entry| (entry.key().0.clone(), entry.value().load(Ordering::Acquire)))
            .collect()
    }

    /// 今天所有密钥的用量
    #[must_use]
    pub fn today_usage(&self) -> BTreeMap<String, u64> {
        self.usage_on(Local::now().date_naive())
    }

    /// 当前所有记录的快照
    #[must_use]
    pub fn snapshot(&self) -> UsageDocument {
        let mut usage: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for entry in &self.counts {
            let (key_id, date) = entry.key();
            usage
                .entry(key_id.clone())
                .or_default()
                .insert(date.format(DATE_FORMAT).to_string(), entry.value().load(Ordering::Acquire));
        }

        UsageDocument {
            retention_days: self.retention_days,
            updated_at: Some(Local::now()),
            usage,
        }
    }

    /// 记录条数
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// 是否没有任何记录
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// 持久化文件位置
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 有未落盘的变化时写文件，返回是否写了
    pub fn flush(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let snapshot = self.snapshot();
        if let Err(e) = write_json_atomic(path, &snapshot) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        ldebug!(
            "system",
            LogStage::Usage,
            LogComponent::Usage,
            "usage_flushed",
            "Usage history written",
            path = %path.display(),
            records = self.counts.len()
        );
        Ok(true)
    }

    fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.retention_days - 1)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// 删除保留窗口之外的记录
    fn prune(&self, today: NaiveDate) {
        let cutoff = self.cutoff(today);
        let before = self.counts.len();
        self.counts.retain(|(_, date), _| *date >= cutoff);
        let removed = before.saturating_sub(self.counts.len());
        if removed > 0 {
            ldebug!(
                "system",
                LogStage::Usage,
                LogComponent::Usage,
                "usage_pruned",
                "Expired usage records removed",
                removed = removed,
                cutoff = %cutoff
            );
        }
    }
}
