//! # 按客户端 IP 的请求统计
//!
//! 每个连接结束时记录一次：请求类型、成功与否、首次/最近出现时间。
//! 定期以原子方式写入 JSON 文件，供仪表盘读取。

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::write_json_atomic;
use crate::{ldebug, lwarn};

/// 请求走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// AI 网关
    Gateway,
    /// 普通 HTTP 转发
    Forward,
    /// CONNECT 隧道
    Tunnel,
}

/// 单个客户端的累计数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientRequestStats {
    /// 请求总数
    pub total_requests: u64,
    /// AI 网关请求数
    #[serde(alias = "gemini_requests")]
    pub gateway_requests: u64,
    /// 转发请求数
    pub forward_requests: u64,
    /// 隧道请求数
    pub tunnel_requests: u64,
    /// 成功次数
    pub success_count: u64,
    /// 失败次数
    pub failed_count: u64,
    /// 首次出现
    pub first_seen: Option<DateTime<Local>>,
    /// 最近一次出现
    pub last_seen: Option<DateTime<Local>>,
}

impl ClientRequestStats {
    fn record(&mut self, kind: RequestKind, success: bool, now: DateTime<Local>) {
        self.total_requests += 1;
        match kind {
            RequestKind::Gateway => self.gateway_requests += 1,
            RequestKind::Forward => self.forward_requests += 1,
            RequestKind::Tunnel => self.tunnel_requests += 1,
        }
        if success {
            self.success_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.first_seen.get_or_insert(now);
        self.last_seen = Some(now);
    }
}

/// 统计文件格式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsDocument {
    /// 生成时间
    pub generated_at: DateTime<Local>,
    /// 客户端数量
    pub total_ips: usize,
    /// 所有客户端的请求总数
    pub total_requests: u64,
    /// IP -> 统计
    pub stats: BTreeMap<String, ClientRequestStats>,
}

/// 客户端统计
#[derive(Debug, Default)]
pub struct ClientStatsTracker {
    stats: DashMap<IpAddr, ClientRequestStats>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl ClientStatsTracker {
    /// 仅内存统计
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 关联统计文件，已有文件时载入其中的累计值
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tracker = Self {
            stats: DashMap::new(),
            path: Some(path.clone()),
            dirty: AtomicBool::new(false),
        };

        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tracker),
            Err(e) => {
                return Err(ProxyError::io(format!("读取统计文件失败: {}", path.display()), e));
            }
        };

        match serde_json::from_slice::<StatsDocument>(&content) {
            Ok(document) => {
                for (ip, stats) in document.stats {
                    match ip.parse::<IpAddr>() {
                        Ok(ip) => {
                            tracker.stats.insert(ip, stats);
                        }
                        Err(_) => lwarn!(
                            "system",
                            LogStage::Startup,
                            LogComponent::Statistics,
                            "stats_entry_skipped",
                            "Skipping stats entry with invalid IP",
                            ip = %ip
                        ),
                    }
                }
            }
            // 文件损坏时从零开始，下次保存覆盖
            Err(e) => lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::Statistics,
                "stats_file_invalid",
                "Stats file could not be parsed, starting fresh",
                path = %path.display(),
                error = %e
            ),
        }
        Ok(tracker)
    }

    /// 记录一次请求
    pub fn record(&self, ip: IpAddr, kind: RequestKind, success: bool) {
        self.stats
            .entry(ip)
            .or_default()
            .record(kind, success, Local::now());
        self.dirty.store(true, Ordering::Release);
    }

    /// 某个客户端的累计数据
    #[must_use]
    pub fn get(&self, ip: &IpAddr) -> Option<ClientRequestStats> {
        self.stats.get(ip).map(|entry| entry.value().clone())
    }

    /// 请求数最多的前 `limit` 个客户端
    #[must_use]
    pub fn top_clients(&self, limit: usize) -> Vec<(IpAddr, ClientRequestStats)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| b.1.total_requests.cmp(&a.1.total_requests).then(a.0.cmp(&b.0)));
        all.truncate(limit);
        all
    }

    /// 当前所有数据
    #[must_use]
    pub fn snapshot(&self) -> StatsDocument {
        let stats: BTreeMap<String, ClientRequestStats> = self
            .stats
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();
        StatsDocument {
            generated_at: Local::now(),
            total_ips: stats.len(),
            total_requests: stats.values().map(|s| s.total_requests).sum(),
            stats,
        }
    }

    /// 统计文件路径
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 有新数据时写入文件，返回是否写入
    pub fn save(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let document = self.snapshot();
        if let Err(e) = write_json_atomic(path, &document) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Statistics,
            "stats_saved",
            "Client stats saved",
            path = %path.display(),
            clients = document.total_ips
        );
        Ok(true)
    }
}
