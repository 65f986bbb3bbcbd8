//! # 客户端请求统计

mod client_stats;

pub use client_stats::{ClientRequestStats, ClientStatsTracker, RequestKind, StatsDocument};
