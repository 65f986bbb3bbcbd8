//! # 用量统计模块

mod store;

pub use store::{DEFAULT_RETENTION_DAYS, UsageDocument, UsageStore};
