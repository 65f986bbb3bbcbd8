//! # AI 网关
//!
//! 凭证替换、多密钥故障转移和按日用量记录。

pub mod policy;
pub mod rewrite;
pub mod router;

pub use policy::AttemptVerdict;
pub use router::{GatewayOutcome, GatewayRouter, GatewaySettings};
