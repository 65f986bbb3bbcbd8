//! # 代理核心
//!
//! 单端口接入，按请求头分类后走 CONNECT 隧道、普通 HTTP 转发或 AI 网关。

pub mod classifier;
pub mod connection;
pub mod forwarder;
pub mod http;
pub mod server;
pub mod state;
pub mod tunnel;
pub mod upstream;

pub use classifier::{Classified, RequestClassifier, Route};
pub use connection::{ConnectionContext, handle_connection};
pub use server::{ConnectionLimit, ProxyServer};
pub use state::{ProxyServices, ProxyState};
pub use tunnel::{PumpOutcome, PumpStats};
pub use upstream::{GatewayUpstream, ReqwestUpstream, UpstreamRequest, UpstreamResponse};
