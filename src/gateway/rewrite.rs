//! # 网关请求改写
//!
//! 去掉客户端带来的凭证，注入选中密钥，把路径和请求体里的模型名换成密钥配置的模型，
//! 再拼到上游地址上。

use std::borrow::Cow;
use std::sync::LazyLock;

use bytes::Bytes;
use regex::Regex;
use url::Url;

use crate::config::ApiKeyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::http::{HOP_BY_HOP_HEADERS, RequestHead};
use crate::proxy::upstream::UpstreamRequest;

/// 凭证所在的查询参数
pub const KEY_QUERY_PARAM: &str = "key";

/// 客户端可能携带凭证的请求头
const CREDENTIAL_HEADERS: &[&str] = &["x-goog-api-key", "authorization"];

/// 由 reqwest 重新生成的请求头
const REGENERATED_HEADERS: &[&str] = &["host", "content-length", "expect"];

static MODEL_IN_PATH: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"models/[^:/]+:").ok());

/// 把路径中的 `models/<任意>:` 换成 `models/<model>:`
#[must_use]
pub fn replace_model_in_path<'a>(path: &'a str, model: &str) -> Cow<'a, str> {
    match MODEL_IN_PATH.as_ref() {
        Some(re) if !model.is_empty() => re.replace_all(path, regex::NoExpand(&format!("models/{model}:"))),
        _ => Cow::Borrowed(path),
    }
}

/// 请求体是 JSON 对象且顶层有字符串 `model` 字段时替换它，其余情况原样返回
#[must_use]
pub fn replace_model_in_body(body: &Bytes, model: &str) -> Bytes {
    if model.is_empty() || body.is_empty() {
        return body.clone();
    }
    let Ok(serde_json::Value::Object(mut object)) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.clone();
    };
    let Some(serde_json::Value::String(current)) = object.get("model") else {
        return body.clone();
    };

    // 保持 `models/` 前缀的写法
    let replacement = if current.starts_with("models/") {
        format!("models/{model}")
    } else {
        model.to_string()
    };
    if *current == replacement {
        return body.clone();
    }
    object.insert("model".to_string(), serde_json::Value::String(replacement));
    serde_json::to_vec(&object).map_or_else(|_| body.clone(), Bytes::from)
}

/// 去掉 `key` 参数后注入真实密钥
#[must_use]
pub fn inject_key_into_query(query: Option<&str>, api_key: &str) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    if let Some(query) = query {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if name != KEY_QUERY_PARAM {
                serializer.append_pair(&name, &value);
            }
        }
    }
    serializer.append_pair(KEY_QUERY_PARAM, api_key);
    serializer.finish()
}

/// 上游地址 + 改写后的路径和查询串
pub fn build_upstream_url(base: &str, path_and_query: &str, key: &ApiKeyConfig) -> Result<String> {
    let parsed = Url::parse(base)
        .map_err(|e| ProxyError::config_with_source(format!("上游地址无效: {base}"), e))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ProxyError::config(format!("上游地址无效: {base}")));
    }

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let path = replace_model_in_path(path, &key.model);
    let query = inject_key_into_query(query, &key.api_key);

    Ok(format!("{}{}?{}", base.trim_end_matches('/'), path, query))
}

/// 需要透传给上游的请求头
#[must_use]
pub fn forwardable_headers(head: &RequestHead) -> Vec<(String, String)> {
    head.headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !HOP_BY_HOP_HEADERS.contains(&name.as_str())
                && !CREDENTIAL_HEADERS.contains(&name.as_str())
                && !REGENERATED_HEADERS.contains(&name.as_str())
        })
        .cloned()
        .collect()
}

/// 组装一次上游请求
pub fn build_upstream_request(
    head: &RequestHead,
    path_and_query: &str,
    body: &Bytes,
    key: &ApiKeyConfig,
    default_base: &str,
) -> Result<UpstreamRequest> {
    let base = key.api_base.as_deref().filter(|b| !b.is_empty()).unwrap_or(default_base);
    Ok(UpstreamRequest {
        method: head.method.clone(),
        url: build_upstream_url(base, path_and_query, key)?,
        headers: forwardable_headers(head),
        body: replace_model_in_body(body, &key.model),
    })
}
