//! 分类客户端
//!
//! [`Oracle`] 负责一次远程调用（文本 -> 原始回答），[`ClassificationClient`]
//! 在其外层施加超时并把回答映射到分类体系。客户端本身不重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::model::{Label, Taxonomy};

/// 单次调用的可恢复错误，由重试策略消费
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("请求被限流{}", .retry_after.map(|d| format!("（建议 {} 秒后重试）", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },
    #[error("请求超时")]
    Timeout,
    #[error("响应无效: {0}")]
    InvalidResponse(String),
    #[error("服务不可用: {0}")]
    Unavailable(String),
}

impl ClientError {
    /// 日志中使用的简短类别名
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::RateLimited { .. } => "rate_limited",
            ClientError::Timeout => "timeout",
            ClientError::InvalidResponse(_) => "invalid_response",
            ClientError::Unavailable(_) => "unavailable",
        }
    }
}

/// 外部分类服务
#[async_trait]
pub trait Oracle: Send + Sync {
    /// 对一条文本发起一次调用，返回原始回答
    async fn ask(&self, text: &str) -> Result<String, ClientError>;

    fn name(&self) -> &str {
        "oracle"
    }
}

/// 带超时与分类体系映射的客户端
#[derive(Clone)]
pub struct ClassificationClient {
    oracle: Arc<dyn Oracle>,
    taxonomy: Arc<Taxonomy>,
    timeout: Duration,
}

impl ClassificationClient {
    pub fn new(oracle: Arc<dyn Oracle>, taxonomy: Arc<Taxonomy>, timeout: Duration) -> Self {
        Self {
            oracle,
            taxonomy,
            timeout,
        }
    }

    /// 单次分类。无法识别的回答是成功的 `Unclassified`，不是错误。
    pub async fn classify(&self, text: &str) -> Result<Label, ClientError> {
        if text.trim().is_empty() {
            return Ok(Label::Unclassified);
        }

        let answer = tokio::time::timeout(self.timeout, self.oracle.ask(text))
            .await
            .map_err(|_| ClientError::Timeout)??;

        let label = self.taxonomy.resolve(&answer);
        if label.is_unclassified() {
            debug!(oracle = self.oracle.name(), answer = %answer, "回答无法映射到分类体系");
        }
        Ok(label)
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for ClassificationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationClient")
            .field("oracle", &self.oracle.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(feature = "reqwest")]
pub use http::HttpOracle;

#[cfg(feature = "reqwest")]
mod http {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use reqwest::header::RETRY_AFTER;
    use reqwest::StatusCode;
    use serde::Deserialize;
    use serde_json::json;
    use tracing::{debug, warn};

    use super::{ClientError, Oracle};
    use crate::model::Taxonomy;
    use crate::util::config::types::OracleConfig;
    use crate::util::http_client::{HttpClient, HttpClientConfig};
    use crate::util::logging::standards::events;

    const DEFAULT_SYSTEM_PROMPT: &str = "You classify a free-text academic speciality into the \
taxonomy below. Reply with exactly one line in the form `Category / Subcategory`, using names \
from the list verbatim. If nothing fits, reply `Unclassified`.";

    const TAXONOMY_PLACEHOLDER: &str = "{taxonomy}";

    #[derive(Debug, Deserialize)]
    struct ChatResponse {
        #[serde(default)]
        choices: Vec<ChatChoice>,
    }

    #[derive(Debug, Deserialize)]
    struct ChatChoice {
        message: ChatMessage,
    }

    #[derive(Debug, Deserialize)]
    struct ChatMessage {
        #[serde(default)]
        content: Option<String>,
    }

    /// OpenAI 兼容的 chat completions 服务
    pub struct HttpOracle {
        http: HttpClient,
        endpoint: String,
        api_key: String,
        model: String,
        temperature: f32,
        system_prompt: String,
    }

    impl HttpOracle {
        pub fn new(config: &OracleConfig, taxonomy: &Taxonomy, timeout: Duration) -> Result<Self> {
            let http = HttpClient::new(HttpClientConfig::from_settings(&config.http, timeout))
                .context("初始化分类服务HTTP客户端失败")?;
            Ok(Self {
                http,
                endpoint: config.endpoint.clone(),
                api_key: config.api_key.clone(),
                model: config.model.clone(),
                temperature: config.temperature,
                system_prompt: build_system_prompt(config.system_prompt.as_deref(), taxonomy),
            })
        }

        fn map_transport_error(err: reqwest::Error) -> ClientError {
            if err.is_timeout() {
                ClientError::Timeout
            } else if err.is_decode() {
                ClientError::InvalidResponse(err.to_string())
            } else {
                ClientError::Unavailable(err.to_string())
            }
        }
    }

    #[async_trait]
    impl Oracle for HttpOracle {
        async fn ask(&self, text: &str) -> Result<String, ClientError> {
            let body = json!({
                "model": self.model,
                "temperature": self.temperature,
                "messages": [
                    { "role": "system", "content": self.system_prompt },
                    { "role": "user", "content": text },
                ],
            });

            let mut request = self.http.reqwest_client().post(&self.endpoint).json(&body);
            if !self.api_key.is_empty() {
                request = request.bearer_auth(&self.api_key);
            }

            let response = request.send().await.map_err(Self::map_transport_error)?;
            let status = response.status();
            debug!(
                event = events::ORACLE_REQUEST,
                model = %self.model,
                status = status.as_u16(),
                chars = text.chars().count(),
            );

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(ClientError::RateLimited { retry_after });
            }
            if status.is_server_error() {
                return Err(ClientError::Unavailable(format!("HTTP {}", status)));
            }
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                let detail: String = detail.chars().take(200).collect();
                warn!(
                    event = events::ORACLE_ERROR,
                    status = status.as_u16(),
                    detail = %detail,
                    "分类服务拒绝请求"
                );
                return Err(ClientError::InvalidResponse(format!("HTTP {}", status)));
            }

            let parsed: ChatResponse = response.json().await.map_err(Self::map_transport_error)?;
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .filter(|content| !content.trim().is_empty())
                .ok_or_else(|| {
                    ClientError::InvalidResponse("响应缺少 choices[0].message.content".to_string())
                })
        }

        fn name(&self) -> &str {
            &self.model
        }
    }

    /// 系统提示词：自定义提示词中的 `{taxonomy}` 会被替换为分类清单，否则追加在末尾
    pub(crate) fn build_system_prompt(custom: Option<&str>, taxonomy: &Taxonomy) -> String {
        let listing = taxonomy.prompt_listing();
        let base = custom
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        if base.contains(TAXONOMY_PLACEHOLDER) {
            base.replace(TAXONOMY_PLACEHOLDER, &listing)
        } else {
            format!("{}\n\nTaxonomy:\n{}", base, listing)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::util::config::types::{CategoryConfig, TaxonomyConfig};

        fn taxonomy() -> Taxonomy {
            Taxonomy::from_config(&TaxonomyConfig {
                categories: vec![CategoryConfig {
                    name: "Engineering".to_string(),
                    subcategories: vec!["Civil".to_string()],
                }],
            })
            .unwrap()
        }

        #[test]
        fn test_system_prompt_lists_taxonomy() {
            let prompt = build_system_prompt(None, &taxonomy());
            assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
            assert!(prompt.ends_with("- Engineering: Civil"));

            let prompt = build_system_prompt(Some("Pick one of:\n{taxonomy}\nThanks"), &taxonomy());
            assert_eq!(prompt, "Pick one of:\n- Engineering: Civil\nThanks");
        }
    }
}
