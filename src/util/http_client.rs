//! HTTP客户端模块
//!
//! 根据 `oracle.http` 配置构建共享的 reqwest 客户端，支持：
//! - 请求/连接超时
//! - 代理设置
//! - 连接池管理

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "reqwest")]
use reqwest::Client;

use crate::util::config::types::HttpSettings;

/// HTTP客户端配置
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// 请求超时时间
    pub timeout: Duration,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// 每个主机的最大空闲连接数
    pub pool_max_idle_per_host: usize,
    /// HTTP代理URL（可选）
    pub http_proxy: Option<String>,
    /// HTTPS代理URL（可选）
    pub https_proxy: Option<String>,
}

impl HttpClientConfig {
    pub fn from_settings(settings: &HttpSettings, timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout_secs: settings.connect_timeout_secs.max(1),
            user_agent: settings.user_agent.clone(),
            pool_max_idle_per_host: settings.pool_max_idle_per_host,
            http_proxy: settings.http_proxy.clone(),
            https_proxy: settings.https_proxy.clone(),
        }
    }
}

/// HTTP客户端包装器
#[derive(Clone)]
pub struct HttpClient {
    #[cfg(feature = "reqwest")]
    client: Client,
    config: HttpClientConfig,
}

impl HttpClient {
    /// 创建新的HTTP客户端
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        #[cfg(feature = "reqwest")]
        {
            let client = Self::build_reqwest_client(&config)?;
            Ok(Self { client, config })
        }

        #[cfg(not(feature = "reqwest"))]
        {
            warn!("HTTP客户端功能在当前编译配置下未启用");
            Ok(Self { config })
        }
    }

    #[cfg(feature = "reqwest")]
    fn build_reqwest_client(config: &HttpClientConfig) -> Result<Client> {
        let mut client_builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.pool_max_idle_per_host);

        // 配置HTTP代理
        if let Some(proxy_url) = &config.http_proxy {
            if let Ok(proxy) = reqwest::Proxy::http(proxy_url) {
                info!("使用HTTP代理: {}", proxy_url);
                client_builder = client_builder.proxy(proxy);
            } else {
                warn!("HTTP代理配置无效: {}", proxy_url);
            }
        }

        // 配置HTTPS代理
        if let Some(proxy_url) = &config.https_proxy {
            if let Ok(proxy) = reqwest::Proxy::https(proxy_url) {
                info!("使用HTTPS代理: {}", proxy_url);
                client_builder = client_builder.proxy(proxy);
            } else {
                warn!("HTTPS代理配置无效: {}", proxy_url);
            }
        }

        client_builder.build().context("构建HTTP客户端失败")
    }

    /// 底层reqwest客户端
    #[cfg(feature = "reqwest")]
    pub fn reqwest_client(&self) -> &Client {
        &self.client
    }

    /// 检查HTTP客户端是否可用
    pub fn is_available(&self) -> bool {
        cfg!(feature = "reqwest")
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("available", &self.is_available())
            .field("config", &self.config)
            .finish()
    }
}
