use crate::error::{Error, Result};
use crate::protocol::TranslationOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 协议转换网关的主配置结构
/// 包含服务器、上游后端、代理转发、转换选项等各个模块的配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// 服务器相关配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上游 chat-completion 后端配置
    #[serde(default)]
    pub backend: BackendConfig,
    /// 代理转发配置
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// 协议转换选项
    #[serde(default)]
    pub translation: TranslationOptions,
    /// `GET /v1/models` 对外公布的模型列表
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    /// 是否打印完整的转换前后载荷
    #[serde(default)]
    pub debug: bool,
}

/// 服务器配置
/// 定义HTTP服务器的监听地址、端口和请求体大小限制
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 服务器监听地址，例如 "0.0.0.0" 或 "127.0.0.1"
    pub host: String,
    /// 服务器监听端口，默认为3333
    pub port: u16,
    /// JSON 请求体最大字节数
    pub body_limit: usize,
}

/// 上游后端配置
/// 整个进程只对接一个固定的后端端点和模型
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// 完整的 chat completions 端点，例如 "https://llm.chutes.ai/v1/chat/completions"
    pub api_url: String,
    /// Bearer 认证令牌
    pub api_token: String,
    /// 所有请求都被固定到该模型，忽略客户端请求的模型名
    pub model: String,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &"***")
            .field("model", &self.model)
            .finish()
    }
}

/// 代理配置
/// 用于配置HTTP代理转发的相关参数
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 非流式请求超时时间，流式请求不设整体超时
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// 建立连接的超时时间
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// 每个主机保留的最大空闲连接数
    pub max_connections: usize,
    /// 是否启用TCP Keep-Alive
    pub keep_alive: bool,
    /// 流式转换时单行缓冲区上限（字节）
    pub max_line_bytes: usize,
}

fn default_body_limit() -> usize {
    50 * 1024 * 1024
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

fn default_models() -> Vec<String> {
    vec![
        "claude-3-5-sonnet-20241022".to_string(),
        "claude-3-opus-20240229".to_string(),
        "claude-3-haiku-20240307".to_string(),
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3333,
            body_limit: default_body_limit(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "https://llm.chutes.ai/v1/chat/completions".to_string(),
            api_token: String::new(),
            model: "zai-org/GLM-4.5-Air".to_string(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            connect_timeout: default_connect_timeout(),
            max_connections: 100,
            keep_alive: true,
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for Config {
    /// 默认值
    /// - 服务器：监听 0.0.0.0:3333，请求体上限 50MB
    /// - 后端：Chutes GLM-4.5-Air
    /// - 代理：超时300秒，连接超时10秒，最多100个空闲连接，启用Keep-Alive
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: BackendConfig::default(),
            proxy: ProxyConfig::default(),
            translation: TranslationOptions::default(),
            models: default_models(),
            debug: false,
        }
    }
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// 1. 首先从指定文件加载配置（文件可以不存在，支持YAML、TOML、JSON等格式）
    /// 2. 然后从环境变量覆盖配置（前缀为BRIDGE，分隔符为__）
    ///    例如：BRIDGE__SERVER__PORT=4000 会覆盖 server.port
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("BRIDGE").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
