use serde::{Deserialize, Serialize};

/// 服务状态
/// `GET /` 返回，描述当前对接的后端和模型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// 固定为 "OK"
    pub status: String,
    /// 服务说明
    pub service: String,
    /// 上游端点
    pub backend: String,
    /// 所有请求被固定到的后端模型
    pub model: String,
    /// 当前版本
    pub version: String,
}

/// 模型信息
/// 与 Anthropic/OpenAI 的模型列表条目格式一致
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    /// 创建时间（Unix 毫秒）
    pub created: i64,
    pub owned_by: String,
}

/// 模型列表
/// `GET /v1/models` 返回，客户端启动时会探测该接口
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

impl ModelList {
    pub fn from_ids(ids: &[String], created: i64) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    object: "model".to_string(),
                    created,
                    owned_by: "anthropic".to_string(),
                })
                .collect(),
        }
    }
}
