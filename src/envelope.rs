//! 消息信封模块 - 命令与响应的线格式
//!
//! 字段名由外部契约固定（`jetson_id`、`cam_id`、`rtmp_server_url` 等），
//! 与服务端的生产者保持一致，不可重命名。

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 入站命令信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// 目标 agent 标识；缺省表示广播给所有 agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jetson_id: Option<String>,
    /// 命令标签
    pub command: String,
    /// 摄像头编号
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cam_id: Option<i64>,
    /// RTMP 推流目标地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtmp_server_url: Option<String>,
    /// 关联 token，响应中原样返回
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// Stream 标识；缺省时由 cam_id 推导
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl CommandEnvelope {
    /// 解析 stream_id：显式指定优先，否则由 cam_id 推导为 `stream_{cam_id}`
    pub fn resolved_stream_id(&self) -> Option<String> {
        self.stream_id
            .clone()
            .or_else(|| self.cam_id.map(|cam_id| format!("stream_{}", cam_id)))
    }
}

/// 出站响应信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// 本机 agent 标识
    pub jetson_id: String,
    /// 命令是否成功
    pub success: bool,
    /// 人类可读消息，或 JSON 编码的负载（如 get_status 的快照）
    pub message: String,
    /// Unix 时间戳（秒，浮点）
    pub timestamp: f64,
    /// 回显入站的关联 token；入站消息无法解析时省略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl ResponseEnvelope {
    /// 成功响应
    pub fn ok(agent_id: &str, message: impl Into<String>, command_id: Option<String>) -> Self {
        Self::new(agent_id, true, message, command_id)
    }

    /// 失败响应
    pub fn failure(agent_id: &str, message: impl Into<String>, command_id: Option<String>) -> Self {
        Self::new(agent_id, false, message, command_id)
    }

    fn new(
        agent_id: &str,
        success: bool,
        message: impl Into<String>,
        command_id: Option<String>,
    ) -> Self {
        Self {
            jetson_id: agent_id.to_string(),
            success,
            message: message.into(),
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            command_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_envelope() {
        let raw = r#"{"jetson_id":"jetson01","command":"start_stream","cam_id":3,"rtmp_server_url":"rtmp://example/live/x","command_id":"c1"}"#;
        let envelope: CommandEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.jetson_id.as_deref(), Some("jetson01"));
        assert_eq!(envelope.command, "start_stream");
        assert_eq!(envelope.cam_id, Some(3));
        assert_eq!(envelope.command_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_stream_id_derived_from_cam_id() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"command":"stop_stream","cam_id":3}"#).unwrap();
        assert_eq!(envelope.resolved_stream_id(), Some("stream_3".to_string()));
    }

    #[test]
    fn test_explicit_stream_id_wins() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"command":"stop_stream","cam_id":3,"stream_id":"front-door"}"#)
                .unwrap();
        assert_eq!(envelope.resolved_stream_id(), Some("front-door".to_string()));
    }

    #[test]
    fn test_stream_id_absent_without_cam_id() {
        let envelope: CommandEnvelope =
            serde_json::from_str(r#"{"command":"stop_stream"}"#).unwrap();
        assert_eq!(envelope.resolved_stream_id(), None);
    }

    #[test]
    fn test_response_omits_missing_command_id() {
        let response = ResponseEnvelope::failure("jetson01", "Invalid JSON format", None);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("command_id"));
        assert!(json.contains("\"success\":false"));
    }

    #[test]
    fn test_response_echoes_command_id() {
        let response = ResponseEnvelope::ok("jetson01", "ok", Some("c1".to_string()));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"command_id\":\"c1\""));
        assert!(response.timestamp > 0.0);
    }
}
