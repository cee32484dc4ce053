//! 命令分发模块 - 解码、校验、路由入站命令
//!
//! 单条命令的任何失败都在这一层收敛为失败响应，绝不让 agent 进程退出。

use crate::bridge::NativeBridge;
use crate::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::supervisor::StreamSupervisor;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{error, info};

/// 命令分发器
pub struct CommandDispatcher {
    agent_id: String,
    supervisor: Arc<StreamSupervisor>,
    bridge: Arc<dyn NativeBridge>,
}

impl CommandDispatcher {
    pub fn new(
        agent_id: String,
        supervisor: Arc<StreamSupervisor>,
        bridge: Arc<dyn NativeBridge>,
    ) -> Self {
        Self {
            agent_id,
            supervisor,
            bridge,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// 处理一条原始消息
    ///
    /// 返回 None 表示命令发给了别的 agent，静默忽略（共享队列上的
    /// 多租户过滤，不发布响应）。解析失败的响应不带 command_id。
    pub async fn handle(&self, raw: &[u8]) -> Option<ResponseEnvelope> {
        let envelope: CommandEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Invalid JSON command received");
                return Some(ResponseEnvelope::failure(
                    &self.agent_id,
                    "Invalid JSON format",
                    None,
                ));
            }
        };

        if let Some(target) = &envelope.jetson_id {
            if target != &self.agent_id {
                info!(target = %target, agent_id = %self.agent_id, "Command for another agent, ignoring");
                return None;
            }
        }

        info!(command = %envelope.command, command_id = ?envelope.command_id, "Processing command");
        let command_id = envelope.command_id.clone();

        Some(match self.dispatch(&envelope).await {
            Ok(message) => ResponseEnvelope::ok(&self.agent_id, message, command_id),
            Err(e) => {
                error!(command = %envelope.command, error = %e, "Command failed");
                ResponseEnvelope::failure(&self.agent_id, e.to_string(), command_id)
            }
        })
    }

    async fn dispatch(&self, envelope: &CommandEnvelope) -> Result<String> {
        match envelope.command.as_str() {
            "start_stream" => {
                let (Some(cam_id), Some(rtmp_server_url)) =
                    (envelope.cam_id, envelope.rtmp_server_url.as_deref())
                else {
                    return Err(anyhow!("Missing cam_id or rtmp_server_url"));
                };
                let stream_id = envelope
                    .stream_id
                    .clone()
                    .unwrap_or_else(|| format!("stream_{}", cam_id));
                self.supervisor
                    .start(&stream_id, cam_id, rtmp_server_url)
                    .await
            }
            "stop_stream" => {
                let stream_id = envelope
                    .resolved_stream_id()
                    .ok_or_else(|| anyhow!("Missing stream_id"))?;
                self.supervisor.stop(&stream_id).await
            }
            "stop_all_streams" => {
                self.supervisor.stop_all().await;
                Ok("All streams stopped".to_string())
            }
            "get_status" => {
                let snapshot = self.supervisor.status().await;
                Ok(serde_json::to_string(&snapshot)?)
            }
            "enable_source" => {
                let cam_id = envelope.cam_id.ok_or_else(|| anyhow!("Missing cam_id"))?;
                if self.bridge.enable(cam_id) {
                    Ok(format!("Video source enabled for camera {}", cam_id))
                } else {
                    Err(anyhow!("Failed to enable video source for camera {}", cam_id))
                }
            }
            "disable_source" => {
                if self.bridge.disable() {
                    Ok("Video source disabled".to_string())
                } else {
                    Err(anyhow!("Failed to disable video source"))
                }
            }
            other => Err(anyhow!("Unknown command: {}", other)),
        }
    }
}
