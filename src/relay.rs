//! Relay 命令构建模块 - 固定参数向量
//!
//! relay 与探测命令均以 argv 形式构造并直接 exec，不经过 shell，
//! 目标 URL 只作为单个参数传递。

use serde::{Deserialize, Serialize};
use url::Url;

/// Relay 后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    /// 生产环境：gst-launch-1.0 管线
    GstLaunch,
    /// 测试用：长睡眠替代 relay，探测恒成功
    Mock,
}

impl RelayBackend {
    /// relay 可执行文件名（用于启动前的 PATH 检查）
    pub fn program(&self) -> &'static str {
        match self {
            RelayBackend::GstLaunch => "gst-launch-1.0",
            RelayBackend::Mock => "sleep",
        }
    }
}

/// 构造 relay 子进程命令：本地 RTSP 端点 → 远端 RTMP 目标
pub fn relay_command(
    backend: RelayBackend,
    local_endpoint: &str,
    destination: &Url,
) -> (String, Vec<String>) {
    match backend {
        RelayBackend::GstLaunch => (
            "gst-launch-1.0".to_string(),
            vec![
                "rtspsrc".to_string(),
                format!("location={}", local_endpoint),
                "!".to_string(),
                "decodebin".to_string(),
                "!".to_string(),
                "nvvidconv".to_string(),
                "!".to_string(),
                "nvv4l2h264enc".to_string(),
                "!".to_string(),
                "h264parse".to_string(),
                "!".to_string(),
                "flvmux".to_string(),
                "streamable=true".to_string(),
                "!".to_string(),
                "rtmpsink".to_string(),
                format!("location={}", destination),
            ],
        ),
        RelayBackend::Mock => ("sleep".to_string(), vec!["3600".to_string()]),
    }
}

/// 构造本地端点可用性探测命令（单帧拉流，成功即认为端点就绪）
pub fn probe_command(backend: RelayBackend, local_endpoint: &str) -> (String, Vec<String>) {
    match backend {
        RelayBackend::GstLaunch => (
            "gst-launch-1.0".to_string(),
            vec![
                "rtspsrc".to_string(),
                format!("location={}", local_endpoint),
                "num-buffers=1".to_string(),
                "!".to_string(),
                "fakesink".to_string(),
            ],
        ),
        RelayBackend::Mock => ("true".to_string(), Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_command_argv() {
        let dest = Url::parse("rtmp://media.example.com/live/cam3").unwrap();
        let (program, args) = relay_command(RelayBackend::GstLaunch, "rtsp://127.0.0.1:554/ds-stream", &dest);

        assert_eq!(program, "gst-launch-1.0");
        assert_eq!(args[0], "rtspsrc");
        assert_eq!(args[1], "location=rtsp://127.0.0.1:554/ds-stream");
        assert_eq!(args.last().unwrap(), "location=rtmp://media.example.com/live/cam3");
    }

    #[test]
    fn test_destination_stays_single_argument() {
        // 目标 URL 带空格或引号时仍然是单个 argv 元素
        let dest = Url::parse("rtmp://media.example.com/live/x%20y;rm").unwrap();
        let (_, args) = relay_command(RelayBackend::GstLaunch, "rtsp://127.0.0.1:554/ds-stream", &dest);
        let location = args.last().unwrap();
        assert!(location.starts_with("location=rtmp://"));
        assert_eq!(args.iter().filter(|a| a.starts_with("location=rtmp")).count(), 1);
    }

    #[test]
    fn test_probe_command_single_buffer() {
        let (program, args) = probe_command(RelayBackend::GstLaunch, "rtsp://127.0.0.1:554/ds-stream");
        assert_eq!(program, "gst-launch-1.0");
        assert!(args.contains(&"num-buffers=1".to_string()));
        assert!(args.contains(&"fakesink".to_string()));
    }

    #[test]
    fn test_mock_backend_commands() {
        let dest = Url::parse("rtmp://example/live/x").unwrap();
        let (relay, _) = relay_command(RelayBackend::Mock, "rtsp://127.0.0.1:554/ds-stream", &dest);
        let (probe, probe_args) = probe_command(RelayBackend::Mock, "rtsp://127.0.0.1:554/ds-stream");
        assert_eq!(relay, "sleep");
        assert_eq!(probe, "true");
        assert!(probe_args.is_empty());
    }
}
