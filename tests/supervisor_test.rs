//! supervisor 模块集成测试 - 用 mock relay 后端驱动真实子进程

use edge_stream_agent::config::RelaySettings;
use edge_stream_agent::{MockBridge, NativeBridge, RelayBackend, StreamSupervisor};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn test_settings() -> RelaySettings {
    RelaySettings {
        backend: RelayBackend::Mock,
        settle_ms: 0,
        probe_timeout_ms: 1000,
        probe_attempts: 1,
        grace_period_ms: 2000,
        poll_interval_ms: 100,
        ..RelaySettings::default()
    }
}

fn new_supervisor(bridge: Arc<dyn NativeBridge>) -> (StreamSupervisor, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (
        StreamSupervisor::new(bridge, test_settings(), shutdown_rx),
        shutdown_tx,
    )
}

/// kill -0 检查进程是否存活
fn process_exists(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_start_registers_running_stream() {
    // Given: 空的 supervisor
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));

    // When: 启动一条 stream
    let message = supervisor
        .start("stream_3", 3, "rtmp://media.example.com/live/x")
        .await
        .unwrap();

    // Then: status 恰好包含一条 running 记录
    assert!(message.contains("stream_3"));
    let status = supervisor.status().await;
    assert_eq!(status.len(), 1);
    let entry = &status["stream_3"];
    assert_eq!(entry.cam_id, 3);
    assert!(entry.running);
    assert!(entry.pid.is_some());
    assert_eq!(entry.rtmp_url, "rtmp://media.example.com/live/x");

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_start_twice_replaces_old_process() {
    // Given: 一条已启动的 stream
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));
    supervisor
        .start("stream_3", 3, "rtmp://media.example.com/live/x")
        .await
        .unwrap();
    let old_pid = supervisor.status().await["stream_3"].pid.unwrap();

    // When: 以相同 stream_id 再次启动
    supervisor
        .start("stream_3", 3, "rtmp://media.example.com/live/y")
        .await
        .unwrap();

    // Then: 只有一个 handle，旧进程已被停止
    let status = supervisor.status().await;
    assert_eq!(status.len(), 1);
    let new_pid = status["stream_3"].pid.unwrap();
    assert_ne!(old_pid, new_pid);
    assert!(!process_exists(old_pid));
    assert!(status["stream_3"].rtmp_url.ends_with("/y"));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_stop_terminates_process() {
    // Given: 一条运行中的 stream
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));
    supervisor
        .start("stream_1", 1, "rtmp://media.example.com/live/a")
        .await
        .unwrap();
    let pid = supervisor.status().await["stream_1"].pid.unwrap();

    // When: 停止
    let message = supervisor.stop("stream_1").await.unwrap();

    // Then: handle 移除，进程退出
    assert!(message.contains("stream_1"));
    assert!(supervisor.status().await.is_empty());
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_stop_unknown_stream_is_error() {
    // Given: 一条活跃 stream
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));
    supervisor
        .start("stream_1", 1, "rtmp://media.example.com/live/a")
        .await
        .unwrap();

    // When: 停止不存在的 id
    let result = supervisor.stop("no-such-stream").await;

    // Then: 报错且活跃集不变
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("not found"));
    assert_eq!(supervisor.status().await.len(), 1);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_stop_all_clears_everything() {
    // Given: 三条活跃 stream
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));
    for cam_id in 1..=3 {
        supervisor
            .start(
                &format!("stream_{}", cam_id),
                cam_id,
                "rtmp://media.example.com/live/x",
            )
            .await
            .unwrap();
    }
    assert_eq!(supervisor.status().await.len(), 3);

    // When: stop_all
    supervisor.stop_all().await;

    // Then: 映射为空
    assert!(supervisor.status().await.is_empty());
}

#[tokio::test]
async fn test_invalid_destination_rejected() {
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));

    // 错误 scheme
    let result = supervisor
        .start("stream_1", 1, "http://media.example.com/live/x")
        .await;
    assert!(result.is_err());

    // 缺 host
    let result = supervisor.start("stream_1", 1, "rtmp:///live/x").await;
    assert!(result.is_err());

    // 两次失败都不留下 handle
    assert!(supervisor.status().await.is_empty());
}

#[tokio::test]
async fn test_bridge_enable_failure_aborts_start() {
    // Given: enable 恒失败的 bridge
    let bridge = Arc::new(MockBridge::failing_enable());
    let (supervisor, _shutdown) = new_supervisor(bridge.clone());

    // When: 启动
    let result = supervisor
        .start("stream_1", 1, "rtmp://media.example.com/live/x")
        .await;

    // Then: 报错，无 handle 注册，bridge 确实被调用过
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("enable"));
    assert!(supervisor.status().await.is_empty());
    assert_eq!(bridge.enable_calls(), 1);
}

#[tokio::test]
async fn test_monitor_removes_crashed_stream() {
    // Given: 一条运行中的 stream
    let (supervisor, _shutdown) = new_supervisor(Arc::new(MockBridge::new()));
    supervisor
        .start("stream_9", 9, "rtmp://media.example.com/live/x")
        .await
        .unwrap();
    let pid = supervisor.status().await["stream_9"].pid.unwrap();

    // When: relay 进程在外部被杀死（模拟崩溃）
    Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();

    // Then: monitor 在轮询周期内移除 handle
    let mut removed = false;
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if supervisor.status().await.is_empty() {
            removed = true;
            break;
        }
    }
    assert!(removed, "monitor should remove crashed stream");

    // And: 之后的显式 stop 得到 "not found"，而不是崩溃
    let result = supervisor.stop("stream_9").await;
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("not found"));
}

#[tokio::test]
async fn test_shutdown_signal_stops_monitors_without_killing_process() {
    // Given: 一条运行中的 stream
    let (supervisor, shutdown) = new_supervisor(Arc::new(MockBridge::new()));
    supervisor
        .start("stream_5", 5, "rtmp://media.example.com/live/x")
        .await
        .unwrap();
    let pid = supervisor.status().await["stream_5"].pid.unwrap();

    // When: 广播关闭信号（不调用 stop_all）
    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Then: monitor 退出但进程仍在运行（停止动作只由 stop 路径执行）
    assert!(process_exists(pid));

    // Cleanup
    supervisor.stop_all().await;
    assert!(!process_exists(pid));
}
