//! Stream 监管模块 - relay 进程生命周期管理
//!
//! active-set 映射是唯一的共享可变状态，锁只覆盖映射本身的增删改，
//! 不跨越任何子进程等待。显式 stop 与 monitor 崩溃检测的竞争由
//! "先从映射移除者获得所有权" 的约定解决：另一方观察到缺失即退出。

use crate::bridge::NativeBridge;
use crate::config::RelaySettings;
use crate::relay;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

/// 崩溃诊断输出的读取上限
const DIAG_CAP_BYTES: usize = 8192;

/// Stream 生命周期状态
///
/// STARTING 覆盖 enable + spawn 阶段（此时 handle 尚未入表）；
/// CRASHED / STOPPED 都以移除 handle 结束，区别只体现在日志上。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Running,
    Stopping,
}

/// 一条活跃 stream 的运行时记录，由 Supervisor 的映射独占持有
pub struct StreamHandle {
    pub camera_id: i64,
    pub destination_url: Url,
    child: Child,
    pub start_time: DateTime<Utc>,
    pub pid: Option<u32>,
    state: StreamState,
}

/// status 快照中的单条记录
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub cam_id: i64,
    pub rtmp_url: String,
    /// Unix 时间戳（秒）
    pub start_time: f64,
    pub pid: Option<u32>,
    /// 由非阻塞存活检查得出，不信任缓存状态
    pub running: bool,
    /// 运行时长（秒）
    pub uptime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

/// Stream 监管器
pub struct StreamSupervisor {
    streams: Arc<Mutex<HashMap<String, StreamHandle>>>,
    bridge: Arc<dyn NativeBridge>,
    settings: RelaySettings,
    shutdown: watch::Receiver<bool>,
}

impl StreamSupervisor {
    pub fn new(
        bridge: Arc<dyn NativeBridge>,
        settings: RelaySettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            bridge,
            settings,
            shutdown,
        }
    }

    /// 启动 relay：校验目标 → 停掉同名旧 stream → 启用 source →
    /// 等待 settle → 探测本地端点 → spawn relay → 注册 handle + monitor
    pub async fn start(
        &self,
        stream_id: &str,
        camera_id: i64,
        destination_url: &str,
    ) -> Result<String> {
        let destination = validate_destination(destination_url)?;

        // 同名 stream 先停，失败不阻塞新的启动
        let existing = self.streams.lock().await.contains_key(stream_id);
        if existing {
            info!(stream_id, "Stream already active, stopping old process first");
            if let Err(e) = self.stop(stream_id).await {
                warn!(stream_id, error = %e, "Failed to stop previous stream");
            }
        }

        if !self.bridge.enable(camera_id) {
            bail!("Failed to enable video source for camera {}", camera_id);
        }

        // 等待 native pipeline 就绪
        debug!(
            settle_ms = self.settings.settle_ms,
            "Waiting for local relay endpoint"
        );
        sleep(Duration::from_millis(self.settings.settle_ms)).await;

        self.probe_local_endpoint().await?;

        let (program, args) = relay::relay_command(
            self.settings.backend,
            &self.settings.local_endpoint,
            &destination,
        );
        info!(stream_id, program = %program, "Starting relay process");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // relay 进程放入独立进程组，优雅终止信号发给整个组
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn relay process: {}", program))?;
        let pid = child.id();

        let handle = StreamHandle {
            camera_id,
            destination_url: destination,
            child,
            start_time: Utc::now(),
            pid,
            state: StreamState::Running,
        };

        self.streams
            .lock()
            .await
            .insert(stream_id.to_string(), handle);
        self.spawn_monitor(stream_id.to_string());

        info!(stream_id, pid = ?pid, "Stream started successfully");
        Ok(format!("Stream {} started successfully", stream_id))
    }

    /// 停止指定 stream：从映射移除（获得所有权）后执行优雅终止阶梯
    pub async fn stop(&self, stream_id: &str) -> Result<String> {
        let mut handle = {
            let mut streams = self.streams.lock().await;
            streams
                .remove(stream_id)
                .ok_or_else(|| anyhow!("Stream {} not found", stream_id))?
        };
        handle.state = StreamState::Stopping;
        info!(stream_id, pid = ?handle.pid, "Stopping stream");

        self.terminate(&mut handle).await;

        info!(stream_id, state = ?handle.state, "Stream stopped successfully");
        Ok(format!("Stream {} stopped", stream_id))
    }

    /// 停止所有 stream；单条失败只记录，不中断扫尾
    pub async fn stop_all(&self) {
        let stream_ids: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        for stream_id in stream_ids {
            if let Err(e) = self.stop(&stream_id).await {
                // monitor 可能恰好先移除了该 handle，视为已停止
                debug!(stream_id = %stream_id, error = %e, "Stream already gone during sweep");
            }
        }
        info!("All streams stopped");
    }

    /// 点时快照；running 来自非阻塞的 try_wait，cpu/内存为尽力采样
    pub async fn status(&self) -> HashMap<String, StreamStatus> {
        let mut system = System::new_all();
        system.refresh_all();

        let now = Utc::now();
        let mut snapshot = HashMap::new();
        let mut streams = self.streams.lock().await;
        for (stream_id, handle) in streams.iter_mut() {
            let running = matches!(handle.child.try_wait(), Ok(None));
            let process = handle
                .pid
                .and_then(|pid| system.process(Pid::from_u32(pid)));
            snapshot.insert(
                stream_id.clone(),
                StreamStatus {
                    cam_id: handle.camera_id,
                    rtmp_url: handle.destination_url.to_string(),
                    start_time: handle.start_time.timestamp_millis() as f64 / 1000.0,
                    pid: handle.pid,
                    running,
                    uptime: (now - handle.start_time).num_milliseconds() as f64 / 1000.0,
                    cpu_usage: process.map(|p| p.cpu_usage()),
                    memory_mb: process.map(|p| p.memory() / (1024 * 1024)),
                },
            );
        }
        snapshot
    }

    /// 探测本地 relay 端点是否就绪；尝试次数与超时可配置
    async fn probe_local_endpoint(&self) -> Result<()> {
        let (program, args) =
            relay::probe_command(self.settings.backend, &self.settings.local_endpoint);
        let probe_timeout = Duration::from_millis(self.settings.probe_timeout_ms);

        for attempt in 1..=self.settings.probe_attempts.max(1) {
            let spawned = Command::new(&program)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    warn!(attempt, program = %program, error = %e, "Failed to run endpoint probe");
                    continue;
                }
            };

            match timeout(probe_timeout, child.wait()).await {
                Ok(Ok(status)) if status.success() => {
                    debug!(attempt, "Local relay endpoint is ready");
                    return Ok(());
                }
                Ok(Ok(status)) => {
                    warn!(attempt, code = ?status.code(), "Endpoint probe failed");
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Endpoint probe wait failed");
                }
                Err(_) => {
                    warn!(
                        attempt,
                        timeout_ms = self.settings.probe_timeout_ms,
                        "Endpoint probe timed out"
                    );
                    let _ = child.kill().await;
                }
            }
        }

        bail!(
            "Local relay endpoint {} not available",
            self.settings.local_endpoint
        )
    }

    /// 优雅终止阶梯：进程组 SIGTERM → 宽限期 → SIGKILL
    async fn terminate(&self, handle: &mut StreamHandle) {
        #[cfg(unix)]
        if let Some(pid) = handle.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid as NixPid;
            if let Err(e) = killpg(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM delivery failed");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = handle.child.start_kill();
        }

        let grace = Duration::from_millis(self.settings.grace_period_ms);
        match timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(code = ?status.code(), "Relay process exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Waiting for relay process exit failed");
            }
            Err(_) => {
                warn!(
                    grace_ms = self.settings.grace_period_ms,
                    "Grace period elapsed, force-killing relay process"
                );
                #[cfg(unix)]
                if let Some(pid) = handle.pid {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid as NixPid;
                    let _ = killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL);
                }
                if let Err(e) = handle.child.kill().await {
                    warn!(error = %e, "Force kill failed");
                }
            }
        }
    }

    /// 为新 handle 启动 monitor 任务：按固定间隔轮询存活，
    /// 检测到退出时捕获诊断输出并做幂等移除
    fn spawn_monitor(&self, stream_id: String) {
        let streams = Arc::clone(&self.streams);
        let poll_interval = Duration::from_millis(self.settings.poll_interval_ms);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => {
                        // agent 正在关闭；进程由 stop_all 处理，monitor 不动它
                        debug!(stream_id = %stream_id, "Monitor exiting on shutdown");
                        return;
                    }
                    _ = sleep(poll_interval) => {}
                }

                let claimed = {
                    let mut streams = streams.lock().await;
                    match streams.get_mut(&stream_id) {
                        // 已被显式 stop 移除
                        None => return,
                        Some(handle) => match handle.child.try_wait() {
                            Ok(None) => None,
                            Ok(Some(status)) => streams
                                .remove(&stream_id)
                                .map(|handle| (handle, status.code())),
                            Err(e) => {
                                warn!(stream_id = %stream_id, error = %e, "Liveness check failed");
                                streams.remove(&stream_id).map(|handle| (handle, None))
                            }
                        },
                    }
                };

                if let Some((mut handle, exit_code)) = claimed {
                    let diagnostics = read_diagnostics(&mut handle.child).await;
                    warn!(
                        stream_id = %stream_id,
                        exit_code = ?exit_code,
                        diagnostics = %diagnostics,
                        "Relay process exited unexpectedly, stream removed"
                    );
                    return;
                }
            }
        });
    }
}

/// 校验推流目标：必须是 rtmp/rtmps 且带非空 host
pub fn validate_destination(raw: &str) -> Result<Url> {
    let url =
        Url::parse(raw).map_err(|e| anyhow!("Invalid RTMP URL {}: {}", raw, e))?;
    if !matches!(url.scheme(), "rtmp" | "rtmps") {
        bail!("Invalid RTMP URL {}: scheme must be rtmp or rtmps", raw);
    }
    if url.host_str().map_or(true, |host| host.is_empty()) {
        bail!("Invalid RTMP URL {}: missing host", raw);
    }
    Ok(url)
}

/// 尽力读取已退出进程缓冲的 stderr，受上限与短超时约束
async fn read_diagnostics(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = vec![0u8; DIAG_CAP_BYTES];
    match timeout(Duration::from_millis(500), stderr.read(&mut buf)).await {
        Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).trim().to_string(),
        _ => String::new(),
    }
}
