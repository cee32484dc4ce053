//! Native bridge 模块 - 视频管线控制接口
//!
//! 底层如何到达 native 管线（动态库、RPC、辅助进程）对 Supervisor 透明，
//! 只暴露 enable/disable 两个同步操作。失败以返回值报告，不向上抛出。

use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

/// 视频管线控制接口
pub trait NativeBridge: Send + Sync {
    /// 为指定摄像头启用本地视频 source，返回是否成功
    fn enable(&self, camera_id: i64) -> bool;

    /// 关闭本地视频 source，返回是否成功
    fn disable(&self) -> bool;
}

/// 通过外部控制程序操作管线的 bridge
///
/// 调用约定：`<program> enable <cam_id>` / `<program> disable`，
/// 退出码 0 表示成功。
pub struct CliBridge {
    program: String,
}

impl CliBridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> bool {
        match Command::new(&self.program).args(args).status() {
            Ok(status) => status.success(),
            Err(e) => {
                error!(program = %self.program, error = %e, "Failed to run bridge control program");
                false
            }
        }
    }
}

impl NativeBridge for CliBridge {
    fn enable(&self, camera_id: i64) -> bool {
        let ok = self.run(&["enable".to_string(), camera_id.to_string()]);
        if ok {
            info!(camera_id, "Video source enabled");
        } else {
            error!(camera_id, "Failed to enable video source");
        }
        ok
    }

    fn disable(&self) -> bool {
        let ok = self.run(&["disable".to_string()]);
        if ok {
            info!("Video source disabled");
        } else {
            error!("Failed to disable video source");
        }
        ok
    }
}

/// 测试用 bridge：记录调用次数，可配置失败
pub struct MockBridge {
    fail_enable: bool,
    fail_disable: bool,
    enable_calls: AtomicUsize,
    disable_calls: AtomicUsize,
}

impl MockBridge {
    pub fn new() -> Self {
        Self {
            fail_enable: false,
            fail_disable: false,
            enable_calls: AtomicUsize::new(0),
            disable_calls: AtomicUsize::new(0),
        }
    }

    /// enable 恒失败的 bridge
    pub fn failing_enable() -> Self {
        Self {
            fail_enable: true,
            ..Self::new()
        }
    }

    /// disable 恒失败的 bridge
    pub fn failing_disable() -> Self {
        Self {
            fail_disable: true,
            ..Self::new()
        }
    }

    pub fn enable_calls(&self) -> usize {
        self.enable_calls.load(Ordering::SeqCst)
    }

    pub fn disable_calls(&self) -> usize {
        self.disable_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBridge for MockBridge {
    fn enable(&self, _camera_id: i64) -> bool {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        !self.fail_enable
    }

    fn disable(&self) -> bool {
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        !self.fail_disable
    }
}
