use crate::poller::PollerCapabilities;

/// VSOCK 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“轮询器是否具备截止时间能力”显式配置化：运行时若未启用时间驱动，
///   截止时间设置应返回 `Unsupported`，而不是在等待时 panic 或静默失效；
/// - 为后续扩展更多套接字行为预留统一入口，调用方无需直接操作 `socket2`。
///
/// ## 体系定位（Architecture）
/// - `VsockListener::bind_with_config`、`VsockConn::dial_with_config` 与
///   `VsockListener::from_fd_with_config` 读取该配置；
/// - 监听器接受的新连接继承监听器自身的配置。
///
/// ## 契约（What）
/// - `with_deadlines`：默认 `true`；关闭后三类截止时间设置均返回 `Unsupported`；
/// - **后置条件**：配置在描述符完成非阻塞转换时固化，之后修改不影响已创建的描述符。
#[derive(Clone, Debug)]
pub struct VsockConfig {
    deadlines: bool,
}

impl VsockConfig {
    /// 创建默认配置，等价于 `deadlines = true`。
    pub const fn new() -> Self {
        Self { deadlines: true }
    }

    /// 声明轮询器是否支持按描述符的截止时间。
    pub fn with_deadlines(mut self, enabled: bool) -> Self {
        self.deadlines = enabled;
        self
    }

    /// 当前是否启用截止时间能力。
    pub fn deadlines(&self) -> bool {
        self.deadlines
    }

    pub(crate) fn capabilities(&self) -> PollerCapabilities {
        PollerCapabilities {
            deadlines: self.deadlines,
        }
    }
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self::new()
    }
}
