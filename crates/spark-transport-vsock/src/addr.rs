use std::fmt;

/// 保留给 Hypervisor 进程的 CID。
pub const CID_HYPERVISOR: u32 = 0x0;

/// 保留 CID：旧内核视其为不可用，新内核将其作为本机回环（`VMADDR_CID_LOCAL`）。
pub const CID_LOCAL: u32 = 0x1;

/// 宿主机上除 Hypervisor 之外的进程所使用的 CID。
pub const CID_HOST: u32 = 0x2;

/// 绑定时匹配任意 CID（`VMADDR_CID_ANY`）。
pub const CID_ANY: u32 = u32::MAX;

/// 绑定时由内核分配端口（`VMADDR_PORT_ANY`）。
pub const PORT_ANY: u32 = u32::MAX;

/// 网络名称，与 `Display` 前缀及错误文案保持一致。
pub const NETWORK: &str = "vsock";

/// VM 套接字端点地址：`(context_id, port)` 二元组。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以不可变值类型承载 `sockaddr_vm` 中唯一有意义的两个字段，供监听器、连接与错误上下文共享；
/// - 通过稳定的 `Display` 直接表达端点角色（hypervisor/reserved/host/vm），日志无需再查表。
///
/// ## 契约（What）
/// - 相等性为结构相等；`Copy` 语义，传递无需克隆；
/// - `Display` 格式固定为 `"<role>(<cid>):<port>"`，角色映射：`0 → hypervisor`、`1 → reserved`、
///   `2 → host`、其余 → `vm`；
/// - **后置条件**：地址一旦构造即不可修改。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VsockAddr {
    context_id: u32,
    port: u32,
}

impl VsockAddr {
    /// 构造地址。
    pub const fn new(context_id: u32, port: u32) -> Self {
        Self { context_id, port }
    }

    /// 上下文标识。
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }

    /// 端口号。
    pub const fn port(&self) -> u32 {
        self.port
    }

    /// 返回网络名称 `"vsock"`。
    pub const fn network(&self) -> &'static str {
        NETWORK
    }

    /// 端点角色名称，决定 `Display` 的前缀。
    pub const fn role(&self) -> &'static str {
        match self.context_id {
            CID_HYPERVISOR => "hypervisor",
            CID_LOCAL => "reserved",
            CID_HOST => "host",
            _ => "vm",
        }
    }

    /// 描述符的调试名称，形如 `vsock:host(2):1024`。
    pub fn file_name(&self) -> String {
        format!("{}:{}", NETWORK, self)
    }
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}):{}", self.role(), self.context_id, self.port)
    }
}

#[cfg(target_os = "linux")]
impl From<VsockAddr> for socket2::SockAddr {
    fn from(addr: VsockAddr) -> Self {
        socket2::SockAddr::vsock(addr.context_id, addr.port)
    }
}

#[cfg(target_os = "linux")]
impl VsockAddr {
    /// 从内核返回的 `SockAddr` 中提取 VSOCK 地址；族不匹配时返回 `None`。
    pub(crate) fn from_sock_addr(addr: &socket2::SockAddr) -> Option<Self> {
        addr.as_vsock_address()
            .map(|(context_id, port)| Self::new(context_id, port))
    }
}
