#![doc = r#"
# spark-transport-vsock

## 设计动机（Why）
- **定位**：为宿主机（hypervisor）与虚拟机之间的进程提供基于 Linux `AF_VSOCK`
  地址族的字节流连接，接口形态与 TCP 通道一致：建连、监听、接受、读写、半关闭与截止时间；
- **架构角色**：作为传输实现层的一块积木，只负责描述符生命周期与错误分类，
  不定义任何上层协议；
- **设计理念**：描述符从阻塞句柄到反应器句柄的转换是单向的，任意时刻只有一种表示存活；
  并发关闭必须能唤醒挂起中的 `accept`/`read`/`write`。

## 核心契约（What）
- **输入条件**：调用方在启用了 IO 与时间驱动的 Tokio 运行时中使用本实现；
- **输出保障**：所有失败经由一次翻译收敛为 [`VsockError`]，调用方按 [`ErrorKind`]
  区分建连失败、已关闭、超时（唯一的临时错误）、断管与其余 IO 错误；
  流结束不是错误，`read` 返回 `Ok(0)`；
- **资源约束**：建连或监听序列中任一系统调用失败，描述符都会在返回错误前关闭且仅关闭一次；
- **平台约束**：非 Linux 平台保留同一组 API，所有入口统一返回
  `vsock: not implemented on <os>/<arch>`。

## 实现策略（How）
- **系统调用**：套接字创建、绑定、连接、`accept` 与半关闭委托给 `socket2`；
  本机 CID 通过 `/dev/vsock` 的 ioctl `0x7b9` 读取；
- **反应器协作**：非阻塞描述符注册为 Tokio `AsyncFd`，关闭与截止时间经由 `watch`
  通道广播给所有进行中的操作，`tokio::select!` 在就绪、到期与关闭之间择一返回；
- **可测试性**：监听器与连接只依赖内部描述符接口，单元测试注入替身验证提前关闭与错误翻译，
  描述符本身在 Unix 套接字对上验证生命周期。

## 风险与考量（Trade-offs）
- **CID 歧义**：`/dev/vsock` 不存在时 [`local_context_id`] 返回宿主机 CID（2），
  这与“本机不支持 VM 套接字”无法区分；
- **CID 1**：旧内核将其视为保留值，新内核将其作为本机回环，行为取决于内核版本；
- **句柄复制**：[`file_listener`] 复制调用方的句柄，两者共享非阻塞标志；
- **套接字选项**：`with_socket` 借出底层 `socket2::Socket`，`socket2` 因此属于公开依赖。
"#]
#![deny(unsafe_code)]

mod addr;
mod config;
mod context_id;
mod error;
mod poller;

#[cfg(target_os = "linux")]
mod conn;
#[cfg(target_os = "linux")]
mod fd;
#[cfg(target_os = "linux")]
mod listener;
#[cfg(all(test, target_os = "linux"))]
mod testing;
#[cfg(not(target_os = "linux"))]
mod unsupported;

pub use addr::{CID_ANY, CID_HOST, CID_HYPERVISOR, CID_LOCAL, NETWORK, PORT_ANY, VsockAddr};
pub use config::VsockConfig;
pub use context_id::{DEV_VSOCK, IOCTL_GET_LOCAL_CID, local_context_id};
pub use error::{Endpoints, ErrorKind, Op, VsockError};

#[cfg(target_os = "linux")]
pub use conn::{ShutdownDirection, VsockConn};
#[cfg(target_os = "linux")]
pub use listener::{LISTEN_BACKLOG, VsockListener};
#[cfg(not(target_os = "linux"))]
pub use unsupported::{LISTEN_BACKLOG, ShutdownDirection, VsockConn, VsockListener};

/// 连接到 `(context_id, port)` 上的 VSOCK 服务端。
///
/// 从虚拟机连接宿主机进程时使用 [`CID_HOST`]，连接 hypervisor 进程时使用 [`CID_HYPERVISOR`]；
/// 从宿主机连接虚拟机时使用该虚拟机的 CID。
pub fn dial(context_id: u32, port: u32) -> Result<VsockConn, VsockError> {
    VsockConn::dial(context_id, port)
}

/// 在 `(context_id, port)` 上监听；`context_id = 0` 解析为本机 CID（见 [`local_context_id`]），
/// `port = 0` 由内核分配端口，两者都可通过 [`VsockListener::local_addr`] 读回。
pub fn listen(context_id: u32, port: u32) -> Result<VsockListener, VsockError> {
    VsockListener::bind(context_id, port)
}

/// 接管一个已绑定、已处于监听状态的 VSOCK 句柄（例如由 systemd 套接字激活传入）。
///
/// 句柄不是 VSOCK 套接字或未处于监听状态时返回 `listen` 类错误；调用方的句柄保持打开。
#[cfg(unix)]
pub fn file_listener(fd: impl std::os::fd::AsFd) -> Result<VsockListener, VsockError> {
    VsockListener::from_fd(fd)
}
