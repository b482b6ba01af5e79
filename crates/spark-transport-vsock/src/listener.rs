use crate::addr::{CID_HYPERVISOR, PORT_ANY, VsockAddr};
use crate::config::VsockConfig;
use crate::conn::VsockConn;
use crate::context_id::local_context_id;
use crate::error::{Op, VsockError, closed_io_error, op_error};
use crate::fd::{ListenFd, SysFd, early_close};
use socket2::Socket;
use std::fmt;
use std::io;
use std::os::fd::AsFd;
use std::time::Instant;

/// `listen(2)` 的积压队列长度，取内核上限 `SOMAXCONN`。
pub const LISTEN_BACKLOG: i32 = nix::libc::SOMAXCONN;

/// 面向 AF_VSOCK 的监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 在宿主机或虚拟机上监听指定端口，接受对端发起的字节流连接；
/// - 以 `&self` 暴露 `accept` 与 `close`，一个任务阻塞在 `accept` 时，另一个任务可以关闭监听器。
///
/// ## 逻辑（How）
/// - `bind` 依次执行 `socket → bind → listen → getsockname → 非阻塞转换`，
///   任一步失败立即关闭描述符，再把错误翻译为 `listen` 类错误；
/// - CID `0`（[`CID_HYPERVISOR`]）表示“本机”，绑定前经 [`local_context_id`] 解析为本机实际 CID；
/// - 端口 `0` 在绑定前替换为 [`PORT_ANY`]，由内核分配端口，实际端口从 `getsockname` 读回；
/// - `accept` 返回的新连接以监听地址为本地地址，并继承监听器的 [`VsockConfig`]。
///
/// ## 契约（What）
/// - `close` 只影响监听器本身，已经接受的连接不受影响；
/// - `set_deadline(None)` 取消截止时间；已过去的时刻使下一次 `accept` 立即超时；
/// - **前置条件**：需要在 Tokio 运行时上下文中创建并使用。
pub struct VsockListener {
    fd: Box<dyn ListenFd>,
    addr: VsockAddr,
    config: VsockConfig,
}

impl VsockListener {
    /// 使用默认配置在 `(context_id, port)` 上监听；`context_id = 0` 表示本机，
    /// `port = 0` 表示由内核分配。
    pub fn bind(context_id: u32, port: u32) -> Result<Self, VsockError> {
        Self::bind_with_config(context_id, port, VsockConfig::default())
    }

    pub fn bind_with_config(
        context_id: u32,
        port: u32,
        config: VsockConfig,
    ) -> Result<Self, VsockError> {
        let fd = SysFd::vsock().map_err(|err| op_error(Op::Listen, err, None, None))?;
        Self::bind_on(Box::new(fd), context_id, port, config, local_context_id)
    }

    /// 在给定描述符上执行监听序列；`resolve_local` 在 `context_id = 0` 时给出本机 CID。
    ///
    /// 错误中的本地地址使用解析后的 CID 与调用方传入的端口。
    pub(crate) fn bind_on(
        mut fd: Box<dyn ListenFd>,
        context_id: u32,
        port: u32,
        config: VsockConfig,
        resolve_local: impl FnOnce() -> Result<u32, VsockError>,
    ) -> Result<Self, VsockError> {
        let context_id = if context_id == CID_HYPERVISOR {
            match resolve_local() {
                Ok(cid) => cid,
                Err(err) => {
                    early_close(Op::Listen, fd.close());
                    let local = VsockAddr::new(context_id, port);
                    return Err(op_error(Op::Listen, err.into(), Some(local), None));
                }
            }
        } else {
            context_id
        };
        let reported = VsockAddr::new(context_id, port);
        let requested = VsockAddr::new(context_id, if port == 0 { PORT_ANY } else { port });
        match establish(&mut *fd, requested, &config) {
            Ok(addr) => {
                tracing::debug!(local = %addr, "vsock listener bound");
                Ok(Self { fd, addr, config })
            }
            Err(err) => {
                early_close(Op::Listen, fd.close());
                Err(op_error(Op::Listen, err, Some(reported), None))
            }
        }
    }

    /// 接管一个已经绑定并处于监听状态的 VSOCK 句柄。
    ///
    /// 调用方的句柄不会被关闭；内部持有的是它的复制品。
    pub fn from_fd(fd: impl AsFd) -> Result<Self, VsockError> {
        Self::from_fd_with_config(fd, VsockConfig::default())
    }

    pub fn from_fd_with_config(fd: impl AsFd, config: VsockConfig) -> Result<Self, VsockError> {
        let fd = SysFd::adopt_listener(fd.as_fd())
            .map_err(|err| op_error(Op::Listen, err, None, None))?;
        Self::adopt(Box::new(fd), config)
    }

    pub(crate) fn adopt(
        mut fd: Box<dyn ListenFd>,
        config: VsockConfig,
    ) -> Result<Self, VsockError> {
        let adopted = fd.local_addr().and_then(|addr| {
            fd.set_nonblocking(&addr.file_name(), config.capabilities())?;
            Ok(addr)
        });
        match adopted {
            Ok(addr) => {
                tracing::debug!(local = %addr, "vsock listener adopted from file descriptor");
                Ok(Self { fd, addr, config })
            }
            Err(err) => {
                early_close(Op::Listen, fd.close());
                Err(op_error(Op::Listen, err, None, None))
            }
        }
    }

    /// 等待下一条入站连接，返回连接及对端地址。
    pub async fn accept(&self) -> Result<(VsockConn, VsockAddr), VsockError> {
        let (fd, peer) = self
            .fd
            .accept()
            .await
            .map_err(|err| op_error(Op::Accept, err, Some(self.addr), None))?;
        tracing::debug!(local = %self.addr, peer = %peer, "vsock connection accepted");
        let conn = VsockConn::from_parts(fd, self.addr, peer, self.config.clone());
        Ok((conn, peer))
    }

    /// 停止监听并唤醒挂起的 `accept`。
    pub fn close(&self) -> Result<(), VsockError> {
        self.fd
            .close()
            .map_err(|err| op_error(Op::Close, err, Some(self.addr), None))?;
        tracing::debug!(local = %self.addr, "vsock listener closed");
        Ok(())
    }

    /// 设置 `accept` 的截止时间；`None` 表示取消。
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.fd
            .set_deadline(deadline)
            .map_err(|err| op_error(Op::Set, err, Some(self.addr), None))
    }

    /// 借出底层监听套接字以读写套接字选项；语义同 [`VsockConn::with_socket`]。
    pub fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> R) -> Result<R, VsockError> {
        let mut f = Some(f);
        let mut out = None;
        self.fd
            .with_socket(&mut |socket| out = f.take().map(|f| f(socket)))
            .map_err(|err| op_error(Op::Set, err, Some(self.addr), None))?;
        out.ok_or_else(|| op_error(Op::Set, closed_io_error(), Some(self.addr), None))
    }

    /// 监听地址，端口为内核实际分配的值。
    pub fn local_addr(&self) -> VsockAddr {
        self.addr
    }

    pub fn config(&self) -> &VsockConfig {
        &self.config
    }
}

impl fmt::Debug for VsockListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsockListener")
            .field("addr", &self.addr)
            .finish()
    }
}

fn establish(
    fd: &mut dyn ListenFd,
    requested: VsockAddr,
    config: &VsockConfig,
) -> io::Result<VsockAddr> {
    fd.bind(requested)?;
    fd.listen(LISTEN_BACKLOG)?;
    let addr = fd.local_addr()?;
    fd.set_nonblocking(&addr.file_name(), config.capabilities())?;
    Ok(addr)
}
