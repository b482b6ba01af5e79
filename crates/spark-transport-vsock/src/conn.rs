use crate::addr::VsockAddr;
use crate::config::VsockConfig;
use crate::error::{Op, Translated, VsockError, closed_io_error, op_error, translate};
use crate::fd::{ConnFd, SysFd, early_close};
use crate::poller::DeadlineTarget;
use socket2::Socket;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Instant;

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    /// 关闭读方向，对端后续写入收到断管。
    Read,
    /// 关闭写方向，对端读完缓冲数据后得到流结束。
    Write,
    /// 同时关闭两个方向，但不释放描述符。
    Both,
}

impl From<ShutdownDirection> for Shutdown {
    fn from(direction: ShutdownDirection) -> Self {
        match direction {
            ShutdownDirection::Read => Shutdown::Read,
            ShutdownDirection::Write => Shutdown::Write,
            ShutdownDirection::Both => Shutdown::Both,
        }
    }
}

/// 基于 AF_VSOCK 的字节流连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为宿主机与虚拟机之间的进程提供与 TCP 连接一致的读写、半关闭与截止时间语义；
/// - 连接句柄可廉价克隆，一个任务阻塞读取时，另一个任务可以关闭它或调整截止时间。
///
/// ## 逻辑（How）
/// - 内部以 `Arc` 共享描述符与端点地址；所有错误在此处经一次翻译转为 [`VsockError`]；
/// - 建连序列 `connect → getsockname → 非阻塞转换` 任一步失败都会先关闭描述符再返回。
///
/// ## 契约（What）
/// - `read` 返回 `Ok(0)` 表示流结束（对端关闭写方向或连接已不再可读）；
/// - 本端 `close_write` 或对端 `close_read` 之后，`write` 返回 [`crate::ErrorKind::BrokenPipe`]；
/// - 截止时间为 `None` 时表示不设上限；已经过去的时刻使下一次读写立即超时；
/// - **前置条件**：需要在 Tokio 运行时上下文中建连与读写。
#[derive(Clone)]
pub struct VsockConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    fd: Box<dyn ConnFd>,
    local: VsockAddr,
    remote: VsockAddr,
    config: VsockConfig,
}

impl VsockConn {
    /// 使用默认配置连接到 `(context_id, port)`。
    pub fn dial(context_id: u32, port: u32) -> Result<Self, VsockError> {
        Self::dial_with_config(context_id, port, VsockConfig::default())
    }

    /// 使用自定义配置连接到 `(context_id, port)`；端口按字面使用。
    pub fn dial_with_config(
        context_id: u32,
        port: u32,
        config: VsockConfig,
    ) -> Result<Self, VsockError> {
        let remote = VsockAddr::new(context_id, port);
        let fd = SysFd::vsock().map_err(|err| op_error(Op::Dial, err, None, Some(remote)))?;
        Self::dial_on(Box::new(fd), remote, config)
    }

    /// 在给定描述符上执行建连序列。
    pub(crate) fn dial_on(
        mut fd: Box<dyn ConnFd>,
        remote: VsockAddr,
        config: VsockConfig,
    ) -> Result<Self, VsockError> {
        match establish(&mut *fd, remote, &config) {
            Ok(local) => {
                tracing::debug!(local = %local, peer = %remote, "vsock connection established");
                Ok(Self::from_parts(fd, local, remote, config))
            }
            Err(err) => {
                early_close(Op::Dial, fd.close());
                Err(op_error(Op::Dial, err, None, Some(remote)))
            }
        }
    }

    pub(crate) fn from_parts(
        fd: Box<dyn ConnFd>,
        local: VsockAddr,
        remote: VsockAddr,
        config: VsockConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                fd,
                local,
                remote,
                config,
            }),
        }
    }

    /// 读取数据；`Ok(0)` 表示流结束。
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, VsockError> {
        let err = match self.inner.fd.read(buf).await {
            Ok(n) => return Ok(n),
            Err(err) => err,
        };
        match translate(
            Op::Read,
            err,
            Some(self.inner.local),
            Some(self.inner.remote),
        ) {
            Translated::EndOfStream => Ok(0),
            Translated::Error(error) => Err(error),
        }
    }

    /// 写入数据，返回本次写入的字节数，可能小于 `buf.len()`。
    pub async fn write(&self, buf: &[u8]) -> Result<usize, VsockError> {
        self.inner
            .fd
            .write(buf)
            .await
            .map_err(|err| self.error(Op::Write, err))
    }

    /// 循环写入直到 `buf` 全部送出。
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), VsockError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(self.error(Op::Write, io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// 关闭读方向。
    pub fn close_read(&self) -> Result<(), VsockError> {
        self.shutdown(ShutdownDirection::Read)
    }

    /// 关闭写方向。
    pub fn close_write(&self) -> Result<(), VsockError> {
        self.shutdown(ShutdownDirection::Write)
    }

    /// 半关闭；描述符保持打开，仍需调用 [`VsockConn::close`] 释放。
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<(), VsockError> {
        self.inner
            .fd
            .shutdown(direction.into())
            .map_err(|err| self.error(Op::Close, err))
    }

    /// 关闭连接并唤醒所有挂起的读写。
    pub fn close(&self) -> Result<(), VsockError> {
        self.inner
            .fd
            .close()
            .map_err(|err| self.error(Op::Close, err))?;
        tracing::debug!(
            local = %self.inner.local,
            peer = %self.inner.remote,
            "vsock connection closed"
        );
        Ok(())
    }

    /// 同时设置读写截止时间；`None` 表示取消。
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.set(DeadlineTarget::Both, deadline)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.set(DeadlineTarget::Read, deadline)
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.set(DeadlineTarget::Write, deadline)
    }

    /// 借出底层套接字，读写 AF_VSOCK 专有选项（如 `SO_VM_SOCKETS_BUFFER_SIZE`）。
    ///
    /// 回调不得切换阻塞模式或关闭套接字；连接已关闭时返回 [`crate::ErrorKind::Closed`]，
    /// 且不会调用 `f`。
    pub fn with_socket<R>(&self, f: impl FnOnce(&Socket) -> R) -> Result<R, VsockError> {
        let mut f = Some(f);
        let mut out = None;
        self.inner
            .fd
            .with_socket(&mut |socket| out = f.take().map(|f| f(socket)))
            .map_err(|err| self.error(Op::Set, err))?;
        out.ok_or_else(|| self.error(Op::Set, closed_io_error()))
    }

    pub fn local_addr(&self) -> VsockAddr {
        self.inner.local
    }

    pub fn peer_addr(&self) -> VsockAddr {
        self.inner.remote
    }

    pub fn config(&self) -> &VsockConfig {
        &self.inner.config
    }

    fn set(&self, target: DeadlineTarget, deadline: Option<Instant>) -> Result<(), VsockError> {
        self.inner
            .fd
            .set_deadline(target, deadline)
            .map_err(|err| self.error(Op::Set, err))
    }

    fn error(&self, op: Op, err: io::Error) -> VsockError {
        op_error(op, err, Some(self.inner.local), Some(self.inner.remote))
    }
}

impl fmt::Debug for VsockConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsockConn")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

fn establish(
    fd: &mut dyn ConnFd,
    remote: VsockAddr,
    config: &VsockConfig,
) -> io::Result<VsockAddr> {
    fd.connect(remote)?;
    let local = fd.local_addr()?;
    fd.set_nonblocking(&local.file_name(), config.capabilities())?;
    Ok(local)
}
