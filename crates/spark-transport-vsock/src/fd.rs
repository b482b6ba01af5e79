//! VSOCK 描述符生命周期管理。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 建连与监听阶段需要同步执行 `socket → bind/connect → listen → getsockname` 等系统调用，
//!   此时描述符处于阻塞模式；交付给调用方之后，`accept`/`read`/`write` 必须由 Tokio 反应器驱动；
//! - 两种表示不能同时存活，否则同一个内核句柄可能被关闭两次。
//!
//! ## 逻辑（How）
//! - [`State`] 以枚举表达 `Blocking(Socket)`、`Pollable(..)` 与终态 `Closed`，
//!   非阻塞转换按值消费阻塞套接字，构造期即排除“双重表示”；
//! - 建连阶段的操作接受 `&mut self`，交付共享后无法再调用；运行期仍保留断言，
//!   转换后的阻塞操作或重复转换属于不变量破坏，直接 panic；
//! - [`ListenFd`] 与 [`ConnFd`] 是监听器/连接依赖的最小接口，单元测试注入替身实现。
//!
//! ## 契约（What）
//! - `close` 唤醒所有挂起的 `accept`/`read`/`write`，重复关闭返回关闭哨兵错误；
//! - `read` 遇到 `ENOTCONN` 视为流结束返回 `Ok(0)`；`write` 使用 `MSG_NOSIGNAL`，断管以错误返回；
//! - **前置条件**：非阻塞转换必须发生在 Tokio 运行时上下文中，否则返回错误且描述符保持阻塞。

use crate::addr::VsockAddr;
use crate::error::{Op, closed_io_error, unsupported_io_error};
use crate::poller::{self, DeadlineTarget, Direction, PollSignal, PollState, PollerCapabilities};
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{BorrowedFd, IntoRawFd};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

/// 监听描述符需要提供的能力。
#[async_trait]
pub(crate) trait ListenFd: Send + Sync + 'static {
    fn bind(&mut self, addr: VsockAddr) -> io::Result<()>;

    fn listen(&mut self, backlog: i32) -> io::Result<()>;

    /// `getsockname`；属于建连阶段操作。
    fn local_addr(&mut self) -> io::Result<VsockAddr>;

    fn set_nonblocking(&mut self, name: &str, capabilities: PollerCapabilities)
    -> io::Result<()>;

    async fn accept(&self) -> io::Result<(Box<dyn ConnFd>, VsockAddr)>;

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;
}

/// 连接描述符需要提供的能力。
#[async_trait]
pub(crate) trait ConnFd: Send + Sync + 'static {
    fn connect(&mut self, addr: VsockAddr) -> io::Result<()>;

    /// `getsockname`；属于建连阶段操作。
    fn local_addr(&mut self) -> io::Result<VsockAddr>;

    fn set_nonblocking(&mut self, name: &str, capabilities: PollerCapabilities)
    -> io::Result<()>;

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn set_deadline(&self, target: DeadlineTarget, deadline: Option<Instant>) -> io::Result<()>;

    fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;
}

/// 已注册到反应器的描述符及其关闭/截止时间广播端。
#[derive(Debug)]
struct Pollable {
    io: Arc<AsyncFd<Socket>>,
    signal: PollSignal,
}

#[derive(Debug)]
enum State {
    Blocking(Socket),
    Pollable(Pollable),
    Closed,
}

/// 基于真实系统调用的描述符实现。
#[derive(Debug)]
pub(crate) struct SysFd {
    state: Mutex<State>,
}

impl SysFd {
    /// 创建 `AF_VSOCK`/`SOCK_STREAM` 套接字（`socket2` 默认附带 close-on-exec）。
    pub(crate) fn vsock() -> io::Result<Self> {
        Socket::new(Domain::VSOCK, Type::STREAM, None).map(Self::from_socket)
    }

    /// 接管一个处于阻塞模式的套接字。
    pub(crate) fn from_socket(socket: Socket) -> Self {
        Self {
            state: Mutex::new(State::Blocking(socket)),
        }
    }

    /// 复制调用方持有的监听句柄，并校验其确为处于监听状态的 VSOCK 套接字。
    ///
    /// 复制出的句柄与原句柄共享文件状态标志，后续的非阻塞转换对双方同时可见。
    pub(crate) fn adopt_listener(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let socket = Socket::from(fd.try_clone_to_owned()?);
        if socket.domain()? != Domain::VSOCK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file descriptor is not an AF_VSOCK socket",
            ));
        }
        if !socket.is_listener()? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file descriptor is not a listening socket",
            ));
        }
        Ok(Self::from_socket(socket))
    }

    pub(crate) fn bind(&mut self, addr: VsockAddr) -> io::Result<()> {
        self.blocking()?.bind(&SockAddr::from(addr))
    }

    pub(crate) fn listen(&mut self, backlog: i32) -> io::Result<()> {
        self.blocking()?.listen(backlog)
    }

    pub(crate) fn connect(&mut self, addr: VsockAddr) -> io::Result<()> {
        self.blocking()?.connect(&SockAddr::from(addr))
    }

    pub(crate) fn local_addr(&mut self) -> io::Result<VsockAddr> {
        let addr = self.blocking()?.local_addr()?;
        vsock_addr(&addr)
    }

    /// 单向转换：阻塞套接字 → 注册到反应器的非阻塞套接字。
    ///
    /// 失败时恢复阻塞表示，调用方的提前关闭仍只会关闭一次。
    pub(crate) fn set_nonblocking(
        &mut self,
        name: &str,
        capabilities: PollerCapabilities,
    ) -> io::Result<()> {
        let slot = self.state.get_mut();
        match std::mem::replace(slot, State::Closed) {
            State::Blocking(socket) => {
                if let Err(err) = socket.set_nonblocking(true) {
                    *slot = State::Blocking(socket);
                    return Err(err);
                }
                match poller::register(socket) {
                    Ok(io) => {
                        tracing::trace!(name, "vsock descriptor registered with reactor");
                        *slot = State::Pollable(Pollable {
                            io: Arc::new(io),
                            signal: PollSignal::new(capabilities),
                        });
                        Ok(())
                    }
                    Err((socket, err)) => {
                        // 恢复阻塞模式失败不影响后续关闭，原始错误优先。
                        let _ = socket.set_nonblocking(false);
                        *slot = State::Blocking(socket);
                        Err(err)
                    }
                }
            }
            pollable @ State::Pollable(_) => {
                *slot = pollable;
                invariant_violation("non-blocking transition requested twice")
            }
            State::Closed => Err(closed_io_error()),
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<(SysFd, VsockAddr)> {
        let (io, mut signal, capabilities) = self.pollable()?;
        let (socket, addr) =
            poller::drive(&io, &mut signal, Direction::Read, |socket| socket.accept()).await?;
        drop(io);

        let mut conn = SysFd::from_socket(socket);
        let accepted = vsock_addr(&addr).and_then(|peer| {
            conn.set_nonblocking(&peer.file_name(), capabilities)?;
            Ok(peer)
        });
        match accepted {
            Ok(peer) => Ok((conn, peer)),
            Err(err) => {
                if let Err(close_err) = conn.close() {
                    tracing::warn!(error = %close_err, "failed to close rejected vsock connection");
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (io, mut signal, _) = self.pollable()?;
        let result = poller::drive(&io, &mut signal, Direction::Read, |mut socket| {
            socket.read(buf)
        })
        .await;
        match result {
            // 对端复位后的 `ENOTCONN` 视为流结束。
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(0),
            other => other,
        }
    }

    pub(crate) async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let (io, mut signal, _) = self.pollable()?;
        poller::drive(&io, &mut signal, Direction::Write, |socket| {
            socket.send_with_flags(buf, nix::libc::MSG_NOSIGNAL)
        })
        .await
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match &*self.state.lock() {
            State::Blocking(socket) => socket.shutdown(how),
            State::Pollable(pollable) => pollable.io.get_ref().shutdown(how),
            State::Closed => Err(closed_io_error()),
        }
    }

    pub(crate) fn set_deadline(
        &self,
        target: DeadlineTarget,
        deadline: Option<Instant>,
    ) -> io::Result<()> {
        match &*self.state.lock() {
            State::Pollable(pollable) => pollable.signal.set_deadline(target, deadline),
            State::Blocking(_) => Err(unsupported_io_error(
                "deadlines require a descriptor registered with the poller",
            )),
            State::Closed => Err(closed_io_error()),
        }
    }

    /// 借出底层套接字，供调用方读写套接字选项；已关闭时不调用 `f`。
    ///
    /// 回调执行期间不持有状态锁，并发的 `close` 要等回调返回后才释放内核句柄。
    pub(crate) fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()> {
        let io = match &*self.state.lock() {
            State::Pollable(pollable) => Arc::clone(&pollable.io),
            State::Blocking(socket) => {
                f(socket);
                return Ok(());
            }
            State::Closed => return Err(closed_io_error()),
        };
        f(io.get_ref());
        Ok(())
    }

    /// 关闭描述符。
    ///
    /// 仍有进行中的操作持有反应器句柄时，由最后一个返回的操作释放内核句柄。
    pub(crate) fn close(&self) -> io::Result<()> {
        let state = std::mem::replace(&mut *self.state.lock(), State::Closed);
        match state {
            State::Blocking(socket) => close_socket(socket),
            State::Pollable(Pollable { io, signal }) => {
                signal.close();
                drop(signal);
                match Arc::try_unwrap(io) {
                    Ok(io) => close_socket(io.into_inner()),
                    Err(_in_flight) => Ok(()),
                }
            }
            State::Closed => Err(closed_io_error()),
        }
    }

    fn blocking(&mut self) -> io::Result<&Socket> {
        match self.state.get_mut() {
            State::Blocking(socket) => Ok(socket),
            State::Pollable(_) => invariant_violation("blocking operation after non-blocking transition"),
            State::Closed => Err(closed_io_error()),
        }
    }

    fn pollable(
        &self,
    ) -> io::Result<(
        Arc<AsyncFd<Socket>>,
        watch::Receiver<PollState>,
        PollerCapabilities,
    )> {
        match &*self.state.lock() {
            State::Pollable(pollable) => Ok((
                Arc::clone(&pollable.io),
                pollable.signal.subscribe(),
                pollable.signal.capabilities(),
            )),
            State::Blocking(_) => invariant_violation("asynchronous operation on a blocking descriptor"),
            State::Closed => Err(closed_io_error()),
        }
    }
}

#[async_trait]
impl ListenFd for SysFd {
    fn bind(&mut self, addr: VsockAddr) -> io::Result<()> {
        SysFd::bind(self, addr)
    }

    fn listen(&mut self, backlog: i32) -> io::Result<()> {
        SysFd::listen(self, backlog)
    }

    fn local_addr(&mut self) -> io::Result<VsockAddr> {
        SysFd::local_addr(self)
    }

    fn set_nonblocking(
        &mut self,
        name: &str,
        capabilities: PollerCapabilities,
    ) -> io::Result<()> {
        SysFd::set_nonblocking(self, name, capabilities)
    }

    async fn accept(&self) -> io::Result<(Box<dyn ConnFd>, VsockAddr)> {
        let (conn, peer) = SysFd::accept(self).await?;
        Ok((Box::new(conn), peer))
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        SysFd::set_deadline(self, DeadlineTarget::Both, deadline)
    }

    fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()> {
        SysFd::with_socket(self, f)
    }

    fn close(&self) -> io::Result<()> {
        SysFd::close(self)
    }
}

#[async_trait]
impl ConnFd for SysFd {
    fn connect(&mut self, addr: VsockAddr) -> io::Result<()> {
        SysFd::connect(self, addr)
    }

    fn local_addr(&mut self) -> io::Result<VsockAddr> {
        SysFd::local_addr(self)
    }

    fn set_nonblocking(
        &mut self,
        name: &str,
        capabilities: PollerCapabilities,
    ) -> io::Result<()> {
        SysFd::set_nonblocking(self, name, capabilities)
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        SysFd::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        SysFd::write(self, buf).await
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        SysFd::shutdown(self, how)
    }

    fn set_deadline(&self, target: DeadlineTarget, deadline: Option<Instant>) -> io::Result<()> {
        SysFd::set_deadline(self, target, deadline)
    }

    fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()> {
        SysFd::with_socket(self, f)
    }

    fn close(&self) -> io::Result<()> {
        SysFd::close(self)
    }
}

/// 建连失败后的提前关闭：关闭错误只记录日志，原始建连错误优先返回。
pub(crate) fn early_close(op: Op, result: io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(%op, "closed vsock descriptor after failed setup"),
        Err(err) => tracing::warn!(%op, error = %err, "early close of vsock descriptor failed"),
    }
}

fn vsock_addr(addr: &SockAddr) -> io::Result<VsockAddr> {
    VsockAddr::from_sock_addr(addr).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "kernel returned a non-vsock socket address",
        )
    })
}

/// 显式关闭以便上报 `close(2)` 的错误；`Socket` 的析构会吞掉它。
fn close_socket(socket: Socket) -> io::Result<()> {
    nix::unistd::close(socket.into_raw_fd()).map_err(io::Error::from)
}

#[track_caller]
fn invariant_violation(detail: &str) -> ! {
    panic!("vsock: descriptor invariant violation: {detail}")
}
