//! 描述符与 Tokio 反应器之间的协作层。
//!
//! # 教案式注释
//!
//! ## 意图（Why）
//! - 非阻塞描述符上的 `accept`/`read`/`write` 需要在三类事件之间择一返回：
//!   套接字就绪、截止时间到期、描述符被其他任务关闭；
//! - 关闭与截止时间通过同一条 `watch` 通道广播，已经挂起的操作能即时感知
//!   截止时间的修改，而不是等到下一次调用。
//!
//! ## 逻辑（How）
//! - [`PollSignal`] 持有 `watch::Sender<PollState>`，每个进行中的操作订阅一个接收端；
//! - [`drive`] 以 `biased` 顺序等待“信号变化 → 截止时间 → 就绪”，就绪后通过
//!   `AsyncFd::try_io` 执行系统调用，`WouldBlock` 时清除就绪位并重新等待；
//! - [`PollerCapabilities`] 描述轮询器是否支持截止时间，缺失时设置截止时间返回 `Unsupported`。
//!
//! ## 契约（What）
//! - 关闭后所有挂起与后续操作返回关闭哨兵错误；
//! - 截止时间早于当前时刻时，下一次操作立即返回超时错误，描述符保持可用；
//! - **前置条件**：注册要求当前线程处于启用了 IO 驱动的 Tokio 运行时中；
//!   启用截止时间能力时还需要时间驱动。

#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use std::time::Instant;

/// 轮询器能力集合。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PollerCapabilities {
    pub(crate) deadlines: bool,
}

/// 等待方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// 截止时间作用的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeadlineTarget {
    Read,
    Write,
    Both,
}

/// 广播给所有进行中操作的描述符状态快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PollState {
    closed: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl PollState {
    fn deadline(&self, direction: Direction) -> Option<Instant> {
        match direction {
            Direction::Read => self.read_deadline,
            Direction::Write => self.write_deadline,
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) use reactor::{PollSignal, drive, register};

#[cfg(target_os = "linux")]
mod reactor {
    use super::{DeadlineTarget, Direction, PollState, PollerCapabilities};
    use crate::error::{closed_io_error, timeout_io_error, unsupported_io_error};
    use socket2::Socket;
    use std::io;
    use std::time::Instant;
    use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
    use tokio::sync::watch;

    /// 单个描述符的关闭/截止时间广播端。
    #[derive(Debug)]
    pub(crate) struct PollSignal {
        tx: watch::Sender<PollState>,
        capabilities: PollerCapabilities,
    }

    impl PollSignal {
        pub(crate) fn new(capabilities: PollerCapabilities) -> Self {
            let (tx, _rx) = watch::channel(PollState::default());
            Self { tx, capabilities }
        }

        pub(crate) fn capabilities(&self) -> PollerCapabilities {
            self.capabilities
        }

        pub(crate) fn subscribe(&self) -> watch::Receiver<PollState> {
            self.tx.subscribe()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.tx.borrow().closed
        }

        /// 标记关闭并唤醒所有等待者；重复调用无副作用。
        pub(crate) fn close(&self) {
            self.tx.send_modify(|state| state.closed = true);
        }

        /// 更新截止时间；`None` 表示取消。
        pub(crate) fn set_deadline(
            &self,
            target: DeadlineTarget,
            deadline: Option<Instant>,
        ) -> io::Result<()> {
            if !self.capabilities.deadlines {
                return Err(unsupported_io_error(
                    "poller was configured without deadline support",
                ));
            }
            if self.is_closed() {
                return Err(closed_io_error());
            }
            self.tx.send_modify(|state| match target {
                DeadlineTarget::Read => state.read_deadline = deadline,
                DeadlineTarget::Write => state.write_deadline = deadline,
                DeadlineTarget::Both => {
                    state.read_deadline = deadline;
                    state.write_deadline = deadline;
                }
            });
            Ok(())
        }
    }

    /// 将非阻塞套接字注册到当前运行时的反应器。
    ///
    /// 失败时把套接字原样交还，调用方仍持有唯一所有权，可继续走阻塞模式的关闭路径。
    pub(crate) fn register(socket: Socket) -> Result<AsyncFd<Socket>, (Socket, io::Error)> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err((
                socket,
                io::Error::other("vsock descriptors require a running tokio runtime"),
            ));
        }
        AsyncFd::try_new(socket).map_err(|err| err.into_parts())
    }

    /// 在就绪、截止时间与关闭信号之间驱动一次非阻塞系统调用。
    pub(crate) async fn drive<T, F>(
        fd: &AsyncFd<Socket>,
        signal: &mut watch::Receiver<PollState>,
        direction: Direction,
        mut op: F,
    ) -> io::Result<T>
    where
        F: FnMut(&Socket) -> io::Result<T>,
    {
        loop {
            let state = *signal.borrow_and_update();
            if state.closed {
                return Err(closed_io_error());
            }
            let deadline = state.deadline(direction);
            if deadline.is_some_and(|deadline| deadline <= Instant::now()) {
                return Err(timeout_io_error());
            }

            tokio::select! {
                biased;
                changed = signal.changed() => {
                    // 发送端随描述符一同释放，等价于关闭。
                    if changed.is_err() {
                        return Err(closed_io_error());
                    }
                }
                _ = expire(deadline) => return Err(timeout_io_error()),
                ready = ready(fd, direction) => {
                    let mut guard = ready?;
                    match guard.try_io(|inner| op(inner.get_ref())) {
                        Ok(result) => return result,
                        Err(_would_block) => continue,
                    }
                }
            }
        }
    }

    async fn ready(
        fd: &AsyncFd<Socket>,
        direction: Direction,
    ) -> io::Result<AsyncFdReadyGuard<'_, Socket>> {
        match direction {
            Direction::Read => fd.readable().await,
            Direction::Write => fd.writable().await,
        }
    }

    async fn expire(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
            None => std::future::pending().await,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use socket2::{Domain, Type};
        use std::io::Write;
        use std::time::Duration;

        fn pair() -> (Socket, Socket) {
            let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).expect("socketpair");
            a.set_nonblocking(true).expect("nonblocking");
            (a, b)
        }

        fn capable() -> PollerCapabilities {
            PollerCapabilities { deadlines: true }
        }

        #[tokio::test]
        async fn drive_returns_once_ready() {
            let (a, b) = pair();
            let fd = register(a).map_err(|(_, err)| err).expect("register");
            (&b).write_all(b"ping").expect("write");

            let signal = PollSignal::new(capable());
            let mut rx = signal.subscribe();
            let mut buf = [0u8; 4];
            let n = drive(&fd, &mut rx, Direction::Read, |sock| {
                std::io::Read::read(&mut &*sock, &mut buf)
            })
            .await
            .expect("read");
            assert_eq!(&buf[..n], b"ping");
        }

        #[tokio::test]
        async fn past_deadline_times_out_immediately() {
            let (a, _b) = pair();
            let fd = register(a).map_err(|(_, err)| err).expect("register");
            let signal = PollSignal::new(capable());
            let past = Instant::now() - Duration::from_secs(1);
            signal
                .set_deadline(DeadlineTarget::Read, Some(past))
                .expect("set deadline");

            let mut rx = signal.subscribe();
            let err = drive(&fd, &mut rx, Direction::Read, |_| Ok(()))
                .await
                .expect_err("timeout");
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        }

        #[tokio::test]
        async fn deadline_updates_reach_blocked_operations() {
            let (a, _b) = pair();
            let fd = register(a).map_err(|(_, err)| err).expect("register");
            let signal = PollSignal::new(capable());
            let mut rx = signal.subscribe();

            let wait = drive(&fd, &mut rx, Direction::Read, |sock| {
                std::io::Read::read(&mut &*sock, &mut [0u8; 1])
            });
            let shorten = async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                signal
                    .set_deadline(
                        DeadlineTarget::Both,
                        Some(Instant::now() + Duration::from_millis(20)),
                    )
                    .expect("set deadline");
            };
            let (result, ()) = tokio::time::timeout(Duration::from_secs(1), async {
                tokio::join!(wait, shorten)
            })
            .await
            .expect("blocked read did not observe the new deadline");
            assert_eq!(
                result.expect_err("timeout").kind(),
                io::ErrorKind::TimedOut
            );
        }

        #[test]
        fn deadlines_rejected_without_capability() {
            let signal = PollSignal::new(PollerCapabilities { deadlines: false });
            let err = signal
                .set_deadline(DeadlineTarget::Both, None)
                .expect_err("unsupported");
            assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        }

        #[test]
        fn close_is_sticky_and_rejects_deadlines() {
            let signal = PollSignal::new(capable());
            assert!(!signal.is_closed());
            signal.close();
            signal.close();
            assert!(signal.is_closed());
            assert!(
                signal
                    .set_deadline(DeadlineTarget::Read, None)
                    .is_err()
            );
        }

        #[test]
        fn register_without_runtime_returns_socket() {
            let (a, _b) = pair();
            let (socket, err) = register(a).expect_err("no runtime");
            assert_eq!(err.kind(), io::ErrorKind::Other);
            drop(socket);
        }
    }
}
