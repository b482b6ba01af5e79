//! 单元测试共用的描述符替身。
//!
//! 替身按调用顺序记录操作名，并可在指定步骤注入失败，用于断言“建连失败必提前关闭且仅关闭一次”。

use crate::addr::VsockAddr;
use crate::error::closed_io_error;
use crate::fd::{ConnFd, ListenFd};
use crate::poller::{DeadlineTarget, PollerCapabilities};
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Instant;

/// 调用轨迹，克隆后与替身共享。
#[derive(Clone, Debug, Default)]
pub(crate) struct Calls(Arc<Mutex<Vec<String>>>);

impl Calls {
    fn push(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.0.lock().iter().filter(|c| *c == call).count()
    }
}

fn injected() -> io::Error {
    io::Error::from_raw_os_error(nix::libc::EACCES)
}

/// 替身没有真实句柄，借出一个临时的 Unix 套接字供回调操作。
fn lend_socket(
    calls: &Calls,
    fail_at: Option<&'static str>,
    f: &mut dyn FnMut(&Socket),
) -> io::Result<()> {
    calls.push("with_socket");
    if fail_at == Some("with_socket") {
        return Err(closed_io_error());
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    f(&socket);
    Ok(())
}

/// 连接描述符替身。
#[derive(Debug)]
pub(crate) struct FakeConnFd {
    pub(crate) calls: Calls,
    pub(crate) fail_at: Option<&'static str>,
    pub(crate) local: VsockAddr,
    pub(crate) read_error: Option<fn() -> io::Error>,
    pub(crate) write_error: Option<fn() -> io::Error>,
}

impl FakeConnFd {
    pub(crate) fn new(local: VsockAddr) -> Self {
        Self {
            calls: Calls::default(),
            fail_at: None,
            local,
            read_error: None,
            write_error: None,
        }
    }

    pub(crate) fn failing_at(mut self, step: &'static str) -> Self {
        self.fail_at = Some(step);
        self
    }

    fn step(&self, name: &'static str) -> io::Result<()> {
        self.calls.push(name);
        if self.fail_at == Some(name) {
            Err(injected())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConnFd for FakeConnFd {
    fn connect(&mut self, addr: VsockAddr) -> io::Result<()> {
        self.calls.push(format!("connect {addr}"));
        if self.fail_at == Some("connect") {
            return Err(injected());
        }
        Ok(())
    }

    fn local_addr(&mut self) -> io::Result<VsockAddr> {
        self.step("local_addr").map(|()| self.local)
    }

    fn set_nonblocking(
        &mut self,
        name: &str,
        _capabilities: PollerCapabilities,
    ) -> io::Result<()> {
        self.calls.push(format!("set_nonblocking {name}"));
        if self.fail_at == Some("set_nonblocking") {
            return Err(injected());
        }
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.step("read")?;
        match self.read_error {
            Some(error) => Err(error()),
            None => {
                let n = buf.len().min(4);
                buf[..n].copy_from_slice(&b"fake"[..n]);
                Ok(n)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.step("write")?;
        match self.write_error {
            Some(error) => Err(error()),
            // 每次最多写入 3 字节，模拟短写。
            None => Ok(buf.len().min(3)),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.calls.push(format!("shutdown {how:?}"));
        Ok(())
    }

    fn set_deadline(&self, target: DeadlineTarget, deadline: Option<Instant>) -> io::Result<()> {
        self.calls
            .push(format!("set_deadline {target:?} {}", deadline.is_some()));
        if self.fail_at == Some("set_deadline") {
            return Err(closed_io_error());
        }
        Ok(())
    }

    fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()> {
        lend_socket(&self.calls, self.fail_at, f)
    }

    fn close(&self) -> io::Result<()> {
        self.step("close")
    }
}

/// 监听描述符替身；`accept` 产出共享同一调用轨迹的连接替身。
#[derive(Debug)]
pub(crate) struct FakeListenFd {
    pub(crate) calls: Calls,
    pub(crate) fail_at: Option<&'static str>,
    pub(crate) local: VsockAddr,
    pub(crate) peer: VsockAddr,
}

impl FakeListenFd {
    pub(crate) fn new(local: VsockAddr, peer: VsockAddr) -> Self {
        Self {
            calls: Calls::default(),
            fail_at: None,
            local,
            peer,
        }
    }

    pub(crate) fn failing_at(mut self, step: &'static str) -> Self {
        self.fail_at = Some(step);
        self
    }

    fn step(&self, name: &'static str) -> io::Result<()> {
        self.calls.push(name);
        if self.fail_at == Some(name) {
            Err(injected())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ListenFd for FakeListenFd {
    fn bind(&mut self, addr: VsockAddr) -> io::Result<()> {
        self.calls
            .push(format!("bind {}:{}", addr.context_id(), addr.port()));
        if self.fail_at == Some("bind") {
            return Err(injected());
        }
        Ok(())
    }

    fn listen(&mut self, backlog: i32) -> io::Result<()> {
        self.calls.push(format!("listen {backlog}"));
        if self.fail_at == Some("listen") {
            return Err(injected());
        }
        Ok(())
    }

    fn local_addr(&mut self) -> io::Result<VsockAddr> {
        self.step("local_addr").map(|()| self.local)
    }

    fn set_nonblocking(
        &mut self,
        name: &str,
        _capabilities: PollerCapabilities,
    ) -> io::Result<()> {
        self.calls.push(format!("set_nonblocking {name}"));
        if self.fail_at == Some("set_nonblocking") {
            return Err(injected());
        }
        Ok(())
    }

    async fn accept(&self) -> io::Result<(Box<dyn ConnFd>, VsockAddr)> {
        self.step("accept")?;
        let mut conn = FakeConnFd::new(self.local);
        conn.calls = self.calls.clone();
        Ok((Box::new(conn), self.peer))
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.calls
            .push(format!("set_deadline {}", deadline.is_some()));
        Ok(())
    }

    fn with_socket(&self, f: &mut dyn FnMut(&Socket)) -> io::Result<()> {
        lend_socket(&self.calls, self.fail_at, f)
    }

    fn close(&self) -> io::Result<()> {
        self.step("close")
    }
}
