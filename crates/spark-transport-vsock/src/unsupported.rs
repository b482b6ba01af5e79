//! 非 Linux 平台的占位实现：保留与 Linux 相同的公开 API，所有入口返回 `Unimplemented`。

use crate::addr::VsockAddr;
use crate::config::VsockConfig;
use crate::error::VsockError;
use std::convert::Infallible;
use std::time::Instant;

/// 非 Linux 平台没有 `SOMAXCONN` 语义，保留常量仅为 API 一致。
pub const LISTEN_BACKLOG: i32 = 128;

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

/// 占位连接；无法被构造。
#[derive(Clone, Debug)]
pub struct VsockConn {
    never: Infallible,
}

impl VsockConn {
    pub fn dial(_context_id: u32, _port: u32) -> Result<Self, VsockError> {
        Err(VsockError::unimplemented())
    }

    pub fn dial_with_config(
        _context_id: u32,
        _port: u32,
        _config: VsockConfig,
    ) -> Result<Self, VsockError> {
        Err(VsockError::unimplemented())
    }

    pub async fn read(&self, _buf: &mut [u8]) -> Result<usize, VsockError> {
        match self.never {}
    }

    pub async fn write(&self, _buf: &[u8]) -> Result<usize, VsockError> {
        match self.never {}
    }

    pub async fn write_all(&self, _buf: &[u8]) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn close_read(&self) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn close_write(&self) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn shutdown(&self, _direction: ShutdownDirection) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn close(&self) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn with_socket<R>(
        &self,
        _f: impl FnOnce(&socket2::Socket) -> R,
    ) -> Result<R, VsockError> {
        match self.never {}
    }

    pub fn local_addr(&self) -> VsockAddr {
        match self.never {}
    }

    pub fn peer_addr(&self) -> VsockAddr {
        match self.never {}
    }

    pub fn config(&self) -> &VsockConfig {
        match self.never {}
    }
}

/// 占位监听器；无法被构造。
#[derive(Debug)]
pub struct VsockListener {
    never: Infallible,
}

impl VsockListener {
    pub fn bind(_context_id: u32, _port: u32) -> Result<Self, VsockError> {
        Err(VsockError::unimplemented())
    }

    pub fn bind_with_config(
        _context_id: u32,
        _port: u32,
        _config: VsockConfig,
    ) -> Result<Self, VsockError> {
        Err(VsockError::unimplemented())
    }

    #[cfg(unix)]
    pub fn from_fd(_fd: impl std::os::fd::AsFd) -> Result<Self, VsockError> {
        Err(VsockError::unimplemented())
    }

    #[cfg(unix)]
    pub fn from_fd_with_config(
        _fd: impl std::os::fd::AsFd,
        _config: VsockConfig,
    ) -> Result<Self, VsockError> {
        Err(VsockError::unimplemented())
    }

    pub async fn accept(&self) -> Result<(VsockConn, VsockAddr), VsockError> {
        match self.never {}
    }

    pub fn close(&self) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<(), VsockError> {
        match self.never {}
    }

    pub fn with_socket<R>(
        &self,
        _f: impl FnOnce(&socket2::Socket) -> R,
    ) -> Result<R, VsockError> {
        match self.never {}
    }

    pub fn local_addr(&self) -> VsockAddr {
        match self.never {}
    }

    pub fn config(&self) -> &VsockConfig {
        match self.never {}
    }
}
