use crate::addr::VsockAddr;
use std::fmt;
use std::io;
use thiserror::Error;

const TIMEOUT_TEXT: &str = "i/o timeout";

/// 触发错误的操作名。
///
/// # 契约（What）
/// - `accept`/`listen`/`set` 仅携带本地地址；
/// - `dial`/`close`/`read`/`write` 同时携带本地与对端地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Dial,
    Close,
    Read,
    Write,
    Accept,
    Listen,
    Set,
}

impl Op {
    pub const fn as_str(self) -> &'static str {
        match self {
            Op::Dial => "dial",
            Op::Close => "close",
            Op::Read => "read",
            Op::Write => "write",
            Op::Accept => "accept",
            Op::Listen => "listen",
            Op::Set => "set",
        }
    }

    const fn carries_remote(self) -> bool {
        matches!(self, Op::Dial | Op::Close | Op::Read | Op::Write)
    }

    const fn is_setup(self) -> bool {
        matches!(self, Op::Dial | Op::Listen)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误关联的端点信息。
///
/// `Display` 输出带前导空格的 `" local->remote"`，无端点时输出空串，
/// 使错误文案形如 `read vsock host(2):1024->vm(3):2048: ...`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    local: Option<VsockAddr>,
    remote: Option<VsockAddr>,
}

impl Endpoints {
    /// 依据操作语义筛选需要保留的端点。
    pub(crate) fn for_op(op: Op, local: Option<VsockAddr>, remote: Option<VsockAddr>) -> Self {
        Self {
            local,
            remote: if op.carries_remote() { remote } else { None },
        }
    }

    pub fn local(&self) -> Option<VsockAddr> {
        self.local
    }

    pub fn remote(&self) -> Option<VsockAddr> {
        self.remote
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.local, self.remote) {
            (Some(local), Some(remote)) => write!(f, " {local}->{remote}"),
            (Some(addr), None) | (None, Some(addr)) => write!(f, " {addr}"),
            (None, None) => Ok(()),
        }
    }
}

/// 调用方用于分支判断的稳定错误分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 建连/监听阶段的系统调用失败，描述符已被提前关闭。
    Setup,
    /// 描述符已在本地关闭或不可再用，永久性错误。
    Closed,
    /// 截止时间到期，可重试，描述符保持可用。
    Timeout,
    /// 写方向已被本端或对端关闭。
    BrokenPipe,
    /// 其余 I/O 阶段的系统错误。
    Io,
    /// 平台或轮询器不具备所需能力。
    Unsupported,
}

/// VSOCK 传输的统一错误类型。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 将内核 errno、反应器信号（关闭/超时）与平台缺失统一收敛为少量稳定分类，
///   调用方只需对 [`ErrorKind`] 分支，而不必理解各内核版本的差异；
/// - 保留原始 `io::Error` 作为 `source()`，日志与排障仍能看到 errno 细节。
///
/// ## 逻辑（How）
/// - 描述符层只产出 `io::Error`；连接与监听器在返回前调用一次 `translate`，
///   一次性决定变体，此后不再对错误身份做二次判断；
/// - 每个变体都携带 [`Op`] 与按操作筛选后的 [`Endpoints`]。
///
/// ## 契约（What）
/// - 流结束（对端半关闭）不是错误：`read` 返回 `Ok(0)`；
/// - `Timeout` 是唯一的临时错误（[`VsockError::is_temporary`]）；
/// - `Setup` 返回前描述符必定已关闭。
#[derive(Debug, Error)]
pub enum VsockError {
    #[error("{op} vsock{endpoints}: {source}")]
    Setup {
        op: Op,
        endpoints: Endpoints,
        #[source]
        source: io::Error,
    },
    #[error("{op} vsock{endpoints}: use of closed network connection")]
    Closed {
        op: Op,
        endpoints: Endpoints,
        #[source]
        source: io::Error,
    },
    #[error("{op} vsock{endpoints}: i/o timeout")]
    Timeout {
        op: Op,
        endpoints: Endpoints,
        #[source]
        source: io::Error,
    },
    #[error("{op} vsock{endpoints}: broken pipe")]
    BrokenPipe {
        op: Op,
        endpoints: Endpoints,
        #[source]
        source: io::Error,
    },
    #[error("{op} vsock{endpoints}: {source}")]
    Io {
        op: Op,
        endpoints: Endpoints,
        #[source]
        source: io::Error,
    },
    #[error("{op} vsock{endpoints}: operation not supported: {source}")]
    Unsupported {
        op: Op,
        endpoints: Endpoints,
        #[source]
        source: io::Error,
    },
    /// 当前平台没有 AF_VSOCK，所有入口统一返回该错误。
    #[error("vsock: not implemented on {os}/{arch}")]
    Unimplemented {
        os: &'static str,
        arch: &'static str,
    },
    /// 读取控制设备获取本机 CID 失败。
    #[error("vsock: failed to query local context ID from {path}: {source}")]
    ContextId {
        path: &'static str,
        #[source]
        source: io::Error,
    },
}

impl VsockError {
    /// 当前平台缺失 VM 套接字时的错误。
    pub fn unimplemented() -> Self {
        VsockError::Unimplemented {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VsockError::Setup { .. } | VsockError::ContextId { .. } => ErrorKind::Setup,
            VsockError::Closed { .. } => ErrorKind::Closed,
            VsockError::Timeout { .. } => ErrorKind::Timeout,
            VsockError::BrokenPipe { .. } => ErrorKind::BrokenPipe,
            VsockError::Io { .. } => ErrorKind::Io,
            VsockError::Unsupported { .. } | VsockError::Unimplemented { .. } => {
                ErrorKind::Unsupported
            }
        }
    }

    /// 稳定错误码，命名沿用 `spark.transport.*` 约定。
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Setup => "spark.transport.vsock.setup_failed",
            ErrorKind::Closed => "spark.transport.vsock.closed",
            ErrorKind::Timeout => "spark.transport.vsock.timeout",
            ErrorKind::BrokenPipe => "spark.transport.vsock.broken_pipe",
            ErrorKind::Io => "spark.transport.vsock.io_failed",
            ErrorKind::Unsupported => "spark.transport.vsock.unsupported",
        }
    }

    pub fn op(&self) -> Option<Op> {
        match self {
            VsockError::Setup { op, .. }
            | VsockError::Closed { op, .. }
            | VsockError::Timeout { op, .. }
            | VsockError::BrokenPipe { op, .. }
            | VsockError::Io { op, .. }
            | VsockError::Unsupported { op, .. } => Some(*op),
            VsockError::Unimplemented { .. } | VsockError::ContextId { .. } => None,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        match self {
            VsockError::Setup { endpoints, .. }
            | VsockError::Closed { endpoints, .. }
            | VsockError::Timeout { endpoints, .. }
            | VsockError::BrokenPipe { endpoints, .. }
            | VsockError::Io { endpoints, .. }
            | VsockError::Unsupported { endpoints, .. } => *endpoints,
            VsockError::Unimplemented { .. } | VsockError::ContextId { .. } => {
                Endpoints::default()
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// 仅截止时间到期属于临时错误；关闭是永久性的。
    pub fn is_temporary(&self) -> bool {
        self.is_timeout()
    }

    /// 底层 errno（若存在）。
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_source().and_then(io::Error::raw_os_error)
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            VsockError::Setup { source, .. }
            | VsockError::Closed { source, .. }
            | VsockError::Timeout { source, .. }
            | VsockError::BrokenPipe { source, .. }
            | VsockError::Io { source, .. }
            | VsockError::Unsupported { source, .. }
            | VsockError::ContextId { source, .. } => Some(source),
            VsockError::Unimplemented { .. } => None,
        }
    }
}

impl From<VsockError> for io::Error {
    fn from(err: VsockError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Closed => io::ErrorKind::NotConnected,
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            ErrorKind::BrokenPipe => io::ErrorKind::BrokenPipe,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::Setup | ErrorKind::Io => err
                .io_source()
                .map(io::Error::kind)
                .unwrap_or(io::ErrorKind::Other),
        };
        io::Error::new(kind, err)
    }
}

/// 描述符被关闭后由轮询器产出的哨兵错误；文案与标准网络库保持一致，便于跨实现做字符串匹配。
#[derive(Debug, Error)]
#[error("use of closed network connection")]
pub(crate) struct ClosedHandle;

pub(crate) fn closed_io_error() -> io::Error {
    io::Error::other(ClosedHandle)
}

pub(crate) fn timeout_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, TIMEOUT_TEXT)
}

pub(crate) fn unsupported_io_error(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, reason)
}

/// 错误翻译的结果：流结束不是错误值。
#[derive(Debug)]
pub(crate) enum Translated {
    EndOfStream,
    Error(VsockError),
}

/// 错误翻译边界：对原始 `io::Error` 只做一次分类。
///
/// 优先级：读方向的未连接 → 流结束；已关闭 → `Closed`；建连/监听阶段 → `Setup`；
/// 超时 → `Timeout`；断管（写方向未连接同样视为断管）→ `BrokenPipe`；
/// 能力缺失 → `Unsupported`；其余 → `Io`。
pub(crate) fn translate(
    op: Op,
    err: io::Error,
    local: Option<VsockAddr>,
    remote: Option<VsockAddr>,
) -> Translated {
    let endpoints = Endpoints::for_op(op, local, remote);
    let not_connected = err.kind() == io::ErrorKind::NotConnected;
    if not_connected && op == Op::Read {
        return Translated::EndOfStream;
    }
    let source = err;
    let error = if is_closed(&source) {
        VsockError::Closed {
            op,
            endpoints,
            source,
        }
    } else if op.is_setup() {
        VsockError::Setup {
            op,
            endpoints,
            source,
        }
    } else {
        match source.kind() {
            io::ErrorKind::TimedOut => VsockError::Timeout {
                op,
                endpoints,
                source,
            },
            io::ErrorKind::BrokenPipe => VsockError::BrokenPipe {
                op,
                endpoints,
                source,
            },
            io::ErrorKind::NotConnected if op == Op::Write => VsockError::BrokenPipe {
                op,
                endpoints,
                source,
            },
            io::ErrorKind::Unsupported => VsockError::Unsupported {
                op,
                endpoints,
                source,
            },
            _ => VsockError::Io {
                op,
                endpoints,
                source,
            },
        }
    };
    Translated::Error(error)
}

/// 对不会产生流结束语义的操作直接取出错误。
pub(crate) fn op_error(
    op: Op,
    err: io::Error,
    local: Option<VsockAddr>,
    remote: Option<VsockAddr>,
) -> VsockError {
    match translate(op, err, local, remote) {
        Translated::Error(error) => error,
        // 仅 `read` 会得到流结束；其余操作以关闭语义兜底。
        Translated::EndOfStream => VsockError::Closed {
            op,
            endpoints: Endpoints::for_op(op, local, remote),
            source: closed_io_error(),
        },
    }
}

fn is_closed(err: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    {
        if err.raw_os_error() == Some(nix::errno::Errno::EBADF as i32) {
            return true;
        }
    }
    match err.get_ref() {
        Some(inner) => inner.is::<ClosedHandle>() || inner.to_string().contains("use of closed"),
        None => false,
    }
}
