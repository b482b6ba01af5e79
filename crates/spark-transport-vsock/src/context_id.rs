//! 本机上下文标识（CID）查询。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 监听方常需要把自己的 CID 告知对端；内核通过 `/dev/vsock` 的 ioctl 暴露该值；
//! - 文件系统与 ioctl 访问经由 [`ControlDevice`] 抽象，解析逻辑可以脱离真实设备测试。
//!
//! ## 契约（What）
//! - 设备不存在时返回 [`CID_HOST`]：视本机为宿主机。这与“本机根本不支持 VM 套接字”
//!   无法区分，调用方需要自行结合 `dial`/`listen` 的结果判断；
//! - 其余失败（权限不足、ioctl 返回 errno）统一包装为 [`VsockError::ContextId`]。

use crate::addr::CID_HOST;
use crate::error::VsockError;
use std::io;

/// 控制设备路径。
pub const DEV_VSOCK: &str = "/dev/vsock";

/// `IOCTL_VM_SOCKETS_GET_LOCAL_CID` 请求号。
pub const IOCTL_GET_LOCAL_CID: u32 = 0x7b9;

/// 控制设备访问的最小接口。
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) trait ControlDevice {
    type Handle;

    fn open(&self, path: &'static str) -> io::Result<Self::Handle>;

    fn local_cid(&self, handle: &Self::Handle) -> io::Result<u32>;
}

/// 通过给定的控制设备解析本机 CID。
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn resolve<D: ControlDevice>(device: &D) -> Result<u32, VsockError> {
    let handle = match device.open(DEV_VSOCK) {
        Ok(handle) => handle,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = DEV_VSOCK, "vsock control device missing, assuming host");
            return Ok(CID_HOST);
        }
        Err(source) => {
            return Err(VsockError::ContextId {
                path: DEV_VSOCK,
                source,
            });
        }
    };
    device
        .local_cid(&handle)
        .map_err(|source| VsockError::ContextId {
            path: DEV_VSOCK,
            source,
        })
}

/// 查询本机的 CID。
///
/// 非 Linux 平台返回 [`VsockError::Unimplemented`]。
pub fn local_context_id() -> Result<u32, VsockError> {
    #[cfg(target_os = "linux")]
    {
        resolve(&sys::SysControlDevice)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(VsockError::unimplemented())
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod sys {
    use super::{ControlDevice, IOCTL_GET_LOCAL_CID};
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    nix::ioctl_read_bad!(get_local_cid, IOCTL_GET_LOCAL_CID, u32);

    pub(super) struct SysControlDevice;

    impl ControlDevice for SysControlDevice {
        type Handle = File;

        fn open(&self, path: &'static str) -> io::Result<File> {
            File::open(path)
        }

        fn local_cid(&self, handle: &File) -> io::Result<u32> {
            let mut cid = 0u32;
            // SAFETY: `handle` 在调用期间保持打开，`cid` 是该请求约定写入的 `u32`。
            unsafe { get_local_cid(handle.as_raw_fd(), &mut cid) }?;
            Ok(cid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::Cell;

    /// 记录调用轨迹的替身设备。
    struct FakeDevice {
        open: fn() -> io::Result<()>,
        cid: io::Result<u32>,
        opened: Cell<Option<&'static str>>,
    }

    impl FakeDevice {
        fn new(open: fn() -> io::Result<()>, cid: io::Result<u32>) -> Self {
            Self {
                open,
                cid,
                opened: Cell::new(None),
            }
        }
    }

    impl ControlDevice for FakeDevice {
        type Handle = ();

        fn open(&self, path: &'static str) -> io::Result<()> {
            self.opened.set(Some(path));
            (self.open)()
        }

        fn local_cid(&self, _handle: &()) -> io::Result<u32> {
            match &self.cid {
                Ok(cid) => Ok(*cid),
                Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
            }
        }
    }

    #[test]
    fn guest_reads_cid_from_device() {
        let device = FakeDevice::new(|| Ok(()), Ok(5));
        assert_eq!(resolve(&device).expect("cid"), 5);
        assert_eq!(device.opened.get(), Some("/dev/vsock"));
    }

    #[test]
    fn missing_device_means_host() {
        let device = FakeDevice::new(|| Err(io::ErrorKind::NotFound.into()), Ok(99));
        assert_eq!(resolve(&device).expect("cid"), CID_HOST);
    }

    #[test]
    fn permission_denied_is_reported() {
        let device = FakeDevice::new(|| Err(io::ErrorKind::PermissionDenied.into()), Ok(99));
        let err = resolve(&device).expect_err("permission denied");
        assert!(matches!(err, VsockError::ContextId { path: DEV_VSOCK, .. }));
        assert_eq!(err.kind(), ErrorKind::Setup);
    }

    #[test]
    fn ioctl_failure_is_reported() {
        let device = FakeDevice::new(
            || Ok(()),
            Err(io::Error::other("ioctl: 25")),
        );
        let err = resolve(&device).expect_err("ioctl failure");
        assert!(err.to_string().contains("/dev/vsock"));
    }

    #[test]
    fn request_number_matches_kernel_abi() {
        assert_eq!(IOCTL_GET_LOCAL_CID, 0x7b9);
    }
}
