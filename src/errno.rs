//! Errno values used at the device boundaries (Zephyr numbering).
//!
//! Radio and audio drivers report failures as small negative integers, as the
//! RTOS driver APIs they wrap do. Each subsystem maps them to its own error
//! enum.

pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const EMSGSIZE: i32 = 122;
pub const ETIMEDOUT: i32 = 116;
pub const ENOTSUP: i32 = 134;

/// Result of a device call: `Err` carries a negative errno.
pub type DeviceResult<T> = Result<T, i32>;
