//! # 错误处理宏

/// 快速创建配置错误的宏
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ProxyError::config($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ProxyError::config(format!($fmt, $($arg)*))
    };
}

/// 快速创建请求格式错误的宏
#[macro_export]
macro_rules! malformed_error {
    ($msg:expr) => {
        $crate::error::ProxyError::malformed($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ProxyError::malformed(format!($fmt, $($arg)*))
    };
}

/// 确保条件成立，否则返回配置错误
#[macro_export]
macro_rules! ensure_config {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return Err($crate::config_error!($msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::config_error!($fmt, $($arg)*));
        }
    };
}

/// 确保条件成立，否则返回请求格式错误
#[macro_export]
macro_rules! ensure_wellformed {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return Err($crate::malformed_error!($msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::malformed_error!($fmt, $($arg)*));
        }
    };
}
