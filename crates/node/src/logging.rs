use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

pub fn log_level() -> LogLevel {
    static LEVEL: OnceLock<LogLevel> = OnceLock::new();
    *LEVEL.get_or_init(|| match std::env::var("BASALT_LOG").as_deref() {
        Ok("error") => LogLevel::Error,
        Ok("warn") => LogLevel::Warn,
        Ok("debug") => LogLevel::Debug,
        _ => LogLevel::Info,
    })
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if $crate::logging::log_level() >= $crate::logging::LogLevel::Error {
            eprintln!("[error] {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if $crate::logging::log_level() >= $crate::logging::LogLevel::Warn {
            eprintln!("[warn] {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if $crate::logging::log_level() >= $crate::logging::LogLevel::Info {
            println!("{}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::logging::log_level() >= $crate::logging::LogLevel::Debug {
            println!("[debug] {}", format!($($arg)*));
        }
    };
}
