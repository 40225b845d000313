//! 重连退避表

use std::time::Duration;

/// 按连续失败次数索引的等待时间，超出后停留在最后一项
pub const BACKOFF_TABLE: [Duration; 8] = [
    Duration::from_millis(200),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// 第 `failures` 次连续失败后的等待时间
pub fn backoff(failures: usize) -> Duration {
    BACKOFF_TABLE[failures.min(BACKOFF_TABLE.len() - 1)]
}
