/// 事件日志
///
/// 固定容量的环形记录，连续重复的消息合并为一条并累加次数
use crate::stats::unix_now;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 一条事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    /// 最后一次出现的 Unix 时间
    pub timestamp: u64,
    pub message: String,
    /// 连续出现的次数
    pub count: u64,
}

pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<EventEntry>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// 追加一条事件；与最新一条相同则只累加次数
    pub fn add(&self, message: impl Into<String>) {
        let message = message.into();
        let now = unix_now();
        let mut entries = self.entries.lock();

        if let Some(last) = entries.back_mut() {
            if last.message == message {
                last.count += 1;
                last.timestamp = now;
                return;
            }
        }

        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(EventEntry {
            timestamp: now,
            message,
            count: 1,
        });
    }

    /// 最近的 `n` 条事件，新的在前
    pub fn recent(&self, n: usize) -> Vec<EventEntry> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
