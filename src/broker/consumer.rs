//! 消费端辅助：序号缺口检测与消息 ID 去重
//!
//! 投递语义是至少一次；序号只用于发现丢失，不保证恰好一次。

use std::collections::{HashMap, HashSet, VecDeque};

/// 单个信封的序号检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// 中间缺失 missing 条
    Gap { missing: u64 },
    /// 重复或乱序到达（序号不大于已见最大值）
    Replay,
}

/// 按频道跟踪最大已见序号
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: HashMap<String, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, channel: &str, sequence: u64) -> SequenceCheck {
        let last = self.last_seen.get(channel).copied().unwrap_or(0);
        if sequence <= last {
            return SequenceCheck::Replay;
        }
        self.last_seen.insert(channel.to_string(), sequence);
        if sequence == last + 1 {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap {
                missing: sequence - last - 1,
            }
        }
    }

    pub fn last(&self, channel: &str) -> Option<u64> {
        self.last_seen.get(channel).copied()
    }
}

/// 有界的消息 ID 去重集合，超出容量时淘汰最早的 ID
#[derive(Debug)]
pub struct MessageDeduplicator {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl MessageDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// 首次见到返回 true
    pub fn first_seen(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// 移除某个 ID（处理失败、需要接受重投时）
    pub fn forget(&mut self, id: &str) -> bool {
        if !self.seen.remove(id) {
            return false;
        }
        self.order.retain(|seen| seen != id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe("a", 1), SequenceCheck::InOrder);
        assert_eq!(tracker.observe("a", 2), SequenceCheck::InOrder);
        assert_eq!(tracker.observe("a", 5), SequenceCheck::Gap { missing: 2 });
        assert_eq!(tracker.observe("a", 5), SequenceCheck::Replay);
        assert_eq!(tracker.observe("b", 1), SequenceCheck::InOrder);
        assert_eq!(tracker.last("a"), Some(5));
    }

    #[test]
    fn test_deduplicator_evicts_oldest() {
        let mut dedup = MessageDeduplicator::new(2);
        assert!(dedup.first_seen("m1"));
        assert!(!dedup.first_seen("m1"));
        assert!(dedup.first_seen("m2"));
        assert!(dedup.first_seen("m3"));
        assert_eq!(dedup.len(), 2);
        assert!(dedup.first_seen("m1"));
    }
}
