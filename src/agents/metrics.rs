//! 每个 Agent 的调用统计：请求数、成功数、处理耗时的指数移动平均

use serde::{Deserialize, Serialize};

/// 平滑系数
const EWMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// 首个样本直接采用，之后按 α = 0.1 平滑
    pub avg_processing_ms: f64,
}

impl AgentMetrics {
    pub fn record(&mut self, processing_ms: u64, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        }
        let sample = processing_ms as f64;
        self.avg_processing_ms = if self.total_requests == 1 {
            sample
        } else {
            EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.avg_processing_ms
        };
    }

    /// 没有请求时为 0
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}
