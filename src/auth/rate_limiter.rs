use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::types::{AttemptRecord, BlockedClient, RateLimitDecision};
use crate::config::RateLimitConfig;

/// 按客户端标识（IP）统计登录失败次数。
///
/// 同一个 key 上的读写都经过 DashMap 的分片锁串行执行，不同 key 互不阻塞。
/// 过期判断在每次读取时重新计算，不依赖后台清理是否执行过。
pub struct RateLimiter {
    attempts: DashMap<String, AttemptRecord>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        info!(
            "初始化登录限流器 - 最大失败次数: {}, 统计窗口: {} 秒, 封禁时长: {} 秒",
            config.max_attempts,
            config.attempt_window.num_seconds(),
            config.block_duration.num_seconds()
        );
        Self {
            attempts: DashMap::new(),
            config,
        }
    }

    pub fn check_limit(&self, client_id: &str) -> RateLimitDecision {
        self.check_limit_at(client_id, Utc::now())
    }

    pub fn check_limit_at(&self, client_id: &str, now: DateTime<Utc>) -> RateLimitDecision {
        debug!("检查客户端 {} 的登录限流状态", client_id);
        match self.attempts.entry(client_id.to_string()) {
            Entry::Vacant(_) => RateLimitDecision::Allowed,
            Entry::Occupied(entry) => {
                let record = *entry.get();
                if self.is_expired(&record, now) {
                    entry.remove();
                    info!("客户端 {} 的失败记录已过期，解除限制", client_id);
                    return RateLimitDecision::Allowed;
                }
                if record.count >= self.config.max_attempts {
                    let retry_after_secs = self.retry_after_secs(&record, now);
                    warn!(
                        "客户端 {} 登录尝试次数过多，{} 秒后可重试",
                        client_id, retry_after_secs
                    );
                    return RateLimitDecision::Denied { retry_after_secs };
                }
                RateLimitDecision::Allowed
            }
        }
    }

    /// 记录一次失败，返回当前窗口内的失败次数
    pub fn record_failed_attempt(&self, client_id: &str) -> u32 {
        self.record_failed_attempt_at(client_id, Utc::now())
    }

    pub fn record_failed_attempt_at(&self, client_id: &str, now: DateTime<Utc>) -> u32 {
        let count = match self.attempts.entry(client_id.to_string()) {
            Entry::Vacant(entry) => entry.insert(AttemptRecord::new(now)).count,
            Entry::Occupied(mut entry) => self.bump(client_id, entry.get_mut(), now),
        };
        warn!("客户端 {} 登录失败，当前失败次数: {}", client_id, count);
        count
    }

    /// 检查并预占一次尝试，两步在同一把锁内完成。
    ///
    /// 预占的尝试先按失败计数，登录成功后由 `reset_attempts` 清除；
    /// 因此同一客户端并发的请求最多只有 `max_attempts` 个能进入密码校验。
    pub fn try_begin_attempt(&self, client_id: &str) -> RateLimitDecision {
        self.try_begin_attempt_at(client_id, Utc::now())
    }

    pub fn try_begin_attempt_at(&self, client_id: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let count = match self.attempts.entry(client_id.to_string()) {
            Entry::Vacant(entry) => entry.insert(AttemptRecord::new(now)).count,
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if self.is_expired(record, now) {
                    info!("客户端 {} 的失败记录已过期，重新计数", client_id);
                    *record = AttemptRecord::new(now);
                    record.count
                } else if record.count >= self.config.max_attempts {
                    let retry_after_secs = self.retry_after_secs(record, now);
                    warn!(
                        "客户端 {} 登录尝试次数过多，{} 秒后可重试",
                        client_id, retry_after_secs
                    );
                    return RateLimitDecision::Denied { retry_after_secs };
                } else {
                    self.bump(client_id, record, now)
                }
            }
        };
        debug!("客户端 {} 预占第 {} 次登录尝试", client_id, count);
        RateLimitDecision::Allowed
    }

    pub fn reset_attempts(&self, client_id: &str) {
        if self.attempts.remove(client_id).is_some() {
            info!("客户端 {} 的登录失败记录已重置", client_id);
        }
    }

    pub fn status(&self, client_id: &str) -> Option<AttemptRecord> {
        self.attempts.get(client_id).map(|r| *r.value())
    }

    pub fn get_all_blocked(&self) -> Vec<BlockedClient> {
        self.get_all_blocked_at(Utc::now())
    }

    /// 当前被封禁的客户端快照，只读
    pub fn get_all_blocked_at(&self, now: DateTime<Utc>) -> Vec<BlockedClient> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut blocked: Vec<BlockedClient> = self
            .attempts
            .iter()
            .filter(|entry| self.is_blocked(entry.value(), now))
            .map(|entry| BlockedClient {
                client_id: entry.key().clone(),
                record: *entry.value(),
            })
            .collect();
        blocked.sort_by(|a, b| b.record.last_attempt.cmp(&a.record.last_attempt));
        blocked
    }

    /// 清理过期记录，返回清理数量
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        debug!("清理过期的登录失败记录");
        let mut removed = 0;
        self.attempts.retain(|_, record| {
            let keep = !self.is_expired(record, now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            info!("清理了 {} 条过期的登录失败记录", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    fn bump(&self, client_id: &str, record: &mut AttemptRecord, now: DateTime<Utc>) -> u32 {
        if now - record.first_attempt > self.config.attempt_window {
            debug!("客户端 {} 的统计窗口已结束，重新计数", client_id);
            *record = AttemptRecord::new(now);
        } else {
            record.count += 1;
            record.last_attempt = now;
        }
        record.count
    }

    fn is_expired(&self, record: &AttemptRecord, now: DateTime<Utc>) -> bool {
        now - record.last_attempt > self.config.block_duration
    }

    fn is_blocked(&self, record: &AttemptRecord, now: DateTime<Utc>) -> bool {
        record.count >= self.config.max_attempts && !self.is_expired(record, now)
    }

    fn retry_after_secs(&self, record: &AttemptRecord, now: DateTime<Utc>) -> u64 {
        let remaining_ms = (record.last_attempt + self.config.block_duration - now)
            .num_milliseconds()
            .max(0);
        ((remaining_ms + 999) / 1000) as u64
    }
}

/// 后台清理任务句柄，`shutdown` 或 drop 时取消定时器
pub struct CleanupHandle {
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    pub fn shutdown(mut self) {
        self.stop();
        info!("登录限流清理任务已停止");
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 启动定期清理任务，需要在 tokio 运行时中调用
pub fn start_cleanup(limiter: Arc<RateLimiter>) -> CleanupHandle {
    let period = limiter.config.cleanup_interval;
    info!("启动登录限流清理任务，间隔 {} 秒", period.as_secs());
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            ticker.tick().await;
            limiter.cleanup();
        }
    });
    CleanupHandle { task: Some(task) }
}
