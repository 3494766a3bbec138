//! 固定间隔重试。
//!
//! 首次请求失败后最多再试 `max_retries` 次，每次之间等待 `retry_wait_ms`。

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::warn;

use super::context::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.max_retries,
            wait: cfg.retry_wait(),
        }
    }

    /// 总尝试次数（含首次）。
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// 重试耗尽时带回最后一次错误。
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

pub fn with_retry<T, E, F>(policy: RetryPolicy, label: &str, op: F) -> Result<T, Exhausted<E>>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    with_retry_if(policy, label, |_| true, op)
}

/// 同 [`with_retry`]，但 `retryable` 返回 false 的错误立即返回。
pub fn with_retry_if<T, E, P, F>(
    policy: RetryPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) if !retryable(&err) => {
                warn!(target: "retry", label, attempt, "错误不可重试: {err}");
                return Err(Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) if attempt >= max_attempts => {
                warn!(target: "retry", label, attempt, "重试次数已用尽: {err}");
                return Err(Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                warn!(target: "retry", label, attempt, max_attempts, "请求失败，稍后重试: {err}");
                if !policy.wait.is_zero() {
                    thread::sleep(policy.wait);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            wait: Duration::ZERO,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let out = with_retry(policy(3), "test", || {
            calls += 1;
            if calls < 3 { Err("busy") } else { Ok(calls) }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_retries_plus_one() {
        let mut calls = 0;
        let err = with_retry(policy(3), "test", || -> Result<(), String> {
            calls += 1;
            Err(format!("fail {calls}"))
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last, "fail 4");
    }

    #[test]
    fn permanent_errors_stop_immediately() {
        let mut calls = 0;
        let err = with_retry_if(
            policy(3),
            "test",
            |e: &String| !e.starts_with("bad"),
            || -> Result<(), String> {
                calls += 1;
                Err(if calls == 1 { "busy".into() } else { "bad payload".into() })
            },
        )
        .unwrap_err();
        assert_eq!(calls, 2);
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last, "bad payload");
    }

    #[test]
    fn policy_reads_config() {
        let cfg = Config {
            max_retries: 2,
            retry_wait_ms: 250,
            ..Config::default()
        };
        let p = RetryPolicy::from_config(&cfg);
        assert_eq!(p.max_attempts(), 3);
        assert_eq!(p.wait, Duration::from_millis(250));
    }
}
