//! 触发时间引擎：纯函数，无IO
//!
//! 核心契约：`next_trigger_time(job, previous) -> Option<时间>`。
//! DEPEND与FIXED_DELAY由外部事件驱动（前驱完成/上次执行完成），
//! 引擎对二者恒返回None。

use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use cron::Schedule;
use serde::Deserialize;

use disched_core::errors::{SchedulerError, SchedulerResult};
use disched_core::models::{Job, MisfireStrategy, TriggerType};

/// LAST策略追赶循环的上限；超出后直接按DISCARD语义收敛
const CATCH_UP_LIMIT: usize = 10_000;

const ONCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Deserialize)]
struct PeriodValue {
    period_seconds: i64,
}

/// 计算下一次触发时间
///
/// `previous`是本轮扫描的参考时刻（通常为now）。misfire语义：
/// - DISCARD：跳过全部已错过的触发点，从`max(base, previous)`直接前进；
/// - LAST：把所有错过的触发点坍缩为最近的一个；
/// - EVERY：每次只前进一格，调用方反复调用直至追平。
pub fn next_trigger_time(
    job: &Job,
    previous: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    let candidate = match job.trigger_type {
        TriggerType::Depend | TriggerType::FixedDelay => None,
        TriggerType::Once => once_trigger_time(job, previous)?,
        TriggerType::Cron | TriggerType::Period => recurring_trigger_time(job, previous)?,
    };
    Ok(clip_to_end(job, candidate))
}

fn once_trigger_time(job: &Job, previous: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
    // ONCE只触发一次，已有触发历史即不再产出
    if job.last_trigger_time.is_some() {
        return Ok(None);
    }
    let at = parse_once(&job.trigger_value)?;
    if job.misfire_strategy == MisfireStrategy::Discard && at < previous {
        // DISCARD从参考时刻起算，已过期的时间点直接作废
        Ok(None)
    } else {
        // LAST/EVERY下过期的时间点在首个机会立即补偿
        Ok(Some(at))
    }
}

fn recurring_trigger_time(
    job: &Job,
    previous: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    // start_time被改到last之后时，base仍取两者较大值
    let base = match (job.last_trigger_time, job.start_time) {
        (Some(last), Some(start)) => last.max(start),
        (Some(last), None) => last,
        (None, Some(start)) => start,
        (None, None) => previous,
    };

    if job.last_trigger_time.is_none() || job.misfire_strategy == MisfireStrategy::Discard {
        return advance_after(job, base.max(previous));
    }

    match job.misfire_strategy {
        MisfireStrategy::Every => advance_after(job, base),
        MisfireStrategy::Last => {
            let mut cursor = base;
            let mut last_missed: Option<DateTime<Utc>> = None;
            for _ in 0..CATCH_UP_LIMIT {
                let Some(candidate) = advance_after(job, cursor)? else {
                    return Ok(None);
                };
                if candidate >= previous {
                    // 坍缩为最近一次错过的触发；一个都没错过时取跨界候选本身
                    return Ok(Some(last_missed.unwrap_or(candidate)));
                }
                last_missed = Some(candidate);
                cursor = candidate;
            }
            advance_after(job, base.max(previous))
        }
        MisfireStrategy::Discard => unreachable!("DISCARD已在上方分支处理"),
    }
}

/// 严格晚于`after`的首个候选触发点
fn advance_after(job: &Job, after: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
    match job.trigger_type {
        TriggerType::Cron => {
            let schedule = parse_cron(&job.trigger_value)?;
            Ok(schedule.after(&after).next())
        }
        TriggerType::Period => {
            let period_ms = parse_period(&job.trigger_value)?.checked_mul(1000).ok_or_else(
                || SchedulerError::invalid_params("PERIOD周期过大"),
            )?;
            // 周期网格锚定在start_time（缺省回退到last/after）
            let anchor = job
                .start_time
                .or(job.last_trigger_time)
                .unwrap_or(after);
            let elapsed_ms = (after - anchor).num_milliseconds();
            let steps = elapsed_ms.div_euclid(period_ms) + 1;
            Ok(Some(anchor + Duration::milliseconds(steps * period_ms)))
        }
        _ => Ok(None),
    }
}

fn clip_to_end(job: &Job, candidate: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    candidate.filter(|c| job.end_time.is_none_or(|end| *c <= end))
}

/// 初始触发时间（任务创建/启用时调用）
///
/// FIXED_DELAY的首次触发从当前时刻起延迟一个周期；DEPEND无自主触发。
pub fn initial_trigger_time(job: &Job, now: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
    match job.trigger_type {
        TriggerType::Depend => Ok(None),
        TriggerType::FixedDelay => {
            let delay = parse_fixed_delay(&job.trigger_value)?;
            Ok(clip_to_end(job, Some(now + Duration::seconds(delay))))
        }
        _ => next_trigger_time(job, now),
    }
}

/// 校验trigger_value与trigger_type的编码匹配（管理边界同步拒绝）
pub fn verify_trigger(trigger_type: TriggerType, value: &str) -> SchedulerResult<()> {
    match trigger_type {
        TriggerType::Cron => parse_cron(value).map(|_| ()),
        TriggerType::Once => parse_once(value).map(|_| ()),
        TriggerType::Period => parse_period(value).map(|_| ()),
        TriggerType::FixedDelay => parse_fixed_delay(value).map(|_| ()),
        TriggerType::Depend => {
            for part in value.split(',') {
                part.trim().parse::<i64>().map_err(|_| {
                    SchedulerError::invalid_params(format!("DEPEND父任务id无效: {value}"))
                })?;
            }
            Ok(())
        }
    }
}

fn parse_cron(expr: &str) -> SchedulerResult<Schedule> {
    Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

fn parse_once(value: &str) -> SchedulerResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), ONCE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| {
            SchedulerError::invalid_params(format!("ONCE时间点无效（应为{ONCE_FORMAT}）: {value}"))
        })
}

fn parse_period(value: &str) -> SchedulerResult<i64> {
    let parsed: PeriodValue = serde_json::from_str(value)
        .map_err(|_| SchedulerError::invalid_params(format!("PERIOD周期编码无效: {value}")))?;
    if parsed.period_seconds <= 0 {
        return Err(SchedulerError::invalid_params("PERIOD周期必须为正数"));
    }
    Ok(parsed.period_seconds)
}

/// FIXED_DELAY的延迟秒数（实例完成后重新armed时使用）
pub fn parse_fixed_delay(value: &str) -> SchedulerResult<i64> {
    let delay: i64 = value
        .trim()
        .parse()
        .map_err(|_| SchedulerError::invalid_params(format!("FIXED_DELAY延迟秒数无效: {value}")))?;
    if delay <= 0 {
        return Err(SchedulerError::invalid_params("FIXED_DELAY延迟必须为正数"));
    }
    Ok(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use disched_core::models::TriggerType;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn secondly_job() -> Job {
        Job::new(
            "default".into(),
            "tick".into(),
            "noop".into(),
            TriggerType::Cron,
            "* * * * * *".into(),
        )
    }

    #[test]
    fn test_depend_and_fixed_delay_have_no_clock_trigger() {
        for (tt, value) in [(TriggerType::Depend, "1"), (TriggerType::FixedDelay, "30")] {
            let mut job = secondly_job();
            job.trigger_type = tt;
            job.trigger_value = value.into();
            assert_eq!(next_trigger_time(&job, at(10, 0, 0)).unwrap(), None);
        }
    }

    #[test]
    fn test_discard_without_history_starts_from_reference() {
        // 无触发历史：首个候选 >= max(start_time, previous)
        let mut job = secondly_job();
        job.misfire_strategy = MisfireStrategy::Discard;
        job.start_time = Some(at(9, 0, 0));
        let next = next_trigger_time(&job, at(10, 0, 0)).unwrap().unwrap();
        assert_eq!(next, at(10, 0, 1));

        // start_time在未来时从start_time起算
        job.start_time = Some(at(11, 0, 0));
        let next = next_trigger_time(&job, at(10, 0, 0)).unwrap().unwrap();
        assert_eq!(next, at(11, 0, 1));
    }

    #[test]
    fn test_discard_skips_missed_fires() {
        let mut job = secondly_job();
        job.misfire_strategy = MisfireStrategy::Discard;
        job.last_trigger_time = Some(at(10, 0, 0));
        // 错过了10:00:01..10:00:09，全部跳过
        let next = next_trigger_time(&job, at(10, 0, 10)).unwrap().unwrap();
        assert_eq!(next, at(10, 0, 11));
    }

    #[test]
    fn test_last_collapses_missed_fires_into_one() {
        let mut job = secondly_job();
        job.misfire_strategy = MisfireStrategy::Last;
        job.last_trigger_time = Some(at(10, 0, 0));
        // 错过N次只坍缩出一次：边界前最近的候选
        let next = next_trigger_time(&job, at(10, 0, 5)).unwrap().unwrap();
        assert_eq!(next, at(10, 0, 4));

        // 没有错过任何候选时返回跨界候选本身
        let next = next_trigger_time(&job, at(10, 0, 1)).unwrap().unwrap();
        assert_eq!(next, at(10, 0, 1));
    }

    #[test]
    fn test_every_replays_each_missed_fire_in_order() {
        let mut job = secondly_job();
        job.misfire_strategy = MisfireStrategy::Every;
        job.last_trigger_time = Some(at(10, 0, 0));
        let previous = at(10, 0, 3);

        // 恰好N次调用逐个追平
        let mut fired = Vec::new();
        for _ in 0..3 {
            let next = next_trigger_time(&job, previous).unwrap().unwrap();
            fired.push(next);
            job.last_trigger_time = Some(next);
        }
        assert_eq!(fired, vec![at(10, 0, 1), at(10, 0, 2), at(10, 0, 3)]);
    }

    #[test]
    fn test_end_time_clips_candidate() {
        let mut job = secondly_job();
        job.last_trigger_time = Some(at(10, 0, 0));
        job.end_time = Some(at(10, 0, 0));
        assert_eq!(next_trigger_time(&job, at(10, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_base_is_max_of_last_and_start() {
        // start_time被改到last_trigger_time之后：base必须取较大者
        let mut job = secondly_job();
        job.misfire_strategy = MisfireStrategy::Every;
        job.last_trigger_time = Some(at(10, 0, 0));
        job.start_time = Some(at(10, 30, 0));
        let next = next_trigger_time(&job, at(10, 0, 5)).unwrap().unwrap();
        assert_eq!(next, at(10, 30, 1));
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let mut job = secondly_job();
        job.trigger_type = TriggerType::Once;
        job.trigger_value = "2024-05-01 10:00:00".into();
        let next = next_trigger_time(&job, at(9, 0, 0)).unwrap().unwrap();
        assert_eq!(next, at(10, 0, 0));

        job.last_trigger_time = Some(at(10, 0, 0));
        assert_eq!(next_trigger_time(&job, at(11, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_once_misfire_semantics() {
        let mut job = secondly_job();
        job.trigger_type = TriggerType::Once;
        job.trigger_value = "2024-05-01 10:00:00".into();

        // DISCARD：过期即作废
        job.misfire_strategy = MisfireStrategy::Discard;
        assert_eq!(next_trigger_time(&job, at(10, 30, 0)).unwrap(), None);

        // LAST：首个机会立即补偿
        job.misfire_strategy = MisfireStrategy::Last;
        let next = next_trigger_time(&job, at(10, 30, 0)).unwrap().unwrap();
        assert_eq!(next, at(10, 0, 0));
    }

    #[test]
    fn test_period_advances_on_anchored_grid() {
        let mut job = secondly_job();
        job.trigger_type = TriggerType::Period;
        job.trigger_value = "{\"period_seconds\":60}".into();
        job.misfire_strategy = MisfireStrategy::Discard;
        job.start_time = Some(at(10, 0, 0));
        job.last_trigger_time = Some(at(10, 1, 0));
        // 错过10:02/10:03，DISCARD对齐网格跳到参考时刻后首格
        let next = next_trigger_time(&job, at(10, 3, 30)).unwrap().unwrap();
        assert_eq!(next, at(10, 4, 0));
    }

    #[test]
    fn test_initial_trigger_time_fixed_delay() {
        let mut job = secondly_job();
        job.trigger_type = TriggerType::FixedDelay;
        job.trigger_value = "30".into();
        let now = at(10, 0, 0);
        assert_eq!(initial_trigger_time(&job, now).unwrap(), Some(at(10, 0, 30)));
    }

    #[test]
    fn test_verify_trigger_rejects_malformed_values() {
        assert!(verify_trigger(TriggerType::Cron, "0 0 2 * * *").is_ok());
        assert!(verify_trigger(TriggerType::Cron, "not a cron").is_err());
        assert!(verify_trigger(TriggerType::Once, "2024-05-01 10:00:00").is_ok());
        assert!(verify_trigger(TriggerType::Once, "tomorrow").is_err());
        assert!(verify_trigger(TriggerType::Period, "{\"period_seconds\":5}").is_ok());
        assert!(verify_trigger(TriggerType::Period, "{\"period_seconds\":0}").is_err());
        assert!(verify_trigger(TriggerType::FixedDelay, "30").is_ok());
        assert!(verify_trigger(TriggerType::FixedDelay, "-1").is_err());
        assert!(verify_trigger(TriggerType::Depend, "1, 2").is_ok());
        assert!(verify_trigger(TriggerType::Depend, "1;2").is_err());
    }
}
