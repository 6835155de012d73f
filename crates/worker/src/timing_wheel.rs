use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use disched_core::models::DispatchPayload;

/// 槽内条目：rounds为0时本圈到期
struct WheelEntry {
    rounds: u64,
    payload: DispatchPayload,
}

struct WheelState {
    /// 环形槽位，游标每tick前进一格
    slots: Vec<HashMap<i64, WheelEntry>>,
    cursor: usize,
    /// task_id -> 所在槽位，保证同一task只占一个槽
    index: HashMap<i64, usize>,
}

/// Worker侧时间轮
///
/// 固定槽数的环形缓冲，tick分辨率由调用方的转动周期决定。
/// 延迟超过一圈的条目带rounds计数，游标经过时递减，归零才出轮。
/// 以task_id为键幂等：重复投递同一task不产生重复条目。
pub struct TimingWheel {
    inner: Mutex<WheelState>,
    slot_count: usize,
    tick_ms: u64,
}

impl TimingWheel {
    pub fn new(slot_count: usize, tick_ms: u64) -> Self {
        let slot_count = slot_count.max(2);
        Self {
            inner: Mutex::new(WheelState {
                slots: (0..slot_count).map(|_| HashMap::new()).collect(),
                cursor: 0,
                index: HashMap::new(),
            }),
            slot_count,
            tick_ms: tick_ms.max(1),
        }
    }

    /// 按trigger_time放入时间轮；已过期的条目落在下一tick立即到期
    ///
    /// 返回false表示该task已在轮中，本次投递被幂等吸收。
    pub fn offer(&self, payload: DispatchPayload, now: DateTime<Utc>) -> bool {
        let delay_ms = (payload.trigger_time - now).num_milliseconds().max(0) as u64;
        let ticks = (delay_ms / self.tick_ms).max(1);

        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.index.contains_key(&payload.task_id) {
            return false;
        }
        // tick()先进格再清扫，落在当前游标格即等满一整圈
        let slot = (state.cursor + (ticks as usize % self.slot_count)) % self.slot_count;
        let rounds = (ticks - 1) / self.slot_count as u64;
        let task_id = payload.task_id;
        state.slots[slot].insert(task_id, WheelEntry { rounds, payload });
        state.index.insert(task_id, slot);
        true
    }

    /// 未到期即被取消/暂停时移除
    pub fn remove(&self, task_id: i64) -> Option<DispatchPayload> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let slot = state.index.remove(&task_id)?;
        state.slots[slot].remove(&task_id).map(|e| e.payload)
    }

    /// 游标前进一格，返回本槽到期的全部条目
    pub fn tick(&self) -> Vec<DispatchPayload> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.cursor = (state.cursor + 1) % self.slot_count;
        let cursor = state.cursor;

        let mut due = Vec::new();
        let mut stay = HashMap::new();
        for (task_id, mut entry) in state.slots[cursor].drain() {
            if entry.rounds == 0 {
                due.push((task_id, entry.payload));
            } else {
                entry.rounds -= 1;
                stay.insert(task_id, entry);
            }
        }
        state.slots[cursor] = stay;
        due.iter().for_each(|(task_id, _)| {
            state.index.remove(task_id);
        });
        due.into_iter().map(|(_, payload)| payload).collect()
    }

    /// 清空时间轮，返回全部未到期条目（进程关闭时处置用）
    pub fn drain_all(&self) -> Vec<DispatchPayload> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.index.clear();
        state
            .slots
            .iter_mut()
            .flat_map(|slot| slot.drain().map(|(_, entry)| entry.payload))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .index
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use disched_core::models::{
        JobType, Operation, RouteStrategy, ServerIdentity, ShutdownStrategy,
    };

    fn payload(task_id: i64, trigger_time: DateTime<Utc>) -> DispatchPayload {
        DispatchPayload {
            operation: Operation::Trigger,
            task_id,
            task_no: 1,
            task_count: 1,
            instance_id: 1,
            workflow_instance_id: None,
            trigger_time,
            job_id: 1,
            job_type: JobType::Normal,
            job_handler: "noop".to_string(),
            task_param: String::new(),
            route_strategy: RouteStrategy::RoundRobin,
            shutdown_strategy: ShutdownStrategy::Resume,
            execute_timeout_ms: 60_000,
            supervisor_token: String::new(),
            worker: ServerIdentity::new("default", "w1", "127.0.0.1", 8200),
        }
    }

    #[test]
    fn test_past_due_entry_fires_on_next_tick() {
        let wheel = TimingWheel::new(60, 1000);
        let now = Utc::now();
        assert!(wheel.offer(payload(1, now - Duration::seconds(30)), now));
        let due = wheel.tick();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_entry_fires_after_its_delay() {
        let wheel = TimingWheel::new(60, 1000);
        let now = Utc::now();
        wheel.offer(payload(1, now + Duration::seconds(3)), now);
        assert!(wheel.tick().is_empty());
        assert!(wheel.tick().is_empty());
        let due = wheel.tick();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_delay_beyond_one_round_waits_extra_rounds() {
        let wheel = TimingWheel::new(4, 1000);
        let now = Utc::now();
        // 6 tick延迟 = 1圈 + 2格
        wheel.offer(payload(1, now + Duration::seconds(6)), now);
        for _ in 0..5 {
            assert!(wheel.tick().is_empty());
        }
        assert_eq!(wheel.tick().len(), 1);
    }

    #[test]
    fn test_offer_is_idempotent_per_task() {
        let wheel = TimingWheel::new(60, 1000);
        let now = Utc::now();
        assert!(wheel.offer(payload(9, now), now));
        assert!(!wheel.offer(payload(9, now), now));
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.tick().len(), 1);
    }

    #[test]
    fn test_remove_before_fire() {
        let wheel = TimingWheel::new(60, 1000);
        let now = Utc::now();
        wheel.offer(payload(5, now + Duration::seconds(2)), now);
        assert!(wheel.remove(5).is_some());
        assert!(wheel.remove(5).is_none());
        for _ in 0..5 {
            assert!(wheel.tick().is_empty());
        }
    }
}
