use crate::sync::{Arc, AtomicUsize, Mutex, Ordering};
use std::time::Duration;
use std::vec::Vec;

/// Default number of polls of a busy participant before `synchronize` starts yielding.
/// `synchronize` 开始让出 CPU 之前轮询忙碌参与者的默认次数。
pub(crate) const DEFAULT_SPIN_LIMIT: usize = 64;

/// Default interval for reaping participant slots whose handle was dropped
/// (in `synchronize` calls).
/// 清理句柄已被丢弃的参与者槽的默认间隔（以 `synchronize` 调用次数为单位）。
pub(crate) const DEFAULT_CLEANUP_INTERVAL: usize = 16;

/// Default grace-period duration after which a waiting writer logs a warning.
/// 等待中的写者记录警告之前的默认宽限期时长。
pub(crate) const DEFAULT_SLOW_WAIT_WARNING: Duration = Duration::from_secs(1);

/// Represents a participant that is not currently inside a read section.
/// 表示当前不在读区段内的参与者。
pub(crate) const INACTIVE_EPOCH: usize = usize::MAX;

/// A slot allocated for one participant to record the epoch it entered its
/// read section at.
///
/// Cache-aligned to prevent false sharing between participants.
///
/// 为参与者分配的槽，用于记录其进入读区段时的纪元。
/// 缓存对齐以防止参与者之间的伪共享。
#[derive(Debug)]
#[repr(align(64))]
pub(crate) struct ParticipantSlot {
    /// The epoch observed at `read_enter`, or INACTIVE_EPOCH.
    /// `read_enter` 时观察到的纪元，或 INACTIVE_EPOCH。
    pub(crate) active_epoch: AtomicUsize,
}

impl ParticipantSlot {
    pub(crate) fn new() -> Self {
        Self {
            active_epoch: AtomicUsize::new(INACTIVE_EPOCH),
        }
    }

    /// True once this slot can no longer hold up a grace period that
    /// started at `target`.
    #[inline]
    pub(crate) fn is_quiescent(&self, target: usize) -> bool {
        let epoch = self.active_epoch.load(Ordering::Acquire);
        epoch == INACTIVE_EPOCH || epoch >= target
    }
}

/// Tunables copied out of the builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DomainConfig {
    pub(crate) spin_limit: usize,
    pub(crate) cleanup_interval: usize,
    pub(crate) slow_wait_warning: Option<Duration>,
}

/// Global shared state for one passive serialization domain.
/// 一个被动串行化域的全局共享状态。
#[derive(Debug)]
#[repr(align(64))]
pub(crate) struct SharedState {
    /// The global monotonic epoch counter.
    /// 全局单调纪元计数器。
    pub(crate) global_epoch: AtomicUsize,
    /// Number of completed `synchronize` calls, drives slot reaping.
    pub(crate) sync_counter: AtomicUsize,
    /// List of all registered participant slots.
    /// 所有注册参与者槽的列表。由 Mutex 保护。
    pub(crate) participants: Mutex<Vec<Arc<ParticipantSlot>>>,
    pub(crate) config: DomainConfig,
}
