use crate::reader::{assert_sleepable, Participant};
use crate::state::{
    DomainConfig, ParticipantSlot, SharedState, DEFAULT_CLEANUP_INTERVAL, DEFAULT_SLOW_WAIT_WARNING,
    DEFAULT_SPIN_LIMIT,
};
use crate::sync::{fence, spin_loop, yield_now, Arc, AtomicUsize, Mutex, Ordering};
use std::time::{Duration, Instant};
use std::vec::Vec;

/// Builder for configuring a `PserializeDomain`.
///
/// - `spin_limit`: polls of a busy participant before `synchronize` yields the CPU
/// - `cleanup_interval`: how often dropped participants are reaped
/// - `slow_wait_warning`: grace-period duration after which a warning is logged
///
/// # Example
/// ```
/// use psz_sync::PserializeDomain;
/// use std::time::Duration;
///
/// let domain = PserializeDomain::builder()
///     .spin_limit(128)
///     .cleanup_interval(32)
///     .slow_wait_warning(Duration::from_millis(250))
///     .build();
/// ```
///
/// 用于配置 `PserializeDomain` 的构建器。
pub struct PserializeDomainBuilder {
    spin_limit: usize,
    cleanup_interval: usize,
    slow_wait_warning: Option<Duration>,
}

impl PserializeDomainBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            spin_limit: DEFAULT_SPIN_LIMIT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            slow_wait_warning: Some(DEFAULT_SLOW_WAIT_WARNING),
        }
    }

    /// Set how many times `synchronize` re-polls a participant that is still
    /// inside an old read section before it starts yielding between polls.
    ///
    /// Default: `64`
    ///
    /// 设置 `synchronize` 在开始让出 CPU 之前重新轮询仍处于旧读区段内的参与者的次数。
    #[inline]
    pub fn spin_limit(mut self, limit: usize) -> Self {
        self.spin_limit = limit;
        self
    }

    /// Set the cleanup interval for dropped participants.
    ///
    /// Dead slots are reaped every N `synchronize` calls. Set to `0` to
    /// disable reaping (not recommended).
    ///
    /// Default: `16`
    ///
    /// 设置已丢弃参与者的清理间隔。
    /// 每 N 次 `synchronize` 调用回收一次死槽。设置为 `0` 可禁用回收（不推荐）。
    #[inline]
    pub fn cleanup_interval(mut self, interval: usize) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the duration after which a writer still waiting for a grace period
    /// logs a warning. Pass `None` to disable.
    ///
    /// Default: `Some(1s)`
    ///
    /// 设置写者等待宽限期多久之后记录警告。传递 `None` 可禁用。
    #[inline]
    pub fn slow_wait_warning(mut self, after: impl Into<Option<Duration>>) -> Self {
        self.slow_wait_warning = after.into();
        self
    }

    /// Build the `PserializeDomain` with the configured settings.
    /// 使用配置的设置构建 `PserializeDomain`。
    #[inline]
    pub fn build(self) -> PserializeDomain {
        let shared = Arc::new(SharedState {
            global_epoch: AtomicUsize::new(0),
            sync_counter: AtomicUsize::new(0),
            participants: Mutex::new(Vec::new()),
            config: DomainConfig {
                spin_limit: self.spin_limit,
                cleanup_interval: self.cleanup_interval,
                slow_wait_warning: self.slow_wait_warning,
            },
        });

        PserializeDomain { shared }
    }
}

impl Default for PserializeDomainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A passive serialization domain.
///
/// Readers register a `Participant` and bracket short, non-blocking accesses
/// with `read_enter()`. A writer that has unlinked an object from every shared
/// pointer calls `synchronize()`, which returns once every read section that
/// could have observed the object has ended.
///
/// `PserializeDomain` is `Clone` and cheap to share: typically one domain is
/// created at startup and cloned into every subsystem that needs it.
///
/// ```
/// use psz_sync::PserializeDomain;
///
/// let domain = PserializeDomain::new();
/// let participant = domain.register_participant();
///
/// let section = participant.read_enter();
/// // read shared pointers...
/// section.exit();
///
/// domain.synchronize();
/// ```
///
/// 被动串行化域。
/// 读者注册 `Participant` 并用 `read_enter()` 包裹短小、非阻塞的访问。
/// 写者在解除对象的所有共享链接后调用 `synchronize()`，
/// 它在所有可能观察到该对象的读区段结束后返回。
#[derive(Clone)]
pub struct PserializeDomain {
    pub(crate) shared: Arc<SharedState>,
}

impl PserializeDomain {
    /// Create a new domain with default settings.
    /// 使用默认设置创建新域。
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the domain.
    /// 创建用于配置域的构建器。
    #[inline]
    pub fn builder() -> PserializeDomainBuilder {
        PserializeDomainBuilder::new()
    }

    /// Register a new participant for the current thread.
    ///
    /// The caller is responsible for keeping each `Participant` on one thread
    /// at a time.
    ///
    /// 为当前线程注册一个新参与者。
    #[inline]
    pub fn register_participant(&self) -> Participant {
        Participant::new(self.shared.clone())
    }

    /// The current global epoch.
    /// 当前全局纪元。
    #[inline]
    pub fn epoch(&self) -> usize {
        self.shared.global_epoch.load(Ordering::Acquire)
    }

    /// Number of participant slots currently tracked, including dropped
    /// participants that have not been reaped yet.
    /// 当前跟踪的参与者槽数量，包括尚未回收的已丢弃参与者。
    pub fn participant_count(&self) -> usize {
        self.shared.participants.lock().len()
    }

    /// Duration after which slow writers log a warning.
    /// 慢速写者记录警告之前的时长。
    #[inline]
    pub fn slow_wait_warning(&self) -> Option<Duration> {
        self.shared.config.slow_wait_warning
    }

    /// Wait for every read section that began before this call to end.
    ///
    /// 1. Advances the global epoch.
    /// 2. Snapshots the registered participants (reaping dropped ones every
    ///    `cleanup_interval` calls).
    /// 3. Polls each participant until it is outside any read section or
    ///    inside one that began at the new epoch or later.
    ///
    /// Once this returns, memory that was unlinked before the call can no
    /// longer be reached by any reader and may be reclaimed.
    ///
    /// # Panics
    /// In debug builds, if the calling thread is inside a read section.
    ///
    /// 等待在此调用之前开始的所有读区段结束。
    /// 返回后，调用前已解除链接的内存不再能被任何读者访问，可以回收。
    #[track_caller]
    pub fn synchronize(&self) {
        assert_sleepable("PserializeDomain::synchronize");

        let target = self.shared.global_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        fence(Ordering::SeqCst);
        log::trace!("pserialize: synchronize advanced epoch to {target}");

        let snapshot = self.snapshot_participants();
        let started = Instant::now();
        let mut warned = false;

        for slot in snapshot.iter() {
            let mut polls = 0usize;
            while !slot.is_quiescent(target) {
                polls += 1;
                if polls < self.shared.config.spin_limit {
                    spin_loop();
                } else {
                    yield_now();
                }

                if !warned {
                    if let Some(limit) = self.shared.config.slow_wait_warning {
                        let waited = started.elapsed();
                        if waited >= limit {
                            log::warn!("pserialize: epoch {target} grace period at {waited:?}");
                            warned = true;
                        }
                    }
                }
            }
        }

        fence(Ordering::SeqCst);
    }

    fn snapshot_participants(&self) -> Vec<Arc<ParticipantSlot>> {
        let calls = self.shared.sync_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = self.shared.config.cleanup_interval;
        let should_cleanup = interval > 0 && calls % interval == 0;

        let mut participants = self.shared.participants.lock();

        if should_cleanup {
            let before = participants.len();
            // Only this Vec holds a reference once the Participant was dropped
            participants.retain(|slot| Arc::strong_count(slot) > 1);
            let reaped = before - participants.len();
            if reaped > 0 {
                log::debug!("pserialize: reaped {reaped} dropped participant(s)");
            }
        }

        participants.iter().cloned().collect()
    }
}

impl Default for PserializeDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PserializeDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PserializeDomain")
            .field("epoch", &self.epoch())
            .field("participants", &self.participant_count())
            .finish()
    }
}
