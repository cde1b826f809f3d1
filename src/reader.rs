use crate::domain::PserializeDomain;
use crate::state::{INACTIVE_EPOCH, ParticipantSlot, SharedState};
use crate::sync::{fence, Arc, Cell, Ordering};

#[cfg(debug_assertions)]
crate::sync::thread_local! {
    /// Read sections currently open on this thread, across all domains.
    static READ_DEPTH: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

#[inline]
fn note_enter() {
    #[cfg(debug_assertions)]
    READ_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

#[inline]
fn note_exit() {
    #[cfg(debug_assertions)]
    READ_DEPTH.with(|depth| {
        let current = depth.get();
        assert!(
            current > 0,
            "BUG: read_exit without a matching read_enter on this thread"
        );
        depth.set(current - 1);
    });
}

/// Returns true if the calling thread is inside any read section.
///
/// Only tracked in debug builds; release builds always report `false`.
///
/// 如果调用线程位于任何读区段内则返回 true。
/// 仅在调试构建中跟踪；发布构建总是返回 `false`。
#[inline]
pub fn in_read_section() -> bool {
    #[cfg(debug_assertions)]
    {
        READ_DEPTH.with(|depth| depth.get() > 0)
    }
    #[cfg(not(debug_assertions))]
    {
        false
    }
}

/// Panics if the calling thread is inside a read section.
///
/// Every operation that may sleep calls this first: blocking inside a read
/// section would keep `synchronize` from ever observing quiescence.
///
/// 如果调用线程位于读区段内则 panic。
/// 每个可能睡眠的操作都会先调用它。
#[inline]
#[track_caller]
pub(crate) fn assert_sleepable(operation: &'static str) {
    #[cfg(debug_assertions)]
    assert!(
        !in_read_section(),
        "BUG: {operation} may block and must not be called inside a read section"
    );
    #[cfg(not(debug_assertions))]
    let _ = operation;
}

/// One registered participant of a passive serialization domain.
///
/// Each thread that runs read sections should own exactly one `Participant`,
/// obtained via `PserializeDomain::register_participant()`. It is `!Sync`
/// (due to `Cell`) and must be used by one thread at a time.
///
/// Dropping the participant unregisters it lazily: the domain reaps its slot
/// during a later `synchronize`.
///
/// 被动串行化域的一个已注册参与者。
/// 每个运行读区段的线程应持有一个 `Participant`，且同一时间只能由一个线程使用。
/// 丢弃参与者会延迟注销：域会在之后的 `synchronize` 中回收其槽。
pub struct Participant {
    slot: Arc<ParticipantSlot>,
    shared: Arc<SharedState>,
    depth: Cell<usize>,
}

impl Participant {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        let slot = Arc::new(ParticipantSlot::new());

        shared.participants.lock().push(Arc::clone(&slot));
        log::trace!("pserialize: participant registered");

        Participant {
            slot,
            shared,
            depth: Cell::new(0),
        }
    }

    /// Begin a read section.
    ///
    /// Never blocks. The section lasts until the returned `ReadSection` is
    /// dropped (or passed to `ReadSection::exit`). While it is open, any
    /// object unlinked by a writer after the section began stays valid,
    /// because the writer's `synchronize` waits for this section to end.
    ///
    /// Sections nest: only the outermost one publishes and clears the epoch.
    ///
    /// Nothing inside the section may block. In debug builds, blocking
    /// operations of this crate panic when called inside one.
    ///
    /// 开始一个读区段。
    /// 从不阻塞。区段持续到返回的 `ReadSection` 被丢弃。区段可以嵌套：
    /// 只有最外层的区段发布和清除纪元。区段内不得阻塞。
    #[inline]
    pub fn read_enter(&self) -> ReadSection<'_> {
        let depth = self.depth.get();

        if depth == 0 {
            let current_epoch = self.shared.global_epoch.load(Ordering::Relaxed);
            self.slot
                .active_epoch
                .store(current_epoch, Ordering::Relaxed);
            // Pairs with the fence in `synchronize`: either the writer sees
            // this store, or this section sees everything the writer
            // unlinked before advancing the epoch.
            fence(Ordering::SeqCst);
        }

        self.depth.set(depth + 1);
        note_enter();

        ReadSection { participant: self }
    }

    pub(crate) fn belongs_to(&self, domain: &PserializeDomain) -> bool {
        Arc::ptr_eq(&self.shared, &domain.shared)
    }

    /// True while this participant has an open read section.
    /// 当该参与者有打开的读区段时为 true。
    #[inline]
    pub fn is_reading(&self) -> bool {
        self.depth.get() > 0
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("depth", &self.depth.get())
            .finish()
    }
}

/// The token of an open read section.
///
/// `ReadSection` is obtained by calling `Participant::read_enter()`. It is
/// `!Send` and `!Sync` because it references a `!Sync` `Participant`, and its
/// lifetime is bound to that participant.
///
/// Cloning opens a nested section on the same participant; the participant
/// stays inside its read section until every clone is dropped.
///
/// 打开的读区段的令牌。
/// `ReadSection` 是 `!Send` 和 `!Sync` 的，其生命周期绑定到参与者。
/// 克隆会在同一参与者上打开嵌套区段。
#[must_use]
pub struct ReadSection<'a> {
    participant: &'a Participant,
}

impl<'a> ReadSection<'a> {
    /// End the section explicitly. Equivalent to dropping it.
    /// 显式结束区段。等价于丢弃它。
    #[inline]
    pub fn exit(self) {
        drop(self);
    }
}

impl<'a> Clone for ReadSection<'a> {
    #[inline]
    fn clone(&self) -> Self {
        let depth = self.participant.depth.get();

        assert!(
            depth > 0,
            "BUG: Cloning a ReadSection outside a read section (depth = 0). \
             This indicates incorrect API usage or a library bug."
        );

        self.participant.depth.set(depth + 1);
        note_enter();

        ReadSection {
            participant: self.participant,
        }
    }
}

impl<'a> Drop for ReadSection<'a> {
    #[inline]
    fn drop(&mut self) {
        let depth = self.participant.depth.get();

        assert!(
            depth > 0,
            "BUG: read_exit without a matching read_enter (depth = 0). \
             This indicates incorrect API usage or a library bug."
        );

        if depth == 1 {
            self.participant
                .slot
                .active_epoch
                .store(INACTIVE_EPOCH, Ordering::Release);
        }

        self.participant.depth.set(depth - 1);
        note_exit();
    }
}
