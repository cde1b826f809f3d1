use crate::reader::assert_sleepable;
use crate::sync::{Arc, AtomicBool, AtomicUsize, Condvar, Mutex, Ordering};
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::ptr::NonNull;

/// High bit of a target's state word: set once the target starts retiring.
const RETIRING: usize = 1 << (usize::BITS - 1);

/// Remaining bits: number of bound references.
const COUNT_MASK: usize = !RETIRING;

/// Returned by `PsrefTarget::acquire` when the target has started retiring.
///
/// This is transient contention, not a failure: the caller re-reads the
/// pointer it found the target through and retries against the new object.
///
/// 当目标已开始退休时由 `PsrefTarget::acquire` 返回。
/// 这是暂时的竞争而非失败：调用者重新读取指针并针对新对象重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("psref target is retiring")]
pub struct Retired;

#[derive(Debug)]
struct ClassInner {
    name: String,
    targets: AtomicUsize,
}

/// A class of passive references.
///
/// Every target belongs to exactly one class; acquiring a target through a
/// different class is a bug. Targets keep their class alive, so a class is
/// never torn down while any target of it exists.
///
/// 被动引用的类。
/// 每个目标恰好属于一个类；通过其他类获取目标是一个 bug。
#[derive(Debug, Clone)]
pub struct PsrefClass {
    inner: Arc<ClassInner>,
}

impl PsrefClass {
    /// Create a new class with a diagnostic name.
    /// 创建一个带有诊断名称的新类。
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        log::trace!("psref: class `{name}` created");
        Self {
            inner: Arc::new(ClassInner {
                name,
                targets: AtomicUsize::new(0),
            }),
        }
    }

    /// The name given at creation.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of targets of this class that have not been dropped.
    /// 该类中尚未被丢弃的目标数量。
    #[inline]
    pub fn target_count(&self) -> usize {
        self.inner.targets.load(Ordering::Relaxed)
    }

    #[inline]
    fn same(&self, other: &PsrefClass) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// The reference-counted anchor embedded in each shared object.
///
/// A target counts the `Psref` slots bound to it. `destroy` marks it retiring
/// (after which `acquire` fails with `Retired`) and blocks until the count
/// reaches zero. Dropping a target performs the same wait, so the memory of
/// a pinned target can never be released under a live reference.
///
/// `PsrefTarget` is `!Unpin`: references are taken through `Pin<&Self>`.
///
/// ```
/// use psz_sync::{PsrefClass, PsrefTarget};
///
/// let class = PsrefClass::new("demo");
/// let target = Box::pin(PsrefTarget::new(&class));
///
/// let psref = target.as_ref().acquire(&class).unwrap();
/// assert!(target.held());
/// psref.release();
///
/// target.destroy();
/// assert!(target.as_ref().acquire(&class).is_err());
/// ```
///
/// 嵌入在每个共享对象中的引用计数锚点。
/// `destroy` 将其标记为退休（之后 `acquire` 返回 `Retired`），并阻塞直到计数归零。
/// 丢弃目标会执行同样的等待，因此被钉住的目标内存绝不会在活跃引用下被释放。
pub struct PsrefTarget {
    /// `RETIRING | count`.
    state: AtomicUsize,
    class: PsrefClass,
    destroying: AtomicBool,
    lock: Mutex<()>,
    drained: Condvar,
    _pinned: PhantomPinned,
}

impl PsrefTarget {
    /// Initialise a live target with no references.
    /// 初始化一个没有引用的活跃目标。
    pub fn new(class: &PsrefClass) -> Self {
        class.inner.targets.fetch_add(1, Ordering::Relaxed);
        Self {
            state: AtomicUsize::new(0),
            class: class.clone(),
            destroying: AtomicBool::new(false),
            lock: Mutex::new(()),
            drained: Condvar::new(),
            _pinned: PhantomPinned,
        }
    }

    /// Take a reference to this target.
    ///
    /// Never blocks. Fails with `Retired` if `destroy` has started; on success
    /// the target will not finish retiring until the returned `Psref` is
    /// released.
    ///
    /// The caller must have reached the target in a way that keeps it valid
    /// for the duration of this call, typically from inside a read section.
    ///
    /// # Panics
    /// If `class` is not the class the target was created with.
    ///
    /// 获取对该目标的引用。
    /// 从不阻塞。如果 `destroy` 已开始则返回 `Retired`。
    #[inline]
    #[track_caller]
    pub fn acquire(self: Pin<&Self>, class: &PsrefClass) -> Result<Psref, Retired> {
        assert!(
            self.class.same(class),
            "BUG: psref acquire through class `{}` on a target of class `{}`",
            class.name(),
            self.class.name()
        );

        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & RETIRING != 0 {
                return Err(Retired);
            }
            assert!(
                state & COUNT_MASK != COUNT_MASK,
                "BUG: psref count overflow on class `{}`",
                self.class.name()
            );
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        Ok(Psref {
            target: NonNull::from(self.get_ref()),
            _not_send: PhantomData,
        })
    }

    /// True while any `Psref` is bound to this target.
    ///
    /// Diagnostic only: the answer can be stale by the time it is used.
    ///
    /// 当有任何 `Psref` 绑定到该目标时为 true。仅用于诊断。
    #[inline]
    pub fn held(&self) -> bool {
        self.state.load(Ordering::Acquire) & COUNT_MASK != 0
    }

    /// Number of `Psref` slots currently bound to this target.
    /// 当前绑定到该目标的 `Psref` 槽数量。
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    /// True once `destroy` (or a retiring writer) has started.
    #[inline]
    pub fn is_retiring(&self) -> bool {
        self.state.load(Ordering::Acquire) & RETIRING != 0
    }

    /// The class this target belongs to.
    #[inline]
    pub fn class(&self) -> &PsrefClass {
        &self.class
    }

    /// Retire the target and wait until every bound reference is released.
    ///
    /// After this returns `acquire` always fails and the count is zero, so
    /// the object embedding the target may be reclaimed.
    ///
    /// # Panics
    /// If a second `destroy` is issued for the same target, or (debug builds)
    /// if called inside a read section.
    ///
    /// 使目标退休并等待所有绑定的引用被释放。
    /// 返回后 `acquire` 总是失败且计数为零，嵌入该目标的对象可以被回收。
    #[track_caller]
    pub fn destroy(&self) {
        assert_sleepable("PsrefTarget::destroy");
        assert!(
            !self.destroying.swap(true, Ordering::AcqRel),
            "BUG: psref target of class `{}` destroyed twice",
            self.class.name()
        );
        self.retire();
        self.wait_drained();
    }

    /// Mark the target retiring without waiting. New `acquire`s fail from now on.
    #[inline]
    pub(crate) fn retire(&self) {
        let _guard = self.lock.lock();
        self.state.fetch_or(RETIRING, Ordering::AcqRel);
    }

    /// Block until the count of a retiring target reaches zero.
    pub(crate) fn wait_drained(&self) {
        let mut guard = self.lock.lock();
        let outstanding = self.state.load(Ordering::Acquire) & COUNT_MASK;
        if outstanding != 0 {
            log::debug!(
                "psref: waiting for {outstanding} reference(s) on class `{}` to drain",
                self.class.name()
            );
        }
        while self.state.load(Ordering::Acquire) & COUNT_MASK != 0 {
            guard = self.drained.wait(guard);
        }
    }

    fn release(&self) {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            assert!(
                state & COUNT_MASK != 0,
                "BUG: psref release without acquire on class `{}`",
                self.class.name()
            );

            if state & RETIRING != 0 {
                // Once retiring, the count only drops under the lock, so the
                // destroyer cannot observe zero and free us mid-release.
                let _guard = self.lock.lock();
                let prev = self.state.fetch_sub(1, Ordering::Release);
                if prev & COUNT_MASK == 1 {
                    self.drained.notify_all();
                }
                return;
            }

            match self.state.compare_exchange_weak(
                state,
                state - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }
}

impl Drop for PsrefTarget {
    fn drop(&mut self) {
        if !self.destroying.load(Ordering::Acquire) {
            self.retire();
            self.wait_drained();
        }
        self.class.inner.targets.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PsrefTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsrefTarget")
            .field("class", &self.class.name())
            .field("refs", &self.ref_count())
            .field("retiring", &self.is_retiring())
            .finish()
    }
}

/// A passive reference slot bound to one `PsrefTarget`.
///
/// Dropping the slot releases it. `Psref` is `!Send` and `!Sync`: it belongs
/// to the thread that acquired it.
///
/// 绑定到一个 `PsrefTarget` 的被动引用槽。
/// 丢弃即释放。`Psref` 属于获取它的线程。
#[must_use]
pub struct Psref {
    target: NonNull<PsrefTarget>,
    _not_send: PhantomData<*mut ()>,
}

impl Psref {
    /// Release the reference explicitly. Equivalent to dropping it.
    /// 显式释放引用。等价于丢弃它。
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    /// True if this slot is bound to `target`.
    #[inline]
    pub fn is_bound_to(&self, target: &PsrefTarget) -> bool {
        std::ptr::eq(self.target.as_ptr(), target)
    }
}

impl Drop for Psref {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the target is pinned and its drop (or destroy) waits for
        // this count to reach zero before the memory can go away.
        let target = unsafe { self.target.as_ref() };
        target.release();
    }
}

impl std::fmt::Debug for Psref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Psref").field(&self.target).finish()
    }
}
