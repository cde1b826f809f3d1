use crate::domain::PserializeDomain;
use crate::psref::{Psref, PsrefClass, PsrefTarget};
use crate::reader::{assert_sleepable, Participant};
use crate::sync::{spin_loop, AtomicPtr, Ordering};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::pin::Pin;
use std::ptr::{self, NonNull};

/// One published configuration plus the target readers pin it through.
struct Variant<T> {
    value: ManuallyDrop<T>,
    target: PsrefTarget,
}

/// A swap root: the single published pointer to the current variant of a
/// logical object.
///
/// Readers call `get()` from any thread; it never blocks and returns a
/// `VariantRef` that keeps the variant it observed alive, even across
/// blocking operations, until it is dropped.
///
/// The writer path (`replace()`, `clear()`) republishes the root and then
/// waits until every reader of the superseded variant has let go, handing the
/// old value back. Consumers serialize writers with their own lock; the root
/// itself stays memory-safe even if they do not.
///
/// ```
/// use psz_sync::{PserializeDomain, PsrefClass, VariantRoot};
///
/// let domain = PserializeDomain::new();
/// let class = PsrefClass::new("config");
/// let root = VariantRoot::new(&domain, &class, String::from("v1"));
///
/// let participant = domain.register_participant();
/// let current = root.get(&participant).unwrap();
/// assert_eq!(&*current, "v1");
/// current.put();
///
/// let old = root.replace(String::from("v2"));
/// assert_eq!(old.as_deref(), Some("v1"));
/// assert_eq!(&*root.get(&participant).unwrap(), "v2");
/// ```
///
/// 交换根：指向逻辑对象当前变体的唯一发布指针。
/// 读者可在任意线程调用 `get()`，它从不阻塞，返回的 `VariantRef`
/// 会让观察到的变体保持存活，即使跨越阻塞操作。
/// 写路径（`replace()`、`clear()`）重新发布根，等待旧变体的所有读者离开后交还旧值。
pub struct VariantRoot<T> {
    current: AtomicPtr<Variant<T>>,
    class: PsrefClass,
    domain: PserializeDomain,
    _owns: PhantomData<Box<Variant<T>>>,
}

// SAFETY: the root owns its variants; values are created on the writer's
// thread, shared by reference with readers, and handed back to a writer.
unsafe impl<T: Send + Sync> Send for VariantRoot<T> {}
// SAFETY: as above.
unsafe impl<T: Send + Sync> Sync for VariantRoot<T> {}

impl<T> VariantRoot<T> {
    /// Create a root with no published variant (the object is disabled).
    /// 创建一个没有发布变体的根（对象被禁用）。
    pub fn empty(domain: &PserializeDomain, class: &PsrefClass) -> Self {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
            class: class.clone(),
            domain: domain.clone(),
            _owns: PhantomData,
        }
    }

    /// Create a root publishing `value`.
    /// 创建一个发布 `value` 的根。
    pub fn new(domain: &PserializeDomain, class: &PsrefClass, value: T) -> Self {
        let root = Self::empty(domain, class);
        root.current
            .store(root.allocate(value).as_ptr(), Ordering::Release);
        root
    }

    /// True if a variant is currently published.
    /// 如果当前有变体被发布则为 true。
    #[inline]
    pub fn is_published(&self) -> bool {
        !self.current.load(Ordering::Acquire).is_null()
    }

    /// The class variant targets of this root belong to.
    #[inline]
    pub fn class(&self) -> &PsrefClass {
        &self.class
    }

    /// Pin the current variant.
    ///
    /// Enters a read section just long enough to load the root and take a
    /// reference on the variant's target, retrying when it raced a writer
    /// that is retiring that variant. Returns `None` when nothing is
    /// published. Never blocks.
    ///
    /// 钉住当前变体。
    /// 与正在退休该变体的写者竞争时重试。没有发布内容时返回 `None`。从不阻塞。
    pub fn get(&self, participant: &Participant) -> Option<VariantRef<'_, T>> {
        debug_assert!(
            participant.belongs_to(&self.domain),
            "BUG: participant registered with a different pserialize domain"
        );

        loop {
            let section = participant.read_enter();
            let variant = NonNull::new(self.current.load(Ordering::Acquire))?;

            // SAFETY: the variant was reachable from the root inside this read
            // section, so the writer's synchronize keeps it allocated until
            // the section ends. It never moves while published.
            let target = unsafe { Pin::new_unchecked(&(*variant.as_ptr()).target) };
            let acquired = target.acquire(&self.class);
            section.exit();

            match acquired {
                Ok(psref) => {
                    return Some(VariantRef {
                        variant,
                        _psref: psref,
                        _root: PhantomData,
                    });
                }
                Err(_) => spin_loop(),
            }
        }
    }

    /// Publish `value` as the new variant and reclaim the previous one.
    ///
    /// Blocks until every reader still holding the previous variant releases
    /// it, then returns the previous value (or `None` if nothing was
    /// published). The caller must not hold a `VariantRef` of this root.
    ///
    /// # Panics
    /// In debug builds, if called inside a read section.
    ///
    /// 发布 `value` 作为新变体并回收前一个变体。
    /// 阻塞直到所有仍持有前一个变体的读者释放它，然后返回前一个值。
    #[track_caller]
    pub fn replace(&self, value: T) -> Option<T> {
        assert_sleepable("VariantRoot::replace");
        let fresh = self.allocate(value);
        let old = self.current.swap(fresh.as_ptr(), Ordering::AcqRel);
        log::debug!("variant: published new `{}` variant", self.class.name());
        self.reclaim(old)
    }

    /// Unpublish the current variant, disabling the object.
    ///
    /// Same waiting rules as `replace`.
    ///
    /// 取消发布当前变体，禁用该对象。
    #[track_caller]
    pub fn clear(&self) -> Option<T> {
        assert_sleepable("VariantRoot::clear");
        let old = self.current.swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            log::debug!("variant: cleared `{}` root", self.class.name());
        }
        self.reclaim(old)
    }

    fn allocate(&self, value: T) -> NonNull<Variant<T>> {
        let variant = Box::new(Variant {
            value: ManuallyDrop::new(value),
            target: PsrefTarget::new(&self.class),
        });
        NonNull::from(Box::leak(variant))
    }

    fn reclaim(&self, old: *mut Variant<T>) -> Option<T> {
        let old = NonNull::new(old)?;

        // SAFETY: `old` came from `allocate` and was unlinked by our swap, so
        // this call is its only owner on the writer side.
        let target = unsafe { &(*old.as_ptr()).target };

        // Readers that race us from here on see `Retired` and go back to the
        // root. Once synchronize returns nobody can still be dereferencing
        // `old` without a counted reference.
        target.retire();
        self.domain.synchronize();
        target.wait_drained();
        log::debug!("variant: superseded `{}` variant drained", self.class.name());

        // SAFETY: drained and unreachable; ownership returns to us.
        let mut variant = unsafe { Box::from_raw(old.as_ptr()) };
        // SAFETY: `value` is taken exactly once, the box is then dropped in place.
        let value = unsafe { ManuallyDrop::take(&mut variant.value) };
        drop(variant);
        Some(value)
    }
}

impl<T> Drop for VariantRoot<T> {
    fn drop(&mut self) {
        // `VariantRef`s borrow the root, so none are alive here.
        let current = self.current.swap(ptr::null_mut(), Ordering::Relaxed);
        if let Some(current) = NonNull::new(current) {
            // SAFETY: the root exclusively owns the published variant.
            let mut variant = unsafe { Box::from_raw(current.as_ptr()) };
            // SAFETY: dropped exactly once.
            unsafe { ManuallyDrop::drop(&mut variant.value) };
        }
    }
}

impl<T> std::fmt::Debug for VariantRoot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariantRoot")
            .field("class", &self.class.name())
            .field("published", &self.is_published())
            .finish()
    }
}

/// A pinned reference to one variant of a `VariantRoot`.
///
/// Dereferences to the variant's value. The variant stays valid until this is
/// dropped (or `put`), even if the writer has already published a newer one.
/// `!Send`: it must be released on the thread that acquired it.
///
/// 对 `VariantRoot` 某个变体的钉住引用。
/// 在被丢弃之前变体保持有效，即使写者已发布了更新的变体。
#[must_use]
pub struct VariantRef<'r, T> {
    variant: NonNull<Variant<T>>,
    _psref: Psref,
    _root: PhantomData<&'r VariantRoot<T>>,
}

impl<'r, T> VariantRef<'r, T> {
    /// Release the reference. Equivalent to dropping it.
    /// 释放引用。等价于丢弃它。
    #[inline]
    pub fn put(self) {
        drop(self);
    }
}

impl<'r, T> Deref for VariantRef<'r, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: our psref keeps the variant from being reclaimed.
        unsafe { &(*self.variant.as_ptr()).value }
    }
}

impl<'r, T: std::fmt::Debug> std::fmt::Debug for VariantRef<'r, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VariantRef").field(&**self).finish()
    }
}
