use crate::reader::assert_sleepable;
use crate::sync::{current_thread_id, Condvar, Mutex, MutexGuard, ThreadId};
use std::marker::PhantomData;
use std::vec::Vec;

#[derive(Debug)]
struct RwSemState {
    /// Read holds currently granted.
    readers: usize,
    /// Thread holding the write side.
    writer: Option<ThreadId>,
    /// Set while any writer is queued; keeps new readers out.
    write_wanted: bool,
    /// Writer FIFO: next ticket to hand out, and the ticket allowed in next.
    next_ticket: u64,
    serving: u64,
    /// Read holds per thread, for recursion and misuse checks.
    read_holders: Vec<(ThreadId, usize)>,
}

impl RwSemState {
    fn holds_read(&self, thread: ThreadId) -> bool {
        self.read_holders.iter().any(|(id, _)| *id == thread)
    }

    /// A thread already holding a read hold is not a *new* reader, so a
    /// queued writer does not keep it out; an active writer does.
    fn admits_reader(&self, thread: ThreadId) -> bool {
        self.writer.is_none() && (!self.write_wanted || self.holds_read(thread))
    }

    fn grant_read(&mut self, thread: ThreadId) {
        self.readers += 1;
        match self.read_holders.iter_mut().find(|(id, _)| *id == thread) {
            Some((_, holds)) => *holds += 1,
            None => self.read_holders.push((thread, 1)),
        }
    }

    #[track_caller]
    fn revoke_read(&mut self, thread: ThreadId) {
        let index = self.read_holders.iter().position(|(id, _)| *id == thread);
        let Some(index) = index else {
            panic!("BUG: up_read by a thread that holds no read lock");
        };
        let holds = &mut self.read_holders[index].1;
        *holds -= 1;
        if *holds == 0 {
            self.read_holders.swap_remove(index);
        }
        self.readers -= 1;
    }

    /// Admit the head writer. Writers still queued behind it keep new
    /// readers out.
    fn grant_write(&mut self, thread: ThreadId) {
        self.writer = Some(thread);
        self.serving += 1;
        self.write_wanted = self.next_ticket != self.serving;
    }

    fn writers_waiting(&self) -> usize {
        (self.next_ticket - self.serving) as usize
    }
}

/// A sleepable reader/writer semaphore.
///
/// Many readers or one writer. Readers may block while holding it, unlike a
/// read section. Writers queue in FIFO order among themselves, and a queued
/// writer keeps new readers out so it cannot be starved; readers already
/// inside finish first.
///
/// Every hold is an RAII guard tied to the acquiring thread. Misuse (a
/// recursive write lock, a writer taking a read lock, destroying a held
/// semaphore) panics.
///
/// ```
/// use psz_sync::RwSemaphore;
///
/// let sem = RwSemaphore::new();
///
/// let a = sem.down_read();
/// let b = sem.down_read_trylock().unwrap();
/// assert_eq!(sem.reader_count(), 2);
/// a.up_read();
/// b.up_read();
///
/// let w = sem.down_write();
/// assert!(sem.down_read_trylock().is_none());
/// let r = w.downgrade_write();
/// assert!(sem.down_write_trylock().is_none());
/// r.up_read();
/// assert!(!sem.is_locked());
/// ```
///
/// 可睡眠的读写信号量。
/// 多个读者或一个写者。写者之间按 FIFO 顺序排队，排队中的写者会阻止新读者进入，
/// 因此写者不会饿死；已在内部的读者先完成。
pub struct RwSemaphore {
    state: Mutex<RwSemState>,
    wakeup: Condvar,
}

impl RwSemaphore {
    /// Create an idle semaphore.
    /// 创建一个空闲的信号量。
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RwSemState {
                readers: 0,
                writer: None,
                write_wanted: false,
                next_ticket: 0,
                serving: 0,
                read_holders: Vec::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Take a shared hold, blocking while a writer holds the semaphore or is
    /// queued for it.
    ///
    /// # Panics
    /// If the calling thread holds the write side, or (debug builds) if
    /// called inside a read section.
    ///
    /// 获取共享持有，当写者持有或排队时阻塞。
    #[track_caller]
    pub fn down_read(&self) -> RwSemReadGuard<'_> {
        assert_sleepable("RwSemaphore::down_read");
        let me = current_thread_id();
        let mut state = self.state.lock();
        assert!(
            state.writer != Some(me),
            "BUG: down_read by the thread holding the write lock"
        );

        while !state.admits_reader(me) {
            state = self.wakeup.wait(state);
        }
        state.grant_read(me);

        RwSemReadGuard::new(self)
    }

    /// Take a shared hold if it can be granted without blocking.
    /// 如果无需阻塞即可授予，则获取共享持有。
    pub fn down_read_trylock(&self) -> Option<RwSemReadGuard<'_>> {
        let me = current_thread_id();
        let mut state = self.state.lock();
        if !state.admits_reader(me) {
            return None;
        }
        state.grant_read(me);
        Some(RwSemReadGuard::new(self))
    }

    /// Take the exclusive hold.
    ///
    /// Queues behind writers that arrived earlier, keeps new readers out
    /// while waiting, and waits for the readers already inside to leave.
    ///
    /// # Panics
    /// If the calling thread already holds the semaphore (either side), or
    /// (debug builds) if called inside a read section.
    ///
    /// 获取独占持有。
    /// 排在更早到达的写者之后，等待期间阻止新读者，并等待已在内部的读者离开。
    #[track_caller]
    pub fn down_write(&self) -> RwSemWriteGuard<'_> {
        assert_sleepable("RwSemaphore::down_write");
        let me = current_thread_id();
        let mut state = self.state.lock();
        assert!(
            state.writer != Some(me),
            "BUG: recursive down_write by the holding thread"
        );
        assert!(
            !state.holds_read(me),
            "BUG: down_write by a thread holding a read lock"
        );

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.write_wanted = true;

        loop {
            let head = state.serving == ticket;
            if head && state.writer.is_none() && state.readers == 0 {
                break;
            }
            state = self.wakeup.wait(state);
        }
        state.grant_write(me);

        RwSemWriteGuard::new(self)
    }

    /// Take the exclusive hold if the semaphore is idle and no writer is queued.
    /// 如果信号量空闲且没有写者排队，则获取独占持有。
    pub fn down_write_trylock(&self) -> Option<RwSemWriteGuard<'_>> {
        let me = current_thread_id();
        let mut state = self.state.lock();
        let idle = state.writer.is_none() && state.readers == 0;
        if !idle || state.serving != state.next_ticket {
            return None;
        }
        state.next_ticket += 1;
        state.grant_write(me);
        Some(RwSemWriteGuard::new(self))
    }

    /// True if any hold is granted.
    /// 如果授予了任何持有则为 true。
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.writer.is_some()
    }

    /// True if the exclusive hold is granted.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Number of shared holds granted.
    /// 已授予的共享持有数量。
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    /// True while a queued writer is keeping new readers out.
    /// 当排队的写者正在阻止新读者时为 true。
    pub fn write_wanted(&self) -> bool {
        self.state.lock().write_wanted
    }

    /// Number of writers queued and not yet admitted.
    /// 已排队但尚未获准进入的写者数量。
    pub fn writers_waiting(&self) -> usize {
        self.state.lock().writers_waiting()
    }

    fn lock_state(&self) -> MutexGuard<'_, RwSemState> {
        self.state.lock()
    }
}

impl Default for RwSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RwSemaphore {
    fn drop(&mut self) {
        let state = self.lock_state();
        debug_assert!(
            state.readers == 0 && state.writer.is_none(),
            "BUG: rwsem destroyed while held ({} readers, writer: {:?})",
            state.readers,
            state.writer
        );
    }
}

impl std::fmt::Debug for RwSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("RwSemaphore")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("write_wanted", &state.write_wanted)
            .finish()
    }
}

/// A shared hold on a `RwSemaphore`. Dropping it is `up_read`.
/// `RwSemaphore` 上的共享持有。丢弃即 `up_read`。
#[must_use]
pub struct RwSemReadGuard<'a> {
    sem: &'a RwSemaphore,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RwSemReadGuard<'a> {
    fn new(sem: &'a RwSemaphore) -> Self {
        Self {
            sem,
            _not_send: PhantomData,
        }
    }

    /// Release the shared hold.
    #[inline]
    pub fn up_read(self) {
        drop(self);
    }
}

impl<'a> Drop for RwSemReadGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.sem.lock_state();
        state.revoke_read(current_thread_id());
        if state.readers == 0 {
            self.sem.wakeup.notify_all();
        }
    }
}

/// The exclusive hold on a `RwSemaphore`. Dropping it is `up_write`.
/// `RwSemaphore` 上的独占持有。丢弃即 `up_write`。
#[must_use]
pub struct RwSemWriteGuard<'a> {
    sem: &'a RwSemaphore,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RwSemWriteGuard<'a> {
    fn new(sem: &'a RwSemaphore) -> Self {
        Self {
            sem,
            _not_send: PhantomData,
        }
    }

    /// Release the exclusive hold.
    #[inline]
    pub fn up_write(self) {
        drop(self);
    }

    /// Turn the exclusive hold into one shared hold without letting any
    /// writer in between, and let blocked readers in alongside.
    /// 将独占持有原子地转换为一个共享持有，期间不允许任何写者插入。
    pub fn downgrade_write(self) -> RwSemReadGuard<'a> {
        let sem = self.sem;
        std::mem::forget(self);

        let me = current_thread_id();
        let mut state = sem.lock_state();
        assert!(
            state.writer == Some(me),
            "BUG: downgrade_write by a thread not holding the write lock"
        );
        state.writer = None;
        state.grant_read(me);
        sem.wakeup.notify_all();

        RwSemReadGuard::new(sem)
    }
}

impl<'a> Drop for RwSemWriteGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.sem.lock_state();
        assert!(
            state.writer == Some(current_thread_id()),
            "BUG: up_write by a thread not holding the write lock"
        );
        state.writer = None;
        self.sem.wakeup.notify_all();
    }
}
