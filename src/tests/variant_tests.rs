//! 变体交换器测试
//! 测试发布、退休、回收顺序以及内存投毒压力测试

use crate::{PserializeDomain, PsrefClass, VariantRoot};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const LIVE: u64 = 0x1111_2222_3333_4444;
const POISON: u64 = 0xdead_beef_dead_beef;

/// A configuration that poisons itself and records its generation when dropped.
struct Canary {
    generation: u64,
    pattern: u64,
    dropped: Arc<Mutex<Vec<u64>>>,
}

impl Canary {
    fn new(generation: u64, dropped: &Arc<Mutex<Vec<u64>>>) -> Self {
        Self {
            generation,
            pattern: LIVE,
            dropped: dropped.clone(),
        }
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.pattern = POISON;
        self.dropped.lock().unwrap().push(self.generation);
    }
}

fn setup<T>(value: T) -> (PserializeDomain, Arc<VariantRoot<T>>)
where
    T: Send + Sync,
{
    let domain = PserializeDomain::new();
    let class = PsrefClass::new("variant");
    let root = Arc::new(VariantRoot::new(&domain, &class, value));
    (domain, root)
}

/// 测试1: get 返回已发布的值
#[test]
fn test_get_published_value() {
    let (domain, root) = setup(42u32);
    let participant = domain.register_participant();

    let value = root.get(&participant).unwrap();
    assert_eq!(*value, 42);
    assert!(!participant.is_reading());
    value.put();
}

/// 测试2: 空根在发布之前不返回任何内容
#[test]
fn test_empty_root() {
    let domain = PserializeDomain::new();
    let class = PsrefClass::new("variant");
    let root: VariantRoot<String> = VariantRoot::empty(&domain, &class);
    let participant = domain.register_participant();

    assert!(!root.is_published());
    assert!(root.get(&participant).is_none());
    assert_eq!(root.clear(), None);

    assert_eq!(root.replace("first".to_string()), None);
    assert!(root.is_published());
    assert_eq!(root.get(&participant).unwrap().as_str(), "first");
}

/// 测试3: replace 交还被替换的值
#[test]
fn test_replace_returns_previous_value() {
    let (domain, root) = setup(String::from("v1"));
    let participant = domain.register_participant();

    assert_eq!(root.replace(String::from("v2")).as_deref(), Some("v1"));
    assert_eq!(root.replace(String::from("v3")).as_deref(), Some("v2"));
    assert_eq!(root.get(&participant).unwrap().as_str(), "v3");
}

/// 测试4: clear 禁用对象并返回其最后的值
#[test]
fn test_clear_disables_object() {
    let (domain, root) = setup(7i64);
    let participant = domain.register_participant();

    assert_eq!(root.clear(), Some(7));
    assert!(!root.is_published());
    assert!(root.get(&participant).is_none());
}

/// 测试5: 根恰好丢弃其当前值一次
#[test]
fn test_root_drop_releases_current_variant() {
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let domain = PserializeDomain::new();
    let class = PsrefClass::new("variant");

    let root = VariantRoot::new(&domain, &class, Canary::new(1, &dropped));
    drop(root.replace(Canary::new(2, &dropped)));
    assert_eq!(*dropped.lock().unwrap(), vec![1]);

    drop(root);
    assert_eq!(*dropped.lock().unwrap(), vec![1, 2]);
    assert_eq!(class.target_count(), 0);
}

/// 测试6: 被持有的变体在替换后仍存活；写者等待它；之后的读者只看到新变体
#[test]
fn test_writer_waits_for_pinned_variant() {
    let (domain, root) = setup(String::from("V1"));
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let reader = {
        let domain = domain.clone();
        let root = root.clone();
        thread::spawn(move || {
            let participant = domain.register_participant();
            let v1 = root.get(&participant).unwrap();
            assert_eq!(v1.as_str(), "V1");
            held_tx.send(()).unwrap();

            // 写者已经发布新变体，旧引用仍然有效
            release_rx.recv().unwrap();
            assert_eq!(v1.as_str(), "V1");
            v1.put();
        })
    };

    held_rx.recv().unwrap();

    let replaced = Arc::new(AtomicBool::new(false));
    let writer = {
        let root = root.clone();
        let replaced = replaced.clone();
        thread::spawn(move || {
            let old = root.replace(String::from("V2"));
            replaced.store(true, Ordering::Release);
            old
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!replaced.load(Ordering::Acquire));

    let participant = domain.register_participant();
    assert_eq!(root.get(&participant).unwrap().as_str(), "V2");

    release_tx.send(()).unwrap();
    reader.join().unwrap();
    let old = writer.join().unwrap();

    assert!(replaced.load(Ordering::Acquire));
    assert_eq!(old.as_deref(), Some("V1"));
    assert_eq!(root.get(&participant).unwrap().as_str(), "V2");
}

/// 测试7: 变体引用可以跨越读区段和阻塞调用持有
#[test]
fn test_reference_outlives_read_section() {
    let (domain, root) = setup(vec![1u8, 2, 3]);
    let participant = domain.register_participant();

    let value = root.get(&participant).unwrap();
    {
        let _section = participant.read_enter();
        assert_eq!(value.len(), 3);
    }
    thread::sleep(Duration::from_millis(1));
    assert_eq!(&value[..], &[1, 2, 3]);
}

/// 测试8: 压力测试：读者在钉住时睡眠，写者在其下方持续交换，读者从不观察到已回收的变体
#[test]
fn test_no_reclamation_under_readers() {
    const READERS: usize = 4;
    const MIN_OBSERVED: usize = 2_000;
    const MIN_OVERLAPPED: usize = 50;
    const DEADLINE: Duration = Duration::from_secs(20);

    let dropped = Arc::new(Mutex::new(Vec::new()));
    let (domain, root) = setup(Canary::new(0, &dropped));
    let started = Arc::new(Barrier::new(READERS + 1));
    let stop = Arc::new(AtomicBool::new(false));
    // 写者即将发布的代数
    let publishing = Arc::new(AtomicU64::new(0));
    let observed = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for _ in 0..READERS {
        let domain = domain.clone();
        let root = root.clone();
        let dropped = dropped.clone();
        let started = started.clone();
        let stop = stop.clone();
        let publishing = publishing.clone();
        let observed = observed.clone();
        let overlapped = overlapped.clone();
        handles.push(thread::spawn(move || {
            let participant = domain.register_participant();
            let mut rng = rand::thread_rng();

            root.get(&participant).unwrap().put();
            started.wait();

            while !stop.load(Ordering::Acquire) {
                let canary = root.get(&participant).unwrap();
                assert_eq!(canary.pattern, LIVE);

                thread::sleep(Duration::from_micros(rng.gen_range(0..50)));

                assert_eq!(canary.pattern, LIVE);
                assert!(!dropped.lock().unwrap().contains(&canary.generation));
                if canary.generation < publishing.load(Ordering::Acquire) {
                    // 钉住期间有更新的变体被发布
                    overlapped.fetch_add(1, Ordering::Relaxed);
                }
                observed.fetch_add(1, Ordering::Relaxed);
                canary.put();
            }
        }));
    }

    started.wait();
    let begin = Instant::now();
    let mut generation = 0u64;
    while (observed.load(Ordering::Relaxed) < MIN_OBSERVED
        || overlapped.load(Ordering::Relaxed) < MIN_OVERLAPPED)
        && begin.elapsed() < DEADLINE
    {
        generation += 1;
        publishing.store(generation, Ordering::Release);
        let old = root.replace(Canary::new(generation, &dropped)).unwrap();
        assert_eq!(old.generation, generation - 1);
        assert_eq!(old.pattern, LIVE);
        drop(old);
    }

    stop.store(true, Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(observed.load(Ordering::Relaxed) >= MIN_OBSERVED);
    assert!(overlapped.load(Ordering::Relaxed) >= MIN_OVERLAPPED);
    assert_eq!(dropped.lock().unwrap().len(), generation as usize);
}

/// 测试9: 在读区段内替换是 bug
#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "must not be called inside a read section")]
fn test_replace_inside_read_section_panics() {
    let (domain, root) = setup(1u8);
    let participant = domain.register_participant();
    let _section = participant.read_enter();
    root.replace(2);
}
