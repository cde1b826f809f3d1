//! 被动引用测试
//! 测试类/目标记账、获取/释放、退休与销毁等待

use crate::{PserializeDomain, PsrefClass, PsrefTarget, Retired};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// 测试1: 计数跟随获取与释放
#[test]
fn test_acquire_release_counts() {
    let class = PsrefClass::new("test");
    let target = pin!(PsrefTarget::new(&class));
    assert!(!target.held());

    let a = target.as_ref().acquire(&class).unwrap();
    let b = target.as_ref().acquire(&class).unwrap();
    assert_eq!(target.ref_count(), 2);
    assert!(a.is_bound_to(&target));

    a.release();
    assert_eq!(target.ref_count(), 1);
    assert!(target.held());

    drop(b);
    assert!(!target.held());
}

/// 测试2: 类跟踪其活跃目标
#[test]
fn test_class_target_count() {
    let class = PsrefClass::new("counted");
    assert_eq!(class.name(), "counted");
    assert_eq!(class.target_count(), 0);

    let first = Box::pin(PsrefTarget::new(&class));
    let second = Box::pin(PsrefTarget::new(&class));
    assert_eq!(class.target_count(), 2);
    assert_eq!(first.class().name(), "counted");

    drop(first);
    assert_eq!(class.target_count(), 1);
    drop(second);
    assert_eq!(class.target_count(), 0);
}

/// 测试3: 已销毁的目标拒绝新引用
#[test]
fn test_destroyed_target_reports_retired() {
    let class = PsrefClass::new("test");
    let target = Box::pin(PsrefTarget::new(&class));

    target.destroy();
    assert!(target.is_retiring());
    assert_eq!(target.as_ref().acquire(&class).unwrap_err(), Retired);
    assert!(!target.held());
}

/// 测试4: 没有引用时 destroy 立即返回
#[test]
fn test_destroy_unreferenced_target() {
    let class = PsrefClass::new("test");
    let target = Box::pin(PsrefTarget::new(&class));

    drop(target.as_ref().acquire(&class).unwrap());
    target.destroy();
    assert_eq!(target.ref_count(), 0);
}

/// 测试5: destroy 阻塞直到最后一个引用被释放
#[test]
fn test_destroy_waits_for_release() {
    let class = PsrefClass::new("test");
    let target = Arc::pin(PsrefTarget::new(&class));
    let (acquired_tx, acquired_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let reader = {
        let target = target.clone();
        let class = class.clone();
        thread::spawn(move || {
            let psref = target.as_ref().acquire(&class).unwrap();
            acquired_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            psref.release();
        })
    };

    acquired_rx.recv().unwrap();

    let destroyed = Arc::new(AtomicBool::new(false));
    let destroyer = {
        let target = target.clone();
        let destroyed = destroyed.clone();
        thread::spawn(move || {
            target.destroy();
            destroyed.store(true, Ordering::Release);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!destroyed.load(Ordering::Acquire));
    assert!(target.is_retiring());
    assert!(target.as_ref().acquire(&class).is_err());

    release_tx.send(()).unwrap();
    reader.join().unwrap();
    destroyer.join().unwrap();

    assert!(destroyed.load(Ordering::Acquire));
    assert!(!target.held());
}

/// 测试6: 丢弃被引用的目标与 destroy 一样等待
#[test]
fn test_drop_waits_for_release() {
    let class = PsrefClass::new("test");
    let target = Arc::pin(PsrefTarget::new(&class));
    let (acquired_tx, acquired_rx) = mpsc::channel();
    let released = Arc::new(AtomicBool::new(false));

    let reader = {
        let target = target.clone();
        let class = class.clone();
        let released = released.clone();
        thread::spawn(move || {
            let psref = target.as_ref().acquire(&class).unwrap();
            drop(target);
            acquired_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
            released.store(true, Ordering::Release);
            psref.release();
        })
    };

    acquired_rx.recv().unwrap();
    // 最后一个句柄：在 PsrefTarget::drop 中阻塞，直到读者释放
    drop(target);
    assert!(released.load(Ordering::Acquire));

    reader.join().unwrap();
    assert_eq!(class.target_count(), 0);
}

/// 测试7: 目标存活期间多线程获取与释放
#[test]
fn test_concurrent_acquire_release() {
    let class = PsrefClass::new("test");
    let target = Arc::pin(PsrefTarget::new(&class));
    let mut handles = vec![];

    for _ in 0..8 {
        let target = target.clone();
        let class = class.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1_000 {
                let psref = target.as_ref().acquire(&class).unwrap();
                std::hint::black_box(&psref);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(target.ref_count(), 0);
    target.destroy();
}

/// 测试8: 通过错误的类获取是 bug
#[test]
#[should_panic(expected = "BUG: psref acquire through class")]
fn test_class_mismatch_panics() {
    let class = PsrefClass::new("right");
    let other = PsrefClass::new("wrong");
    let target = Box::pin(PsrefTarget::new(&class));

    let _psref = target.as_ref().acquire(&other);
}

/// 测试9: 销毁两次是 bug
#[test]
#[should_panic(expected = "destroyed twice")]
fn test_double_destroy_panics() {
    let class = PsrefClass::new("test");
    let target = Box::pin(PsrefTarget::new(&class));

    target.destroy();
    target.destroy();
}

/// 测试10: 在读区段内销毁是 bug
#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "must not be called inside a read section")]
fn test_destroy_inside_read_section_panics() {
    let domain = PserializeDomain::new();
    let participant = domain.register_participant();
    let class = PsrefClass::new("test");
    let target = Box::pin(PsrefTarget::new(&class));

    let _section = participant.read_enter();
    target.destroy();
}

/// 测试11: 在读区段内被拒绝的 destroy 不改变目标，之后可以重试
#[test]
#[cfg(debug_assertions)]
fn test_refused_destroy_can_be_retried() {
    let domain = PserializeDomain::new();
    let participant = domain.register_participant();
    let class = PsrefClass::new("test");
    let target = Box::pin(PsrefTarget::new(&class));
    let psref = target.as_ref().acquire(&class).unwrap();

    let section = participant.read_enter();
    let refused = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| target.destroy()));
    assert!(refused.is_err());
    section.exit();

    assert!(!target.is_retiring());
    assert_eq!(target.ref_count(), 1);

    psref.release();
    target.destroy();
    assert!(target.is_retiring());
}
