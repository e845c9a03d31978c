use d56jit_backend::x86_64::regs::{Gp, POOL_GPS};
use d56jit_backend::RegPool;

#[test]
fn test_acquire_release_cycle() {
    let mut pool = RegPool::new(&POOL_GPS);
    assert_eq!(pool.free_count(), POOL_GPS.len());

    let a = pool.acquire();
    let b = pool.acquire();
    assert_ne!(a, b);
    assert!(pool.is_in_use(a));
    assert_eq!(pool.free_count(), POOL_GPS.len() - 2);

    pool.release(a);
    assert!(!pool.is_in_use(a));
    // Freed registers are handed out again.
    let c = pool.acquire();
    assert_eq!(c, a);
    pool.release(b);
    pool.release(c);
}

#[test]
#[should_panic(expected = "register pool exhausted")]
fn test_exhaustion_is_fatal() {
    let mut pool = RegPool::new(&POOL_GPS);
    for _ in 0..=POOL_GPS.len() {
        pool.acquire();
    }
}

#[test]
fn test_lock_pins_register() {
    let mut pool = RegPool::new(&POOL_GPS);
    let a = pool.acquire();
    pool.lock(a);
    pool.unlock(a);
    pool.release(a);
}

#[test]
#[should_panic(expected = "release of locked register")]
fn test_release_of_locked_is_fatal() {
    let mut pool = RegPool::new(&POOL_GPS);
    let a = pool.acquire();
    pool.lock(a);
    pool.release(a);
}

#[test]
#[should_panic(expected = "double lock")]
fn test_double_lock_is_fatal() {
    let mut pool = RegPool::new(&POOL_GPS);
    let a = pool.acquire();
    pool.lock(a);
    pool.lock(a);
}

#[test]
#[should_panic(expected = "still locked at block end")]
fn test_release_all_checks_locks() {
    let mut pool = RegPool::new(&POOL_GPS);
    let a = pool.acquire();
    pool.lock(a);
    pool.release_all();
}

#[test]
fn test_release_all_frees_everything() {
    let mut pool: RegPool<Gp> = RegPool::new(&POOL_GPS);
    pool.acquire();
    pool.acquire();
    pool.release_all();
    assert_eq!(pool.free_count(), POOL_GPS.len());
}
