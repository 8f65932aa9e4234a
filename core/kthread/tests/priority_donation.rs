//! Donation scenarios driven end to end through the public API: multiple
//! donors on one lock, and a nested chain with a timed-out waiter.

use std::sync::{Arc, Mutex};

use khal::irq::IrqSave;
use kthread::{Lock, SchedConfig, Semaphore, Tid, PRI_DEFAULT, PRI_MIN};

fn priority_of(tid: Tid) -> Option<u8> {
    let _irq = IrqSave::new();
    let mut found = None;
    kthread::foreach(|t| {
        if t.tid() == tid {
            found = Some(t.priority());
        }
    });
    found
}

#[test]
fn donation_chains_and_timeouts() {
    kthread::init(SchedConfig::default());
    kthread::start();
    let main_tid = kthread::current();

    multi_donor(main_tid);
    nested_chain_with_timeout();
}

/// Two donors on one lock held by the running thread. The holder's
/// effective priority steps down as each donor gets its turn: 50 while
/// both wait, 40 once the better donor holds the lock, base once both are
/// through.
fn multi_donor(main_tid: Tid) {
    let lock = Arc::new(Lock::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Semaphore::new(0));

    lock.acquire();

    for (name, pri) in [("D1", 40u8), ("D2", 50u8)] {
        let (l, s, d) = (lock.clone(), seen.clone(), done.clone());
        kthread::spawn(name, pri, move || {
            l.acquire();
            s.lock().unwrap().push(priority_of(main_tid));
            l.release();
            d.release();
        })
        .unwrap();
    }
    // Both donors blocked on the lock; the better one's donation wins.
    assert_eq!(kthread::priority(), 50);

    lock.release();
    done.acquire();
    done.acquire();

    // D2 saw us still carrying D1's donation; D1 saw us back at base.
    assert_eq!(*seen.lock().unwrap(), vec![Some(40), Some(31)]);
    assert_eq!(kthread::priority(), PRI_DEFAULT);
}

/// The nested chain: H (base 10) holds L1; M (base 20) holds L2 and wants
/// L1; L (base 30) wants L2 with a deadline. While the chain stands every
/// link carries 30. After L's deadline fires the chain settles at 20, and
/// when it unwinds completely H is back at its base.
fn nested_chain_with_timeout() {
    let l1 = Arc::new(Lock::new());
    let l2 = Arc::new(Lock::new());
    let h_ready = Arc::new(Semaphore::new(0));
    let m_ready = Arc::new(Semaphore::new(0));
    let h_go = Arc::new(Semaphore::new(0));
    let h_done = Arc::new(Semaphore::new(0));
    let m_done = Arc::new(Semaphore::new(0));
    let l_result = Arc::new(Mutex::new(None));
    let h_base_after = Arc::new(Mutex::new(None));

    let h_tid = {
        let (l1, ready, go, fin, base) = (
            l1.clone(),
            h_ready.clone(),
            h_go.clone(),
            h_done.clone(),
            h_base_after.clone(),
        );
        kthread::spawn("H", 10, move || {
            l1.acquire();
            ready.release();
            go.acquire();
            l1.release();
            // Donation symmetry: nothing held, back to base.
            *base.lock().unwrap() = Some(kthread::priority());
            fin.release();
        })
        .unwrap()
    };
    h_ready.acquire();

    let m_tid = {
        let (l1, l2, ready, fin) = (l1.clone(), l2.clone(), m_ready.clone(), m_done.clone());
        kthread::spawn("M", 20, move || {
            l2.acquire();
            ready.release();
            l1.acquire();
            l1.release();
            l2.release();
            fin.release();
        })
        .unwrap()
    };
    m_ready.acquire();

    // Let M attempt L1 and block behind H; the first donation lands.
    kthread::sleep_ticks(3);
    assert_eq!(priority_of(h_tid), Some(20));
    assert_eq!(priority_of(m_tid), Some(20));

    let l_tid = {
        let (l2, result) = (l2.clone(), l_result.clone());
        kthread::spawn("L", 30, move || {
            let acquired = l2.acquire_timeout(10);
            *result.lock().unwrap() = Some(acquired);
        })
        .unwrap()
    };
    // Let L block on L2; 30 flows down the whole chain.
    kthread::sleep_ticks(3);
    assert_eq!(priority_of(l_tid), Some(30));
    assert_eq!(priority_of(m_tid), Some(30));
    assert_eq!(priority_of(h_tid), Some(30));

    // Sleep across L's deadline: it is withdrawn without acquiring, and
    // the chain drops back to M's donation alone.
    kthread::sleep_ticks(15);
    assert_eq!(*l_result.lock().unwrap(), Some(false));
    assert_eq!(priority_of(h_tid), Some(20));
    assert_eq!(priority_of(m_tid), Some(20));

    // Unwind: H releases L1 to M, M finishes both locks.
    h_go.release();
    h_done.acquire();
    m_done.acquire();
    assert_eq!(*h_base_after.lock().unwrap(), Some(10));

    // Drain any threads still winding down.
    kthread::set_priority(PRI_MIN);
    kthread::set_priority(PRI_DEFAULT);
}
