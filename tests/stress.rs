#![cfg(any(
    all(unix, feature = "backend-posix"),
    all(windows, feature = "backend-windows")
))]

mod common;

use std::{
    collections::BTreeSet,
    sync::{
        Barrier,
        atomic::{AtomicBool, Ordering},
    },
};

use self::common::{Pages, Session};

const THREADS: usize = 8;
const PAGES: usize = 16;
const ROUNDS: usize = 20;

/// Pages thread `thread` writes in round `round`.
fn pattern(thread: usize, round: usize) -> impl Iterator<Item = usize> {
    (0..PAGES).filter(move |page| (page * 7 + thread * 3 + round) % 3 != 0)
}

#[test]
fn concurrent_writers_lose_no_pages() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let memory = (0..THREADS)
        .map(|_| Pages::new(PAGES, page_size))
        .collect::<Vec<_>>();

    let handles = memory
        .iter()
        .map(|pages| unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() })
        .collect::<Vec<_>>();

    let barrier = Barrier::new(THREADS + 1);

    std::thread::scope(|scope| {
        for (thread, pages) in memory.iter().enumerate() {
            let barrier = &barrier;

            scope.spawn(move || {
                for round in 0..ROUNDS {
                    // Wait for the regions to be protected.
                    barrier.wait();

                    for page in pattern(thread, round) {
                        for offset in [0, page_size / 2, page_size - 1] {
                            pages.write(page * page_size + offset, round as u8);
                        }
                    }

                    // Let the checker collect.
                    barrier.wait();
                }
            });
        }

        for round in 0..ROUNDS {
            for &handle in &handles {
                sniffer.protect(handle).unwrap();
            }

            barrier.wait();
            barrier.wait();

            for (thread, (&handle, pages)) in handles.iter().zip(&memory).enumerate() {
                let expected = pattern(thread, round)
                    .map(|page| pages.page(page))
                    .collect::<BTreeSet<_>>();

                assert_eq!(
                    sniffer.touched_pages_and_reset(handle).unwrap(),
                    expected,
                    "thread {thread}, round {round}"
                );
            }
        }
    });

    assert_eq!(sniffer.stats().faults_foreign, 0);

    for handle in handles {
        sniffer.remove_region(handle).unwrap();
    }
}

#[test]
fn faults_race_with_region_churn() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let tracked = Pages::new(PAGES, page_size);
    let churn = Pages::new(PAGES, page_size);
    let handle = unsafe { sniffer.create_region(tracked.ptr(), tracked.len()).unwrap() };

    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        // Consumer creating and removing regions while faults arrive.
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                for page in 0..PAGES {
                    let churned =
                        unsafe { sniffer.create_region(churn.page(page), page_size).unwrap() };
                    sniffer.protect(churned).unwrap();
                    sniffer.remove_region(churned).unwrap();
                }
            }
        });

        for round in 0..ROUNDS {
            sniffer.protect(handle).unwrap();

            std::thread::scope(|scope| {
                for thread in 0..4 {
                    let tracked = &tracked;

                    scope.spawn(move || {
                        for page in (thread..PAGES).step_by(4) {
                            tracked.write(page * page_size + round, 1);
                        }
                    });
                }
            });

            assert_eq!(sniffer.touched_pages_and_reset(handle).unwrap().len(), PAGES);
        }

        done.store(true, Ordering::SeqCst);
    });

    sniffer.remove_region(handle).unwrap();
}

#[test]
fn writes_race_with_unprotect() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let racing = Pages::new(PAGES, page_size);
    let handle = unsafe { sniffer.create_region(racing.ptr(), racing.len()).unwrap() };

    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for thread in 0..4 {
            let (racing, done) = (&racing, &done);

            scope.spawn(move || {
                let mut value = 0u8;
                while !done.load(Ordering::SeqCst) {
                    for page in (thread..PAGES).step_by(4) {
                        racing.write(page * page_size + thread, value);
                    }
                    value = value.wrapping_add(1);
                }
            });
        }

        // Faults pile up behind the lock while their pages are released.
        for _ in 0..ROUNDS * 10 {
            sniffer.protect(handle).unwrap();
            sniffer.unprotect(handle).unwrap();
        }

        done.store(true, Ordering::SeqCst);
    });

    assert!(sniffer.is_installed());
    assert_eq!(sniffer.stats().faults_foreign, 0);

    // The hook is still armed: a fresh write is recorded, not fatal.
    sniffer.reset(handle).unwrap();
    sniffer.protect(handle).unwrap();
    racing.write(0, 0xff);
    assert_eq!(
        sniffer.touched_pages(handle).unwrap(),
        BTreeSet::from([racing.page(0)])
    );

    sniffer.remove_region(handle).unwrap();
}
