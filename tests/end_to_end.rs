#![cfg(any(
    all(unix, feature = "backend-posix"),
    all(windows, feature = "backend-windows")
))]

mod common;

use std::collections::BTreeSet;

use memsniff::{SniffError, UnveilPolicy};

use self::common::{Pages, Session};

#[test]
fn three_page_checkpoint() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(3, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };
    sniffer.protect(handle).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            pages.write(10, 1);
            pages.write(2 * page_size + 10, 2);
        });
    });

    assert_eq!(
        sniffer.touched_pages_and_reset(handle).unwrap(),
        BTreeSet::from([pages.page(0), pages.page(2)])
    );
    assert!(sniffer.touched_pages(handle).unwrap().is_empty());

    pages.write(page_size + 1, 3);
    assert_eq!(
        sniffer.touched_pages(handle).unwrap(),
        BTreeSet::from([pages.page(1)])
    );

    assert_eq!(pages.read(10), 1);
    assert_eq!(pages.read(2 * page_size + 10), 2);
    assert_eq!(pages.read(page_size + 1), 3);

    sniffer.remove_region(handle).unwrap();
}

#[test]
fn single_write_reports_covering_page_only() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(8, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };

    for index in 0..8 {
        sniffer.protect(handle).unwrap();
        pages.write(index * page_size + page_size / 2, 1);

        assert_eq!(
            sniffer.touched_pages_and_reset(handle).unwrap(),
            BTreeSet::from([pages.page(index)])
        );
    }

    sniffer.remove_region(handle).unwrap();
}

#[test]
fn repeated_writes_are_one_page() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(2, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };
    sniffer.protect(handle).unwrap();

    for offset in 0..64 {
        pages.write(offset * 16, offset as u8);
    }

    assert_eq!(sniffer.touched_pages(handle).unwrap().len(), 1);
    assert_eq!(sniffer.stats().faults_handled, 1);

    sniffer.remove_region(handle).unwrap();
}

#[test]
fn duplicate_and_overlapping_regions_fail() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(4, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), 2 * page_size).unwrap() };

    let result = unsafe { sniffer.create_region(pages.ptr(), 2 * page_size) };
    assert!(matches!(result, Err(SniffError::RegionExists)));

    let result = unsafe { sniffer.create_region(pages.page(1), 2 * page_size) };
    assert!(matches!(result, Err(SniffError::RegionOverlap)));

    let other = unsafe { sniffer.create_region(pages.page(2), 2 * page_size).unwrap() };

    sniffer.remove_region(handle).unwrap();
    sniffer.remove_region(other).unwrap();
}

#[test]
fn unprotect_stops_faulting() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(2, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };

    sniffer.protect(handle).unwrap();
    sniffer.unprotect(handle).unwrap();

    pages.write(0, 1);
    pages.write(page_size, 1);

    assert!(sniffer.touched_pages(handle).unwrap().is_empty());
    assert_eq!(sniffer.stats().faults_handled, 0);

    sniffer.remove_region(handle).unwrap();
}

#[test]
fn removed_handle_is_unusable() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(2, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };
    sniffer.protect(handle).unwrap();
    sniffer.remove_region(handle).unwrap();

    // Writable again, without any fault.
    pages.write(0, 1);
    pages.write(page_size, 1);
    assert_eq!(sniffer.stats().faults_handled, 0);

    assert!(matches!(sniffer.protect(handle), Err(SniffError::InvalidHandle)));
    assert!(matches!(sniffer.touched_pages(handle), Err(SniffError::InvalidHandle)));
    assert!(matches!(sniffer.remove_region(handle), Err(SniffError::InvalidHandle)));
}

#[test]
fn shared_border_page_stays_trapped() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    // low: page 0 and the first half of page 1
    // high: the second half of page 1 and page 2
    let pages = Pages::new(3, page_size);
    let half = page_size / 2;

    let low = unsafe { sniffer.create_region(pages.ptr(), page_size + half).unwrap() };
    let high = unsafe {
        sniffer
            .create_region(pages.page(1) + half, page_size + half)
            .unwrap()
    };

    sniffer.protect(low).unwrap();
    sniffer.protect(high).unwrap();
    sniffer.unprotect(low).unwrap();

    pages.write(0, 1);
    assert!(sniffer.touched_pages(low).unwrap().is_empty());

    pages.write(page_size + half + 1, 1);
    assert_eq!(
        sniffer.touched_pages(high).unwrap(),
        BTreeSet::from([pages.page(1)])
    );
    assert_eq!(sniffer.stats().faults_handled, 1);

    sniffer.remove_region(low).unwrap();
    sniffer.remove_region(high).unwrap();
}

#[test]
fn whole_region_policy() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(4, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };
    sniffer
        .set_unveil_policy(handle, UnveilPolicy::WholeRegion)
        .unwrap();
    sniffer.protect(handle).unwrap();

    for index in 0..4 {
        pages.write(index * page_size, 1);
    }

    assert_eq!(sniffer.touched_pages(handle).unwrap().len(), 4);
    assert_eq!(sniffer.stats().faults_handled, 1);

    sniffer.remove_region(handle).unwrap();
}

#[test]
fn write_range_marks_without_faults() {
    let session = Session::new();
    let sniffer = &session.sniffer;
    let page_size = session.page_size();

    let pages = Pages::new(4, page_size);
    let handle = unsafe { sniffer.create_region(pages.ptr(), pages.len()).unwrap() };
    sniffer.watch(handle).unwrap();

    // A DMA-style producer that bypasses the MMU reports its own writes.
    pages.write(page_size, 1);
    assert_eq!(sniffer.write_range(pages.page(1), page_size + 1), 1);

    assert_eq!(
        sniffer.touched_pages(handle).unwrap(),
        BTreeSet::from([pages.page(1), pages.page(2)])
    );
    assert_eq!(sniffer.stats().faults_handled, 0);

    sniffer.remove_region(handle).unwrap();
}
