//! Faults on memory the sniffer does not track reach the handler that was
//! installed before it.

use std::{
    mem, ptr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use libc::{c_int, c_void, siginfo_t};
use memsniff_backend_posix::SniffPosixBackend;
use memsniff_core::{MemorySniffer, SniffBackend as _};

static SERIAL: Mutex<()> = Mutex::new(());

/// Page the foreign handler is responsible for.
static FOREIGN_PAGE: AtomicUsize = AtomicUsize::new(0);
static FOREIGN_SIZE: AtomicUsize = AtomicUsize::new(0);
static FOREIGN_HITS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn foreign_handler(signal: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    let page = FOREIGN_PAGE.load(Ordering::SeqCst);
    let size = FOREIGN_SIZE.load(Ordering::SeqCst);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let address = unsafe { (*info).si_addr() } as usize;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let address = unsafe { (*info).si_addr } as usize;

    if !(page..page + size).contains(&address) {
        unsafe { libc::signal(signal, libc::SIG_DFL) };
        return;
    }

    unsafe {
        libc::mprotect(
            page as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };

    FOREIGN_HITS.fetch_add(1, Ordering::SeqCst);
}

fn foreign_handler_address() -> libc::sighandler_t {
    foreign_handler as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t
}

fn disposition(signal: c_int) -> libc::sighandler_t {
    let mut current: libc::sigaction = unsafe { mem::zeroed() };
    assert_eq!(
        unsafe { libc::sigaction(signal, ptr::null(), &mut current) },
        0
    );
    current.sa_sigaction
}

fn map(size: usize) -> *mut u8 {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(ptr, libc::MAP_FAILED);
    ptr.cast()
}

#[test]
fn unrecognized_faults_are_forwarded() {
    let _serial = SERIAL.lock().unwrap();

    let backend = SniffPosixBackend::new().unwrap();
    let page_size = backend.page_size();

    // Install the foreign handler first, saving whatever was there.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = foreign_handler_address();
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    let mut saved: libc::sigaction = unsafe { mem::zeroed() };
    assert_eq!(
        unsafe { libc::sigaction(libc::SIGSEGV, &action, &mut saved) },
        0
    );

    let foreign = map(page_size);
    let tracked = map(page_size);
    FOREIGN_PAGE.store(foreign as usize, Ordering::SeqCst);
    FOREIGN_SIZE.store(page_size, Ordering::SeqCst);

    let sniffer = Arc::new(MemorySniffer::new(backend).unwrap());
    sniffer.install().unwrap();
    assert_ne!(disposition(libc::SIGSEGV), foreign_handler_address());

    let handle = unsafe { sniffer.create_region(tracked, page_size).unwrap() };
    sniffer.protect(handle).unwrap();

    // A tracked page never reaches the foreign handler.
    unsafe { ptr::write_volatile(tracked, 1) };
    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), 0);
    assert_eq!(sniffer.touched_pages(handle).unwrap().len(), 1);

    // A page the foreign handler protected is forwarded to it.
    unsafe { libc::mprotect(foreign.cast(), page_size, libc::PROT_READ) };
    unsafe { ptr::write_volatile(foreign, 2) };
    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), 1);
    assert_eq!(unsafe { ptr::read_volatile(foreign) }, 2);

    let stats = sniffer.stats();
    assert_eq!(stats.faults_handled, 1);
    assert_eq!(stats.faults_foreign, 1);

    // The chain survives forwarding.
    unsafe { libc::mprotect(foreign.cast(), page_size, libc::PROT_READ) };
    unsafe { ptr::write_volatile(foreign.add(1), 3) };
    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), 2);

    sniffer.remove_region(handle).unwrap();
    sniffer.uninstall().unwrap();

    // The foreign handler is back in place.
    assert_eq!(disposition(libc::SIGSEGV), foreign_handler_address());

    unsafe {
        libc::sigaction(libc::SIGSEGV, &saved, ptr::null_mut());
        libc::munmap(foreign.cast(), page_size);
        libc::munmap(tracked.cast(), page_size);
    }
}

#[test]
fn handler_replaced_after_install_is_left_alone() {
    let _serial = SERIAL.lock().unwrap();

    let mut saved: libc::sigaction = unsafe { mem::zeroed() };
    assert_eq!(
        unsafe { libc::sigaction(libc::SIGBUS, ptr::null(), &mut saved) },
        0
    );

    let sniffer = Arc::new(MemorySniffer::new(SniffPosixBackend::new().unwrap()).unwrap());
    sniffer.install().unwrap();

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = foreign_handler_address();
    action.sa_flags = libc::SA_SIGINFO;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    assert_eq!(
        unsafe { libc::sigaction(libc::SIGBUS, &action, ptr::null_mut()) },
        0
    );

    sniffer.uninstall().unwrap();
    assert_eq!(disposition(libc::SIGBUS), foreign_handler_address());

    unsafe { libc::sigaction(libc::SIGBUS, &saved, ptr::null_mut()) };
}
