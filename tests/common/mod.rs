#![allow(dead_code)]

use std::{
    alloc::{self, Layout},
    ptr,
    sync::{Arc, Mutex, MutexGuard},
};

use memsniff::{Address, DefaultBackend, MemorySniffer};

/// The fault hook is process-wide.
static SERIAL: Mutex<()> = Mutex::new(());

/// Page-aligned, zeroed memory made of whole pages.
pub struct Pages {
    ptr: *mut u8,
    layout: Layout,
    page_size: usize,
}

// SAFETY: Plain heap memory owned by this value.
unsafe impl Send for Pages {}
unsafe impl Sync for Pages {}

impl Pages {
    pub fn new(count: usize, page_size: usize) -> Self {
        let layout = Layout::from_size_align(count * page_size, page_size).unwrap();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());

        Self {
            ptr,
            layout,
            page_size,
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn page(&self, index: usize) -> Address {
        Address::from_ptr(self.ptr) + index * self.page_size
    }

    pub fn write(&self, offset: usize, value: u8) {
        assert!(offset < self.len());
        unsafe { ptr::write_volatile(self.ptr.add(offset), value) };
    }

    pub fn read(&self, offset: usize) -> u8 {
        assert!(offset < self.len());
        unsafe { ptr::read_volatile(self.ptr.add(offset)) }
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

/// An installed sniffer, uninstalled on drop.
pub struct Session {
    pub sniffer: Arc<MemorySniffer<DefaultBackend>>,
    _serial: MutexGuard<'static, ()>,
}

impl Session {
    pub fn new() -> Self {
        let serial = SERIAL.lock().unwrap_or_else(|err| err.into_inner());

        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .with_test_writer()
            .try_init();

        let sniffer = memsniff::install_default().unwrap();

        Self {
            sniffer,
            _serial: serial,
        }
    }

    pub fn page_size(&self) -> usize {
        self.sniffer.page_size()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.sniffer.uninstall();
    }
}
