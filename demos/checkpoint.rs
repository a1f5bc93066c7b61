//! Periodically reports which pages of a buffer a worker thread wrote.
//!
//! Runs until interrupted (or for 20 checkpoints).

use std::{
    alloc::{self, Layout},
    ptr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use memsniff::Address;

const PAGES: usize = 64;
const CHECKPOINTS: usize = 20;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let terminate_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate_flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate_flag.clone())?;

    let sniffer = memsniff::install_default()?;
    let page_size = sniffer.page_size();

    // Whole pages, so that nothing else shares them.
    let layout = Layout::from_size_align(PAGES * page_size, page_size)?;
    let buffer = unsafe { alloc::alloc_zeroed(layout) };
    if buffer.is_null() {
        alloc::handle_alloc_error(layout);
    }

    let base = Address::from_ptr(buffer);
    let handle = unsafe { sniffer.create_region(base, layout.size())? };

    let worker = std::thread::spawn({
        let terminate_flag = terminate_flag.clone();
        let buffer = base;

        move || {
            let mut state = 0x2545_f491_4f6c_dd1d_u64;

            while !terminate_flag.load(Ordering::Relaxed) {
                // xorshift
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;

                let offset = (state as usize) % (PAGES * page_size);
                unsafe { ptr::write_volatile((buffer + offset).as_mut_ptr::<u8>(), state as u8) };

                std::thread::sleep(Duration::from_millis(5));
            }
        }
    });

    for checkpoint in 0..CHECKPOINTS {
        if terminate_flag.load(Ordering::Relaxed) {
            break;
        }

        sniffer.protect(handle)?;
        std::thread::sleep(Duration::from_millis(250));

        let touched = sniffer.touched_pages_and_reset(handle)?;
        let indices = touched
            .iter()
            .map(|&page| (page - base) / page_size)
            .collect::<Vec<_>>();

        println!(
            "checkpoint {checkpoint}: {} of {PAGES} pages written {indices:?}",
            touched.len()
        );
    }

    terminate_flag.store(true, Ordering::Relaxed);
    let _ = worker.join();

    println!("{:#?}", sniffer.stats());

    sniffer.remove_region(handle)?;
    sniffer.uninstall()?;

    unsafe { alloc::dealloc(buffer, layout) };
    Ok(())
}
