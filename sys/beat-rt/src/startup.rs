// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Getting from reset to the application.
//!
//! Out of reset, RAM holds garbage. Before any Rust code that touches a
//! static can run, `.bss` has to be zeroed and `.data` copied in from its
//! load image in flash; after that, the functions registered in
//! `.init_array` run in link order, the application runs, and should it ever
//! return, the `.fini_array` functions run in reverse order.
//!
//! The region bounds come from the linker script (`link.x`), which also
//! checks their alignment and that they don't overlap. Nothing here checks
//! them again.

/// Function registered with [`init_callback!`] or [`fini_callback!`].
pub type Callback = unsafe extern "C" fn();

/// Where the initialized and zero-initialized data live.
#[derive(Copy, Clone, Debug)]
pub struct MemoryImage {
    /// Load image of `.data`, in flash.
    pub data_load: *const u8,
    pub data_start: *mut u8,
    pub data_end: *mut u8,
    pub bss_start: *mut u8,
    pub bss_end: *mut u8,
}

impl MemoryImage {
    pub fn data_len(&self) -> usize {
        self.data_end as usize - self.data_start as usize
    }

    pub fn bss_len(&self) -> usize {
        self.bss_end as usize - self.bss_start as usize
    }
}

/// Prepares RAM, then runs `init` in order, `entry`, and `fini` in reverse
/// order.
///
/// # Safety
///
/// This is the reset sequence. `image` must describe real, writable,
/// non-overlapping regions (with `data_len()` readable bytes at
/// `data_load`), nothing may be relying on the current contents of those
/// regions, and it must only run once.
pub unsafe fn run(
    image: &MemoryImage,
    init: &[Callback],
    fini: &[Callback],
    entry: impl FnOnce(),
) {
    unsafe {
        core::ptr::write_bytes(image.bss_start, 0, image.bss_len());
        core::ptr::copy_nonoverlapping(
            image.data_load,
            image.data_start,
            image.data_len(),
        );
    }

    for callback in init {
        unsafe { callback() };
    }

    entry();

    for callback in fini.iter().rev() {
        unsafe { callback() };
    }
}

/// Registers a function to run after RAM is initialized and before the
/// application starts. Functions run in link order.
///
/// ```ignore
/// unsafe extern "C" fn enable_gpio_clocks() { /* ... */ }
/// beat_rt::init_callback!(enable_gpio_clocks);
/// ```
#[macro_export]
macro_rules! init_callback {
    ($f:path) => {
        const _: () = {
            #[cfg(target_os = "none")]
            #[link_section = ".init_array"]
            #[used]
            static CALLBACK: $crate::startup::Callback = $f;
        };
    };
}

/// Registers a function to run if the application returns. Functions run in
/// reverse link order.
#[macro_export]
macro_rules! fini_callback {
    ($f:path) => {
        const _: () = {
            #[cfg(target_os = "none")]
            #[link_section = ".fini_array"]
            #[used]
            static CALLBACK: $crate::startup::Callback = $f;
        };
    };
}

#[cfg(target_os = "none")]
mod target {
    use super::{Callback, MemoryImage};
    use core::ptr::{addr_of, addr_of_mut};

    extern "C" {
        static __data_load: u8;
        static mut __data_start: u8;
        static mut __data_end: u8;
        static mut __bss_start: u8;
        static mut __bss_end: u8;
        static __init_array_start: Callback;
        static __init_array_end: Callback;
        static __fini_array_start: Callback;
        static __fini_array_end: Callback;
    }

    extern "Rust" {
        fn __beat_rt_main();
    }

    /// Safety: `start..end` must be a linker-provided array of callbacks.
    unsafe fn callbacks(
        start: *const Callback,
        end: *const Callback,
    ) -> &'static [Callback] {
        let len = (end as usize - start as usize)
            / core::mem::size_of::<Callback>();
        unsafe { core::slice::from_raw_parts(start, len) }
    }

    /// Reset handler.
    #[allow(non_snake_case)]
    #[no_mangle]
    pub unsafe extern "C" fn Reset() -> ! {
        crate::arch::system_init();

        unsafe {
            let image = MemoryImage {
                data_load: addr_of!(__data_load),
                data_start: addr_of_mut!(__data_start),
                data_end: addr_of_mut!(__data_end),
                bss_start: addr_of_mut!(__bss_start),
                bss_end: addr_of_mut!(__bss_end),
            };
            let init = callbacks(
                addr_of!(__init_array_start),
                addr_of!(__init_array_end),
            );
            let fini = callbacks(
                addr_of!(__fini_array_start),
                addr_of!(__fini_array_end),
            );

            super::run(&image, init, fini, || __beat_rt_main());
        }

        crate::arch::reset()
    }
}

#[cfg(target_os = "none")]
pub use target::Reset;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    thread_local! {
        static EVENTS: RefCell<Vec<&'static str>> =
            const { RefCell::new(Vec::new()) };
        static BSS: Cell<(*const u8, usize)> =
            const { Cell::new((core::ptr::null(), 0)) };
        static BSS_WAS_ZERO: Cell<Option<bool>> = const { Cell::new(None) };
    }

    fn log(event: &'static str) {
        EVENTS.with(|e| e.borrow_mut().push(event));
    }

    unsafe extern "C" fn init_a() {
        log("init a");
    }
    unsafe extern "C" fn init_b() {
        log("init b");
    }
    unsafe extern "C" fn fini_a() {
        log("fini a");
    }
    unsafe extern "C" fn fini_b() {
        log("fini b");
    }

    unsafe extern "C" fn check_bss() {
        let (ptr, len) = BSS.with(Cell::get);
        let bss = unsafe { core::slice::from_raw_parts(ptr, len) };
        BSS_WAS_ZERO.with(|z| z.set(Some(bss.iter().all(|&b| b == 0))));
    }

    struct Ram {
        load: Vec<u8>,
        data: Vec<u8>,
        bss: Vec<u8>,
    }

    impl Ram {
        fn new(data: &[u8], bss_len: usize) -> Self {
            Self {
                load: data.to_vec(),
                data: vec![0xA5; data.len()],
                bss: vec![0xFF; bss_len],
            }
        }

        fn image(&mut self) -> MemoryImage {
            let data = self.data.as_mut_ptr_range();
            let bss = self.bss.as_mut_ptr_range();
            MemoryImage {
                data_load: self.load.as_ptr(),
                data_start: data.start,
                data_end: data.end,
                bss_start: bss.start,
                bss_end: bss.end,
            }
        }
    }

    #[test]
    fn bss_is_zero_before_first_init_callback() {
        let mut ram = Ram::new(&[1, 2, 3, 4], 256);
        let image = ram.image();
        BSS.with(|b| b.set((image.bss_start.cast_const(), image.bss_len())));

        unsafe { run(&image, &[check_bss as Callback], &[], || ()) };

        assert_eq!(BSS_WAS_ZERO.with(Cell::get), Some(true));
        assert!(ram.bss.iter().all(|&b| b == 0));
    }

    #[test]
    fn data_matches_load_image() {
        let load: Vec<u8> = (0..=255).collect();
        let mut ram = Ram::new(&load, 16);
        let image = ram.image();

        unsafe { run(&image, &[], &[], || ()) };

        assert_eq!(ram.data, load);
    }

    #[test]
    fn callbacks_run_in_order_around_entry() {
        let mut ram = Ram::new(&[], 0);
        let image = ram.image();

        unsafe {
            run(
                &image,
                &[init_a as Callback, init_b],
                &[fini_a as Callback, fini_b],
                || log("entry"),
            )
        };

        let events = EVENTS.with(|e| e.borrow().clone());
        assert_eq!(events, ["init a", "init b", "entry", "fini b", "fini a"]);
    }

    #[test]
    fn entry_sees_initialized_ram() {
        let mut ram = Ram::new(&[9, 8, 7], 32);
        let image = ram.image();
        let (data, bss) = (image.data_start, image.bss_start);

        let mut seen = None;
        unsafe {
            run(&image, &[], &[], || {
                seen = Some((
                    core::slice::from_raw_parts(data, 3).to_vec(),
                    core::slice::from_raw_parts(bss, 32).to_vec(),
                ));
            })
        };

        let (d, b) = seen.unwrap();
        assert_eq!(d, [9, 8, 7]);
        assert_eq!(b, [0; 32]);
    }
}
