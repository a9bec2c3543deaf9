#![no_std]

cfg_if::cfg_if! {
    if #[cfg(feature = "virt")] {
        mod virt;
        pub use virt::*;
    }
}
