#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    feature = "esp32c3",
    feature(impl_trait_in_assoc_type, type_alias_impl_trait)
)]

#[macro_use]
mod logging;

pub mod clock;
pub mod config;
pub mod crc;
pub mod interrupts;
pub mod network;
pub mod rpc;
pub mod scheduler;
pub mod sensors;
pub mod settings;
pub mod station;
pub mod status;
pub mod store;
pub mod tasks;

#[cfg(feature = "esp32c3")]
pub mod esp;
