//! Bootable-image provisioning for headless network-appliance boards.
//!
//! A board's per-device configuration ("boot params") is embedded directly
//! into its disk image at a fixed byte offset, so the provisioned OS can
//! read it back without mounting anything. This crate covers the two halves
//! of that scheme:
//!
//! - **`bootparams`** - the binary codec: pack/unpack a structured
//!   configuration record into the fixed-size region of a disk image.
//! - **`imager`** - the construction pipeline: download a compressed base
//!   image archive, extract and digest-verify the disk image(s) inside it,
//!   and fan one verified base image out into N final images, each patched
//!   with its own boot-param record.
//!
//! The GUI/HTTP front-ends that collect boot parameters, and the OS-side
//! tooling that consumes them at boot, live elsewhere; they talk to this
//! crate through [`BootParams`](bootparams::BootParams) records, the
//! builder's progress counters, and the returned output paths.

pub mod bootparams;
pub mod imager;
