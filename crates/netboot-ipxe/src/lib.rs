//! Netboot iPXE support
//!
//! Everything the HTTP boot service hands to iPXE:
//!
//! - [`chain_script`]: the first script, which chains to the profile lookup
//! - [`FileProfileStore`]: matches a [`BootSelection`] against machine groups
//! - [`profile_script`]: kernel/initrd script for a matched profile
//! - [`BootMenu`]: the role menu for machines without a profile

pub mod error;
pub mod menu;
pub mod profile;
pub mod script;
pub mod selection;

pub use error::{IpxeError, Result};
pub use menu::BootMenu;
pub use profile::{BootSpec, FileProfileStore, Group, Profile};
pub use script::{chain_script, profile_script};
pub use selection::{normalize_mac, BootSelection, BootType};
