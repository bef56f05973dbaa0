//! Boot orchestration
//!
//! Decides whether this host leases addresses itself or runs as a PXE proxy
//! next to an existing DHCP server, binds and supervises the PXE, TFTP,
//! HTTP, DHCP and DNS listeners, and arbitrates what each booting machine
//! receives from the HTTP boot service.
//!
//! ```text
//! select_mode ──► HostBootConfig ──► bind_listeners ──► Supervisor::serve
//!                                          │
//!                       /ipxe ──► boot dispatch ──► DnsRecordStore ◄── DNS
//! ```

pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod listeners;
pub mod range;
pub mod supervisor;

pub use bootstrap::{
    interface_hardware_addr, select_mode, valid_interfaces, BootstrapOptions, IpLink, LeaseNegotiator,
    LinkChange, LinkConfigurator,
};
pub use config::{AuthoritativeMode, BootMode, HostBootConfig, Ports, ProxyMode, SharedState};
pub use dispatch::{boot_dispatch, decide, CapturedResponse, Dispatch, DispatchState};
pub use error::{BoxError, Result, ServerError};
pub use http::{boot_router, router, BootContext};
pub use listeners::bind_listeners;
pub use range::{plan_range, AddressRange, RangeError};
pub use supervisor::{Service, ShutdownHandle, Supervisor};
