//! Spicy: one place to reach SPICE consoles, RDP desktops and SSH shells,
//! with Proxmox VE clusters as the source of VMs, status and power control.

pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod logging;
pub mod proxmox;
pub mod spice;
pub mod ssh;
pub mod state;

pub use error::{AppError, AppResult};
pub use state::AppState;
