//! Home cache service.
//!
//! [`HomeService`] owns the in-memory mapping and drives persistence:
//!
//! 1. **Load** (`HomeService::load`): background bulk read from the backend
//! 2. **Mutations** (`set_home`, `delete_home`): immediate, then debounced
//! 3. **Flush** (`HomeService::flush`, `HomeService::shutdown`): full snapshot
//!    written before returning

pub mod config;
mod home;

pub use config::{FlushStrategy, HomeServiceConfig};
pub use home::HomeService;
