//! Hearth core: home records, owner identity, and host-facing seams.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{ParseOwnerIdError, ValidationError};
pub use traits::{
    AnyWorld, HomeOwner, KnownWorlds, NameResolver, NoNameResolver, OfflineNameResolver,
    WorldResolver,
};
pub use types::{Home, Location, OwnerId};
