//! Core record types for PeerFeed

mod post;
mod profile;

pub use post::Post;
pub use profile::Profile;
