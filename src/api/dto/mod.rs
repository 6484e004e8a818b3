//! Data Transfer Objects for REST request/response serialization.
//!
//! Identifiers are serialized as UUID strings and enums as their
//! upper-case wire names.

pub mod chat_dto;
pub mod common_dto;
pub mod invitation_dto;
pub mod member_dto;

pub use chat_dto::*;
pub use common_dto::*;
pub use invitation_dto::*;
pub use member_dto::*;
