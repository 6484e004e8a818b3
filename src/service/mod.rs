//! Service layer: membership orchestration.
//!
//! [`MembershipService`] applies role changes, removals and trip status
//! transitions, and propagates them to live sessions through the
//! [`crate::session::SessionRegistry`] and the [`crate::bus::EventBus`].

pub mod membership_service;

pub use membership_service::MembershipService;
