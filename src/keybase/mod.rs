//! Keybase challenge-response login and device association.

pub mod association;
pub mod challenge;
pub mod client;
pub mod notify;

pub use association::{Association, get_association, new_association};
pub use challenge::{Challenge, get_challenge, new_challenge};
pub use client::{Info, KeybaseClient};
pub use notify::Notifier;
