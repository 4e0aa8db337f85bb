//! fadelock - idle monitor and screen locker for X11 sessions.
//!
//! Watches the server's idle counter, fades the display out once the user has
//! been inactive long enough, then locks input behind the user's password.

pub mod action;
pub mod alarm;
pub mod auth;
pub mod backend;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod event_loop;
pub mod fade;
pub mod keysym;
pub mod lock;
pub mod privilege;
