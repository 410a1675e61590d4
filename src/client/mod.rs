//! Model of the page's interaction layer
//!
//! `assets/gui.js` drives the real page. This module holds the same rules over plain data so
//! they can be exercised without a browser: a snapshot of which containers are visible and
//! what the inputs hold, and the Execute cycle the page goes through.

pub mod session;
pub mod snapshot;
