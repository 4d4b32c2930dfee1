pub mod broadcast;
pub mod rest;
pub mod ws;

pub use broadcast::{Broadcaster, Subscription};
