//! GPIO buttons and rotary encoders driving a Logitech Media Server player.

pub mod buttons;
pub mod channels;
pub mod clock;
pub mod commands;
pub mod config;
pub mod control;
pub mod discovery;
pub mod encoder;
pub mod error;
pub mod gpio;
pub mod transport;
