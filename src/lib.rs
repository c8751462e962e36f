pub mod client;
pub mod config;
pub mod game;
pub mod mc;
pub mod model;
pub mod nbt;
pub mod record;
pub mod server;
pub mod world;
