//! Bulwark: spam pressure scoring, raid detection and a durable job
//! scheduler for a Discord moderation bot.

pub mod actions;
pub mod clock;
pub mod config;
pub mod database;
pub mod discord;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod models;
pub mod pressure;
pub mod raid;
pub mod scheduler;
pub mod timeparse;
