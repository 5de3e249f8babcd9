#![forbid(unsafe_code)]

//! Core of the UniDown downloader.
//!
//! Pasted text is normalized into a URL, resolved into a format shortlist and
//! downloaded item by item through yt-dlp. The `unidown` binary is a thin
//! front-end over [`controller::Controller`].

pub mod bilibili;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod extract;
pub mod formats;
pub mod normalize;
pub mod resolver;
pub mod text;
pub mod yt_dlp;

#[cfg(test)]
mod testing;
