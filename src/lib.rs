//! OTA Upload Tool
//!
//! Desktop front-end for flashing firmware over a wired programmer or
//! uploading it over the network. Upload settings are kept in a small
//! `key = value` file and the external tools' output is streamed live.

pub mod cli;
pub mod config_store;
pub mod console;
pub mod process_runner;
pub mod upload_launcher;
