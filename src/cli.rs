//! OTA Upload Tool
//! Command line arguments
//!
//! `-f`, `-i`, `-p` and `-a` override the saved upload settings for this
//! run and are written back so they become the new defaults.

use clap::error::{ ContextKind, ContextValue, ErrorKind };
use clap::Parser;
use log::warn;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config_store::{ ConfigKey, DEFAULT_CONFIG_FILE };
use crate::upload_launcher::{
    default_uploader_script,
    LauncherSettings,
    DEFAULT_FLASHER,
    DEFAULT_FLASH_ADDRESS,
    DEFAULT_SCRIPT_RUNNER,
};

#[derive(Parser, Debug)]
#[command(name = "ota-upload")]
#[command(about = "Desktop front-end for wired and over-the-air firmware uploads")]
pub struct Cli {
    /// Firmware image to upload (.bin or .elf)
    #[arg(short = 'f', long = "file", allow_hyphen_values = true)]
    pub file: Option<String>,

    /// IP address of the target device
    #[arg(short = 'i', long = "ip", allow_hyphen_values = true)]
    pub ip: Option<String>,

    /// Port the target device listens on for updates
    #[arg(short = 'p', long = "port", allow_hyphen_values = true)]
    pub port: Option<String>,

    /// Password for the target device
    #[arg(short = 'a', long = "auth", allow_hyphen_values = true)]
    pub auth: Option<String>,

    /// File the upload settings are saved to
    #[arg(long, env = "OTA_CONFIG_FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Interpreter used to run the uploader script
    #[arg(long, env = "OTA_NODE", default_value = DEFAULT_SCRIPT_RUNNER)]
    pub node: String,

    /// Network uploader script (default: next to this executable)
    #[arg(long, env = "OTA_UPLOADER_SCRIPT")]
    pub uploader_script: Option<PathBuf>,

    /// Flashing utility used for USB uploads
    #[arg(long, env = "OTA_FLASHER", default_value = DEFAULT_FLASHER)]
    pub flasher: String,

    /// Flash base address for USB uploads
    #[arg(long, default_value = DEFAULT_FLASH_ADDRESS)]
    pub flash_address: String,
}

impl Cli {
    /// Parse the command line, skipping arguments that are not understood.
    ///
    /// Each unknown or stray token is dropped and parsing is retried, so the
    /// recognised flags still apply. `--help` still prints and exits.
    pub fn parse_lenient<I, T>(args: I) -> Self
        where I: IntoIterator<Item = T>, T: Into<OsString>
    {
        let mut args: Vec<OsString> = args.into_iter().map(Into::into).collect();

        loop {
            let err = match Cli::try_parse_from(&args) {
                Ok(cli) => return cli,
                Err(err) => err,
            };

            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                err.exit();
            }

            let offending = match err.get(ContextKind::InvalidArg) {
                Some(ContextValue::String(arg)) => Some(arg.clone()),
                _ => None,
            };
            let position = offending
                .as_deref()
                .and_then(|arg| args.iter().skip(1).position(|a| a.to_string_lossy() == arg))
                .map(|index| index + 1);

            match position {
                Some(index) => {
                    warn!("Ignoring command line argument {:?}: {}", args[index], err.kind());
                    args.remove(index);
                }
                None => {
                    warn!("Ignoring command line arguments: {}", err);
                    args.truncate(1);
                }
            }
        }
    }

    /// Settings given on the command line, in store order
    pub fn overrides(&self) -> Vec<(ConfigKey, String)> {
        [
            (ConfigKey::File, &self.file),
            (ConfigKey::Ip, &self.ip),
            (ConfigKey::Port, &self.port),
            (ConfigKey::Auth, &self.auth),
        ]
            .into_iter()
            .filter_map(|(key, value)| value.clone().map(|v| (key, v)))
            .collect()
    }

    pub fn launcher_settings(&self) -> LauncherSettings {
        LauncherSettings {
            script_runner: self.node.clone(),
            uploader_script: self.uploader_script.clone().unwrap_or_else(default_uploader_script),
            flasher: self.flasher.clone(),
            flash_address: self.flash_address.clone(),
        }
    }
}
